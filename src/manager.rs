//! Session registry and factory
//!
//! `SessionManager` creates session rows, starts a supervisor per launched
//! session, and exposes the session-level operations of the daemon. It owns
//! supervisors through `SupervisorHandle`s keyed by session id; supervisors
//! hold only the store and the bus.

use crate::agent::{AgentLauncher, LaunchSpec};
use crate::approval::ApprovalManager;
use crate::bus::{BusEvent, EventBus, Subscription, SubscriptionFilter};
use crate::config::DaemonConfig;
use crate::error::{Result, SessionError};
use crate::store::{SessionChange, SqliteStore};
use crate::supervisor::{Supervisor, SupervisorHandle};
use crate::types::{
    now, summarize, ConversationEvent, FileSnapshot, McpServer, ProxyConfig, RecentPath,
    Session, SessionFilter, SessionStatus, SessionUpdate, UserSettings,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Error recorded on sessions found active when the daemon starts
pub const RECOVERY_MESSAGE: &str = "daemon restarted while session was active";

/// Parameters for a new session or draft
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LaunchRequest {
    pub query: String,
    pub working_dir: String,
    pub title: Option<String>,
    pub model: Option<String>,
    pub max_turns: Option<i64>,
    pub system_prompt: Option<String>,
    pub append_system_prompt: Option<String>,
    pub custom_instructions: Option<String>,
    pub permission_prompt_tool: Option<String>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub additional_directories: Vec<String>,
    pub mcp_servers: Vec<McpServer>,
    pub auto_accept_edits: bool,
    pub dangerously_skip_permissions: bool,
    pub dangerously_skip_permissions_timeout_ms: Option<i64>,
    pub proxy: ProxyConfig,
}

impl LaunchRequest {
    pub fn new(query: impl Into<String>, working_dir: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            working_dir: working_dir.into(),
            ..Default::default()
        }
    }

    fn into_session(self, status: SessionStatus) -> (Session, Vec<McpServer>) {
        let mut session = Session::new(self.query, self.working_dir).with_status(status);
        session.title = self.title;
        session.model = self.model;
        session.max_turns = self.max_turns;
        session.system_prompt = self.system_prompt;
        session.append_system_prompt = self.append_system_prompt;
        session.custom_instructions = self.custom_instructions;
        session.permission_prompt_tool = self.permission_prompt_tool;
        session.allowed_tools = self.allowed_tools;
        session.disallowed_tools = self.disallowed_tools;
        session.additional_directories = self.additional_directories;
        session.auto_accept_edits = self.auto_accept_edits;
        session.dangerously_skip_permissions = self.dangerously_skip_permissions;
        session.dangerously_skip_permissions_timeout_ms = self
            .dangerously_skip_permissions_timeout_ms
            .filter(|ms| *ms > 0);
        // Drafts start their bypass timer at launch
        if status != SessionStatus::Draft && session.dangerously_skip_permissions {
            session.dangerously_skip_permissions_expires_at = session
                .dangerously_skip_permissions_timeout_ms
                .map(|ms| session.created_at + chrono::Duration::milliseconds(ms));
        }
        session.proxy = self.proxy;
        (session, self.mcp_servers)
    }
}

/// Continuation of an existing session; unset fields inherit from the parent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContinueRequest {
    pub query: String,
    pub title: Option<String>,
    pub model: Option<String>,
    pub max_turns: Option<i64>,
    pub system_prompt: Option<String>,
    pub append_system_prompt: Option<String>,
    pub custom_instructions: Option<String>,
    pub permission_prompt_tool: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    pub disallowed_tools: Option<Vec<String>>,
    pub additional_directories: Option<Vec<String>>,
    pub mcp_servers: Option<Vec<McpServer>>,
}

impl ContinueRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }
}

/// Partial settings patch; unset fields are left alone
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsPatch {
    pub title: Option<String>,
    pub model: Option<String>,
    pub model_id: Option<String>,
    pub archived: Option<bool>,
    pub auto_accept_edits: Option<bool>,
    pub dangerously_skip_permissions: Option<bool>,
    /// Bypass duration from now; zero removes the time limit
    pub dangerously_skip_permissions_timeout_ms: Option<i64>,
    pub proxy: Option<ProxyConfig>,
}

/// Registry entry reported by `SessionManager::list`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSession {
    pub session_id: String,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished: bool,
}

/// Process-wide registry of supervised sessions
pub struct SessionManager {
    store: Arc<SqliteStore>,
    bus: EventBus,
    config: Arc<DaemonConfig>,
    approvals: Arc<ApprovalManager>,
    launcher: Arc<dyn AgentLauncher>,
    supervisors: Arc<DashMap<String, SupervisorHandle>>,
    shutdown: CancellationToken,
}

impl SessionManager {
    pub fn new(
        store: Arc<SqliteStore>,
        bus: EventBus,
        config: Arc<DaemonConfig>,
        launcher: Arc<dyn AgentLauncher>,
    ) -> Self {
        let approvals = Arc::new(ApprovalManager::new(
            store.clone(),
            bus.clone(),
            config.clone(),
        ));
        Self {
            store,
            bus,
            config,
            approvals,
            launcher,
            supervisors: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn approvals(&self) -> &Arc<ApprovalManager> {
        &self.approvals
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Subscribe to bus events; the subscription ends with `cancel`
    pub fn subscribe(&self, filter: SubscriptionFilter, cancel: CancellationToken) -> Subscription {
        self.bus.subscribe(filter, cancel)
    }

    // ─── Launch ──────────────────────────────────────────────────

    /// Create a session in `starting` and start its agent
    pub fn launch(&self, request: LaunchRequest) -> Result<Session> {
        if request.query.trim().is_empty() {
            return Err(SessionError::Validation("query is required".into()));
        }
        validate_working_dir(&request.working_dir)?;

        let (session, mcp_servers) = request.into_session(SessionStatus::Starting);
        self.store.create_session(&session)?;
        if !mcp_servers.is_empty() {
            self.store.store_mcp_servers(&session.id, &mcp_servers)?;
        }

        tracing::info!(
            session_id = %session.id,
            run_id = %session.run_id,
            working_dir = %session.working_dir,
            "Session launched"
        );
        self.start(&session, None, mcp_servers);
        Ok(session)
    }

    /// Create a `draft` session without starting an agent
    pub fn create_draft(&self, request: LaunchRequest) -> Result<Session> {
        validate_working_dir(&request.working_dir)?;

        let (session, mcp_servers) = request.into_session(SessionStatus::Draft);
        self.store.create_session(&session)?;
        if !mcp_servers.is_empty() {
            self.store.store_mcp_servers(&session.id, &mcp_servers)?;
        }
        tracing::info!(session_id = %session.id, "Draft created");
        Ok(session)
    }

    /// Launch a draft, optionally replacing its query
    ///
    /// A time-limited bypass starts counting at launch.
    pub fn launch_draft(&self, session_id: &str, prompt: Option<&str>) -> Result<Session> {
        let draft = self.store.get_session(session_id)?;
        if draft.status != SessionStatus::Draft {
            return Err(SessionError::invalid_transition(
                draft.status,
                SessionStatus::Starting,
            ));
        }

        let query = prompt
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string);
        let effective = query.as_deref().unwrap_or(&draft.query);
        if effective.trim().is_empty() {
            return Err(SessionError::Validation("query is required".into()));
        }
        validate_working_dir(&draft.working_dir)?;

        let mut update = SessionUpdate::status(SessionStatus::Starting);
        if let Some(query) = query {
            update.summary = Some(summarize(&query));
            update.query = Some(query);
        }
        if draft.dangerously_skip_permissions {
            if let Some(ms) = draft.dangerously_skip_permissions_timeout_ms {
                update.dangerously_skip_permissions_expires_at =
                    Some(Some(now() + chrono::Duration::milliseconds(ms)));
            }
        }

        let change = self
            .store
            .update_session_if(session_id, &[SessionStatus::Draft], &update)?
            .ok_or_else(|| SessionError::invalid_transition("draft", SessionStatus::Starting))?;
        self.bus.publish_change(&change);

        let mcp_servers = self.store.get_mcp_servers(session_id)?;
        tracing::info!(session_id = %session_id, "Draft launched");
        self.start(&change.session, None, mcp_servers);
        Ok(change.session)
    }

    /// Move a draft to `discarded`
    pub fn discard_draft(&self, session_id: &str) -> Result<Session> {
        let change = self.transition(
            session_id,
            &[SessionStatus::Draft],
            SessionUpdate::status(SessionStatus::Discarded),
        )?;
        tracing::info!(session_id = %session_id, "Draft discarded");
        Ok(change.session)
    }

    /// Fork a new session that resumes the parent's agent conversation
    ///
    /// A running parent is interrupted and awaited first.
    pub async fn continue_session(
        &self,
        parent_id: &str,
        request: ContinueRequest,
    ) -> Result<Session> {
        if request.query.trim().is_empty() {
            return Err(SessionError::Validation("query is required".into()));
        }

        let mut parent = self.load(parent_id).await?;
        if matches!(
            parent.status,
            SessionStatus::Running | SessionStatus::WaitingInput
        ) {
            tracing::info!(session_id = %parent_id, "Interrupting parent before continuation");
            self.interrupt(parent_id)?;
            self.wait(parent_id).await;
            parent = self.load(parent_id).await?;
        }

        if !matches!(
            parent.status,
            SessionStatus::Completed | SessionStatus::Interrupted
        ) {
            return Err(SessionError::Validation(format!(
                "cannot continue session with status '{}'",
                parent.status
            )));
        }
        let resume = parent
            .claude_session_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                SessionError::Validation("parent session has no agent session id".into())
            })?;
        if parent.working_dir.is_empty() {
            return Err(SessionError::Validation(
                "parent session has no working directory".into(),
            ));
        }

        let requested = request.mcp_servers.clone();
        let child = inherit(&parent, request);
        let source = parent_id.to_string();
        let (child, mcp_servers) = self
            .store
            .run_blocking(move |store| {
                let mcp_servers = match requested {
                    Some(servers) => servers,
                    None => store.get_mcp_servers(&source)?,
                };
                store.create_session(&child)?;
                if !mcp_servers.is_empty() {
                    store.store_mcp_servers(&child.id, &mcp_servers)?;
                }
                Ok((child, mcp_servers))
            })
            .await?;

        tracing::info!(
            session_id = %child.id,
            parent_session_id = %parent_id,
            resume = %resume,
            "Session continued"
        );
        self.start(&child, Some(resume), mcp_servers);
        Ok(child)
    }

    fn start(&self, session: &Session, resume: Option<String>, mcp_servers: Vec<McpServer>) {
        let env = self.config.agent_env(std::env::vars_os());
        let mut spec = LaunchSpec::for_session(session, resume, mcp_servers, env);
        let socket = self
            .config
            .daemon_socket
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());
        spec.inject_mcp_env(socket.as_deref());

        let supervisor = Supervisor::new(
            &spec,
            self.store.clone(),
            self.bus.clone(),
            self.config.clone(),
            self.shutdown.child_token(),
        );
        // Registered before the task starts so an interrupt always finds it
        let handle = supervisor.handle();
        self.supervisors
            .insert(session.id.clone(), handle.clone());
        supervisor.spawn(self.launcher.clone(), spec);

        let supervisors = self.supervisors.clone();
        tokio::spawn(async move {
            let status = handle.wait().await;
            supervisors.remove_if(&handle.session_id, |_, h| h.run_id == handle.run_id);
            tracing::debug!(session_id = %handle.session_id, status = ?status, "Supervisor exited");
        });
    }

    // ─── Control ─────────────────────────────────────────────────

    /// Interrupt a `running` or `waiting_input` session
    ///
    /// Pending approvals are left as they are.
    pub fn interrupt(&self, session_id: &str) -> Result<Session> {
        let change = self.transition(
            session_id,
            &[SessionStatus::Running, SessionStatus::WaitingInput],
            SessionUpdate::status(SessionStatus::Interrupting),
        )?;

        match self.supervisors.get(session_id) {
            Some(handle) => handle.interrupt(),
            None => {
                // Nothing left to signal
                tracing::warn!(session_id = %session_id, "No supervisor for interrupted session");
                if let Some(change) = self.store.update_session_if(
                    session_id,
                    &[SessionStatus::Interrupting],
                    &SessionUpdate::status(SessionStatus::Interrupted),
                )? {
                    self.bus.publish_change(&change);
                    return Ok(change.session);
                }
            }
        }
        tracing::info!(session_id = %session_id, "Session interrupt requested");
        Ok(change.session)
    }

    /// Apply a settings patch
    ///
    /// Switching bypass permissions on approves the session's pending
    /// approvals; failures there are logged and not returned.
    pub fn update_settings(&self, session_id: &str, patch: SettingsPatch) -> Result<Session> {
        let current = self.store.get_session(session_id)?;
        let at = now();

        let mut update = SessionUpdate {
            title: patch.title,
            model: patch.model,
            model_id: patch.model_id,
            archived: patch.archived,
            auto_accept_edits: patch.auto_accept_edits,
            ..Default::default()
        };

        let timeout = patch.dangerously_skip_permissions_timeout_ms;
        match patch.dangerously_skip_permissions {
            Some(true) => {
                update.dangerously_skip_permissions = Some(true);
                let (expires, timeout) = bypass_window(at, timeout);
                update.dangerously_skip_permissions_expires_at = Some(expires);
                update.dangerously_skip_permissions_timeout_ms = Some(timeout);
            }
            Some(false) => {
                update.dangerously_skip_permissions = Some(false);
                update.dangerously_skip_permissions_expires_at = Some(None);
                update.dangerously_skip_permissions_timeout_ms = Some(None);
            }
            None if timeout.is_some() && current.dangerously_skip_permissions => {
                let (expires, timeout) = bypass_window(at, timeout);
                update.dangerously_skip_permissions_expires_at = Some(expires);
                update.dangerously_skip_permissions_timeout_ms = Some(timeout);
            }
            None => {}
        }

        if let Some(proxy) = patch.proxy {
            update.proxy_enabled = Some(proxy.enabled);
            update.proxy_base_url = Some(proxy.base_url);
            update.proxy_api_key = Some(proxy.api_key);
            update.proxy_model_override = Some(proxy.model_override);
        }

        if update.is_empty() {
            return Ok(current);
        }

        let change = self.store.update_session(session_id, &update)?;
        let session = change.session;

        let mut changes = Map::new();
        if session.auto_accept_edits != current.auto_accept_edits {
            changes.insert("auto_accept_edits".into(), json!(session.auto_accept_edits));
        }
        if session.dangerously_skip_permissions != current.dangerously_skip_permissions
            || session.dangerously_skip_permissions_expires_at
                != current.dangerously_skip_permissions_expires_at
        {
            changes.insert(
                "dangerously_skip_permissions".into(),
                json!(session.dangerously_skip_permissions),
            );
            changes.insert(
                "dangerously_skip_permissions_expires_at".into(),
                session
                    .dangerously_skip_permissions_expires_at
                    .map_or(Value::Null, |t| json!(t.to_rfc3339())),
            );
        }
        if !changes.is_empty() {
            self.bus.publish(BusEvent::settings_changed(
                &session.id,
                &session.run_id,
                changes,
            ));
        }

        if session.bypass_active(at) && !current.bypass_active(at) {
            if let Err(e) = self.approvals.approve_pending(session_id) {
                tracing::warn!(
                    session_id = %session_id,
                    error = %e,
                    "Failed to auto-approve pending approvals"
                );
            }
        }

        tracing::info!(session_id = %session_id, "Session settings updated");
        Ok(session)
    }

    /// Status transition guarded by the expected current statuses
    fn transition(
        &self,
        session_id: &str,
        expected: &[SessionStatus],
        update: SessionUpdate,
    ) -> Result<SessionChange> {
        let target = update.status.unwrap_or(SessionStatus::Failed);
        match self.store.update_session_if(session_id, expected, &update)? {
            Some(change) => {
                self.bus.publish_change(&change);
                Ok(change)
            }
            None => {
                let current = self.store.get_session(session_id)?;
                Err(SessionError::invalid_transition(current.status, target))
            }
        }
    }

    // ─── Queries ─────────────────────────────────────────────────

    pub fn get_session(&self, session_id: &str) -> Result<Session> {
        self.store.get_session(session_id)
    }

    /// Snapshot of supervised sessions
    pub fn list(&self) -> Vec<ActiveSession> {
        let mut active: Vec<ActiveSession> = self
            .supervisors
            .iter()
            .map(|entry| {
                let handle = entry.value();
                ActiveSession {
                    session_id: handle.session_id.clone(),
                    run_id: handle.run_id.clone(),
                    started_at: handle.started_at,
                    finished: handle.is_finished(),
                }
            })
            .collect();
        active.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        active
    }

    pub fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<Session>> {
        self.store.list_sessions(filter)
    }

    /// Conversation log in sequence order
    pub fn get_messages(&self, session_id: &str) -> Result<Vec<ConversationEvent>> {
        self.store.get_session(session_id)?;
        self.store.get_conversation(session_id)
    }

    pub fn get_snapshots(&self, session_id: &str) -> Result<Vec<FileSnapshot>> {
        self.store.get_session(session_id)?;
        self.store.get_file_snapshots(session_id)
    }

    /// Set `archived` on every session; returns the ids that failed
    pub fn bulk_archive(&self, session_ids: &[String], archived: bool) -> Vec<String> {
        let update = SessionUpdate {
            archived: Some(archived),
            ..Default::default()
        };
        session_ids
            .iter()
            .filter(|id| match self.store.update_session(id, &update) {
                Ok(_) => false,
                Err(e) => {
                    tracing::warn!(session_id = %id, error = %e, "Failed to update archive flag");
                    true
                }
            })
            .cloned()
            .collect()
    }

    /// Un-archive archived drafts; returns the ids that failed
    pub fn bulk_restore_drafts(&self, session_ids: &[String]) -> Vec<String> {
        let update = SessionUpdate {
            archived: Some(false),
            ..Default::default()
        };
        session_ids
            .iter()
            .filter(|id| {
                let result = self.store.get_session(id).and_then(|session| {
                    if session.status != SessionStatus::Draft || !session.archived {
                        return Err(SessionError::Validation(format!(
                            "session {} is not an archived draft",
                            id
                        )));
                    }
                    self.store.update_session(id, &update)
                });
                match result {
                    Ok(_) => false,
                    Err(e) => {
                        tracing::warn!(session_id = %id, error = %e, "Failed to restore draft");
                        true
                    }
                }
            })
            .cloned()
            .collect()
    }

    pub fn recent_working_dirs(&self, limit: Option<usize>) -> Result<Vec<RecentPath>> {
        self.store.recent_working_dirs(limit)
    }

    pub fn user_settings(&self) -> Result<UserSettings> {
        self.store.get_user_settings()
    }

    pub fn update_user_settings(&self, advanced_providers: bool) -> Result<UserSettings> {
        self.store.update_user_settings(advanced_providers)
    }

    // ─── Lifecycle ───────────────────────────────────────────────

    /// Fail sessions left active by a previous daemon process
    pub fn recover(&self) -> Result<usize> {
        let changes = self.store.fail_active_sessions(RECOVERY_MESSAGE)?;
        for change in &changes {
            tracing::warn!(
                session_id = %change.session.id,
                previous_status = %change.previous_status,
                "Recovered orphaned session"
            );
            self.bus.publish_change(change);
        }
        if !changes.is_empty() {
            tracing::info!(count = changes.len(), "Session recovery complete");
        }
        Ok(changes.len())
    }

    /// Wait for a supervised session to settle
    ///
    /// Without a registered supervisor this reports the stored status if it
    /// is terminal, and `None` otherwise.
    pub async fn wait(&self, session_id: &str) -> Option<SessionStatus> {
        let handle = self.supervisors.get(session_id).map(|h| h.value().clone());
        match handle {
            Some(handle) => handle.wait().await,
            None => self
                .load(session_id)
                .await
                .ok()
                .map(|s| s.status)
                .filter(SessionStatus::is_terminal),
        }
    }

    async fn load(&self, session_id: &str) -> Result<Session> {
        let id = session_id.to_string();
        self.store
            .run_blocking(move |store| store.get_session(&id))
            .await
    }

    /// Stop every supervisor and wait up to `grace` for them to settle
    pub async fn shutdown(&self, grace: Duration) {
        let handles: Vec<SupervisorHandle> = self
            .supervisors
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        tracing::info!(active = handles.len(), "Shutting down session manager");
        self.shutdown.cancel();

        let settled = futures::future::join_all(handles.iter().map(|h| h.wait()));
        if tokio::time::timeout(grace, settled).await.is_err() {
            tracing::warn!("Supervisors did not settle before the shutdown deadline");
        }
    }
}

/// New session continuing `parent`; request fields win over inherited ones
fn inherit(parent: &Session, request: ContinueRequest) -> Session {
    let mut child = Session::new(request.query, parent.working_dir.clone());
    child.parent_session_id = Some(parent.id.clone());
    child.title = request.title.or_else(|| parent.title.clone());
    match request.model {
        Some(model) => child.model = Some(model),
        None => {
            child.model = parent.model.clone();
            child.model_id = parent.model_id.clone();
        }
    }
    child.max_turns = request.max_turns;
    child.system_prompt = request.system_prompt.or_else(|| parent.system_prompt.clone());
    child.append_system_prompt = request
        .append_system_prompt
        .or_else(|| parent.append_system_prompt.clone());
    child.custom_instructions = request
        .custom_instructions
        .or_else(|| parent.custom_instructions.clone());
    child.permission_prompt_tool = request
        .permission_prompt_tool
        .or_else(|| parent.permission_prompt_tool.clone());
    child.allowed_tools = request
        .allowed_tools
        .unwrap_or_else(|| parent.allowed_tools.clone());
    child.disallowed_tools = request
        .disallowed_tools
        .unwrap_or_else(|| parent.disallowed_tools.clone());
    child.additional_directories = request
        .additional_directories
        .unwrap_or_else(|| parent.additional_directories.clone());
    child.auto_accept_edits = parent.auto_accept_edits;
    if parent.bypass_active(child.created_at) {
        child.dangerously_skip_permissions = true;
        child.dangerously_skip_permissions_expires_at =
            parent.dangerously_skip_permissions_expires_at;
        child.dangerously_skip_permissions_timeout_ms =
            parent.dangerously_skip_permissions_timeout_ms;
    }
    child.proxy = parent.proxy.clone();
    child
}

/// Expiry and stored timeout for a bypass starting at `at`
fn bypass_window(
    at: DateTime<Utc>,
    timeout_ms: Option<i64>,
) -> (Option<DateTime<Utc>>, Option<i64>) {
    match timeout_ms.filter(|ms| *ms > 0) {
        Some(ms) => (Some(at + chrono::Duration::milliseconds(ms)), Some(ms)),
        None => (None, None),
    }
}

fn validate_working_dir(dir: &str) -> Result<()> {
    if dir.trim().is_empty() {
        return Err(SessionError::Validation("working_dir is required".into()));
    }
    match std::fs::metadata(Path::new(dir)) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(SessionError::Validation(format!(
            "working_dir is not a directory: {}",
            dir
        ))),
        Err(e) => Err(SessionError::Validation(format!(
            "working_dir {} is not accessible: {}",
            dir, e
        ))),
    }
}
