//! Per-session agent supervision
//!
//! A `Supervisor` owns one agent subprocess and its ingestion loop. It is
//! the single writer of its session's conversation log and drives the
//! session from `starting` to exactly one terminal status. It holds the
//! store and the bus but never the manager that spawned it.

use crate::agent::{AgentControl, AgentExit, AgentLauncher, LaunchSpec};
use crate::approval::with_retry;
use crate::bus::{BusEvent, EventBus};
use crate::config::DaemonConfig;
use crate::error::{ErrorKind, Result, SessionError};
use crate::store::SqliteStore;
use crate::stream::{RunResult, StreamItem, StreamRecord, Usage};
use crate::types::{
    now, ConversationEvent, NewConversationEvent, SessionStatus, SessionUpdate,
};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Largest file read from disk for a partial-read snapshot
const MAX_SNAPSHOT_BYTES: u64 = 10 * 1024 * 1024;

/// Error recorded on sessions failed by daemon shutdown
pub const SHUTDOWN_MESSAGE: &str = "daemon shutting down";

/// Manager-side handle on a running supervisor
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    pub session_id: String,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    interrupt: CancellationToken,
    done: watch::Receiver<Option<SessionStatus>>,
}

impl SupervisorHandle {
    /// Signal the agent to stop; forced after the configured grace period
    pub fn interrupt(&self) {
        self.interrupt.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.done.borrow().is_some() || self.done.has_changed().is_err()
    }

    /// Wait for the supervisor to settle, returning the terminal status
    pub async fn wait(&self) -> Option<SessionStatus> {
        let mut done = self.done.clone();
        let status = match done.wait_for(|status| status.is_some()).await {
            Ok(status) => *status,
            // The supervisor task went away without reporting
            Err(_) => None,
        };
        status
    }
}

/// Statuses the supervisor may still move out of
const UNSETTLED: [SessionStatus; 4] = [
    SessionStatus::Starting,
    SessionStatus::Running,
    SessionStatus::WaitingInput,
    SessionStatus::Interrupting,
];

/// Supervises one agent run
pub struct Supervisor {
    session_id: String,
    run_id: String,
    query: String,
    working_dir: PathBuf,
    started_at: DateTime<Utc>,
    store: Arc<SqliteStore>,
    bus: EventBus,
    config: Arc<DaemonConfig>,
    interrupt: CancellationToken,
    shutdown: CancellationToken,
    done: watch::Sender<Option<SessionStatus>>,
}

/// Ingestion state carried across stream records
#[derive(Default)]
struct Ingest {
    claude_session_id: Option<String>,
    result: Option<RunResult>,
}

impl Supervisor {
    pub fn new(
        spec: &LaunchSpec,
        store: Arc<SqliteStore>,
        bus: EventBus,
        config: Arc<DaemonConfig>,
        shutdown: CancellationToken,
    ) -> Self {
        let (done, _) = watch::channel(None);
        Self {
            session_id: spec.session_id.clone(),
            run_id: spec.run_id.clone(),
            query: spec.query.clone(),
            working_dir: spec.working_dir.clone(),
            started_at: now(),
            store,
            bus,
            config,
            interrupt: CancellationToken::new(),
            shutdown,
            done,
        }
    }

    /// Handle for interrupting and awaiting this supervisor
    ///
    /// Valid before `spawn`, so callers can register it first.
    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            session_id: self.session_id.clone(),
            run_id: self.run_id.clone(),
            started_at: self.started_at,
            interrupt: self.interrupt.clone(),
            done: self.done.subscribe(),
        }
    }

    /// Start the agent and ingestion loop on a new task
    pub fn spawn(self, launcher: Arc<dyn AgentLauncher>, spec: LaunchSpec) {
        tokio::spawn(async move {
            let status = self.run(launcher.as_ref(), &spec).await;
            self.done.send_replace(Some(status));
        });
    }

    async fn run(&self, launcher: &dyn AgentLauncher, spec: &LaunchSpec) -> SessionStatus {
        let handle = match launcher.launch(spec).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(session_id = %self.session_id, error = %e, "Agent launch failed");
                return self.settle(SessionUpdate::failed(e.to_string())).await;
            }
        };

        if let Some(change) = self
            .transition(&[SessionStatus::Starting], SessionStatus::Running)
            .await
        {
            tracing::info!(
                session_id = %self.session_id,
                pid = ?handle.control.pid(),
                "Session running"
            );
            self.bus.publish_change(&change);
        }

        let mut control = handle.control;
        let mut stdout = BufReader::new(handle.stdout);
        let mut buf = Vec::new();
        let mut ingest = Ingest::default();
        let mut stream_error: Option<String> = None;
        let mut kill_deadline: Option<tokio::time::Instant> = None;
        let mut shutting_down = false;

        loop {
            tokio::select! {
                read = stdout.read_until(b'\n', &mut buf) => match read {
                    Ok(0) => break,
                    Ok(_) => {
                        match std::str::from_utf8(&buf) {
                            Ok(line) => self.ingest_line(line, &mut ingest).await,
                            Err(e) => tracing::warn!(
                                session_id = %self.session_id,
                                error = %e,
                                "Skipping stream line that is not valid UTF-8"
                            ),
                        }
                        buf.clear();
                    }
                    Err(e) => {
                        tracing::error!(session_id = %self.session_id, error = %e, "Agent stream read failed");
                        stream_error = Some(e.to_string());
                        break;
                    }
                },

                _ = self.interrupt.cancelled(), if kill_deadline.is_none() => {
                    tracing::info!(session_id = %self.session_id, "Interrupting agent");
                    if let Err(e) = control.terminate() {
                        tracing::warn!(session_id = %self.session_id, error = %e, "Graceful interrupt failed");
                    }
                    kill_deadline = Some(tokio::time::Instant::now() + self.config.interrupt_grace);
                }
                _ = tokio::time::sleep_until(kill_deadline.unwrap_or_else(tokio::time::Instant::now)),
                    if kill_deadline.is_some() => {
                    tracing::warn!(session_id = %self.session_id, "Agent ignored interrupt, killing");
                    self.kill(control.as_mut()).await;
                    break;
                }
                _ = self.shutdown.cancelled() => {
                    shutting_down = true;
                    self.kill(control.as_mut()).await;
                    break;
                }
            }
        }

        let exit = self.reap(control.as_mut()).await;
        let update = self
            .final_update(shutting_down, stream_error, ingest.result, exit)
            .await;
        self.settle(update).await
    }

    /// Run a store operation for this session on the blocking pool
    async fn db<F, R>(&self, op: F) -> Result<R>
    where
        F: FnOnce(&SqliteStore, &str) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let session_id = self.session_id.clone();
        self.store
            .run_blocking(move |store| op(store, &session_id))
            .await
    }

    async fn kill(&self, control: &mut dyn AgentControl) {
        if let Err(e) = control.kill().await {
            tracing::warn!(session_id = %self.session_id, error = %e, "Failed to kill agent");
        }
    }

    /// Wait for the agent to exit once its stream has closed
    async fn reap(&self, control: &mut dyn AgentControl) -> Option<AgentExit> {
        let waited = tokio::time::timeout(self.config.interrupt_grace, control.wait()).await;
        let result = match waited {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(session_id = %self.session_id, "Agent did not exit after closing its stream");
                self.kill(control).await;
                control.wait().await
            }
        };
        match result {
            Ok(exit) => Some(exit),
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "Failed to reap agent");
                None
            }
        }
    }

    async fn final_update(
        &self,
        shutting_down: bool,
        stream_error: Option<String>,
        result: Option<RunResult>,
        exit: Option<AgentExit>,
    ) -> SessionUpdate {
        let interrupting = self
            .db(|store, id| store.get_session(id))
            .await
            .map(|s| s.status == SessionStatus::Interrupting)
            .unwrap_or(false);

        if shutting_down {
            return SessionUpdate::failed(SHUTDOWN_MESSAGE);
        }
        if interrupting {
            return SessionUpdate::status(SessionStatus::Interrupted);
        }
        if let Some(e) = stream_error {
            return SessionUpdate::failed(format!("agent stream error: {}", e));
        }

        let exit_ok = exit.is_some_and(|e| e.success);
        let exit_text = exit.map_or_else(|| "unknown exit".to_string(), |e| e.to_string());
        match result {
            Some(result) if result.is_error => SessionUpdate::failed(
                result
                    .error
                    .or(result.result)
                    .unwrap_or_else(|| "agent reported an error".into()),
            ),
            Some(_) if exit_ok => SessionUpdate::status(SessionStatus::Completed),
            Some(_) => SessionUpdate::failed(format!("agent exited abnormally ({})", exit_text)),
            None => SessionUpdate::failed(format!(
                "agent exited without a result ({})",
                exit_text
            )),
        }
    }

    /// Write the terminal status, if the session has not already settled
    async fn settle(&self, update: SessionUpdate) -> SessionStatus {
        let target = update.status.unwrap_or(SessionStatus::Failed);
        let update = SessionUpdate {
            last_activity_at: Some(now()),
            ..update
        };

        let settled = self
            .db(move |store, id| store.update_session_if(id, &UNSETTLED, &update))
            .await;
        match settled {
            Ok(Some(change)) => {
                tracing::info!(
                    session_id = %self.session_id,
                    status = %change.session.status,
                    error = change.session.error_message.as_deref().unwrap_or_default(),
                    "Session finished"
                );
                self.bus.publish_change(&change);
                change.session.status
            }
            Ok(None) => {
                let status = self
                    .db(|store, id| store.get_session(id))
                    .await
                    .map(|s| s.status)
                    .unwrap_or(target);
                tracing::debug!(session_id = %self.session_id, status = %status, "Session already settled");
                status
            }
            Err(e) => {
                tracing::error!(
                    session_id = %self.session_id,
                    status = %target,
                    error = %e,
                    "Failed to record final session status"
                );
                target
            }
        }
    }

    async fn transition(
        &self,
        expected: &'static [SessionStatus],
        next: SessionStatus,
    ) -> Option<crate::store::SessionChange> {
        let changed = self
            .db(move |store, id| {
                store.update_session_if(id, expected, &SessionUpdate::status(next))
            })
            .await;
        match changed {
            Ok(change) => change,
            Err(e) => {
                tracing::error!(session_id = %self.session_id, status = %next, error = %e, "Status update failed");
                None
            }
        }
    }

    // ─── Ingestion ───────────────────────────────────────────────

    async fn ingest_line(&self, line: &str, ingest: &mut Ingest) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let raw = line.to_string();
        if let Err(e) = self.db(move |store, id| store.store_raw_event(id, &raw)).await {
            tracing::debug!(session_id = %self.session_id, error = %e, "Failed to keep raw stream line");
        }

        let record = match StreamRecord::parse(line) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "Skipping unparseable stream record");
                return;
            }
        };

        if let Some(claude_id) = record.session_id.as_deref().filter(|id| !id.is_empty()) {
            if ingest.claude_session_id.is_none() {
                self.capture_claude_session_id(claude_id, ingest).await;
            }
        }

        for item in record.classify() {
            if let Err(e) = self.apply(item, ingest).await {
                match e.kind() {
                    ErrorKind::Validation | ErrorKind::NotFound => tracing::warn!(
                        session_id = %self.session_id,
                        error = %e,
                        "Skipping stream item"
                    ),
                    _ => tracing::error!(
                        session_id = %self.session_id,
                        error = %e,
                        "Failed to ingest stream item"
                    ),
                }
            }
        }
    }

    async fn capture_claude_session_id(&self, claude_id: &str, ingest: &mut Ingest) {
        let update = SessionUpdate {
            claude_session_id: Some(claude_id.to_string()),
            ..Default::default()
        };
        match self.db(move |store, id| store.update_session(id, &update)).await {
            Ok(_) => {
                tracing::info!(
                    session_id = %self.session_id,
                    claude_session_id = %claude_id,
                    "Captured agent session id"
                );
                ingest.claude_session_id = Some(claude_id.to_string());
                if let Err(e) = self.inject_query(ingest).await {
                    tracing::warn!(session_id = %self.session_id, error = %e, "Failed to record initial query");
                }
            }
            Err(e) => {
                tracing::error!(session_id = %self.session_id, error = %e, "Failed to store agent session id")
            }
        }
    }

    /// Record the user's query as the first message unless one is already there
    async fn inject_query(&self, ingest: &Ingest) -> Result<()> {
        let log = self.db(|store, id| store.get_conversation(id)).await?;
        if log.first().is_some_and(|e| e.role.as_deref() == Some("user")) {
            return Ok(());
        }
        let event = NewConversationEvent::message(&self.session_id, "user", &self.query)
            .with_claude_session_id(ingest.claude_session_id.clone());
        self.append(event).await?;
        Ok(())
    }

    async fn apply(&self, item: StreamItem, ingest: &mut Ingest) -> Result<()> {
        let claude_id = ingest.claude_session_id.clone();
        match item {
            StreamItem::Init { model } => self.detect_model(model).await,
            StreamItem::System { content } => {
                self.append(
                    NewConversationEvent::system(&self.session_id, content)
                        .with_claude_session_id(claude_id),
                )
                .await?;
                Ok(())
            }
            StreamItem::Message { role, text } => {
                self.append(
                    NewConversationEvent::message(&self.session_id, role, text)
                        .with_claude_session_id(claude_id),
                )
                .await?;
                Ok(())
            }
            StreamItem::Thinking { role, text } => {
                let mut event = NewConversationEvent::thinking(&self.session_id, text)
                    .with_claude_session_id(claude_id);
                event.role = Some(role);
                self.append(event).await?;
                Ok(())
            }
            StreamItem::ToolUse {
                id,
                name,
                input,
                parent_tool_use_id,
            } => {
                let input_json = serde_json::to_string(&input)?;
                let event = self
                    .append(
                        NewConversationEvent::tool_use(&self.session_id, id, name, input_json)
                            .with_claude_session_id(claude_id)
                            .with_parent_tool_use_id(parent_tool_use_id),
                    )
                    .await?;
                self.correlate_on_write(&event).await;
                Ok(())
            }
            StreamItem::ToolResult {
                tool_use_id,
                content,
            } => {
                self.append(
                    NewConversationEvent::tool_result(&self.session_id, &tool_use_id, &content)
                        .with_claude_session_id(claude_id),
                )
                .await?;
                let tool_id = tool_use_id.clone();
                self.db(move |store, id| store.mark_tool_call_completed(id, &tool_id))
                    .await?;
                if let Err(e) = self.capture_snapshot(&tool_use_id, &content).await {
                    tracing::warn!(
                        session_id = %self.session_id,
                        tool_id = %tool_use_id,
                        error = %e,
                        "Failed to capture file snapshot"
                    );
                }
                Ok(())
            }
            StreamItem::Usage(usage) => self.record_usage(usage).await,
            StreamItem::Result(result) => {
                let mut update = SessionUpdate {
                    cost_usd: result.cost_usd,
                    duration_ms: result.duration_ms,
                    num_turns: result.num_turns,
                    result_content: result.result.clone(),
                    ..Default::default()
                };
                if let Some(usage) = result.usage {
                    apply_usage(&mut update, usage);
                }
                self.db(move |store, id| store.update_session(id, &update))
                    .await?;
                tracing::info!(
                    session_id = %self.session_id,
                    is_error = result.is_error,
                    cost_usd = ?result.cost_usd,
                    num_turns = ?result.num_turns,
                    "Agent reported result"
                );
                ingest.result = Some(result);
                Ok(())
            }
        }
    }

    /// Append to the log and announce it
    async fn append(&self, event: NewConversationEvent) -> Result<ConversationEvent> {
        let stored = self
            .store
            .run_blocking(move |store| store.append_event(&event))
            .await?;
        self.bus.publish(
            BusEvent::conversation_updated(&self.session_id, &self.run_id)
                .with("event_type", stored.event_type.as_str())
                .with("sequence", stored.sequence),
        );
        Ok(stored)
    }

    /// Bind a new tool call to an approval that arrived before it
    async fn correlate_on_write(&self, event: &ConversationEvent) {
        let event_id = event.id;
        let result = with_retry(
            self.config.correlation_retries,
            self.config.correlation_backoff,
            || {
                self.store
                    .run_blocking(move |store| store.correlate_on_write(event_id))
            },
        )
        .await;
        match result {
            Ok(Some(approval)) => tracing::info!(
                session_id = %self.session_id,
                approval_id = %approval.id,
                event_id,
                "Correlated waiting approval with new tool call"
            ),
            Ok(None) => {}
            Err(e) => tracing::warn!(
                session_id = %self.session_id,
                event_id,
                error = %e,
                "Correlation on write failed"
            ),
        }
    }

    async fn detect_model(&self, model: Option<String>) -> Result<()> {
        let Some(model) = model else {
            return Ok(());
        };
        let session = self.db(|store, id| store.get_session(id)).await?;
        if session.model.as_deref().is_some_and(|m| !m.is_empty()) {
            return Ok(());
        }

        let lower = model.to_lowercase();
        let name = if lower.contains("opus") {
            "opus"
        } else if lower.contains("sonnet") {
            "sonnet"
        } else {
            tracing::debug!(session_id = %self.session_id, model = %model, "Unrecognized agent model");
            return Ok(());
        };

        let update = SessionUpdate {
            model: Some(name.to_string()),
            model_id: Some(model.clone()),
            ..Default::default()
        };
        self.db(move |store, id| store.update_session(id, &update))
            .await?;
        tracing::info!(session_id = %self.session_id, model = %name, original = %model, "Detected session model");
        Ok(())
    }

    async fn record_usage(&self, usage: Usage) -> Result<()> {
        let mut update = SessionUpdate::default();
        apply_usage(&mut update, usage);
        self.db(move |store, id| store.update_session(id, &update))
            .await?;
        Ok(())
    }

    /// Keep the full content of a file the agent read
    async fn capture_snapshot(&self, tool_id: &str, result: &str) -> Result<()> {
        let lookup = tool_id.to_string();
        let call = self
            .db(move |store, id| store.get_tool_call(id, &lookup))
            .await?;
        let Some(call) = call else {
            return Ok(());
        };
        if call.tool_name.as_deref() != Some("Read") {
            return Ok(());
        }

        let input: serde_json::Value =
            serde_json::from_str(call.tool_input_json.as_deref().unwrap_or("{}"))?;
        let file_path = input
            .get("file_path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SessionError::Validation("Read input has no file_path".into()))?
            .to_string();
        let partial = input.get("limit").is_some() || input.get("offset").is_some();

        let content = if partial {
            let full_path = resolve(&self.working_dir, &file_path);
            let size = tokio::fs::metadata(&full_path).await?.len();
            if size > MAX_SNAPSHOT_BYTES {
                tracing::warn!(path = %full_path.display(), size, "File too large for snapshot, keeping partial content");
                strip_line_numbers(result)
            } else {
                tokio::fs::read_to_string(&full_path).await?
            }
        } else {
            strip_line_numbers(result)
        };

        let tool_id = tool_id.to_string();
        self.db(move |store, id| store.create_file_snapshot(id, &tool_id, &file_path, &content))
            .await?;
        Ok(())
    }
}

fn apply_usage(update: &mut SessionUpdate, usage: Usage) {
    update.input_tokens = Some(usage.input_tokens);
    update.output_tokens = Some(usage.output_tokens);
    update.cache_creation_input_tokens = Some(usage.cache_creation_input_tokens);
    update.cache_read_input_tokens = Some(usage.cache_read_input_tokens);
    update.effective_context_tokens = Some(usage.effective_context_tokens());
}

fn resolve(working_dir: &Path, file_path: &str) -> PathBuf {
    let path = Path::new(file_path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        working_dir.join(path)
    }
}

/// Drop the `N→` line-number prefixes of Read output
///
/// Lines without a prefix are not file content and are dropped.
pub fn strip_line_numbers(output: &str) -> String {
    output
        .split('\n')
        .filter_map(|line| match line.find('→') {
            Some(idx) if idx > 0 => Some(&line[idx + '→'.len_utf8()..]),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}
