//! Approval lifecycle and correlation
//!
//! `ApprovalManager` is the only writer of approval rows. Creating an
//! approval binds it to the oldest uncorrelated tool call for the same
//! session and tool; deciding it settles the approval row and the correlated
//! event together, then reconciles the session's `waiting_input` status.

use crate::bus::{BusEvent, EventBus};
use crate::config::DaemonConfig;
use crate::error::{Result, SessionError};
use crate::store::{SessionChange, SqliteStore};
use crate::types::{
    now, Approval, ApprovalMetrics, Decision, Session, SessionStatus, SessionUpdate,
};
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Comment recorded on approvals accepted by bypass permissions
pub const BYPASS_COMMENT: &str = "Auto-accepted (dangerous skip permissions enabled)";

/// Comment recorded on edits accepted by auto-accept mode
pub const AUTO_ACCEPT_COMMENT: &str = "Auto-accepted (auto-accept mode enabled)";

/// Tools covered by auto-accept edits
pub const EDIT_TOOLS: &[&str] = &["Edit", "Write", "MultiEdit"];

/// Run `op`, retrying transient failures with exponential backoff
pub(crate) async fn with_retry<T, F, Fut>(attempts: u32, backoff: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = backoff;
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_retryable() && attempt < attempts => {
                tracing::warn!(attempt, error = %e, "Transient store error, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Creates, correlates, and decides approvals
pub struct ApprovalManager {
    store: Arc<SqliteStore>,
    bus: EventBus,
    config: Arc<DaemonConfig>,
}

impl ApprovalManager {
    pub fn new(store: Arc<SqliteStore>, bus: EventBus, config: Arc<DaemonConfig>) -> Self {
        Self { store, bus, config }
    }

    /// Record a tool-use permission request for the session owning `run_id`
    ///
    /// The approval is auto-approved when bypass permissions is active, or
    /// when auto-accept edits is on and the tool edits files. Otherwise a
    /// `running` session moves to `waiting_input`.
    pub async fn create(
        &self,
        run_id: &str,
        tool_name: &str,
        tool_input: Value,
    ) -> Result<Approval> {
        if tool_name.trim().is_empty() {
            return Err(SessionError::Validation("tool_name is required".into()));
        }
        let lookup = run_id.to_string();
        let session = self
            .store
            .run_blocking(move |store| store.get_session_by_run_id(&lookup))
            .await?;
        let session = self.clear_expired_bypass(session).await;

        let approval = Approval::new(run_id, &session.id, tool_name, tool_input);
        let approval = if session.bypass_active(now()) {
            approval.auto_approved(BYPASS_COMMENT)
        } else if session.auto_accept_edits && EDIT_TOOLS.contains(&tool_name) {
            approval.auto_approved(AUTO_ACCEPT_COMMENT)
        } else {
            approval
        };

        let event_id = with_retry(
            self.config.correlation_retries,
            self.config.correlation_backoff,
            || {
                let approval = approval.clone();
                self.store
                    .run_blocking(move |store| store.insert_approval(&approval))
            },
        )
        .await?;

        match event_id {
            Some(event_id) => tracing::info!(
                approval_id = %approval.id,
                session_id = %session.id,
                tool_name = %tool_name,
                event_id,
                "Approval created and correlated"
            ),
            None => tracing::info!(
                approval_id = %approval.id,
                session_id = %session.id,
                tool_name = %tool_name,
                "Approval created without a matching tool call"
            ),
        }

        self.bus.publish(BusEvent::new_approval(
            &session.id,
            &session.run_id,
            &approval.id,
            tool_name,
        ));

        if approval.is_pending() {
            let session_id = session.id.clone();
            let change = self
                .store
                .run_blocking(move |store| {
                    store.update_session_if(
                        &session_id,
                        &[SessionStatus::Running],
                        &SessionUpdate::status(SessionStatus::WaitingInput),
                    )
                })
                .await?;
            if let Some(change) = change {
                self.bus.publish_change(&change);
            }
        } else {
            tracing::info!(
                approval_id = %approval.id,
                comment = approval.comment.as_deref().unwrap_or_default(),
                "Approval auto-accepted"
            );
            self.bus.publish(BusEvent::approval_resolved(
                &session.id,
                &session.run_id,
                &approval.id,
                approval.status,
                approval.comment.as_deref(),
            ));
        }

        Ok(approval)
    }

    /// Approve or deny a pending approval
    ///
    /// Denial requires a non-empty comment. The session returns to `running`
    /// once no pending approvals remain for it.
    pub async fn decide(
        &self,
        approval_id: &str,
        decision: Decision,
        comment: Option<&str>,
    ) -> Result<Approval> {
        let comment = comment.map(str::trim).filter(|c| !c.is_empty());
        if decision == Decision::Deny && comment.is_none() {
            return Err(SessionError::Validation(
                "a comment is required when denying an approval".into(),
            ));
        }

        let id = approval_id.to_string();
        let comment = comment.map(str::to_string);
        let (decided, session) = self
            .store
            .run_blocking(move |store| {
                let decided = store.decide_approval(&id, decision.status(), comment.as_deref())?;
                let session = store.get_session(&decided.session_id)?;
                Ok((decided, session))
            })
            .await?;

        tracing::info!(
            approval_id = %decided.id,
            session_id = %session.id,
            status = %decided.status,
            "Approval decided"
        );

        self.bus.publish(BusEvent::approval_resolved(
            &session.id,
            &session.run_id,
            &decided.id,
            decided.status,
            decided.comment.as_deref(),
        ));

        let session_id = session.id.clone();
        let change = self
            .store
            .run_blocking(move |store| resume_if_settled(store, &session_id))
            .await?;
        if let Some(change) = change {
            self.bus.publish_change(&change);
        }

        Ok(decided)
    }

    /// Auto-approve every pending approval of a session
    ///
    /// Used when bypass permissions is switched on. Returns the approvals
    /// that were settled.
    pub fn approve_pending(&self, session_id: &str) -> Result<Vec<Approval>> {
        let session = self.store.get_session(session_id)?;
        let approved = self.store.approve_all_pending(session_id, BYPASS_COMMENT)?;
        for approval in &approved {
            self.bus.publish(BusEvent::approval_resolved(
                &session.id,
                &session.run_id,
                &approval.id,
                approval.status,
                approval.comment.as_deref(),
            ));
        }
        if !approved.is_empty() {
            tracing::info!(
                session_id = %session_id,
                count = approved.len(),
                "Auto-approved pending approvals"
            );
            if let Some(change) = resume_if_settled(&self.store, session_id)? {
                self.bus.publish_change(&change);
            }
        }
        Ok(approved)
    }

    pub fn get(&self, approval_id: &str) -> Result<Approval> {
        self.store.get_approval(approval_id)
    }

    pub fn list_pending(&self, session_id: Option<&str>) -> Result<Vec<Approval>> {
        self.store.list_pending_approvals(session_id)
    }

    /// Every approval of a session, decided or not
    pub fn list(&self, session_id: &str) -> Result<Vec<Approval>> {
        self.store.get_session(session_id)?;
        self.store.list_approvals(session_id)
    }

    /// Uncorrelated pending approvals older than `older_than`
    pub fn orphaned(&self, older_than: Duration) -> Result<Vec<Approval>> {
        self.store.orphaned_approvals(cutoff(older_than))
    }

    /// Pending, correlated, and orphaned counts using the configured threshold
    pub fn metrics(&self) -> Result<ApprovalMetrics> {
        self.store
            .approval_metrics(cutoff(self.config.orphan_threshold))
    }

    /// Turn off a bypass whose expiry has passed; failures only log
    async fn clear_expired_bypass(&self, session: Session) -> Session {
        if !session.bypass_expired(now()) {
            return session;
        }
        let update = SessionUpdate {
            dangerously_skip_permissions: Some(false),
            dangerously_skip_permissions_expires_at: Some(None),
            ..Default::default()
        };
        let session_id = session.id.clone();
        let cleared = self
            .store
            .run_blocking(move |store| store.update_session(&session_id, &update))
            .await;
        match cleared {
            Ok(change) => {
                tracing::info!(session_id = %session.id, "Bypass permissions expired");
                let mut changes = Map::new();
                changes.insert("dangerously_skip_permissions".into(), Value::Bool(false));
                self.bus.publish(BusEvent::settings_changed(
                    &session.id,
                    &session.run_id,
                    changes,
                ));
                change.session
            }
            Err(e) => {
                tracing::warn!(
                    session_id = %session.id,
                    error = %e,
                    "Failed to clear expired bypass permissions"
                );
                Session {
                    dangerously_skip_permissions: false,
                    ..session
                }
            }
        }
    }
}

/// Move a `waiting_input` session with nothing left pending back to `running`
fn resume_if_settled(store: &SqliteStore, session_id: &str) -> Result<Option<SessionChange>> {
    if store.count_pending_approvals(session_id)? > 0 {
        return Ok(None);
    }
    store.update_session_if(
        session_id,
        &[SessionStatus::WaitingInput],
        &SessionUpdate::status(SessionStatus::Running),
    )
}

fn cutoff(older_than: Duration) -> chrono::DateTime<chrono::Utc> {
    let age = chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
    now() - age
}
