//! Core record types for the session control plane
//!
//! All types use camelCase JSON serialization for wire compatibility;
//! enum values serialize as the snake_case strings stored in the database.

use crate::error::{Result, SessionError};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Current time, truncated to the millisecond precision the store keeps
pub fn now() -> DateTime<Utc> {
    from_millis(Utc::now().timestamp_millis())
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $name {
            /// Database and wire representation
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = SessionError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($s => Ok(Self::$variant),)+
                    other => Err(SessionError::Validation(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

// ─── Session status ──────────────────────────────────────────────

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Draft,
    Starting,
    Running,
    WaitingInput,
    Interrupting,
    Interrupted,
    Completed,
    Failed,
    Discarded,
}

string_enum!(SessionStatus {
    Draft => "draft",
    Starting => "starting",
    Running => "running",
    WaitingInput => "waiting_input",
    Interrupting => "interrupting",
    Interrupted => "interrupted",
    Completed => "completed",
    Failed => "failed",
    Discarded => "discarded",
});

impl SessionStatus {
    /// Statuses that close out a session
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Interrupted | Self::Discarded
        )
    }

    /// Statuses recovery closes out after a daemon restart
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Running | Self::WaitingInput | Self::Interrupting
        )
    }

    /// Whether the state machine permits moving from `self` to `next`
    ///
    /// Terminal statuses never move. Re-asserting the current non-terminal
    /// status is permitted.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;

        if self.is_terminal() {
            return false;
        }
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (Draft, Starting)
                | (Draft, Discarded)
                | (Starting, Running)
                | (Starting, Failed)
                | (Running, WaitingInput)
                | (Running, Interrupting)
                | (Running, Completed)
                | (Running, Failed)
                | (WaitingInput, Running)
                | (WaitingInput, Interrupting)
                | (WaitingInput, Completed)
                | (WaitingInput, Failed)
                | (Interrupting, Interrupted)
                | (Interrupting, Failed)
        )
    }

    /// Validate a transition, returning `InvalidTransition` when illegal
    pub fn check_transition(&self, next: SessionStatus) -> Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(SessionError::invalid_transition(self, next))
        }
    }
}

// ─── Approval status ─────────────────────────────────────────────

/// Status of an approval record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
}

string_enum!(ApprovalStatus {
    Pending => "pending",
    Approved => "approved",
    Denied => "denied",
});

/// Approval state stamped on a correlated tool-use event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventApprovalStatus {
    Pending,
    Approved,
    Denied,
    /// Settled without an explicit decision
    Resolved,
}

string_enum!(EventApprovalStatus {
    Pending => "pending",
    Approved => "approved",
    Denied => "denied",
    Resolved => "resolved",
});

impl From<ApprovalStatus> for EventApprovalStatus {
    fn from(status: ApprovalStatus) -> Self {
        match status {
            ApprovalStatus::Pending => Self::Pending,
            ApprovalStatus::Approved => Self::Approved,
            ApprovalStatus::Denied => Self::Denied,
        }
    }
}

/// A human decision on a pending approval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Deny,
}

impl Decision {
    pub fn status(&self) -> ApprovalStatus {
        match self {
            Self::Approve => ApprovalStatus::Approved,
            Self::Deny => ApprovalStatus::Denied,
        }
    }
}

// ─── Session ─────────────────────────────────────────────────────

/// Provider proxy settings forwarded to the agent subprocess
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_override: Option<String>,
}

/// One orchestrated agent run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    /// External correlation key used by approval triggers
    pub run_id: String,
    /// Identifier assigned by the agent CLI; immutable once set
    pub claude_session_id: Option<String>,
    pub parent_session_id: Option<String>,
    pub status: SessionStatus,

    pub query: String,
    pub summary: String,
    pub title: Option<String>,
    pub model: Option<String>,
    pub model_id: Option<String>,
    pub working_dir: String,

    // Launch configuration
    pub max_turns: Option<i64>,
    pub system_prompt: Option<String>,
    pub append_system_prompt: Option<String>,
    pub custom_instructions: Option<String>,
    pub permission_prompt_tool: Option<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub disallowed_tools: Vec<String>,
    #[serde(default)]
    pub additional_directories: Vec<String>,

    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    // Results
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<i64>,
    pub num_turns: Option<i64>,
    pub result_content: Option<String>,
    pub error_message: Option<String>,

    // Token usage
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cache_creation_input_tokens: Option<i64>,
    pub cache_read_input_tokens: Option<i64>,
    pub effective_context_tokens: Option<i64>,

    // Settings
    pub archived: bool,
    pub auto_accept_edits: bool,
    pub dangerously_skip_permissions: bool,
    pub dangerously_skip_permissions_expires_at: Option<DateTime<Utc>>,
    pub dangerously_skip_permissions_timeout_ms: Option<i64>,

    #[serde(default)]
    pub proxy: ProxyConfig,
}

impl Session {
    /// Create a session record with fresh `id`/`run_id`
    pub fn new(query: impl Into<String>, working_dir: impl Into<String>) -> Self {
        let query = query.into();
        let created = now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: uuid::Uuid::new_v4().to_string(),
            claude_session_id: None,
            parent_session_id: None,
            status: SessionStatus::Starting,
            summary: summarize(&query),
            query,
            title: None,
            model: None,
            model_id: None,
            working_dir: working_dir.into(),
            max_turns: None,
            system_prompt: None,
            append_system_prompt: None,
            custom_instructions: None,
            permission_prompt_tool: None,
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            additional_directories: Vec::new(),
            created_at: created,
            last_activity_at: created,
            completed_at: None,
            cost_usd: None,
            duration_ms: None,
            num_turns: None,
            result_content: None,
            error_message: None,
            input_tokens: None,
            output_tokens: None,
            cache_creation_input_tokens: None,
            cache_read_input_tokens: None,
            effective_context_tokens: None,
            archived: false,
            auto_accept_edits: false,
            dangerously_skip_permissions: false,
            dangerously_skip_permissions_expires_at: None,
            dangerously_skip_permissions_timeout_ms: None,
            proxy: ProxyConfig::default(),
        }
    }

    /// Set the initial status
    pub fn with_status(mut self, status: SessionStatus) -> Self {
        self.status = status;
        self
    }

    /// Bypass permissions is on and has not expired at `at`
    pub fn bypass_active(&self, at: DateTime<Utc>) -> bool {
        self.dangerously_skip_permissions
            && self
                .dangerously_skip_permissions_expires_at
                .map_or(true, |expires| expires > at)
    }

    /// Bypass permissions is on but its expiry has passed at `at`
    pub fn bypass_expired(&self, at: DateTime<Utc>) -> bool {
        self.dangerously_skip_permissions
            && self
                .dangerously_skip_permissions_expires_at
                .is_some_and(|expires| expires <= at)
    }
}

/// First line of a query, capped at 50 characters
pub fn summarize(query: &str) -> String {
    let line = query.lines().next().unwrap_or_default().trim();
    if line.chars().count() <= 50 {
        line.to_string()
    } else {
        let cut: String = line.chars().take(47).collect();
        format!("{cut}...")
    }
}

/// Partial patch over a session row; unset fields are preserved
///
/// Fields typed `Option<Option<T>>` distinguish "leave alone" (`None`)
/// from "clear" (`Some(None)`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionUpdate {
    pub status: Option<SessionStatus>,
    pub claude_session_id: Option<String>,
    pub query: Option<String>,
    pub summary: Option<String>,
    pub title: Option<String>,
    pub model: Option<String>,
    pub model_id: Option<String>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<i64>,
    pub num_turns: Option<i64>,
    pub result_content: Option<String>,
    pub error_message: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cache_creation_input_tokens: Option<i64>,
    pub cache_read_input_tokens: Option<i64>,
    pub effective_context_tokens: Option<i64>,
    pub archived: Option<bool>,
    pub auto_accept_edits: Option<bool>,
    pub dangerously_skip_permissions: Option<bool>,
    pub dangerously_skip_permissions_expires_at: Option<Option<DateTime<Utc>>>,
    pub dangerously_skip_permissions_timeout_ms: Option<Option<i64>>,
    pub proxy_enabled: Option<bool>,
    pub proxy_base_url: Option<Option<String>>,
    pub proxy_api_key: Option<Option<String>>,
    pub proxy_model_override: Option<Option<String>>,
}

impl SessionUpdate {
    /// Patch carrying only a status change
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Patch moving to a terminal status with an error message
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(SessionStatus::Failed),
            error_message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Filter for session listings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionFilter {
    /// Only sessions no other session continues from
    #[serde(default)]
    pub leaves_only: bool,
    #[serde(default)]
    pub include_archived: bool,
    #[serde(default)]
    pub archived_only: bool,
    #[serde(default)]
    pub status: Option<SessionStatus>,
}

// ─── Conversation events ─────────────────────────────────────────

/// Kind of entry in a session's conversation log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationEventType {
    Message,
    ToolUse,
    ToolResult,
    System,
    Thinking,
}

string_enum!(ConversationEventType {
    Message => "message",
    ToolUse => "tool_use",
    ToolResult => "tool_result",
    System => "system",
    Thinking => "thinking",
});

/// One persisted entry in a session's append-only log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEvent {
    pub id: i64,
    pub session_id: String,
    pub claude_session_id: Option<String>,
    pub sequence: i64,
    pub event_type: ConversationEventType,
    pub created_at: DateTime<Utc>,
    pub role: Option<String>,
    pub content: Option<String>,
    pub tool_id: Option<String>,
    pub tool_name: Option<String>,
    pub tool_input_json: Option<String>,
    pub parent_tool_use_id: Option<String>,
    pub tool_result_for_id: Option<String>,
    pub tool_result_content: Option<String>,
    pub is_completed: bool,
    pub approval_status: Option<EventApprovalStatus>,
    pub approval_id: Option<String>,
}

/// An event about to be appended; the store assigns id and sequence
#[derive(Debug, Clone, PartialEq)]
pub struct NewConversationEvent {
    pub session_id: String,
    pub claude_session_id: Option<String>,
    pub event_type: ConversationEventType,
    pub role: Option<String>,
    pub content: Option<String>,
    pub tool_id: Option<String>,
    pub tool_name: Option<String>,
    pub tool_input_json: Option<String>,
    pub parent_tool_use_id: Option<String>,
    pub tool_result_for_id: Option<String>,
    pub tool_result_content: Option<String>,
}

impl NewConversationEvent {
    fn empty(session_id: impl Into<String>, event_type: ConversationEventType) -> Self {
        Self {
            session_id: session_id.into(),
            claude_session_id: None,
            event_type,
            role: None,
            content: None,
            tool_id: None,
            tool_name: None,
            tool_input_json: None,
            parent_tool_use_id: None,
            tool_result_for_id: None,
            tool_result_content: None,
        }
    }

    pub fn message(
        session_id: impl Into<String>,
        role: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut event = Self::empty(session_id, ConversationEventType::Message);
        event.role = Some(role.into());
        event.content = Some(content.into());
        event
    }

    pub fn thinking(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut event = Self::empty(session_id, ConversationEventType::Thinking);
        event.role = Some("assistant".into());
        event.content = Some(content.into());
        event
    }

    pub fn system(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut event = Self::empty(session_id, ConversationEventType::System);
        event.role = Some("system".into());
        event.content = Some(content.into());
        event
    }

    pub fn tool_use(
        session_id: impl Into<String>,
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        tool_input_json: impl Into<String>,
    ) -> Self {
        let mut event = Self::empty(session_id, ConversationEventType::ToolUse);
        event.role = Some("assistant".into());
        event.tool_id = Some(tool_id.into());
        event.tool_name = Some(tool_name.into());
        event.tool_input_json = Some(tool_input_json.into());
        event
    }

    pub fn tool_result(
        session_id: impl Into<String>,
        tool_use_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut event = Self::empty(session_id, ConversationEventType::ToolResult);
        event.role = Some("user".into());
        event.tool_result_for_id = Some(tool_use_id.into());
        event.tool_result_content = Some(content.into());
        event
    }

    pub fn with_claude_session_id(mut self, id: Option<String>) -> Self {
        self.claude_session_id = id;
        self
    }

    pub fn with_parent_tool_use_id(mut self, id: Option<String>) -> Self {
        self.parent_tool_use_id = id;
        self
    }
}

// ─── Approvals ───────────────────────────────────────────────────

/// A human decision object gating a single tool-use event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    /// Daemon-generated id (`local-<uuid>`)
    pub id: String,
    pub run_id: String,
    pub session_id: String,
    pub status: ApprovalStatus,
    pub tool_name: String,
    /// Opaque tool input as supplied by the agent
    pub tool_input: serde_json::Value,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

impl Approval {
    /// Create a pending approval with a fresh id
    pub fn new(
        run_id: impl Into<String>,
        session_id: impl Into<String>,
        tool_name: impl Into<String>,
        tool_input: serde_json::Value,
    ) -> Self {
        Self {
            id: format!("local-{}", uuid::Uuid::new_v4()),
            run_id: run_id.into(),
            session_id: session_id.into(),
            status: ApprovalStatus::Pending,
            tool_name: tool_name.into(),
            tool_input,
            comment: None,
            created_at: now(),
            responded_at: None,
        }
    }

    /// Record the approval as already approved with a comment
    pub fn auto_approved(mut self, comment: impl Into<String>) -> Self {
        self.status = ApprovalStatus::Approved;
        self.comment = Some(comment.into());
        self.responded_at = Some(self.created_at);
        self
    }

    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }
}

/// Approval counters exposed for monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalMetrics {
    /// Approvals still awaiting a decision
    pub pending: u64,
    /// Pending approvals bound to a tool-use event
    pub correlated: u64,
    /// Pending, uncorrelated approvals older than the orphan threshold
    pub orphaned: u64,
}

// ─── Passive records ─────────────────────────────────────────────

/// Full file content captured from a Read tool result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSnapshot {
    pub id: i64,
    pub tool_id: String,
    pub session_id: String,
    pub file_path: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A working directory with usage statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentPath {
    pub path: String,
    pub last_used: DateTime<Utc>,
    pub usage_count: u64,
}

/// Process-wide user preferences
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSettings {
    pub advanced_providers: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// MCP server definition attached to a session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServer {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_status_roundtrip_strings() {
        for status in [
            SessionStatus::Draft,
            SessionStatus::Starting,
            SessionStatus::Running,
            SessionStatus::WaitingInput,
            SessionStatus::Interrupting,
            SessionStatus::Interrupted,
            SessionStatus::Completed,
            SessionStatus::Failed,
            SessionStatus::Discarded,
        ] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
        assert!("paused".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn test_status_serde_matches_db_string() {
        let json = serde_json::to_string(&SessionStatus::WaitingInput).unwrap();
        assert_eq!(json, "\"waiting_input\"");
    }

    #[test]
    fn test_terminal_statuses_never_move() {
        let all = [
            SessionStatus::Draft,
            SessionStatus::Starting,
            SessionStatus::Running,
            SessionStatus::WaitingInput,
            SessionStatus::Interrupting,
            SessionStatus::Interrupted,
            SessionStatus::Completed,
            SessionStatus::Failed,
            SessionStatus::Discarded,
        ];
        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        use SessionStatus::*;
        assert!(Draft.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(WaitingInput));
        assert!(WaitingInput.can_transition_to(Running));
        assert!(WaitingInput.can_transition_to(Interrupting));
        assert!(Interrupting.can_transition_to(Interrupted));
        assert!(Running.can_transition_to(Completed));
        assert!(Draft.can_transition_to(Discarded));
    }

    #[test]
    fn test_illegal_transitions() {
        use SessionStatus::*;
        assert!(!Draft.can_transition_to(Running));
        assert!(!Starting.can_transition_to(Interrupting));
        assert!(!Running.can_transition_to(Interrupted));
        assert!(!Running.can_transition_to(Draft));
        let err = Running.check_transition(Draft).unwrap_err();
        assert!(matches!(err, SessionError::InvalidTransition { .. }));
    }

    #[test]
    fn test_bypass_expiry() {
        let mut session = Session::new("q", "/tmp");
        let t = now();
        assert!(!session.bypass_active(t));

        session.dangerously_skip_permissions = true;
        assert!(session.bypass_active(t));
        assert!(!session.bypass_expired(t));

        session.dangerously_skip_permissions_expires_at = Some(t - Duration::seconds(1));
        assert!(!session.bypass_active(t));
        assert!(session.bypass_expired(t));

        session.dangerously_skip_permissions_expires_at = Some(t + Duration::minutes(5));
        assert!(session.bypass_active(t));
    }

    #[test]
    fn test_summarize() {
        assert_eq!(summarize("fix the bug\nmore detail"), "fix the bug");
        let long = "x".repeat(80);
        let summary = summarize(&long);
        assert_eq!(summary.chars().count(), 50);
        assert!(summary.ends_with("..."));
    }

    #[test]
    fn test_approval_new() {
        let approval = Approval::new("run-1", "sess-1", "bash", serde_json::json!({"cmd": "ls"}));
        assert!(approval.id.starts_with("local-"));
        assert!(approval.is_pending());
        assert!(approval.responded_at.is_none());

        let auto = approval.auto_approved("ok");
        assert_eq!(auto.status, ApprovalStatus::Approved);
        assert!(auto.responded_at.is_some());
    }

    #[test]
    fn test_session_update_is_empty() {
        assert!(SessionUpdate::default().is_empty());
        assert!(!SessionUpdate::status(SessionStatus::Running).is_empty());
    }

    #[test]
    fn test_session_json_camel_case() {
        let session = Session::new("hello", "/work");
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["runId"], session.run_id);
        assert_eq!(json["workingDir"], "/work");
        assert_eq!(json["status"], "starting");
    }
}
