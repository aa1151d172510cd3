//! Error types for a3s-session

use thiserror::Error;

/// Errors that can occur in the session control plane
#[derive(Debug, Error)]
pub enum SessionError {
    /// A referenced approval, event, or draft is absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// A referenced session is absent
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Requested state change violates the session state machine
    #[error("Invalid status transition from '{from}' to '{to}'")]
    InvalidTransition { from: String, to: String },

    /// Decide called on an approval that is no longer pending
    #[error("Approval already decided: {0}")]
    AlreadyDecided(String),

    /// Input fails the operation contract
    #[error("Validation error: {0}")]
    Validation(String),

    /// Two writers raced on the same conversation sequence
    #[error("Duplicate sequence {sequence} for session '{session_id}'")]
    DuplicateSequence { session_id: String, sequence: i64 },

    /// Store contention or transient I/O
    #[error("Transient error: {0}")]
    Transient(String),

    /// Programming bug or corrupt state
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// Agent subprocess failure
    #[error("Agent process error for session '{session_id}': {msg}")]
    Process { session_id: String, msg: String },

    /// Embedded database failure
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Filesystem or pipe failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error taxonomy used to decide propagation and retry behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidTransition,
    AlreadyDecided,
    Validation,
    Transient,
    Fatal,
}

impl SessionError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::SessionNotFound(_) => ErrorKind::NotFound,
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::AlreadyDecided(_) => ErrorKind::AlreadyDecided,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Transient(_) => ErrorKind::Transient,
            Self::Storage(e) => match e.sqlite_error_code() {
                Some(rusqlite::ErrorCode::DatabaseBusy)
                | Some(rusqlite::ErrorCode::DatabaseLocked) => ErrorKind::Transient,
                _ => ErrorKind::Fatal,
            },
            Self::Io(_) => ErrorKind::Transient,
            Self::DuplicateSequence { .. }
            | Self::Fatal(_)
            | Self::Process { .. }
            | Self::Serialization(_) => ErrorKind::Fatal,
        }
    }

    /// Whether the operation may be retried with backoff
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub(crate) fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;
