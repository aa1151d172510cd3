//! Daemon configuration
//!
//! Built once at startup and shared read-only as `Arc<DaemonConfig>`.

use crate::error::{Result, SessionError};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variables passed through to agent subprocesses
pub const DEFAULT_ENV_ALLOWLIST: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "SHELL",
    "TERM",
    "LANG",
    "LC_ALL",
    "LC_CTYPE",
    "COLORTERM",
    "EDITOR",
    "VISUAL",
    "PAGER",
    "LESS",
    "TMPDIR",
    "TZ",
    "XDG_RUNTIME_DIR",
];

/// Immutable daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DaemonConfig {
    /// SQLite database file
    pub database_path: PathBuf,

    /// Agent CLI executable
    pub agent_binary: PathBuf,

    /// Environment variables inherited by agent subprocesses
    pub env_allowlist: Vec<String>,

    /// `TERM` value used when the daemon's environment has none
    pub default_term: String,

    /// Per-subscriber event buffer capacity
    pub subscriber_buffer: usize,

    /// Time between graceful interrupt and forced kill
    #[serde(with = "millis")]
    pub interrupt_grace: Duration,

    /// Age after which an uncorrelated pending approval counts as orphaned
    #[serde(with = "millis")]
    pub orphan_threshold: Duration,

    /// Daemon socket advertised to MCP servers
    pub daemon_socket: Option<PathBuf>,

    /// Attempts for correlation writes that hit store contention
    pub correlation_retries: u32,

    /// Initial backoff between correlation attempts (doubles per attempt)
    #[serde(with = "millis")]
    pub correlation_backoff: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("daemon.db"),
            agent_binary: PathBuf::from("claude"),
            env_allowlist: DEFAULT_ENV_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
            default_term: "xterm-256color".to_string(),
            subscriber_buffer: 64,
            interrupt_grace: Duration::from_secs(5),
            orphan_threshold: Duration::from_secs(300),
            daemon_socket: None,
            correlation_retries: 3,
            correlation_backoff: Duration::from_millis(50),
        }
    }
}

impl DaemonConfig {
    /// Config rooted at a database path, other fields defaulted
    pub fn with_database(path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: path.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.subscriber_buffer == 0 {
            return Err(SessionError::Validation(
                "subscriber_buffer must be greater than zero".into(),
            ));
        }
        if self.agent_binary.as_os_str().is_empty() {
            return Err(SessionError::Validation("agent_binary must be set".into()));
        }
        if self.correlation_retries == 0 {
            return Err(SessionError::Validation(
                "correlation_retries must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Sanitized environment for an agent subprocess
    ///
    /// Only allowlisted variables present in `source` pass through, and
    /// values that are not valid UTF-8 are dropped; `TERM` falls back to
    /// `default_term`.
    pub fn agent_env<I, K, V>(&self, source: I) -> Vec<(String, String)>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        let mut env: Vec<(String, String)> = source
            .into_iter()
            .filter_map(|(k, v)| {
                let key = k.into().into_string().ok()?;
                if !self.env_allowlist.iter().any(|allowed| *allowed == key) {
                    return None;
                }
                match v.into().into_string() {
                    Ok(value) => Some((key, value)),
                    Err(_) => {
                        tracing::warn!(key = %key, "Dropping non-UTF-8 environment variable");
                        None
                    }
                }
            })
            .collect();
        if !env.iter().any(|(k, v)| k == "TERM" && !v.is_empty()) {
            env.retain(|(k, _)| k != "TERM");
            env.push(("TERM".to_string(), self.default_term.clone()));
        }
        env.sort();
        env
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
