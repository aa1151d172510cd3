//! # a3s-session
//!
//! Local control plane for coding-agent sessions.
//!
//! ## Overview
//!
//! `a3s-session` launches agent CLI subprocesses, ingests their
//! newline-delimited JSON output into a durable per-session conversation log,
//! correlates asynchronous tool-use permission requests with the tool calls
//! they gate, and fans session events out to filtered subscribers.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a3s_session::{
//!     CliLauncher, DaemonConfig, EventBus, LaunchRequest, SessionManager, SqliteStore,
//!     SubscriptionFilter,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> a3s_session::Result<()> {
//! let config = Arc::new(DaemonConfig::with_database("/tmp/a3s/daemon.db"));
//! let store = Arc::new(SqliteStore::open(&config.database_path)?);
//! let bus = EventBus::new(config.subscriber_buffer);
//! let manager = SessionManager::new(
//!     store,
//!     bus,
//!     config.clone(),
//!     Arc::new(CliLauncher::new(&config.agent_binary)),
//! );
//!
//! let session = manager.launch(LaunchRequest::new("fix the failing test", "/src/app"))?;
//!
//! let mut events = manager.subscribe(
//!     SubscriptionFilter::for_session(&session.id),
//!     CancellationToken::new(),
//! );
//! while let Some(event) = events.recv().await {
//!     println!("{}: {:?}", event.event_type, event.data);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **SqliteStore** — durable sessions, conversation events, approvals
//! - **EventBus** — filtered, non-blocking fan-out to subscribers
//! - **Supervisor** — one agent subprocess and its ingestion loop
//! - **ApprovalManager** — approval lifecycle and tool-call correlation
//! - **SessionManager** — registry, launch/continue/interrupt, recovery

pub mod agent;
pub mod approval;
pub mod bus;
pub mod config;
pub mod error;
pub mod manager;
pub mod store;
pub mod stream;
pub mod supervisor;
pub mod types;

// Re-export core types
pub use agent::{AgentControl, AgentExit, AgentHandle, AgentLauncher, CliLauncher, LaunchSpec};
pub use approval::ApprovalManager;
pub use bus::{BusEvent, BusEventType, EventBus, Subscription, SubscriptionFilter};
pub use config::DaemonConfig;
pub use error::{ErrorKind, Result, SessionError};
pub use manager::{
    ActiveSession, ContinueRequest, LaunchRequest, SessionManager, SettingsPatch,
};
pub use store::{SessionChange, SqliteStore};
pub use supervisor::SupervisorHandle;
pub use types::{
    Approval, ApprovalMetrics, ApprovalStatus, ConversationEvent, ConversationEventType,
    Decision, EventApprovalStatus, FileSnapshot, McpServer, ProxyConfig, RecentPath, Session,
    SessionFilter, SessionStatus, SessionUpdate, UserSettings,
};
