//! Shared fixtures: a scripted agent behind the launcher seam

#![allow(dead_code)]

use a3s_session::{
    AgentControl, AgentExit, AgentHandle, AgentLauncher, BusEvent, ConversationEvent,
    DaemonConfig, EventBus, LaunchSpec, Result, SessionManager, SqliteStore, Subscription,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

/// Launcher whose agents are driven by the test
pub struct ScriptedLauncher {
    started: mpsc::UnboundedSender<AgentScript>,
    queue: Mutex<mpsc::UnboundedReceiver<AgentScript>>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        let (started, queue) = mpsc::unbounded_channel();
        Self {
            started,
            queue: Mutex::new(queue),
        }
    }

    /// The next agent launched, in launch order
    pub async fn next_agent(&self) -> AgentScript {
        let mut queue = self.queue.lock().await;
        tokio::time::timeout(Duration::from_secs(5), queue.recv())
            .await
            .expect("no agent launched within 5s")
            .expect("launcher dropped")
    }
}

#[async_trait]
impl AgentLauncher for ScriptedLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<AgentHandle> {
        let (mut writer, reader) = tokio::io::duplex(64 * 1024);
        let (lines, mut line_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (exit_tx, exit_rx) = oneshot::channel();
        let stop = CancellationToken::new();

        // Closing the writer is the agent's stdout reaching EOF
        let forward_stop = stop.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = forward_stop.cancelled() => break,
                    line = line_rx.recv() => match line {
                        Some(line) => {
                            if writer.write_all(&line).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        let _ = self.started.send(AgentScript {
            spec: spec.clone(),
            lines: Some(lines),
            exit: Some(exit_tx),
            stop: stop.clone(),
        });

        Ok(AgentHandle {
            stdout: Box::new(reader),
            control: Box::new(ScriptedControl {
                exit: Some(exit_rx),
                stop,
            }),
        })
    }
}

/// Test side of one scripted agent
pub struct AgentScript {
    pub spec: LaunchSpec,
    lines: Option<mpsc::UnboundedSender<Vec<u8>>>,
    exit: Option<oneshot::Sender<AgentExit>>,
    stop: CancellationToken,
}

impl AgentScript {
    /// Write one NDJSON record to the agent's stdout
    pub fn send(&self, record: Value) {
        self.send_raw(&record.to_string());
    }

    pub fn send_raw(&self, line: &str) {
        self.send_bytes(format!("{line}\n").as_bytes());
    }

    /// Write bytes to the agent's stdout as they are, newline included
    pub fn send_bytes(&self, bytes: &[u8]) {
        if let Some(lines) = &self.lines {
            let _ = lines.send(bytes.to_vec());
        }
    }

    /// Close stdout and exit with `code`
    pub fn finish(&mut self, code: i32) {
        self.lines.take();
        if let Some(exit) = self.exit.take() {
            let _ = exit.send(AgentExit {
                success: code == 0,
                code: Some(code),
            });
        }
    }

    /// Whether the daemon signalled or killed this agent
    pub fn was_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}

struct ScriptedControl {
    exit: Option<oneshot::Receiver<AgentExit>>,
    stop: CancellationToken,
}

const SIGNALLED: AgentExit = AgentExit {
    success: false,
    code: None,
};

#[async_trait]
impl AgentControl for ScriptedControl {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn terminate(&mut self) -> Result<()> {
        self.stop.cancel();
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        self.stop.cancel();
        Ok(())
    }

    async fn wait(&mut self) -> Result<AgentExit> {
        let Some(exit) = self.exit.as_mut() else {
            return Ok(SIGNALLED);
        };
        let status = tokio::select! {
            status = exit => status.unwrap_or(SIGNALLED),
            _ = self.stop.cancelled() => SIGNALLED,
        };
        self.exit = None;
        Ok(status)
    }
}

/// A manager over a fresh database in a temp dir
pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<SqliteStore>,
    pub bus: EventBus,
    pub launcher: Arc<ScriptedLauncher>,
    pub manager: SessionManager,
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let config = DaemonConfig {
            interrupt_grace: Duration::from_millis(500),
            ..DaemonConfig::with_database(dir.path().join("daemon.db"))
        };
        let store = Arc::new(SqliteStore::open(&config.database_path).unwrap());
        let bus = EventBus::new(config.subscriber_buffer);
        let launcher = Arc::new(ScriptedLauncher::new());
        let manager = SessionManager::new(
            store.clone(),
            bus.clone(),
            Arc::new(config),
            launcher.clone(),
        );
        Self {
            dir,
            store,
            bus,
            launcher,
            manager,
        }
    }

    pub fn working_dir(&self) -> String {
        self.dir.path().to_string_lossy().into_owned()
    }

    pub fn tool_event(&self, session_id: &str, tool_id: &str) -> ConversationEvent {
        self.store
            .get_tool_call(session_id, tool_id)
            .unwrap()
            .unwrap_or_else(|| panic!("tool call {tool_id} not ingested"))
    }
}

/// Poll `check` until it holds, failing after 5s
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Everything currently buffered for a subscription
pub fn drain(sub: &mut Subscription) -> Vec<BusEvent> {
    std::iter::from_fn(|| sub.try_recv()).collect()
}

// ─── Stream records ──────────────────────────────────────────────

pub fn init(claude_session_id: &str, model: &str) -> Value {
    json!({
        "type": "system",
        "subtype": "init",
        "session_id": claude_session_id,
        "model": model,
    })
}

pub fn assistant_text(claude_session_id: &str, text: &str) -> Value {
    json!({
        "type": "assistant",
        "session_id": claude_session_id,
        "message": {
            "role": "assistant",
            "content": [{"type": "text", "text": text}],
            "usage": {"input_tokens": 10, "output_tokens": 3, "cache_read_input_tokens": 90},
        },
    })
}

pub fn tool_use(claude_session_id: &str, id: &str, name: &str, input: Value) -> Value {
    json!({
        "type": "assistant",
        "session_id": claude_session_id,
        "message": {
            "role": "assistant",
            "content": [{"type": "tool_use", "id": id, "name": name, "input": input}],
        },
    })
}

pub fn tool_result(claude_session_id: &str, tool_use_id: &str, content: &str) -> Value {
    json!({
        "type": "user",
        "session_id": claude_session_id,
        "message": {
            "role": "user",
            "content": [{"type": "tool_result", "tool_use_id": tool_use_id, "content": content}],
        },
    })
}

pub fn result(claude_session_id: &str, is_error: bool) -> Value {
    json!({
        "type": "result",
        "subtype": if is_error { "error" } else { "success" },
        "session_id": claude_session_id,
        "is_error": is_error,
        "total_cost_usd": 0.12,
        "duration_ms": 2400,
        "num_turns": 2,
        "result": "done",
    })
}
