//! Agent subprocess seam
//!
//! `AgentLauncher` starts an agent for a session and hands back its stdout
//! plus an `AgentControl` for signalling and reaping it. `CliLauncher` runs
//! the real agent CLI; tests substitute a scripted launcher.

use crate::error::{Result, SessionError};
use crate::types::{McpServer, Session};
use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

/// Everything needed to start one agent run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchSpec {
    pub session_id: String,
    pub run_id: String,
    pub query: String,
    /// Agent conversation to resume from
    pub resume_session_id: Option<String>,
    pub model: Option<String>,
    pub working_dir: PathBuf,
    pub mcp_servers: Vec<McpServer>,
    pub permission_prompt_tool: Option<String>,
    pub max_turns: Option<i64>,
    pub system_prompt: Option<String>,
    pub append_system_prompt: Option<String>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub additional_directories: Vec<String>,
    /// Complete environment of the subprocess
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    /// Spec for a stored session, resuming its parent's conversation if given
    pub fn for_session(
        session: &Session,
        resume_session_id: Option<String>,
        mcp_servers: Vec<McpServer>,
        env: Vec<(String, String)>,
    ) -> Self {
        let mut env = env;
        if session.proxy.enabled {
            if let Some(url) = &session.proxy.base_url {
                env.push(("ANTHROPIC_BASE_URL".into(), url.clone()));
            }
            if let Some(key) = &session.proxy.api_key {
                env.push(("ANTHROPIC_API_KEY".into(), key.clone()));
            }
        }

        Self {
            session_id: session.id.clone(),
            run_id: session.run_id.clone(),
            query: session.query.clone(),
            resume_session_id,
            model: session
                .proxy
                .model_override
                .clone()
                .filter(|_| session.proxy.enabled)
                .or_else(|| session.model.clone()),
            working_dir: PathBuf::from(&session.working_dir),
            mcp_servers,
            permission_prompt_tool: session.permission_prompt_tool.clone(),
            max_turns: session.max_turns,
            system_prompt: session.system_prompt.clone(),
            append_system_prompt: session.append_system_prompt.clone(),
            allowed_tools: session.allowed_tools.clone(),
            disallowed_tools: session.disallowed_tools.clone(),
            additional_directories: session.additional_directories.clone(),
            env,
        }
    }

    /// Give every MCP server the run id and, if known, the daemon socket
    pub fn inject_mcp_env(&mut self, daemon_socket: Option<&str>) {
        for server in &mut self.mcp_servers {
            server
                .env
                .insert("HUMANLAYER_RUN_ID".into(), self.run_id.clone());
            if let Some(socket) = daemon_socket {
                server
                    .env
                    .insert("HUMANLAYER_DAEMON_SOCKET".into(), socket.to_string());
            }
        }
    }

    /// `{"mcpServers": {...}}` document passed via `--mcp-config`
    pub fn mcp_config_json(&self) -> serde_json::Value {
        let servers: BTreeMap<&str, serde_json::Value> = self
            .mcp_servers
            .iter()
            .map(|s| {
                (
                    s.name.as_str(),
                    json!({ "command": s.command, "args": s.args, "env": s.env }),
                )
            })
            .collect();
        json!({ "mcpServers": servers })
    }

    /// Agent CLI arguments; `mcp_config` is the path of the written MCP config
    pub fn args(&self, mcp_config: Option<&str>) -> Vec<String> {
        let mut args = vec!["--print".to_string(), self.query.clone()];

        if let Some(id) = &self.resume_session_id {
            args.extend(["--resume".into(), id.clone()]);
        }
        if let Some(model) = &self.model {
            args.extend(["--model".into(), model.clone()]);
        }
        args.extend([
            "--output-format".into(),
            "stream-json".into(),
            "--verbose".into(),
        ]);
        if let Some(path) = mcp_config {
            args.extend(["--mcp-config".into(), path.to_string()]);
        }
        if let Some(tool) = &self.permission_prompt_tool {
            args.extend(["--permission-prompt-tool".into(), tool.clone()]);
        }
        if let Some(turns) = self.max_turns.filter(|t| *t > 0) {
            args.extend(["--max-turns".into(), turns.to_string()]);
        }
        if let Some(prompt) = &self.system_prompt {
            args.extend(["--system-prompt".into(), prompt.clone()]);
        }
        if let Some(prompt) = &self.append_system_prompt {
            args.extend(["--append-system-prompt".into(), prompt.clone()]);
        }
        if !self.allowed_tools.is_empty() {
            args.extend(["--allowedTools".into(), self.allowed_tools.join(",")]);
        }
        if !self.disallowed_tools.is_empty() {
            args.extend(["--disallowedTools".into(), self.disallowed_tools.join(",")]);
        }
        for dir in &self.additional_directories {
            args.extend(["--add-dir".into(), dir.clone()]);
        }
        args
    }
}

/// How an agent process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentExit {
    pub success: bool,
    pub code: Option<i32>,
}

impl std::fmt::Display for AgentExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code),
            None => f.write_str("terminated by signal"),
        }
    }
}

/// Signalling and reaping for a running agent
#[async_trait]
pub trait AgentControl: Send {
    fn pid(&self) -> Option<u32>;

    /// Ask the agent to stop gracefully
    fn terminate(&mut self) -> Result<()>;

    /// Force the agent to stop
    async fn kill(&mut self) -> Result<()>;

    /// Wait for the agent to exit
    async fn wait(&mut self) -> Result<AgentExit>;
}

/// A started agent
pub struct AgentHandle {
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub control: Box<dyn AgentControl>,
}

/// Factory for agent processes
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<AgentHandle>;
}

/// Launches the agent CLI as a child process
#[derive(Debug, Clone)]
pub struct CliLauncher {
    binary: PathBuf,
}

impl CliLauncher {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn write_mcp_config(spec: &LaunchSpec) -> Result<tempfile::NamedTempFile> {
        let mut file = tempfile::Builder::new()
            .prefix("mcp-config-")
            .suffix(".json")
            .tempfile()?;
        serde_json::to_writer(&mut file, &spec.mcp_config_json())?;
        file.flush()?;
        Ok(file)
    }
}

#[async_trait]
impl AgentLauncher for CliLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<AgentHandle> {
        let mcp_config = if spec.mcp_servers.is_empty() {
            None
        } else {
            Some(Self::write_mcp_config(spec)?)
        };
        let mcp_path = mcp_config
            .as_ref()
            .map(|f| f.path().to_string_lossy().into_owned());

        let mut cmd = Command::new(&self.binary);
        cmd.args(spec.args(mcp_path.as_deref()))
            .current_dir(&spec.working_dir)
            .env_clear()
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| SessionError::Process {
            session_id: spec.session_id.clone(),
            msg: format!("failed to spawn {}: {}", self.binary.display(), e),
        })?;

        let stdout = child.stdout.take().ok_or_else(|| SessionError::Process {
            session_id: spec.session_id.clone(),
            msg: "agent stdout was not captured".into(),
        })?;

        if let Some(stderr) = child.stderr.take() {
            let session_id = spec.session_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(session_id = %session_id, line = %line, "Agent stderr");
                }
            });
        }

        tracing::info!(
            session_id = %spec.session_id,
            pid = ?child.id(),
            binary = %self.binary.display(),
            resume = ?spec.resume_session_id,
            "Agent process started"
        );

        Ok(AgentHandle {
            stdout: Box::new(stdout),
            control: Box::new(ChildControl {
                child,
                _mcp_config: mcp_config,
            }),
        })
    }
}

/// `AgentControl` over a tokio child process
struct ChildControl {
    child: Child,
    // Removed from disk when the process handle goes away
    _mcp_config: Option<tempfile::NamedTempFile>,
}

#[async_trait]
impl AgentControl for ChildControl {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn terminate(&mut self) -> Result<()> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if let Some(pid) = self.child.id() {
                kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
                    .map_err(|e| SessionError::Io(std::io::Error::from(e)))?;
            }
            Ok(())
        }
        #[cfg(not(unix))]
        {
            self.child.start_kill()?;
            Ok(())
        }
    }

    async fn kill(&mut self) -> Result<()> {
        match self.child.kill().await {
            Ok(()) => Ok(()),
            // Already reaped
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn wait(&mut self) -> Result<AgentExit> {
        let status = self.child.wait().await?;
        Ok(AgentExit {
            success: status.success(),
            code: status.code(),
        })
    }
}
