use std::path::PathBuf;
use std::sync::Arc;

use a3s_session::{CliLauncher, DaemonConfig, EventBus, Result, SessionManager, SqliteStore};
use clap::Parser;

#[derive(Parser)]
#[command(
    name = "a3s-sessiond",
    about = "a3s-sessiond — local supervisor for coding-agent sessions"
)]
struct Cli {
    /// SQLite database file (default: ~/.a3s/sessions.db)
    #[arg(long, env = "A3S_SESSION_DB")]
    db: Option<PathBuf>,

    /// Agent CLI executable
    #[arg(long, env = "A3S_AGENT_BINARY", default_value = "claude")]
    agent_binary: PathBuf,

    /// Daemon socket advertised to MCP servers
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Seconds to wait for sessions to settle on shutdown
    #[arg(long, default_value_t = 10)]
    shutdown_grace: u64,
}

impl Cli {
    fn config(&self) -> DaemonConfig {
        let database_path = self.db.clone().unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".a3s")
                .join("sessions.db")
        });
        DaemonConfig {
            agent_binary: self.agent_binary.clone(),
            daemon_socket: self.socket.clone(),
            ..DaemonConfig::with_database(database_path)
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(cli).await {
        tracing::error!(error = %e, "a3s-sessiond failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Arc::new(cli.config());
    config.validate()?;

    let store = Arc::new(SqliteStore::open(&config.database_path)?);
    let bus = EventBus::new(config.subscriber_buffer);
    let launcher = Arc::new(CliLauncher::new(&config.agent_binary));
    let manager = SessionManager::new(store, bus, config.clone(), launcher);

    let recovered = manager.recover()?;
    tracing::info!(
        database = %config.database_path.display(),
        agent_binary = %config.agent_binary.display(),
        recovered,
        "a3s-sessiond ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    manager
        .shutdown(std::time::Duration::from_secs(cli.shutdown_grace))
        .await;
    Ok(())
}
