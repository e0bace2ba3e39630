//! Fleet Daemon
//!
//! Hosts the agent orchestration core: loads configuration and the task
//! registry, starts the reaper, and tears the fleet down on shutdown. The
//! management operations are served to whatever transport embeds
//! [`fleet_daemon::orchestrator::Orchestrator`].

use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use fleet_daemon::orchestrator::Orchestrator;

#[derive(Parser, Debug)]
#[command(name = "fleet-daemon")]
#[command(version, about = "Fleet daemon - agent subprocess orchestrator")]
struct Args {
    /// Path to the wrapped agent CLI binary
    #[arg(long, env = "FLEET_AGENT_BIN")]
    agent_bin: Option<PathBuf>,

    /// Task registry document path
    #[arg(long, env = "FLEET_TASKS_FILE")]
    tasks_file: Option<PathBuf>,

    /// Directory for background task log files
    #[arg(long, env = "FLEET_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Maximum concurrently running agents
    #[arg(long, env = "FLEET_MAX_AGENTS")]
    max_agents: Option<usize>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "FLEET_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "FLEET_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = fleet_core::config::load_config()?;
    if let Some(agent_bin) = args.agent_bin {
        config.daemon.agent_bin = agent_bin;
    }
    if let Some(tasks_file) = args.tasks_file {
        config.daemon.tasks_file = Some(tasks_file);
    }
    if let Some(log_dir) = args.log_dir {
        config.daemon.log_dir = Some(log_dir);
    }
    if let Some(max_agents) = args.max_agents {
        config.limits.max_agents = max_agents;
    }
    config.daemon.log_level = args.log_level;
    config.validate()?;

    let log_filter = format!(
        "fleet_daemon={level},fleet_core={level}",
        level = config.daemon.log_level
    );
    fleet_core::tracing_init::init_tracing(&log_filter, args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        agent_bin = %config.daemon.agent_bin.display(),
        max_agents = config.limits.max_agents,
        "Starting fleet-daemon"
    );

    let orchestrator = Orchestrator::new(config);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let reaper = orchestrator.spawn_reaper(shutdown_rx);

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // Notify systemd that the daemon is ready (unix only). The `true`
    // parameter unsets $NOTIFY_SOCKET so agent subprocesses don't
    // accidentally notify systemd.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    info!(instance_id = %orchestrator.instance_id(), "Orchestrator ready");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    orchestrator.shutdown().await;
    let _ = reaper.await;

    info!("Daemon stopped");
    Ok(())
}
