//! Device statistics agent.
//!
//! `run` starts the background sync loop until Ctrl+C. On Unix, `SIGUSR1`
//! marks the network as restored and `SIGUSR2` marks it as down. `status`
//! prints the checkpoint, queued jobs and the next decision as JSON.
//!
//! Diagnostics go to stderr; `RUST_LOG` overrides the default filter.

use anyhow::Context;
use clap::{Parser, Subcommand};
use device_stats::config::StatsConfig;
use device_stats::identity::{
    ConfiguredConnectivity, ConfiguredIdentity, Connectivity, DeviceIdentity,
};
use device_stats::scheduler::dispatcher::{SyncPolicy, evaluate};
use device_stats::scheduler::runner::JOB_QUEUE_FILE;
use device_stats::scheduler::{Action, StatsAgent, Trigger, now_epoch_millis};
use device_stats::CheckpointStore;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "device-stats-agent")]
#[command(about = "Periodic anonymized device statistics reporter")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,

    /// Path to config TOML (default: the platform config directory).
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the sync loop until interrupted.
    Run,
    /// Print sync state as JSON.
    Status,
    /// Write the default config file and exit.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("device_stats=info")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(StatsConfig::default_config_path);

    match cli.cmd {
        Command::InitConfig { force } => init_config(&config_path, force),
        Command::Status => {
            let config = load_config(&config_path, cli.config.is_some())?;
            status(&config)
        }
        Command::Run => {
            let config = load_config(&config_path, cli.config.is_some())?;
            run(&config).await
        }
    }
}

fn load_config(path: &std::path::Path, explicit: bool) -> anyhow::Result<StatsConfig> {
    if !explicit && !path.exists() {
        tracing::info!("no config at {}, using defaults", path.display());
        return Ok(StatsConfig::default());
    }
    let config = StatsConfig::from_file(path)
        .with_context(|| format!("loading config {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn init_config(path: &std::path::Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    StatsConfig::default().save_to_file(path)?;
    println!("{}", path.display());
    Ok(())
}

fn status(config: &StatsConfig) -> anyhow::Result<()> {
    let state_dir = config.state_dir();
    let store =
        CheckpointStore::for_state_dir(&state_dir).with_max_job_id(config.schedule.max_job_id);
    let checkpoint = store.read();
    let identity = ConfiguredIdentity::from_config(&config.device);
    let now = now_epoch_millis();

    let next = match evaluate(
        now,
        &checkpoint,
        &identity.current_app_version(),
        &SyncPolicy::from(&config.schedule),
    ) {
        Action::RunNow(kind) => serde_json::json!({ "run_now": kind }),
        Action::ScheduleAt(at) => serde_json::json!({
            "schedule_at": at,
            "schedule_at_utc": chrono::DateTime::from_timestamp_millis(at).map(|t| t.to_rfc3339()),
        }),
    };

    let queue_path = state_dir.join(JOB_QUEUE_FILE);
    let queue: serde_json::Value = match std::fs::read(&queue_path) {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null),
        Err(_) => serde_json::Value::Null,
    };

    let report = serde_json::json!({
        "state_dir": state_dir,
        "checkpoint": checkpoint,
        "job_queue": queue,
        "next": next,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run(config: &StatsConfig) -> anyhow::Result<()> {
    let identity = Arc::new(ConfiguredIdentity::from_config(&config.device));
    let connectivity = Arc::new(ConfiguredConnectivity::from_config(&config.device));

    let agent = StatsAgent::from_config(config, identity, Arc::clone(&connectivity) as Arc<dyn Connectivity>)
        .context("building stats agent")?;
    let triggers = agent.triggers();
    let task = agent.run();

    #[cfg(unix)]
    spawn_connectivity_signals(Arc::clone(&connectivity), triggers.clone())?;

    triggers
        .send(Trigger::Boot)
        .map_err(|_| anyhow::anyhow!("agent loop exited before boot"))?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl+C")?;
    tracing::info!("received Ctrl+C, shutting down...");
    let _ = triggers.send(Trigger::Shutdown);
    task.await.context("agent loop panicked")?;
    Ok(())
}

#[cfg(unix)]
fn spawn_connectivity_signals(
    connectivity: Arc<ConfiguredConnectivity>,
    triggers: tokio::sync::mpsc::UnboundedSender<Trigger>,
) -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut restored = signal(SignalKind::user_defined1()).context("installing SIGUSR1 handler")?;
    let mut lost = signal(SignalKind::user_defined2()).context("installing SIGUSR2 handler")?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(()) = restored.recv() => {
                    connectivity.set_online(true);
                    if triggers.send(Trigger::ConnectivityRestored).is_err() {
                        break;
                    }
                }
                Some(()) = lost.recv() => {
                    tracing::info!("network marked offline");
                    connectivity.set_online(false);
                }
                else => break,
            }
        }
    });
    Ok(())
}
