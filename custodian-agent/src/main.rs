//! Custodian device agent
//!
//! Keeps this device's lock state in line with the remote authority:
//! heartbeats on a schedule, queues reports while offline and reasserts the
//! last known enforcement on every start.
//!
//! Usage:
//!   custodian-agent --server-url https://authority.example.com --api-key KEY
//!   custodian-agent --identity 3f9c2a71-device --data-dir /var/lib/custodian

use anyhow::{Context, Result};
use clap::Parser;
use custodian_agent::{HostCollector, StatusFileExecutor};
use custodian_storage::{DurableStore, SqliteStore};
use custodian_sync::{
    AgentEvent, AgentParts, HttpClientConfig, HttpRemoteClient, StoreLocation, SyncConfig,
    create_agent,
};
use custodian_types::{Clock, SystemClock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "custodian-agent")]
#[command(about = "Custodian device management agent")]
struct Args {
    /// Directory for the agent's databases and status file
    #[arg(short, long, default_value = "custodian-data")]
    data_dir: PathBuf,

    /// JSON engine configuration; unset fields take defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Base URL of the remote authority
    #[arg(long, default_value = "http://127.0.0.1:8000")]
    server_url: String,

    /// Per-device API key
    #[arg(long)]
    api_key: Option<String>,

    /// Register this device identity; ignored when it is already stored
    #[arg(long)]
    identity: Option<String>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .compact()
        .init();

    info!("Custodian agent starting...");
    let config = load_config(args.config.as_deref())?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("failed to create {}", args.data_dir.display()))?;
    let data_dir = args.data_dir.as_path();
    let io_timeout = config.heartbeat_timeout();

    let remote = HttpRemoteClient::new(HttpClientConfig {
        base_url: args.server_url.clone(),
        api_key: args.api_key.clone(),
        request_timeout_secs: config.heartbeat_timeout_secs,
        ..Default::default()
    })?;

    let parts = AgentParts {
        lock_store: open_store(data_dir, "lock.db", io_timeout)?,
        queue_store: open_store(data_dir, "queue.db", io_timeout)?,
        identity_primary: StoreLocation::new(
            "identity",
            open_store(data_dir, "identity.db", io_timeout)?,
        ),
        identity_backups: vec![
            StoreLocation::new(
                "backup-1",
                open_store(data_dir, "backup/identity-1.db", io_timeout)?,
            ),
            StoreLocation::new(
                "backup-2",
                open_store(data_dir, "backup/identity-2.db", io_timeout)?,
            ),
        ],
        remote: Arc::new(remote),
        collector: Arc::new(HostCollector::new(clock.clone())),
        executor: Arc::new(StatusFileExecutor::new(
            data_dir.join("enforcement.json"),
            clock.clone(),
        )),
        clock,
        config,
    };

    let (handle, events, commands, agent) = match create_agent(parts) {
        Ok(built) => built,
        Err(e) => {
            error!("Cannot restore lock state: {e}");
            return Err(e).context("agent startup failed");
        }
    };
    tokio::spawn(log_events(events));

    let mut runner = tokio::spawn(agent.run(commands));

    if let Some(identity) = args.identity {
        let registered = handle
            .ensure_registered(&identity)
            .await
            .context("device registration failed")?;
        if registered {
            info!("Device identity registered");
        }
    }

    tokio::select! {
        result = &mut runner => {
            result.context("agent task panicked")??;
            return Ok(());
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            info!("Shutdown requested");
        }
    }

    handle.shutdown().await?;
    runner.await.context("agent task panicked")??;
    info!("Custodian agent stopped");
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    let Some(path) = path else {
        return Ok(SyncConfig::default());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    SyncConfig::from_json(&json).with_context(|| format!("invalid config {}", path.display()))
}

fn open_store(dir: &Path, name: &str, busy_timeout: Duration) -> Result<Arc<dyn DurableStore>> {
    let path = dir.join(name);
    let store = SqliteStore::open_with_timeout(&path, busy_timeout)
        .with_context(|| format!("failed to open {}", path.display()))?;
    Ok(Arc::new(store))
}

async fn log_events(mut events: mpsc::Receiver<AgentEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            AgentEvent::BootCompleted { mode, reasserted } => {
                info!("Boot reconciliation done: {mode} (reasserted: {reasserted})");
            }
            AgentEvent::LockChanged(state) => {
                info!("Lock state: {} ({})", state.mode, state.reason_category);
            }
            AgentEvent::Deactivated { confirmed } => {
                warn!("Device deactivated (authority confirmed: {confirmed})");
            }
            AgentEvent::IdentityRepaired(report) => {
                warn!("Identity copies repaired: {:?}", report.repaired);
            }
            AgentEvent::RecordsFailed { count } => {
                warn!("{count} queued report(s) exhausted their retries");
            }
        }
    }
}
