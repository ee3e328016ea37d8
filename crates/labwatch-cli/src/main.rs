/// One-shot discovery and heartbeat driver.
///
/// `scan` runs a full discovery pass over every department subnet;
/// `heartbeat` sweeps the active fleet over TCP and flips reachability
/// status. Both share the daemon's configuration file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};

use labwatch_core::config::Config;
use labwatch_core::queue::MessageBus;
use labwatch_core::store::Store;

use labwatch_collector::discovery::Discovery;
use labwatch_collector::pool::{SessionPool, SshSettings};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Command {
    /// Discover hosts on every department subnet
    Scan,
    /// Check reachability of active hosts and update their status
    Heartbeat,
}

#[derive(Parser, Debug)]
#[command(name = "labwatch-cli", about = "LabWatch discovery and heartbeat driver")]
struct Args {
    #[arg(value_enum)]
    command: Command,

    /// Path to configuration file
    #[arg(short, long, default_value = "config/labwatch.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config).map_err(|e| {
        error!("failed to load config {:?}: {}", args.config, e);
        e
    })?;

    let store = Arc::new(Store::open(&config.db.dsn)?);

    let bus = match MessageBus::connect(&config.broker).await {
        Ok(bus) => Some(Arc::new(bus)),
        Err(e) => {
            warn!(error = %e, "message queue unavailable, results go to the store only");
            None
        }
    };

    let pool = Arc::new(SessionPool::with_defaults(SshSettings {
        user: config.ssh.user.clone(),
        key_path: PathBuf::from(&config.ssh.private_key),
        port: config.ssh.port,
        timeout: Duration::from_secs(config.ssh.timeout_secs),
    }));

    let discovery = Discovery {
        store,
        pool: Arc::clone(&pool),
        bus,
        probe_timeout: Duration::from_secs(config.ssh.timeout_secs),
        ssh_port: config.ssh.port,
    };

    match args.command {
        Command::Scan => {
            info!("starting discovery scan");
            discovery.run_scan().await?;
            info!("scan completed");
        }
        Command::Heartbeat => {
            let (up, down) = discovery.heartbeat(config.collection.max_workers).await?;
            info!(up = up, down = down, "heartbeat completed");
        }
    }

    pool.close_all().await;
    Ok(())
}
