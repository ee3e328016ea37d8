/// Collector daemon: interleaves discovery passes and collection cycles
/// on a one-second tick until a shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use labwatch_core::config::Config;
use labwatch_core::queue::MessageBus;
use labwatch_core::scheduler::AdaptiveScheduler;
use labwatch_core::store::Store;

use labwatch_collector::collect::Orchestrator;
use labwatch_collector::discovery::Discovery;
use labwatch_collector::pool::{SessionPool, SshSettings};

/// Idle-session sweep cadence.
const POOL_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "labwatch-collector", about = "LabWatch fleet telemetry collector")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/labwatch.toml")]
    config: PathBuf,
}

fn due(last: Option<Instant>, interval: Duration) -> bool {
    match last {
        None => true,
        Some(at) => at.elapsed() >= interval,
    }
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

    info!(
        db = %config.db.dsn,
        scan_interval = config.scan.interval_seconds,
        collection_interval = config.collection.interval_seconds,
        "collector starting"
    );

    let store = Arc::new(Store::open(&config.db.dsn)?);

    let bus = match MessageBus::connect(&config.broker).await {
        Ok(bus) => Some(Arc::new(bus)),
        Err(e) => {
            warn!(error = %e, "message queue unavailable, falling back to direct store writes");
            None
        }
    };

    let ssh_settings = SshSettings {
        user: config.ssh.user.clone(),
        key_path: PathBuf::from(&config.ssh.private_key),
        port: config.ssh.port,
        timeout: Duration::from_secs(config.ssh.timeout_secs),
    };
    let pool = Arc::new(SessionPool::with_defaults(ssh_settings));
    let scheduler = Arc::new(AdaptiveScheduler::new());

    let discovery = Discovery {
        store: Arc::clone(&store),
        pool: Arc::clone(&pool),
        bus: bus.clone(),
        probe_timeout: Duration::from_secs(config.ssh.timeout_secs),
        ssh_port: config.ssh.port,
    };
    let orchestrator = Orchestrator {
        store: Arc::clone(&store),
        pool: Arc::clone(&pool),
        bus: bus.clone(),
        scheduler: Arc::clone(&scheduler),
        max_workers: config.collection.max_workers,
        probe_timeout: Duration::from_secs(config.ssh.timeout_secs),
    };

    // Shutdown signal: SIGINT or SIGTERM trips the token; the loop drains
    // in-flight work and exits cleanly.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("shutdown signal received");
            cancel.cancel();
        });
    }

    let scan_interval = Duration::from_secs(config.scan.interval_seconds);
    let collection_interval = Duration::from_secs(config.collection.interval_seconds);

    let mut last_scan: Option<Instant> = None;
    let mut last_collection: Option<Instant> = None;
    let mut last_cleanup: Option<Instant> = Some(Instant::now());
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    let mut cycle = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }

        if due(last_scan, scan_interval) {
            if let Err(e) = discovery.run_scan().await {
                error!(error = %e, "discovery pass failed");
            }
            last_scan = Some(Instant::now());
        }

        if cancel.is_cancelled() {
            break;
        }

        if due(last_collection, collection_interval) {
            cycle += 1;
            match orchestrator.run_cycle(&cancel).await {
                Ok(summary) => {
                    let stats = scheduler.stats();
                    info!(
                        cycle = cycle,
                        succeeded = summary.succeeded,
                        failed = summary.failed,
                        healthy = stats.healthy,
                        degraded = stats.degraded,
                        offline = stats.offline,
                        dead = stats.dead,
                        success_rate = format!("{:.1}%", stats.success_rate * 100.0),
                        "cycle finished"
                    );
                }
                Err(e) => error!(error = %e, "collection cycle failed"),
            }
            last_collection = Some(Instant::now());
        }

        if due(last_cleanup, POOL_CLEANUP_INTERVAL) {
            pool.cleanup_idle().await;
            let stats = pool.stats().await;
            info!(
                sessions = stats.active_connections,
                utilization = format!("{:.1}%", stats.utilization_percent),
                "session pool"
            );
            last_cleanup = Some(Instant::now());
        }
    }

    info!("shutting down");
    pool.close_all().await;
    info!("collector stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
