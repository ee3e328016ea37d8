/// Queue ingest worker: consumes one queue and writes to the store.
///
/// Run one process per queue; several workers may share the `metrics`
/// queue for parallel ingest.

mod ingest;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use labwatch_core::config::Config;
use labwatch_core::queue::MessageBus;
use labwatch_core::store::Store;
use labwatch_core::{QUEUE_ALERTS, QUEUE_DISCOVERY, QUEUE_METRICS};

use crate::ingest::IngestWorker;

/// Messages pulled per batch.
const PREFETCH: usize = 10;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum QueueArg {
    Metrics,
    Discovery,
    Alerts,
}

impl QueueArg {
    fn name(self) -> &'static str {
        match self {
            QueueArg::Metrics => QUEUE_METRICS,
            QueueArg::Discovery => QUEUE_DISCOVERY,
            QueueArg::Alerts => QUEUE_ALERTS,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "labwatch-worker", about = "LabWatch queue ingest worker")]
struct Args {
    /// Queue to consume
    #[arg(long, value_enum)]
    queue: QueueArg,

    /// Enable verbose debug logging
    #[arg(long)]
    verbose: bool,

    /// Path to configuration file
    #[arg(short, long, default_value = "config/labwatch.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    let config = Config::load(&args.config).map_err(|e| {
        error!("failed to load config {:?}: {}", args.config, e);
        e
    })?;

    let store = Arc::new(Store::open(&config.db.dsn)?);
    let bus = MessageBus::connect(&config.broker).await?;
    let worker = IngestWorker::new(Arc::clone(&store));

    let queue = args.queue.name();
    info!(queue = queue, prefetch = PREFETCH, "worker starting");

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("shutdown signal received");
            cancel.cancel();
        });
    }

    let durable = format!("ingest-{}", queue);
    bus.consume(queue, &durable, PREFETCH, cancel, |message| {
        worker.handle(message)
    })
    .await?;

    let stats = worker.stats();
    info!(
        processed = stats.processed,
        errors = stats.errors,
        duration_secs = format!("{:.1}", stats.elapsed_secs),
        rate = format!("{:.1}/s", stats.rate_per_sec),
        "worker stopped"
    );
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
