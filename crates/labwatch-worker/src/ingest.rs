/// Message handlers for the ingest worker.
///
/// Each message is one store transaction. Returning `false` tells the
/// queue adapter to nak with requeue, so a transient store failure (or a
/// metric whose host row has not arrived yet) is retried on a later
/// delivery instead of being lost.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use labwatch_core::queue::{parse_timestamp, BusMessage};
use labwatch_core::store::Store;
use labwatch_core::types::{DiscoveredHost, HostId, MetricsReport};

pub struct IngestWorker {
    store: Arc<Store>,
    processed: AtomicU64,
    errors: AtomicU64,
    started: Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerStats {
    pub processed: u64,
    pub errors: u64,
    pub elapsed_secs: f64,
    pub rate_per_sec: f64,
}

impl IngestWorker {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    /// Process one message; the return value drives ack/nak.
    pub fn handle(&self, message: BusMessage) -> bool {
        match message {
            BusMessage::Metric {
                system_id,
                timestamp,
                data,
            } => self.handle_metric(system_id, &timestamp, &data),
            BusMessage::Discovery { systems, .. } => self.handle_discovery(&systems),
            BusMessage::Alert { data, .. } => {
                info!(alert = %data, "alert received");
                self.processed.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    fn handle_metric(&self, host: HostId, timestamp: &str, sample: &MetricsReport) -> bool {
        let Some(ts) = parse_timestamp(timestamp) else {
            warn!(host = %host, timestamp = timestamp, "metric carries unparseable timestamp");
            self.errors.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        match self.store.insert_metric(host, ts, sample) {
            Ok(()) => {
                debug!(host = %host, "metric saved");
                self.processed.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                warn!(host = %host, error = %e, "metric insert failed");
                self.errors.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    fn handle_discovery(&self, systems: &[DiscoveredHost]) -> bool {
        for system in systems {
            if let Err(e) = self.store.ingest_host(system) {
                warn!(host = %system.ip_address, error = %e, "discovery upsert failed");
                self.errors.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }
        info!(systems = systems.len(), "discovery batch processed");
        self.processed
            .fetch_add(systems.len() as u64, Ordering::Relaxed);
        true
    }

    pub fn stats(&self) -> WorkerStats {
        let processed = self.processed.load(Ordering::Relaxed);
        let elapsed = self.started.elapsed().as_secs_f64();
        WorkerStats {
            processed,
            errors: self.errors.load(Ordering::Relaxed),
            elapsed_secs: elapsed,
            rate_per_sec: if elapsed > 0.0 {
                processed as f64 / elapsed
            } else {
                0.0
            },
        }
    }
}
