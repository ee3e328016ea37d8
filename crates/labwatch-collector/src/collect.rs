/// Collection orchestrator.
///
/// One cycle: ask the store for the active fleet, let the scheduler pick
/// the hosts due at the medium tier, and fan metrics probes across a
/// bounded worker pool. Results feed the queue (or the store directly
/// when the broker is down) and the scheduler's health tracking. Probes
/// for a single host never overlap: a host appears at most once per cycle
/// and cycles do not overlap each other.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use labwatch_core::queue::{BusMessage, MessageBus};
use labwatch_core::scheduler::{AdaptiveScheduler, HostHealth, PollTier};
use labwatch_core::store::Store;
use labwatch_core::types::{HostId, HostSummary};
use labwatch_core::Error;

use crate::pool::SessionPool;
use crate::probe;

pub struct Orchestrator {
    pub store: Arc<Store>,
    pub pool: Arc<SessionPool>,
    pub bus: Option<Arc<MessageBus>>,
    pub scheduler: Arc<AdaptiveScheduler>,
    pub max_workers: usize,
    pub probe_timeout: Duration,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CycleSummary {
    pub due: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl Orchestrator {
    /// Run one collection cycle and wait for every launched probe to
    /// finish. Pending probes are skipped once `cancel` trips; in-flight
    /// ones complete.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleSummary, Error> {
        let hosts = self.store.active_hosts()?;
        if hosts.is_empty() {
            debug!("no active hosts, skipping cycle");
            return Ok(CycleSummary::default());
        }

        let ids: Vec<HostId> = hosts.iter().map(|h| h.system_id).collect();
        let due = self.scheduler.due_hosts(&ids, PollTier::Medium);
        let due_hosts: Vec<HostSummary> = hosts
            .into_iter()
            .filter(|h| due.contains(&h.system_id))
            .collect();

        if due_hosts.is_empty() {
            debug!("no hosts due this cycle");
            return Ok(CycleSummary::default());
        }
        info!(due = due_hosts.len(), "collection cycle starting");

        let outcomes: Vec<Option<bool>> = stream::iter(due_hosts.iter())
            .map(|host| self.poll_host(host, cancel))
            .buffer_unordered(self.max_workers.max(1))
            .collect()
            .await;

        let mut summary = CycleSummary {
            due: due_hosts.len(),
            ..Default::default()
        };
        for outcome in outcomes {
            match outcome {
                Some(true) => summary.succeeded += 1,
                Some(false) => summary.failed += 1,
                None => summary.skipped += 1,
            }
        }
        info!(
            due = summary.due,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            "collection cycle complete"
        );
        Ok(summary)
    }

    /// Poll one host. `None` means the task was skipped by shutdown and
    /// nothing was recorded against the host.
    async fn poll_host(&self, host: &HostSummary, cancel: &CancellationToken) -> Option<bool> {
        if cancel.is_cancelled() {
            return None;
        }

        let started = Instant::now();
        let wanted = self.scheduler.metrics_due(host.system_id);
        debug!(
            host = %host.ip_address,
            metrics = ?wanted,
            "polling host"
        );

        let session = match self.pool.acquire(&host.ip_address).await {
            Ok(session) => session,
            Err(e) => {
                self.record_failure(host, &format!("connect: {}", e)).await;
                return Some(false);
            }
        };

        match probe::metrics(&session, self.probe_timeout).await {
            Some(mut sample) => {
                sample.collection_latency_ms = Some(started.elapsed().as_millis() as i64);
                self.deliver(host, sample).await;
                self.scheduler.record_success(host.system_id);
                Some(true)
            }
            None => {
                self.record_failure(host, "metrics probe failed").await;
                Some(false)
            }
        }
    }

    /// Hand a sample to the queue, or write it straight to the store when
    /// the broker is unavailable or refuses the message. The probe
    /// succeeded either way, so the scheduler still records a success.
    async fn deliver(&self, host: &HostSummary, sample: labwatch_core::types::MetricsReport) {
        if let Some(bus) = &self.bus {
            match bus.publish(&BusMessage::metric(host.system_id, sample.clone())).await {
                Ok(true) => return,
                Ok(false) => {
                    warn!(host = %host.ip_address, "metric publish dropped, writing directly");
                }
                Err(e) => {
                    warn!(host = %host.ip_address, error = %e, "metric publish failed, writing directly");
                }
            }
        }
        let now = chrono::Utc::now().timestamp();
        if let Err(e) = self.store.insert_metric(host.system_id, now, &sample) {
            warn!(host = %host.ip_address, error = %e, "direct metric write failed");
        }
    }

    async fn record_failure(&self, host: &HostSummary, reason: &str) {
        let (old, new) = self.scheduler.record_failure(host.system_id, reason);
        if old != new && matches!(new, HostHealth::Offline | HostHealth::Dead) {
            self.publish_alert(host, new, reason).await;
        }
    }

    /// A host crossing into offline or dead raises an alert message; the
    /// backoff itself is the scheduler's normal response, not an error.
    async fn publish_alert(&self, host: &HostSummary, health: HostHealth, reason: &str) {
        let Some(bus) = &self.bus else { return };
        let alert = BusMessage::alert(json!({
            "system_id": host.system_id,
            "ip_address": host.ip_address,
            "hostname": host.hostname,
            "health": health.as_str(),
            "message": reason,
        }));
        match bus.publish(&alert).await {
            Ok(true) => info!(host = %host.ip_address, health = health.as_str(), "alert published"),
            Ok(false) => warn!(host = %host.ip_address, "alert dropped, queue unavailable"),
            Err(e) => warn!(host = %host.ip_address, error = %e, "alert publish failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::SshSettings;
    use labwatch_core::types::IdentityReport;

    fn test_orchestrator(store: Store) -> Orchestrator {
        let settings = SshSettings {
            user: "monitor".into(),
            key_path: "/nonexistent/key".into(),
            port: 59998,
            timeout: Duration::from_millis(200),
        };
        Orchestrator {
            store: Arc::new(store),
            pool: Arc::new(SessionPool::with_defaults(settings)),
            bus: None,
            scheduler: Arc::new(AdaptiveScheduler::new()),
            max_workers: 4,
            probe_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn empty_fleet_yields_empty_cycle() {
        let orchestrator = test_orchestrator(Store::open(":memory:").unwrap());
        let cancel = CancellationToken::new();
        let summary = orchestrator.run_cycle(&cancel).await.unwrap();
        assert_eq!(summary.due, 0);
        assert_eq!(summary.succeeded, 0);
    }

    #[tokio::test]
    async fn cancelled_cycle_skips_pending_hosts() {
        let store = Store::open(":memory:").unwrap();
        let dept = store.add_department("ISE", None).unwrap();
        store
            .upsert_host("192.0.2.10", dept, None, &IdentityReport::default())
            .unwrap();
        let orchestrator = test_orchestrator(store);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = orchestrator.run_cycle(&cancel).await.unwrap();
        assert_eq!(summary.due, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 0);
        // Nothing recorded against the host
        assert_eq!(orchestrator.scheduler.stats().total_attempts, 0);
    }

    #[tokio::test]
    async fn unreachable_host_records_a_failure() {
        let store = Store::open(":memory:").unwrap();
        let dept = store.add_department("ISE", None).unwrap();
        let host = store
            .upsert_host("192.0.2.10", dept, None, &IdentityReport::default())
            .unwrap();
        let orchestrator = test_orchestrator(store);

        let cancel = CancellationToken::new();
        let summary = orchestrator.run_cycle(&cancel).await.unwrap();
        assert_eq!(summary.due, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(orchestrator.scheduler.health(host), HostHealth::Degraded);

        // Freshly failed host is not due again within its backoff window
        let summary = orchestrator.run_cycle(&cancel).await.unwrap();
        assert_eq!(summary.due, 0);
    }
}
