/// Subnet discovery pipeline.
///
/// For each department with a subnet: enumerate the CIDR, sweep it for
/// hosts answering on the SSH port, fan identification probes across a
/// bounded worker pool, and upsert every verified host keyed on its
/// address. Each pass is recorded as a `network_scans` row so operators
/// can see when a subnet was last walked and how it went.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use ipnetwork::Ipv4Network;
use tracing::{debug, error, info, warn};

use labwatch_core::queue::{BusMessage, MessageBus};
use labwatch_core::store::Store;
use labwatch_core::types::{Department, DiscoveredHost, HostStatus, IdentityReport};
use labwatch_core::Error;

use crate::pool::SessionPool;
use crate::probe;

/// Reachability probe timeout per address.
const SWEEP_TIMEOUT: Duration = Duration::from_secs(1);
/// Parallel reachability probes in flight.
const SWEEP_CONCURRENCY: usize = 64;
/// Parallel identification probes per department.
const IDENTIFY_WORKERS: usize = 10;

pub struct Discovery {
    pub store: Arc<Store>,
    pub pool: Arc<SessionPool>,
    pub bus: Option<Arc<MessageBus>>,
    pub probe_timeout: Duration,
    pub ssh_port: u16,
}

/// Host addresses of a CIDR block. Network and broadcast addresses are
/// skipped for prefixes that have them.
pub fn subnet_hosts(cidr: &str) -> Result<Vec<Ipv4Addr>, Error> {
    let network: Ipv4Network = cidr
        .parse()
        .map_err(|e| Error::Config(format!("invalid subnet {}: {}", cidr, e)))?;
    let hosts = if network.prefix() >= 31 {
        network.iter().collect()
    } else {
        network
            .iter()
            .filter(|&addr| addr != network.network() && addr != network.broadcast())
            .collect()
    };
    Ok(hosts)
}

async fn reachable(ip: Ipv4Addr, port: u16) -> bool {
    matches!(
        tokio::time::timeout(SWEEP_TIMEOUT, tokio::net::TcpStream::connect((ip, port))).await,
        Ok(Ok(_))
    )
}

/// TCP sweep of the given addresses, returning the responsive subset in
/// address order.
pub async fn ping_sweep(addrs: Vec<Ipv4Addr>, port: u16) -> Vec<Ipv4Addr> {
    let mut responsive: Vec<Ipv4Addr> = stream::iter(addrs)
        .map(|ip| async move { (ip, reachable(ip, port).await) })
        .buffer_unordered(SWEEP_CONCURRENCY)
        .filter_map(|(ip, up)| async move { up.then_some(ip) })
        .collect()
        .await;
    responsive.sort();
    responsive
}

impl Discovery {
    /// One full discovery pass over every department with a subnet.
    /// Department failures are logged and do not stop the pass.
    pub async fn run_scan(&self) -> Result<(), Error> {
        let departments = self.store.departments_with_subnet()?;
        info!(departments = departments.len(), "starting discovery pass");
        for dept in &departments {
            if let Err(e) = self.discover_department(dept).await {
                error!(dept = %dept.dept_name, error = %e, "department scan failed");
            }
        }
        Ok(())
    }

    /// Scan one department's subnet. Returns the number of hosts verified
    /// and upserted.
    pub async fn discover_department(&self, dept: &Department) -> Result<usize, Error> {
        let Some(cidr) = dept.subnet_cidr.as_deref() else {
            return Ok(0);
        };
        if !self.store.department_exists(dept.dept_id)? {
            warn!(dept = %dept.dept_id, "department missing from store, skipping");
            return Ok(0);
        }

        let scan = self.store.open_scan(dept.dept_id, cidr)?;
        match self.scan_subnet(dept, cidr).await {
            Ok(found) => {
                let count = found.len();
                self.store.close_scan(scan, count)?;
                info!(
                    dept = %dept.dept_name,
                    systems_found = count,
                    "discovery scan completed"
                );
                if !found.is_empty() {
                    self.publish_batch(found).await;
                }
                Ok(count)
            }
            Err(e) => {
                self.store.fail_scan(scan, &e.to_string())?;
                Err(e)
            }
        }
    }

    async fn scan_subnet(&self, dept: &Department, cidr: &str) -> Result<Vec<DiscoveredHost>, Error> {
        let addrs = subnet_hosts(cidr)?;
        info!(dept = %dept.dept_name, cidr = cidr, addresses = addrs.len(), "scanning subnet");

        let responsive = ping_sweep(addrs, self.ssh_port).await;
        info!(dept = %dept.dept_name, responsive = responsive.len(), "ping sweep finished");

        let lab = self.store.first_lab(dept.dept_id)?;

        let identified: Vec<(Ipv4Addr, IdentityReport)> = stream::iter(responsive)
            .map(|ip| {
                let pool = Arc::clone(&self.pool);
                let timeout = self.probe_timeout;
                async move {
                    let session = match pool.acquire(&ip.to_string()).await {
                        Ok(session) => session,
                        Err(e) => {
                            debug!(host = %ip, error = %e, "identification connect failed");
                            return None;
                        }
                    };
                    probe::identify(&session, timeout).await.map(|report| (ip, report))
                }
            })
            .buffer_unordered(IDENTIFY_WORKERS)
            .filter_map(|outcome| async move { outcome })
            .collect()
            .await;

        let mut found = Vec::with_capacity(identified.len());
        for (ip, identity) in identified {
            let host_id = self
                .store
                .upsert_host(&ip.to_string(), dept.dept_id, lab, &identity)?;
            info!(host = %ip, hostname = ?identity.hostname, id = %host_id, "host verified");
            found.push(DiscoveredHost {
                ip_address: ip.to_string(),
                dept_id: dept.dept_id,
                lab_id: lab,
                identity,
            });
        }
        Ok(found)
    }

    /// Best-effort publish of the scan's batch to the discovery queue.
    async fn publish_batch(&self, found: Vec<DiscoveredHost>) {
        let Some(bus) = &self.bus else { return };
        match bus.publish(&BusMessage::discovery(found)).await {
            Ok(true) => {}
            Ok(false) => warn!("discovery batch dropped, queue unavailable"),
            Err(e) => warn!(error = %e, "discovery publish failed"),
        }
    }

    /// Reachability sweep over active hosts, flipping status between
    /// active and offline. Returns (up, down) counts.
    pub async fn heartbeat(&self, max_workers: usize) -> Result<(usize, usize), Error> {
        let hosts = self.store.active_hosts()?;
        info!(hosts = hosts.len(), "heartbeat sweep starting");

        let port = self.ssh_port;
        let results: Vec<(String, bool)> = stream::iter(hosts)
            .map(|host| async move {
                let up = match host.ip_address.parse::<Ipv4Addr>() {
                    Ok(ip) => reachable(ip, port).await,
                    Err(_) => false,
                };
                (host.ip_address, up)
            })
            .buffer_unordered(max_workers.max(1))
            .collect()
            .await;

        let mut up_count = 0;
        let mut down_count = 0;
        for (ip, up) in results {
            let status = if up {
                up_count += 1;
                HostStatus::Active
            } else {
                down_count += 1;
                HostStatus::Offline
            };
            self.store.set_status_by_ip(&ip, status)?;
        }
        info!(up = up_count, down = down_count, "heartbeat complete");
        Ok((up_count, down_count))
    }
}
