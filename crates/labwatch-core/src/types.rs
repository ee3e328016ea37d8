/// Shared record types for the collector, worker, and CLI.
///
/// Hosts are identified everywhere by `HostId`, the rowid assigned by the
/// store on first identification. The probe report structs mirror the JSON
/// emitted by the remote scripts; every field is optional because a probe
/// may return a partial record.

use serde::{Deserialize, Serialize};

/// Stable host identifier, assigned by the store and persistent across
/// collector restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(pub i64);

impl std::fmt::Display for HostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeptId(pub i64);

impl std::fmt::Display for DeptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabId(pub i64);

/// Host lifecycle state as stored in the `systems` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    /// Seen by a discovery message but not yet confirmed by the collector
    Discovered,
    /// Identified and reachable
    Active,
    /// Failed its last reachability check
    Offline,
}

impl HostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostStatus::Discovered => "discovered",
            HostStatus::Active => "active",
            HostStatus::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "discovered" => Some(HostStatus::Discovered),
            "active" => Some(HostStatus::Active),
            "offline" => Some(HostStatus::Offline),
            _ => None,
        }
    }
}

/// A department owning one subnet, as read from the store.
#[derive(Debug, Clone)]
pub struct Department {
    pub dept_id: DeptId,
    pub dept_name: String,
    pub subnet_cidr: Option<String>,
}

/// The subset of a host row the poll cycle needs.
#[derive(Debug, Clone)]
pub struct HostSummary {
    pub system_id: HostId,
    pub ip_address: String,
    pub hostname: String,
}

/// Static inventory returned by the identification probe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityReport {
    pub hostname: Option<String>,
    pub mac_address: Option<String>,
    pub cpu_model: Option<String>,
    pub cpu_cores: Option<i64>,
    pub ram_total_gb: Option<f64>,
    pub disk_total_gb: Option<f64>,
    pub gpu_model: Option<String>,
    pub gpu_memory: Option<f64>,
}

/// Dynamic sample returned by the metrics probe. Missing JSON fields map
/// to `None` and flow through to NULL columns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsReport {
    pub cpu_percent: Option<f64>,
    pub cpu_temperature: Option<f64>,
    pub ram_percent: Option<f64>,
    pub disk_percent: Option<f64>,
    pub disk_read_mbps: Option<f64>,
    pub disk_write_mbps: Option<f64>,
    pub network_sent_mbps: Option<f64>,
    pub network_recv_mbps: Option<f64>,
    pub gpu_percent: Option<f64>,
    pub gpu_memory_used_gb: Option<f64>,
    pub gpu_temperature: Option<f64>,
    pub uptime_seconds: Option<i64>,
    pub logged_in_users: Option<i64>,
    /// Filled in by the orchestrator, not the remote script
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_latency_ms: Option<i64>,
}

/// A host as carried inside a discovery queue message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredHost {
    pub ip_address: String,
    pub dept_id: DeptId,
    #[serde(default)]
    pub lab_id: Option<LabId>,
    #[serde(flatten)]
    pub identity: IdentityReport,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_report_tolerates_missing_fields() {
        let report: MetricsReport =
            serde_json::from_str(r#"{"cpu_percent": 42.5, "logged_in_users": 3}"#).unwrap();
        assert_eq!(report.cpu_percent, Some(42.5));
        assert_eq!(report.logged_in_users, Some(3));
        assert!(report.gpu_percent.is_none());
        assert!(report.uptime_seconds.is_none());
    }

    #[test]
    fn identity_report_round_trips() {
        let report = IdentityReport {
            hostname: Some("ws05".into()),
            cpu_cores: Some(8),
            ram_total_gb: Some(16.0),
            ..Default::default()
        };
        let json = serde_json::to_string(&report).unwrap();
        let back: IdentityReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.hostname.as_deref(), Some("ws05"));
        assert_eq!(back.cpu_cores, Some(8));
        assert!(back.gpu_model.is_none());
    }

    #[test]
    fn host_status_string_round_trip() {
        for status in [HostStatus::Discovered, HostStatus::Active, HostStatus::Offline] {
            assert_eq!(HostStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(HostStatus::parse("retired"), None);
    }
}
