/// Remote probes: ship a script, run it, parse its JSON, clean up.
///
/// Two probe types share the same shape: identification (heavy, static
/// inventory) and metrics (light, dynamic sample). A probe never returns
/// an error: any transport failure, non-zero exit, timeout, or malformed
/// output is logged and mapped to `None`, and the remote temp file is
/// removed on every exit path.

use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use labwatch_core::types::{IdentityReport, MetricsReport};

use crate::pool::{SshError, SshSession};

const IDENTIFY_SCRIPT: &str = include_str!("../scripts/identify.sh");
const METRICS_SCRIPT: &str = include_str!("../scripts/metrics.sh");

const REMOTE_IDENTIFY_PATH: &str = "/tmp/labwatch_identify.sh";
const REMOTE_METRICS_PATH: &str = "/tmp/labwatch_metrics.sh";

/// Removing the temp file gets a short grace period of its own so a hung
/// probe cannot also hang the cleanup.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Identification probe: static inventory fields.
pub async fn identify(session: &SshSession, timeout: Duration) -> Option<IdentityReport> {
    run_probe(session, IDENTIFY_SCRIPT, REMOTE_IDENTIFY_PATH, timeout).await
}

/// Metrics probe: one dynamic sample.
pub async fn metrics(session: &SshSession, timeout: Duration) -> Option<MetricsReport> {
    run_probe(session, METRICS_SCRIPT, REMOTE_METRICS_PATH, timeout).await
}

async fn run_probe<T: DeserializeOwned>(
    session: &SshSession,
    script: &str,
    remote_path: &str,
    timeout: Duration,
) -> Option<T> {
    let outcome = execute(session, script, remote_path, timeout).await;

    // Cleanup runs whether the probe succeeded, failed, or timed out
    if let Err(e) = session
        .exec(&format!("rm -f {}", remote_path), CLEANUP_TIMEOUT)
        .await
    {
        debug!(target = session.pool_key(), error = %e, "probe cleanup failed");
    }

    let raw = match outcome {
        Ok(raw) => raw,
        Err(e) => {
            warn!(target = session.pool_key(), error = %e, "probe failed");
            return None;
        }
    };

    parse_report(&raw).or_else(|| {
        warn!(target = session.pool_key(), "probe returned malformed output");
        None
    })
}

async fn execute(
    session: &SshSession,
    script: &str,
    remote_path: &str,
    timeout: Duration,
) -> Result<String, SshError> {
    session.upload(remote_path, script.as_bytes(), timeout).await?;

    let output = session
        .exec(&format!("bash {} --json", remote_path), timeout)
        .await?;

    if output.exit_status != 0 {
        return Err(SshError::Channel(format!(
            "probe exited with status {}",
            output.exit_status
        )));
    }
    Ok(output.stdout)
}

/// Accept only output whose first non-whitespace byte opens a JSON
/// object; anything else (login banners, shell noise) is rejected before
/// the parser sees it.
fn parse_report<T: DeserializeOwned>(raw: &str) -> Option<T> {
    let trimmed = raw.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_metrics_record() {
        let raw = r#"{
            "cpu_percent": 37.5, "cpu_temperature": 61.0, "ram_percent": 58.2,
            "disk_percent": 71.0, "disk_read_mbps": 1.25, "disk_write_mbps": 0.5,
            "network_sent_mbps": 0.12, "network_recv_mbps": 3.4,
            "gpu_percent": null, "gpu_memory_used_gb": null, "gpu_temperature": null,
            "uptime_seconds": 86400, "logged_in_users": 2
        }"#;
        let report: MetricsReport = parse_report(raw).unwrap();
        assert_eq!(report.cpu_percent, Some(37.5));
        assert_eq!(report.uptime_seconds, Some(86400));
        assert!(report.gpu_percent.is_none());
    }

    #[test]
    fn tolerates_partial_records() {
        let report: IdentityReport = parse_report(r#"{"hostname": "ws05"}"#).unwrap();
        assert_eq!(report.hostname.as_deref(), Some("ws05"));
        assert!(report.cpu_cores.is_none());
    }

    #[test]
    fn rejects_non_json_output() {
        assert!(parse_report::<MetricsReport>("bash: nproc: command not found").is_none());
        assert!(parse_report::<MetricsReport>("").is_none());
        assert!(parse_report::<MetricsReport>("Last login: Mon Mar 2\n{\"cpu_percent\": 1}").is_none());
    }

    #[test]
    fn rejects_truncated_json() {
        assert!(parse_report::<MetricsReport>(r#"{"cpu_percent": 42."#).is_none());
    }

    #[test]
    fn leading_whitespace_is_fine() {
        let report: MetricsReport = parse_report("\n  {\"cpu_percent\": 9.5}\n").unwrap();
        assert_eq!(report.cpu_percent, Some(9.5));
    }

    #[test]
    fn embedded_scripts_are_nonempty() {
        assert!(IDENTIFY_SCRIPT.contains("hostname"));
        assert!(METRICS_SCRIPT.contains("cpu_percent"));
    }
}
