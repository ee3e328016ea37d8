/// Adaptive polling scheduler.
///
/// Tracks a per-host failure history and derives a health state from the
/// consecutive-failure count. The effective poll interval for a host is the
/// tier's base interval scaled by a health multiplier, so hosts that stop
/// answering fall back to near-silent daily checks instead of burning a
/// worker slot every cycle.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::types::HostId;

/// Health states derived from consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostHealth {
    /// 0 failures
    Healthy,
    /// 1-3 failures
    Degraded,
    /// 4-10 failures
    Offline,
    /// more than 10 failures
    Dead,
}

impl HostHealth {
    fn from_failures(consecutive_failures: u32) -> Self {
        match consecutive_failures {
            0 => HostHealth::Healthy,
            1..=3 => HostHealth::Degraded,
            4..=10 => HostHealth::Offline,
            _ => HostHealth::Dead,
        }
    }

    /// Backoff multiplier applied to every tier's base interval.
    pub fn multiplier(&self) -> u32 {
        match self {
            HostHealth::Healthy => 1,
            HostHealth::Degraded => 2,
            HostHealth::Offline => 12,
            HostHealth::Dead => 288,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HostHealth::Healthy => "healthy",
            HostHealth::Degraded => "degraded",
            HostHealth::Offline => "offline",
            HostHealth::Dead => "dead",
        }
    }
}

/// Metric collection frequency tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollTier {
    /// 30 s: real-time pulses
    High,
    /// 5 min: standard telemetry
    Medium,
    /// 1 h: inventory-like data
    Low,
}

impl PollTier {
    pub const ALL: [PollTier; 3] = [PollTier::High, PollTier::Medium, PollTier::Low];

    pub fn base_interval(&self) -> Duration {
        match self {
            PollTier::High => Duration::from_secs(30),
            PollTier::Medium => Duration::from_secs(300),
            PollTier::Low => Duration::from_secs(3600),
        }
    }

    /// Metric identifiers emitted when this tier is due.
    pub fn metrics(&self) -> &'static [&'static str] {
        match self {
            PollTier::High => &["cpu_percent", "ram_percent", "system_responsive", "active_users"],
            PollTier::Medium => &[
                "disk_percent",
                "disk_io",
                "network_stats",
                "process_count",
                "uptime",
                "temperature",
            ],
            PollTier::Low => &[
                "installed_software",
                "hardware_inventory",
                "user_sessions",
                "system_updates",
                "security_patches",
            ],
        }
    }
}

#[derive(Debug, Clone)]
struct HostState {
    consecutive_failures: u32,
    total_attempts: u64,
    total_successes: u64,
    last_attempt: Option<Instant>,
    last_success: Option<Instant>,
    health: HostHealth,
}

impl HostState {
    fn new() -> Self {
        Self {
            consecutive_failures: 0,
            total_attempts: 0,
            total_successes: 0,
            last_attempt: None,
            last_success: None,
            health: HostHealth::Healthy,
        }
    }
}

/// Aggregate scheduler statistics, logged after each collection cycle.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub total_hosts: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub offline: usize,
    pub dead: usize,
    pub total_attempts: u64,
    pub total_successes: u64,
    /// 0.0 when nothing has been attempted yet
    pub success_rate: f64,
}

pub struct AdaptiveScheduler {
    states: Mutex<HashMap<HostId, HostState>>,
}

impl Default for AdaptiveScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl AdaptiveScheduler {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Record a successful collection. Resets the failure counter and
    /// forces the host back to healthy. Returns the (old, new) health pair
    /// so callers can observe recoveries.
    pub fn record_success(&self, host: HostId) -> (HostHealth, HostHealth) {
        self.record_success_at(host, Instant::now())
    }

    fn record_success_at(&self, host: HostId, now: Instant) -> (HostHealth, HostHealth) {
        let mut states = self.states.lock().unwrap();
        let state = states.entry(host).or_insert_with(HostState::new);
        let old = state.health;
        state.consecutive_failures = 0;
        state.total_attempts += 1;
        state.total_successes += 1;
        state.last_attempt = Some(now);
        state.last_success = Some(now);
        state.health = HostHealth::Healthy;
        if old != HostHealth::Healthy {
            info!(host = %host, from = old.as_str(), "host recovered");
        }
        (old, state.health)
    }

    /// Record a failed collection attempt. Returns the (old, new) health
    /// pair so callers can publish alerts on downward transitions.
    pub fn record_failure(&self, host: HostId, reason: &str) -> (HostHealth, HostHealth) {
        self.record_failure_at(host, reason, Instant::now())
    }

    fn record_failure_at(&self, host: HostId, reason: &str, now: Instant) -> (HostHealth, HostHealth) {
        let mut states = self.states.lock().unwrap();
        let state = states.entry(host).or_insert_with(HostState::new);
        let old = state.health;
        state.consecutive_failures += 1;
        state.total_attempts += 1;
        state.last_attempt = Some(now);
        state.health = HostHealth::from_failures(state.consecutive_failures);
        if old != state.health {
            warn!(
                host = %host,
                from = old.as_str(),
                to = state.health.as_str(),
                failures = state.consecutive_failures,
                reason = reason,
                "host health degraded"
            );
        } else {
            debug!(host = %host, failures = state.consecutive_failures, reason = reason, "poll failed");
        }
        (old, state.health)
    }

    pub fn health(&self, host: HostId) -> HostHealth {
        let mut states = self.states.lock().unwrap();
        states.entry(host).or_insert_with(HostState::new).health
    }

    /// Base tier interval scaled by the host's health multiplier.
    pub fn effective_interval(&self, host: HostId, tier: PollTier) -> Duration {
        tier.base_interval() * self.health(host).multiplier()
    }

    /// Whether the host is due for a poll at the given tier: never
    /// attempted, or at least the effective interval has elapsed since the
    /// last attempt.
    pub fn should_poll(&self, host: HostId, tier: PollTier) -> bool {
        self.should_poll_at(host, tier, Instant::now())
    }

    fn should_poll_at(&self, host: HostId, tier: PollTier, now: Instant) -> bool {
        let interval = {
            let mut states = self.states.lock().unwrap();
            let state = states.entry(host).or_insert_with(HostState::new);
            match state.last_attempt {
                None => return true,
                Some(last) => {
                    let interval = tier.base_interval() * state.health.multiplier();
                    if now.duration_since(last) >= interval {
                        interval
                    } else {
                        return false;
                    }
                }
            }
        };
        debug!(host = %host, interval_secs = interval.as_secs(), "host due for poll");
        true
    }

    /// Union of metric identifiers across every tier whose due-check
    /// passes. Tiers are disjoint, so order is high, medium, low.
    pub fn metrics_due(&self, host: HostId) -> Vec<&'static str> {
        self.metrics_due_at(host, Instant::now())
    }

    fn metrics_due_at(&self, host: HostId, now: Instant) -> Vec<&'static str> {
        let mut due = Vec::new();
        for tier in PollTier::ALL {
            if self.should_poll_at(host, tier, now) {
                due.extend_from_slice(tier.metrics());
            }
        }
        due
    }

    /// Filter a host list down to those due at the given tier. Entry point
    /// used by the collection orchestrator.
    pub fn due_hosts(&self, hosts: &[HostId], tier: PollTier) -> Vec<HostId> {
        let now = Instant::now();
        hosts
            .iter()
            .copied()
            .filter(|&h| self.should_poll_at(h, tier, now))
            .collect()
    }

    /// Operator recovery: force a host back to healthy with zero counters.
    pub fn reset(&self, host: HostId) {
        let mut states = self.states.lock().unwrap();
        if let Some(state) = states.get_mut(&host) {
            state.consecutive_failures = 0;
            state.health = HostHealth::Healthy;
            info!(host = %host, "host manually reset to healthy");
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let states = self.states.lock().unwrap();
        let mut stats = SchedulerStats {
            total_hosts: states.len(),
            healthy: 0,
            degraded: 0,
            offline: 0,
            dead: 0,
            total_attempts: 0,
            total_successes: 0,
            success_rate: 0.0,
        };
        for state in states.values() {
            match state.health {
                HostHealth::Healthy => stats.healthy += 1,
                HostHealth::Degraded => stats.degraded += 1,
                HostHealth::Offline => stats.offline += 1,
                HostHealth::Dead => stats.dead += 1,
            }
            stats.total_attempts += state.total_attempts;
            stats.total_successes += state.total_successes;
        }
        if stats.total_attempts > 0 {
            stats.success_rate = stats.total_successes as f64 / stats.total_attempts as f64;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: HostId = HostId(1);

    #[test]
    fn unknown_host_is_healthy_and_due() {
        let sched = AdaptiveScheduler::new();
        assert_eq!(sched.health(H), HostHealth::Healthy);
        assert!(sched.should_poll(H, PollTier::Medium));
    }

    #[test]
    fn success_resets_to_healthy() {
        let sched = AdaptiveScheduler::new();
        for _ in 0..7 {
            sched.record_failure(H, "timeout");
        }
        assert_eq!(sched.health(H), HostHealth::Offline);
        let (old, new) = sched.record_success(H);
        assert_eq!(old, HostHealth::Offline);
        assert_eq!(new, HostHealth::Healthy);
        let stats = sched.stats();
        assert_eq!(stats.total_attempts, 8);
        assert_eq!(stats.total_successes, 1);
    }

    #[test]
    fn failure_thresholds_match_boundaries() {
        let sched = AdaptiveScheduler::new();
        let expected = [
            (1, HostHealth::Degraded),
            (2, HostHealth::Degraded),
            (3, HostHealth::Degraded),
            (4, HostHealth::Offline),
            (10, HostHealth::Offline),
            (11, HostHealth::Dead),
        ];
        let mut failures = 0;
        for (count, health) in expected {
            while failures < count {
                sched.record_failure(H, "refused");
                failures += 1;
            }
            assert_eq!(sched.health(H), health, "after {} failures", count);
        }
    }

    #[test]
    fn effective_interval_is_base_times_multiplier() {
        let sched = AdaptiveScheduler::new();
        assert_eq!(
            sched.effective_interval(H, PollTier::Medium),
            Duration::from_secs(300)
        );

        for _ in 0..10 {
            sched.record_failure(H, "down");
        }
        // 10 failures → offline → 12x
        assert_eq!(sched.health(H), HostHealth::Offline);
        assert_eq!(
            sched.effective_interval(H, PollTier::Medium),
            Duration::from_secs(3600)
        );

        sched.record_failure(H, "down");
        // 11 failures → dead → 288x, once per ~24h at medium
        assert_eq!(sched.health(H), HostHealth::Dead);
        assert_eq!(
            sched.effective_interval(H, PollTier::Medium),
            Duration::from_secs(86_400)
        );
        assert_eq!(
            sched.effective_interval(H, PollTier::High),
            Duration::from_secs(30 * 288)
        );
    }

    #[test]
    fn should_poll_respects_the_interval() {
        let sched = AdaptiveScheduler::new();
        let t0 = Instant::now();
        sched.record_success_at(H, t0);

        assert!(!sched.should_poll_at(H, PollTier::High, t0 + Duration::from_secs(29)));
        assert!(sched.should_poll_at(H, PollTier::High, t0 + Duration::from_secs(30)));
        assert!(!sched.should_poll_at(H, PollTier::Medium, t0 + Duration::from_secs(299)));
        assert!(sched.should_poll_at(H, PollTier::Medium, t0 + Duration::from_secs(300)));
    }

    #[test]
    fn degraded_host_polls_at_twice_the_interval() {
        let sched = AdaptiveScheduler::new();
        let t0 = Instant::now();
        sched.record_failure_at(H, "timeout", t0);
        assert_eq!(sched.health(H), HostHealth::Degraded);

        assert!(!sched.should_poll_at(H, PollTier::Medium, t0 + Duration::from_secs(300)));
        assert!(sched.should_poll_at(H, PollTier::Medium, t0 + Duration::from_secs(600)));
    }

    #[test]
    fn metrics_due_unions_tiers() {
        let sched = AdaptiveScheduler::new();
        let t0 = Instant::now();
        sched.record_success_at(H, t0);

        let at_30 = sched.metrics_due_at(H, t0 + Duration::from_secs(30));
        assert_eq!(at_30, PollTier::High.metrics().to_vec());

        let at_300 = sched.metrics_due_at(H, t0 + Duration::from_secs(300));
        let mut expected: Vec<&str> = PollTier::High.metrics().to_vec();
        expected.extend_from_slice(PollTier::Medium.metrics());
        assert_eq!(at_300, expected);

        let at_3600 = sched.metrics_due_at(H, t0 + Duration::from_secs(3600));
        expected.extend_from_slice(PollTier::Low.metrics());
        assert_eq!(at_3600, expected);
    }

    #[test]
    fn due_hosts_filters_by_tier() {
        let sched = AdaptiveScheduler::new();
        let t0 = Instant::now();
        let hosts = [HostId(1), HostId(2), HostId(3)];
        sched.record_success_at(HostId(1), t0);
        sched.record_success_at(HostId(2), t0);
        // HostId(3) never attempted, always due

        let now = t0 + Duration::from_secs(1);
        let due: Vec<HostId> = hosts
            .iter()
            .copied()
            .filter(|&h| sched.should_poll_at(h, PollTier::Medium, now))
            .collect();
        assert_eq!(due, vec![HostId(3)]);
    }

    #[test]
    fn reset_forces_healthy() {
        let sched = AdaptiveScheduler::new();
        for _ in 0..20 {
            sched.record_failure(H, "gone");
        }
        assert_eq!(sched.health(H), HostHealth::Dead);
        sched.reset(H);
        assert_eq!(sched.health(H), HostHealth::Healthy);
        assert_eq!(
            sched.effective_interval(H, PollTier::Medium),
            Duration::from_secs(300)
        );
    }

    #[test]
    fn stats_count_states_and_rate() {
        let sched = AdaptiveScheduler::new();
        sched.record_success(HostId(1));
        sched.record_failure(HostId(2), "x");
        for _ in 0..5 {
            sched.record_failure(HostId(3), "x");
        }
        let stats = sched.stats();
        assert_eq!(stats.total_hosts, 3);
        assert_eq!(stats.healthy, 1);
        assert_eq!(stats.degraded, 1);
        assert_eq!(stats.offline, 1);
        assert_eq!(stats.dead, 0);
        assert_eq!(stats.total_attempts, 7);
        assert!((stats.success_rate - 1.0 / 7.0).abs() < 1e-9);
    }

    #[test]
    fn empty_stats_have_zero_rate() {
        let sched = AdaptiveScheduler::new();
        let stats = sched.stats();
        assert_eq!(stats.total_hosts, 0);
        assert_eq!(stats.success_rate, 0.0);
    }
}
