//! Tunable thresholds and capacities, all defaulted per `spec.md` §4.4.
//! Constructed directly (no environment reads), matching `obscore-sanitizer`'s
//! `MaskingPolicy::new` convention (`SPEC_FULL.md` §0 "Configuration").

use chrono::Duration;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Capacity of the recent-events ring; oldest dropped on overflow.
    pub recent_events_capacity: usize,
    /// Per-IP cap on `endpoints`/`user_agents`/`user_ids` sets.
    pub per_ip_set_cap: usize,
    /// Per-user cap on `user_ip_history`.
    pub user_ip_history_cap: usize,
    /// How long an IP may go unseen before compaction evicts it.
    pub ttl: Duration,
    /// Hard cap on live IPs; least-recently-seen evicted beyond this.
    pub max_ips: usize,
    /// Background compaction cadence.
    pub compaction_interval: std::time::Duration,
    /// Brute-force probe: failures within this window...
    pub brute_force_window: Duration,
    /// ...at or above this count trigger a `bruteForce` alert...
    pub brute_force_alert_threshold: u32,
    /// ...and at or above this count, auto-block.
    pub brute_force_block_threshold: u32,
    /// Rate-limit probe window.
    pub rate_limit_window: Duration,
    /// Rate-limit probe threshold.
    pub rate_limit_threshold: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            recent_events_capacity: 10_000,
            per_ip_set_cap: 256,
            user_ip_history_cap: 32,
            ttl: Duration::hours(24),
            max_ips: 100_000,
            compaction_interval: std::time::Duration::from_secs(3600),
            brute_force_window: Duration::minutes(5),
            brute_force_alert_threshold: 5,
            brute_force_block_threshold: 10,
            rate_limit_window: Duration::seconds(60),
            rate_limit_threshold: 100,
        }
    }
}
