//! obscore-tracker
//!
//! In-memory per-IP access tracker: ingests `AccessEvent`s, maintains
//! bounded-memory statistics, emits security `Alert`s, and manages
//! block/allow lists with auto-block escalation. See `SPEC_FULL.md` §4.4.
//!
//! Concurrency follows the striped-mutex shape §4.4 describes: a
//! `RwLock<HashMap<String, Mutex<IPStats>>>` so two different IPs update
//! without serializing on the whole map, independent `RwLock`s for the
//! admin sets and the recent-events ring.

pub mod config;
pub mod snapshot;
mod types;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde_json::json;

pub use config::TrackerConfig;
pub use snapshot::TrackerSnapshot;
pub use types::{AccessEvent, Alert, AlertType, BoundedSet, IPStats, Severity, TrackerError};

use types::validate_ip;

/// Geo-IP lookup hook (§4.4 step 10, §6). Must be pure and non-blocking; a
/// blocking implementation will stall ingestion, since it runs inline
/// inside `track`.
pub type GeoResolver = Box<dyn Fn(&str) -> Option<GeoInfo> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoInfo {
    pub country: String,
    pub region: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Summary {
    pub total_ips: usize,
    pub blocked_ips: usize,
    pub whitelisted_ips: usize,
    pub suspicious_ips: usize,
    pub total_requests: u64,
    pub total_events: usize,
    pub oldest_event: Option<DateTime<Utc>>,
    pub memory_bytes: Option<usize>,
}

pub struct AccessTracker {
    config: TrackerConfig,
    ip_stats: RwLock<HashMap<String, Mutex<IPStats>>>,
    blocked: RwLock<HashSet<String>>,
    whitelisted: RwLock<HashSet<String>>,
    user_ip_history: RwLock<HashMap<String, BoundedSet>>,
    user_countries: RwLock<HashMap<String, HashSet<String>>>,
    recent_events: Mutex<VecDeque<AccessEvent>>,
    geo_resolver: RwLock<Option<GeoResolver>>,
}

impl AccessTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            ip_stats: RwLock::new(HashMap::new()),
            blocked: RwLock::new(HashSet::new()),
            whitelisted: RwLock::new(HashSet::new()),
            user_ip_history: RwLock::new(HashMap::new()),
            user_countries: RwLock::new(HashMap::new()),
            recent_events: Mutex::new(VecDeque::new()),
            geo_resolver: RwLock::new(None),
        }
    }

    pub fn set_geo_resolver(&self, resolver: GeoResolver) {
        *self.geo_resolver.write().expect("geo resolver lock poisoned") = Some(resolver);
    }

    pub fn clear_geo_resolver(&self) {
        *self.geo_resolver.write().expect("geo resolver lock poisoned") = None;
    }

    // ---- admin surface -----------------------------------------------

    /// `reason` is accepted for parity with the admin surface in §6 but, per
    /// the §3 data model, `blocked_ips` is a plain set of IPs — no reason is
    /// retained once inserted.
    pub fn block(&self, ip: &str, reason: impl Into<String>) -> Result<(), TrackerError> {
        validate_ip(ip)?;
        let _ = reason.into();
        self.blocked.write().expect("blocked lock poisoned").insert(ip.to_string());
        Ok(())
    }

    pub fn unblock(&self, ip: &str) -> Result<(), TrackerError> {
        validate_ip(ip)?;
        self.blocked.write().expect("blocked lock poisoned").remove(ip);
        Ok(())
    }

    /// Whitelisting implies unblocking, per the data-model invariant.
    pub fn whitelist(&self, ip: &str) -> Result<(), TrackerError> {
        validate_ip(ip)?;
        self.blocked.write().expect("blocked lock poisoned").remove(ip);
        self.whitelisted.write().expect("whitelisted lock poisoned").insert(ip.to_string());
        Ok(())
    }

    pub fn unwhitelist(&self, ip: &str) -> Result<(), TrackerError> {
        validate_ip(ip)?;
        self.whitelisted.write().expect("whitelisted lock poisoned").remove(ip);
        Ok(())
    }

    pub fn is_blocked(&self, ip: &str) -> bool {
        self.blocked.read().expect("blocked lock poisoned").contains(ip)
    }

    pub fn is_whitelisted(&self, ip: &str) -> bool {
        self.whitelisted.read().expect("whitelisted lock poisoned").contains(ip)
    }

    // ---- lookups -------------------------------------------------------

    pub fn stats(&self, ip: &str) -> Option<IPStats> {
        let map = self.ip_stats.read().expect("ip_stats lock poisoned");
        map.get(ip).map(|m| m.lock().expect("ip stats lock poisoned").clone())
    }

    /// IPs at or above `threshold`, sorted by score descending.
    pub fn suspicious(&self, threshold: u8) -> Vec<IPStats> {
        let map = self.ip_stats.read().expect("ip_stats lock poisoned");
        let mut out: Vec<IPStats> = map
            .values()
            .map(|m| m.lock().expect("ip stats lock poisoned").clone())
            .filter(|s| s.suspicious_score >= threshold)
            .collect();
        out.sort_by(|a, b| b.suspicious_score.cmp(&a.suspicious_score));
        out
    }

    pub fn recent_events(&self, limit: usize) -> Vec<AccessEvent> {
        let ring = self.recent_events.lock().expect("recent_events lock poisoned");
        ring.iter().rev().take(limit).cloned().collect()
    }

    pub fn events_by_ip(&self, ip: &str, limit: usize) -> Vec<AccessEvent> {
        let ring = self.recent_events.lock().expect("recent_events lock poisoned");
        ring.iter().rev().filter(|e| e.ip == ip).take(limit).cloned().collect()
    }

    pub fn events_by_user(&self, user_id: &str, limit: usize) -> Vec<AccessEvent> {
        let ring = self.recent_events.lock().expect("recent_events lock poisoned");
        ring.iter()
            .rev()
            .filter(|e| e.user_id.as_deref() == Some(user_id))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn summary(&self) -> Summary {
        let map = self.ip_stats.read().expect("ip_stats lock poisoned");
        let mut total_requests = 0u64;
        let mut suspicious_ips = 0usize;
        for m in map.values() {
            let stats = m.lock().expect("ip stats lock poisoned");
            total_requests += stats.total;
            if stats.suspicious_score >= 70 {
                suspicious_ips += 1;
            }
        }
        let ring = self.recent_events.lock().expect("recent_events lock poisoned");
        Summary {
            total_ips: map.len(),
            blocked_ips: self.blocked.read().expect("blocked lock poisoned").len(),
            whitelisted_ips: self.whitelisted.read().expect("whitelisted lock poisoned").len(),
            suspicious_ips,
            total_requests,
            total_events: ring.len(),
            oldest_event: ring.front().map(|e| e.timestamp),
            memory_bytes: None,
        }
    }

    // ---- ingestion -------------------------------------------------------

    fn ensure_stats_entry(&self, ip: &str, now: DateTime<Utc>) {
        {
            let map = self.ip_stats.read().expect("ip_stats lock poisoned");
            if map.contains_key(ip) {
                return;
            }
        }
        let mut map = self.ip_stats.write().expect("ip_stats lock poisoned");
        map.entry(ip.to_string())
            .or_insert_with(|| Mutex::new(IPStats::new(ip, self.config.per_ip_set_cap, now)));
    }

    fn with_stats<R>(&self, ip: &str, now: DateTime<Utc>, f: impl FnOnce(&mut IPStats) -> R) -> R {
        self.ensure_stats_entry(ip, now);
        let map = self.ip_stats.read().expect("ip_stats lock poisoned");
        let entry = map.get(ip).expect("entry just ensured");
        let mut stats = entry.lock().expect("ip stats lock poisoned");
        f(&mut stats)
    }

    /// Ingest one event, update state, and return zero or more alerts, in
    /// the order they were detected. Never panics on valid input; `track`
    /// uses `event.timestamp`, not wall-clock time, as the windowing
    /// authority (§4.4: "Pure with respect to time").
    pub fn track(&self, event: AccessEvent) -> Vec<Alert> {
        let now = event.timestamp;
        let ip = event.ip.clone();

        // 1. append to bounded recent-events ring.
        {
            let mut ring = self.recent_events.lock().expect("recent_events lock poisoned");
            ring.push_back(event.clone());
            if ring.len() > self.config.recent_events_capacity {
                ring.pop_front();
            }
        }

        // 2. update per-IP stats.
        let consecutive_failures = self.with_stats(&ip, now, |stats| {
            stats.last_seen = now;
            stats.total += 1;
            if event.success {
                stats.success += 1;
                stats.consecutive_failures = 0;
            } else {
                stats.failed += 1;
                stats.consecutive_failures += 1;
            }
            stats.endpoints.insert(event.endpoint.clone());
            if let Some(ua) = &event.user_agent {
                stats.user_agents.insert(ua.clone());
            }
            if let Some(uid) = &event.user_id {
                stats.user_ids.insert(uid.clone());
            }
            recompute_suspicious_score(stats);
            stats.consecutive_failures
        });

        // 3. user IP history.
        if let Some(user_id) = &event.user_id {
            let mut history = self.user_ip_history.write().expect("user_ip_history lock poisoned");
            history.entry(user_id.clone()).or_insert_with(|| BoundedSet::new(self.config.user_ip_history_cap));
        }

        let mut alerts = Vec::new();

        // 5. blocked check — short-circuits the rest, event already recorded.
        if self.is_blocked(&ip) {
            alerts.push(
                Alert::new(AlertType::SuspiciousIp, Severity::Critical, &ip, "event from blocked IP", now)
                    .with_user_id(event.user_id.clone())
                    .blocking(),
            );
            return alerts;
        }

        // 6. whitelist check — no alerts at all.
        if self.is_whitelisted(&ip) {
            return alerts;
        }

        // 7. brute-force probe.
        if !event.success {
            let failure_count = self.count_ring_matching(&ip, now, self.config.brute_force_window, |e| !e.success);
            if failure_count >= self.config.brute_force_alert_threshold as usize {
                let mut alert = Alert::new(
                    AlertType::BruteForce,
                    Severity::High,
                    &ip,
                    format!("{failure_count} failed attempts within the brute-force window"),
                    now,
                )
                .with_user_id(event.user_id.clone())
                .with_metadata("failedAttempts", json!(failure_count));

                // Block escalation tracks the consecutive-failure run, not the
                // windowed count: a 5-minute window can never hold 10 events
                // that are themselves spaced a minute apart.
                if consecutive_failures >= self.config.brute_force_block_threshold as u64 {
                    alert = alert.blocking();
                    let _ = self.block(&ip, format!("Brute force: {consecutive_failures} consecutive failed attempts"));
                }
                alerts.push(alert);
            }
        }

        // 8. rate-limit probe.
        let request_count = self.count_ring_matching(&ip, now, self.config.rate_limit_window, |_| true);
        if request_count >= self.config.rate_limit_threshold as usize {
            alerts.push(
                Alert::new(
                    AlertType::RateLimitExceeded,
                    Severity::Medium,
                    &ip,
                    format!("{request_count} requests within the rate-limit window"),
                    now,
                )
                .with_user_id(event.user_id.clone())
                .with_metadata("requestCount", json!(request_count)),
            );
        }

        // 9. new-IP-for-user probe.
        if event.success {
            if let Some(user_id) = &event.user_id {
                let mut history = self.user_ip_history.write().expect("user_ip_history lock poisoned");
                let entry = history.entry(user_id.clone()).or_insert_with(|| BoundedSet::new(self.config.user_ip_history_cap));
                if !entry.is_empty() && !entry.contains(&ip) {
                    let previous: Vec<String> = entry.iter().map(str::to_string).collect();
                    alerts.push(
                        Alert::new(AlertType::NewIpForUser, Severity::Low, &ip, format!("new IP for user {user_id}"), now)
                            .with_user_id(Some(user_id.clone()))
                            .with_metadata("previousIPs", json!(previous)),
                    );
                }
                entry.insert(ip.clone());
            }
        }

        // 10. geo-anomaly probe (extension point; no-op without a resolver).
        if event.success {
            if let Some(user_id) = &event.user_id {
                let resolver = self.geo_resolver.read().expect("geo resolver lock poisoned");
                if let Some(resolver) = resolver.as_ref() {
                    if let Some(geo) = resolver(&ip) {
                        let mut countries = self.user_countries.write().expect("user_countries lock poisoned");
                        let known = countries.entry(user_id.clone()).or_default();
                        if !known.is_empty() && !known.contains(&geo.country) {
                            alerts.push(
                                Alert::new(
                                    AlertType::GeoAnomaly,
                                    Severity::Medium,
                                    &ip,
                                    format!("request from unexpected country {}", geo.country),
                                    now,
                                )
                                .with_user_id(Some(user_id.clone()))
                                .with_metadata("country", json!(geo.country))
                                .with_metadata("region", json!(geo.region)),
                            );
                        }
                        known.insert(geo.country);
                    }
                }
            }
        }

        alerts
    }

    fn count_ring_matching(&self, ip: &str, now: DateTime<Utc>, window: chrono::Duration, pred: impl Fn(&AccessEvent) -> bool) -> usize {
        let ring = self.recent_events.lock().expect("recent_events lock poisoned");
        ring.iter().filter(|e| e.ip == ip && pred(e) && now - e.timestamp < window).count()
    }

    // ---- compaction -------------------------------------------------------

    /// Run compaction using the current wall-clock time. Idempotent.
    pub fn compact(&self) {
        self.compact_at(Utc::now());
    }

    /// Same as [`Self::compact`] but with an explicit "now", for
    /// deterministic tests.
    pub fn compact_at(&self, now: DateTime<Utc>) {
        // 1 & 2: TTL and capacity eviction, skipping blocked/whitelisted IPs.
        let protected: HashSet<String> = {
            let blocked = self.blocked.read().expect("blocked lock poisoned");
            let whitelisted = self.whitelisted.read().expect("whitelisted lock poisoned");
            blocked.iter().chain(whitelisted.iter()).cloned().collect()
        };

        let mut expired = Vec::new();
        {
            let map = self.ip_stats.read().expect("ip_stats lock poisoned");
            for (ip, entry) in map.iter() {
                if protected.contains(ip) {
                    continue;
                }
                let stats = entry.lock().expect("ip stats lock poisoned");
                if now - stats.last_seen > self.config.ttl {
                    expired.push(ip.clone());
                }
            }
        }
        if !expired.is_empty() {
            let mut map = self.ip_stats.write().expect("ip_stats lock poisoned");
            for ip in &expired {
                map.remove(ip);
            }
        }
        if !expired.is_empty() {
            let mut history = self.user_ip_history.write().expect("user_ip_history lock poisoned");
            for entry in history.values_mut() {
                for ip in &expired {
                    // BoundedSet has no remove; rebuild without the expired IP.
                    if entry.contains(ip) {
                        let remaining: Vec<String> = entry.iter().filter(|x| *x != ip).map(str::to_string).collect();
                        *entry = BoundedSet::new(self.config.user_ip_history_cap);
                        for r in remaining {
                            entry.insert(r);
                        }
                    }
                }
            }
        }

        let mut over_capacity = {
            let map = self.ip_stats.read().expect("ip_stats lock poisoned");
            map.len().saturating_sub(self.config.max_ips)
        };
        if over_capacity > 0 {
            let mut candidates: Vec<(String, DateTime<Utc>)> = {
                let map = self.ip_stats.read().expect("ip_stats lock poisoned");
                map.iter()
                    .filter(|(ip, _)| !protected.contains(*ip))
                    .map(|(ip, entry)| (ip.clone(), entry.lock().expect("ip stats lock poisoned").last_seen))
                    .collect()
            };
            candidates.sort_by_key(|(_, last_seen)| *last_seen);
            let mut map = self.ip_stats.write().expect("ip_stats lock poisoned");
            for (ip, _) in candidates {
                if over_capacity == 0 {
                    break;
                }
                map.remove(&ip);
                over_capacity -= 1;
            }
        }

        // 3. drop expired events from the ring.
        let ttl = self.config.ttl;
        let mut ring = self.recent_events.lock().expect("recent_events lock poisoned");
        while let Some(front) = ring.front() {
            if now - front.timestamp > ttl {
                ring.pop_front();
            } else {
                break;
            }
        }
    }

    /// Spawn the background compaction loop on the current Tokio runtime.
    pub fn spawn_compaction(self: std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = self.config.compaction_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.compact();
                tokio::task::yield_now().await;
            }
        })
    }

    // ---- snapshot -------------------------------------------------------

    pub fn to_snapshot(&self) -> TrackerSnapshot {
        let ip_stats: HashMap<String, IPStats> = {
            let map = self.ip_stats.read().expect("ip_stats lock poisoned");
            map.iter().map(|(k, v)| (k.clone(), v.lock().expect("ip stats lock poisoned").clone())).collect()
        };
        TrackerSnapshot {
            schema_version: snapshot::SCHEMA_VERSION,
            ip_stats,
            blocked: self.blocked.read().expect("blocked lock poisoned").clone(),
            whitelisted: self.whitelisted.read().expect("whitelisted lock poisoned").clone(),
            user_ip_history: self.user_ip_history.read().expect("user_ip_history lock poisoned").clone(),
            recent_events: self.recent_events.lock().expect("recent_events lock poisoned").clone(),
        }
    }

    pub fn from_snapshot(snapshot: TrackerSnapshot, config: TrackerConfig) -> Self {
        let tracker = Self::new(config);
        {
            let mut map = tracker.ip_stats.write().expect("ip_stats lock poisoned");
            for (ip, stats) in snapshot.ip_stats {
                map.insert(ip, Mutex::new(stats));
            }
        }
        *tracker.blocked.write().expect("blocked lock poisoned") = snapshot.blocked;
        *tracker.whitelisted.write().expect("whitelisted lock poisoned") = snapshot.whitelisted;
        *tracker.user_ip_history.write().expect("user_ip_history lock poisoned") = snapshot.user_ip_history;
        *tracker.recent_events.lock().expect("recent_events lock poisoned") = snapshot.recent_events;
        tracker
    }
}

/// §4.4 step 4: a sum of bounded contributions, clamped to [0,100].
fn recompute_suspicious_score(stats: &mut IPStats) {
    let mut score: u32 = 0;
    if stats.total > 0 {
        let failure_rate = stats.failed as f64 / stats.total as f64;
        if failure_rate > 0.5 {
            score += 30;
        } else if failure_rate > 0.3 {
            score += 15;
        }
    }
    if stats.user_agents.len() > 10 {
        score += 20;
    }
    if stats.user_ids.len() > 5 {
        score += 25;
    }
    if stats.total > 1000 {
        score += 15;
    }
    if stats.endpoints.len() > 50 {
        score += 10;
    }
    stats.suspicious_score = score.min(100) as u8;
}
