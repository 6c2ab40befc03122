//! Data model: `AccessEvent`, `IPStats`, `Alert`, and the bounded
//! LRU-by-insertion set used for per-IP endpoint/user-agent/user-id caps
//! and user IP history (`SPEC_FULL.md` §4.4, "Bounded per-IP sets").

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("invalid IP address: {0:?}")]
    InvalidInput(String),
}

/// One request observation ingested by the tracker. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessEvent {
    pub ip: String,
    pub timestamp: DateTime<Utc>,
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    pub user_id: Option<String>,
    pub user_agent: Option<String>,
    pub success: bool,
    pub reason: Option<String>,
}

impl AccessEvent {
    pub fn new(ip: impl Into<String>, endpoint: impl Into<String>, method: impl Into<String>, status_code: u16, success: bool) -> Self {
        Self {
            ip: ip.into(),
            timestamp: Utc::now(),
            endpoint: endpoint.into(),
            method: method.into(),
            status_code,
            user_id: None,
            user_agent: None,
            success,
            reason: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AlertType {
    BruteForce,
    RateLimitExceeded,
    #[serde(rename = "suspiciousIP")]
    SuspiciousIp,
    GeoAnomaly,
    #[serde(rename = "newIPForUser")]
    NewIpForUser,
    MultipleFailedAttempts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// One detection emitted by [`crate::AccessTracker::track`]. A value, not a
/// side effect: the caller decides its fate (log it, page someone, drop it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: Severity,
    pub ip: String,
    pub user_id: Option<String>,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: Map<String, Value>,
    pub should_block: bool,
}

impl Alert {
    pub(crate) fn new(alert_type: AlertType, severity: Severity, ip: impl Into<String>, description: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            alert_type,
            severity,
            ip: ip.into(),
            user_id: None,
            description: description.into(),
            timestamp,
            metadata: Map::new(),
            should_block: false,
        }
    }

    pub(crate) fn with_user_id(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub(crate) fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub(crate) fn blocking(mut self) -> Self {
        self.should_block = true;
        self
    }
}

/// Per-IP aggregate, updated on every ingested event for that IP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IPStats {
    pub ip: String,
    pub total: u64,
    pub failed: u64,
    pub success: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub endpoints: BoundedSet,
    pub user_agents: BoundedSet,
    pub user_ids: BoundedSet,
    pub suspicious_score: u8,
    /// Failures since the last success, irrespective of timing. Drives the
    /// auto-block escalation, which tracks a run of consecutive failures
    /// rather than a fixed time window.
    pub consecutive_failures: u64,
}

impl IPStats {
    pub(crate) fn new(ip: impl Into<String>, cap: usize, now: DateTime<Utc>) -> Self {
        Self {
            ip: ip.into(),
            total: 0,
            failed: 0,
            success: 0,
            first_seen: now,
            last_seen: now,
            endpoints: BoundedSet::new(cap),
            user_agents: BoundedSet::new(cap),
            user_ids: BoundedSet::new(cap),
            suspicious_score: 0,
            consecutive_failures: 0,
        }
    }
}

/// Set bounded to `cap` elements, evicting the oldest-inserted element when
/// full — "LRU-by-insertion" per §4.4 step 4: eviction is driven purely by
/// insertion order, not by access recency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundedSet {
    cap: usize,
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl BoundedSet {
    pub fn new(cap: usize) -> Self {
        Self { cap: cap.max(1), order: VecDeque::new(), members: HashSet::new() }
    }

    /// Insert `value`; silently evicts the oldest member if this would
    /// exceed capacity. Returns whether `value` was newly inserted.
    pub fn insert(&mut self, value: impl Into<String>) -> bool {
        let value = value.into();
        if self.members.contains(&value) {
            return false;
        }
        if self.order.len() >= self.cap {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
        self.order.push_back(value.clone());
        self.members.insert(value);
        true
    }

    pub fn contains(&self, value: &str) -> bool {
        self.members.contains(value)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }
}

pub(crate) fn validate_ip(ip: &str) -> Result<(), TrackerError> {
    ip.parse::<std::net::IpAddr>().map(|_| ()).map_err(|_| TrackerError::InvalidInput(ip.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_set_evicts_oldest_on_overflow() {
        let mut set = BoundedSet::new(2);
        set.insert("a");
        set.insert("b");
        set.insert("c");
        assert_eq!(set.len(), 2);
        assert!(!set.contains("a"));
        assert!(set.contains("b"));
        assert!(set.contains("c"));
    }

    #[test]
    fn bounded_set_ignores_duplicate_insert() {
        let mut set = BoundedSet::new(2);
        set.insert("a");
        set.insert("a");
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn validate_ip_accepts_v4_and_v6_rejects_garbage() {
        assert!(validate_ip("127.0.0.1").is_ok());
        assert!(validate_ip("::1").is_ok());
        assert!(validate_ip("not-an-ip").is_err());
    }
}
