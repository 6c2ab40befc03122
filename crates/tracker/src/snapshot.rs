//! Versioned persisted-state layout for `AccessTracker`, per `spec.md` §6:
//! "An implementation may snapshot tracker state to a byte buffer and
//! restore from it... must faithfully round-trip these with no cross-field
//! drift." Follows the teacher's `schema_version` convention (seen
//! throughout `audit_spec`/`redaction`) rather than an unversioned blob.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::types::{AccessEvent, BoundedSet, IPStats};

pub const SCHEMA_VERSION: u8 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerSnapshot {
    pub schema_version: u8,
    pub ip_stats: HashMap<String, IPStats>,
    pub blocked: HashSet<String>,
    pub whitelisted: HashSet<String>,
    pub user_ip_history: HashMap<String, BoundedSet>,
    pub recent_events: VecDeque<AccessEvent>,
}

impl TrackerSnapshot {
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
