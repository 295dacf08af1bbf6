//! Ephemeral coordination records: soft locks and presence.
//!
//! Both shapes are shared with existing clients through the coordination
//! store, so field names are fixed: a lock is `{holderId, holderName,
//! timestamp}`, presence is `{displayName, color, online, lastSeenTimestamp}`.

use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// An advisory edit lock on one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub holder_id: UserId,
    pub holder_name: String,
    /// Unix millis at acquisition.
    pub timestamp: u64,
}

impl LockRecord {
    pub fn new(holder_id: UserId, holder_name: impl Into<String>, timestamp: u64) -> Self {
        Self { holder_id, holder_name: holder_name.into(), timestamp }
    }

    /// Milliseconds since acquisition (saturating on clock skew).
    pub fn age_millis(&self, now: u64) -> u64 {
        now.saturating_sub(self.timestamp)
    }

    pub fn is_held_by(&self, user: &UserId) -> bool {
        &self.holder_id == user
    }
}

/// One user's presence on a board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub display_name: String,
    pub color: String,
    pub online: bool,
    /// Unix millis of the last heartbeat or refresh.
    #[serde(rename = "lastSeenTimestamp", alias = "lastSeen")]
    pub last_seen: u64,
}

impl PresenceRecord {
    pub fn online(display_name: impl Into<String>, color: impl Into<String>, now: u64) -> Self {
        Self {
            display_name: display_name.into(),
            color: color.into(),
            online: true,
            last_seen: now,
        }
    }

    /// An entry reported offline for longer than `threshold_ms` is a ghost
    /// left behind by a client that never cleaned up.
    pub fn is_ghost(&self, now: u64, threshold_ms: u64) -> bool {
        !self.online && now.saturating_sub(self.last_seen) > threshold_ms
    }
}
