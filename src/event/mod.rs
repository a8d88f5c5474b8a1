//! Typed key events and their fan-out bus.

pub mod bus;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use bus::{EventBus, SubscriptionFilter};

/// Closed set of key lifecycle events.
///
/// The kernel emits exactly one event per accepted state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(usize)]
pub enum EventKind {
    Created = 0,
    Updated,
    Deleted,
    Expired,
    Locked,
    Unlocked,
    Expunged,
    Accessed,
    LifespanSet,
    LifespanRenewed,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        EventKind::Created,
        EventKind::Updated,
        EventKind::Deleted,
        EventKind::Expired,
        EventKind::Locked,
        EventKind::Unlocked,
        EventKind::Expunged,
        EventKind::Accessed,
        EventKind::LifespanSet,
        EventKind::LifespanRenewed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Updated => "updated",
            EventKind::Deleted => "deleted",
            EventKind::Expired => "expired",
            EventKind::Locked => "locked",
            EventKind::Unlocked => "unlocked",
            EventKind::Expunged => "expunged",
            EventKind::Accessed => "accessed",
            EventKind::LifespanSet => "lifespan_set",
            EventKind::LifespanRenewed => "lifespan_renewed",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        EventKind::ALL
            .iter()
            .find(|k| k.as_str() == s.to_ascii_lowercase())
            .copied()
            .ok_or_else(|| Error::InvalidArgument(format!("unknown event kind: {}", s)))
    }
}

/// One key lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub key: String,
    pub kind: EventKind,
    pub client_id: String,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(key: &str, kind: EventKind, client_id: &str) -> Self {
        Self {
            key: key.to_string(),
            kind,
            client_id: client_id.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Value tuple captured under the entry mutex, attached to an event for
/// key-value watchers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueSnapshot {
    #[serde(with = "crate::store::b64")]
    pub value: Vec<u8>,
    pub content_type: String,
    pub hash: String,
    pub version: u64,
}

/// Frame streamed to a WatchKeyValue subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValueFrame {
    pub key: String,
    pub kind: EventKind,
    pub client_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "crate::store::b64")]
    pub value: Vec<u8>,
    pub content_type: String,
    pub hash: String,
    pub version: u64,
}

impl KeyValueFrame {
    pub fn from_event(event: &Event, value: &ValueSnapshot) -> Self {
        Self {
            key: event.key.clone(),
            kind: event.kind,
            client_id: event.client_id.clone(),
            timestamp: event.timestamp,
            value: value.value.clone(),
            content_type: value.content_type.clone(),
            hash: value.hash.clone(),
            version: value.version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
        assert!("nonsense".parse::<EventKind>().is_err());
    }

    #[test]
    fn test_event_kind_serde() {
        let json = serde_json::to_string(&EventKind::LifespanSet).unwrap();
        assert_eq!(json, "\"lifespan_set\"");
        let kind: EventKind = serde_json::from_str("\"expunged\"").unwrap();
        assert_eq!(kind, EventKind::Expunged);
    }
}
