//! Key entry model.
//!
//! An entry owns the current value and its metadata: a monotone version
//! counter, a fingerprint of the value bytes, optional lifespan and lock
//! records, and a bounded ring of prior revisions. Lifetime per-key
//! metrics live outside the entry so they survive deletion and restart.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Algorithm used to fingerprint value bytes.
///
/// The fingerprint short-circuits no-op updates and is carried in
/// snapshots, so it is rendered as lowercase hex and compared as a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    #[serde(rename = "fnv")]
    Fnv64,
    Sha256,
}

impl HashAlgorithm {
    pub fn fingerprint(&self, value: &[u8]) -> String {
        match self {
            HashAlgorithm::Fnv64 => {
                use fnv::FnvHasher;
                use std::hash::Hasher;
                let mut hasher = FnvHasher::default();
                hasher.write(value);
                format!("{:016x}", hasher.finish())
            }
            HashAlgorithm::Sha256 => {
                let digest = Sha256::digest(value);
                format!("{:x}", digest)
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Fnv64 => "fnv",
            HashAlgorithm::Sha256 => "sha256",
        }
    }
}

impl std::str::FromStr for HashAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fnv" | "fnv64" | "fnv-1a" => Ok(HashAlgorithm::Fnv64),
            "sha256" | "sha-256" => Ok(HashAlgorithm::Sha256),
            _ => Err(Error::InvalidArgument(format!(
                "unknown hash algorithm: {}",
                s
            ))),
        }
    }
}

/// Exclusive per-key reservation held by one client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockRecord {
    pub client_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl LockRecord {
    pub fn new(client_id: &str, now: DateTime<Utc>, duration: Option<Duration>) -> Self {
        Self {
            client_id: client_id.to_string(),
            acquired_at: now,
            expires_at: duration
                .and_then(|d| chrono::Duration::from_std(d).ok())
                .map(|d| now + d),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(t) if t <= now)
    }

    /// Whether `client_id` may write through this lock.
    pub fn permits(&self, client_id: &str, now: DateTime<Utc>) -> bool {
        self.is_expired_at(now) || self.client_id == client_id
    }
}

/// A prior value snapshot retained in the ring history.
///
/// Captured at the moment its successor was written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Revision {
    pub version: u64,
    #[serde(with = "crate::store::b64")]
    pub value: Vec<u8>,
    pub content_type: String,
    pub hash: String,
    pub timestamp: DateTime<Utc>,
    pub client_id: String,
}

/// Mutable state of one key, guarded by the entry mutex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryState {
    #[serde(with = "crate::store::b64")]
    pub value: Vec<u8>,
    pub content_type: String,
    pub version: u64,
    pub hash: String,
    /// Client that wrote the current value; becomes the stamp on the
    /// revision archived when a successor overwrites it.
    pub last_client_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Duration after which the entry auto-expires, measured from
    /// `lifespan_set_at`.
    pub lifespan: Option<Duration>,
    pub lifespan_set_at: Option<DateTime<Utc>>,
    pub lock: Option<LockRecord>,
    /// Oldest-first ring of prior revisions, at most `revision_limit` long.
    pub history: VecDeque<Revision>,
}

impl EntryState {
    pub fn new(
        value: Vec<u8>,
        content_type: String,
        hash: String,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            value,
            content_type,
            version: 1,
            hash,
            last_client_id: client_id.to_string(),
            created_at: now,
            updated_at: None,
            lifespan: None,
            lifespan_set_at: None,
            lock: None,
            history: VecDeque::new(),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match (self.lifespan, self.lifespan_set_at) {
            (Some(lifespan), Some(set_at)) => match chrono::Duration::from_std(lifespan) {
                Ok(d) => set_at + d <= now,
                Err(_) => false,
            },
            _ => false,
        }
    }

    /// Push the current value onto the history ring, dropping the oldest
    /// revision once `limit` is exceeded. Called before an accepted
    /// non-noop update overwrites the value; the archived revision keeps
    /// the stamp of the client that wrote it, not the superseding writer.
    pub fn push_revision(&mut self, limit: usize) {
        if limit == 0 {
            return;
        }
        self.history.push_back(Revision {
            version: self.version,
            value: self.value.clone(),
            content_type: self.content_type.clone(),
            hash: self.hash.clone(),
            timestamp: self.updated_at.unwrap_or(self.created_at),
            client_id: self.last_client_id.clone(),
        });
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }

    /// Look up a revision by position: 0 is the current value, 1 the
    /// oldest retained revision.
    pub fn revision(&self, position: u64) -> Option<&Revision> {
        if position == 0 {
            return None;
        }
        self.history.get(position as usize - 1)
    }

    /// Drop an expired lock so a write can proceed cleanly.
    pub fn sweep_expired_lock(&mut self, now: DateTime<Utc>) {
        if matches!(&self.lock, Some(l) if l.is_expired_at(now)) {
            self.lock = None;
        }
    }
}

/// One key in the kernel map: an immutable name plus mutex-guarded state.
#[derive(Debug)]
pub struct KeyEntry {
    pub name: String,
    pub state: Mutex<EntryState>,
}

impl KeyEntry {
    pub fn new(name: String, state: EntryState) -> Self {
        Self {
            name,
            state: Mutex::new(state),
        }
    }
}

/// Lifetime metric for one key name. Survives deletion and restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KeyMetric {
    pub access_count: u64,
    pub first_accessed: Option<DateTime<Utc>>,
    pub last_accessed: Option<DateTime<Utc>>,
    pub set_count: u64,
    pub first_set: Option<DateTime<Utc>>,
    pub last_set: Option<DateTime<Utc>>,
    pub lock_count: u64,
    pub first_locked: Option<DateTime<Utc>>,
    pub last_locked: Option<DateTime<Utc>>,
}

impl KeyMetric {
    pub fn tick_access(&mut self, now: DateTime<Utc>) {
        self.access_count += 1;
        self.first_accessed.get_or_insert(now);
        self.last_accessed = Some(now);
    }

    pub fn tick_set(&mut self, now: DateTime<Utc>) {
        self.set_count += 1;
        self.first_set.get_or_insert(now);
        self.last_set = Some(now);
    }

    pub fn tick_lock(&mut self, now: DateTime<Utc>) {
        self.lock_count += 1;
        self.first_locked.get_or_insert(now);
        self.last_locked = Some(now);
    }
}

/// Infer a content type from the first bytes of a value.
///
/// Checks a handful of magic numbers, then falls back to text vs binary
/// by UTF-8 validity of the sniffed window.
pub fn sniff_content_type(value: &[u8]) -> String {
    const SNIFF_LEN: usize = 512;

    let window = &value[..value.len().min(SNIFF_LEN)];
    if window.is_empty() {
        return "text/plain; charset=utf-8".to_string();
    }

    let magic: &[(&[u8], &str)] = &[
        (b"\x1f\x8b", "application/x-gzip"),
        (b"%PDF-", "application/pdf"),
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"PK\x03\x04", "application/zip"),
        (b"SQLite format 3\x00", "application/vnd.sqlite3"),
    ];
    for (prefix, ctype) in magic {
        if window.starts_with(prefix) {
            return ctype.to_string();
        }
    }

    match std::str::from_utf8(window) {
        Ok(text) => {
            let trimmed = text.trim_start();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                if serde_json::from_str::<serde_json::Value>(text).is_ok() {
                    return "application/json".to_string();
                }
            }
            if trimmed.starts_with("<?xml") {
                return "text/xml; charset=utf-8".to_string();
            }
            "text/plain; charset=utf-8".to_string()
        }
        // A multi-byte rune cut off at the window edge still sniffs as text
        Err(e) if e.valid_up_to() + 3 >= window.len() && window.len() == SNIFF_LEN => {
            "text/plain; charset=utf-8".to_string()
        }
        Err(_) => "application/octet-stream".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let fnv = HashAlgorithm::Fnv64;
        assert_eq!(fnv.fingerprint(b"bar"), fnv.fingerprint(b"bar"));
        assert_ne!(fnv.fingerprint(b"bar"), fnv.fingerprint(b"baz"));
        assert_eq!(fnv.fingerprint(b"bar").len(), 16);

        let sha = HashAlgorithm::Sha256;
        assert_eq!(sha.fingerprint(b"bar").len(), 64);
    }

    #[test]
    fn test_hash_algorithm_parse() {
        assert_eq!(
            "fnv".parse::<HashAlgorithm>().unwrap(),
            HashAlgorithm::Fnv64
        );
        assert_eq!(
            "SHA256".parse::<HashAlgorithm>().unwrap(),
            HashAlgorithm::Sha256
        );
        assert!("md5".parse::<HashAlgorithm>().is_err());
    }

    #[test]
    fn test_revision_ring_bounded() {
        let t = now();
        let mut state =
            EntryState::new(b"v1".to_vec(), "text/plain".into(), "h1".into(), "w1", t);

        for (i, v) in [b"v2", b"v3", b"v4"].iter().enumerate() {
            state.push_revision(2);
            state.version += 1;
            state.value = v.to_vec();
            state.hash = format!("h{}", i + 2);
            state.last_client_id = format!("w{}", i + 2);
            state.updated_at = Some(t);
        }

        assert_eq!(state.version, 4);
        assert_eq!(state.history.len(), 2);
        // 1 = oldest retained
        assert_eq!(state.revision(1).unwrap().value, b"v2");
        assert_eq!(state.revision(2).unwrap().value, b"v3");
        assert!(state.revision(3).is_none());
        assert!(state.revision(0).is_none());
        // each archived revision keeps the stamp of the client that
        // wrote that value
        assert_eq!(state.revision(1).unwrap().client_id, "w2");
        assert_eq!(state.revision(2).unwrap().client_id, "w3");
        assert_eq!(state.last_client_id, "w4");
    }

    #[test]
    fn test_lock_expiry() {
        let t = now();
        let lock = LockRecord::new("a", t, Some(Duration::from_secs(10)));
        assert!(!lock.is_expired_at(t));
        assert!(lock.is_expired_at(t + chrono::Duration::seconds(11)));
        assert!(lock.permits("a", t));
        assert!(!lock.permits("b", t));
        // expired locks permit anyone
        assert!(lock.permits("b", t + chrono::Duration::seconds(11)));

        let forever = LockRecord::new("a", t, None);
        assert!(!forever.is_expired_at(t + chrono::Duration::days(365)));
    }

    #[test]
    fn test_entry_expiry() {
        let t = now();
        let mut state = EntryState::new(b"x".to_vec(), "text/plain".into(), "h".into(), "c", t);
        assert!(!state.is_expired_at(t + chrono::Duration::days(1)));

        state.lifespan = Some(Duration::from_secs(1));
        state.lifespan_set_at = Some(t);
        assert!(!state.is_expired_at(t));
        assert!(state.is_expired_at(t + chrono::Duration::seconds(2)));
    }

    #[test]
    fn test_sniff_content_type() {
        assert_eq!(sniff_content_type(b"hello"), "text/plain; charset=utf-8");
        assert_eq!(sniff_content_type(b"{\"a\": 1}"), "application/json");
        assert_eq!(sniff_content_type(b"\x89PNG\r\n\x1a\nrest"), "image/png");
        assert_eq!(
            sniff_content_type(&[0xff, 0xfe, 0x00, 0x01]),
            "application/octet-stream"
        );
        assert_eq!(sniff_content_type(b"\x1f\x8b\x08"), "application/x-gzip");
    }

    #[test]
    fn test_key_metric_ticks() {
        let t = now();
        let mut m = KeyMetric::default();
        m.tick_access(t);
        m.tick_access(t + chrono::Duration::seconds(1));
        assert_eq!(m.access_count, 2);
        assert_eq!(m.first_accessed, Some(t));
        assert_eq!(m.last_accessed, Some(t + chrono::Duration::seconds(1)));
        assert_eq!(m.set_count, 0);
    }
}
