//! The store kernel.
//!
//! # Overview
//!
//! The kernel owns the indexed map of key entries, the per-key lifetime
//! metrics, and the mutation API the wire surface dispatches into. It
//! enforces the ordering, capacity and locking contracts:
//!
//! ```text
//! map guard (RwLock)          membership: create / remove / list
//!   └─→ entry mutex           value, history, lock, lifespan
//!         └─→ event publish   non-blocking ingress enqueue
//!         └─→ metric commit   per-key ticks, registry counters
//! ```
//!
//! Locks are always acquired in that order, and the map guard is never
//! taken while an entry mutex is held. Event publication is a
//! non-blocking enqueue, so pre-computed payloads may be published before
//! the entry mutex is released, which keeps per-key event order equal to
//! the order in which the entry mutex was held.
//!
//! Expiry is lazy: every read or write that touches a key first checks
//! its lifespan and removes the entry (emitting a single `Expired` event)
//! when it has elapsed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::entry::{
    sniff_content_type, EntryState, KeyEntry, KeyMetric, LockRecord,
};
use super::metrics::{MetricsRegistry, MetricsSnapshot};
use super::pruner::{PruneRun, PRUNE_HISTORY_LIMIT};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::event::{Event, EventBus, EventKind, ValueSnapshot};

/// Client id attributed to kernel-internal transitions (expiry, pruning).
pub const SYSTEM_CLIENT_ID: &str = "keyquarry/system";

/// Staleness score weights (see [`Kernel::prune_to`])
const W_AGE: f64 = 1.0;
const W_IDLE: f64 = 0.5;
const W_VERSION: f64 = 0.25;

/// Resolved caller identity attached to every operation.
#[derive(Debug, Clone)]
pub struct Caller {
    pub client_id: String,
    pub privileged: bool,
}

impl Caller {
    pub fn new(client_id: impl Into<String>, privileged: bool) -> Self {
        Self {
            client_id: client_id.into(),
            privileged,
        }
    }
}

/// Parameters for a Set operation.
#[derive(Debug, Clone, Default)]
pub struct SetParams {
    pub key: String,
    pub value: Vec<u8>,
    pub content_type: Option<String>,
    pub lock_duration: Option<Duration>,
    pub lifespan: Option<Duration>,
}

/// Result of an accepted Set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetOutcome {
    pub success: bool,
    pub is_new: bool,
    pub version: u64,
}

/// Options for Inspect.
#[derive(Debug, Clone, Copy, Default)]
pub struct InspectOptions {
    pub include_value: bool,
    pub include_metrics: bool,
}

/// Metadata snapshot returned by Inspect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyInfo {
    pub key: String,
    pub version: u64,
    pub hash: String,
    pub content_type: String,
    pub size: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub lifespan: Option<Duration>,
    pub lifespan_set_at: Option<DateTime<Utc>>,
    pub locked: bool,
    pub lock_owner: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub history_length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric: Option<KeyMetric>,
}

/// Aggregate counters returned by Stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelStats {
    pub keys: u64,
    pub max_keys: u64,
    /// current / max, 0.0 when unlimited
    pub pressure_used: f64,
    pub readonly: bool,
    pub subscribers: usize,
    pub metrics: MetricsSnapshot,
}

/// The single owned store object. Constructed once per server (or per
/// test) and shared behind an `Arc`; there is no process-wide instance.
pub struct Kernel {
    config: ServerConfig,
    entries: RwLock<HashMap<String, Arc<KeyEntry>>>,
    /// Lifetime metrics by key name; survives deletion and restore.
    key_metrics: std::sync::RwLock<HashMap<String, KeyMetric>>,
    readonly: AtomicBool,
    bus: Arc<EventBus>,
    metrics: Arc<MetricsRegistry>,
    prune_history: std::sync::Mutex<VecDeque<PruneRun>>,
}

impl Kernel {
    pub fn new(config: ServerConfig, bus: Arc<EventBus>, metrics: Arc<MetricsRegistry>) -> Self {
        let readonly = AtomicBool::new(config.readonly);
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            key_metrics: std::sync::RwLock::new(HashMap::new()),
            readonly,
            bus,
            metrics,
            prune_history: std::sync::Mutex::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn is_reserved(&self, key: &str) -> bool {
        key.starts_with(&self.config.reserved_prefix)
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly.load(Ordering::Relaxed)
    }

    // ---- validation -----------------------------------------------------

    fn check_writable(&self, caller: &Caller) -> Result<()> {
        if self.is_readonly() && !caller.privileged {
            return Err(Error::ReadOnly("server is in readonly mode".to_string()));
        }
        Ok(())
    }

    fn check_reserved_write(&self, caller: &Caller, key: &str) -> Result<()> {
        if self.is_reserved(key) && !caller.privileged {
            return Err(Error::PermissionDenied(format!(
                "key {:?} is reserved",
                key
            )));
        }
        Ok(())
    }

    fn validate_key(&self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("empty key name".to_string()));
        }
        if key.len() > self.config.max_key_length {
            return Err(Error::InvalidArgument(format!(
                "key length {} exceeds maximum {}",
                key.len(),
                self.config.max_key_length
            )));
        }
        Ok(())
    }

    fn validate_lock_duration(&self, duration: Duration) -> Result<()> {
        if duration < self.config.min_lock_duration {
            return Err(Error::InvalidArgument(format!(
                "lock duration below minimum {:?}",
                self.config.min_lock_duration
            )));
        }
        if duration > self.config.max_lock_duration {
            return Err(Error::InvalidArgument(format!(
                "lock duration exceeds maximum {:?}",
                self.config.max_lock_duration
            )));
        }
        Ok(())
    }

    // ---- shared plumbing ------------------------------------------------

    async fn get_entry(&self, key: &str) -> Option<Arc<KeyEntry>> {
        self.entries.read().await.get(key).cloned()
    }

    fn not_found(key: &str) -> Error {
        Error::NotFound(format!("key {:?}", key))
    }

    fn value_snapshot_if_watched(&self, key: &str, state: &EntryState) -> Option<ValueSnapshot> {
        if !self.bus.watches_key(key) {
            return None;
        }
        Some(ValueSnapshot {
            value: state.value.clone(),
            content_type: state.content_type.clone(),
            hash: state.hash.clone(),
            version: state.version,
        })
    }

    fn tick_access(&self, key: &str, now: DateTime<Utc>) {
        self.key_metrics
            .write()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .tick_access(now);
    }

    fn tick_set(&self, key: &str, now: DateTime<Utc>) {
        self.key_metrics
            .write()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .tick_set(now);
    }

    fn tick_lock(&self, key: &str, now: DateTime<Utc>) {
        self.key_metrics
            .write()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .tick_lock(now);
    }

    /// Lazy expiry: remove the entry if its lifespan has elapsed,
    /// emitting a single `Expired` event. Returns true when the entry is
    /// gone (expired here or already replaced).
    async fn remove_if_expired(&self, entry: &Arc<KeyEntry>) -> bool {
        {
            let state = entry.state.lock().await;
            if !state.is_expired_at(Utc::now()) {
                return false;
            }
        }
        // entry mutex released before escalating to the map write guard
        let mut map = self.entries.write().await;
        match map.get(&entry.name) {
            Some(current) if Arc::ptr_eq(current, entry) => {}
            // removed or recreated concurrently; nothing left to do here
            _ => return true,
        }
        let snapshot = {
            let state = entry.state.lock().await;
            if !state.is_expired_at(Utc::now()) {
                return false;
            }
            self.value_snapshot_if_watched(&entry.name, &state)
        };
        map.remove(&entry.name);
        drop(map);
        debug!(key = %entry.name, "key expired");
        self.bus.publish(
            Event::new(&entry.name, EventKind::Expired, SYSTEM_CLIENT_ID),
            snapshot,
        );
        true
    }

    // ---- mutation API ---------------------------------------------------

    /// Create or update a key.
    pub async fn set(&self, caller: &Caller, params: SetParams) -> Result<SetOutcome> {
        self.check_writable(caller)?;
        self.validate_key(&params.key)?;
        self.check_reserved_write(caller, &params.key)?;
        if params.value.len() > self.config.max_value_size {
            return Err(Error::InvalidArgument(format!(
                "value size {} exceeds maximum {}",
                params.value.len(),
                self.config.max_value_size
            )));
        }
        if let Some(d) = params.lock_duration {
            self.validate_lock_duration(d)?;
        }
        let hash = self.config.hash_algorithm.fingerprint(&params.value);

        // Retry bridges the races between expiry removal and concurrent
        // creation of the same key.
        for _ in 0..3 {
            if let Some(entry) = self.get_entry(&params.key).await {
                if !self.remove_if_expired(&entry).await {
                    return self.update_entry(caller, &entry, &params, &hash).await;
                }
            }
            match self.create_entry(caller, &params, &hash).await? {
                Some(outcome) => return Ok(outcome),
                None => continue,
            }
        }
        Err(Error::Internal(format!(
            "set of key {:?} kept racing, giving up",
            params.key
        )))
    }

    /// Create path. Returns Ok(None) when the key appeared concurrently
    /// and the caller should retry as an update.
    async fn create_entry(
        &self,
        caller: &Caller,
        params: &SetParams,
        hash: &str,
    ) -> Result<Option<SetOutcome>> {
        let mut map = self.entries.write().await;
        if map.contains_key(&params.key) {
            return Ok(None);
        }

        let max_keys = self.config.max_keys;
        if max_keys > 0 {
            let eager_at = match self.config.prune.eager_prune_at {
                0 => max_keys,
                n => n,
            };
            if map.len() as u64 >= eager_at.min(max_keys) {
                if !self.config.prune.eager_prune {
                    return Err(Error::CapacityExhausted(format!(
                        "{} keys at maximum {}",
                        map.len(),
                        max_keys
                    )));
                }
                let eager_to = match self.config.prune.eager_prune_to {
                    0 => max_keys.saturating_sub((max_keys / 10).max(1)),
                    n => n,
                };
                drop(map);
                let run = self
                    .prune_to(eager_to, &HashSet::new(), true, SYSTEM_CLIENT_ID)
                    .await;
                info!(
                    keys_before = run.keys_before,
                    keys_after = run.keys_after,
                    expunged = run.selected.len(),
                    "eager prune triggered by create"
                );
                map = self.entries.write().await;
                if map.contains_key(&params.key) {
                    return Ok(None);
                }
                if map.len() as u64 >= max_keys {
                    return Err(Error::CapacityExhausted(format!(
                        "{} keys at maximum {} after eager prune",
                        map.len(),
                        max_keys
                    )));
                }
            }
        }

        let now = Utc::now();
        let content_type = params
            .content_type
            .clone()
            .unwrap_or_else(|| sniff_content_type(&params.value));
        let mut state = EntryState::new(
            params.value.clone(),
            content_type,
            hash.to_string(),
            &caller.client_id,
            now,
        );

        let mut kinds = vec![EventKind::Created];
        if let Some(d) = params.lock_duration {
            state.lock = Some(LockRecord::new(&caller.client_id, now, Some(d)));
            kinds.push(EventKind::Locked);
        }
        if let Some(lifespan) = params.lifespan {
            state.lifespan = Some(lifespan);
            state.lifespan_set_at = Some(now);
            kinds.push(EventKind::LifespanSet);
        }

        let snapshot = self.value_snapshot_if_watched(&params.key, &state);
        let version = state.version;
        let locked = state.lock.is_some();
        map.insert(
            params.key.clone(),
            Arc::new(KeyEntry::new(params.key.clone(), state)),
        );
        drop(map);

        self.tick_set(&params.key, now);
        if locked {
            self.tick_lock(&params.key, now);
        }
        for kind in kinds {
            self.bus.publish(
                Event::new(&params.key, kind, &caller.client_id),
                snapshot.clone(),
            );
        }
        Ok(Some(SetOutcome {
            success: true,
            is_new: true,
            version,
        }))
    }

    async fn update_entry(
        &self,
        caller: &Caller,
        entry: &Arc<KeyEntry>,
        params: &SetParams,
        hash: &str,
    ) -> Result<SetOutcome> {
        let now = Utc::now();
        let mut state = entry.state.lock().await;
        state.sweep_expired_lock(now);
        if let Some(lock) = &state.lock {
            if lock.client_id != caller.client_id && !caller.privileged {
                return Err(Error::Locked(format!(
                    "key {:?} is locked by another client",
                    entry.name
                )));
            }
        }

        let mut kinds = Vec::new();
        let content_type_change = matches!(
            &params.content_type, Some(ct) if *ct != state.content_type
        );
        let noop = state.hash == hash && !content_type_change;
        if !noop {
            state.push_revision(self.config.revision_limit);
            state.version += 1;
            state.value = params.value.clone();
            state.content_type = params
                .content_type
                .clone()
                .unwrap_or_else(|| sniff_content_type(&params.value));
            state.hash = hash.to_string();
            state.last_client_id = caller.client_id.clone();
            state.updated_at = Some(now);
            kinds.push(EventKind::Updated);
        }
        if let Some(d) = params.lock_duration {
            state.lock = Some(LockRecord::new(&caller.client_id, now, Some(d)));
            kinds.push(EventKind::Locked);
        }
        if let Some(lifespan) = params.lifespan {
            let renewed = state.lifespan == Some(lifespan);
            state.lifespan = Some(lifespan);
            state.lifespan_set_at = Some(now);
            kinds.push(if renewed {
                EventKind::LifespanRenewed
            } else {
                EventKind::LifespanSet
            });
        }

        let version = state.version;
        let snapshot = if kinds.is_empty() {
            None
        } else {
            self.value_snapshot_if_watched(&entry.name, &state)
        };
        // metric commit happens under the entry mutex
        self.tick_set(&entry.name, now);
        if params.lock_duration.is_some() {
            self.tick_lock(&entry.name, now);
        }
        drop(state);

        for kind in kinds {
            self.bus.publish(
                Event::new(&entry.name, kind, &caller.client_id),
                snapshot.clone(),
            );
        }
        Ok(SetOutcome {
            success: true,
            is_new: false,
            version,
        })
    }

    /// Read the current value.
    pub async fn get(&self, caller: &Caller, key: &str) -> Result<Vec<u8>> {
        let entry = self
            .get_entry(key)
            .await
            .ok_or_else(|| Self::not_found(key))?;
        if self.remove_if_expired(&entry).await {
            return Err(Self::not_found(key));
        }
        let state = entry.state.lock().await;
        let value = state.value.clone();
        let snapshot = self.value_snapshot_if_watched(key, &state);
        self.tick_access(key, Utc::now());
        drop(state);
        self.bus.publish(
            Event::new(key, EventKind::Accessed, &caller.client_id),
            snapshot,
        );
        Ok(value)
    }

    /// Read a historical revision. Position 0 is the current value,
    /// positive positions index the ring: 1 is the oldest retained.
    pub async fn get_revision(
        &self,
        _caller: &Caller,
        key: &str,
        position: u64,
    ) -> Result<(Vec<u8>, DateTime<Utc>)> {
        let entry = self
            .get_entry(key)
            .await
            .ok_or_else(|| Self::not_found(key))?;
        if self.remove_if_expired(&entry).await {
            return Err(Self::not_found(key));
        }
        let state = entry.state.lock().await;
        if position == 0 {
            return Ok((
                state.value.clone(),
                state.updated_at.unwrap_or(state.created_at),
            ));
        }
        match state.revision(position) {
            Some(revision) => Ok((revision.value.clone(), revision.timestamp)),
            None => Err(Error::NotFound(format!(
                "key {:?} has no revision at position {}",
                key, position
            ))),
        }
    }

    /// Metadata snapshot. Ticks the access metric (and emits Accessed)
    /// only when the value itself is included.
    pub async fn inspect(
        &self,
        caller: &Caller,
        key: &str,
        opts: InspectOptions,
    ) -> Result<KeyInfo> {
        let entry = self
            .get_entry(key)
            .await
            .ok_or_else(|| Self::not_found(key))?;
        if self.remove_if_expired(&entry).await {
            return Err(Self::not_found(key));
        }
        let now = Utc::now();
        let state = entry.state.lock().await;
        let lock = state.lock.as_ref().filter(|l| !l.is_expired_at(now));
        let mut info = KeyInfo {
            key: key.to_string(),
            version: state.version,
            hash: state.hash.clone(),
            content_type: state.content_type.clone(),
            size: state.value.len(),
            created_at: state.created_at,
            updated_at: state.updated_at,
            lifespan: state.lifespan,
            lifespan_set_at: state.lifespan_set_at,
            locked: lock.is_some(),
            lock_owner: lock.map(|l| l.client_id.clone()),
            lock_expires_at: lock.and_then(|l| l.expires_at),
            history_length: state.history.len(),
            value: None,
            metric: None,
        };
        let mut snapshot = None;
        if opts.include_value {
            use base64::engine::general_purpose::STANDARD;
            use base64::Engine;
            info.value = Some(serde_json::Value::String(STANDARD.encode(&state.value)));
            snapshot = self.value_snapshot_if_watched(key, &state);
            self.tick_access(key, now);
        }
        drop(state);
        if opts.include_metrics {
            info.metric = self.key_metrics.read().unwrap().get(key).cloned();
        }
        if opts.include_value {
            self.bus.publish(
                Event::new(key, EventKind::Accessed, &caller.client_id),
                snapshot,
            );
        }
        Ok(info)
    }

    /// Remove a key. Returns false when it was already absent. The
    /// lifetime metric record is preserved.
    pub async fn delete(&self, caller: &Caller, key: &str) -> Result<bool> {
        self.check_writable(caller)?;
        self.check_reserved_write(caller, key)?;
        let Some(entry) = self.get_entry(key).await else {
            return Ok(false);
        };
        if self.remove_if_expired(&entry).await {
            return Ok(false);
        }

        let mut map = self.entries.write().await;
        match map.get(key) {
            Some(current) if Arc::ptr_eq(current, &entry) => {}
            _ => return Ok(false),
        }
        let snapshot = {
            let state = entry.state.lock().await;
            if let Some(lock) = &state.lock {
                if !lock.permits(&caller.client_id, Utc::now()) && !caller.privileged {
                    return Err(Error::Locked(format!(
                        "key {:?} is locked by another client",
                        key
                    )));
                }
            }
            self.value_snapshot_if_watched(key, &state)
        };
        map.remove(key);
        drop(map);
        self.bus.publish(
            Event::new(key, EventKind::Deleted, &caller.client_id),
            snapshot,
        );
        Ok(true)
    }

    /// Membership check. Honours lazy expiry but never ticks metrics.
    pub async fn exists(&self, _caller: &Caller, key: &str) -> Result<bool> {
        let Some(entry) = self.get_entry(key).await else {
            return Ok(false);
        };
        Ok(!self.remove_if_expired(&entry).await)
    }

    /// Get followed by Delete, atomically under the per-key guard.
    pub async fn pop(&self, caller: &Caller, key: &str) -> Result<Vec<u8>> {
        self.check_writable(caller)?;
        self.check_reserved_write(caller, key)?;
        let entry = self
            .get_entry(key)
            .await
            .ok_or_else(|| Self::not_found(key))?;
        if self.remove_if_expired(&entry).await {
            return Err(Self::not_found(key));
        }

        let mut map = self.entries.write().await;
        match map.get(key) {
            Some(current) if Arc::ptr_eq(current, &entry) => {}
            _ => return Err(Self::not_found(key)),
        }
        let now = Utc::now();
        let (value, snapshot) = {
            let state = entry.state.lock().await;
            if let Some(lock) = &state.lock {
                if !lock.permits(&caller.client_id, now) && !caller.privileged {
                    return Err(Error::Locked(format!(
                        "key {:?} is locked by another client",
                        key
                    )));
                }
            }
            self.tick_access(key, now);
            (
                state.value.clone(),
                self.value_snapshot_if_watched(key, &state),
            )
        };
        map.remove(key);
        drop(map);
        self.bus.publish(
            Event::new(key, EventKind::Accessed, &caller.client_id),
            snapshot.clone(),
        );
        self.bus.publish(
            Event::new(key, EventKind::Deleted, &caller.client_id),
            snapshot,
        );
        Ok(value)
    }

    /// Remove every non-reserved key. Without force, locked keys are
    /// skipped; with force (privileged only) locks are ignored.
    pub async fn clear(&self, caller: &Caller, force: bool) -> Result<u64> {
        self.check_writable(caller)?;
        if force && !caller.privileged {
            return Err(Error::PermissionDenied(
                "force clear requires the privileged client".to_string(),
            ));
        }

        let mut map = self.entries.write().await;
        let now = Utc::now();
        let mut removed = Vec::new();
        let names: Vec<String> = map.keys().cloned().collect();
        for name in names {
            if self.is_reserved(&name) {
                continue;
            }
            let entry = map.get(&name).cloned().unwrap();
            let state = entry.state.lock().await;
            let locked = matches!(&state.lock, Some(l) if !l.is_expired_at(now));
            if locked && !force {
                continue;
            }
            let snapshot = self.value_snapshot_if_watched(&name, &state);
            drop(state);
            map.remove(&name);
            removed.push((name, snapshot));
        }
        drop(map);

        let count = removed.len() as u64;
        for (name, snapshot) in removed {
            self.bus.publish(
                Event::new(&name, EventKind::Deleted, &caller.client_id),
                snapshot,
            );
        }
        info!(removed = count, force, "store cleared");
        Ok(count)
    }

    /// List key names, optionally filtered by a glob pattern. Reserved
    /// keys are excluded unless requested. Order is unspecified.
    pub async fn list_keys(
        &self,
        _caller: &Caller,
        pattern: Option<&str>,
        limit: usize,
        include_reserved: bool,
    ) -> Result<Vec<String>> {
        let pattern = match pattern {
            Some(p) => Some(
                Pattern::new(p)
                    .map_err(|e| Error::InvalidArgument(format!("bad pattern {:?}: {}", p, e)))?,
            ),
            None => None,
        };

        let entries: Vec<Arc<KeyEntry>> = self.entries.read().await.values().cloned().collect();
        let now = Utc::now();
        let mut keys = Vec::new();
        for entry in entries {
            if !include_reserved && self.is_reserved(&entry.name) {
                continue;
            }
            if let Some(p) = &pattern {
                if !p.matches(&entry.name) {
                    continue;
                }
            }
            // expired entries are invisible here; removal happens on the
            // next direct touch
            let state = entry.state.lock().await;
            if state.is_expired_at(now) {
                continue;
            }
            drop(state);
            keys.push(entry.name.clone());
            if limit > 0 && keys.len() >= limit {
                break;
            }
        }
        Ok(keys)
    }

    /// Acquire or extend an exclusive lock.
    pub async fn lock(
        &self,
        caller: &Caller,
        key: &str,
        duration: Duration,
        create_if_missing: bool,
    ) -> Result<()> {
        self.check_writable(caller)?;
        self.validate_key(key)?;
        self.check_reserved_write(caller, key)?;
        self.validate_lock_duration(duration)?;

        for _ in 0..3 {
            if let Some(entry) = self.get_entry(key).await {
                if self.remove_if_expired(&entry).await {
                    continue;
                }
                let now = Utc::now();
                let mut state = entry.state.lock().await;
                state.sweep_expired_lock(now);
                if let Some(lock) = &state.lock {
                    if lock.client_id != caller.client_id && !caller.privileged {
                        return Err(Error::Locked(format!(
                            "key {:?} is locked by another client",
                            key
                        )));
                    }
                }
                state.lock = Some(LockRecord::new(&caller.client_id, now, Some(duration)));
                let snapshot = self.value_snapshot_if_watched(key, &state);
                self.tick_lock(key, now);
                drop(state);
                self.bus.publish(
                    Event::new(key, EventKind::Locked, &caller.client_id),
                    snapshot,
                );
                return Ok(());
            }
            if !create_if_missing {
                return Err(Self::not_found(key));
            }
            let params = SetParams {
                key: key.to_string(),
                value: Vec::new(),
                content_type: None,
                lock_duration: Some(duration),
                lifespan: None,
            };
            let hash = self.config.hash_algorithm.fingerprint(&params.value);
            match self.create_entry(caller, &params, &hash).await? {
                Some(_) => return Ok(()),
                None => continue,
            }
        }
        Err(Error::Internal(format!(
            "lock of key {:?} kept racing, giving up",
            key
        )))
    }

    /// Release a lock. Only the owner or the privileged client may
    /// release a live lock; releasing an unlocked key is a no-op.
    pub async fn unlock(&self, caller: &Caller, key: &str) -> Result<()> {
        self.check_writable(caller)?;
        let entry = self
            .get_entry(key)
            .await
            .ok_or_else(|| Self::not_found(key))?;
        if self.remove_if_expired(&entry).await {
            return Err(Self::not_found(key));
        }
        let now = Utc::now();
        let mut state = entry.state.lock().await;
        state.sweep_expired_lock(now);
        match &state.lock {
            None => Ok(()),
            Some(lock) if lock.client_id != caller.client_id && !caller.privileged => {
                Err(Error::Locked(format!(
                    "key {:?} is locked by another client",
                    key
                )))
            }
            Some(_) => {
                state.lock = None;
                let snapshot = self.value_snapshot_if_watched(key, &state);
                drop(state);
                self.bus.publish(
                    Event::new(key, EventKind::Unlocked, &caller.client_id),
                    snapshot,
                );
                Ok(())
            }
        }
    }

    /// Toggle readonly mode. Privileged only.
    pub fn set_readonly(&self, caller: &Caller, enable: bool) -> Result<bool> {
        if !caller.privileged {
            return Err(Error::PermissionDenied(
                "readonly toggle requires the privileged client".to_string(),
            ));
        }
        let previous = self.readonly.swap(enable, Ordering::Relaxed);
        info!(enable, "readonly mode changed");
        Ok(previous)
    }

    /// Drop every revision ring. Privileged only. Returns the number of
    /// revisions discarded.
    pub async fn clear_history(&self, caller: &Caller) -> Result<u64> {
        if !caller.privileged {
            return Err(Error::PermissionDenied(
                "history clear requires the privileged client".to_string(),
            ));
        }
        let entries: Vec<Arc<KeyEntry>> = self.entries.read().await.values().cloned().collect();
        let mut discarded = 0u64;
        for entry in entries {
            let mut state = entry.state.lock().await;
            discarded += state.history.len() as u64;
            state.history.clear();
        }
        info!(discarded, "revision history cleared");
        Ok(discarded)
    }

    /// Lifetime metric for one key name, if it was ever touched.
    pub fn key_metric(&self, key: &str) -> Option<KeyMetric> {
        self.key_metrics.read().unwrap().get(key).cloned()
    }

    pub async fn stats(&self) -> KernelStats {
        let keys = self.entries.read().await.len() as u64;
        let max_keys = self.config.max_keys;
        KernelStats {
            keys,
            max_keys,
            pressure_used: if max_keys > 0 {
                keys as f64 / max_keys as f64
            } else {
                0.0
            },
            readonly: self.is_readonly(),
            subscribers: self.bus.subscriber_count(),
            metrics: self.metrics.snapshot(),
        }
    }

    // ---- pruning --------------------------------------------------------

    /// Expunge stale entries until at most `target` keys remain.
    ///
    /// Candidates exclude reserved keys, locked keys, keys younger than
    /// the minimum lifespan, and the explicit ignore set. The most stale
    /// by composite score go first; ties fall to the earlier creation
    /// timestamp.
    pub async fn prune_to(
        &self,
        target: u64,
        ignore: &HashSet<String>,
        eager: bool,
        actor: &str,
    ) -> PruneRun {
        let started = Utc::now();
        let keys_before = self.entries.read().await.len() as u64;
        let mut run = PruneRun {
            started,
            finished: started,
            keys_before,
            keys_after: keys_before,
            selected: Vec::new(),
            eager,
        };
        if keys_before <= target {
            run.finished = Utc::now();
            self.record_prune_run(&run, eager);
            return run;
        }
        let need = (keys_before - target) as usize;

        let entries: Vec<Arc<KeyEntry>> = self.entries.read().await.values().cloned().collect();
        let now = Utc::now();
        let min_age = chrono::Duration::from_std(self.config.min_lifespan)
            .unwrap_or_else(|_| chrono::Duration::zero());

        let mut scored: Vec<(f64, DateTime<Utc>, Arc<KeyEntry>)> = Vec::new();
        for entry in entries {
            if self.is_reserved(&entry.name) || ignore.contains(&entry.name) {
                continue;
            }
            let state = entry.state.lock().await;
            if matches!(&state.lock, Some(l) if !l.is_expired_at(now)) {
                continue;
            }
            if now - state.created_at < min_age {
                continue;
            }
            let created = state.created_at;
            let versions = state.version;
            drop(state);

            let metric = self
                .key_metrics
                .read()
                .unwrap()
                .get(&entry.name)
                .cloned()
                .unwrap_or_default();
            let last_accessed = metric.last_accessed.unwrap_or(created);
            let idle_secs = (now - last_accessed).num_milliseconds().max(0) as f64 / 1000.0;
            let score = W_AGE * idle_secs
                + W_IDLE / metric.access_count.max(1) as f64
                + W_VERSION / versions.max(1) as f64;
            scored.push((score, created, entry));
        }
        // most stale first
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
        });

        let mut map = self.entries.write().await;
        let mut expunged = Vec::new();
        for (_, _, entry) in scored {
            if expunged.len() >= need {
                break;
            }
            match map.get(&entry.name) {
                Some(current) if Arc::ptr_eq(current, &entry) => {}
                _ => continue,
            }
            let state = entry.state.lock().await;
            if matches!(&state.lock, Some(l) if !l.is_expired_at(now)) {
                continue;
            }
            let snapshot = self.value_snapshot_if_watched(&entry.name, &state);
            drop(state);
            map.remove(&entry.name);
            expunged.push((entry.name.clone(), snapshot));
        }
        run.keys_after = map.len() as u64;
        drop(map);

        for (name, snapshot) in &expunged {
            self.bus.publish(
                Event::new(name, EventKind::Expunged, actor),
                snapshot.clone(),
            );
        }
        run.selected = expunged.into_iter().map(|(name, _)| name).collect();
        run.finished = Utc::now();
        info!(
            eager,
            keys_before = run.keys_before,
            keys_after = run.keys_after,
            expunged = run.selected.len(),
            "prune run finished"
        );
        self.record_prune_run(&run, eager);
        run
    }

    fn record_prune_run(&self, run: &PruneRun, eager: bool) {
        self.metrics
            .record_prune_run(eager, run.selected.len() as u64);
        let mut history = self.prune_history.lock().unwrap();
        history.push_back(run.clone());
        while history.len() > PRUNE_HISTORY_LIMIT {
            history.pop_front();
        }
    }

    /// Administrative prune. Privileged only.
    pub async fn prune(
        &self,
        caller: &Caller,
        prune_to: u64,
        ignore: HashSet<String>,
    ) -> Result<PruneRun> {
        if !caller.privileged {
            return Err(Error::PermissionDenied(
                "prune requires the privileged client".to_string(),
            ));
        }
        Ok(self
            .prune_to(prune_to, &ignore, false, &caller.client_id)
            .await)
    }

    /// Recorded prune runs, oldest first.
    pub fn prune_history(&self) -> Vec<PruneRun> {
        self.prune_history.lock().unwrap().iter().cloned().collect()
    }

    // ---- snapshot support -----------------------------------------------

    /// Point-in-time logical copy for the snapshot engine: entry states
    /// and key metrics, record-sorted by key name. The map guard is held
    /// only long enough to clone the entry references.
    pub async fn snapshot_view(&self) -> (Vec<(String, EntryState)>, Vec<(String, KeyMetric)>) {
        let entries: Vec<Arc<KeyEntry>> = self.entries.read().await.values().cloned().collect();
        let mut states = Vec::with_capacity(entries.len());
        for entry in entries {
            let state = entry.state.lock().await;
            states.push((entry.name.clone(), state.clone()));
        }
        states.sort_by(|a, b| a.0.cmp(&b.0));

        let mut metrics: Vec<(String, KeyMetric)> = self
            .key_metrics
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        metrics.sort_by(|a, b| a.0.cmp(&b.0));
        (states, metrics)
    }

    /// Rebuild the kernel from a decoded snapshot image. Replaces all
    /// current state; revision rings are re-clamped to the configured
    /// limit.
    pub async fn load_snapshot(
        &self,
        entries: Vec<(String, EntryState)>,
        key_metrics: Vec<(String, KeyMetric)>,
    ) {
        let mut map = self.entries.write().await;
        map.clear();
        for (name, mut state) in entries {
            while state.history.len() > self.config.revision_limit {
                state.history.pop_front();
            }
            map.insert(name.clone(), Arc::new(KeyEntry::new(name, state)));
        }
        let count = map.len();
        drop(map);
        *self.key_metrics.write().unwrap() = key_metrics.into_iter().collect();
        info!(keys = count, "kernel state restored from snapshot");
    }
}
