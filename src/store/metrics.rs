//! Server-wide metrics registry.
//!
//! Single-writer counters aggregated by event kind plus snapshot and
//! prune counters. Readers get a consistent point-in-time snapshot
//! suitable for the Stats operation and the monitor surface.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::event::EventKind;

/// Counters shared by the kernel, the bus and the background loops.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    events: [AtomicU64; EventKind::ALL.len()],
    events_dropped: AtomicU64,
    prune_runs: AtomicU64,
    eager_prune_runs: AtomicU64,
    keys_pruned: AtomicU64,
    snapshots_taken: AtomicU64,
    snapshot_failures: AtomicU64,
    clients_registered: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event(&self, kind: EventKind) {
        self.events[kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_event(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_prune_run(&self, eager: bool, pruned: u64) {
        if eager {
            self.eager_prune_runs.fetch_add(1, Ordering::Relaxed);
        } else {
            self.prune_runs.fetch_add(1, Ordering::Relaxed);
        }
        self.keys_pruned.fetch_add(pruned, Ordering::Relaxed);
    }

    pub fn record_snapshot(&self, ok: bool) {
        if ok {
            self.snapshots_taken.fetch_add(1, Ordering::Relaxed);
        } else {
            self.snapshot_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_client_registered(&self) {
        self.clients_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_count(&self, kind: EventKind) -> u64 {
        self.events[kind as usize].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut events = BTreeMap::new();
        for kind in EventKind::ALL {
            let n = self.events[kind as usize].load(Ordering::Relaxed);
            if n > 0 {
                events.insert(kind.as_str().to_string(), n);
            }
        }
        MetricsSnapshot {
            events,
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            prune_runs: self.prune_runs.load(Ordering::Relaxed),
            eager_prune_runs: self.eager_prune_runs.load(Ordering::Relaxed),
            keys_pruned: self.keys_pruned.load(Ordering::Relaxed),
            snapshots_taken: self.snapshots_taken.load(Ordering::Relaxed),
            snapshot_failures: self.snapshot_failures.load(Ordering::Relaxed),
            clients_registered: self.clients_registered.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the registry counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Published events by kind; kinds with zero count are omitted
    pub events: BTreeMap<String, u64>,
    pub events_dropped: u64,
    pub prune_runs: u64,
    pub eager_prune_runs: u64,
    pub keys_pruned: u64,
    pub snapshots_taken: u64,
    pub snapshot_failures: u64,
    pub clients_registered: u64,
}
