//! Event fan-out.
//!
//! Publishers never block: the kernel pushes pre-computed events onto an
//! unbounded ingress queue (safe to do while an entry mutex is still
//! held), and a single dispatcher task fans them out to bounded
//! per-subscriber queues. A subscriber that cannot keep up within the
//! send timeout loses that event and a drop counter is incremented;
//! closed queues are pruned silently.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Event, EventKind, KeyValueFrame, ValueSnapshot};
use crate::store::MetricsRegistry;

/// Filter axes for a subscription. An event is delivered iff it matches
/// every non-empty axis.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub keys: HashSet<String>,
    pub kinds: HashSet<EventKind>,
    pub client_ids: HashSet<String>,
}

impl SubscriptionFilter {
    pub fn admits(&self, event: &Event) -> bool {
        if !self.keys.is_empty() && !self.keys.contains(&event.key) {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if !self.client_ids.is_empty() && !self.client_ids.contains(&event.client_id) {
            return false;
        }
        true
    }
}

struct Subscriber {
    filter: SubscriptionFilter,
    tx: mpsc::Sender<Event>,
}

struct ValueWatcher {
    key: String,
    tx: mpsc::Sender<KeyValueFrame>,
}

struct Published {
    event: Event,
    value: Option<ValueSnapshot>,
}

/// Publisher-side structure mapping subscriber id to bounded queue.
pub struct EventBus {
    ingress_tx: mpsc::UnboundedSender<Published>,
    ingress_rx: Mutex<Option<mpsc::UnboundedReceiver<Published>>>,
    subscribers: RwLock<HashMap<u64, Subscriber>>,
    value_watchers: RwLock<HashMap<u64, ValueWatcher>>,
    next_id: AtomicU64,
    buffer_size: usize,
    send_timeout: Duration,
    metrics: Arc<MetricsRegistry>,
}

impl EventBus {
    pub fn new(
        buffer_size: usize,
        send_timeout: Duration,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let (ingress_tx, ingress_rx) = mpsc::unbounded_channel();
        Self {
            ingress_tx,
            ingress_rx: Mutex::new(Some(ingress_rx)),
            subscribers: RwLock::new(HashMap::new()),
            value_watchers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer_size: buffer_size.max(1),
            send_timeout,
            metrics,
        }
    }

    /// Enqueue an event for fan-out. Never blocks; callers may still hold
    /// an entry mutex.
    pub fn publish(&self, event: Event, value: Option<ValueSnapshot>) {
        self.metrics.record_event(event.kind);
        if self.ingress_tx.send(Published { event, value }).is_err() {
            // dispatcher already shut down
            debug!("event bus closed, dropping event");
        }
    }

    /// Whether any key-value watcher is interested in `key`. Used by the
    /// kernel to decide if a value snapshot must be captured.
    pub fn watches_key(&self, key: &str) -> bool {
        self.value_watchers
            .read()
            .unwrap()
            .values()
            .any(|w| w.key == key)
    }

    /// Register a filtered event subscriber.
    pub fn subscribe(&self, filter: SubscriptionFilter) -> (u64, mpsc::Receiver<Event>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer_size);
        self.subscribers
            .write()
            .unwrap()
            .insert(id, Subscriber { filter, tx });
        debug!(subscriber = id, "event subscriber registered");
        (id, rx)
    }

    /// Remove a subscriber; its queue closes once drained.
    pub fn unsubscribe(&self, id: u64) {
        if self.subscribers.write().unwrap().remove(&id).is_some() {
            debug!(subscriber = id, "event subscriber removed");
        }
    }

    /// Register a single-key value watcher.
    pub fn watch_key(&self, key: &str) -> (u64, mpsc::Receiver<KeyValueFrame>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer_size);
        self.value_watchers.write().unwrap().insert(
            id,
            ValueWatcher {
                key: key.to_string(),
                tx,
            },
        );
        debug!(watcher = id, key, "key-value watcher registered");
        (id, rx)
    }

    pub fn unwatch_key(&self, id: u64) {
        if self.value_watchers.write().unwrap().remove(&id).is_some() {
            debug!(watcher = id, "key-value watcher removed");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap().len() + self.value_watchers.read().unwrap().len()
    }

    /// Drop every subscriber queue. In-flight receivers drain and end.
    pub fn close_all(&self) {
        self.subscribers.write().unwrap().clear();
        self.value_watchers.write().unwrap().clear();
    }

    /// Dispatcher loop: drain the ingress queue and fan out until
    /// cancelled. One delivery pass per event keeps per-subscriber order
    /// equal to publish order.
    pub async fn run(&self, token: CancellationToken) {
        let mut rx = self
            .ingress_rx
            .lock()
            .unwrap()
            .take()
            .expect("event bus dispatcher started twice");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                published = rx.recv() => match published {
                    Some(published) => self.dispatch(published).await,
                    None => break,
                },
            }
        }
        self.close_all();
        debug!("event dispatcher stopped");
    }

    async fn dispatch(&self, published: Published) {
        let Published { event, value } = published;

        // Collect matching senders first; the table guards are never held
        // across an await.
        let targets: Vec<(u64, mpsc::Sender<Event>)> = {
            let subs = self.subscribers.read().unwrap();
            subs.iter()
                .filter(|(_, s)| s.filter.admits(&event))
                .map(|(id, s)| (*id, s.tx.clone()))
                .collect()
        };

        let mut dead = Vec::new();
        for (id, tx) in targets {
            match timeout(self.send_timeout, tx.send(event.clone())).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => dead.push(id),
                Err(_) => {
                    self.metrics.record_dropped_event();
                    warn!(
                        subscriber = id,
                        key = %event.key,
                        kind = %event.kind,
                        "subscriber queue full past deadline, event dropped"
                    );
                }
            }
        }
        if !dead.is_empty() {
            let mut subs = self.subscribers.write().unwrap();
            for id in dead {
                subs.remove(&id);
            }
        }

        if let Some(value) = value {
            let frame = KeyValueFrame::from_event(&event, &value);
            let watchers: Vec<(u64, mpsc::Sender<KeyValueFrame>)> = {
                let watchers = self.value_watchers.read().unwrap();
                watchers
                    .iter()
                    .filter(|(_, w)| w.key == event.key)
                    .map(|(id, w)| (*id, w.tx.clone()))
                    .collect()
            };
            let mut dead = Vec::new();
            for (id, tx) in watchers {
                match timeout(self.send_timeout, tx.send(frame.clone())).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => dead.push(id),
                    Err(_) => {
                        self.metrics.record_dropped_event();
                        warn!(watcher = id, key = %event.key, "watcher queue full, frame dropped");
                    }
                }
            }
            if !dead.is_empty() {
                let mut watchers = self.value_watchers.write().unwrap();
                for id in dead {
                    watchers.remove(&id);
                }
            }
        }
    }
}
