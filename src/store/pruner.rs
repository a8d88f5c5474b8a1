//! Background pruning loop.
//!
//! The kernel owns the selection logic (see `Kernel::prune_to`); this
//! loop drives it on a timer whenever the key count sits above the soft
//! threshold. Eager pruning under hard capacity pressure is invoked
//! synchronously by Set and does not pass through here.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::kernel::{Kernel, SYSTEM_CLIENT_ID};

/// Recorded prune runs kept for observability.
pub const PRUNE_HISTORY_LIMIT: usize = 100;

/// One prune run, eager or timed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneRun {
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub keys_before: u64,
    pub keys_after: u64,
    /// Keys expunged by this run
    pub selected: Vec<String>,
    pub eager: bool,
}

/// Timer-driven pruner.
pub struct Pruner {
    kernel: Arc<Kernel>,
}

impl Pruner {
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self { kernel }
    }

    /// Run until cancelled. Each tick prunes down to the background
    /// target when the soft threshold is exceeded.
    pub async fn run(&self, token: CancellationToken) {
        let config = self.kernel.config().prune.clone();
        if config.prune_at == 0 {
            debug!("background pruning disabled (PRUNE_AT=0)");
            return;
        }
        let mut interval = tokio::time::interval(config.prune_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }
            let keys = self.kernel.stats().await.keys;
            if keys <= config.prune_at {
                continue;
            }
            self.kernel
                .prune_to(config.prune_to, &HashSet::new(), false, SYSTEM_CLIENT_ID)
                .await;
        }
        debug!("pruner stopped");
    }
}
