//! Snapshot engine.
//!
//! Periodically serializes the full kernel image, layers it through the
//! codec (JSON, gzip, optional AES-256-GCM), stores it in the configured
//! sink and rotates old images out. On startup the newest readable image
//! is decoded and loaded back into the kernel; corrupt images fall back
//! to the next-newest.

pub mod codec;
pub mod sink;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SnapshotConfig;
use crate::error::{Error, Result};
use crate::store::{EntryState, Kernel, KeyMetric, MetricsRegistry};

pub use sink::{FsSink, SnapshotSink, SqliteSink};

/// Image format version tag.
pub const IMAGE_VERSION: u32 = 1;

/// One key entry as persisted in an image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryRecord {
    pub key: String,
    #[serde(flatten)]
    pub state: EntryState,
}

/// One per-key lifetime metric as persisted in an image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyMetricRecord {
    pub key: String,
    #[serde(flatten)]
    pub metric: KeyMetric,
}

/// Whole-kernel point-in-time image. Entry and metric tables are sorted
/// by key name so the encoding is deterministic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotImage {
    pub version: u32,
    pub config_digest: String,
    pub taken_at: DateTime<Utc>,
    pub key_metrics: Vec<KeyMetricRecord>,
    pub entries: Vec<EntryRecord>,
}

/// Digest of the semantic limits an image was taken under, used to flag
/// configuration drift on restore.
pub fn config_digest(kernel: &Kernel) -> String {
    let config = kernel.config();
    let material = format!(
        "v{}:max_keys={}:max_value_size={}:revision_limit={}:hash={}",
        IMAGE_VERSION,
        config.max_keys,
        config.max_value_size,
        config.revision_limit,
        config.hash_algorithm.as_str(),
    );
    format!("{:x}", Sha256::digest(material.as_bytes()))
}

/// Periodic snapshot engine bound to one kernel and one sink.
pub struct SnapshotEngine {
    kernel: Arc<Kernel>,
    sink: Box<dyn SnapshotSink>,
    config: SnapshotConfig,
    metrics: Arc<MetricsRegistry>,
    key: Option<[u8; 32]>,
    seq: AtomicU64,
}

impl SnapshotEngine {
    /// Build the engine from configuration, selecting the SQLite sink
    /// when a database path is set and the filesystem sink otherwise.
    pub async fn from_config(
        kernel: Arc<Kernel>,
        config: SnapshotConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self> {
        let sink: Box<dyn SnapshotSink> = if let Some(db) = &config.database {
            info!(db = %db.display(), "snapshot sink: sqlite database");
            Box::new(SqliteSink::new(db).await?)
        } else if let Some(dir) = &config.dir {
            info!(dir = %dir.display(), "snapshot sink: filesystem directory");
            Box::new(FsSink::new(dir).await?)
        } else {
            return Err(Error::InvalidArgument(
                "snapshot engine requires a directory or database".to_string(),
            ));
        };
        Ok(Self::new(kernel, sink, config, metrics))
    }

    pub fn new(
        kernel: Arc<Kernel>,
        sink: Box<dyn SnapshotSink>,
        config: SnapshotConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let key = if config.encrypt {
            config.secret_key.as_deref().map(codec::derive_key)
        } else {
            None
        };
        Self {
            kernel,
            sink,
            config,
            metrics,
            key,
            seq: AtomicU64::new(0),
        }
    }

    fn image_name(&self, taken_at: DateTime<Utc>, suffix: &str) -> String {
        // the sequence number keeps names unique (and sorted) within one
        // millisecond
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}-{:06}{}",
            taken_at.format("%Y%m%d%H%M%S%3f"),
            seq,
            suffix
        )
    }

    /// Serialize, layer and store one full image, then rotate.
    pub async fn emit(&self) -> Result<String> {
        let result = self.emit_inner().await;
        self.metrics.record_snapshot(result.is_ok());
        result
    }

    async fn emit_inner(&self) -> Result<String> {
        let taken_at = Utc::now();
        let (entries, key_metrics) = self.kernel.snapshot_view().await;
        let image = SnapshotImage {
            version: IMAGE_VERSION,
            config_digest: config_digest(&self.kernel),
            taken_at,
            key_metrics: key_metrics
                .into_iter()
                .map(|(key, metric)| KeyMetricRecord { key, metric })
                .collect(),
            entries: entries
                .into_iter()
                .map(|(key, state)| EntryRecord { key, state })
                .collect(),
        };
        let json = serde_json::to_vec(&image)?;
        let (bytes, suffix) = codec::encode(&json, self.key.as_ref())?;
        let name = self.image_name(taken_at, suffix);
        self.sink.store(&name, &bytes).await?;
        info!(
            name,
            keys = image.entries.len(),
            bytes = bytes.len(),
            "snapshot emitted"
        );
        self.rotate().await?;
        Ok(name)
    }

    /// Keep only the most recent `limit` images, by name order.
    async fn rotate(&self) -> Result<()> {
        if self.config.limit == 0 {
            return Ok(());
        }
        let names = self.sink.list().await?;
        if names.len() <= self.config.limit {
            return Ok(());
        }
        let excess = names.len() - self.config.limit;
        for name in &names[..excess] {
            self.sink.remove(name).await?;
            debug!(name, "rotated out old snapshot");
        }
        Ok(())
    }

    /// Load the newest readable image into the kernel. Returns the
    /// restored key count, or None when no images exist. Fails only when
    /// images exist but none decodes.
    pub async fn restore_latest(&self) -> Result<Option<usize>> {
        let names = self.sink.list().await?;
        if names.is_empty() {
            return Ok(None);
        }
        for name in names.iter().rev() {
            match self.try_restore(name).await {
                Ok(count) => {
                    info!(name, keys = count, "restored from snapshot");
                    return Ok(Some(count));
                }
                Err(e) => {
                    warn!(name, error = %e, "snapshot unreadable, trying next-newest");
                }
            }
        }
        Err(Error::Internal(format!(
            "no readable snapshot among {} images",
            names.len()
        )))
    }

    async fn try_restore(&self, name: &str) -> Result<usize> {
        let bytes = self.sink.load(name).await?;
        let json = codec::decode(name, &bytes, self.key.as_ref())?;
        let image: SnapshotImage = serde_json::from_slice(&json)?;
        if image.version != IMAGE_VERSION {
            return Err(Error::Internal(format!(
                "unsupported image version {}",
                image.version
            )));
        }
        if image.config_digest != config_digest(&self.kernel) {
            warn!(
                name,
                "snapshot was taken under a different configuration; history \
                 will be re-clamped to the current revision limit"
            );
        }
        let count = image.entries.len();
        self.kernel
            .load_snapshot(
                image
                    .entries
                    .into_iter()
                    .map(|r| (r.key, r.state))
                    .collect(),
                image
                    .key_metrics
                    .into_iter()
                    .map(|r| (r.key, r.metric))
                    .collect(),
            )
            .await;
        Ok(count)
    }

    /// Timer loop: emit one image every interval until cancelled.
    /// Emission failures are logged and counted, never escalated.
    pub async fn run(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // the first tick fires immediately; the startup image is not
        // interesting, so consume it
        interval.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.emit().await {
                error!(error = %e, "periodic snapshot failed");
            }
        }
        debug!("snapshot loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::event::EventBus;
    use crate::store::{Caller, SetParams};
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_kernel() -> Arc<Kernel> {
        let metrics = Arc::new(MetricsRegistry::new());
        let bus = Arc::new(EventBus::new(16, Duration::from_millis(50), metrics.clone()));
        Arc::new(Kernel::new(ServerConfig::default(), bus, metrics))
    }

    async fn engine_with_dir(
        kernel: Arc<Kernel>,
        dir: &TempDir,
        mutate: impl FnOnce(&mut SnapshotConfig),
    ) -> SnapshotEngine {
        let mut config = SnapshotConfig {
            enabled: true,
            dir: Some(dir.path().to_path_buf()),
            limit: 3,
            ..SnapshotConfig::default()
        };
        mutate(&mut config);
        let metrics = Arc::new(MetricsRegistry::new());
        SnapshotEngine::from_config(kernel, config, metrics)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_emit_restore_round_trip() {
        let dir = TempDir::new().unwrap();
        let kernel = test_kernel();
        let c = Caller::new("c1", false);
        for (k, v) in [("a", "1"), ("b", "2")] {
            kernel
                .set(
                    &c,
                    SetParams {
                        key: k.to_string(),
                        value: v.as_bytes().to_vec(),
                        ..SetParams::default()
                    },
                )
                .await
                .unwrap();
        }
        kernel.get(&c, "a").await.unwrap();

        let engine = engine_with_dir(kernel.clone(), &dir, |_| {}).await;
        engine.emit().await.unwrap();

        let restored_kernel = test_kernel();
        let engine2 = engine_with_dir(restored_kernel.clone(), &dir, |_| {}).await;
        let count = engine2.restore_latest().await.unwrap();
        assert_eq!(count, Some(2));
        assert_eq!(restored_kernel.get(&c, "a").await.unwrap(), b"1");
        assert_eq!(restored_kernel.get(&c, "b").await.unwrap(), b"2");
        // lifetime metrics ride along
        assert!(restored_kernel.key_metric("a").unwrap().access_count >= 1);
    }

    #[tokio::test]
    async fn test_encrypted_round_trip() {
        let dir = TempDir::new().unwrap();
        let kernel = test_kernel();
        let c = Caller::new("c1", false);
        kernel
            .set(
                &c,
                SetParams {
                    key: "secret-key".to_string(),
                    value: b"secret-value".to_vec(),
                    ..SetParams::default()
                },
            )
            .await
            .unwrap();

        let encrypting = |cfg: &mut SnapshotConfig| {
            cfg.encrypt = true;
            cfg.secret_key = Some("hunter2".to_string());
        };
        let engine = engine_with_dir(kernel, &dir, encrypting).await;
        let name = engine.emit().await.unwrap();
        assert!(name.ends_with(".json.aes.gz"));

        // bytes on disk are opaque
        let raw = tokio::fs::read(dir.path().join(&name)).await.unwrap();
        assert!(!raw.windows(12).any(|w| w == b"secret-value"));

        let restored = test_kernel();
        let engine2 = engine_with_dir(restored.clone(), &dir, encrypting).await;
        assert_eq!(engine2.restore_latest().await.unwrap(), Some(1));
        assert_eq!(
            restored.get(&Caller::new("c1", false), "secret-key").await.unwrap(),
            b"secret-value"
        );

        // wrong key cannot restore
        let engine3 = engine_with_dir(test_kernel(), &dir, |cfg| {
            cfg.encrypt = true;
            cfg.secret_key = Some("wrong".to_string());
        })
        .await;
        assert!(engine3.restore_latest().await.is_err());
    }

    #[tokio::test]
    async fn test_rotation_keeps_newest() {
        let dir = TempDir::new().unwrap();
        let kernel = test_kernel();
        let c = Caller::new("c1", false);
        let engine = engine_with_dir(kernel.clone(), &dir, |cfg| cfg.limit = 3).await;

        let mut names = Vec::new();
        for i in 0..4 {
            kernel
                .set(
                    &c,
                    SetParams {
                        key: format!("k{}", i),
                        value: b"v".to_vec(),
                        ..SetParams::default()
                    },
                )
                .await
                .unwrap();
            names.push(engine.emit().await.unwrap());
        }

        let remaining = engine.sink.list().await.unwrap();
        assert_eq!(remaining.len(), 3);
        // the oldest image is gone, the newest survives
        assert!(!remaining.contains(&names[0]));
        assert!(remaining.contains(&names[3]));

        // newest image holds all four keys
        let restored = test_kernel();
        let engine2 = engine_with_dir(restored.clone(), &dir, |_| {}).await;
        assert_eq!(engine2.restore_latest().await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_falls_back() {
        let dir = TempDir::new().unwrap();
        let kernel = test_kernel();
        let c = Caller::new("c1", false);
        kernel
            .set(
                &c,
                SetParams {
                    key: "good".to_string(),
                    value: b"v".to_vec(),
                    ..SetParams::default()
                },
            )
            .await
            .unwrap();

        let engine = engine_with_dir(kernel, &dir, |_| {}).await;
        engine.emit().await.unwrap();

        // a newer image full of garbage
        tokio::fs::write(dir.path().join("99999999999999999-000000.json.gz"), b"junk")
            .await
            .unwrap();

        let restored = test_kernel();
        let engine2 = engine_with_dir(restored.clone(), &dir, |_| {}).await;
        assert_eq!(engine2.restore_latest().await.unwrap(), Some(1));
        assert!(restored
            .exists(&Caller::new("c1", false), "good")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_restore_with_no_images() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with_dir(test_kernel(), &dir, |_| {}).await;
        assert_eq!(engine.restore_latest().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_image_encoding_deterministic() {
        let kernel = test_kernel();
        let c = Caller::new("c1", false);
        for k in ["zebra", "apple", "mango"] {
            kernel
                .set(
                    &c,
                    SetParams {
                        key: k.to_string(),
                        value: b"v".to_vec(),
                        ..SetParams::default()
                    },
                )
                .await
                .unwrap();
        }

        let (entries, _) = kernel.snapshot_view().await;
        let keys: Vec<&str> = entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["apple", "mango", "zebra"]);
    }
}
