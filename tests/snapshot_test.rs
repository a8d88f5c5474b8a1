//! Integration tests for snapshot durability across server lifecycles.

use std::sync::Arc;
use std::time::Duration;

use keyquarry::config::{ServerConfig, SnapshotConfig};
use keyquarry::event::EventBus;
use keyquarry::snapshot::{SnapshotEngine, SqliteSink};
use keyquarry::store::{Caller, InspectOptions, Kernel, MetricsRegistry, SetParams};
use tempfile::TempDir;

fn new_kernel(mutate: impl FnOnce(&mut ServerConfig)) -> Arc<Kernel> {
    let mut config = ServerConfig::default();
    mutate(&mut config);
    let metrics = Arc::new(MetricsRegistry::new());
    let bus = Arc::new(EventBus::new(64, Duration::from_millis(100), metrics.clone()));
    Arc::new(Kernel::new(config, bus, metrics))
}

async fn fs_engine(kernel: Arc<Kernel>, dir: &TempDir, limit: usize) -> SnapshotEngine {
    let config = SnapshotConfig {
        enabled: true,
        dir: Some(dir.path().to_path_buf()),
        limit,
        ..SnapshotConfig::default()
    };
    SnapshotEngine::from_config(kernel, config, Arc::new(MetricsRegistry::new()))
        .await
        .unwrap()
}

async fn populate(kernel: &Kernel, caller: &Caller) {
    for (key, value) in [("alpha", "1"), ("beta", "2"), ("gamma", "3")] {
        kernel
            .set(
                caller,
                SetParams {
                    key: key.to_string(),
                    value: value.as_bytes().to_vec(),
                    ..SetParams::default()
                },
            )
            .await
            .unwrap();
    }
    // give alpha some history and metrics
    kernel
        .set(
            caller,
            SetParams {
                key: "alpha".to_string(),
                value: b"1-updated".to_vec(),
                ..SetParams::default()
            },
        )
        .await
        .unwrap();
    kernel.get(caller, "alpha").await.unwrap();
    kernel.get(caller, "alpha").await.unwrap();
}

/// Everything present at shutdown comes back identical after restart:
/// value, hash, version, history length and metric counters.
#[tokio::test(flavor = "multi_thread")]
async fn test_restart_preserves_state() {
    let dir = TempDir::new().unwrap();
    let caller = Caller::new("c1", false);

    let kernel = new_kernel(|_| {});
    populate(&kernel, &caller).await;
    let engine = fs_engine(kernel.clone(), &dir, 5).await;
    engine.emit().await.unwrap();

    let before = kernel
        .inspect(&caller, "alpha", InspectOptions::default())
        .await
        .unwrap();
    let metric_before = kernel.key_metric("alpha").unwrap();

    // "restart": a brand-new kernel restored from the same directory
    let restored = new_kernel(|_| {});
    let engine2 = fs_engine(restored.clone(), &dir, 5).await;
    assert_eq!(engine2.restore_latest().await.unwrap(), Some(3));

    let after = restored
        .inspect(&caller, "alpha", InspectOptions::default())
        .await
        .unwrap();
    assert_eq!(after.version, before.version);
    assert_eq!(after.hash, before.hash);
    assert_eq!(after.history_length, before.history_length);
    assert_eq!(restored.get(&caller, "alpha").await.unwrap(), b"1-updated");
    assert_eq!(restored.get(&caller, "beta").await.unwrap(), b"2");
    assert_eq!(restored.get(&caller, "gamma").await.unwrap(), b"3");

    let metric_after = restored.key_metric("alpha").unwrap();
    assert_eq!(metric_after.set_count, metric_before.set_count);
    // the two gets above tick on top of the restored counter
    assert_eq!(metric_after.access_count, metric_before.access_count + 1);
}

/// History longer than the current revision limit is re-clamped on load.
#[tokio::test(flavor = "multi_thread")]
async fn test_restore_clamps_history() {
    let dir = TempDir::new().unwrap();
    let caller = Caller::new("c1", false);

    let kernel = new_kernel(|c| c.revision_limit = 10);
    for i in 0..6 {
        kernel
            .set(
                &caller,
                SetParams {
                    key: "k".to_string(),
                    value: format!("v{}", i).into_bytes(),
                    ..SetParams::default()
                },
            )
            .await
            .unwrap();
    }
    fs_engine(kernel, &dir, 5).await.emit().await.unwrap();

    let restored = new_kernel(|c| c.revision_limit = 2);
    fs_engine(restored.clone(), &dir, 5)
        .await
        .restore_latest()
        .await
        .unwrap();
    let info = restored
        .inspect(&caller, "k", InspectOptions::default())
        .await
        .unwrap();
    assert_eq!(info.version, 6);
    assert_eq!(info.history_length, 2);
    // the retained revisions are the newest ones
    let (v, _) = restored.get_revision(&caller, "k", 2).await.unwrap();
    assert_eq!(v, b"v4");
}

/// The SQLite sink behaves like the directory sink end to end.
#[tokio::test(flavor = "multi_thread")]
async fn test_sqlite_snapshot_lifecycle() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("snapshots.db");
    let caller = Caller::new("c1", false);

    let kernel = new_kernel(|_| {});
    populate(&kernel, &caller).await;

    let config = SnapshotConfig {
        enabled: true,
        database: Some(db.clone()),
        limit: 2,
        ..SnapshotConfig::default()
    };
    let engine = SnapshotEngine::from_config(
        kernel.clone(),
        config.clone(),
        Arc::new(MetricsRegistry::new()),
    )
    .await
    .unwrap();

    for _ in 0..4 {
        engine.emit().await.unwrap();
    }

    let restored = new_kernel(|_| {});
    let engine2 = SnapshotEngine::from_config(
        restored.clone(),
        config,
        Arc::new(MetricsRegistry::new()),
    )
    .await
    .unwrap();
    assert_eq!(engine2.restore_latest().await.unwrap(), Some(3));
    assert_eq!(restored.get(&caller, "beta").await.unwrap(), b"2");

    // rotation applied inside the database too
    let sink = SqliteSink::new(&db).await.unwrap();
    use keyquarry::snapshot::SnapshotSink;
    assert_eq!(sink.list().await.unwrap().len(), 2);
}

/// Encrypted images restore only under the right key, and the snapshot
/// loop emits on its timer.
#[tokio::test(flavor = "multi_thread")]
async fn test_snapshot_loop_and_encryption() {
    let dir = TempDir::new().unwrap();
    let caller = Caller::new("c1", false);

    let kernel = new_kernel(|_| {});
    populate(&kernel, &caller).await;

    let config = SnapshotConfig {
        enabled: true,
        dir: Some(dir.path().to_path_buf()),
        interval: Duration::from_millis(50),
        limit: 10,
        encrypt: true,
        secret_key: Some("test-secret".to_string()),
        ..SnapshotConfig::default()
    };
    let engine = Arc::new(
        SnapshotEngine::from_config(
            kernel.clone(),
            config.clone(),
            Arc::new(MetricsRegistry::new()),
        )
        .await
        .unwrap(),
    );

    let token = tokio_util::sync::CancellationToken::new();
    let loop_engine = engine.clone();
    let loop_token = token.clone();
    let handle = tokio::spawn(async move { loop_engine.run(loop_token).await });
    tokio::time::sleep(Duration::from_millis(180)).await;
    token.cancel();
    handle.await.unwrap();

    let mut images: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    images.sort();
    assert!(images.len() >= 2, "expected periodic emissions, got {:?}", images);
    assert!(images.iter().all(|n| n.ends_with(".json.aes.gz")));

    let restored = new_kernel(|_| {});
    let engine2 = SnapshotEngine::from_config(
        restored.clone(),
        config,
        Arc::new(MetricsRegistry::new()),
    )
    .await
    .unwrap();
    assert_eq!(engine2.restore_latest().await.unwrap(), Some(3));
}
