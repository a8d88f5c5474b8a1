//! Server assembly and lifecycle.
//!
//! `start_server` builds the kernel and its collaborators, restores the
//! newest snapshot, spawns the background loops (event dispatcher,
//! pruner, snapshot emitter, monitor), and serves the wire protocol
//! until shutdown. Shutdown cancels the root token, drains the loops
//! within the graceful timeout, flushes a final snapshot and closes
//! subscriber queues.

pub mod gate;
pub mod monitor;

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::event::{EventBus, SubscriptionFilter};
use crate::network::ProtocolServer;
use crate::snapshot::SnapshotEngine;
use crate::store::{Kernel, MetricsRegistry, Pruner};

pub use gate::AccessGate;

/// Shared application state.
///
/// One instance per server; tests build their own so kernels stay
/// independent.
pub struct AppState {
    pub kernel: Arc<Kernel>,
    pub gate: Arc<AccessGate>,
    pub metrics: Arc<MetricsRegistry>,
    pub snapshots: Option<Arc<SnapshotEngine>>,
    pub config: ServerConfig,
    pub shutdown: CancellationToken,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .finish()
    }
}

/// Build the state graph: metrics, bus, kernel, gate, snapshot engine.
/// Restores the newest snapshot unless `start_fresh` is set.
pub async fn build_state(config: ServerConfig) -> anyhow::Result<Arc<AppState>> {
    config.validate()?;

    let metrics = Arc::new(MetricsRegistry::new());
    let bus = Arc::new(EventBus::new(
        config.event_stream_buffer_size,
        config.event_stream_send_timeout,
        metrics.clone(),
    ));
    let kernel = Arc::new(Kernel::new(config.clone(), bus, metrics.clone()));

    let snapshots = if config.snapshot.enabled {
        let engine = Arc::new(
            SnapshotEngine::from_config(kernel.clone(), config.snapshot.clone(), metrics.clone())
                .await?,
        );
        if config.start_fresh {
            info!("🆕 START_FRESH set, skipping snapshot restore");
        } else {
            match engine.restore_latest().await? {
                Some(keys) => info!(keys, "✅ Restored state from snapshot"),
                None => info!("No snapshots found, starting empty"),
            }
        }
        Some(engine)
    } else {
        None
    };

    let gate = Arc::new(AccessGate::new(
        config.privileged_client_id.clone(),
        metrics.clone(),
    ));

    Ok(Arc::new(AppState {
        kernel,
        gate,
        metrics,
        snapshots,
        config,
        shutdown: CancellationToken::new(),
    }))
}

/// Start the server and run until shutdown.
pub async fn start_server(config: ServerConfig) -> anyhow::Result<()> {
    info!("🚀 KeyQuarry {} starting...", crate::VERSION);
    let state = build_state(config).await?;
    let token = state.shutdown.clone();

    let mut background = JoinSet::new();

    // event dispatcher
    {
        let bus = state.kernel.bus().clone();
        let token = token.clone();
        background.spawn(async move { bus.run(token).await });
    }

    // event logger
    if state.config.log_events {
        let bus = state.kernel.bus().clone();
        let token = token.clone();
        background.spawn(async move {
            let (id, mut rx) = bus.subscribe(SubscriptionFilter::default());
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => info!(
                            key = %event.key,
                            kind = %event.kind,
                            client_id = %event.client_id,
                            "event"
                        ),
                        None => break,
                    },
                }
            }
            bus.unsubscribe(id);
        });
        info!("📝 Event logging enabled");
    }

    // background pruner
    {
        let pruner = Pruner::new(state.kernel.clone());
        let token = token.clone();
        background.spawn(async move { pruner.run(token).await });
    }

    // snapshot loop
    if let Some(engine) = &state.snapshots {
        let engine = engine.clone();
        let token = token.clone();
        background.spawn(async move { engine.run(token).await });
        info!(
            interval = ?state.config.snapshot.interval,
            limit = state.config.snapshot.limit,
            encrypted = state.config.snapshot.encrypt,
            "📸 Snapshot loop started"
        );
    }

    // monitor surface
    if let Some(addr) = state.config.monitor_address.clone() {
        let monitor_state = state.clone();
        let token = token.clone();
        background.spawn(async move {
            if let Err(e) = monitor::serve(monitor_state, &addr, token).await {
                error!(error = %e, "monitor server failed");
            }
        });
    }

    // ctrl-c cancels the root token
    {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received interrupt, shutting down");
                token.cancel();
            }
        });
    }

    let server = ProtocolServer::bind(state.clone()).await?;
    info!("✅ Startup complete");
    server.serve(token.clone()).await?;

    shutdown(&state, background).await;
    info!("👋 Shutdown complete");
    Ok(())
}

/// Drain background loops within the graceful timeout, then flush a
/// final snapshot and close subscriber queues.
async fn shutdown(state: &Arc<AppState>, mut background: JoinSet<()>) {
    state.shutdown.cancel();

    let deadline = state.config.graceful_shutdown_timeout;
    let drained = tokio::time::timeout(deadline, async {
        while background.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(timeout = ?deadline, "graceful shutdown timeout, abandoning background loops");
        background.abort_all();
    }

    if let Some(engine) = &state.snapshots {
        match engine.emit().await {
            Ok(name) => info!(name, "final snapshot written"),
            Err(e) => error!(error = %e, "final snapshot failed"),
        }
    }
    state.kernel.bus().close_all();
}
