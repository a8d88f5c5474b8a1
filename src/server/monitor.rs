//! HTTP monitor surface.
//!
//! Serves liveness, the stats snapshot as JSON and, when enabled, a
//! Prometheus text exposition of the same counters on a separate
//! address from the wire protocol.

use std::sync::Arc;

use axum::extract::Extension;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::AppState;
use crate::store::KernelStats;

pub fn router(state: Arc<AppState>, prometheus: bool) -> Router {
    let mut router = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics));
    if prometheus {
        router = router.route("/metrics/prometheus", get(prometheus_text));
    }
    router
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok", "version": crate::VERSION}))
}

async fn metrics(Extension(state): Extension<Arc<AppState>>) -> Json<KernelStats> {
    Json(state.kernel.stats().await)
}

async fn prometheus_text(Extension(state): Extension<Arc<AppState>>) -> String {
    render_prometheus(&state.kernel.stats().await)
}

/// Render the stats snapshot in the Prometheus text exposition format.
pub fn render_prometheus(stats: &KernelStats) -> String {
    let mut out = String::new();
    out.push_str("# TYPE keyquarry_keys gauge\n");
    out.push_str(&format!("keyquarry_keys {}\n", stats.keys));
    out.push_str("# TYPE keyquarry_pressure_used gauge\n");
    out.push_str(&format!("keyquarry_pressure_used {}\n", stats.pressure_used));
    out.push_str("# TYPE keyquarry_subscribers gauge\n");
    out.push_str(&format!("keyquarry_subscribers {}\n", stats.subscribers));
    out.push_str("# TYPE keyquarry_events_total counter\n");
    for (kind, count) in &stats.metrics.events {
        out.push_str(&format!(
            "keyquarry_events_total{{kind=\"{}\"}} {}\n",
            kind, count
        ));
    }
    out.push_str("# TYPE keyquarry_events_dropped_total counter\n");
    out.push_str(&format!(
        "keyquarry_events_dropped_total {}\n",
        stats.metrics.events_dropped
    ));
    out.push_str("# TYPE keyquarry_prune_runs_total counter\n");
    out.push_str(&format!(
        "keyquarry_prune_runs_total{{eager=\"false\"}} {}\n",
        stats.metrics.prune_runs
    ));
    out.push_str(&format!(
        "keyquarry_prune_runs_total{{eager=\"true\"}} {}\n",
        stats.metrics.eager_prune_runs
    ));
    out.push_str("# TYPE keyquarry_snapshots_total counter\n");
    out.push_str(&format!(
        "keyquarry_snapshots_total{{result=\"ok\"}} {}\n",
        stats.metrics.snapshots_taken
    ));
    out.push_str(&format!(
        "keyquarry_snapshots_total{{result=\"error\"}} {}\n",
        stats.metrics.snapshot_failures
    ));
    out
}

/// Serve the monitor until the shutdown token fires.
pub async fn serve(
    state: Arc<AppState>,
    addr: &str,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let prometheus = state.config.prometheus;
    let app = router(state, prometheus);
    let listener = TcpListener::bind(addr).await?;
    info!("📊 Monitor listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MetricsSnapshot;

    #[test]
    fn test_prometheus_rendering() {
        let mut metrics = MetricsSnapshot::default();
        metrics.events.insert("created".to_string(), 7);
        metrics.prune_runs = 2;
        let stats = KernelStats {
            keys: 3,
            max_keys: 10,
            pressure_used: 0.3,
            readonly: false,
            subscribers: 1,
            metrics,
        };

        let text = render_prometheus(&stats);
        assert!(text.contains("keyquarry_keys 3\n"));
        assert!(text.contains("keyquarry_pressure_used 0.3\n"));
        assert!(text.contains("keyquarry_events_total{kind=\"created\"} 7\n"));
        assert!(text.contains("keyquarry_prune_runs_total{eager=\"false\"} 2\n"));
    }
}
