//! Access gate.
//!
//! Every wire request carries a `client_id` in its metadata. The gate
//! resolves that identity into a [`Caller`], auto-registering ids on
//! first use, and marks the configured privileged client, which bypasses
//! readonly mode, foreign-lock enforcement and force-clear restrictions.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{Error, Result};
use crate::store::{Caller, MetricsRegistry};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRecord {
    pub first_seen: DateTime<Utc>,
    pub calls: u64,
}

pub struct AccessGate {
    privileged_client_id: Option<String>,
    clients: RwLock<HashMap<String, ClientRecord>>,
    metrics: Arc<MetricsRegistry>,
}

impl AccessGate {
    pub fn new(privileged_client_id: Option<String>, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            privileged_client_id,
            clients: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    fn is_privileged(&self, client_id: &str) -> bool {
        self.privileged_client_id.as_deref() == Some(client_id)
    }

    /// Resolve the caller for one request, registering unknown ids.
    pub async fn resolve(&self, client_id: &str) -> Result<Caller> {
        if client_id.is_empty() {
            return Err(Error::InvalidArgument(
                "missing client_id metadata".to_string(),
            ));
        }
        let mut clients = self.clients.write().await;
        let record = clients.entry(client_id.to_string()).or_insert_with(|| {
            info!(client_id, "new client registered");
            self.metrics.record_client_registered();
            ClientRecord {
                first_seen: Utc::now(),
                calls: 0,
            }
        });
        record.calls += 1;
        Ok(Caller::new(client_id, self.is_privileged(client_id)))
    }

    /// Explicit registration. Returns true when the id was unknown.
    pub async fn register(&self, client_id: &str) -> Result<bool> {
        if client_id.is_empty() {
            return Err(Error::InvalidArgument("empty client_id".to_string()));
        }
        let mut clients = self.clients.write().await;
        if clients.contains_key(client_id) {
            return Ok(false);
        }
        info!(client_id, "client registered");
        self.metrics.record_client_registered();
        clients.insert(
            client_id.to_string(),
            ClientRecord {
                first_seen: Utc::now(),
                calls: 0,
            },
        );
        Ok(true)
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }
}
