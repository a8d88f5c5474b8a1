//! Client connection handling.
//!
//! Each connection runs a request/response loop: read one framed
//! request, resolve the caller through the access gate, dispatch into
//! the kernel, write one framed response. The two watch operations
//! switch the connection into a push loop that forwards bus deliveries
//! as frames until the client closes or the server shuts down.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tracing::{debug, info, warn};

use super::protocol::{read_message, write_message, Request, RequestBody, Response};
use crate::config::parse_duration;
use crate::error::Error;
use crate::event::SubscriptionFilter;
use crate::server::AppState;
use crate::store::{InspectOptions, SetParams};

pub struct ConnectionHandler {
    state: Arc<AppState>,
}

impl ConnectionHandler {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Run the request loop for one client connection.
    pub async fn handle<S>(&self, stream: S, peer: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        debug!(peer, "client connected");
        let (mut reader, mut writer) = tokio::io::split(stream);

        loop {
            let request: Request = tokio::select! {
                _ = self.state.shutdown.cancelled() => break,
                message = read_message(&mut reader) => match message? {
                    Some(request) => request,
                    None => break,
                },
            };
            let id = request.id;
            let client_id = request.client_id.clone();

            match request.body {
                RequestBody::WatchStream {
                    keys,
                    kinds,
                    client_ids,
                } => {
                    match build_filter(keys, kinds, client_ids) {
                        Ok(filter) => {
                            self.stream_events(&mut reader, &mut writer, id, filter)
                                .await?;
                            break;
                        }
                        Err(e) => {
                            write_message(&mut writer, &Response::failure(id, &e)).await?;
                        }
                    }
                }
                RequestBody::WatchKeyValue { key } => {
                    self.stream_key_values(&mut reader, &mut writer, id, &key)
                        .await?;
                    break;
                }
                body => {
                    let response = tokio::select! {
                        biased;
                        result = self.dispatch(&client_id, body) => match result {
                            Ok(result) => Response::success(id, result),
                            Err(e) => Response::failure(id, &e),
                        },
                        _ = self.state.shutdown.cancelled() => Response::failure(
                            id,
                            &Error::Cancelled("server shutting down".to_string()),
                        ),
                    };
                    write_message(&mut writer, &response).await?;
                }
            }
        }
        debug!(peer, "client disconnected");
        Ok(())
    }

    async fn dispatch(
        &self,
        client_id: &str,
        body: RequestBody,
    ) -> crate::error::Result<serde_json::Value> {
        // explicit registration happens before identity resolution so it
        // can report whether the id was actually new
        if matches!(body, RequestBody::Register) {
            let is_new = self.state.gate.register(client_id).await?;
            return Ok(json!({ "client_id": client_id, "is_new": is_new }));
        }

        let caller = self.state.gate.resolve(client_id).await?;
        let kernel = &self.state.kernel;

        match body {
            RequestBody::Set {
                key,
                value,
                content_type,
                lock_duration,
                lifespan,
            } => {
                let params = SetParams {
                    key,
                    value,
                    content_type,
                    lock_duration: parse_duration_param(lock_duration, "lock_duration")?,
                    lifespan: parse_duration_param(lifespan, "lifespan")?,
                };
                let outcome = kernel.set(&caller, params).await?;
                Ok(serde_json::to_value(outcome)?)
            }
            RequestBody::Get { key } => {
                let value = kernel.get(&caller, &key).await?;
                Ok(json!({ "value": STANDARD.encode(value) }))
            }
            RequestBody::GetRevision { key, version } => {
                let (value, timestamp) = kernel.get_revision(&caller, &key, version).await?;
                Ok(json!({
                    "value": STANDARD.encode(value),
                    "timestamp": timestamp,
                }))
            }
            RequestBody::Inspect {
                key,
                include_value,
                include_metrics,
            } => {
                let info = kernel
                    .inspect(
                        &caller,
                        &key,
                        InspectOptions {
                            include_value,
                            include_metrics,
                        },
                    )
                    .await?;
                Ok(serde_json::to_value(info)?)
            }
            RequestBody::Delete { key } => {
                let deleted = kernel.delete(&caller, &key).await?;
                Ok(json!({ "deleted": deleted }))
            }
            RequestBody::Exists { key } => {
                let exists = kernel.exists(&caller, &key).await?;
                Ok(json!({ "exists": exists }))
            }
            RequestBody::Pop { key } => {
                let value = kernel.pop(&caller, &key).await?;
                Ok(json!({ "value": STANDARD.encode(value) }))
            }
            RequestBody::Clear { force } => {
                let cleared = kernel.clear(&caller, force).await?;
                Ok(json!({ "cleared": cleared }))
            }
            RequestBody::ListKeys {
                pattern,
                limit,
                include_reserved,
            } => {
                let keys = kernel
                    .list_keys(&caller, pattern.as_deref(), limit, include_reserved)
                    .await?;
                Ok(json!({ "keys": keys }))
            }
            RequestBody::Stats => Ok(serde_json::to_value(kernel.stats().await)?),
            RequestBody::ClearHistory => {
                let discarded = kernel.clear_history(&caller).await?;
                Ok(json!({ "revisions_discarded": discarded }))
            }
            RequestBody::Lock {
                key,
                duration,
                create_if_missing,
            } => {
                let duration = parse_duration(&duration).ok_or_else(|| {
                    Error::InvalidArgument(format!("bad duration {:?}", duration))
                })?;
                kernel
                    .lock(&caller, &key, duration, create_if_missing)
                    .await?;
                Ok(json!({ "locked": true }))
            }
            RequestBody::Unlock { key } => {
                kernel.unlock(&caller, &key).await?;
                Ok(json!({ "unlocked": true }))
            }
            RequestBody::SetReadOnly { enable } => {
                let previous = kernel.set_readonly(&caller, enable)?;
                Ok(json!({ "previous": previous }))
            }
            RequestBody::GetKeyMetric { key } => {
                let metric = kernel
                    .key_metric(&key)
                    .ok_or_else(|| Error::NotFound(format!("no metric for key {:?}", key)))?;
                Ok(serde_json::to_value(metric)?)
            }
            RequestBody::Prune {
                prune_to,
                ignore_keys,
            } => {
                let run = kernel
                    .prune(&caller, prune_to, ignore_keys.into_iter().collect())
                    .await?;
                Ok(serde_json::to_value(run)?)
            }
            RequestBody::Shutdown => {
                if !caller.privileged {
                    return Err(Error::PermissionDenied(
                        "shutdown requires the privileged client".to_string(),
                    ));
                }
                info!(client_id = %caller.client_id, "shutdown requested over the wire");
                self.state.shutdown.cancel();
                Ok(json!({ "shutting_down": true }))
            }
            RequestBody::Register
            | RequestBody::WatchStream { .. }
            | RequestBody::WatchKeyValue { .. } => unreachable!("handled before dispatch"),
        }
    }

    /// Push filtered events as frames until the client closes, the
    /// subscription dies or the server shuts down.
    async fn stream_events<S>(
        &self,
        reader: &mut ReadHalf<S>,
        writer: &mut WriteHalf<S>,
        id: u64,
        filter: SubscriptionFilter,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite,
    {
        let bus = self.state.kernel.bus().clone();
        let (sub_id, mut rx) = bus.subscribe(filter);
        let result = async {
            write_message(writer, &Response::success(id, json!({ "streaming": true }))).await?;
            loop {
                tokio::select! {
                    _ = self.state.shutdown.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => {
                            let frame = Response::success(id, serde_json::to_value(&event)?);
                            write_message(writer, &frame).await?;
                        }
                        None => break,
                    },
                    // any client frame (or EOF) ends the watch
                    _ = read_message::<_, Request>(reader) => break,
                }
            }
            Ok(())
        }
        .await;
        bus.unsubscribe(sub_id);
        debug!(subscriber = sub_id, "watch stream closed");
        result
    }

    /// Push full value frames for a single key.
    async fn stream_key_values<S>(
        &self,
        reader: &mut ReadHalf<S>,
        writer: &mut WriteHalf<S>,
        id: u64,
        key: &str,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite,
    {
        let bus = self.state.kernel.bus().clone();
        let (watch_id, mut rx) = bus.watch_key(key);
        let result = async {
            write_message(writer, &Response::success(id, json!({ "streaming": true }))).await?;
            loop {
                tokio::select! {
                    _ = self.state.shutdown.cancelled() => break,
                    frame = rx.recv() => match frame {
                        Some(frame) => {
                            let frame = Response::success(id, serde_json::to_value(&frame)?);
                            write_message(writer, &frame).await?;
                        }
                        None => break,
                    },
                    _ = read_message::<_, Request>(reader) => break,
                }
            }
            Ok(())
        }
        .await;
        bus.unwatch_key(watch_id);
        debug!(watcher = watch_id, key, "key-value watch closed");
        result
    }
}

fn build_filter(
    keys: Vec<String>,
    kinds: Vec<String>,
    client_ids: Vec<String>,
) -> crate::error::Result<SubscriptionFilter> {
    let mut filter = SubscriptionFilter {
        keys: keys.into_iter().collect(),
        client_ids: client_ids.into_iter().collect(),
        ..SubscriptionFilter::default()
    };
    for kind in kinds {
        match kind.parse() {
            Ok(kind) => {
                filter.kinds.insert(kind);
            }
            Err(e) => {
                warn!(kind, "rejecting watch with unknown event kind");
                return Err(e);
            }
        }
    }
    Ok(filter)
}

fn parse_duration_param(
    value: Option<String>,
    name: &str,
) -> crate::error::Result<Option<Duration>> {
    match value {
        None => Ok(None),
        Some(s) => parse_duration(&s)
            .map(Some)
            .ok_or_else(|| Error::InvalidArgument(format!("{}: bad duration {:?}", name, s))),
    }
}
