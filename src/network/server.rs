//! Wire protocol listener.

use std::sync::Arc;

use anyhow::Result;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::connection::ConnectionHandler;
use crate::config::ListenAddress;
use crate::server::AppState;

/// Maximum concurrent client connections.
const MAX_CONNECTIONS: usize = 1024;

enum BoundListener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// Accept loop over TCP or a unix socket, one task per connection,
/// bounded by a semaphore.
pub struct ProtocolServer {
    listener: BoundListener,
    handler: Arc<ConnectionHandler>,
    connection_semaphore: Arc<Semaphore>,
}

impl ProtocolServer {
    /// Bind the configured listen address.
    pub async fn bind(state: Arc<AppState>) -> Result<Self> {
        let listener = match &state.config.listen_address {
            ListenAddress::Tcp(addr) => {
                let listener = TcpListener::bind(addr).await?;
                info!("🔌 Listening on tcp://{}", listener.local_addr()?);
                BoundListener::Tcp(listener)
            }
            ListenAddress::Unix(path) => {
                // a stale socket file from a previous run blocks the bind
                if path.exists() {
                    tokio::fs::remove_file(path).await?;
                }
                let listener = UnixListener::bind(path)?;
                info!("🔌 Listening on unix://{}", path.display());
                BoundListener::Unix(listener)
            }
        };
        Ok(Self {
            listener,
            handler: Arc::new(ConnectionHandler::new(state)),
            connection_semaphore: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        })
    }

    /// Local TCP address, for tests binding port 0.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        match &self.listener {
            BoundListener::Tcp(listener) => listener.local_addr().ok(),
            BoundListener::Unix(_) => None,
        }
    }

    /// Accept connections until the shutdown token fires.
    pub async fn serve(&self, token: CancellationToken) -> Result<()> {
        loop {
            let permit = tokio::select! {
                _ = token.cancelled() => break,
                permit = self.connection_semaphore.clone().acquire_owned() => permit?,
            };

            match &self.listener {
                BoundListener::Tcp(listener) => {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        accepted = listener.accept() => match accepted {
                            Ok((stream, addr)) => {
                                let handler = self.handler.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = handler.handle(stream, &addr.to_string()).await {
                                        error!(peer = %addr, error = %e, "connection error");
                                    }
                                    drop(permit);
                                });
                            }
                            Err(e) => {
                                // keep accepting after transient failures
                                error!(error = %e, "failed to accept connection");
                            }
                        },
                    }
                }
                BoundListener::Unix(listener) => {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        accepted = listener.accept() => match accepted {
                            Ok((stream, _)) => {
                                let handler = self.handler.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = handler.handle(stream, "unix").await {
                                        error!(error = %e, "connection error");
                                    }
                                    drop(permit);
                                });
                            }
                            Err(e) => {
                                error!(error = %e, "failed to accept connection");
                            }
                        },
                    }
                }
            }
        }
        debug!("protocol server stopped accepting");
        Ok(())
    }

    pub fn available_connections(&self) -> usize {
        self.connection_semaphore.available_permits()
    }
}
