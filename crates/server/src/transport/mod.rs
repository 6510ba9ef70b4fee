//! WebSocket transport.
//!
//! One task accepts TCP connections; each accepted socket is upgraded,
//! authorized during the upgrade and then served by its own task until the
//! peer leaves or the server shuts down.

pub mod connection;
pub mod handshake;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_util::sync::CancellationToken;

use crate::project::ProjectRegistry;
use crate::router::Router;
use crate::store::UserDirectory;

pub use handshake::{Admission, HandshakeQuery};

/// Errors raised while accepting or serving a connection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The upgrade request was refused.
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transport tunables.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// Connections served at once.
    pub max_connections: usize,
    /// Refuse collaborators while no owner is connected.
    pub require_owner_presence: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_connections: 256,
            require_owner_presence: false,
        }
    }
}

/// Accepts WebSocket clients and binds them to project sessions.
pub struct Transport {
    registry: Arc<ProjectRegistry>,
    directory: Arc<dyn UserDirectory>,
    router: Arc<Router>,
    settings: TransportSettings,
    next_connection_id: AtomicU64,
}

impl Transport {
    pub fn new(
        registry: Arc<ProjectRegistry>,
        directory: Arc<dyn UserDirectory>,
        router: Arc<Router>,
        settings: TransportSettings,
    ) -> Self {
        Self {
            registry,
            directory,
            router,
            settings,
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &Arc<ProjectRegistry> {
        &self.registry
    }

    /// Serves `listener` until `shutdown` is cancelled.
    ///
    /// At most `max_connections` sockets are served at once; the accept loop
    /// waits for a free slot before accepting the next one.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        let slots = Arc::new(Semaphore::new(self.settings.max_connections));
        tracing::info!(
            addr = ?listener.local_addr().ok(),
            max_connections = self.settings.max_connections,
            "WebSocket transport listening"
        );

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
            };

            let transport = Arc::clone(&self);
            let shutdown = shutdown.child_token();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = transport.handle_stream(stream, shutdown).await {
                    tracing::debug!(peer = %peer, error = %e, "Connection ended with error");
                }
            });
        }

        tracing::info!("WebSocket transport stopped accepting");
    }

    async fn handle_stream(&self, stream: TcpStream, shutdown: CancellationToken) -> Result<(), TransportError> {
        let mut admitted = None;
        let directory = Arc::clone(&self.directory);
        let socket = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| {
            handshake::check_upgrade(directory.as_ref(), request, response, &mut admitted)
        })
        .await?;
        let admission = admitted.ok_or_else(|| {
            TransportError::Authentication("upgrade completed without admission".to_string())
        })?;

        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        connection::serve(self, socket, admission, connection_id, shutdown).await
    }
}
