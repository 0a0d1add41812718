use bytes::BytesMut;
use std::{io, net::SocketAddr, path::Path, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::{ProxyConfig, load_config};
use crate::drain::{DrainCoordinator, SessionGuard};
use crate::frame::{DEFAULT_MAX_FRAME_SIZE, FrameError, FrameReader};
use crate::handshake::{self, HandshakeError};
use crate::relay::{RelaySession, RelayStats};
use crate::routes::{RouteTable, SharedRouteTable};
use crate::stream::DuplexStream;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Why a connection ended before or instead of relaying.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to read handshake frame: {0}")]
    Frame(#[from] FrameError),
    #[error("invalid handshake: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("no handshake received within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("no server configured for {0:?}")]
    UnknownHost(String),
    #[error("failed to connect to backend {backend}: {source}")]
    BackendConnect {
        backend: String,
        #[source]
        source: io::Error,
    },
    #[error("proxy is shutting down")]
    Cancelled,
}

/// Accepts clients, routes each by the hostname in its handshake, and relays
/// it to the matching backend.
pub struct ProxyServer {
    routes: SharedRouteTable,
    drain: Arc<DrainCoordinator>,
    shutdown: CancellationToken,
    max_frame_size: usize,
    handshake_timeout: Duration,
}

impl ProxyServer {
    #[must_use]
    pub fn new(routes: RouteTable) -> Self {
        Self {
            routes: SharedRouteTable::new(routes),
            drain: Arc::new(DrainCoordinator::new()),
            shutdown: CancellationToken::new(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    #[must_use]
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(RouteTable::from_config(config))
            .with_max_frame_size(config.max_frame_size)
            .with_handshake_timeout(config.handshake_timeout())
    }

    #[must_use]
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    #[must_use]
    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    /// The route table new connections are currently resolved against.
    #[must_use]
    pub fn routes(&self) -> Arc<RouteTable> {
        self.routes.snapshot()
    }

    /// Swaps in a new route table. Sessions that were already routed keep
    /// their backend.
    pub fn reload(&self, routes: RouteTable) {
        let previous = self.routes.replace(routes);
        info!(
            previous_routes = previous.len(),
            routes = self.routes.snapshot().len(),
            "Route table reloaded"
        );
    }

    /// Re-reads the configuration file and swaps in its routes, returning
    /// the new configuration. An unreadable or invalid file leaves the
    /// current routes in place.
    pub fn reload_from(&self, path: impl AsRef<Path>) -> anyhow::Result<ProxyConfig> {
        let config = load_config(path)?;
        self.reload(RouteTable::from_config(&config));
        Ok(config)
    }

    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.drain.active()
    }

    /// Accepts connections until [`stop`](Self::stop) is called.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(listen_addr = %addr, "Minecraft proxy listening");
        }

        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, client_addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(
                                client_addr = %client_addr,
                                error = %e,
                                "Failed to set TCP_NODELAY"
                            );
                        }
                        let _ = self.accept_connection(stream, client_addr);
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        info!("Stopped accepting connections");
        Ok(())
    }

    /// Admits one client and handles it on its own task.
    ///
    /// Returns `None`, dropping the stream unread, once the proxy is draining.
    pub fn accept_connection<S: DuplexStream>(
        self: &Arc<Self>,
        stream: S,
        client_addr: SocketAddr,
    ) -> Option<JoinHandle<()>> {
        let Some(session) = self.drain.try_enter() else {
            debug!(client_addr = %client_addr, "Proxy is draining, refusing connection");
            return None;
        };

        let server = Arc::clone(self);
        Some(tokio::spawn(
            async move { server.handle_connection(stream, session).await }
                .instrument(info_span!("connection", client_addr = %client_addr)),
        ))
    }

    async fn handle_connection<S: DuplexStream>(&self, stream: S, session: SessionGuard) {
        info!(
            active_sessions = session.active_at_entry(),
            "Client connected to proxy"
        );

        match self.proxy_connection(stream).await {
            Ok(stats) => info!(
                serverbound_bytes = stats.serverbound_bytes,
                clientbound_bytes = stats.clientbound_bytes,
                "Proxied connection finished"
            ),
            Err(ConnectionError::UnknownHost(host)) => {
                info!(virtual_host = %host, "Could not find server configuration");
            }
            Err(ConnectionError::Cancelled) => debug!("Connection closed by shutdown"),
            Err(e) => warn!(error = %e, "Connection rejected"),
        }

        let remaining = session.release();
        info!(
            active_sessions = remaining,
            "Client disconnected from proxy"
        );
    }

    /// Reads the handshake, dials the backend it names, and relays until the
    /// session ends. The client stream is dropped, and so closed, on every
    /// early return.
    async fn proxy_connection<S: DuplexStream>(
        &self,
        stream: S,
    ) -> Result<RelayStats, ConnectionError> {
        let scope = self.shutdown.child_token();
        let mut reader = FrameReader::with_max_frame_size(stream, self.max_frame_size);

        debug!("Reading handshake");
        let frame = tokio::select! {
            () = scope.cancelled() => return Err(ConnectionError::Cancelled),
            read = timeout(self.handshake_timeout, reader.read_frame()) => read
                .map_err(|_| ConnectionError::HandshakeTimeout(self.handshake_timeout))??,
        };
        let handshake = handshake::decode(&frame)?;
        debug!(
            virtual_host = %handshake.virtual_host,
            protocol_version = handshake.protocol_version,
            next_state = ?handshake.next_state,
            "Handshake received"
        );

        let route = self
            .routes
            .snapshot()
            .lookup(&handshake.virtual_host)
            .ok_or(ConnectionError::UnknownHost(handshake.virtual_host))?;

        let backend = tokio::select! {
            () = scope.cancelled() => return Err(ConnectionError::Cancelled),
            connected = TcpStream::connect((route.backend_host(), route.backend_port())) => {
                connected.map_err(|source| ConnectionError::BackendConnect {
                    backend: route.to_string(),
                    source,
                })?
            }
        };
        if let Err(e) = backend.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY on backend");
        }
        info!(
            virtual_host = %route.hostname(),
            backend = %route,
            "Connected to server"
        );

        let (client, pending) = reader.into_parts();
        let mut initial = BytesMut::with_capacity(frame.len() + pending.len());
        initial.extend_from_slice(frame.as_bytes());
        initial.extend_from_slice(&pending);

        let session = RelaySession::new(client, backend, scope);
        Ok(session.run(&initial).await)
    }

    /// Stops accepting, cancels every session, and waits up to `grace` for
    /// them to finish. Returns whether they all did.
    pub async fn stop(&self, grace: Duration) -> bool {
        info!("Stopping proxy");
        self.shutdown.cancel();
        self.drain.complete();

        if timeout(grace, self.drain.wait()).await.is_ok() {
            info!("All sessions drained");
            true
        } else {
            warn!(
                active_sessions = self.drain.active(),
                grace_secs = grace.as_secs_f64(),
                "Sessions still active after shutdown timeout, abandoning them"
            );
            false
        }
    }
}
