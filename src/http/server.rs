//! Accept loop that turns connections into sessions.
//!
//! # Responsibilities
//! - Accept connections within the listener's connection limit
//! - Complete the TLS handshake when an acceptor is configured
//! - Spawn one task per connection, inside a tracing span
//! - Report how each session ended (tracing + metrics)
//! - Stop accepting on shutdown and drain live connections

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tracing::Instrument;

use crate::error::SessionError;
use crate::http::session::ConnectionSession;
use crate::net::{ConnectionTracker, Listener, ListenerError, Transport};
use crate::observability::metrics;
use crate::settings::SessionSettings;

/// HTTP/1.x and WebSocket server over a [`Listener`].
pub struct WebServer {
    settings: Arc<SessionSettings>,
    tls: Option<TlsAcceptor>,
    tracker: ConnectionTracker,
}

impl WebServer {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            tls: None,
            tracker: ConnectionTracker::new(),
        }
    }

    /// Serve every connection over TLS.
    pub fn with_tls(mut self, acceptor: Option<TlsAcceptor>) -> Self {
        self.tls = acceptor;
        self
    }

    /// Connections currently being served.
    pub fn active_connections(&self) -> u64 {
        self.tracker.active_count()
    }

    /// Accept connections until `shutdown` fires, then wait up to `drain`
    /// for live connections to finish.
    pub async fn run(
        self,
        listener: Listener,
        mut shutdown: broadcast::Receiver<()>,
        drain: Duration,
    ) -> Result<(), ListenerError> {
        tracing::info!(
            address = ?listener.local_addr().ok(),
            max_connections = listener.max_connections(),
            tls = self.tls.is_some(),
            "Server accepting connections"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, no longer accepting");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer, permit) = match accepted {
                        Ok(accepted) => accepted,
                        Err(ListenerError::Accept(e)) => {
                            // Per-connection failures (e.g. reset before accept) are not fatal.
                            tracing::warn!(error = %e, "Accept failed");
                            continue;
                        }
                        Err(e) => return Err(e),
                    };

                    let guard = self.tracker.track();
                    let span = tracing::info_span!("connection", id = %guard.id(), %peer);
                    let settings = self.settings.clone();
                    let tls = self.tls.clone();
                    let idle_timeout = self.settings.idle_timeout();

                    tokio::spawn(
                        async move {
                            let result = serve_connection(stream, peer, tls, settings, idle_timeout).await;
                            report(result);
                            drop(permit);
                            drop(guard);
                        }
                        .instrument(span),
                    );
                }
            }
        }

        let active = self.tracker.active_count();
        if active > 0 {
            tracing::info!(active, timeout = ?drain, "Draining connections");
        }
        if self.tracker.drain(drain).await {
            tracing::info!("All connections closed");
        } else {
            tracing::warn!(
                remaining = self.tracker.active_count(),
                "Drain timeout elapsed, abandoning connections"
            );
        }
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    settings: Arc<SessionSettings>,
    idle_timeout: Duration,
) -> Result<(), SessionError> {
    match tls {
        Some(acceptor) => {
            let stream = tokio::time::timeout(idle_timeout, acceptor.accept(stream))
                .await
                .map_err(|_| SessionError::Timeout(idle_timeout))?
                .map_err(SessionError::Handshake)?;
            tracing::debug!(%peer, "TLS handshake complete");
            serve(stream, settings).await
        }
        None => serve(stream, settings).await,
    }
}

async fn serve<S: Transport>(stream: S, settings: Arc<SessionSettings>) -> Result<(), SessionError> {
    metrics::record_connection(stream.is_secure());
    tracing::trace!(peer = ?stream.peer_addr(), secure = stream.is_secure(), "Session starting");
    ConnectionSession::new(stream, settings).run().await
}

fn report(result: Result<(), SessionError>) {
    match result {
        Ok(()) => tracing::debug!("Session finished"),
        Err(e) => {
            metrics::record_session_error(e.kind());
            if e.is_recoverable() {
                tracing::debug!(error = %e, "Session ended");
            } else {
                tracing::warn!(error = %e, "Session failed");
            }
        }
    }
}
