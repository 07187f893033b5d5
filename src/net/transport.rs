//! Duplex byte stream abstraction consumed by the sessions.
//!
//! Sessions are written once against [`Transport`]; the server picks the
//! concrete stream (plain TCP or TLS) when it accepts a connection.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

/// A duplex byte stream a session can own.
///
/// Reads and writes come from tokio's `AsyncRead`/`AsyncWrite`; the orderly
/// shutdown is `AsyncWriteExt::shutdown`, which half-closes a TCP stream and
/// sends `close_notify` before half-closing a TLS stream.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Whether the stream is encrypted.
    fn is_secure(&self) -> bool;

    /// Remote address, when the stream has one.
    fn peer_addr(&self) -> Option<SocketAddr>;
}

impl Transport for TcpStream {
    fn is_secure(&self) -> bool {
        false
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }
}

impl Transport for TlsStream<TcpStream> {
    fn is_secure(&self) -> bool {
        true
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.get_ref().0.peer_addr().ok()
    }
}

/// In-memory pipe, used by tests and by embedders that feed bytes directly.
impl Transport for DuplexStream {
    fn is_secure(&self) -> bool {
        false
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}
