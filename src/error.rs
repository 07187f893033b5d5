//! Error types shared by the connection and message sessions.
//!
//! # Design Decisions
//! - Transport and protocol failures end the owning session and are reported
//!   through tracing/metrics by the server loop, never to handler code
//! - `is_recoverable` separates a peer going away from a real fault
//! - Backpressure is not an error and has no variant here

use std::io;
use std::time::Duration;

use http::StatusCode;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors that terminate a connection or message session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Reading from the transport failed.
    #[error("read failed: {0}")]
    Read(#[source] io::Error),

    /// Writing a response or handshake to the transport failed.
    #[error("write failed: {0}")]
    Write(#[source] io::Error),

    /// The orderly shutdown after a closing response failed.
    #[error("shutdown failed: {0}")]
    Shutdown(#[source] io::Error),

    /// The TLS handshake did not complete.
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] io::Error),

    /// No bytes arrived within the idle timeout.
    #[error("idle timeout after {0:?}")]
    Timeout(Duration),

    /// The peer sent something that is not a valid HTTP request.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The WebSocket stream failed after the upgrade.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// The WebSocket upgrade handshake was rejected.
    #[error("websocket upgrade rejected: {0}")]
    Upgrade(&'static str),
}

impl SessionError {
    /// Whether the error only means the peer went away.
    ///
    /// Recoverable errors are logged at debug level; everything else is a
    /// fault worth a warning.
    pub fn is_recoverable(&self) -> bool {
        match self {
            SessionError::Read(e) | SessionError::Write(e) | SessionError::Shutdown(e) => {
                is_peer_closed(e)
            }
            SessionError::WebSocket(e) => is_websocket_closed(e),
            SessionError::Timeout(_) => true,
            _ => false,
        }
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Read(_) => "read",
            SessionError::Write(_) => "write",
            SessionError::Shutdown(_) => "shutdown",
            SessionError::Handshake(_) => "tls_handshake",
            SessionError::Timeout(_) => "timeout",
            SessionError::Protocol(_) => "protocol",
            SessionError::WebSocket(_) => "websocket",
            SessionError::Upgrade(_) => "upgrade",
        }
    }
}

fn is_peer_closed(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected
    )
}

/// Whether a tungstenite error is the expected "closed" condition.
pub(crate) fn is_websocket_closed(e: &tungstenite::Error) -> bool {
    use tungstenite::error::ProtocolError as WsProtocolError;

    match e {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => true,
        tungstenite::Error::Protocol(WsProtocolError::ResetWithoutClosingHandshake) => true,
        tungstenite::Error::Io(io) => is_peer_closed(io),
        _ => false,
    }
}

/// A request that could not be parsed or exceeded a configured limit.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The request head is not valid HTTP/1.x.
    #[error("malformed request: {0}")]
    Malformed(#[from] httparse::Error),

    /// A request component parsed but is not acceptable.
    #[error("invalid {0}")]
    Invalid(&'static str),

    /// The request head exceeded the header limit.
    #[error("request head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },

    /// The request body exceeded the body limit.
    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: u64 },

    /// A transfer coding other than chunked was requested.
    #[error("unsupported transfer encoding")]
    UnsupportedTransferEncoding,
}

impl ProtocolError {
    /// Status code of the response synthesized for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            ProtocolError::HeadTooLarge { .. } => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            ProtocolError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ProtocolError::UnsupportedTransferEncoding => StatusCode::NOT_IMPLEMENTED,
            ProtocolError::Malformed(httparse::Error::TooManyHeaders) => {
                StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
            }
            ProtocolError::Malformed(_) | ProtocolError::Invalid(_) => StatusCode::BAD_REQUEST,
        }
    }
}

/// Outcome of a failed message session send.
#[derive(Debug, Error)]
pub enum SendError {
    /// The session is gone; the message was discarded.
    #[error("message session closed")]
    Closed,

    /// A text message payload was not valid UTF-8.
    #[error("text payload is not valid UTF-8")]
    InvalidUtf8,

    /// The frame could not be written.
    #[error("send failed: {0}")]
    Transport(String),
}
