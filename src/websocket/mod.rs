//! Message sessions over upgraded connections.
//!
//! # Data Flow
//! ```text
//! ConnectionSession (accepted upgrade, queue drained)
//!     → handshake.rs (validate, 101, wrap stream)
//!     → session.rs (read loop + serialized send queue)
//!     → close notification when the session goes away
//! ```
//!
//! # Design Decisions
//! - The message session runs on the same task that served HTTP
//! - Callbacks receive weak handles; the driver task holds the only
//!   long-lived strong one
//! - Frame encoding, masking and ping/pong are left to tungstenite

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;

use crate::error::SessionError;
use crate::http::Request;
use crate::net::Transport;
use crate::settings::SessionSettings;

mod handshake;
mod session;

pub use session::{MessageSession, SendCallback, WeakMessageSession};

/// Frame-level discriminator of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Text,
    Binary,
}

/// Process-unique identifier of a message session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SessionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ws-{}", self.0)
    }
}

/// Complete the upgrade of `stream` and run the message session to its end.
///
/// `buffered` holds bytes read past the upgrade request; they are the start
/// of the WebSocket byte stream.
pub(crate) async fn serve<S: Transport>(
    stream: S,
    buffered: BytesMut,
    request: Request,
    settings: Arc<SessionSettings>,
    is_secure: bool,
) -> Result<(), SessionError> {
    let ws = handshake::accept(stream, buffered, &request, &settings).await?;
    let target = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| request.uri().path().to_owned());
    session::run(ws, target, is_secure, settings).await
}
