//! Per-connection HTTP/1.x session engine with pipelining and WebSocket
//! upgrade.
//!
//! A [`WebServer`] accepts connections and runs one [`ConnectionSession`]
//! per connection. Requests go to the handler registered in
//! [`SessionSettings`] together with a [`Responder`]; responses are written
//! in request order no matter when handlers complete. Upgrade requests turn
//! the connection into a [`MessageSession`].

pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod settings;
pub mod websocket;

pub use config::ServerConfig;
pub use error::{ProtocolError, SendError, SessionError};
pub use http::{ConnectionSession, Request, RequestExt, Responder, Response, WebServer};
pub use lifecycle::Shutdown;
pub use settings::SessionSettings;
pub use websocket::{MessageKind, MessageSession, SessionId, WeakMessageSession};
