//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (accept, TLS, spawn per-connection task)
//!     → session.rs (read loop, pipelining, backpressure)
//!     → codec.rs (decode request, encode response)
//!     → handler(request, Responder, is_secure)
//!     → queue.rs (ordered completion) → codec.rs → client
//!
//! Upgrade requests leave this module for crate::websocket once every
//! earlier response has been written.
//! ```

pub mod codec;
pub mod request;
pub mod response;
pub mod responses;
pub mod server;

mod queue;
mod responder;
mod session;

pub use request::{Request, RequestExt};
pub use responder::Responder;
pub use response::{ByteStream, FileBody, Response};
pub use server::WebServer;
pub use session::ConnectionSession;
