//! Session settings shared by every connection of one server.
//!
//! A [`SessionSettings`] value is built once, wrapped in an `Arc`, and handed
//! to every [`ConnectionSession`](crate::http::ConnectionSession) and message
//! session the server spawns. Nothing mutates it afterwards.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

use crate::config::SessionConfig;
use crate::http::{Request, Responder};
use crate::websocket::{MessageKind, SessionId, WeakMessageSession};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_REQUEST_BODY_LIMIT: u64 = 1024 * 1024;
pub const DEFAULT_REQUEST_QUEUE_LIMIT: usize = 8;
pub const DEFAULT_MAX_HEADER_BYTES: usize = 8 * 1024;

/// Handles one HTTP request: `(request, responder, is_secure)`.
///
/// The responder may be used right away or moved elsewhere and completed
/// later, from any thread.
pub type RequestHandler = Arc<dyn Fn(Request, Responder, bool) + Send + Sync>;

/// Called with every message a message session receives.
pub type WsMessageCallback = Arc<dyn Fn(WeakMessageSession, Bytes, MessageKind) + Send + Sync>;

/// Called once a message session is open: `(session, target, is_secure)`.
pub type WsOpenCallback = Arc<dyn Fn(WeakMessageSession, &str, bool) + Send + Sync>;

/// Called when a message session without its own close hook goes away.
pub type WsCloseCallback = Arc<dyn Fn(SessionId) + Send + Sync>;

/// Decides whether an upgrade request may become a message session.
pub type UpgradePredicate = Arc<dyn Fn(&Request) -> bool + Send + Sync>;

/// Read-only configuration and callback registry.
#[derive(Clone)]
pub struct SessionSettings {
    http_request: Option<RequestHandler>,
    ws_message: Option<WsMessageCallback>,
    ws_open: Option<WsOpenCallback>,
    ws_close: Option<WsCloseCallback>,
    upgrade_ok: Option<UpgradePredicate>,
    idle_timeout: Duration,
    request_body_limit: u64,
    request_queue_limit: usize,
    max_header_bytes: usize,
    handler_timeout: Option<Duration>,
    ws_max_message_size: Option<usize>,
}

impl SessionSettings {
    pub fn new() -> Self {
        Self {
            http_request: None,
            ws_message: None,
            ws_open: None,
            ws_close: None,
            upgrade_ok: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            request_body_limit: DEFAULT_REQUEST_BODY_LIMIT,
            request_queue_limit: DEFAULT_REQUEST_QUEUE_LIMIT,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            handler_timeout: None,
            ws_max_message_size: None,
        }
    }

    /// Settings with limits taken from a loaded configuration and no callbacks.
    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new()
            .with_idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .with_request_body_limit(config.request_body_limit)
            .with_request_queue_limit(config.request_queue_limit)
            .with_max_header_bytes(config.max_header_bytes)
            .with_handler_timeout(config.handler_timeout_secs.map(Duration::from_secs))
            .with_ws_max_message_size(config.ws_max_message_size)
    }

    pub fn on_http_request<F>(mut self, handler: F) -> Self
    where
        F: Fn(Request, Responder, bool) + Send + Sync + 'static,
    {
        self.http_request = Some(Arc::new(handler));
        self
    }

    pub fn on_ws_message<F>(mut self, callback: F) -> Self
    where
        F: Fn(WeakMessageSession, Bytes, MessageKind) + Send + Sync + 'static,
    {
        self.ws_message = Some(Arc::new(callback));
        self
    }

    pub fn on_ws_open<F>(mut self, callback: F) -> Self
    where
        F: Fn(WeakMessageSession, &str, bool) + Send + Sync + 'static,
    {
        self.ws_open = Some(Arc::new(callback));
        self
    }

    pub fn on_ws_close<F>(mut self, callback: F) -> Self
    where
        F: Fn(SessionId) + Send + Sync + 'static,
    {
        self.ws_close = Some(Arc::new(callback));
        self
    }

    pub fn on_upgrade_ok<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Request) -> bool + Send + Sync + 'static,
    {
        self.upgrade_ok = Some(Arc::new(predicate));
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_request_body_limit(mut self, limit: u64) -> Self {
        self.request_body_limit = limit;
        self
    }

    /// Pipeline depth. A limit of zero would never read, so it is raised to one.
    pub fn with_request_queue_limit(mut self, limit: usize) -> Self {
        self.request_queue_limit = limit.max(1);
        self
    }

    pub fn with_max_header_bytes(mut self, limit: usize) -> Self {
        self.max_header_bytes = limit;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_ws_max_message_size(mut self, limit: Option<usize>) -> Self {
        self.ws_max_message_size = limit;
        self
    }

    pub fn request_handler(&self) -> Option<&RequestHandler> {
        self.http_request.as_ref()
    }

    pub fn ws_message_callback(&self) -> Option<&WsMessageCallback> {
        self.ws_message.as_ref()
    }

    pub fn ws_open_callback(&self) -> Option<&WsOpenCallback> {
        self.ws_open.as_ref()
    }

    pub fn ws_close_callback(&self) -> Option<&WsCloseCallback> {
        self.ws_close.as_ref()
    }

    /// Upgrades are allowed unless a predicate is registered and refuses.
    pub fn upgrade_allowed(&self, request: &Request) -> bool {
        self.upgrade_ok.as_ref().map_or(true, |allowed| allowed(request))
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn request_body_limit(&self) -> u64 {
        self.request_body_limit
    }

    pub fn request_queue_limit(&self) -> usize {
        self.request_queue_limit
    }

    pub fn max_header_bytes(&self) -> usize {
        self.max_header_bytes
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout
    }

    pub(crate) fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        if let Some(limit) = self.ws_max_message_size {
            config.max_message_size = Some(limit);
            config.max_frame_size = Some(limit);
        }
        config
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSettings")
            .field("http_request", &self.http_request.is_some())
            .field("ws_message", &self.ws_message.is_some())
            .field("ws_open", &self.ws_open.is_some())
            .field("ws_close", &self.ws_close.is_some())
            .field("upgrade_ok", &self.upgrade_ok.is_some())
            .field("idle_timeout", &self.idle_timeout)
            .field("request_body_limit", &self.request_body_limit)
            .field("request_queue_limit", &self.request_queue_limit)
            .field("max_header_bytes", &self.max_header_bytes)
            .field("handler_timeout", &self.handler_timeout)
            .field("ws_max_message_size", &self.ws_max_message_size)
            .finish()
    }
}
