//! Message session handles and the driver task behind them.
//!
//! # Responsibilities
//! - Keep exactly one read outstanding and deliver each message upward
//! - Serialize outbound messages: one frame written at a time, FIFO
//! - Fire send completions in submission order, from the driver task
//! - Fire the close notification exactly once
//!
//! # Design Decisions
//! - Handles talk to the driver through an unbounded channel, so `send` may
//!   be called from any thread and never writes inline
//! - The driver owns the send queue and the "send active" state; no locks
//! - Sends still queued when the session ends are dropped without completion

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use bytes::Bytes;
use futures_util::future::{BoxFuture, FutureExt, OptionFuture};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use crate::error::{is_websocket_closed, SendError, SessionError};
use crate::net::Transport;
use crate::observability::metrics;
use crate::settings::SessionSettings;
use crate::websocket::{MessageKind, SessionId};

/// Called once a send finished, with the payload length on success.
pub type SendCallback = Box<dyn FnOnce(Result<usize, SendError>) + Send>;

type MessageHandler = Arc<dyn Fn(Bytes, MessageKind) + Send + Sync>;
type CloseHandler = Box<dyn FnOnce() + Send>;

enum Outbound {
    Message {
        payload: Bytes,
        kind: MessageKind,
        completion: Option<SendCallback>,
    },
    Close,
}

struct Shared {
    id: SessionId,
    target: String,
    is_secure: bool,
    outbound: mpsc::UnboundedSender<Outbound>,
    on_message: Mutex<Option<MessageHandler>>,
    on_close: Mutex<Option<CloseHandler>>,
    settings: Arc<SessionSettings>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        metrics::ws_session_closed();
        tracing::debug!(session = %self.id, "Message session closed");

        let on_close = self
            .on_close
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match on_close {
            Some(on_close) => on_close(),
            None => {
                if let Some(callback) = self.settings.ws_close_callback() {
                    callback(self.id);
                }
            }
        }
    }
}

/// Strong handle to an open message session.
///
/// Cloning is cheap. The session's close notification fires when the last
/// strong handle is gone, so callbacks get [`WeakMessageSession`] and should
/// hold on to that instead.
#[derive(Clone)]
pub struct MessageSession {
    shared: Arc<Shared>,
}

impl MessageSession {
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    /// Path and query of the upgrade request.
    pub fn target(&self) -> &str {
        &self.shared.target
    }

    pub fn is_secure(&self) -> bool {
        self.shared.is_secure
    }

    /// Queue a message.
    ///
    /// Messages are written in the order `send` is called. `completion`, if
    /// given, runs on the session's task after the frame is written, never
    /// inside this call. Fails with [`SendError::Closed`] if the session has
    /// already ended, in which case `completion` is dropped unused.
    pub fn send(
        &self,
        payload: impl Into<Bytes>,
        kind: MessageKind,
        completion: Option<SendCallback>,
    ) -> Result<(), SendError> {
        self.shared
            .outbound
            .send(Outbound::Message {
                payload: payload.into(),
                kind,
                completion,
            })
            .map_err(|_| SendError::Closed)
    }

    /// Queue a message and wait until it has been written.
    pub async fn send_async(&self, payload: impl Into<Bytes>, kind: MessageKind) -> Result<usize, SendError> {
        let (tx, rx) = oneshot::channel();
        self.send(
            payload,
            kind,
            Some(Box::new(move |result| {
                let _ = tx.send(result);
            })),
        )?;
        rx.await.unwrap_or(Err(SendError::Closed))
    }

    /// Start the closing handshake after all previously queued messages.
    pub fn close(&self) -> Result<(), SendError> {
        self.shared
            .outbound
            .send(Outbound::Close)
            .map_err(|_| SendError::Closed)
    }

    /// Replace the server-wide message callback for this session.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(Bytes, MessageKind) + Send + Sync + 'static,
    {
        *self
            .shared
            .on_message
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Replace the server-wide close callback for this session.
    pub fn on_close<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self
            .shared
            .on_close
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(handler));
    }

    pub fn downgrade(&self) -> WeakMessageSession {
        WeakMessageSession {
            id: self.shared.id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    fn message_handler(&self) -> Option<MessageHandler> {
        self.shared
            .on_message
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl fmt::Debug for MessageSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageSession")
            .field("id", &self.shared.id)
            .field("target", &self.shared.target)
            .field("is_secure", &self.shared.is_secure)
            .finish()
    }
}

/// Handle that does not keep the session alive.
#[derive(Clone)]
pub struct WeakMessageSession {
    id: SessionId,
    shared: Weak<Shared>,
}

impl WeakMessageSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn upgrade(&self) -> Option<MessageSession> {
        self.shared.upgrade().map(|shared| MessageSession { shared })
    }

    /// [`MessageSession::send`] if the session still exists.
    pub fn send(
        &self,
        payload: impl Into<Bytes>,
        kind: MessageKind,
        completion: Option<SendCallback>,
    ) -> Result<(), SendError> {
        match self.upgrade() {
            Some(session) => session.send(payload, kind, completion),
            None => Err(SendError::Closed),
        }
    }
}

impl fmt::Debug for WeakMessageSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakMessageSession").field("id", &self.id).finish()
    }
}

type WsSink<S> = SplitSink<WebSocketStream<S>, Message>;
type WsStream<S> = SplitStream<WebSocketStream<S>>;
type ReadOp<S> = BoxFuture<'static, (WsStream<S>, Option<Result<Message, tungstenite::Error>>)>;
type WriteOp<S> = BoxFuture<'static, (WsSink<S>, Result<(), tungstenite::Error>, Option<SendCallback>, usize)>;

struct Driver<S: Transport> {
    session: MessageSession,
    settings: Arc<SessionSettings>,
    sink: Option<WsSink<S>>,
    read_op: Option<ReadOp<S>>,
    write_op: Option<WriteOp<S>>,
    send_queue: VecDeque<Outbound>,
    outbound_rx: mpsc::UnboundedReceiver<Outbound>,
}

/// Run an opened message session until the peer closes or an error occurs.
pub(super) async fn run<S: Transport>(
    ws: WebSocketStream<S>,
    target: String,
    is_secure: bool,
    settings: Arc<SessionSettings>,
) -> Result<(), SessionError> {
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let session = MessageSession {
        shared: Arc::new(Shared {
            id: SessionId::next(),
            target,
            is_secure,
            outbound,
            on_message: Mutex::new(None),
            on_close: Mutex::new(None),
            settings: settings.clone(),
        }),
    };
    metrics::ws_session_opened();
    tracing::debug!(session = %session.id(), target = session.target(), "Message session open");

    if let Some(on_open) = settings.ws_open_callback() {
        on_open(session.downgrade(), session.target(), is_secure);
    }

    let (sink, stream) = ws.split();
    let mut driver = Driver {
        session,
        settings,
        sink: Some(sink),
        read_op: None,
        write_op: None,
        send_queue: VecDeque::new(),
        outbound_rx,
    };
    driver.start_read(stream);
    driver.drive().await
}

impl<S: Transport> Driver<S> {
    async fn drive(&mut self) -> Result<(), SessionError> {
        loop {
            tokio::select! {
                Some((stream, item)) = OptionFuture::from(self.read_op.as_mut()), if self.read_op.is_some() => {
                    self.read_op = None;
                    match item {
                        Some(Ok(message)) => {
                            self.on_frame(message);
                            self.start_read(stream);
                        }
                        Some(Err(e)) if is_websocket_closed(&e) => return Ok(()),
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(()),
                    }
                }
                Some((sink, result, completion, len)) = OptionFuture::from(self.write_op.as_mut()), if self.write_op.is_some() => {
                    self.write_op = None;
                    match result {
                        Ok(()) => {
                            self.sink = Some(sink);
                            if let Some(completion) = completion {
                                completion(Ok(len));
                            }
                        }
                        Err(e) => {
                            if let Some(completion) = completion {
                                completion(Err(SendError::Transport(e.to_string())));
                            }
                            return if is_websocket_closed(&e) { Ok(()) } else { Err(e.into()) };
                        }
                    }
                }
                Some(outbound) = self.outbound_rx.recv() => {
                    self.send_queue.push_back(outbound);
                }
            }

            self.start_write();
        }
    }

    fn start_read(&mut self, mut stream: WsStream<S>) {
        self.read_op = Some(
            async move {
                let item = stream.next().await;
                (stream, item)
            }
            .boxed(),
        );
    }

    fn on_frame(&self, message: Message) {
        let (payload, kind) = match message {
            Message::Text(text) => (Bytes::copy_from_slice(text.as_bytes()), MessageKind::Text),
            Message::Binary(data) => (data, MessageKind::Binary),
            Message::Close(frame) => {
                tracing::debug!(session = %self.session.id(), frame = ?frame, "Peer started closing handshake");
                return;
            }
            // Pings are answered by tungstenite.
            _ => return,
        };
        metrics::record_ws_message("in");

        match self.session.message_handler() {
            Some(handler) => handler(payload, kind),
            None => {
                if let Some(callback) = self.settings.ws_message_callback() {
                    callback(self.session.downgrade(), payload, kind);
                }
            }
        }
    }

    /// Begin writing the next queued message if no write is in flight.
    fn start_write(&mut self) {
        if self.write_op.is_some() {
            return;
        }
        while let Some(outbound) = self.send_queue.pop_front() {
            let (message, completion, len) = match outbound {
                Outbound::Message {
                    payload,
                    kind,
                    completion,
                } => {
                    let len = payload.len();
                    match encode(payload, kind) {
                        Ok(message) => (message, completion, len),
                        Err(e) => {
                            if let Some(completion) = completion {
                                completion(Err(e));
                            }
                            continue;
                        }
                    }
                }
                Outbound::Close => (Message::Close(None), None, 0),
            };

            let Some(mut sink) = self.sink.take() else {
                return;
            };
            metrics::record_ws_message("out");
            self.write_op = Some(
                async move {
                    let result = sink.send(message).await;
                    (sink, result, completion, len)
                }
                .boxed(),
            );
            return;
        }
    }
}

fn encode(payload: Bytes, kind: MessageKind) -> Result<Message, SendError> {
    match kind {
        MessageKind::Binary => Ok(Message::Binary(payload)),
        MessageKind::Text => String::from_utf8(payload.to_vec())
            .map(Message::text)
            .map_err(|_| SendError::InvalidUtf8),
    }
}
