//! Per-connection HTTP session.
//!
//! # Responsibilities
//! - Read pipelined requests and hand each to the request handler
//! - Write responses strictly in request order, one at a time
//! - Pause reading while the response queue is full
//! - Hand the transport to a message session after an accepted upgrade
//!
//! # Data Flow
//! ```text
//! read half ──→ Reader ──→ on_request ──→ handler(req, Responder, is_secure)
//!                                              │
//!                 completions channel  ←───────┘  (any task, any order)
//!                          │
//!                    ResponseQueue ──→ head ready? ──→ write half
//! ```
//!
//! # Design Decisions
//! - One task owns all connection state; there are no locks
//! - The read and write halves are moved into their in-flight futures and
//!   come back when those complete, so at most one of each is outstanding
//! - Responders reach the task through a weak sender and never keep it alive

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures_util::future::{BoxFuture, FutureExt, OptionFuture};
use http::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};

use crate::error::{ProtocolError, SessionError};
use crate::http::codec::{self, RequestDecoder};
use crate::http::queue::{EntryId, ReplyHead, ResponseQueue};
use crate::http::request::{Request, RequestExt};
use crate::http::responder::{Completion, Responder};
use crate::http::response::Response;
use crate::http::responses::{error_response, not_found_response, status_response};
use crate::net::Transport;
use crate::observability::metrics;
use crate::settings::SessionSettings;
use crate::websocket;

/// Bound on the orderly shutdown after the last response.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

const READ_CHUNK: usize = 8 * 1024;

enum ReadEvent {
    Request(Request),
    Eof,
    Malformed(ProtocolError),
    Failed(SessionError),
}

/// Read half plus the bytes received but not yet decoded.
struct Reader<S> {
    half: ReadHalf<S>,
    buffer: BytesMut,
    decoder: RequestDecoder,
    idle_timeout: Duration,
}

impl<S: Transport> Reader<S> {
    /// Read until one complete request is buffered.
    async fn next_request(mut self) -> (Self, ReadEvent) {
        let event = loop {
            match self.decoder.decode(&mut self.buffer) {
                Ok(Some(request)) => break ReadEvent::Request(request),
                Ok(None) => {}
                Err(e) => break ReadEvent::Malformed(e),
            }

            self.buffer.reserve(READ_CHUNK);
            match timeout(self.idle_timeout, self.half.read_buf(&mut self.buffer)).await {
                Ok(Ok(0)) if self.buffer.is_empty() => break ReadEvent::Eof,
                Ok(Ok(0)) => {
                    break ReadEvent::Failed(SessionError::Read(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed mid-request",
                    )))
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => break ReadEvent::Failed(SessionError::Read(e)),
                Err(_) => break ReadEvent::Failed(SessionError::Timeout(self.idle_timeout)),
            }
        };
        (self, event)
    }
}

type ReadOp<S> = BoxFuture<'static, (Reader<S>, ReadEvent)>;
type WriteOp<S> = BoxFuture<'static, (WriteHalf<S>, std::io::Result<u64>)>;

/// How the HTTP phase of a connection ended.
enum Exit<S> {
    Closed,
    Upgrade {
        stream: S,
        buffered: BytesMut,
        request: Request,
    },
}

/// Serves HTTP/1.x on one connection.
pub struct ConnectionSession<S: Transport> {
    settings: Arc<SessionSettings>,
    is_secure: bool,

    reader: Option<Reader<S>>,
    writer: Option<WriteHalf<S>>,
    read_op: Option<ReadOp<S>>,
    write_op: Option<WriteOp<S>>,

    queue: ResponseQueue,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,

    /// No more requests will be read.
    read_closed: bool,
    /// Reading stopped because the queue is full.
    paused: bool,
    /// The in-flight write ends the connection.
    closing: bool,
    pending_upgrade: Option<Request>,
    protocol_error: Option<ProtocolError>,
    /// Version of the last request read, used for replies that have none.
    version: http::Version,
}

impl<S: Transport> ConnectionSession<S> {
    pub fn new(stream: S, settings: Arc<SessionSettings>) -> Self {
        Self::with_buffer(stream, settings, BytesMut::new())
    }

    /// Start with bytes already read from the stream, e.g. during protocol
    /// detection.
    pub fn with_buffer(stream: S, settings: Arc<SessionSettings>, buffer: BytesMut) -> Self {
        let is_secure = stream.is_secure();
        let (read_half, write_half) = tokio::io::split(stream);
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let reader = Reader {
            half: read_half,
            buffer,
            decoder: RequestDecoder::new(settings.max_header_bytes(), settings.request_body_limit()),
            idle_timeout: settings.idle_timeout(),
        };

        Self {
            queue: ResponseQueue::new(settings.request_queue_limit()),
            settings,
            is_secure,
            reader: Some(reader),
            writer: Some(write_half),
            read_op: None,
            write_op: None,
            completions_tx,
            completions_rx,
            read_closed: false,
            paused: false,
            closing: false,
            pending_upgrade: None,
            protocol_error: None,
            version: http::Version::HTTP_11,
        }
    }

    /// Serve the connection until it closes, fails, or finishes as a
    /// message session.
    pub async fn run(self) -> Result<(), SessionError> {
        let settings = self.settings.clone();
        let is_secure = self.is_secure;
        match self.drive().await? {
            Exit::Closed => Ok(()),
            Exit::Upgrade {
                stream,
                buffered,
                request,
            } => websocket::serve(stream, buffered, request, settings, is_secure).await,
        }
    }

    async fn drive(mut self) -> Result<Exit<S>, SessionError> {
        self.start_read();

        loop {
            let deadline = self.queue.next_deadline();

            tokio::select! {
                Some((reader, event)) = OptionFuture::from(self.read_op.as_mut()), if self.read_op.is_some() => {
                    self.read_op = None;
                    self.reader = Some(reader);
                    self.on_read(event)?;
                }
                Some((writer, result)) = OptionFuture::from(self.write_op.as_mut()), if self.write_op.is_some() => {
                    self.write_op = None;
                    self.writer = Some(writer);
                    if let Err(e) = result {
                        return Err(SessionError::Write(e));
                    }
                    if self.closing {
                        return self.shutdown().await;
                    }
                    self.on_write_complete();
                }
                Some(completion) = self.completions_rx.recv() => {
                    self.on_completion(completion);
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_handler_timeout();
                }
            }

            self.send_next();

            if self.write_op.is_some() || self.read_op.is_some() || !self.queue.is_empty() {
                continue;
            }
            if self.pending_upgrade.is_some() {
                return self.into_upgrade();
            }
            if self.read_closed {
                return self.shutdown().await;
            }
        }
    }

    fn can_read(&self) -> bool {
        !self.read_closed && self.pending_upgrade.is_none() && self.read_op.is_none()
    }

    fn start_read(&mut self) {
        if !self.can_read() {
            return;
        }
        if let Some(reader) = self.reader.take() {
            self.read_op = Some(reader.next_request().boxed());
        }
    }

    fn on_read(&mut self, event: ReadEvent) -> Result<(), SessionError> {
        match event {
            ReadEvent::Request(request) => self.on_request(request),
            ReadEvent::Eof => {
                tracing::debug!(queued = self.queue.len(), "Peer closed its side");
                self.read_closed = true;
            }
            ReadEvent::Malformed(e) => {
                tracing::debug!(error = %e, "Rejecting malformed request");
                self.read_closed = true;
                let head = ReplyHead {
                    version: self.version,
                    keep_alive: false,
                };
                let entry = self.queue.add_entry(head, None);
                let completed = self
                    .queue
                    .complete(entry, error_response(self.version, e.status(), &e.to_string()));
                // The entry was just added, so it is still awaiting its response.
                debug_assert!(completed.is_ok());
                self.protocol_error = Some(e);
            }
            ReadEvent::Failed(e) => return Err(e),
        }
        Ok(())
    }

    fn on_request(&mut self, request: Request) {
        metrics::record_request();
        self.version = request.version();
        tracing::debug!(
            method = %request.method(),
            path = %request.uri().path(),
            version = ?request.version(),
            "Request received"
        );

        if request.is_websocket_upgrade() && self.settings.upgrade_allowed(&request) {
            tracing::debug!(path = %request.uri().path(), "Upgrade accepted");
            self.pending_upgrade = Some(request);
            return;
        }

        let head = ReplyHead {
            version: request.version(),
            keep_alive: request.keep_alive(),
        };
        // A limit too large to represent means no deadline.
        let deadline = self
            .settings
            .handler_timeout()
            .and_then(|limit| Instant::now().checked_add(limit));
        let entry = self.queue.add_entry(head, deadline);
        let responder = Responder::new(&self.completions_tx, entry);

        match self.settings.request_handler() {
            Some(handler) => handler(request, responder, self.is_secure),
            None => responder.respond(not_found_response(&request, "No handler implemented")),
        }

        if self.queue.is_full() {
            tracing::debug!(queued = self.queue.len(), "Response queue full, pausing reads");
            metrics::record_pipeline_paused();
            self.paused = true;
        } else {
            self.start_read();
        }
    }

    fn on_completion(&mut self, completion: Completion) {
        let response = match completion.response {
            Some(response) => response,
            None => {
                tracing::warn!(entry = %completion.entry, "Request dropped by handler");
                let status = StatusCode::INTERNAL_SERVER_ERROR;
                match self.fallback(completion.entry, status, "Request dropped by handler") {
                    Some(response) => response,
                    None => return,
                }
            }
        };

        if let Err(e) = self.queue.complete(completion.entry, response) {
            tracing::debug!(error = %e, "Ignoring late response");
        }
    }

    fn on_handler_timeout(&mut self) {
        for entry in self.queue.take_expired(Instant::now()) {
            tracing::warn!(entry = %entry, "Handler timed out");
            if let Some(response) = self.fallback(entry, StatusCode::SERVICE_UNAVAILABLE, "Handler timed out") {
                let _ = self.queue.complete(entry, response);
            }
        }
    }

    fn fallback(&self, entry: EntryId, status: StatusCode, text: &str) -> Option<Response> {
        let head = self.queue.reply_head(entry)?;
        Some(status_response(head.version, head.keep_alive, status, text))
    }

    fn on_write_complete(&mut self) {
        let was_full = self.queue.on_write_complete();
        if was_full && self.paused {
            tracing::debug!("Resuming reads");
            self.paused = false;
            self.start_read();
        }
    }

    /// Start writing the head response if it is ready.
    fn send_next(&mut self) {
        if self.write_op.is_some() {
            return;
        }
        let Some(mut writer) = self.writer.take() else {
            return;
        };
        let Some(response) = self.queue.try_send_head() else {
            self.writer = Some(writer);
            return;
        };

        self.closing = response.need_eof();
        if self.closing {
            // Nothing after this response will be answered.
            self.read_closed = true;
        }
        let status = response.status();
        tracing::debug!(
            status = status.as_u16(),
            kind = response.kind(),
            close = self.closing,
            "Writing response"
        );

        self.write_op = Some(
            async move {
                let result = codec::write_response(&mut writer, response).await;
                if result.is_ok() {
                    metrics::record_response(status.as_u16());
                }
                (writer, result)
            }
            .boxed(),
        );
    }

    async fn shutdown(mut self) -> Result<Exit<S>, SessionError> {
        // An in-flight read owns the read half; dropping it cancels the read.
        self.read_op = None;
        if let Some(mut writer) = self.writer.take() {
            match timeout(SHUTDOWN_TIMEOUT, writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(SessionError::Shutdown(e)),
                Err(_) => tracing::debug!("Shutdown timed out"),
            }
        }
        match self.protocol_error.take() {
            Some(e) => Err(SessionError::Protocol(e)),
            None => Ok(Exit::Closed),
        }
    }

    fn into_upgrade(mut self) -> Result<Exit<S>, SessionError> {
        let request = self.pending_upgrade.take();
        match (self.reader.take(), self.writer.take(), request) {
            (Some(reader), Some(writer), Some(request)) => Ok(Exit::Upgrade {
                stream: reader.half.unsplit(writer),
                buffered: reader.buffer,
                request,
            }),
            _ => Err(SessionError::Upgrade("connection halves unavailable")),
        }
    }
}
