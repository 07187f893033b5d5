//! One-shot completion handle given to request handlers.

use std::fmt;

use tokio::sync::mpsc::{UnboundedSender, WeakUnboundedSender};

use crate::http::queue::EntryId;
use crate::http::response::Response;

/// Message from a responder back to its connection task.
///
/// `response` is `None` when the responder was dropped unused.
#[derive(Debug)]
pub(crate) struct Completion {
    pub(crate) entry: EntryId,
    pub(crate) response: Option<Response>,
}

/// Delivers the response for one request.
///
/// The responder holds only a weak link to its connection: it never keeps
/// the connection alive, and responding after the connection has gone away
/// does nothing. It is `Send`, so a handler may move it to another task or
/// thread and respond later.
///
/// Dropping a responder without calling [`respond`](Self::respond) answers
/// the request with `500 Internal Server Error`.
pub struct Responder {
    tx: WeakUnboundedSender<Completion>,
    entry: EntryId,
    sent: bool,
}

impl Responder {
    pub(crate) fn new(tx: &UnboundedSender<Completion>, entry: EntryId) -> Self {
        Self {
            tx: tx.downgrade(),
            entry,
            sent: false,
        }
    }

    /// Complete the request.
    pub fn respond(mut self, response: impl Into<Response>) {
        self.sent = true;
        self.deliver(Some(response.into()));
    }

    /// Whether the connection that issued this responder is still open.
    pub fn is_connected(&self) -> bool {
        self.tx.upgrade().is_some()
    }

    fn deliver(&self, response: Option<Response>) {
        if let Some(tx) = self.tx.upgrade() {
            // The receiver may close between upgrade and send; nothing to do then.
            let _ = tx.send(Completion {
                entry: self.entry,
                response,
            });
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if !self.sent {
            self.deliver(None);
        }
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("entry", &self.entry)
            .field("connected", &self.is_connected())
            .finish()
    }
}
