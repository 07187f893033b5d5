//! Ordered response queue for pipelined requests.
//!
//! One entry exists per accepted request, in arrival order. Handlers may
//! complete entries in any order; only the head entry is ever written, and
//! only one write is in flight at a time.

use std::collections::VecDeque;
use std::fmt;

use http::Version;
use thiserror::Error;
use tokio::time::Instant;

use crate::http::response::Response;

/// Position-independent handle for one queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct EntryId(u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
enum EntryState {
    AwaitingHandler,
    Ready(Response),
    Sent,
}

/// What a synthesized reply for an entry must look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReplyHead {
    pub(crate) version: Version,
    pub(crate) keep_alive: bool,
}

#[derive(Debug)]
struct Entry {
    id: EntryId,
    state: EntryState,
    head: ReplyHead,
    deadline: Option<Instant>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum CompleteError {
    #[error("entry {0} already has a response")]
    AlreadyCompleted(EntryId),

    #[error("entry {0} is not queued")]
    Unknown(EntryId),
}

#[derive(Debug)]
pub(crate) struct ResponseQueue {
    entries: VecDeque<Entry>,
    limit: usize,
    write_active: bool,
    next_id: u64,
}

impl ResponseQueue {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(limit),
            limit: limit.max(1),
            write_active: false,
            next_id: 0,
        }
    }

    /// Append an entry for a newly accepted request.
    pub(crate) fn add_entry(&mut self, head: ReplyHead, deadline: Option<Instant>) -> EntryId {
        let id = EntryId(self.next_id);
        self.next_id += 1;
        self.entries.push_back(Entry {
            id,
            state: EntryState::AwaitingHandler,
            head,
            deadline,
        });
        id
    }

    pub(crate) fn reply_head(&self, id: EntryId) -> Option<ReplyHead> {
        self.entries.iter().find(|entry| entry.id == id).map(|entry| entry.head)
    }

    pub(crate) fn is_full(&self) -> bool {
        self.entries.len() >= self.limit
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Attach a response to an entry still waiting for its handler.
    pub(crate) fn complete(&mut self, id: EntryId, response: Response) -> Result<(), CompleteError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.id == id)
            .ok_or(CompleteError::Unknown(id))?;
        match entry.state {
            EntryState::AwaitingHandler => {
                entry.state = EntryState::Ready(response);
                entry.deadline = None;
                Ok(())
            }
            _ => Err(CompleteError::AlreadyCompleted(id)),
        }
    }

    /// Take the head response for writing, if it is ready and the writer idle.
    pub(crate) fn try_send_head(&mut self) -> Option<Response> {
        if self.write_active {
            return None;
        }
        let head = self.entries.front_mut()?;
        if !matches!(head.state, EntryState::Ready(_)) {
            return None;
        }
        match std::mem::replace(&mut head.state, EntryState::Sent) {
            EntryState::Ready(response) => {
                self.write_active = true;
                Some(response)
            }
            other => {
                head.state = other;
                None
            }
        }
    }

    /// Retire the written head entry.
    ///
    /// Returns whether the queue was full before the entry left, i.e. whether
    /// a paused reader may resume.
    pub(crate) fn on_write_complete(&mut self) -> bool {
        let was_full = self.is_full();
        if matches!(self.entries.front(), Some(entry) if matches!(entry.state, EntryState::Sent)) {
            self.entries.pop_front();
        }
        self.write_active = false;
        was_full
    }

    /// Earliest handler deadline among entries still awaiting a response.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().filter_map(|entry| entry.deadline).min()
    }

    /// Entries whose handler deadline has passed.
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<EntryId> {
        self.entries
            .iter_mut()
            .filter(|entry| entry.deadline.is_some_and(|deadline| deadline <= now))
            .map(|entry| {
                entry.deadline = None;
                entry.id
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const HEAD: ReplyHead = ReplyHead {
        version: Version::HTTP_11,
        keep_alive: true,
    };

    fn text(body: &str) -> Response {
        http::Response::new(body.to_string()).into()
    }

    fn body(response: Response) -> String {
        match response {
            Response::Text(res) => res.into_body(),
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn sends_in_arrival_order() {
        let mut queue = ResponseQueue::new(4);
        let first = queue.add_entry(HEAD, None);
        let second = queue.add_entry(HEAD, None);

        queue.complete(second, text("second")).unwrap();
        assert!(queue.try_send_head().is_none());

        queue.complete(first, text("first")).unwrap();
        assert_eq!(body(queue.try_send_head().unwrap()), "first");
        // One write at a time.
        assert!(queue.try_send_head().is_none());

        assert!(!queue.on_write_complete());
        assert_eq!(body(queue.try_send_head().unwrap()), "second");
        queue.on_write_complete();
        assert!(queue.is_empty());
        assert!(queue.try_send_head().is_none());
    }

    #[test]
    fn reports_full_until_head_is_written() {
        let mut queue = ResponseQueue::new(2);
        let first = queue.add_entry(HEAD, None);
        queue.add_entry(HEAD, None);
        assert!(queue.is_full());

        queue.complete(first, text("a")).unwrap();
        assert!(queue.is_full());
        queue.try_send_head().unwrap();
        assert!(queue.is_full());

        assert!(queue.on_write_complete());
        assert!(!queue.is_full());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn rejects_double_completion() {
        let mut queue = ResponseQueue::new(2);
        let id = queue.add_entry(HEAD, None);
        queue.complete(id, text("a")).unwrap();
        assert_eq!(queue.complete(id, text("b")), Err(CompleteError::AlreadyCompleted(id)));

        queue.try_send_head().unwrap();
        queue.on_write_complete();
        assert_eq!(queue.complete(id, text("c")), Err(CompleteError::Unknown(id)));
    }

    #[test]
    fn expires_waiting_entries() {
        let now = Instant::now();
        let mut queue = ResponseQueue::new(4);
        let slow = queue.add_entry(HEAD, Some(now + Duration::from_secs(1)));
        let done = queue.add_entry(HEAD, Some(now));
        queue.complete(done, text("ok")).unwrap();

        assert_eq!(queue.next_deadline(), Some(now + Duration::from_secs(1)));
        assert!(queue.take_expired(now).is_empty());
        assert_eq!(queue.take_expired(now + Duration::from_secs(2)), vec![slow]);
        assert_eq!(queue.next_deadline(), None);
        assert_eq!(queue.reply_head(slow), Some(HEAD));
    }
}
