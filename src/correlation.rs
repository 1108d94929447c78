//! Correlation of replies with outstanding requests.
//!
//! Every request this side sends registers its id here before the frame
//! is written. The read loop offers each incoming message to the table
//! first; a message whose id has a waiter is a reply and goes to that
//! waiter, anything else is a command for the registry.
//!
//! ```text
//!   send ──► register(id) ──► write frame
//!                                    ╎
//!   read loop ──► fulfill(msg) ──► oneshot ──► AnswerFuture::wait
//! ```
//!
//! The waiter removes its own entry when the [`AnswerFuture`] is dropped,
//! whether it got an answer, timed out or gave up. A second reply for an
//! id that was already answered is a protocol violation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{KernelError, Result};
use crate::protocol::{Message, MessageId};

enum Slot {
    /// Registered, no reply yet.
    Waiting(oneshot::Sender<Message>),
    /// Reply delivered, waiter has not collected it yet.
    Answered,
}

#[derive(Default)]
struct Inner {
    slots: HashMap<MessageId, Slot>,
    closed: bool,
}

/// Outcome of offering an incoming message to the table.
#[derive(Debug)]
pub enum Correlation {
    /// The message answered a pending request.
    Answered,
    /// No request is waiting on this id; the message is a command.
    Unmatched(Message),
}

/// Map from message id to the waiter for its reply.
///
/// Cloning shares the same table.
#[derive(Clone, Default)]
pub struct CorrelationTable {
    inner: Arc<Mutex<Inner>>,
}

impl CorrelationTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for the reply to `id`.
    ///
    /// Must happen before the request is written, otherwise a fast reply
    /// could arrive while nobody is registered.
    ///
    /// # Errors
    ///
    /// - [`KernelError::ProtocolViolation`] if `id` is already outstanding
    /// - [`KernelError::ConnectionClosed`] after [`close_all`](Self::close_all)
    pub fn register(&self, id: MessageId) -> Result<AnswerFuture> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(KernelError::ConnectionClosed);
        }
        if inner.slots.contains_key(&id) {
            return Err(KernelError::ProtocolViolation(format!(
                "Message id {} is already awaiting a reply",
                id
            )));
        }

        let (tx, rx) = oneshot::channel();
        inner.slots.insert(id, Slot::Waiting(tx));
        tracing::trace!(id, pending = inner.slots.len(), "registered reply waiter");

        Ok(AnswerFuture {
            id,
            rx,
            table: self.clone(),
        })
    }

    /// Deliver `message` to the waiter registered for its id.
    ///
    /// Never blocks: the reply is handed over through a oneshot channel.
    ///
    /// # Errors
    ///
    /// [`KernelError::ProtocolViolation`] if the id was already answered.
    /// The existing answer is left untouched.
    pub fn fulfill(&self, message: Message) -> Result<Correlation> {
        let id = message.id();
        let sender = {
            let mut inner = self.inner.lock();
            match inner.slots.get_mut(&id) {
                None => return Ok(Correlation::Unmatched(message)),
                Some(slot) => match std::mem::replace(slot, Slot::Answered) {
                    Slot::Waiting(tx) => tx,
                    Slot::Answered => {
                        return Err(KernelError::ProtocolViolation(format!(
                            "Second reply for message {} (command {})",
                            id,
                            message.command()
                        )));
                    }
                },
            }
        };

        // The waiter may be gone already; its drop cleans the slot.
        if sender.send(message).is_err() {
            tracing::debug!(id, "reply arrived after its waiter was dropped");
        }
        Ok(Correlation::Answered)
    }

    /// Whether a request with this id still waits for its reply.
    pub fn is_pending(&self, id: MessageId) -> bool {
        matches!(self.inner.lock().slots.get(&id), Some(Slot::Waiting(_)))
    }

    /// Number of registered entries, answered or not.
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Check if no entries are registered.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().slots.is_empty()
    }

    /// Fail every outstanding waiter with `ConnectionClosed` and refuse
    /// new registrations.
    pub fn close_all(&self) {
        let drained: Vec<_> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.slots.drain().collect()
        };
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "closing outstanding reply waiters");
        }
    }

    fn remove(&self, id: MessageId) {
        self.inner.lock().slots.remove(&id);
    }
}

/// The eventual reply to one request.
///
/// Dropping it without waiting abandons the request; a reply that still
/// arrives is then treated as an unmatched message.
#[must_use = "dropping an AnswerFuture abandons the reply"]
pub struct AnswerFuture {
    id: MessageId,
    rx: oneshot::Receiver<Message>,
    table: CorrelationTable,
}

impl AnswerFuture {
    /// Id of the request this future answers.
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Wait for the reply.
    ///
    /// Returns immediately if the reply arrived before this call.
    ///
    /// # Errors
    ///
    /// [`KernelError::ConnectionClosed`] if the connection ended first.
    pub async fn wait(mut self) -> Result<Message> {
        (&mut self.rx)
            .await
            .map_err(|_| KernelError::ConnectionClosed)
    }

    /// Wait for the reply for at most `timeout`.
    pub async fn wait_timeout(mut self, timeout: Duration) -> Result<Message> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(KernelError::ConnectionClosed),
            Err(_) => Err(KernelError::ReplyTimeout(self.id)),
        }
    }
}

impl Drop for AnswerFuture {
    fn drop(&mut self) {
        self.table.remove(self.id);
    }
}

impl std::fmt::Debug for AnswerFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnswerFuture").field("id", &self.id).finish()
    }
}
