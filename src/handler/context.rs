//! Context handed to a running command.
//!
//! Gives the command its incoming message and a way back to the host:
//! - `payload` - typed reader over the incoming fields
//! - `request` - send a nested data request and get its [`AnswerFuture`]
//! - `request_reply` - the same, waiting for the reply
//! - `shutdown` - stop the read loop
//!
//! The final reply is not sent from here; the command returns it and the
//! dispatcher writes it.

use crate::correlation::AnswerFuture;
use crate::dispatcher::DispatcherHandle;
use crate::error::{KernelError, Result};
use crate::protocol::{commands, Message, MessageId, PayloadReader};

/// Context passed to commands.
///
/// `CommandContext` is `Clone`; clones share the dispatcher.
#[derive(Clone)]
pub struct CommandContext {
    message: Message,
    handle: DispatcherHandle,
}

impl CommandContext {
    /// Create a context for an incoming message.
    pub fn new(message: Message, handle: DispatcherHandle) -> Self {
        Self { message, handle }
    }

    /// Id of the incoming message; replies carry it.
    #[inline]
    pub fn id(&self) -> MessageId {
        self.message.id()
    }

    /// Command name of the incoming message.
    #[inline]
    pub fn command(&self) -> &str {
        self.message.command()
    }

    /// The incoming message, header options included.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Reader positioned at the first payload field.
    pub fn payload(&self) -> PayloadReader {
        PayloadReader::new(self.message.payload_bytes())
    }

    /// Dispatcher this command runs under.
    pub fn handle(&self) -> &DispatcherHandle {
        &self.handle
    }

    /// Fresh id for a nested request.
    pub fn next_message_id(&self) -> MessageId {
        self.handle.next_message_id()
    }

    /// Send `message` as a data request.
    pub async fn request(&self, message: Message) -> Result<AnswerFuture> {
        self.handle.request(message).await
    }

    /// Send a data request built for a fresh id and wait for its reply.
    ///
    /// # Errors
    ///
    /// A reply with the `error` command becomes [`KernelError::Domain`]
    /// carrying the host's description.
    pub async fn request_reply<F>(&self, build: F) -> Result<Message>
    where
        F: FnOnce(MessageId) -> Result<Message>,
    {
        let message = build(self.next_message_id())?;
        let nested = message.id();
        tracing::debug!(
            id = self.id(),
            nested,
            command = message.command(),
            "sending nested request"
        );

        let reply = self.request(message).await?.wait().await?;
        if reply.command() == commands::ERROR {
            let description = PayloadReader::new(reply.payload_bytes())
                .read_string()
                .unwrap_or_default();
            return Err(KernelError::domain(format!(
                "Host rejected request {}: {}",
                nested, description
            )));
        }
        Ok(reply)
    }

    /// Stop the dispatcher after the current messages.
    pub fn shutdown(&self) {
        self.handle.shutdown();
    }
}
