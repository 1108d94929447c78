//! Dispatcher builder and read loop.
//!
//! The [`DispatcherBuilder`] collects configuration and starts the writer
//! task. The [`Dispatcher`] owns the read half and runs the single read
//! loop:
//! 1. Read one message
//! 2. If a request of ours waits for this id, hand the message over
//! 3. Otherwise resolve the command and spawn it on the handler pool
//! 4. Repeat; never wait for a handler
//!
//! Handlers talk back through a [`DispatcherHandle`], which can also be
//! used from outside to send requests of our own.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use kernel_link::{Dispatcher, MemoryKernel};
//!
//! #[tokio::main]
//! async fn main() -> kernel_link::Result<()> {
//!     let (reader, writer) = kernel_link::transport::connect(&"tcp://127.0.0.1:9000".parse()?).await?;
//!
//!     let dispatcher = Dispatcher::builder()
//!         .max_concurrent_handlers(8)
//!         .start(reader, writer, Arc::new(MemoryKernel::new()));
//!
//!     dispatcher.run().await
//! }
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::correlation::{AnswerFuture, Correlation, CorrelationTable};
use crate::error::{KernelError, Result};
use crate::handler::{Command, CommandContext, CommandRegistry};
use crate::kernel::WorkerState;
use crate::protocol::{FrameLimits, Message, MessageId};
use crate::transport::MessageReader;
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle, WriterTask};

/// First id handed out for requests this side originates.
///
/// The host numbers its own requests upwards from zero; starting high
/// keeps the two ranges apart.
pub const DEFAULT_FIRST_MESSAGE_ID: MessageId = 1 << 30;

/// Default handler pool size: twice the available parallelism.
pub fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(8)
}

/// Builder for configuring and starting a dispatcher.
pub struct DispatcherBuilder {
    registry: CommandRegistry,
    writer_config: WriterConfig,
    max_concurrent_handlers: usize,
    first_message_id: MessageId,
    frame_limits: FrameLimits,
}

impl DispatcherBuilder {
    /// Create a builder with the standard command set.
    pub fn new() -> Self {
        Self {
            registry: CommandRegistry::standard(),
            writer_config: WriterConfig::default(),
            max_concurrent_handlers: default_pool_size(),
            first_message_id: DEFAULT_FIRST_MESSAGE_ID,
            frame_limits: FrameLimits::default(),
        }
    }

    /// Use a specific command registry.
    pub fn registry(mut self, registry: CommandRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Set the maximum number of handlers running at once.
    ///
    /// Further commands wait for a free slot; the read loop does not.
    /// Default: twice the available parallelism
    pub fn max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.max_concurrent_handlers = limit.max(1);
        self
    }

    /// Set the maximum pending frames for backpressure.
    ///
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.writer_config.max_pending_frames = limit;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.writer_config.channel_capacity = capacity;
        self
    }

    /// Set the backpressure timeout.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.writer_config.backpressure_timeout = timeout;
        self
    }

    /// Set how long [`Dispatcher::run`] may spend writing out queued
    /// replies after the read loop ends.
    ///
    /// Default: 10 seconds
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.writer_config.drain_timeout = timeout;
        self
    }

    /// Set the first id used for outbound requests.
    ///
    /// Default: 2^30
    pub fn first_message_id(mut self, id: MessageId) -> Self {
        self.first_message_id = id;
        self
    }

    /// Set the frame size limits for incoming messages.
    pub fn frame_limits(mut self, limits: FrameLimits) -> Self {
        self.frame_limits = limits;
        self
    }

    /// Start the writer task and build the dispatcher.
    ///
    /// Must be called inside a tokio runtime. Nothing is read until
    /// [`Dispatcher::run`] is awaited.
    pub fn start<R, W>(self, reader: R, writer: W, state: Arc<dyn WorkerState>) -> Dispatcher<R>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (writer, writer_task) = spawn_writer_task(writer, self.writer_config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = DispatcherHandle {
            writer,
            correlation: CorrelationTable::new(),
            next_id: Arc::new(AtomicU32::new(self.first_message_id)),
            shutdown_tx: Arc::new(shutdown_tx),
        };

        Dispatcher {
            reader: MessageReader::with_limits(reader, self.frame_limits),
            registry: Arc::new(self.registry),
            state,
            handle,
            semaphore: Arc::new(Semaphore::new(self.max_concurrent_handlers)),
            shutdown_rx,
            writer_task,
        }
    }
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable access to a running dispatcher.
///
/// Sending goes through the writer task, so any number of tasks may send
/// at once without interleaving frames.
#[derive(Clone)]
pub struct DispatcherHandle {
    writer: WriterHandle,
    correlation: CorrelationTable,
    next_id: Arc<AtomicU32>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl DispatcherHandle {
    /// Send a message.
    ///
    /// For a data request the reply waiter is registered before the frame
    /// is queued, and its future is returned. Other messages return `None`.
    ///
    /// # Errors
    ///
    /// If the frame cannot be queued the registration is withdrawn and the
    /// error returned.
    pub async fn send(&self, message: Message) -> Result<Option<AnswerFuture>> {
        if !message.is_data_request() {
            self.writer.write_message(&message).await?;
            return Ok(None);
        }

        let answer = self.correlation.register(message.id())?;
        // On failure `answer` is dropped here, which withdraws the entry
        self.writer.write_message(&message).await?;
        Ok(Some(answer))
    }

    /// Send `message` as a data request and return the future of its reply.
    pub async fn request(&self, message: Message) -> Result<AnswerFuture> {
        match self.send(message.into_request()).await? {
            Some(answer) => Ok(answer),
            None => Err(KernelError::ProtocolViolation(
                "Data request was sent without a reply waiter".to_string(),
            )),
        }
    }

    /// Queue a reply (or any message that expects none).
    pub async fn reply(&self, message: Message) -> Result<()> {
        self.writer.write_message(&message).await
    }

    /// Allocate an id for an outbound request.
    pub fn next_message_id(&self) -> MessageId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Ask the read loop to stop.
    ///
    /// Takes effect even while the loop waits for input.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Whether shutdown was requested.
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Requests still waiting for (or holding an uncollected) reply.
    pub fn pending_requests(&self) -> usize {
        self.correlation.len()
    }

    /// Writer queue status.
    pub fn is_backpressure_active(&self) -> bool {
        self.writer.is_backpressure_active()
    }
}

/// A dispatcher ready to run on one connection.
pub struct Dispatcher<R> {
    reader: MessageReader<R>,
    registry: Arc<CommandRegistry>,
    state: Arc<dyn WorkerState>,
    handle: DispatcherHandle,
    semaphore: Arc<Semaphore>,
    shutdown_rx: watch::Receiver<bool>,
    writer_task: WriterTask,
}

impl Dispatcher<()> {
    /// Create a new dispatcher builder.
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }
}

impl<R: AsyncRead + Unpin> Dispatcher<R> {
    /// Handle for sending requests and requesting shutdown.
    pub fn handle(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    /// Run the read loop until shutdown, end of stream or a fatal error.
    ///
    /// On the way out every pending request fails with
    /// [`KernelError::ConnectionClosed`] and running handlers are awaited.
    /// Their replies are written out before this returns; handles kept
    /// elsewhere can no longer send afterwards.
    pub async fn run(self) -> Result<()> {
        let Dispatcher {
            mut reader,
            registry,
            state,
            handle,
            semaphore,
            mut shutdown_rx,
            writer_task,
        } = self;

        let mut handlers = JoinSet::new();

        let result = loop {
            if *shutdown_rx.borrow_and_update() {
                tracing::debug!("Shutdown requested, leaving read loop");
                break Ok(());
            }

            let read = tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                    continue;
                }
                read = reader.read_message() => read,
            };

            reap_finished(&mut handlers);

            match read {
                Ok(message) => route(message, &registry, &state, &handle, &semaphore, &mut handlers),
                Err(KernelError::ConnectionClosed) => {
                    tracing::debug!("Host closed the connection");
                    break Ok(());
                }
                Err(e) if !e.is_fatal() => {
                    tracing::warn!("Dropping unreadable message: {}", e);
                }
                Err(e) => {
                    tracing::error!("Read loop error: {}", e);
                    break Err(e);
                }
            }
        };

        handle.correlation.close_all();

        while let Some(joined) = handlers.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    tracing::error!("Handler task panicked: {}", e);
                }
            }
        }
        drop(handle);

        if let Err(e) = writer_task.finish().await {
            tracing::warn!("Replies may not have reached the host: {}", e);
        }

        result
    }
}

fn reap_finished(handlers: &mut JoinSet<()>) {
    while let Some(joined) = handlers.try_join_next() {
        if let Err(e) = joined {
            if e.is_panic() {
                tracing::error!("Handler task panicked: {}", e);
            }
        }
    }
}

/// Deliver a message to its waiter or start its command.
fn route(
    message: Message,
    registry: &CommandRegistry,
    state: &Arc<dyn WorkerState>,
    handle: &DispatcherHandle,
    semaphore: &Arc<Semaphore>,
    handlers: &mut JoinSet<()>,
) {
    let message = match handle.correlation.fulfill(message) {
        Ok(Correlation::Answered) => return,
        Ok(Correlation::Unmatched(message)) => message,
        Err(e) => {
            tracing::error!("{}", e);
            return;
        }
    };

    let id = message.id();
    let command = match registry.lookup(message.command()) {
        Ok(command) => command,
        Err(e) => {
            if message.is_reply() {
                // Its request was abandoned before the answer came
                tracing::warn!(
                    "Dropping {} for message {}: nobody waits for it",
                    message.command(),
                    id
                );
                return;
            }
            tracing::warn!("Rejecting message {}: {}", id, e);
            if let Some(reply) = error_reply(id, &e) {
                let handle = handle.clone();
                handlers.spawn(async move {
                    if let Err(e) = handle.reply(reply).await {
                        tracing::warn!("Could not report unknown command for message {}: {}", id, e);
                    }
                });
            }
            return;
        }
    };

    tracing::debug!(id, command = command.name(), "dispatching");

    let ctx = CommandContext::new(message, handle.clone());
    handlers.spawn(run_command(
        command,
        ctx,
        state.clone(),
        semaphore.clone(),
    ));
}

/// `error` reply describing `e`.
fn error_reply(id: MessageId, e: &KernelError) -> Option<Message> {
    match Message::error(id, &e.to_string()) {
        Ok(reply) => Some(reply),
        Err(build) => {
            tracing::error!("Could not build error reply for message {}: {}", id, build);
            None
        }
    }
}

/// Body of a handler task.
async fn run_command(
    command: Command,
    ctx: CommandContext,
    state: Arc<dyn WorkerState>,
    semaphore: Arc<Semaphore>,
) {
    // Permit is held until this task completes
    let _permit = match semaphore.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };

    let id = ctx.id();
    let reply = match command.execute(&ctx, state.as_ref()).await {
        Ok(Some(reply)) => reply,
        Ok(None) => return,
        Err(KernelError::ConnectionClosed) => {
            tracing::debug!("Connection closed while running {} for message {}", command.name(), id);
            return;
        }
        Err(e) => {
            tracing::error!("Command {} failed for message {}: {}", command.name(), id, e);
            match error_reply(id, &e) {
                Some(reply) => reply,
                None => return,
            }
        }
    };

    if let Err(e) = ctx.handle().reply(reply).await {
        tracing::warn!("Could not send reply to message {}: {}", id, e);
    }
}
