//! Dedicated writer task for the transport's write half.
//!
//! Every task that writes (handlers replying, handlers sending nested
//! requests, the read loop reporting unknown commands) pushes frames into
//! one mpsc channel. A single writer task owns the write half, so frames
//! never interleave on the wire and nobody holds a lock across a write.
//!
//! # Architecture
//!
//! ```text
//! Handler 1 ─┐
//! Handler 2 ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► Socket
//! Read loop ─┘
//! ```
//!
//! Frames ready at the same time are batched into one vectored write.
//! [`WriterTask::finish`] closes the queue and writes what is left in it
//! before the stream is shut down.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{KernelError, Result};
use crate::protocol::{build_frame_parts, Message, PREFIX_SIZE};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time allowed for writing out the queue on finish.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written to the socket.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Pre-encoded length prefix (8 bytes).
    pub prefix: [u8; PREFIX_SIZE],
    /// Header text.
    pub header: Bytes,
    /// Payload bytes (can be empty for acknowledgements).
    pub payload: Bytes,
}

impl OutboundFrame {
    /// Encode a message into an outbound frame.
    pub fn from_message(message: &Message) -> Result<Self> {
        let (prefix, header, payload) = build_frame_parts(message)?;
        Ok(Self {
            prefix,
            header,
            payload,
        })
    }

    /// Total size of this frame (prefix + header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        PREFIX_SIZE + self.header.len() + self.payload.len()
    }

    /// Sections in wire order.
    fn sections(&self) -> [&[u8]; 3] {
        [&self.prefix[..], &self.header[..], &self.payload[..]]
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
    /// Time allowed for writing out the queue on finish.
    pub drain_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// This is cheaply cloneable and can be shared across handler tasks.
#[derive(Clone)]
pub struct WriterHandle {
    /// Channel sender for frames.
    tx: mpsc::Sender<OutboundFrame>,
    /// Pending frame count (for backpressure).
    pending: Arc<AtomicUsize>,
    /// Maximum pending frames.
    max_pending: usize,
    /// Backpressure timeout.
    timeout: Duration,
}

impl WriterHandle {
    fn new(
        tx: mpsc::Sender<OutboundFrame>,
        pending: Arc<AtomicUsize>,
        max_pending: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            tx,
            pending,
            max_pending,
            timeout,
        }
    }

    /// Encode and queue a message.
    pub async fn write_message(&self, message: &Message) -> Result<()> {
        let frame = OutboundFrame::from_message(message)?;
        self.send(frame).await
    }

    /// Send a frame to the writer task.
    ///
    /// This method will wait if backpressure is active, timing out after
    /// the configured duration.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            self.wait_for_backpressure().await?;
        }

        // Count before sending so the writer never decrements below zero
        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.send(frame).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            KernelError::ConnectionClosed
        })
    }

    /// Wait for backpressure to clear with timeout.
    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();
        let check_interval = Duration::from_micros(100);

        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }

            if start.elapsed() > self.timeout {
                return Err(KernelError::BackpressureTimeout);
            }

            tokio::time::sleep(check_interval).await;
        }
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }
}

/// The running writer task.
pub struct WriterTask {
    close: Option<oneshot::Sender<()>>,
    join: JoinHandle<Result<()>>,
    drain_timeout: Duration,
}

impl WriterTask {
    /// Stop accepting frames, write the ones already queued, then shut the
    /// stream down.
    ///
    /// Handles still alive afterwards get [`KernelError::ConnectionClosed`].
    ///
    /// # Errors
    ///
    /// The write error that stopped the task, or a `TimedOut` I/O error if
    /// the queue could not be written within the drain timeout. The task is
    /// aborted in that case.
    pub async fn finish(mut self) -> Result<()> {
        if let Some(close) = self.close.take() {
            let _ = close.send(());
        }

        match tokio::time::timeout(self.drain_timeout, &mut self.join).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(KernelError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                e,
            ))),
            Err(_) => {
                self.join.abort();
                Err(KernelError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "queued frames were not written before the drain timeout",
                )))
            }
        }
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task ends on [`WriterTask::finish`], once every `WriterHandle` clone
/// is dropped and the queue is drained, or on the first write error.
pub fn spawn_writer_task<W>(writer: W, config: WriterConfig) -> (WriterHandle, WriterTask)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle::new(
        tx,
        pending.clone(),
        config.max_pending_frames,
        config.backpressure_timeout,
    );

    let (close_tx, close_rx) = oneshot::channel();
    let join = tokio::spawn(writer_loop(rx, writer, pending, close_rx));

    let task = WriterTask {
        close: Some(close_tx),
        join,
        drain_timeout: config.drain_timeout,
    };
    (handle, task)
}

/// Main writer loop - receives frames and writes them to the socket.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
    mut close: oneshot::Receiver<()>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut closing = false;

    loop {
        let next = if closing {
            rx.recv().await
        } else {
            tokio::select! {
                frame = rx.recv() => frame,
                _ = &mut close => {
                    // No new frames; queued ones still go out
                    rx.close();
                    closing = true;
                    continue;
                }
            }
        };
        let Some(first) = next else {
            break;
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        if let Err(e) = write_batch(&mut writer, &batch).await {
            tracing::error!("Writer failed after {} queued frames: {}", batch_size, e);
            return Err(e);
        }

        pending.fetch_sub(batch_size, Ordering::Release);
    }

    // Queue closed and empty, clean shutdown
    writer.shutdown().await.ok();
    Ok(())
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(|f| f.size()).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        if slices.is_empty() {
            break;
        }

        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(KernelError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }

        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data after the first `skip_bytes` bytes.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 3);
    let mut offset = 0;

    for frame in batch {
        for section in frame.sections() {
            if section.is_empty() {
                continue;
            }
            let end = offset + section.len();
            if skip_bytes < end {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&section[start..]));
            }
            offset = end;
        }
    }

    slices
}
