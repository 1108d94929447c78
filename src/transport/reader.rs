//! Read half of the transport.
//!
//! [`MessageReader`] owns the read half, a 64KB read buffer and a
//! [`FrameBuffer`]. Frames completed by one socket read are queued, so
//! every call hands out exactly one message. A framing error found in the
//! same read is reported once the frames before it are handed out.

use std::collections::VecDeque;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{KernelError, Result};
use crate::protocol::{FrameBuffer, FrameLimits, Message, RawFrame};

/// Size of a single socket read.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Reads whole messages from a byte stream.
pub struct MessageReader<R> {
    reader: R,
    frames: FrameBuffer,
    ready: VecDeque<RawFrame>,
    failed: Option<KernelError>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    /// Wrap a read half with the default frame limits.
    pub fn new(reader: R) -> Self {
        Self::with_limits(reader, FrameLimits::default())
    }

    /// Wrap a read half with custom frame limits.
    pub fn with_limits(reader: R, limits: FrameLimits) -> Self {
        Self {
            reader,
            frames: FrameBuffer::with_limits(limits),
            ready: VecDeque::new(),
            failed: None,
            buf: vec![0u8; READ_BUFFER_SIZE],
        }
    }

    /// Read the next message.
    ///
    /// Cancel safe: dropping the future loses no bytes, the next call
    /// picks up where this one stopped.
    ///
    /// # Errors
    ///
    /// - [`KernelError::MalformedHeader`] for a frame whose header does not
    ///   parse. The frame is consumed; the next call continues after it.
    /// - [`KernelError::ConnectionClosed`] at end of stream.
    /// - [`KernelError::Framing`] or [`KernelError::Io`] when the stream can
    ///   no longer be read.
    pub async fn read_message(&mut self) -> Result<Message> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return frame.into_message();
            }
            if let Some(e) = self.failed.take() {
                return Err(e);
            }

            let n = self.reader.read(&mut self.buf).await?;
            if n == 0 {
                if !self.frames.is_empty() {
                    tracing::warn!(
                        "Stream ended with {} bytes of an incomplete frame",
                        self.frames.len()
                    );
                }
                return Err(KernelError::ConnectionClosed);
            }

            if let Err(e) = self.frames.push(&self.buf[..n], &mut self.ready) {
                self.failed = Some(e);
            }
        }
    }
}
