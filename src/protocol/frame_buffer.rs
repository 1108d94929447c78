//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForPrefix`: Need at least 8 bytes
//! - `WaitingForBody`: Prefix parsed, need header + payload bytes
//!
//! # Example
//!
//! ```ignore
//! use kernel_link::protocol::FrameBuffer;
//!
//! let mut buffer = FrameBuffer::new();
//!
//! // Data arrives in chunks from socket
//! let mut frames = Vec::new();
//! buffer.push(&chunk, &mut frames)?;
//!
//! for frame in frames {
//!     let message = frame.into_message()?;
//! }
//! ```

use bytes::BytesMut;

use super::frame::RawFrame;
use super::wire_format::{FrameLimits, FramePrefix, PREFIX_SIZE};
use crate::error::Result;

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for complete prefix (need 8 bytes).
    WaitingForPrefix,
    /// Prefix parsed, waiting for header and payload bytes.
    WaitingForBody { prefix: FramePrefix },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
///
/// All data is stored in a single `BytesMut` buffer to minimize allocations.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Size limits for header and payload.
    limits: FrameLimits,
}

impl FrameBuffer {
    /// Create a new frame buffer with default limits.
    ///
    /// Default capacity: 64KB, max header: 64KB, max payload: 1GB.
    pub fn new() -> Self {
        Self::with_limits(FrameLimits::default())
    }

    /// Create a new frame buffer with custom limits.
    pub fn with_limits(limits: FrameLimits) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForPrefix,
            limits,
        }
    }

    /// Push data into the buffer and append every complete frame to
    /// `frames`.
    ///
    /// Partial data is buffered internally for the next push.
    ///
    /// # Errors
    ///
    /// Returns a framing error if a prefix is invalid or exceeds the
    /// limits. The stream is out of sync after that. Frames completed
    /// before the bad prefix have been appended already.
    pub fn push<E>(&mut self, data: &[u8], frames: &mut E) -> Result<()>
    where
        E: Extend<RawFrame>,
    {
        self.buffer.extend_from_slice(data);

        while let Some(frame) = self.try_extract_one()? {
            frames.extend(Some(frame));
        }
        Ok(())
    }

    /// Try to extract a single frame from the buffer.
    ///
    /// Returns:
    /// - `Ok(Some(frame))` if a complete frame was extracted
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` if protocol violation (e.g., payload too large)
    fn try_extract_one(&mut self) -> Result<Option<RawFrame>> {
        loop {
            match &self.state {
                State::WaitingForPrefix => {
                    let prefix = match FramePrefix::decode(&self.buffer) {
                        Some(prefix) => prefix,
                        None => return Ok(None),
                    };
                    prefix.validate(&self.limits)?;

                    let _ = self.buffer.split_to(PREFIX_SIZE);
                    self.buffer.reserve(prefix.body_len());
                    self.state = State::WaitingForBody { prefix };
                }

                State::WaitingForBody { prefix } => {
                    if self.buffer.len() < prefix.body_len() {
                        return Ok(None);
                    }

                    let header = self.buffer.split_to(prefix.header_len()).freeze();
                    let payload = self.buffer.split_to(prefix.payload_len()).freeze();
                    self.state = State::WaitingForPrefix;

                    return Ok(Some(RawFrame::new(header, payload)));
                }
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Get the current state for debugging.
    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForPrefix => "WaitingForPrefix",
            State::WaitingForBody { .. } => "WaitingForBody",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
