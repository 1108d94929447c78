//! Raw frames and frame building.
//!
//! A [`RawFrame`] is what the frame buffer cuts out of the byte stream:
//! header text and payload, still unparsed. Uses `bytes::Bytes` for
//! zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use kernel_link::protocol::{build_frame, FrameBuffer, Message};
//!
//! let msg = Message::success(3);
//! let bytes = build_frame(&msg).unwrap();
//!
//! let mut frames = Vec::new();
//! FrameBuffer::new().push(&bytes, &mut frames).unwrap();
//! let parsed = frames[0].clone().into_message().unwrap();
//! assert_eq!(parsed.id(), 3);
//! assert_eq!(parsed.command(), "success");
//! ```

use bytes::Bytes;

use super::message::Message;
use super::wire_format::{FramePrefix, PREFIX_SIZE};
use crate::error::{KernelError, Result};

/// A complete frame, header not yet parsed.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Header text bytes.
    pub header: Bytes,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl RawFrame {
    /// Create a new frame from header and payload.
    pub fn new(header: Bytes, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Parse the header and build the message.
    ///
    /// # Errors
    ///
    /// [`KernelError::MalformedHeader`] if the header is not UTF-8 or
    /// violates a message invariant. The error concerns this frame only.
    pub fn into_message(self) -> Result<Message> {
        let header = std::str::from_utf8(&self.header)
            .map_err(|e| KernelError::MalformedHeader(format!("Header is not UTF-8: {}", e)))?;
        Message::parse(header, self.payload)
    }
}

/// Build a complete frame as a single byte vector.
///
/// Use `build_frame_parts` for scatter/gather I/O (writev).
pub fn build_frame(message: &Message) -> Result<Vec<u8>> {
    let (prefix, header, payload) = build_frame_parts(message)?;
    let mut buf = Vec::with_capacity(PREFIX_SIZE + header.len() + payload.len());
    buf.extend_from_slice(&prefix);
    buf.extend_from_slice(&header);
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Build frame parts for scatter/gather I/O.
///
/// Returns the encoded prefix, the header text and the payload. The
/// payload is shared, not copied.
pub fn build_frame_parts(message: &Message) -> Result<([u8; PREFIX_SIZE], Bytes, Bytes)> {
    let header = Bytes::from(message.header_text());
    let payload = message.payload_bytes();
    let prefix = FramePrefix::new(header.len(), payload.len())?;
    Ok((prefix.encode(), header, payload))
}
