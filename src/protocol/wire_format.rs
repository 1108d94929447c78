//! Wire format encoding and decoding.
//!
//! Every message travels as one frame with an 8-byte length prefix:
//! ```text
//! ┌──────────────┬───────────────┬─────────────┬─────────────┐
//! │ Header length│ Payload length│ Header text │ Payload     │
//! │ int32 BE     │ int32 BE      │ UTF-8       │ raw bytes   │
//! └──────────────┴───────────────┴─────────────┴─────────────┘
//! ```
//!
//! Lengths are signed to match the host's `DataOutputStream.writeInt`.

use crate::error::{KernelError, Result};

/// Prefix size in bytes (fixed, exactly 8).
pub const PREFIX_SIZE: usize = 8;

/// Default maximum header text size (64 KiB).
pub const DEFAULT_MAX_HEADER_SIZE: u32 = 64 * 1024;

/// Default maximum payload size (1 GiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 1_073_741_824;

/// Absolute maximum of either length (max i32).
pub const ABSOLUTE_MAX_LENGTH: u32 = i32::MAX as u32;

/// Size limits enforced while reading frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    /// Maximum header text length.
    pub max_header_size: u32,
    /// Maximum payload length.
    pub max_payload_size: u32,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

/// Decoded length prefix from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePrefix {
    /// Header text length in bytes.
    pub header_length: i32,
    /// Payload length in bytes.
    pub payload_length: i32,
}

impl FramePrefix {
    /// Create a prefix for the given section lengths.
    ///
    /// Lengths above [`ABSOLUTE_MAX_LENGTH`] cannot be represented and are
    /// rejected.
    pub fn new(header_length: usize, payload_length: usize) -> Result<Self> {
        let to_i32 = |len: usize, what: &str| {
            i32::try_from(len).map_err(|_| {
                KernelError::Framing(format!("{} length {} does not fit the frame prefix", what, len))
            })
        };
        Ok(Self {
            header_length: to_i32(header_length, "Header")?,
            payload_length: to_i32(payload_length, "Payload")?,
        })
    }

    /// Encode prefix to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use kernel_link::protocol::FramePrefix;
    ///
    /// let prefix = FramePrefix::new(21, 4).unwrap();
    /// assert_eq!(prefix.encode(), [0, 0, 0, 21, 0, 0, 0, 4]);
    /// ```
    pub fn encode(&self) -> [u8; PREFIX_SIZE] {
        let mut buf = [0u8; PREFIX_SIZE];
        buf[0..4].copy_from_slice(&self.header_length.to_be_bytes());
        buf[4..8].copy_from_slice(&self.payload_length.to_be_bytes());
        buf
    }

    /// Decode prefix from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < PREFIX_SIZE {
            return None;
        }
        Some(Self {
            header_length: i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            payload_length: i32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }

    /// Validate the prefix against the limits.
    ///
    /// Checks:
    /// - Neither length is negative
    /// - Header is not empty and within `max_header_size`
    /// - Payload is within `max_payload_size`
    pub fn validate(&self, limits: &FrameLimits) -> Result<()> {
        if self.header_length <= 0 {
            return Err(KernelError::Framing(format!(
                "Invalid header length {}",
                self.header_length
            )));
        }
        if self.payload_length < 0 {
            return Err(KernelError::Framing(format!(
                "Invalid payload length {}",
                self.payload_length
            )));
        }
        if self.header_length as u32 > limits.max_header_size {
            return Err(KernelError::Framing(format!(
                "Header size {} exceeds maximum {}",
                self.header_length, limits.max_header_size
            )));
        }
        if self.payload_length as u32 > limits.max_payload_size {
            return Err(KernelError::Framing(format!(
                "Payload size {} exceeds maximum {}",
                self.payload_length, limits.max_payload_size
            )));
        }
        Ok(())
    }

    /// Header length as a buffer size. Only meaningful after [`validate`](Self::validate).
    #[inline]
    pub fn header_len(&self) -> usize {
        self.header_length.max(0) as usize
    }

    /// Payload length as a buffer size. Only meaningful after [`validate`](Self::validate).
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload_length.max(0) as usize
    }

    /// Bytes following the prefix.
    #[inline]
    pub fn body_len(&self) -> usize {
        self.header_len() + self.payload_len()
    }
}
