//! Typed payload fields.
//!
//! Schema:
//! - fixed size types: `(value: int32 BE)`
//! - variable size types: `(length: int32 BE)(bytes)`, strings as UTF-8
//!
//! Fields carry no tags; each command fixes the order it reads them in.
//!
//! # Example
//!
//! ```
//! use kernel_link::protocol::{PayloadBuilder, PayloadReader};
//!
//! let mut builder = PayloadBuilder::new();
//! builder.add_string("table");
//! builder.add_integer(0);
//! builder.add_integer(99);
//!
//! let mut reader = PayloadReader::new(builder.finish().unwrap());
//! assert_eq!(reader.read_string().unwrap(), "table");
//! assert_eq!(reader.read_integer().unwrap(), 0);
//! assert_eq!(reader.read_integer().unwrap(), 99);
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{KernelError, Result};

/// Size of an integer field and of a length prefix.
const INT_SIZE: usize = 4;

/// Appends typed fields to a payload buffer.
///
/// A field too long for its length prefix is not written; the error is
/// kept and reported by [`finish`](Self::finish).
#[derive(Debug, Default)]
pub struct PayloadBuilder {
    buf: BytesMut,
    error: Option<KernelError>,
}

impl PayloadBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a UTF-8 string.
    pub fn add_string(&mut self, value: &str) -> &mut Self {
        self.add_bytes(value.as_bytes())
    }

    /// Append a length-prefixed byte blob.
    pub fn add_bytes(&mut self, data: &[u8]) -> &mut Self {
        match field_length(data.len()) {
            Ok(len) => {
                self.buf.reserve(INT_SIZE + data.len());
                self.buf.put_i32(len);
                self.buf.put_slice(data);
            }
            Err(e) => {
                if self.error.is_none() {
                    self.error = Some(e);
                }
            }
        }
        self
    }

    /// Append a 32-bit signed integer.
    pub fn add_integer(&mut self, value: i32) -> &mut Self {
        self.buf.put_i32(value);
        self
    }

    /// Encoded length so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Check if nothing was added.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Freeze into the payload bytes.
    ///
    /// # Errors
    ///
    /// [`KernelError::Payload`] if a field was longer than a length prefix
    /// can describe.
    pub fn finish(self) -> Result<Bytes> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.buf.freeze()),
        }
    }
}

fn field_length(len: usize) -> Result<i32> {
    i32::try_from(len).map_err(|_| {
        KernelError::Payload(format!("Field of {} bytes does not fit its length prefix", len))
    })
}

/// Reads typed fields from a payload in order.
///
/// Byte fields are split off the underlying buffer without copying.
#[derive(Debug, Clone)]
pub struct PayloadReader {
    buf: Bytes,
}

impl PayloadReader {
    /// Create a reader positioned at the first field.
    pub fn new(payload: Bytes) -> Self {
        Self { buf: payload }
    }

    /// Read the next 32-bit signed integer.
    pub fn read_integer(&mut self) -> Result<i32> {
        if self.buf.remaining() < INT_SIZE {
            return Err(KernelError::Payload(format!(
                "Expected integer field, {} bytes left",
                self.buf.remaining()
            )));
        }
        Ok(self.buf.get_i32())
    }

    /// Read the next length-prefixed byte blob.
    pub fn read_bytes(&mut self) -> Result<Bytes> {
        let len = self.read_integer()?;
        let len = usize::try_from(len)
            .map_err(|_| KernelError::Payload(format!("Negative field length {}", len)))?;
        if self.buf.remaining() < len {
            return Err(KernelError::Payload(format!(
                "Field of {} bytes exceeds remaining {} bytes",
                len,
                self.buf.remaining()
            )));
        }
        Ok(self.buf.split_to(len))
    }

    /// Read the next UTF-8 string.
    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| KernelError::Payload(format!("String field is not UTF-8: {}", e)))
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Check if every field was consumed.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
