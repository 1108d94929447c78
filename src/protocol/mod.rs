//! Protocol module - messages, payload fields, and framing.
//!
//! This module implements the message layer of the protocol:
//! - `@key=value` header text with id, command and options
//! - typed payload fields (int32, length-prefixed strings and blobs)
//! - 8-byte length prefix framing and a buffer for partial reads

mod frame;
mod frame_buffer;
mod message;
mod payload;
mod wire_format;

pub use frame::{build_frame, build_frame_parts, RawFrame};
pub use frame_buffer::FrameBuffer;
pub use message::{
    commands, Message, MessageId, COMMAND_KEY, FIELD_SEPARATOR, ID_KEY, REQUEST_KEY,
    VALUE_SEPARATOR,
};
pub use payload::{PayloadBuilder, PayloadReader};
pub use wire_format::{
    FrameLimits, FramePrefix, ABSOLUTE_MAX_LENGTH, DEFAULT_MAX_HEADER_SIZE,
    DEFAULT_MAX_PAYLOAD_SIZE, PREFIX_SIZE,
};
