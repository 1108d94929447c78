//! Command messages.
//!
//! A message is an id, a command name, optional string options and an
//! opaque payload. On the wire the first three travel as header text:
//!
//! ```text
//! @id=7@command=getTable@request=true
//! ```
//!
//! # Example
//!
//! ```
//! use kernel_link::protocol::Message;
//! use bytes::Bytes;
//!
//! let msg = Message::parse("@id=7@command=getpid@request=true", Bytes::new()).unwrap();
//! assert_eq!(msg.id(), 7);
//! assert_eq!(msg.command(), "getpid");
//! assert!(msg.is_data_request());
//! ```

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use bytes::Bytes;

use super::payload::PayloadBuilder;
use crate::error::{KernelError, Result};

/// Message identifier, chosen by the side initiating a request.
pub type MessageId = u32;

/// Header key carrying the message id (matched case-insensitively).
pub const ID_KEY: &str = "id";

/// Header key carrying the command name.
pub const COMMAND_KEY: &str = "command";

/// Header key flagging a message that expects a reply.
pub const REQUEST_KEY: &str = "request";

/// Starts a header field.
pub const FIELD_SEPARATOR: char = '@';

/// Separates a field's key from its value.
pub const VALUE_SEPARATOR: char = '=';

/// Command names used by replies and by requests this side originates.
pub mod commands {
    /// Bare acknowledgement.
    pub const SUCCESS: &str = "success";
    /// Reply to `execute`: stdout and stderr.
    pub const EXECUTE_RESPONSE: &str = "execute_response";
    /// Failure report carrying a description.
    pub const ERROR: &str = "error";
    /// Asks the host for a type extension's serializer.
    pub const SERIALIZER_REQUEST: &str = "serializer_request";
    /// Asks the host for a type extension's deserializer.
    pub const DESERIALIZER_REQUEST: &str = "deserializer_request";
    /// Ends the command name of every value reply.
    pub const RESPONSE_SUFFIX: &str = "_response";
}

/// A protocol message.
///
/// Equality and hashing use the id only: the id is what correlates a
/// reply with its request.
#[derive(Debug, Clone)]
pub struct Message {
    id: MessageId,
    command: String,
    options: BTreeMap<String, String>,
    payload: Bytes,
}

impl Message {
    /// Create a message with an empty payload and no options.
    pub fn new(id: MessageId, command: &str) -> Result<Self> {
        if command.is_empty() {
            return Err(KernelError::MalformedHeader(format!(
                "No command specified for message {}",
                id
            )));
        }
        check_field(COMMAND_KEY, command)?;
        Ok(Self::unchecked(id, command))
    }

    /// Construction for command names known to be valid.
    fn unchecked(id: MessageId, command: &str) -> Self {
        Self {
            id,
            command: command.to_string(),
            options: BTreeMap::new(),
            payload: Bytes::new(),
        }
    }

    /// Parse a message from header text and payload.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::MalformedHeader`] if a field lacks `=`, a
    /// key is empty, the id is not a non-negative integer or appears
    /// twice, an option contains a delimiter, or id or command is
    /// missing.
    pub fn parse(header: &str, payload: Bytes) -> Result<Self> {
        let mut id = None;
        let mut command = None;
        let mut options = BTreeMap::new();

        for field in header.split(FIELD_SEPARATOR) {
            if field.is_empty() {
                continue;
            }
            let (key, value) = field.split_once(VALUE_SEPARATOR).ok_or_else(|| {
                KernelError::MalformedHeader(format!("Field without value in header: {}", header))
            })?;
            if key.is_empty() {
                return Err(KernelError::MalformedHeader(format!(
                    "Field without key in header: {}",
                    header
                )));
            }

            if key.eq_ignore_ascii_case(ID_KEY) {
                if id.is_some() {
                    return Err(KernelError::MalformedHeader(format!(
                        "More than one id in header: {}",
                        header
                    )));
                }
                let parsed = value.parse::<MessageId>().map_err(|_| {
                    KernelError::MalformedHeader(format!("Invalid id '{}' in header: {}", value, header))
                })?;
                id = Some(parsed);
            } else if key == COMMAND_KEY {
                check_field(key, value)?;
                command = Some(value.to_string());
            } else {
                check_field(key, value)?;
                options.insert(key.to_string(), value.to_string());
            }
        }

        let command = command
            .filter(|c| !c.is_empty())
            .ok_or_else(|| KernelError::MalformedHeader(format!("No command in message {}", header)))?;
        let id = id.ok_or_else(|| KernelError::MalformedHeader(format!("No id in message {}", header)))?;

        Ok(Self {
            id,
            command,
            options,
            payload,
        })
    }

    /// Add an option.
    ///
    /// # Errors
    ///
    /// Fails if the key or value contains `@` or `=`, the key is empty,
    /// or the key is one of the reserved `id` / `command` keys.
    pub fn with_option(mut self, key: &str, value: &str) -> Result<Self> {
        if key.is_empty() || key.eq_ignore_ascii_case(ID_KEY) || key == COMMAND_KEY {
            return Err(KernelError::MalformedHeader(format!(
                "Reserved or empty option key '{}'",
                key
            )));
        }
        check_field(key, value)?;
        self.options.insert(key.to_string(), value.to_string());
        Ok(self)
    }

    /// Mark the message as a data request (the sender waits for a reply).
    pub fn into_request(mut self) -> Self {
        self.options
            .insert(REQUEST_KEY.to_string(), "true".to_string());
        self
    }

    /// Replace the payload.
    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    /// Get the message id.
    #[inline]
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Get the command name.
    #[inline]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Get an option value (excluding id and command).
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(|s| s.as_str())
    }

    /// All options (excluding id and command).
    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get a clone of the payload as Bytes (cheap, zero-copy).
    #[inline]
    pub fn payload_bytes(&self) -> Bytes {
        self.payload.clone()
    }

    /// Whether the sender of this message waits for a reply.
    pub fn is_data_request(&self) -> bool {
        self.options
            .get(REQUEST_KEY)
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false)
    }

    /// Whether the command names a reply rather than an operation.
    ///
    /// A reply nobody waits for anymore arrives as an ordinary message;
    /// this is how the read loop tells it from a command.
    pub fn is_reply(&self) -> bool {
        self.command == commands::SUCCESS
            || self.command == commands::ERROR
            || self.command.ends_with(commands::RESPONSE_SUFFIX)
    }

    /// Render the header text; [`Message::parse`] inverts it.
    pub fn header_text(&self) -> String {
        let mut header = format!("@{}={}@{}={}", ID_KEY, self.id, COMMAND_KEY, self.command);
        for (key, value) in &self.options {
            header.push(FIELD_SEPARATOR);
            header.push_str(key);
            header.push(VALUE_SEPARATOR);
            header.push_str(value);
        }
        header
    }

    // Replies and requests with fixed shapes

    /// Bare success acknowledgement.
    pub fn success(id: MessageId) -> Self {
        Self::unchecked(id, commands::SUCCESS)
    }

    /// Reply with one integer field.
    pub fn integer(id: MessageId, command: &str, value: i32) -> Result<Self> {
        let mut payload = PayloadBuilder::new();
        payload.add_integer(value);
        Ok(Self::new(id, command)?.with_payload(payload.finish()?))
    }

    /// Reply with one string field.
    pub fn string(id: MessageId, command: &str, value: &str) -> Result<Self> {
        let mut payload = PayloadBuilder::new();
        payload.add_string(value);
        Ok(Self::new(id, command)?.with_payload(payload.finish()?))
    }

    /// Reply with one byte-blob field.
    pub fn bytes(id: MessageId, command: &str, data: &[u8]) -> Result<Self> {
        let mut payload = PayloadBuilder::new();
        payload.add_bytes(data);
        Ok(Self::new(id, command)?.with_payload(payload.finish()?))
    }

    /// Reply to `execute` with captured output and error streams.
    pub fn execute_response(id: MessageId, output: &str, error: &str) -> Result<Self> {
        let mut payload = PayloadBuilder::new();
        payload.add_string(output).add_string(error);
        Ok(Self::unchecked(id, commands::EXECUTE_RESPONSE).with_payload(payload.finish()?))
    }

    /// Failure report for the command with the given id.
    pub fn error(id: MessageId, description: &str) -> Result<Self> {
        let mut payload = PayloadBuilder::new();
        payload.add_string(description);
        Ok(Self::unchecked(id, commands::ERROR).with_payload(payload.finish()?))
    }

    /// Ask the host for the serializer of a type extension.
    pub fn serializer_request(id: MessageId, extension: &str) -> Result<Self> {
        let mut payload = PayloadBuilder::new();
        payload.add_string(extension);
        Ok(Self::unchecked(id, commands::SERIALIZER_REQUEST)
            .with_payload(payload.finish()?)
            .into_request())
    }

    /// Ask the host for the deserializer of a type extension.
    pub fn deserializer_request(id: MessageId, extension: &str) -> Result<Self> {
        let mut payload = PayloadBuilder::new();
        payload.add_string(extension);
        Ok(Self::unchecked(id, commands::DESERIALIZER_REQUEST)
            .with_payload(payload.finish()?)
            .into_request())
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Message {}

impl Hash for Message {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

fn check_field(key: &str, value: &str) -> Result<()> {
    let forbidden = |s: &str| s.contains(FIELD_SEPARATOR) || s.contains(VALUE_SEPARATOR);
    if forbidden(key) || forbidden(value) {
        return Err(KernelError::MalformedHeader(format!(
            "Forbidden character (@ or =) in option {}={}",
            key, value
        )));
    }
    Ok(())
}
