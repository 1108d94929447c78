//! Transport module - message reading and socket plumbing.
//!
//! Provides:
//! - [`MessageReader`]: turns the read half of any byte stream into parsed messages
//! - [`Endpoint`] and [`connect`]: reaching the host over TCP or a Unix domain socket
//!
//! The write half is owned by the writer task (see [`crate::writer`]).

mod reader;
pub mod socket;

pub use reader::MessageReader;
pub use socket::{connect, BoxedReader, BoxedWriter, Endpoint};
