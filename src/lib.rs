//! # kernel-link
//!
//! Worker side of a command protocol between a controlling host and a
//! long-lived worker process.
//!
//! The host sends commands over one byte stream; the worker runs them
//! concurrently and replies. While running a command the worker may send
//! requests of its own back to the host and wait for the answers, over
//! the same stream, without stalling the reader.
//!
//! ## Architecture
//!
//! - **Framing** ([`protocol`]): length-prefixed frames carrying `@key=value`
//!   header text and a typed payload
//! - **Read loop** ([`Dispatcher`]): the only reader; routes replies to
//!   waiting requests and commands to the handler pool
//! - **Correlation** ([`correlation`]): reply waiters keyed by message id
//! - **Writer task** ([`writer`]): serialises all outgoing frames
//! - **Commands** ([`handler`]) against the **worker state** ([`kernel`])
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use kernel_link::{transport, Dispatcher, MemoryKernel};
//!
//! #[tokio::main]
//! async fn main() -> kernel_link::Result<()> {
//!     let endpoint = "tcp://127.0.0.1:9000".parse()?;
//!     let (reader, writer) = transport::connect(&endpoint).await?;
//!
//!     Dispatcher::builder()
//!         .start(reader, writer, Arc::new(MemoryKernel::new()))
//!         .run()
//!         .await
//! }
//! ```

pub mod correlation;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod kernel;
pub mod protocol;
pub mod transport;
pub mod writer;

pub use correlation::{AnswerFuture, CorrelationTable};
pub use dispatcher::{Dispatcher, DispatcherBuilder, DispatcherHandle};
pub use error::{KernelError, Result};
pub use handler::{Command, CommandContext, CommandRegistry};
pub use kernel::{MemoryKernel, WorkerState};
pub use protocol::{Message, MessageId};
