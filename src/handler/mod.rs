//! Handler module - commands and their dispatch.
//!
//! Provides:
//! - [`Command`] - one variant per operation, with its payload contract
//! - [`CommandRegistry`] - maps command names to commands
//! - [`CommandContext`] - incoming message plus the way back to the host
//!
//! # Example
//!
//! ```ignore
//! use kernel_link::handler::{CommandContext, CommandRegistry};
//!
//! let registry = CommandRegistry::standard();
//! let command = registry.lookup(message.command())?;
//! let ctx = CommandContext::new(message, handle);
//!
//! if let Some(reply) = command.execute(&ctx, state.as_ref()).await? {
//!     ctx.handle().reply(reply).await?;
//! }
//! ```

mod command;
mod context;
mod registry;

pub use command::{Command, HOST_OBJECT_TYPE};
pub use context::CommandContext;
pub use registry::CommandRegistry;
