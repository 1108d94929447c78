//! Command registry for dispatching messages by command name.
//!
//! The registry is built once, before the dispatcher starts, and never
//! changes afterwards. [`CommandRegistry::standard`] knows every command;
//! a restricted registry serves workers that expose only part of the
//! vocabulary.
//!
//! # Example
//!
//! ```
//! use kernel_link::handler::{Command, CommandRegistry};
//!
//! let registry = CommandRegistry::with_commands([Command::GetPid, Command::Reset]);
//! assert_eq!(registry.lookup("getpid").unwrap(), Command::GetPid);
//! assert!(registry.lookup("execute").is_err());
//! ```

use std::collections::HashMap;

use super::Command;
use crate::error::{KernelError, Result};

/// Registry mapping command names to commands.
#[derive(Debug, Clone)]
pub struct CommandRegistry {
    commands: HashMap<&'static str, Command>,
}

impl CommandRegistry {
    /// Registry with every command.
    pub fn standard() -> Self {
        Self::with_commands(Command::ALL)
    }

    /// Registry with the given commands only.
    pub fn with_commands(commands: impl IntoIterator<Item = Command>) -> Self {
        Self {
            commands: commands.into_iter().map(|c| (c.name(), c)).collect(),
        }
    }

    /// Resolve a command name.
    ///
    /// # Errors
    ///
    /// [`KernelError::UnknownCommand`] if the name is not registered.
    pub fn lookup(&self, name: &str) -> Result<Command> {
        self.commands
            .get(name)
            .copied()
            .ok_or_else(|| KernelError::UnknownCommand(name.to_string()))
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.commands.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Number of registered commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether no command is registered.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
