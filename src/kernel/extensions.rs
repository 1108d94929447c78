//! Type extension registry.
//!
//! The host owns the code that turns extension values into bytes and
//! back. It tells the worker where that code lives, either up front
//! (`addSerializer` / `addDeserializer`) or when the worker asks for it.

use std::collections::HashMap;

use crate::error::{KernelError, Result};

/// Where to find the serializer of a type extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializerInfo {
    /// Worker-side type the serializer accepts.
    pub type_name: String,
    /// Location of the serializer code.
    pub path: String,
}

/// Known serializers and deserializers, keyed by extension id.
#[derive(Debug, Default)]
pub struct TypeExtensionRegistry {
    serializers: HashMap<String, SerializerInfo>,
    deserializers: HashMap<String, String>,
}

impl TypeExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a serializer.
    pub fn add_serializer(&mut self, id: &str, type_name: &str, path: &str) -> Result<()> {
        check_registration(id, path)?;
        tracing::debug!(id, type_name, path, "registered serializer");
        self.serializers.insert(
            id.to_string(),
            SerializerInfo {
                type_name: type_name.to_string(),
                path: path.to_string(),
            },
        );
        Ok(())
    }

    /// Register (or replace) a deserializer.
    pub fn add_deserializer(&mut self, id: &str, path: &str) -> Result<()> {
        check_registration(id, path)?;
        tracing::debug!(id, path, "registered deserializer");
        self.deserializers.insert(id.to_string(), path.to_string());
        Ok(())
    }

    pub fn serializer(&self, id: &str) -> Option<&SerializerInfo> {
        self.serializers.get(id)
    }

    pub fn deserializer(&self, id: &str) -> Option<&str> {
        self.deserializers.get(id).map(|p| p.as_str())
    }
}

fn check_registration(id: &str, path: &str) -> Result<()> {
    if id.is_empty() {
        return Err(KernelError::domain("Type extension id must not be empty"));
    }
    if path.is_empty() {
        return Err(KernelError::domain(format!(
            "No code location given for type extension {}",
            id
        )));
    }
    Ok(())
}
