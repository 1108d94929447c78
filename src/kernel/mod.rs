//! Worker state - what the commands operate on.
//!
//! Command handlers never touch variables, tables or type extensions
//! directly. They go through [`WorkerState`], which is shared by every
//! handler task and therefore synchronises internally.
//!
//! [`MemoryKernel`] is the in-memory implementation. Running user code is
//! delegated to an optional [`ScriptEngine`].

mod extensions;
mod memory;
mod table;

use std::collections::BTreeMap;

pub use extensions::{SerializerInfo, TypeExtensionRegistry};
pub use memory::MemoryKernel;
pub use table::{Cell, Column, Table, TableCodec};

use crate::error::{KernelError, Result};

/// Captured output of one `execute`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub stdout: String,
    pub stderr: String,
}

/// An opaque object put by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectValue {
    pub type_name: String,
    pub bytes: Vec<u8>,
}

/// A database binding created by `putSql`.
///
/// The settings table must carry a `query` column; its first value is the
/// initial query. Scripts may replace [`SqlBinding::output_query`].
#[derive(Debug, Clone, PartialEq)]
pub struct SqlBinding {
    pub settings: Table,
    pub output_query: String,
}

impl SqlBinding {
    /// Column of the settings table holding the query.
    pub const QUERY_COLUMN: &'static str = "query";

    pub fn from_settings(settings: Table) -> Result<Self> {
        let query = settings
            .column_index(Self::QUERY_COLUMN)
            .and_then(|index| settings.rows().first().map(|row| &row[index]))
            .and_then(Cell::as_str)
            .ok_or_else(|| {
                KernelError::domain("SQL settings table has no query value in its first row")
            })?
            .to_string();

        Ok(Self {
            settings,
            output_query: query,
        })
    }
}

/// A named value in the worker's environment.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Table(Table),
    FlowVariables(BTreeMap<String, Cell>),
    Object(ObjectValue),
    Image(Vec<u8>),
    Sql(SqlBinding),
    Scalar(Cell),
}

impl Value {
    /// Type name as shown to the host.
    pub fn type_name(&self) -> &str {
        match self {
            Value::Table(_) => "table",
            Value::FlowVariables(_) => "flow_variables",
            Value::Object(object) => &object.type_name,
            Value::Image(_) => "image",
            Value::Sql(_) => "sql",
            Value::Scalar(cell) => cell.type_name(),
        }
    }

    /// Short human readable form.
    pub fn representation(&self) -> String {
        match self {
            Value::Table(table) => format!(
                "table with {} rows and {} columns",
                table.len(),
                table.columns().len()
            ),
            Value::FlowVariables(vars) => format!("{} flow variables", vars.len()),
            Value::Object(object) => format!("{} ({} bytes)", object.type_name, object.bytes.len()),
            Value::Image(bytes) => format!("image ({} bytes)", bytes.len()),
            Value::Sql(binding) => binding.output_query.clone(),
            Value::Scalar(cell) => cell.representation(),
        }
    }
}

/// One row of the `listVariables` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableInfo {
    pub name: String,
    pub type_name: String,
    pub value: String,
}

/// One row of the `autoComplete` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suggestion {
    pub name: String,
    pub type_name: String,
    pub doc: String,
}

/// Variables as seen by a script engine.
pub type Variables = BTreeMap<String, Value>;

/// Runs user code against the worker's variables.
pub trait ScriptEngine: Send + Sync {
    /// Run `source`. Errors are reported to the host on stderr.
    fn execute(&self, source: &str, variables: &mut Variables) -> Result<ExecutionOutput>;

    /// Completions at a position, if the engine offers its own.
    fn completions(&self, _source: &str, _line: i32, _column: i32) -> Option<Vec<Suggestion>> {
        None
    }
}

/// Operations the command handlers perform.
///
/// Methods are synchronous and must not block for long; handlers call them
/// from tokio tasks. Failures are [`KernelError::Domain`].
pub trait WorkerState: Send + Sync {
    fn execute(&self, source: &str) -> Result<ExecutionOutput>;

    fn put_variable(&self, name: &str, value: Value) -> Result<()>;

    /// # Errors
    ///
    /// [`KernelError::Domain`] if no variable has this name.
    fn get_variable(&self, name: &str) -> Result<Value>;

    fn list_variables(&self) -> Vec<VariableInfo>;

    /// Forget every variable.
    fn reset(&self);

    /// Append rows to a table variable, creating it if needed.
    fn append_to_table(&self, name: &str, rows: Table) -> Result<()>;

    fn decode_table(&self, bytes: &[u8]) -> Result<Table> {
        TableCodec::decode(bytes)
    }

    fn encode_table(&self, table: &Table) -> Result<Vec<u8>> {
        TableCodec::encode(table)
    }

    fn has_auto_complete(&self) -> bool;

    fn auto_complete(&self, source: &str, line: i32, column: i32) -> Vec<Suggestion>;

    fn add_serializer(&self, id: &str, type_name: &str, path: &str) -> Result<()>;

    fn add_deserializer(&self, id: &str, path: &str) -> Result<()>;

    fn serializer(&self, id: &str) -> Option<SerializerInfo>;

    fn deserializer(&self, id: &str) -> Option<String>;

    fn add_module_path(&self, path: &str) -> Result<()>;

    fn process_id(&self) -> u32 {
        std::process::id()
    }

    /// Release resources before the worker stops.
    fn cleanup(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_binding_reads_query() {
        let settings = Table::with_columns(&["url", "query"])
            .with_row(vec![Cell::from("jdbc:h2:mem"), Cell::from("SELECT * FROM t")])
            .unwrap();

        let binding = SqlBinding::from_settings(settings).unwrap();
        assert_eq!(binding.output_query, "SELECT * FROM t");
    }

    #[test]
    fn test_sql_binding_without_query() {
        let settings = Table::with_columns(&["url"])
            .with_row(vec![Cell::from("jdbc:h2:mem")])
            .unwrap();
        assert!(SqlBinding::from_settings(settings).is_err());

        let empty = Table::with_columns(&["query"]);
        assert!(SqlBinding::from_settings(empty).is_err());
    }

    #[test]
    fn test_value_type_names() {
        let object = Value::Object(ObjectValue {
            type_name: "Model".to_string(),
            bytes: vec![0; 3],
        });
        assert_eq!(object.type_name(), "Model");
        assert_eq!(object.representation(), "Model (3 bytes)");
        assert_eq!(Value::Scalar(Cell::Integer(4)).type_name(), "integer");
        assert_eq!(Value::Table(Table::default()).type_name(), "table");
    }
}
