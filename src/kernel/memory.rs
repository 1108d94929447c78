//! In-memory worker state.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use super::extensions::{SerializerInfo, TypeExtensionRegistry};
use super::{
    ExecutionOutput, ScriptEngine, Suggestion, Table, Value, VariableInfo, Variables, WorkerState,
};
use crate::error::{KernelError, Result};

/// Longest value representation listed back to the host.
const MAX_REPRESENTATION_LEN: usize = 200;

/// Worker state kept in process memory.
///
/// Variables, type extensions and module paths each sit behind their own
/// `RwLock`, so lookups from concurrent handlers do not serialise.
///
/// # Example
///
/// ```
/// use kernel_link::kernel::{Cell, MemoryKernel, Value, WorkerState};
///
/// let kernel = MemoryKernel::new();
/// kernel.put_variable("answer", Value::Scalar(Cell::Integer(42))).unwrap();
/// assert_eq!(kernel.list_variables()[0].value, "42");
/// ```
#[derive(Default)]
pub struct MemoryKernel {
    variables: RwLock<Variables>,
    extensions: RwLock<TypeExtensionRegistry>,
    module_paths: RwLock<Vec<String>>,
    engine: Option<Box<dyn ScriptEngine>>,
}

impl MemoryKernel {
    /// Kernel without a script engine; `execute` reports that on stderr.
    pub fn new() -> Self {
        Self::default()
    }

    /// Kernel running code through `engine`.
    pub fn with_engine(engine: impl ScriptEngine + 'static) -> Self {
        Self {
            engine: Some(Box::new(engine)),
            ..Self::default()
        }
    }

    /// Module search paths added so far, oldest first.
    pub fn module_paths(&self) -> Vec<String> {
        self.module_paths.read().clone()
    }

    fn variable_names_with_prefix(&self, prefix: &str) -> Vec<Suggestion> {
        self.variables
            .read()
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, value)| Suggestion {
                name: name.clone(),
                type_name: value.type_name().to_string(),
                doc: truncate(value.representation()),
            })
            .collect()
    }
}

impl WorkerState for MemoryKernel {
    fn execute(&self, source: &str) -> Result<ExecutionOutput> {
        let engine = match &self.engine {
            Some(engine) => engine,
            None => {
                return Ok(ExecutionOutput {
                    stdout: String::new(),
                    stderr: "No script engine attached to this kernel".to_string(),
                })
            }
        };

        let mut variables = self.variables.write();
        match engine.execute(source, &mut variables) {
            Ok(output) => Ok(output),
            Err(e) => Ok(ExecutionOutput {
                stdout: String::new(),
                stderr: e.to_string(),
            }),
        }
    }

    fn put_variable(&self, name: &str, value: Value) -> Result<()> {
        if name.is_empty() {
            return Err(KernelError::domain("Variable name must not be empty"));
        }
        self.variables.write().insert(name.to_string(), value);
        Ok(())
    }

    fn get_variable(&self, name: &str) -> Result<Value> {
        self.variables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| KernelError::domain(format!("Variable {} is not defined", name)))
    }

    fn list_variables(&self) -> Vec<VariableInfo> {
        self.variables
            .read()
            .iter()
            .map(|(name, value)| VariableInfo {
                name: name.clone(),
                type_name: value.type_name().to_string(),
                value: truncate(value.representation()),
            })
            .collect()
    }

    fn reset(&self) {
        self.variables.write().clear();
    }

    fn append_to_table(&self, name: &str, rows: Table) -> Result<()> {
        let mut variables = self.variables.write();
        match variables.get_mut(name) {
            Some(Value::Table(table)) => table.append(rows),
            Some(other) => Err(KernelError::domain(format!(
                "Expected a table, got: {}",
                other.type_name()
            ))),
            None => {
                variables.insert(name.to_string(), Value::Table(rows));
                Ok(())
            }
        }
    }

    fn has_auto_complete(&self) -> bool {
        true
    }

    fn auto_complete(&self, source: &str, line: i32, column: i32) -> Vec<Suggestion> {
        if let Some(suggestions) = self
            .engine
            .as_ref()
            .and_then(|engine| engine.completions(source, line, column))
        {
            return suggestions;
        }

        match word_before(source, line, column) {
            Some(prefix) => self.variable_names_with_prefix(prefix),
            None => Vec::new(),
        }
    }

    fn add_serializer(&self, id: &str, type_name: &str, path: &str) -> Result<()> {
        self.extensions.write().add_serializer(id, type_name, path)
    }

    fn add_deserializer(&self, id: &str, path: &str) -> Result<()> {
        self.extensions.write().add_deserializer(id, path)
    }

    fn serializer(&self, id: &str) -> Option<SerializerInfo> {
        self.extensions.read().serializer(id).cloned()
    }

    fn deserializer(&self, id: &str) -> Option<String> {
        self.extensions.read().deserializer(id).map(str::to_string)
    }

    fn add_module_path(&self, path: &str) -> Result<()> {
        if path.is_empty() {
            return Err(KernelError::domain("Module path must not be empty"));
        }
        let mut paths = self.module_paths.write();
        if !paths.iter().any(|p| p == path) {
            paths.push(path.to_string());
        }
        Ok(())
    }

    fn cleanup(&self) {
        // Database bindings hold connections on the host side
        let mut variables = self.variables.write();
        let before = variables.len();
        variables.retain(|_, value| !matches!(value, Value::Sql(_)));
        tracing::debug!(
            released = before - variables.len(),
            "released sql bindings"
        );
    }
}

/// Identifier characters directly before `column` on 1-based `line`.
fn word_before(source: &str, line: i32, column: i32) -> Option<&str> {
    let line_index = usize::try_from(line).ok()?.checked_sub(1)?;
    let text = source.lines().nth(line_index)?;

    let column = usize::try_from(column).ok()?;
    let end = text
        .char_indices()
        .nth(column)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let head = &text[..end];

    let start = head
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_alphanumeric() || *c == '_')
        .last()
        .map(|(i, _)| i)
        .unwrap_or(end);
    Some(&head[start..])
}

fn truncate(mut text: String) -> String {
    if text.chars().count() > MAX_REPRESENTATION_LEN {
        text = text.chars().take(MAX_REPRESENTATION_LEN).collect();
        text.push_str("...");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{Cell, Column, SqlBinding};

    struct Upper;

    impl ScriptEngine for Upper {
        fn execute(&self, source: &str, variables: &mut Variables) -> Result<ExecutionOutput> {
            if source == "fail" {
                return Err(KernelError::domain("boom"));
            }
            variables.insert("last".to_string(), Value::Scalar(Cell::from(source)));
            Ok(ExecutionOutput {
                stdout: source.to_uppercase(),
                stderr: String::new(),
            })
        }
    }

    fn table(n: i64) -> Table {
        let mut table = Table::with_columns(&["n"]);
        for i in 0..n {
            table.push_row(vec![Cell::Integer(i)]).unwrap();
        }
        table
    }

    #[test]
    fn test_execute_without_engine() {
        let kernel = MemoryKernel::new();
        let output = kernel.execute("x = 1").unwrap();
        assert!(output.stdout.is_empty());
        assert!(output.stderr.contains("No script engine"));
    }

    #[test]
    fn test_execute_with_engine() {
        let kernel = MemoryKernel::with_engine(Upper);
        let output = kernel.execute("hello").unwrap();
        assert_eq!(output.stdout, "HELLO");
        assert_eq!(
            kernel.get_variable("last").unwrap(),
            Value::Scalar(Cell::from("hello"))
        );

        let output = kernel.execute("fail").unwrap();
        assert_eq!(output.stderr, "boom");
    }

    #[test]
    fn test_variables() {
        let kernel = MemoryKernel::new();
        kernel.put_variable("t", Value::Table(table(3))).unwrap();
        kernel.put_variable("img", Value::Image(vec![1, 2])).unwrap();

        assert!(matches!(kernel.get_variable("t"), Ok(Value::Table(_))));
        assert!(matches!(kernel.get_variable("nope"), Err(KernelError::Domain(_))));
        assert!(kernel.put_variable("", Value::Image(vec![])).is_err());

        let names: Vec<_> = kernel.list_variables().into_iter().map(|v| v.name).collect();
        assert_eq!(names, vec!["img", "t"]);

        kernel.reset();
        assert!(kernel.list_variables().is_empty());
    }

    #[test]
    fn test_append_to_table() {
        let kernel = MemoryKernel::new();
        kernel.append_to_table("t", table(2)).unwrap();
        kernel.append_to_table("t", table(3)).unwrap();

        match kernel.get_variable("t").unwrap() {
            Value::Table(t) => assert_eq!(t.len(), 5),
            other => panic!("unexpected {:?}", other),
        }

        kernel.put_variable("s", Value::Scalar(Cell::Missing)).unwrap();
        assert!(kernel.append_to_table("s", table(1)).is_err());
    }

    #[test]
    fn test_auto_complete_prefix() {
        let kernel = MemoryKernel::new();
        kernel.put_variable("input_table", Value::Table(table(1))).unwrap();
        kernel.put_variable("input_count", Value::Scalar(Cell::Integer(1))).unwrap();
        kernel.put_variable("output", Value::Scalar(Cell::Integer(2))).unwrap();

        let source = "x = 1\nprint(inp";
        let names: Vec<_> = kernel
            .auto_complete(source, 2, 9)
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["input_count", "input_table"]);

        assert!(kernel.auto_complete(source, 7, 0).is_empty());
        assert!(kernel.auto_complete(source, 0, 0).is_empty());
    }

    #[test]
    fn test_word_before() {
        assert_eq!(word_before("abc def", 1, 7), Some("def"));
        assert_eq!(word_before("abc def", 1, 2), Some("ab"));
        assert_eq!(word_before("abc ", 1, 4), Some(""));
        assert_eq!(word_before("abc", 2, 0), None);
    }

    #[test]
    fn test_extensions_and_module_paths() {
        let kernel = MemoryKernel::new();
        kernel.add_serializer("ext", "Date", "/s").unwrap();
        kernel.add_deserializer("ext", "/d").unwrap();
        assert_eq!(kernel.serializer("ext").unwrap().path, "/s");
        assert_eq!(kernel.deserializer("ext").as_deref(), Some("/d"));

        kernel.add_module_path("/opt/mods").unwrap();
        kernel.add_module_path("/opt/mods").unwrap();
        assert_eq!(kernel.module_paths(), vec!["/opt/mods"]);
        assert!(kernel.add_module_path("").is_err());
    }

    #[test]
    fn test_cleanup_releases_sql_bindings() {
        let kernel = MemoryKernel::new();
        let settings = Table::new(vec![Column::new("query")])
            .with_row(vec![Cell::from("SELECT 1")])
            .unwrap();
        kernel
            .put_variable("db", Value::Sql(SqlBinding::from_settings(settings).unwrap()))
            .unwrap();
        kernel.put_variable("t", Value::Table(table(1))).unwrap();

        kernel.cleanup();

        assert!(kernel.get_variable("db").is_err());
        assert!(kernel.get_variable("t").is_ok());
    }

    #[test]
    fn test_long_representation_truncated() {
        let kernel = MemoryKernel::new();
        kernel
            .put_variable("s", Value::Scalar(Cell::from("x".repeat(500))))
            .unwrap();
        let listed = &kernel.list_variables()[0];
        assert_eq!(listed.value.len(), MAX_REPRESENTATION_LEN + 3);
    }
}
