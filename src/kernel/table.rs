//! Tables exchanged with the host.
//!
//! A table is a list of named columns and rows of [`Cell`]s. Columns may
//! name a type extension; values of such columns need a serializer or
//! deserializer registered by the host before they can cross the wire.
//!
//! The byte form is MessagePack (see [`TableCodec`]). Its layout is
//! private to the two processes; the protocol only moves the bytes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};

/// A single table value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Cell {
    Missing,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    String(String),
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
}

impl Cell {
    /// Name of the cell's type as reported to the host.
    pub fn type_name(&self) -> &'static str {
        match self {
            Cell::Missing => "missing",
            Cell::Boolean(_) => "boolean",
            Cell::Integer(_) => "integer",
            Cell::Double(_) => "double",
            Cell::String(_) => "string",
            Cell::Bytes(_) => "bytes",
        }
    }

    /// Human readable form.
    pub fn representation(&self) -> String {
        match self {
            Cell::Missing => "?".to_string(),
            Cell::Boolean(v) => v.to_string(),
            Cell::Integer(v) => v.to_string(),
            Cell::Double(v) => v.to_string(),
            Cell::String(v) => v.clone(),
            Cell::Bytes(v) => format!("<{} bytes>", v.len()),
        }
    }

    /// The string inside, if this is a string cell.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Cell::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Cell::String(value.to_string())
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Cell::String(value)
    }
}

impl From<i64> for Cell {
    fn from(value: i64) -> Self {
        Cell::Integer(value)
    }
}

impl From<f64> for Cell {
    fn from(value: f64) -> Self {
        Cell::Double(value)
    }
}

impl From<bool> for Cell {
    fn from(value: bool) -> Self {
        Cell::Boolean(value)
    }
}

impl From<Vec<u8>> for Cell {
    fn from(value: Vec<u8>) -> Self {
        Cell::Bytes(value)
    }
}

/// Column description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    /// Type extension id, for values the host serializes itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
}

impl Column {
    /// Plain column.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extension: None,
        }
    }

    /// Column holding values of a type extension.
    pub fn with_extension(name: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extension: Some(extension.into()),
        }
    }
}

/// Rows of cells under a fixed set of columns.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<Column>,
    /// Index of the first row in the table this one was cut from.
    #[serde(default)]
    row_offset: u64,
    rows: Vec<Vec<Cell>>,
}

impl Table {
    /// Empty table with the given columns.
    pub fn new(columns: Vec<Column>) -> Self {
        Self {
            columns,
            row_offset: 0,
            rows: Vec::new(),
        }
    }

    /// Empty table with plain columns.
    pub fn with_columns(names: &[&str]) -> Self {
        Self::new(names.iter().map(|n| Column::new(*n)).collect())
    }

    /// Append a row.
    ///
    /// # Errors
    ///
    /// [`KernelError::Domain`] if the row width differs from the column count.
    pub fn push_row(&mut self, row: Vec<Cell>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(KernelError::domain(format!(
                "Row has {} cells, table has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Builder form of [`push_row`](Self::push_row).
    pub fn with_row(mut self, row: Vec<Cell>) -> Result<Self> {
        self.push_row(row)?;
        Ok(self)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn row_offset(&self) -> u64 {
        self.row_offset
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of the column with this name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Distinct type extension ids used by the columns, in column order.
    pub fn extension_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::new();
        for id in self.columns.iter().filter_map(|c| c.extension.as_deref()) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }

    /// Rows `start..=end`, clamped to the table.
    ///
    /// The slice remembers where it started so the host can place it.
    ///
    /// # Errors
    ///
    /// [`KernelError::Domain`] if `start` is negative.
    pub fn slice(&self, start: i32, end: i32) -> Result<Table> {
        let first = usize::try_from(start)
            .map_err(|_| KernelError::domain(format!("Invalid chunk start {}", start)))?;
        let first = first.min(self.rows.len());
        let last = match usize::try_from(end) {
            Ok(end) => end.saturating_add(1).min(self.rows.len()).max(first),
            Err(_) => first,
        };

        Ok(Table {
            columns: self.columns.clone(),
            row_offset: self.row_offset + first as u64,
            rows: self.rows[first..last].to_vec(),
        })
    }

    /// Append the rows of `other`.
    ///
    /// # Errors
    ///
    /// [`KernelError::Domain`] if the column names differ.
    pub fn append(&mut self, other: Table) -> Result<()> {
        let names = |t: &Table| t.columns.iter().map(|c| c.name.clone()).collect::<Vec<_>>();
        if names(self) != names(&other) {
            return Err(KernelError::domain(format!(
                "Cannot append table with columns {:?} to table with columns {:?}",
                names(&other),
                names(self)
            )));
        }
        self.rows.extend(other.rows);
        Ok(())
    }

    /// Check that every row matches the column count.
    pub fn validate(&self) -> Result<()> {
        match self.rows.iter().position(|r| r.len() != self.columns.len()) {
            Some(index) => Err(KernelError::domain(format!(
                "Row {} has {} cells, table has {} columns",
                index,
                self.rows[index].len(),
                self.columns.len()
            ))),
            None => Ok(()),
        }
    }

    /// One-row table with a column per flow variable.
    pub fn from_flow_variables(variables: &BTreeMap<String, Cell>) -> Table {
        Table {
            columns: variables.keys().map(Column::new).collect(),
            row_offset: 0,
            rows: vec![variables.values().cloned().collect()],
        }
    }

    /// Flow variables from the first row; an empty table holds none.
    pub fn to_flow_variables(&self) -> BTreeMap<String, Cell> {
        match self.rows.first() {
            Some(row) => self
                .columns
                .iter()
                .map(|c| c.name.clone())
                .zip(row.iter().cloned())
                .collect(),
            None => BTreeMap::new(),
        }
    }
}

/// MessagePack form of a [`Table`].
pub struct TableCodec;

impl TableCodec {
    /// Encode with field names so either side can evolve the layout.
    pub fn encode(table: &Table) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(table)?)
    }

    /// Decode and validate row widths.
    pub fn decode(bytes: &[u8]) -> Result<Table> {
        let table: Table = rmp_serde::from_slice(bytes)?;
        table.validate()?;
        Ok(table)
    }
}
