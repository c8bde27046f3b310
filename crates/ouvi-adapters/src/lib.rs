//! Source and sink contracts plus the fixture-first implementations used for
//! local runs and tests.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use ouvi_core::SheetTable;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "ouvi-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink has no column named {0:?}")]
    UnknownColumn(String),
    #[error("append rows must have {expected} cells, got {got}")]
    RowWidth { expected: usize, got: usize },
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Upstream system of record. One call returns the full current export;
/// there is no incremental protocol.
pub trait RecordSource {
    fn source_id(&self) -> &'static str;
    fn list_latest(&mut self) -> Result<SheetTable, SourceError>;
}

/// Result of one column-patch call against a sink.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchOutcome {
    pub matched: usize,
    pub missing_keys: Vec<String>,
}

/// Downstream curated table. Appends are row-batches; updates are
/// column-patches addressed by key.
pub trait RecordSink {
    fn sink_id(&self) -> &'static str;

    fn read_all(&mut self) -> Result<SheetTable, SinkError>;

    /// Append rows under the given header. The first append on an empty
    /// sink establishes the header; later appends must match its width.
    fn append_rows(&mut self, columns: &[String], rows: &[Vec<String>]) -> Result<(), SinkError>;

    /// Set `column` to `value` on every row whose `key_column` cell matches
    /// one of `keys`. Unmatched keys are reported, never invented.
    fn patch_column(
        &mut self,
        key_column: &str,
        keys: &[String],
        column: &str,
        value: &str,
    ) -> Result<PatchOutcome, SinkError>;

    /// Non-blank values of `key_column`, in row order. Empty for an empty
    /// sink.
    fn list_keys(&mut self, key_column: &str) -> Result<Vec<String>, SinkError> {
        let table = self.read_all()?;
        if table.is_empty() {
            return Ok(Vec::new());
        }
        let key_index = table
            .column_index(key_column)
            .ok_or_else(|| SinkError::UnknownColumn(key_column.to_string()))?;
        Ok(table
            .rows
            .iter()
            .filter_map(|row| row.get(key_index))
            .filter(|key| !key.trim().is_empty())
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// JSON document shared by the fixture source and the file sink
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TableDocument {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl TableDocument {
    fn from_table(table: &SheetTable) -> Self {
        Self {
            columns: table.columns.clone(),
            rows: table.rows.clone(),
        }
    }

    fn into_table(self) -> SheetTable {
        SheetTable {
            columns: self.columns,
            rows: self.rows,
        }
    }
}

fn read_table_document(path: &Path) -> anyhow::Result<TableDocument> {
    let text =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn write_table_document(path: &Path, document: &TableDocument) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating sink directory {}", parent.display()))?;
    }
    let text = serde_json::to_string_pretty(document).context("serializing sink table")?;
    fs::write(path, text).with_context(|| format!("writing {}", path.display()))
}

// ---------------------------------------------------------------------------
// Fixture source
// ---------------------------------------------------------------------------

/// Reads the upstream export from a captured JSON fixture. Column names are
/// normalized on load so downstream code only ever sees canonical headers.
#[derive(Debug, Clone)]
pub struct JsonFixtureSource {
    path: PathBuf,
}

impl JsonFixtureSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RecordSource for JsonFixtureSource {
    fn source_id(&self) -> &'static str {
        "json-fixture"
    }

    fn list_latest(&mut self) -> Result<SheetTable, SourceError> {
        let document = read_table_document(&self.path)?;
        let table = document.into_table().with_normalized_columns();
        debug!(
            source = self.source_id(),
            rows = table.rows.len(),
            "loaded upstream export"
        );
        Ok(table)
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

fn apply_patch(
    table: &mut SheetTable,
    key_column: &str,
    keys: &[String],
    column: &str,
    value: &str,
) -> Result<PatchOutcome, SinkError> {
    let key_index = table
        .column_index(key_column)
        .ok_or_else(|| SinkError::UnknownColumn(key_column.to_string()))?;
    let target_index = table
        .column_index(column)
        .ok_or_else(|| SinkError::UnknownColumn(column.to_string()))?;

    let mut outcome = PatchOutcome::default();
    for key in keys {
        let mut matched_any = false;
        for row in &mut table.rows {
            if row.get(key_index).map(String::as_str) == Some(key.as_str()) {
                if let Some(cell) = row.get_mut(target_index) {
                    *cell = value.to_string();
                    matched_any = true;
                }
            }
        }
        if matched_any {
            outcome.matched += 1;
        } else {
            outcome.missing_keys.push(key.clone());
        }
    }
    Ok(outcome)
}

fn apply_append(
    table: &mut SheetTable,
    columns: &[String],
    rows: &[Vec<String>],
) -> Result<(), SinkError> {
    if table.columns.is_empty() {
        table.columns = columns.to_vec();
    }
    let expected = table.columns.len();
    for row in rows {
        if row.len() != expected {
            return Err(SinkError::RowWidth {
                expected,
                got: row.len(),
            });
        }
    }
    table.rows.extend(rows.iter().cloned());
    Ok(())
}

/// Persists the curated table as a JSON document on disk. Every mutation
/// rewrites the whole document; readers see either the old or new table.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> Result<SheetTable, SinkError> {
        if !self.path.exists() {
            return Ok(SheetTable::default());
        }
        Ok(read_table_document(&self.path)?.into_table())
    }

    fn persist(&self, table: &SheetTable) -> Result<(), SinkError> {
        write_table_document(&self.path, &TableDocument::from_table(table))?;
        Ok(())
    }
}

impl RecordSink for JsonFileSink {
    fn sink_id(&self) -> &'static str {
        "json-file"
    }

    fn read_all(&mut self) -> Result<SheetTable, SinkError> {
        self.load()
    }

    fn append_rows(&mut self, columns: &[String], rows: &[Vec<String>]) -> Result<(), SinkError> {
        let mut table = self.load()?;
        apply_append(&mut table, columns, rows)?;
        self.persist(&table)
    }

    fn patch_column(
        &mut self,
        key_column: &str,
        keys: &[String],
        column: &str,
        value: &str,
    ) -> Result<PatchOutcome, SinkError> {
        let mut table = self.load()?;
        let outcome = apply_patch(&mut table, key_column, keys, column, value)?;
        if outcome.matched > 0 {
            self.persist(&table)?;
        }
        Ok(outcome)
    }
}

/// In-memory sink for pipeline tests. Also counts calls so batching
/// behavior is observable.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    table: SheetTable,
    pub append_calls: usize,
    pub patch_calls: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(table: SheetTable) -> Self {
        Self {
            table,
            append_calls: 0,
            patch_calls: 0,
        }
    }

    pub fn table(&self) -> &SheetTable {
        &self.table
    }
}

impl RecordSink for MemorySink {
    fn sink_id(&self) -> &'static str {
        "memory"
    }

    fn read_all(&mut self) -> Result<SheetTable, SinkError> {
        Ok(self.table.clone())
    }

    fn append_rows(&mut self, columns: &[String], rows: &[Vec<String>]) -> Result<(), SinkError> {
        self.append_calls += 1;
        apply_append(&mut self.table, columns, rows)
    }

    fn patch_column(
        &mut self,
        key_column: &str,
        keys: &[String],
        column: &str,
        value: &str,
    ) -> Result<PatchOutcome, SinkError> {
        self.patch_calls += 1;
        apply_patch(&mut self.table, key_column, keys, column, value)
    }
}

/// In-memory source for pipeline tests.
#[derive(Debug, Clone)]
pub struct MemorySource {
    table: SheetTable,
}

impl MemorySource {
    pub fn new(table: SheetTable) -> Self {
        Self { table }
    }
}

impl RecordSource for MemorySource {
    fn source_id(&self) -> &'static str {
        "memory"
    }

    fn list_latest(&mut self) -> Result<SheetTable, SourceError> {
        Ok(self.table.clone().with_normalized_columns())
    }
}
