//! Dataset profiling.
//!
//! A profile is computed once when an upload is registered and cached with
//! the session; every later consumer (the system-prompt data summary, the
//! REST preview) reads the cached profile and never touches the file again.

use duckdb::Connection;
use serde::{Deserialize, Serialize};

use crate::engine::{self, CellValue};
use crate::types::DatasetFile;
use crate::{Error, Result};

/// Number of sample values surfaced per column.
const SAMPLE_VALUES_PER_COLUMN: usize = 5;

/// Number of profile rows exposed as the REST preview.
const PREVIEW_ROWS: usize = 10;

/// Coarse column type inferred from the engine's schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Float,
    Boolean,
    Temporal,
    Text,
}

impl ColumnType {
    pub fn as_str(self) -> &'static str {
        match self {
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Boolean => "boolean",
            ColumnType::Temporal => "temporal",
            ColumnType::Text => "text",
        }
    }

    /// Map a DuckDB type name onto the coarse set.
    fn from_engine_type(raw: &str) -> Self {
        let upper = raw.to_ascii_uppercase();
        if upper.contains("INT") {
            ColumnType::Integer
        } else if upper.contains("DOUBLE")
            || upper.contains("FLOAT")
            || upper.contains("DECIMAL")
            || upper.contains("REAL")
        {
            ColumnType::Float
        } else if upper.contains("BOOL") {
            ColumnType::Boolean
        } else if upper.contains("DATE") || upper.contains("TIME") {
            ColumnType::Temporal
        } else {
            ColumnType::Text
        }
    }
}

/// Per-column statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnProfile {
    pub name: String,
    pub column_type: ColumnType,
    pub null_count: u64,
    /// Up to five distinct non-null values drawn from the sampled rows.
    pub samples: Vec<String>,
}

/// The cached description of one dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetProfile {
    pub filename: String,
    pub row_count: u64,
    pub column_count: usize,
    pub columns: Vec<ColumnProfile>,
    /// Bounded row sample used for column samples and the REST preview.
    pub sample_rows: Vec<Vec<CellValue>>,
}

impl DatasetProfile {
    /// Null ratio for a column, in [0, 1].
    pub fn null_ratio(&self, column: &ColumnProfile) -> f64 {
        if self.row_count == 0 {
            0.0
        } else {
            column.null_count as f64 / self.row_count as f64
        }
    }

    /// Sample rows for the REST surface.
    pub fn preview(&self) -> &[Vec<CellValue>] {
        let n = self.sample_rows.len().min(PREVIEW_ROWS);
        &self.sample_rows[..n]
    }
}

/// Profile a dataset file. Blocking; callers on the async runtime should use
/// `spawn_blocking`.
pub fn build_profile(
    file: &DatasetFile,
    filename: &str,
    sample_limit: usize,
) -> Result<DatasetProfile> {
    let conn = Connection::open_in_memory()?;
    engine::create_dataset_view(&conn, file)?;

    let schema = describe_columns(&conn)?;
    if schema.is_empty() {
        return Err(Error::invalid_input("dataset has no columns"));
    }

    let row_count: i64 = conn.query_row("SELECT count(*) FROM data", [], |row| row.get(0))?;
    let row_count = row_count.max(0) as u64;
    let null_counts = count_nulls(&conn, &schema, row_count)?;
    let sample_rows = read_sample_rows(&conn, sample_limit, schema.len())?;

    let columns = schema
        .into_iter()
        .enumerate()
        .map(|(idx, (name, column_type))| ColumnProfile {
            samples: column_samples(&sample_rows, idx),
            name,
            column_type,
            null_count: null_counts[idx],
        })
        .collect::<Vec<_>>();

    Ok(DatasetProfile {
        filename: filename.to_string(),
        row_count,
        column_count: columns.len(),
        columns,
        sample_rows,
    })
}

fn describe_columns(conn: &Connection) -> Result<Vec<(String, ColumnType)>> {
    let mut stmt = conn.prepare("DESCRIBE SELECT * FROM data")?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let name: String = row.get(0)?;
        let raw_type: String = row.get(1)?;
        out.push((name, ColumnType::from_engine_type(&raw_type)));
    }
    Ok(out)
}

/// One aggregate pass: `count(*) - count(col)` per column.
fn count_nulls(
    conn: &Connection,
    schema: &[(String, ColumnType)],
    row_count: u64,
) -> Result<Vec<u64>> {
    if row_count == 0 {
        return Ok(vec![0; schema.len()]);
    }
    let exprs: Vec<String> = schema
        .iter()
        .map(|(name, _)| format!("count(\"{}\")", name.replace('"', "\"\"")))
        .collect();
    let sql = format!("SELECT {} FROM data", exprs.join(", "));
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    let row = rows
        .next()?
        .ok_or_else(|| Error::other("null-count query returned no row"))?;
    let mut counts = Vec::with_capacity(schema.len());
    for i in 0..schema.len() {
        let non_null: i64 = row.get(i)?;
        counts.push(row_count.saturating_sub(non_null.max(0) as u64));
    }
    Ok(counts)
}

fn read_sample_rows(
    conn: &Connection,
    sample_limit: usize,
    column_count: usize,
) -> Result<Vec<Vec<CellValue>>> {
    let mut stmt = conn.prepare(&format!("SELECT * FROM data LIMIT {sample_limit}"))?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut cells = Vec::with_capacity(column_count);
        for i in 0..column_count {
            cells.push(engine::normalize(row.get_ref(i)?.to_owned()));
        }
        out.push(cells);
    }
    Ok(out)
}

/// First distinct non-null values of one column within the sampled rows.
fn column_samples(sample_rows: &[Vec<CellValue>], column: usize) -> Vec<String> {
    let mut seen = Vec::new();
    for row in sample_rows {
        let Some(cell) = row.get(column) else { continue };
        if cell.is_null() {
            continue;
        }
        let rendered = cell.render();
        if !seen.contains(&rendered) {
            seen.push(rendered);
            if seen.len() == SAMPLE_VALUES_PER_COLUMN {
                break;
            }
        }
    }
    seen
}
