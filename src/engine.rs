//! Read-only analytical query execution.
//!
//! Each call opens a fresh in-memory DuckDB connection, mounts the session's
//! dataset file as a single view named [`guard::VIRTUAL_TABLE`], and runs one
//! validated statement. Rows are materialized lazily up to the caller's cap;
//! whether more rows existed is reported through `truncated` rather than an
//! error. Execution happens on the blocking pool under a wall-clock deadline.
//!
//! Cell values are normalized to a small JSON-friendly set so tool results
//! and transport events never leak engine-specific types.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, Utc};
use duckdb::Connection;
use duckdb::types::{TimeUnit, Value};
use serde::{Deserialize, Serialize};

use crate::guard;
use crate::types::{DatasetFile, DatasetFormat};
use crate::{Error, Result};

/// A normalized cell: integer, float, boolean, string, ISO-8601 timestamp
/// string, or null. Serializes untagged, so rows become plain JSON arrays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl CellValue {
    /// Human-readable rendering used for sample values and context text.
    pub fn render(&self) -> String {
        match self {
            CellValue::Null => "null".to_string(),
            CellValue::Bool(b) => b.to_string(),
            CellValue::Int(i) => i.to_string(),
            CellValue::Float(f) => f.to_string(),
            CellValue::Text(s) => s.clone(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }
}

/// Result of one query: ordered columns, normalized rows, truncation flag.
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
    pub truncated: bool,
}

impl QueryOutput {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Rows as JSON arrays, for event payloads.
    pub fn rows_json(&self) -> Vec<serde_json::Value> {
        self.rows
            .iter()
            .map(|row| serde_json::Value::Array(row.iter().map(cell_to_json).collect()))
            .collect()
    }
}

fn cell_to_json(cell: &CellValue) -> serde_json::Value {
    match cell {
        CellValue::Null => serde_json::Value::Null,
        CellValue::Bool(b) => serde_json::Value::Bool(*b),
        CellValue::Int(i) => serde_json::json!(i),
        CellValue::Float(f) => serde_json::json!(f),
        CellValue::Text(s) => serde_json::Value::String(s.clone()),
    }
}

/// Executes validated SQL against session dataset files.
#[derive(Debug, Clone)]
pub struct QueryEngine {
    sql_timeout: Duration,
}

impl QueryEngine {
    pub fn new(sql_timeout: Duration) -> Self {
        QueryEngine { sql_timeout }
    }

    /// Validate and execute one statement, returning at most `row_cap` rows.
    ///
    /// Fails with `SqlSyntax`/`SqlForbidden` before touching the file,
    /// `SqlExecution` for engine-reported failures, and `SqlTimeout` when the
    /// wall-clock deadline passes. On timeout the blocking task is abandoned;
    /// its connection is dropped when the query eventually returns.
    pub async fn execute(
        &self,
        file: &DatasetFile,
        sql: &str,
        row_cap: usize,
    ) -> Result<QueryOutput> {
        guard::validate(sql)?;

        let file = file.clone();
        let sql = sql.to_string();
        let handle = tokio::task::spawn_blocking(move || run_query(&file, &sql, row_cap));

        match tokio::time::timeout(self.sql_timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(Error::other(format!("query task failed: {join}"))),
            Err(_) => Err(Error::SqlTimeout),
        }
    }
}

/// Mount `file` as the virtual table on `conn`.
pub(crate) fn create_dataset_view(conn: &Connection, file: &DatasetFile) -> Result<()> {
    let path = file.path_str().replace('\'', "''");
    let reader = match file.format {
        DatasetFormat::Csv => format!("read_csv_auto('{path}')"),
        DatasetFormat::Parquet => format!("read_parquet('{path}')"),
    };
    conn.execute_batch(&format!(
        "CREATE VIEW {} AS SELECT * FROM {reader};",
        guard::VIRTUAL_TABLE
    ))?;
    Ok(())
}

fn run_query(file: &DatasetFile, sql: &str, row_cap: usize) -> Result<QueryOutput> {
    let conn = Connection::open_in_memory()?;
    create_dataset_view(&conn, file)?;

    let mut stmt = conn.prepare(sql).map_err(classify_prepare_error)?;
    let mut rows = stmt
        .query([])
        .map_err(|e| Error::sql_execution(e.to_string()))?;

    let column_count = rows.as_ref().map_or(0, duckdb::Statement::column_count);
    let columns: Vec<String> = (0..column_count)
        .map(|i| {
            rows.as_ref()
                .and_then(|s| s.column_name(i).ok())
                .map(|name| name.to_string())
                .unwrap_or_else(|| format!("col_{i}"))
        })
        .collect();

    let mut out_rows = Vec::new();
    let mut truncated = false;
    while let Some(row) = rows.next().map_err(|e| Error::sql_execution(e.to_string()))? {
        if out_rows.len() == row_cap {
            truncated = true;
            break;
        }
        let mut cells = Vec::with_capacity(column_count);
        for i in 0..column_count {
            let value = row
                .get_ref(i)
                .map_err(|e| Error::sql_execution(e.to_string()))?
                .to_owned();
            cells.push(normalize(value));
        }
        out_rows.push(cells);
    }

    Ok(QueryOutput { columns, rows: out_rows, truncated })
}

/// Parser failures become syntax errors; everything else is execution.
fn classify_prepare_error(err: duckdb::Error) -> Error {
    let msg = err.to_string();
    let lowered = msg.to_ascii_lowercase();
    if lowered.contains("parser error") || lowered.contains("syntax error") {
        Error::sql_syntax(msg)
    } else {
        Error::sql_execution(msg)
    }
}

/// Collapse the engine's value space onto [`CellValue`].
pub(crate) fn normalize(value: Value) -> CellValue {
    match value {
        Value::Null => CellValue::Null,
        Value::Boolean(b) => CellValue::Bool(b),
        Value::TinyInt(v) => CellValue::Int(v as i64),
        Value::SmallInt(v) => CellValue::Int(v as i64),
        Value::Int(v) => CellValue::Int(v as i64),
        Value::BigInt(v) => CellValue::Int(v),
        Value::UTinyInt(v) => CellValue::Int(v as i64),
        Value::USmallInt(v) => CellValue::Int(v as i64),
        Value::UInt(v) => CellValue::Int(v as i64),
        Value::UBigInt(v) => i64::try_from(v)
            .map(CellValue::Int)
            .unwrap_or_else(|_| CellValue::Text(v.to_string())),
        Value::HugeInt(v) => i64::try_from(v)
            .map(CellValue::Int)
            .unwrap_or_else(|_| CellValue::Text(v.to_string())),
        Value::Float(v) => normalize_float(v as f64),
        Value::Double(v) => normalize_float(v),
        Value::Decimal(d) => d
            .to_string()
            .parse::<f64>()
            .map(normalize_float)
            .unwrap_or_else(|_| CellValue::Text(d.to_string())),
        Value::Text(s) => CellValue::Text(s),
        Value::Enum(s) => CellValue::Text(s),
        Value::Timestamp(unit, raw) => CellValue::Text(format_timestamp(unit, raw)),
        Value::Date32(days) => CellValue::Text(format_date(days)),
        Value::Time64(unit, raw) => CellValue::Text(format_time(unit, raw)),
        Value::Blob(bytes) => CellValue::Text(format!("<{} bytes>", bytes.len())),
        // Nested and exotic types render as their textual form.
        other => CellValue::Text(format!("{other:?}")),
    }
}

fn normalize_float(v: f64) -> CellValue {
    if v.is_finite() {
        CellValue::Float(v)
    } else {
        CellValue::Null
    }
}

fn format_timestamp(unit: TimeUnit, raw: i64) -> String {
    let micros = match unit {
        TimeUnit::Second => raw.saturating_mul(1_000_000),
        TimeUnit::Millisecond => raw.saturating_mul(1_000),
        TimeUnit::Microsecond => raw,
        TimeUnit::Nanosecond => raw / 1_000,
    };
    match DateTime::<Utc>::from_timestamp_micros(micros) {
        Some(dt) => dt.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
        None => format!("{raw}"),
    }
}

fn format_date(days: i32) -> String {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).expect("epoch");
    match epoch.checked_add_signed(TimeDelta::days(days as i64)) {
        Some(date) => date.format("%Y-%m-%d").to_string(),
        None => format!("{days}"),
    }
}

fn format_time(unit: TimeUnit, raw: i64) -> String {
    let micros = match unit {
        TimeUnit::Second => raw.saturating_mul(1_000_000),
        TimeUnit::Millisecond => raw.saturating_mul(1_000),
        TimeUnit::Microsecond => raw,
        TimeUnit::Nanosecond => raw / 1_000,
    };
    let secs = (micros / 1_000_000) as u32;
    let sub_micros = (micros % 1_000_000) as u32;
    match NaiveTime::from_num_seconds_from_midnight_opt(secs, sub_micros * 1_000) {
        Some(t) => t.format("%H:%M:%S%.6f").to_string(),
        None => format!("{raw}"),
    }
}
