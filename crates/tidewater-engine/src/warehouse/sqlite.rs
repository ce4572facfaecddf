//! `SQLite` warehouse. File-backed by default, in-memory for tests.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use tidewater_state::error::is_unavailable_sqlite;
use tidewater_types::record::{Offset, Record, SourceId};

use crate::config::types::ColumnSpec;
use crate::warehouse::{ensure_ordered, CommitResult, SchemaViolation, Warehouse, WarehouseError};

const WAREHOUSE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS warehouse_records (
    source        TEXT NOT NULL,
    record_offset INTEGER NOT NULL,
    payload       TEXT NOT NULL,
    ingested_at   TEXT NOT NULL,
    committed_at  TEXT NOT NULL,
    PRIMARY KEY (source, record_offset)
);
";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

impl From<rusqlite::Error> for WarehouseError {
    fn from(err: rusqlite::Error) -> Self {
        if is_unavailable_sqlite(&err) {
            Self::WriteUnavailable {
                reason: err.to_string(),
            }
        } else {
            Self::Storage(err.to_string())
        }
    }
}

pub struct SqliteWarehouse {
    conn: Mutex<Connection>,
    columns: Vec<ColumnSpec>,
}

impl SqliteWarehouse {
    /// Open or create a warehouse database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`WarehouseError`] if the file or table cannot be created.
    pub fn open(path: &Path, columns: Vec<ColumnSpec>) -> Result<Self, WarehouseError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    WarehouseError::Storage(format!(
                        "cannot create warehouse directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        Self::init(conn, columns)
    }

    /// In-memory warehouse (for tests and dry runs).
    ///
    /// # Errors
    ///
    /// Returns [`WarehouseError`] if the table cannot be created.
    pub fn in_memory(columns: Vec<ColumnSpec>) -> Result<Self, WarehouseError> {
        Self::init(Connection::open_in_memory()?, columns)
    }

    fn init(conn: Connection, columns: Vec<ColumnSpec>) -> Result<Self, WarehouseError> {
        conn.execute_batch(WAREHOUSE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
            columns,
        })
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>, WarehouseError> {
        self.conn
            .lock()
            .map_err(|_| WarehouseError::Storage("warehouse lock poisoned".into()))
    }

    /// Check one record against the configured columns.
    fn violation(&self, record: &Record) -> Option<SchemaViolation> {
        let violation = |message: String| SchemaViolation {
            source: record.source().clone(),
            offset: record.offset(),
            message,
        };
        if std::str::from_utf8(record.payload().as_bytes()).is_err() {
            return Some(violation("payload is not UTF-8".into()));
        }
        if self.columns.is_empty() {
            return None;
        }
        let body: Value = match record.payload().to_json() {
            Ok(body) => body,
            Err(e) => return Some(violation(format!("payload is not JSON: {e}"))),
        };
        let Some(object) = body.as_object() else {
            return Some(violation("payload is not a JSON object".into()));
        };

        let mut problems = Vec::new();
        for column in &self.columns {
            match object.get(&column.name) {
                None | Some(Value::Null) if column.required => {
                    problems.push(format!("column '{}' is required", column.name));
                }
                None | Some(Value::Null) => {}
                Some(value) if !column.column_type.matches(value) => problems.push(format!(
                    "column '{}' expects {}, got {value}",
                    column.name, column.column_type
                )),
                Some(_) => {}
            }
        }
        (!problems.is_empty()).then(|| violation(problems.join("; ")))
    }

    fn offset_param(offset: Offset) -> Result<i64, WarehouseError> {
        i64::try_from(offset.get())
            .map_err(|_| WarehouseError::Storage(format!("offset {offset} out of range")))
    }

    fn offset_column(raw: i64) -> Result<Offset, WarehouseError> {
        u64::try_from(raw)
            .map(Offset::new)
            .map_err(|_| WarehouseError::Storage(format!("negative offset {raw} in warehouse")))
    }
}

impl Warehouse for SqliteWarehouse {
    fn commit_batch(&self, records: &[Record]) -> Result<CommitResult, WarehouseError> {
        ensure_ordered(records)?;

        let violations: Vec<SchemaViolation> =
            records.iter().filter_map(|r| self.violation(r)).collect();
        if !violations.is_empty() {
            return Err(WarehouseError::SchemaViolation { violations });
        }

        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let committed_at = Utc::now().to_rfc3339();
        let mut result = CommitResult::default();
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO warehouse_records
                     (source, record_offset, payload, ingested_at, committed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for record in records {
                // Checked UTF-8 above.
                let payload = String::from_utf8_lossy(record.payload().as_bytes());
                let inserted = stmt.execute(rusqlite::params![
                    record.source().as_str(),
                    Self::offset_param(record.offset())?,
                    payload,
                    record.ingested_at().as_str(),
                    committed_at,
                ])?;
                if inserted == 0 {
                    result.duplicates += 1;
                } else {
                    result.applied += 1;
                }
                result
                    .max_applied
                    .entry(record.source().clone())
                    .and_modify(|max| *max = (*max).max(record.offset()))
                    .or_insert(record.offset());
            }
        }
        tx.commit()?;
        Ok(result)
    }

    fn committed_count(&self, source: &SourceId) -> Result<u64, WarehouseError> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM warehouse_records WHERE source = ?1",
            [source.as_str()],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    fn committed_offsets(&self, source: &SourceId) -> Result<Vec<Offset>, WarehouseError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT record_offset FROM warehouse_records WHERE source = ?1 ORDER BY record_offset",
        )?;
        let rows = stmt.query_map([source.as_str()], |row| row.get::<_, i64>(0))?;
        let offsets: Result<Vec<Offset>, WarehouseError> =
            rows.map(|raw| Self::offset_column(raw?)).collect();
        offsets
    }

    fn max_offset(&self, source: &SourceId) -> Result<Option<Offset>, WarehouseError> {
        let conn = self.lock_conn()?;
        let raw: Option<i64> = conn
            .query_row(
                "SELECT MAX(record_offset) FROM warehouse_records WHERE source = ?1",
                [source.as_str()],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        raw.map(Self::offset_column).transpose()
    }
}
