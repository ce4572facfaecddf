//! `SQLite`-backed implementation of [`StateBackend`](crate::StateBackend).
//!
//! Uses a single `Mutex<Connection>` for thread safety. The mutex is also
//! what makes the checkpoint compare-and-advance atomic.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{NaiveDateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use tidewater_types::dead_letter::DeadLetterEntry;
use tidewater_types::error::ErrorCategory;
use tidewater_types::record::{Offset, Record, SourceId, Timestamp};
use tidewater_types::result::Attempt;
use tidewater_types::state::{CheckpointState, PipelineId, RunRecord, RunStats, RunStatus};

use crate::backend::{CheckpointStore, DeadLetterStore, RunStore, StoredDeadLetter};
use crate::error::{self, offset_from_sql, offset_to_sql, StateError};
use crate::schema::STATE_TABLES;

/// `SQLite` datetime format (UTC, no timezone suffix).
const SQLITE_DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// How long a writer waits on a locked database before reporting busy.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Apply WAL journaling with full fsync and a busy timeout.
pub(crate) fn configure_durable(conn: &Connection) -> error::Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)
        .map_err(|e| StateError::backend_context("configure: busy_timeout", e))?;
    // In-memory databases answer "memory"; either answer is fine.
    let _mode: String = conn
        .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
        .map_err(|e| StateError::backend_context("configure: journal_mode", e))?;
    conn.pragma_update(None, "synchronous", "FULL")
        .map_err(|e| StateError::backend_context("configure: synchronous", e))?;
    Ok(())
}

/// Open a file-backed connection, creating parent directories.
pub(crate) fn open_connection(path: &Path) -> error::Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path).map_err(StateError::backend)?;
    configure_durable(&conn)?;
    Ok(conn)
}

/// `SQLite`-backed checkpoint, dead-letter, and run storage.
///
/// Create with [`SqliteStateBackend::open`] for file-backed persistence
/// or [`SqliteStateBackend::in_memory`] for tests.
pub struct SqliteStateBackend {
    conn: Mutex<Connection>,
}

impl SqliteStateBackend {
    /// Open or create a `SQLite` state database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created,
    /// or [`StateError::Sqlite`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        let conn = open_connection(path)?;
        conn.execute_batch(STATE_TABLES)
            .map_err(|e| StateError::backend_context("open: create tables", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory `SQLite` backend (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Sqlite`] if the in-memory database can't
    /// be initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory().map_err(StateError::backend)?;
        conn.execute_batch(STATE_TABLES)
            .map_err(|e| StateError::backend_context("in_memory: create tables", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    /// Format current UTC time for `SQLite` storage.
    fn now_sqlite() -> String {
        Utc::now().format(SQLITE_DATETIME_FMT).to_string()
    }

    /// Convert a `SQLite` datetime string to ISO-8601.
    fn sqlite_to_iso8601(raw: &str) -> String {
        NaiveDateTime::parse_from_str(raw, SQLITE_DATETIME_FMT).map_or_else(
            |_| raw.to_string(),
            |ndt| format!("{}Z", ndt.format("%Y-%m-%dT%H:%M:%S")),
        )
    }

    fn stored_offset(
        conn: &Connection,
        pipeline: &PipelineId,
        source: &SourceId,
    ) -> error::Result<Option<Offset>> {
        let raw: Option<i64> = conn
            .query_row(
                "SELECT record_offset FROM checkpoints WHERE pipeline = ?1 AND source = ?2",
                rusqlite::params![pipeline.as_str(), source.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StateError::backend_context("read_checkpoint: select", e))?;
        raw.map(offset_from_sql).transpose()
    }
}

impl CheckpointStore for SqliteStateBackend {
    fn read_checkpoint(
        &self,
        pipeline: &PipelineId,
        source: &SourceId,
    ) -> error::Result<Option<Offset>> {
        let conn = self.lock_conn()?;
        Self::stored_offset(&conn, pipeline, source)
    }

    fn advance_checkpoint(
        &self,
        pipeline: &PipelineId,
        source: &SourceId,
        offset: Offset,
    ) -> error::Result<()> {
        let conn = self.lock_conn()?;
        let proposed = offset_to_sql(offset)?;
        let now = Self::now_sqlite();

        let updated = conn
            .execute(
                "UPDATE checkpoints SET record_offset = ?3, updated_at = ?4 \
                 WHERE pipeline = ?1 AND source = ?2 AND record_offset < ?3",
                rusqlite::params![pipeline.as_str(), source.as_str(), proposed, now],
            )
            .map_err(|e| StateError::backend_context("advance_checkpoint: update", e))?;
        if updated > 0 {
            return Ok(());
        }

        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO checkpoints (pipeline, source, record_offset, updated_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![pipeline.as_str(), source.as_str(), proposed, now],
            )
            .map_err(|e| StateError::backend_context("advance_checkpoint: insert", e))?;
        if inserted > 0 {
            return Ok(());
        }

        let stored = Self::stored_offset(&conn, pipeline, source)?.unwrap_or_default();
        Err(StateError::NonMonotonic {
            source_id: source.to_string(),
            stored: stored.get(),
            proposed: offset.get(),
        })
    }

    fn list_checkpoints(&self, pipeline: &PipelineId) -> error::Result<Vec<CheckpointState>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT source, record_offset, updated_at FROM checkpoints \
                 WHERE pipeline = ?1 ORDER BY source",
            )
            .map_err(|e| StateError::backend_context("list_checkpoints: prepare", e))?;
        let rows = stmt
            .query_map([pipeline.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(|e| StateError::backend_context("list_checkpoints: query", e))?;

        let mut out = Vec::new();
        for row in rows {
            let (source, offset, updated_at) =
                row.map_err(|e| StateError::backend_context("list_checkpoints: row", e))?;
            out.push(CheckpointState {
                source: SourceId::new(source),
                offset: offset_from_sql(offset)?,
                updated_at: Self::sqlite_to_iso8601(&updated_at),
            });
        }
        Ok(out)
    }
}

impl DeadLetterStore for SqliteStateBackend {
    fn append_dead_letter(
        &self,
        pipeline: &PipelineId,
        entry: &DeadLetterEntry,
    ) -> error::Result<bool> {
        let attempts_json = serde_json::to_string(&entry.attempts)?;
        let record = &entry.record;
        let conn = self.lock_conn()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO dead_letters \
                 (pipeline, source, record_offset, payload, ingested_at, \
                  error_message, error_category, attempts_json, failed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    pipeline.as_str(),
                    record.source().as_str(),
                    offset_to_sql(record.offset())?,
                    record.payload().as_bytes(),
                    record.ingested_at().as_str(),
                    entry.error_message,
                    entry.error_category.as_str(),
                    attempts_json,
                    entry.failed_at.as_str(),
                ],
            )
            .map_err(|e| StateError::backend_context("append_dead_letter: insert", e))?;
        Ok(inserted > 0)
    }

    fn dead_letter_page(
        &self,
        pipeline: &PipelineId,
        source: &SourceId,
        after_id: i64,
        limit: usize,
    ) -> error::Result<Vec<StoredDeadLetter>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, record_offset, payload, ingested_at, error_message, \
                        error_category, attempts_json, failed_at \
                 FROM dead_letters \
                 WHERE pipeline = ?1 AND source = ?2 AND id > ?3 \
                 ORDER BY id LIMIT ?4",
            )
            .map_err(|e| StateError::backend_context("dead_letter_page: prepare", e))?;
        let rows = stmt
            .query_map(
                rusqlite::params![pipeline.as_str(), source.as_str(), after_id, limit],
                |row| {
                    Ok(RawDeadLetter {
                        id: row.get(0)?,
                        offset: row.get(1)?,
                        payload: row.get(2)?,
                        ingested_at: row.get(3)?,
                        error_message: row.get(4)?,
                        error_category: row.get(5)?,
                        attempts_json: row.get(6)?,
                        failed_at: row.get(7)?,
                    })
                },
            )
            .map_err(|e| StateError::backend_context("dead_letter_page: query", e))?;

        let mut out = Vec::new();
        for row in rows {
            let raw = row.map_err(|e| StateError::backend_context("dead_letter_page: row", e))?;
            out.push(raw.into_stored(source)?);
        }
        Ok(out)
    }

    fn dead_letter_count(
        &self,
        pipeline: &PipelineId,
        source: Option<&SourceId>,
    ) -> error::Result<u64> {
        let conn = self.lock_conn()?;
        let count: i64 = match source {
            Some(source) => conn.query_row(
                "SELECT COUNT(*) FROM dead_letters WHERE pipeline = ?1 AND source = ?2",
                rusqlite::params![pipeline.as_str(), source.as_str()],
                |row| row.get(0),
            ),
            None => conn.query_row(
                "SELECT COUNT(*) FROM dead_letters WHERE pipeline = ?1",
                [pipeline.as_str()],
                |row| row.get(0),
            ),
        }
        .map_err(|e| StateError::backend_context("dead_letter_count: select", e))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

/// Column values of one `dead_letters` row.
struct RawDeadLetter {
    id: i64,
    offset: i64,
    payload: Vec<u8>,
    ingested_at: String,
    error_message: String,
    error_category: String,
    attempts_json: String,
    failed_at: String,
}

impl RawDeadLetter {
    fn into_stored(self, source: &SourceId) -> error::Result<StoredDeadLetter> {
        let error_category: ErrorCategory = self
            .error_category
            .parse()
            .map_err(|e| StateError::Corrupt(format!("dead letter {}: {e}", self.id)))?;
        let attempts: Vec<Attempt> = serde_json::from_str(&self.attempts_json)?;
        let record = Record::new(
            source.clone(),
            offset_from_sql(self.offset)?,
            self.payload,
            Timestamp::new(self.ingested_at),
        );
        Ok(StoredDeadLetter {
            id: self.id,
            entry: DeadLetterEntry {
                record,
                error_message: self.error_message,
                error_category,
                attempts,
                failed_at: Timestamp::new(self.failed_at),
            },
        })
    }
}

fn to_sql_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

impl RunStore for SqliteStateBackend {
    fn start_run(&self, pipeline: &PipelineId) -> error::Result<i64> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO pipeline_runs (pipeline, status) VALUES (?1, ?2)",
            rusqlite::params![pipeline.as_str(), RunStatus::Running.as_str()],
        )
        .map_err(|e| StateError::backend_context("start_run: insert", e))?;
        Ok(conn.last_insert_rowid())
    }

    fn complete_run(&self, run_id: i64, status: RunStatus, stats: &RunStats) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE pipeline_runs SET status = ?1, finished_at = datetime('now'), \
             records_read = ?2, records_written = ?3, records_dead_lettered = ?4, \
             duplicates_skipped = ?5, retries = ?6, error_message = ?7 \
             WHERE id = ?8",
            rusqlite::params![
                status.as_str(),
                to_sql_count(stats.records_read),
                to_sql_count(stats.records_written),
                to_sql_count(stats.records_dead_lettered),
                to_sql_count(stats.duplicates_skipped),
                to_sql_count(stats.retries),
                stats.error_message,
                run_id,
            ],
        )
        .map_err(|e| StateError::backend_context("complete_run: update", e))?;
        Ok(())
    }

    fn recent_runs(&self, pipeline: &PipelineId, limit: usize) -> error::Result<Vec<RunRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, status, started_at, finished_at, records_read, records_written, \
                        records_dead_lettered, duplicates_skipped, retries, error_message \
                 FROM pipeline_runs WHERE pipeline = ?1 ORDER BY id DESC LIMIT ?2",
            )
            .map_err(|e| StateError::backend_context("recent_runs: prepare", e))?;
        let rows = stmt
            .query_map(rusqlite::params![pipeline.as_str(), limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    RunStats {
                        records_read: from_sql_count(row.get(4)?),
                        records_written: from_sql_count(row.get(5)?),
                        records_dead_lettered: from_sql_count(row.get(6)?),
                        duplicates_skipped: from_sql_count(row.get(7)?),
                        retries: from_sql_count(row.get(8)?),
                        error_message: row.get(9)?,
                    },
                ))
            })
            .map_err(|e| StateError::backend_context("recent_runs: query", e))?;

        let mut out = Vec::new();
        for row in rows {
            let (id, status, started_at, finished_at, stats) =
                row.map_err(|e| StateError::backend_context("recent_runs: row", e))?;
            let status = RunStatus::parse(&status)
                .ok_or_else(|| StateError::Corrupt(format!("run {id}: unknown status '{status}'")))?;
            out.push(RunRecord {
                id,
                status,
                started_at: Self::sqlite_to_iso8601(&started_at),
                finished_at: finished_at.as_deref().map(Self::sqlite_to_iso8601),
                stats,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidewater_types::error::StageError;

    fn pid(name: &str) -> PipelineId {
        PipelineId::new(name)
    }

    fn src(name: &str) -> SourceId {
        SourceId::new(name)
    }

    fn entry(offset: u64, message: &str) -> DeadLetterEntry {
        let record = Record::new(
            src("orders"),
            Offset::new(offset),
            format!(r#"{{"id":{offset}}}"#).into_bytes(),
            Timestamp::new("2024-01-15T10:00:00Z"),
        );
        let reason = StageError::validation("RULE", message);
        let attempts = vec![Attempt::from_error(1, &reason, Timestamp::new("2024-01-15T10:00:01Z"))];
        DeadLetterEntry::new(record, &reason, attempts, Timestamp::new("2024-01-15T10:00:02Z"))
    }

    #[test]
    fn checkpoint_starts_empty() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        assert!(backend.read_checkpoint(&pid("p"), &src("orders")).unwrap().is_none());
    }

    #[test]
    fn checkpoint_advances_monotonically() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        backend.advance_checkpoint(&pid("p"), &src("orders"), Offset::new(10)).unwrap();
        backend.advance_checkpoint(&pid("p"), &src("orders"), Offset::new(25)).unwrap();
        assert_eq!(
            backend.read_checkpoint(&pid("p"), &src("orders")).unwrap(),
            Some(Offset::new(25))
        );
    }

    #[test]
    fn checkpoint_refuses_equal_or_lower() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        backend.advance_checkpoint(&pid("p"), &src("orders"), Offset::new(100)).unwrap();

        let err = backend
            .advance_checkpoint(&pid("p"), &src("orders"), Offset::new(100))
            .unwrap_err();
        assert!(matches!(
            err,
            StateError::NonMonotonic { stored: 100, proposed: 100, .. }
        ));

        let err = backend
            .advance_checkpoint(&pid("p"), &src("orders"), Offset::new(40))
            .unwrap_err();
        assert!(matches!(err, StateError::NonMonotonic { stored: 100, proposed: 40, .. }));
        assert_eq!(
            backend.read_checkpoint(&pid("p"), &src("orders")).unwrap(),
            Some(Offset::new(100))
        );
    }

    #[test]
    fn checkpoints_are_scoped_by_pipeline_and_source() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        backend.advance_checkpoint(&pid("a"), &src("orders"), Offset::new(5)).unwrap();
        backend.advance_checkpoint(&pid("a"), &src("customers"), Offset::new(9)).unwrap();
        backend.advance_checkpoint(&pid("b"), &src("orders"), Offset::new(1)).unwrap();

        let listed = backend.list_checkpoints(&pid("a")).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].source, src("customers"));
        assert_eq!(listed[0].offset, Offset::new(9));
        assert_eq!(listed[1].source, src("orders"));
        assert!(listed[1].updated_at.ends_with('Z'));
    }

    #[test]
    fn checkpoint_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");
        {
            let backend = SqliteStateBackend::open(&path).unwrap();
            backend.advance_checkpoint(&pid("p"), &src("orders"), Offset::new(42)).unwrap();
        }
        let backend = SqliteStateBackend::open(&path).unwrap();
        assert_eq!(
            backend.read_checkpoint(&pid("p"), &src("orders")).unwrap(),
            Some(Offset::new(42))
        );
    }

    #[test]
    fn dead_letter_append_is_idempotent() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        assert!(backend.append_dead_letter(&pid("p"), &entry(57, "first")).unwrap());
        assert!(!backend.append_dead_letter(&pid("p"), &entry(57, "second")).unwrap());
        assert_eq!(backend.dead_letter_count(&pid("p"), None).unwrap(), 1);

        let page = backend.dead_letter_page(&pid("p"), &src("orders"), 0, 10).unwrap();
        assert_eq!(page.len(), 1);
        assert!(page[0].entry.error_message.contains("first"));
    }

    #[test]
    fn dead_letter_roundtrips_entry() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let original = entry(3, "assert_range(amount) failed");
        backend.append_dead_letter(&pid("p"), &original).unwrap();

        let page = backend.dead_letter_page(&pid("p"), &src("orders"), 0, 10).unwrap();
        assert_eq!(page[0].entry, original);
    }

    #[test]
    fn dead_letter_pages_in_id_order() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        for offset in 1..=5 {
            backend.append_dead_letter(&pid("p"), &entry(offset, "bad")).unwrap();
        }

        let first = backend.dead_letter_page(&pid("p"), &src("orders"), 0, 2).unwrap();
        assert_eq!(first.len(), 2);
        let second = backend
            .dead_letter_page(&pid("p"), &src("orders"), first[1].id, 2)
            .unwrap();
        let third = backend
            .dead_letter_page(&pid("p"), &src("orders"), second[1].id, 2)
            .unwrap();
        let offsets: Vec<u64> = first
            .iter()
            .chain(&second)
            .chain(&third)
            .map(|s| s.entry.record.offset().get())
            .collect();
        assert_eq!(offsets, vec![1, 2, 3, 4, 5]);
        assert_eq!(
            backend.dead_letter_count(&pid("p"), Some(&src("orders"))).unwrap(),
            5
        );
        assert_eq!(
            backend.dead_letter_count(&pid("p"), Some(&src("customers"))).unwrap(),
            0
        );
    }

    #[test]
    fn run_lifecycle() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let run_id = backend.start_run(&pid("p")).unwrap();
        assert!(run_id > 0);

        let running = backend.recent_runs(&pid("p"), 5).unwrap();
        assert_eq!(running[0].status, RunStatus::Running);
        assert!(running[0].finished_at.is_none());

        backend
            .complete_run(
                run_id,
                RunStatus::Completed,
                &RunStats {
                    records_read: 100,
                    records_written: 99,
                    records_dead_lettered: 1,
                    duplicates_skipped: 0,
                    retries: 2,
                    error_message: None,
                },
            )
            .unwrap();

        let runs = backend.recent_runs(&pid("p"), 5).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Completed);
        assert_eq!(runs[0].stats.records_written, 99);
        assert_eq!(runs[0].stats.records_dead_lettered, 1);
        assert!(runs[0].finished_at.is_some());
    }

    #[test]
    fn recent_runs_newest_first() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let first = backend.start_run(&pid("p")).unwrap();
        let second = backend.start_run(&pid("p")).unwrap();
        backend
            .complete_run(
                first,
                RunStatus::Failed,
                &RunStats {
                    error_message: Some("warehouse unavailable".into()),
                    ..RunStats::default()
                },
            )
            .unwrap();

        let runs = backend.recent_runs(&pid("p"), 10).unwrap();
        assert_eq!(runs[0].id, second);
        assert_eq!(runs[1].id, first);
        assert_eq!(
            runs[1].stats.error_message.as_deref(),
            Some("warehouse unavailable")
        );
        assert_eq!(backend.recent_runs(&pid("p"), 1).unwrap().len(), 1);
    }
}
