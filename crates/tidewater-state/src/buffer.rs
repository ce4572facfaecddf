//! `SQLite`-backed ingestion buffer.
//!
//! Rows are keyed by an autoincrement sequence so fetch order equals append
//! order. A per-source high-water table survives acknowledgement and is
//! what turns connector re-emission after a restart into `Duplicate`.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension};
use tidewater_types::record::{Offset, Record, SourceId, Timestamp};

use crate::backend::{AppendOutcome, BufferDepth, BufferLimits, BufferStore, BufferedRecord};
use crate::error::{self, offset_from_sql, offset_to_sql, StateError};
use crate::schema::BUFFER_TABLES;
use crate::sqlite::{configure_durable, open_connection};

struct Inner {
    conn: Connection,
    depth: BufferDepth,
}

/// Durable buffer with record and byte limits.
///
/// Depth counters are kept in memory next to the connection and
/// re-derived from the table on open.
pub struct SqliteBufferStore {
    inner: Mutex<Inner>,
    limits: BufferLimits,
}

impl SqliteBufferStore {
    /// Open or create a buffer database at `path`.
    ///
    /// `lanes` re-routes pending rows so a changed lane count still keeps
    /// each source on exactly one lane.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if the file can't be opened or initialized.
    pub fn open(path: &Path, limits: BufferLimits, lanes: u32) -> error::Result<Self> {
        let conn = open_connection(path)?;
        Self::init(conn, limits, lanes)
    }

    /// Non-durable buffer (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if the in-memory database can't be initialized.
    pub fn in_memory(limits: BufferLimits, lanes: u32) -> error::Result<Self> {
        let conn = Connection::open_in_memory().map_err(StateError::backend)?;
        configure_durable(&conn)?;
        Self::init(conn, limits, lanes)
    }

    fn init(conn: Connection, limits: BufferLimits, lanes: u32) -> error::Result<Self> {
        conn.execute_batch(BUFFER_TABLES)
            .map_err(|e| StateError::backend_context("buffer: create tables", e))?;
        Self::reassign_lanes(&conn, lanes)?;
        let depth = Self::measure(&conn)?;
        Ok(Self {
            inner: Mutex::new(Inner { conn, depth }),
            limits,
        })
    }

    fn reassign_lanes(conn: &Connection, lanes: u32) -> error::Result<()> {
        let sources: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT DISTINCT source FROM buffer_records")
                .map_err(|e| StateError::backend_context("reassign_lanes: prepare", e))?;
            let rows = stmt
                .query_map([], |row| row.get(0))
                .map_err(|e| StateError::backend_context("reassign_lanes: query", e))?;
            rows.collect::<Result<_, _>>()
                .map_err(|e| StateError::backend_context("reassign_lanes: row", e))?
        };
        for source in sources {
            let lane = SourceId::new(source.as_str()).lane(lanes);
            conn.execute(
                "UPDATE buffer_records SET lane = ?1 WHERE source = ?2 AND lane != ?1",
                rusqlite::params![lane, source],
            )
            .map_err(|e| StateError::backend_context("reassign_lanes: update", e))?;
        }
        Ok(())
    }

    fn measure(conn: &Connection) -> error::Result<BufferDepth> {
        let (records, bytes): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(length(payload)), 0) FROM buffer_records",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e| StateError::backend_context("buffer: measure", e))?;
        Ok(BufferDepth {
            records: u64::try_from(records).unwrap_or(0),
            bytes: u64::try_from(bytes).unwrap_or(0),
        })
    }

    fn lock(&self) -> error::Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| StateError::LockPoisoned)
    }

    fn high_water_in(conn: &Connection, source: &SourceId) -> error::Result<Option<Offset>> {
        let raw: Option<i64> = conn
            .query_row(
                "SELECT record_offset FROM buffer_high_water WHERE source = ?1",
                [source.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StateError::backend_context("high_water: select", e))?;
        raw.map(offset_from_sql).transpose()
    }

    /// Configured limits.
    #[must_use]
    pub fn limits(&self) -> BufferLimits {
        self.limits
    }
}

impl BufferStore for SqliteBufferStore {
    fn append(&self, lane: u32, record: &Record) -> error::Result<AppendOutcome> {
        let mut guard = self.lock()?;

        if let Some(high_water) = Self::high_water_in(&guard.conn, record.source())? {
            if record.offset() <= high_water {
                return Ok(AppendOutcome::Duplicate { high_water });
            }
        }

        let size = record.payload().len() as u64;
        if size > self.limits.max_bytes {
            return Err(StateError::RecordTooLarge {
                bytes: size,
                max_bytes: self.limits.max_bytes,
            });
        }
        let depth = guard.depth;
        if depth.records >= self.limits.max_records
            || depth.bytes.saturating_add(size) > self.limits.max_bytes
        {
            return Err(StateError::CapacityExceeded {
                records: depth.records,
                bytes: depth.bytes,
                max_records: self.limits.max_records,
                max_bytes: self.limits.max_bytes,
            });
        }

        let offset = offset_to_sql(record.offset())?;
        let seq = {
            let tx = guard
                .conn
                .unchecked_transaction()
                .map_err(|e| StateError::backend_context("append: begin tx", e))?;
            tx.execute(
                "INSERT INTO buffer_records (lane, source, record_offset, payload, ingested_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    lane,
                    record.source().as_str(),
                    offset,
                    record.payload().as_bytes(),
                    record.ingested_at().as_str(),
                ],
            )
            .map_err(|e| StateError::backend_context("append: insert", e))?;
            let seq = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO buffer_high_water (source, record_offset) VALUES (?1, ?2) \
                 ON CONFLICT(source) DO UPDATE SET record_offset = ?2",
                rusqlite::params![record.source().as_str(), offset],
            )
            .map_err(|e| StateError::backend_context("append: high water", e))?;
            tx.commit()
                .map_err(|e| StateError::backend_context("append: commit", e))?;
            seq
        };

        guard.depth.records += 1;
        guard.depth.bytes += size;
        Ok(AppendOutcome::Appended { seq })
    }

    fn fetch(&self, lane: u32, after_seq: i64, limit: usize) -> error::Result<Vec<BufferedRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let guard = self.lock()?;
        let mut stmt = guard
            .conn
            .prepare_cached(
                "SELECT seq, source, record_offset, payload, ingested_at FROM buffer_records \
                 WHERE lane = ?1 AND seq > ?2 ORDER BY seq LIMIT ?3",
            )
            .map_err(|e| StateError::backend_context("fetch: prepare", e))?;
        let rows = stmt
            .query_map(rusqlite::params![lane, after_seq, limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(|e| StateError::backend_context("fetch: query", e))?;

        let mut out = Vec::new();
        for row in rows {
            let (seq, source, offset, payload, ingested_at) =
                row.map_err(|e| StateError::backend_context("fetch: row", e))?;
            out.push(BufferedRecord {
                seq,
                record: Record::new(
                    SourceId::new(source),
                    offset_from_sql(offset)?,
                    payload,
                    Timestamp::new(ingested_at),
                ),
            });
        }
        Ok(out)
    }

    fn acknowledge(&self, source: &SourceId, through: Offset) -> error::Result<u64> {
        let through = offset_to_sql(through)?;
        let mut guard = self.lock()?;
        let (count, bytes): (i64, i64) = guard
            .conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(length(payload)), 0) FROM buffer_records \
                 WHERE source = ?1 AND record_offset <= ?2",
                rusqlite::params![source.as_str(), through],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e| StateError::backend_context("acknowledge: measure", e))?;
        if count == 0 {
            return Ok(0);
        }
        guard
            .conn
            .execute(
                "DELETE FROM buffer_records WHERE source = ?1 AND record_offset <= ?2",
                rusqlite::params![source.as_str(), through],
            )
            .map_err(|e| StateError::backend_context("acknowledge: delete", e))?;

        let count = u64::try_from(count).unwrap_or(0);
        let bytes = u64::try_from(bytes).unwrap_or(0);
        guard.depth.records = guard.depth.records.saturating_sub(count);
        guard.depth.bytes = guard.depth.bytes.saturating_sub(bytes);
        Ok(count)
    }

    fn high_water(&self, source: &SourceId) -> error::Result<Option<Offset>> {
        let guard = self.lock()?;
        Self::high_water_in(&guard.conn, source)
    }

    fn pending_sources(&self) -> error::Result<Vec<SourceId>> {
        let guard = self.lock()?;
        let mut stmt = guard
            .conn
            .prepare("SELECT DISTINCT source FROM buffer_records ORDER BY source")
            .map_err(|e| StateError::backend_context("pending_sources: prepare", e))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| StateError::backend_context("pending_sources: query", e))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(SourceId::new(
                row.map_err(|e| StateError::backend_context("pending_sources: row", e))?,
            ));
        }
        Ok(out)
    }

    fn depth(&self) -> error::Result<BufferDepth> {
        Ok(self.lock()?.depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(source: &str, offset: u64, body: &str) -> Record {
        Record::new(
            SourceId::new(source),
            Offset::new(offset),
            body,
            Timestamp::new("2024-01-15T10:00:00Z"),
        )
    }

    fn store(max_records: u64, max_bytes: u64) -> SqliteBufferStore {
        SqliteBufferStore::in_memory(
            BufferLimits {
                max_records,
                max_bytes,
            },
            1,
        )
        .unwrap()
    }

    #[test]
    fn append_then_fetch_in_order() {
        let buffer = store(100, 1 << 20);
        for offset in 1..=3 {
            buffer.append(0, &record("orders", offset, "{}")).unwrap();
        }
        let fetched = buffer.fetch(0, 0, 10).unwrap();
        let offsets: Vec<u64> = fetched.iter().map(|b| b.record.offset().get()).collect();
        assert_eq!(offsets, vec![1, 2, 3]);
        assert!(fetched.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[test]
    fn fetch_respects_cursor_and_limit() {
        let buffer = store(100, 1 << 20);
        for offset in 1..=5 {
            buffer.append(0, &record("orders", offset, "{}")).unwrap();
        }
        let first = buffer.fetch(0, 0, 2).unwrap();
        let rest = buffer.fetch(0, first[1].seq, 10).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(rest.len(), 3);
        assert_eq!(rest[0].record.offset(), Offset::new(3));
    }

    #[test]
    fn lanes_are_isolated() {
        let buffer = store(100, 1 << 20);
        buffer.append(0, &record("orders", 1, "{}")).unwrap();
        buffer.append(1, &record("customers", 1, "{}")).unwrap();
        assert_eq!(buffer.fetch(0, 0, 10).unwrap().len(), 1);
        assert_eq!(buffer.fetch(1, 0, 10).unwrap()[0].record.source().as_str(), "customers");
    }

    #[test]
    fn offsets_at_or_below_high_water_are_duplicates() {
        let buffer = store(100, 1 << 20);
        buffer.append(0, &record("orders", 5, "{}")).unwrap();
        let outcome = buffer.append(0, &record("orders", 5, "{}")).unwrap();
        assert_eq!(
            outcome,
            AppendOutcome::Duplicate {
                high_water: Offset::new(5)
            }
        );
        let outcome = buffer.append(0, &record("orders", 3, "{}")).unwrap();
        assert!(matches!(outcome, AppendOutcome::Duplicate { .. }));
        assert_eq!(buffer.depth().unwrap().records, 1);
    }

    #[test]
    fn high_water_survives_acknowledge() {
        let buffer = store(100, 1 << 20);
        buffer.append(0, &record("orders", 1, "{}")).unwrap();
        buffer.append(0, &record("orders", 2, "{}")).unwrap();
        assert_eq!(buffer.acknowledge(&SourceId::new("orders"), Offset::new(2)).unwrap(), 2);
        assert_eq!(buffer.depth().unwrap(), BufferDepth::default());
        assert_eq!(
            buffer.high_water(&SourceId::new("orders")).unwrap(),
            Some(Offset::new(2))
        );
        assert!(matches!(
            buffer.append(0, &record("orders", 2, "{}")).unwrap(),
            AppendOutcome::Duplicate { .. }
        ));
    }

    #[test]
    fn capacity_by_record_count() {
        let buffer = store(2, 1 << 20);
        buffer.append(0, &record("orders", 1, "{}")).unwrap();
        buffer.append(0, &record("orders", 2, "{}")).unwrap();
        let err = buffer.append(0, &record("orders", 3, "{}")).unwrap_err();
        assert!(err.is_capacity_exceeded(), "got: {err}");

        buffer.acknowledge(&SourceId::new("orders"), Offset::new(1)).unwrap();
        buffer.append(0, &record("orders", 3, "{}")).unwrap();
    }

    #[test]
    fn capacity_by_bytes() {
        let buffer = store(100, 10);
        buffer.append(0, &record("orders", 1, "123456")).unwrap();
        let err = buffer.append(0, &record("orders", 2, "123456")).unwrap_err();
        assert!(err.is_capacity_exceeded());
        // Nothing was stored, so the high-water mark did not move.
        assert_eq!(
            buffer.high_water(&SourceId::new("orders")).unwrap(),
            Some(Offset::new(1))
        );
    }

    #[test]
    fn oversized_record_is_refused_outright() {
        let buffer = store(100, 4);
        let err = buffer.append(0, &record("orders", 1, "123456")).unwrap_err();
        assert!(matches!(err, StateError::RecordTooLarge { bytes: 6, max_bytes: 4 }));
    }

    #[test]
    fn unacknowledged_records_reappear_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.db");
        {
            let buffer = SqliteBufferStore::open(&path, BufferLimits::default(), 1).unwrap();
            for offset in 1..=4 {
                buffer.append(0, &record("orders", offset, "{}")).unwrap();
            }
            // Dequeued, but only the first two were committed.
            assert_eq!(buffer.fetch(0, 0, 10).unwrap().len(), 4);
            buffer.acknowledge(&SourceId::new("orders"), Offset::new(2)).unwrap();
        }
        let buffer = SqliteBufferStore::open(&path, BufferLimits::default(), 1).unwrap();
        let pending = buffer.fetch(0, 0, 10).unwrap();
        let offsets: Vec<u64> = pending.iter().map(|b| b.record.offset().get()).collect();
        assert_eq!(offsets, vec![3, 4]);
        assert_eq!(buffer.depth().unwrap().records, 2);
        assert_eq!(buffer.pending_sources().unwrap(), vec![SourceId::new("orders")]);
    }

    #[test]
    fn reopen_with_more_lanes_reroutes_pending_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.db");
        let source = SourceId::new("orders");
        {
            let buffer = SqliteBufferStore::open(&path, BufferLimits::default(), 1).unwrap();
            buffer.append(0, &record("orders", 1, "{}")).unwrap();
        }
        let buffer = SqliteBufferStore::open(&path, BufferLimits::default(), 8).unwrap();
        let lane = source.lane(8);
        assert_eq!(buffer.fetch(lane, 0, 10).unwrap().len(), 1);
    }

    proptest! {
        #[test]
        fn fetch_order_matches_append_order(offsets in proptest::collection::btree_set(1u64..10_000, 1..40)) {
            let buffer = store(1_000, 1 << 20);
            for &offset in &offsets {
                buffer.append(0, &record("orders", offset, "{}")).unwrap();
            }
            let fetched: Vec<u64> = buffer
                .fetch(0, 0, 1_000)
                .unwrap()
                .iter()
                .map(|b| b.record.offset().get())
                .collect();
            let expected: Vec<u64> = offsets.into_iter().collect();
            prop_assert_eq!(fetched, expected);
        }
    }
}
