//! Storage contracts.
//!
//! Each store is a `Send + Sync` trait so the engine can hold it as
//! `Arc<dyn …>` and call it from `spawn_blocking`. Model types live in
//! [`tidewater_types`].

use tidewater_types::dead_letter::DeadLetterEntry;
use tidewater_types::record::{Offset, Record, SourceId};
use tidewater_types::state::{CheckpointState, PipelineId, RunRecord, RunStats, RunStatus};

use crate::error;

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

/// Per-source last-committed offsets.
pub trait CheckpointStore: Send + Sync {
    /// Read the checkpoint for a (pipeline, source) pair.
    ///
    /// Returns `Ok(None)` when the source has never been committed.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn read_checkpoint(
        &self,
        pipeline: &PipelineId,
        source: &SourceId,
    ) -> error::Result<Option<Offset>>;

    /// Move the checkpoint forward to `offset`.
    ///
    /// The check and the write happen atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NonMonotonic`](crate::error::StateError::NonMonotonic)
    /// when `offset` is not greater than the stored value, or another
    /// [`StateError`](crate::error::StateError) on storage failure.
    fn advance_checkpoint(
        &self,
        pipeline: &PipelineId,
        source: &SourceId,
        offset: Offset,
    ) -> error::Result<()>;

    /// All checkpoints for a pipeline, ordered by source.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn list_checkpoints(&self, pipeline: &PipelineId) -> error::Result<Vec<CheckpointState>>;
}

// ---------------------------------------------------------------------------
// Dead letters
// ---------------------------------------------------------------------------

/// A dead-letter entry with its storage id (used as the paging cursor).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDeadLetter {
    pub id: i64,
    pub entry: DeadLetterEntry,
}

/// Append-only storage for permanently failed records.
pub trait DeadLetterStore: Send + Sync {
    /// Append an entry unless one already exists for its (source, offset).
    ///
    /// Returns `true` if the entry was newly written.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn append_dead_letter(
        &self,
        pipeline: &PipelineId,
        entry: &DeadLetterEntry,
    ) -> error::Result<bool>;

    /// Up to `limit` entries for `source` with id greater than `after_id`,
    /// oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn dead_letter_page(
        &self,
        pipeline: &PipelineId,
        source: &SourceId,
        after_id: i64,
        limit: usize,
    ) -> error::Result<Vec<StoredDeadLetter>>;

    /// Number of entries, optionally restricted to one source.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn dead_letter_count(
        &self,
        pipeline: &PipelineId,
        source: Option<&SourceId>,
    ) -> error::Result<u64>;
}

// ---------------------------------------------------------------------------
// Run history
// ---------------------------------------------------------------------------

/// Pipeline run bookkeeping.
pub trait RunStore: Send + Sync {
    /// Begin a new run, returning its unique ID.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn start_run(&self, pipeline: &PipelineId) -> error::Result<i64>;

    /// Finalize a run with status and aggregate stats.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn complete_run(&self, run_id: i64, status: RunStatus, stats: &RunStats) -> error::Result<()>;

    /// Most recent runs first.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn recent_runs(&self, pipeline: &PipelineId, limit: usize) -> error::Result<Vec<RunRecord>>;
}

/// Everything the engine persists outside the buffer.
pub trait StateBackend: CheckpointStore + DeadLetterStore + RunStore {}

impl<T: CheckpointStore + DeadLetterStore + RunStore> StateBackend for T {}

// ---------------------------------------------------------------------------
// Ingestion buffer
// ---------------------------------------------------------------------------

/// Capacity thresholds for the ingestion buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLimits {
    pub max_records: u64,
    pub max_bytes: u64,
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self {
            max_records: 100_000,
            max_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Pending (unacknowledged) contents of the buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferDepth {
    pub records: u64,
    pub bytes: u64,
}

/// Result of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Stored at the given buffer sequence number.
    Appended { seq: i64 },
    /// Offset is at or below the source's high-water mark; nothing stored.
    Duplicate { high_water: Offset },
}

/// A record read back from the buffer with its sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedRecord {
    pub seq: i64,
    pub record: Record,
}

/// Durable, ordered, lane-partitioned queue.
pub trait BufferStore: Send + Sync {
    /// Persist `record` on `lane` before returning.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::CapacityExceeded`](crate::error::StateError::CapacityExceeded)
    /// when the buffer is full, or another
    /// [`StateError`](crate::error::StateError) on storage failure.
    fn append(&self, lane: u32, record: &Record) -> error::Result<AppendOutcome>;

    /// Up to `limit` records of `lane` with sequence greater than `after_seq`,
    /// in append order.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn fetch(&self, lane: u32, after_seq: i64, limit: usize) -> error::Result<Vec<BufferedRecord>>;

    /// Remove every record of `source` with offset `<= through`. Returns how many went.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn acknowledge(&self, source: &SourceId, through: Offset) -> error::Result<u64>;

    /// Highest offset ever appended for `source`, acknowledged or not.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn high_water(&self, source: &SourceId) -> error::Result<Option<Offset>>;

    /// Sources that currently have pending records.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn pending_sources(&self) -> error::Result<Vec<SourceId>>;

    /// Pending record and byte counts.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn depth(&self) -> error::Result<BufferDepth>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traits_are_object_safe() {
        fn _assert_state(_: &dyn StateBackend) {}
        fn _assert_checkpoints(_: &dyn CheckpointStore) {}
        fn _assert_buffer(_: &dyn BufferStore) {}
    }

    #[test]
    fn default_limits() {
        let limits = BufferLimits::default();
        assert_eq!(limits.max_records, 100_000);
        assert_eq!(limits.max_bytes, 64 * 1024 * 1024);
    }
}
