//! Warehouse writer contract.
//!
//! Commits are idempotent keyed by `(source, offset)` and all-or-nothing per
//! batch. The trait is synchronous; the engine calls it from
//! `spawn_blocking`.

pub mod sqlite;

use std::collections::BTreeMap;

use tidewater_types::error::StageError;
use tidewater_types::record::{Offset, Record, SourceId};

pub use sqlite::SqliteWarehouse;

/// Outcome of one committed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitResult {
    /// Rows newly written.
    pub applied: u64,
    /// Rows skipped because `(source, offset)` was already present.
    pub duplicates: u64,
    /// Highest offset per source now durably present from this batch.
    pub max_applied: BTreeMap<SourceId, Offset>,
}

/// One record the warehouse schema refuses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    pub source: SourceId,
    pub offset: Offset,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum WarehouseError {
    /// Busy, locked, or I/O failure. The batch was not applied; retry it.
    #[error("warehouse unavailable: {reason}")]
    WriteUnavailable { reason: String },

    /// Some records do not fit the schema. Nothing was applied.
    #[error("{} record(s) violate the warehouse schema", violations.len())]
    SchemaViolation { violations: Vec<SchemaViolation> },

    /// Offsets of one source were not strictly increasing within the batch.
    #[error("batch for '{source_id}' is out of order: {offset} after {previous}")]
    OutOfOrder {
        source_id: String,
        previous: u64,
        offset: u64,
    },

    #[error("warehouse storage error: {0}")]
    Storage(String),
}

impl WarehouseError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::WriteUnavailable { .. })
    }

    /// Map onto the shared error taxonomy.
    #[must_use]
    pub fn to_stage_error(&self) -> StageError {
        match self {
            Self::WriteUnavailable { .. } => {
                StageError::write_unavailable("WAREHOUSE_UNAVAILABLE", self.to_string())
            }
            Self::SchemaViolation { .. } => {
                StageError::schema("WAREHOUSE_SCHEMA", self.to_string())
            }
            Self::OutOfOrder { .. } => StageError::internal("OUT_OF_ORDER", self.to_string()),
            Self::Storage(_) => StageError::storage("WAREHOUSE_STORAGE", self.to_string()),
        }
    }
}

/// Durable destination for accepted records.
pub trait Warehouse: Send + Sync {
    /// Apply `records` in one transaction.
    ///
    /// Records must be in increasing offset order per source.
    ///
    /// # Errors
    ///
    /// Returns [`WarehouseError`]; on any error nothing is applied.
    fn commit_batch(&self, records: &[Record]) -> Result<CommitResult, WarehouseError>;

    /// Number of committed rows for `source`.
    ///
    /// # Errors
    ///
    /// Returns [`WarehouseError::Storage`] on read failure.
    fn committed_count(&self, source: &SourceId) -> Result<u64, WarehouseError>;

    /// Committed offsets for `source`, ascending.
    ///
    /// # Errors
    ///
    /// Returns [`WarehouseError::Storage`] on read failure.
    fn committed_offsets(&self, source: &SourceId) -> Result<Vec<Offset>, WarehouseError>;

    /// Highest committed offset for `source`.
    ///
    /// # Errors
    ///
    /// Returns [`WarehouseError::Storage`] on read failure.
    fn max_offset(&self, source: &SourceId) -> Result<Option<Offset>, WarehouseError>;
}

/// Reject batches whose offsets go backwards within a source.
pub(crate) fn ensure_ordered(records: &[Record]) -> Result<(), WarehouseError> {
    let mut last: BTreeMap<&SourceId, Offset> = BTreeMap::new();
    for record in records {
        if let Some(previous) = last.insert(record.source(), record.offset()) {
            if record.offset() <= previous {
                return Err(WarehouseError::OutOfOrder {
                    source_id: record.source().to_string(),
                    previous: previous.get(),
                    offset: record.offset().get(),
                });
            }
        }
    }
    Ok(())
}
