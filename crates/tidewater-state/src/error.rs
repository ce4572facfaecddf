//! State store error types.

use rusqlite::ErrorCode;

/// Errors produced by the storage contracts in [`crate::backend`].
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// `SQLite` failure annotated with the operation that hit it.
    #[error("{context}: {source}")]
    Backend {
        context: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored JSON column could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("state backend lock poisoned")]
    LockPoisoned,

    /// Checkpoint advance to an offset that is not greater than the stored one.
    #[error("checkpoint for '{source_id}' is at {stored}, refusing to move to {proposed}")]
    NonMonotonic {
        source_id: String,
        stored: u64,
        proposed: u64,
    },

    /// Buffer is at its record or byte limit.
    #[error(
        "ingestion buffer full: {records}/{max_records} records, {bytes}/{max_bytes} bytes"
    )]
    CapacityExceeded {
        records: u64,
        bytes: u64,
        max_records: u64,
        max_bytes: u64,
    },

    /// A single record is larger than the whole buffer.
    #[error("record of {bytes} bytes can never fit a buffer of {max_bytes} bytes")]
    RecordTooLarge { bytes: u64, max_bytes: u64 },

    /// Offset does not fit the storage integer type.
    #[error("offset {0} exceeds the storable range")]
    OffsetOutOfRange(u64),

    /// A stored row could not be interpreted.
    #[error("corrupt state row: {0}")]
    Corrupt(String),
}

impl StateError {
    /// Wrap a raw `SQLite` error.
    #[must_use]
    pub fn backend(err: rusqlite::Error) -> Self {
        Self::Sqlite(err)
    }

    /// Wrap a raw `SQLite` error with the failing operation.
    #[must_use]
    pub fn backend_context(context: &'static str, err: rusqlite::Error) -> Self {
        Self::Backend {
            context,
            source: err,
        }
    }

    /// Whether the store is temporarily unable to serve (busy, locked, I/O).
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::Sqlite(err) | Self::Backend { source: err, .. } => is_unavailable_sqlite(err),
            Self::Io(_) => true,
            _ => false,
        }
    }

    #[must_use]
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }
}

/// Classify `SQLite` failures that are worth retrying.
#[must_use]
pub fn is_unavailable_sqlite(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => matches!(
            e.code,
            ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::SystemIoFailure
                | ErrorCode::DiskFull
                | ErrorCode::CannotOpen
        ),
        _ => false,
    }
}

/// Convert a stored `SQLite` integer to an offset.
pub(crate) fn offset_from_sql(raw: i64) -> Result<tidewater_types::record::Offset> {
    u64::try_from(raw)
        .map(tidewater_types::record::Offset::new)
        .map_err(|_| StateError::Corrupt(format!("negative offset {raw}")))
}

/// Convert an offset to the `SQLite` integer type.
pub(crate) fn offset_to_sql(offset: tidewater_types::record::Offset) -> Result<i64> {
    i64::try_from(offset.get()).map_err(|_| StateError::OffsetOutOfRange(offset.get()))
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(code: i32) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), Some("boom".into()))
    }

    #[test]
    fn sqlite_error_displays_context() {
        let err = StateError::backend_context("advance: update", failure(1));
        let msg = err.to_string();
        assert!(msg.starts_with("advance: update"), "got: {msg}");
    }

    #[test]
    fn lock_poisoned_displays() {
        let err = StateError::LockPoisoned;
        assert_eq!(err.to_string(), "state backend lock poisoned");
    }

    #[test]
    fn busy_and_locked_are_unavailable() {
        assert!(StateError::backend(failure(rusqlite::ffi::SQLITE_BUSY)).is_unavailable());
        assert!(StateError::backend(failure(rusqlite::ffi::SQLITE_LOCKED)).is_unavailable());
        assert!(!StateError::backend(failure(rusqlite::ffi::SQLITE_CONSTRAINT)).is_unavailable());
        assert!(!StateError::LockPoisoned.is_unavailable());
    }

    #[test]
    fn offset_conversion_bounds() {
        use tidewater_types::record::Offset;
        assert_eq!(offset_to_sql(Offset::new(5)).unwrap(), 5);
        assert!(matches!(
            offset_to_sql(Offset::new(u64::MAX)),
            Err(StateError::OffsetOutOfRange(_))
        ));
        assert!(matches!(offset_from_sql(-1), Err(StateError::Corrupt(_))));
    }

    #[test]
    fn non_monotonic_names_both_offsets() {
        let err = StateError::NonMonotonic {
            source_id: "orders".into(),
            stored: 100,
            proposed: 100,
        };
        assert_eq!(
            err.to_string(),
            "checkpoint for 'orders' is at 100, refusing to move to 100"
        );
    }
}
