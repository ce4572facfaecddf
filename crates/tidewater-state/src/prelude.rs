//! Common imports for state consumers and benches.

pub use crate::backend::{
    AppendOutcome, BufferDepth, BufferLimits, BufferStore, BufferedRecord, CheckpointStore,
    DeadLetterStore, RunStore, StateBackend, StoredDeadLetter,
};
pub use crate::buffer::SqliteBufferStore;
pub use crate::error::StateError;
pub use crate::sqlite::SqliteStateBackend;
pub use tidewater_types::prelude::*;
