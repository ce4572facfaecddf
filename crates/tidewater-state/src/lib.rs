//! Durable state for the Tidewater engine.
//!
//! Provides the storage contracts in [`backend`] and `SQLite`
//! implementations: [`SqliteStateBackend`] for checkpoints, dead letters,
//! and run history, and [`SqliteBufferStore`] for the ingestion buffer.

#![warn(clippy::pedantic)]

pub mod backend;
pub mod buffer;
pub mod error;
pub mod prelude;
pub mod schema;
pub mod sqlite;

pub use backend::{BufferStore, CheckpointStore, DeadLetterStore, RunStore, StateBackend};
pub use buffer::SqliteBufferStore;
pub use error::StateError;
pub use sqlite::SqliteStateBackend;
