//! Shared Tidewater record, result, and error model types.
//!
//! Everything here is plain data: the state crate persists these types and
//! the engine moves them between the buffer, the transformation engine, the
//! dead-letter sink, and the warehouse writer.

pub mod dead_letter;
pub mod error;
pub mod prelude;
pub mod record;
pub mod result;
pub mod state;
