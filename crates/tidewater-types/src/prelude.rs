//! Convenience re-exports for crates that move records around.

pub use crate::dead_letter::DeadLetterEntry;
pub use crate::error::{BackoffClass, ErrorCategory, ErrorScope, StageError};
pub use crate::record::{Offset, Payload, Record, SourceId, Timestamp};
pub use crate::result::{Attempt, ProcessingResult};
pub use crate::state::{PipelineId, RunStats, RunStatus, SourceState};
