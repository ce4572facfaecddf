//! Records that failed permanently.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCategory, StageError};
use crate::record::{Record, Timestamp};
use crate::result::Attempt;

/// Entry in the dead-letter sink. Append-only; never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// The original record as it left the buffer.
    pub record: Record,
    /// Human-readable error description.
    pub error_message: String,
    pub error_category: ErrorCategory,
    /// Every failed attempt, oldest first. Empty for immediate rejections.
    #[serde(default)]
    pub attempts: Vec<Attempt>,
    /// When the record was declared unprocessable.
    pub failed_at: Timestamp,
}

impl DeadLetterEntry {
    #[must_use]
    pub fn new(record: Record, reason: &StageError, attempts: Vec<Attempt>, failed_at: Timestamp) -> Self {
        Self {
            record,
            error_message: reason.to_string(),
            error_category: reason.category,
            attempts,
            failed_at,
        }
    }
}
