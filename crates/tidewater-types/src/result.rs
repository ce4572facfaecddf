//! Outcome of running one record through the transformation engine.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCategory, StageError};
use crate::record::{Record, Timestamp};

/// One failed processing attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-based attempt number.
    pub number: u32,
    pub category: ErrorCategory,
    pub code: String,
    pub message: String,
    pub at: Timestamp,
}

impl Attempt {
    #[must_use]
    pub fn from_error(number: u32, error: &StageError, at: Timestamp) -> Self {
        Self {
            number,
            category: error.category,
            code: error.code.clone(),
            message: error.message.clone(),
            at,
        }
    }
}

/// Tagged outcome of a transform.
///
/// `Retryable` carries the attempt history so the caller's retry loop can
/// feed it back in without keeping any side state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingResult {
    /// Transformed record, ready for the warehouse.
    Accepted(Record),
    /// Permanently unprocessable; route to the dead-letter sink.
    Rejected {
        record: Record,
        reason: StageError,
        attempts: Vec<Attempt>,
    },
    /// Transient fault; try again after backoff.
    Retryable {
        record: Record,
        error: StageError,
        attempts: Vec<Attempt>,
    },
}

impl ProcessingResult {
    /// The record this result is about (transformed for `Accepted`).
    #[must_use]
    pub fn record(&self) -> &Record {
        match self {
            Self::Accepted(record)
            | Self::Rejected { record, .. }
            | Self::Retryable { record, .. } => record,
        }
    }

    /// Number of failed attempts so far.
    #[must_use]
    pub fn attempt_count(&self) -> u32 {
        match self {
            Self::Accepted(_) => 0,
            Self::Rejected { attempts, .. } | Self::Retryable { attempts, .. } => {
                u32::try_from(attempts.len()).unwrap_or(u32::MAX)
            }
        }
    }

    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}
