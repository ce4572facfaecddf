//! Structured error model for pipeline stages.
//!
//! [`StageError`] carries classification, retry metadata, and optional
//! diagnostic details. Construct via category-specific factory methods.
//!
//! | category            | outcome                                          |
//! |---------------------|--------------------------------------------------|
//! | `capacity`          | backpressure; the connector pauses and retries   |
//! | `transient`         | bounded retry with backoff, then rejected        |
//! | `validation`, `reference`, `schema` | rejected to the dead-letter sink |
//! | `write_unavailable` | retried at the warehouse boundary                |
//! | `storage`           | process-fatal                                    |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Broad classification of a stage error.
///
/// Determines default retry behavior and operator-facing categorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// A rule (not-null, range, regex, type) rejected the record.
    Validation,
    /// Payload shape does not match the declared schema or warehouse columns.
    Schema,
    /// Referential check failed against a lookup table.
    Reference,
    /// Unexpected processing fault (retryable).
    Transient,
    /// Ingestion buffer is full (retryable).
    Capacity,
    /// Warehouse could not accept writes right now (retryable).
    WriteUnavailable,
    /// Durable storage failure.
    Storage,
    /// Internal error.
    Internal,
}

impl ErrorCategory {
    /// Wire-format string for storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Schema => "schema",
            Self::Reference => "reference",
            Self::Transient => "transient",
            Self::Capacity => "capacity",
            Self::WriteUnavailable => "write_unavailable",
            Self::Storage => "storage",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown category string read back from storage.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown error category '{0}'")]
pub struct UnknownCategory(pub String);

impl FromStr for ErrorCategory {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "validation" => Ok(Self::Validation),
            "schema" => Ok(Self::Schema),
            "reference" => Ok(Self::Reference),
            "transient" => Ok(Self::Transient),
            "capacity" => Ok(Self::Capacity),
            "write_unavailable" => Ok(Self::WriteUnavailable),
            "storage" => Ok(Self::Storage),
            "internal" => Ok(Self::Internal),
            other => Err(UnknownCategory(other.to_string())),
        }
    }
}

/// Blast radius of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorScope {
    /// Affects the whole source.
    Source,
    /// Affects a single batch.
    Batch,
    /// Affects an individual record.
    Record,
}

impl fmt::Display for ErrorScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Source => "source",
            Self::Batch => "batch",
            Self::Record => "record",
        };
        f.write_str(s)
    }
}

/// Retry backoff strategy, relative to the configured base delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffClass {
    /// A tenth of the base delay.
    Fast,
    /// The base delay.
    Normal,
    /// Five times the base delay.
    Slow,
}

/// Structured error from a pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("[{category}] {code}: {message}")]
pub struct StageError {
    pub category: ErrorCategory,
    pub scope: ErrorScope,
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    pub backoff_class: BackoffClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl StageError {
    fn new(
        category: ErrorCategory,
        scope: ErrorScope,
        retryable: bool,
        backoff_class: BackoffClass,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            scope,
            code: code.into(),
            message: message.into(),
            retryable,
            retry_after_ms: None,
            backoff_class,
            details: None,
        }
    }

    /// Rule failure on a single record (not retryable).
    #[must_use]
    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, ErrorScope::Record, false, BackoffClass::Normal, code, message)
    }

    /// Schema mismatch on a single record (not retryable).
    #[must_use]
    pub fn schema(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Schema, ErrorScope::Record, false, BackoffClass::Normal, code, message)
    }

    /// Referential check failure (not retryable).
    #[must_use]
    pub fn reference(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Reference, ErrorScope::Record, false, BackoffClass::Normal, code, message)
    }

    /// Unexpected processing fault (retryable, normal backoff).
    #[must_use]
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Transient, ErrorScope::Record, true, BackoffClass::Normal, code, message)
    }

    /// Ingestion buffer is full (retryable, fast backoff).
    #[must_use]
    pub fn capacity(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Capacity, ErrorScope::Source, true, BackoffClass::Fast, code, message)
    }

    /// Warehouse temporarily refused the write (retryable, normal backoff).
    #[must_use]
    pub fn write_unavailable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::WriteUnavailable, ErrorScope::Batch, true, BackoffClass::Normal, code, message)
    }

    /// Durable storage failure (not retryable).
    #[must_use]
    pub fn storage(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Storage, ErrorScope::Source, false, BackoffClass::Normal, code, message)
    }

    /// Internal error (not retryable).
    #[must_use]
    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, ErrorScope::Record, false, BackoffClass::Normal, code, message)
    }

    /// Attach structured diagnostic details.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Ask the retry loop to wait exactly this long before the next attempt.
    #[must_use]
    pub fn with_retry_after(mut self, retry_after_ms: u64) -> Self {
        self.retry_after_ms = Some(retry_after_ms);
        self
    }

    /// Override the scope assigned by the factory.
    #[must_use]
    pub fn with_scope(mut self, scope: ErrorScope) -> Self {
        self.scope = scope;
        self
    }
}
