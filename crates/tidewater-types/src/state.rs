//! State model types.
//!
//! Pure data shared by the state crate (which persists them) and the engine
//! (which drives them).

use serde::{Deserialize, Serialize};

use crate::record::{Offset, SourceId};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Opaque pipeline identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineId(String);

impl PipelineId {
    /// Create a new pipeline identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PipelineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for PipelineId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for PipelineId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ---------------------------------------------------------------------------
// Run tracking
// ---------------------------------------------------------------------------

/// Status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Wire-format string for storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Inverse of [`RunStatus::as_str`].
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate statistics for a pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    /// Records accepted into the ingestion buffer.
    pub records_read: u64,
    /// Records newly applied to the warehouse.
    pub records_written: u64,
    pub records_dead_lettered: u64,
    /// Buffer and warehouse duplicates that were skipped.
    pub duplicates_skipped: u64,
    /// Transform and commit retries.
    pub retries: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// A persisted run row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: i64,
    pub status: RunStatus,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    pub stats: RunStats,
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

/// Last committed offset for one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub source: SourceId,
    pub offset: Offset,
    /// ISO-8601 timestamp of last update.
    pub updated_at: String,
}

// ---------------------------------------------------------------------------
// Source lifecycle
// ---------------------------------------------------------------------------

/// Processing state of a single source.
///
/// ```text
/// Idle -> Ingesting -> Transforming -> Committing -> Idle
///                      Transforming -> DeadLettering -> Committing
/// any  -> Recovering -> Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    #[default]
    Idle,
    /// A batch for this source was taken from the buffer.
    Ingesting,
    Transforming,
    DeadLettering,
    Committing,
    /// Re-deriving position from the checkpoint store after restart.
    Recovering,
}

impl SourceState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Ingesting => "ingesting",
            Self::Transforming => "transforming",
            Self::DeadLettering => "dead_lettering",
            Self::Committing => "committing",
            Self::Recovering => "recovering",
        }
    }

    /// Whether moving from `self` to `next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use SourceState::{Committing, DeadLettering, Idle, Ingesting, Recovering, Transforming};

        matches!(
            (self, next),
            (Idle, Ingesting)
                | (Ingesting, Transforming)
                | (Transforming, Committing | DeadLettering)
                | (DeadLettering, Committing)
                | (Committing, Idle)
                | (Recovering, Idle)
                | (_, Recovering)
        )
    }
}

impl std::fmt::Display for SourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
