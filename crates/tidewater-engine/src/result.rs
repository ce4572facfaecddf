//! Pipeline run, check, status and replay result types.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tidewater_types::record::SourceId;
use tidewater_types::state::{CheckpointState, RunRecord, RunStats, RunStatus, SourceState};

/// Live counters shared by drivers and lane workers.
#[derive(Debug, Default)]
pub struct RunCounters {
    records_read: AtomicU64,
    records_written: AtomicU64,
    records_dead_lettered: AtomicU64,
    duplicates_skipped: AtomicU64,
    retries: AtomicU64,
}

impl RunCounters {
    pub(crate) fn add_read(&self, n: u64) {
        self.records_read.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_written(&self, n: u64) {
        self.records_written.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_dead_lettered(&self, n: u64) {
        self.records_dead_lettered.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_duplicates(&self, n: u64) {
        self.duplicates_skipped.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_retries(&self, n: u64) {
        self.retries.fetch_add(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> PipelineCounts {
        PipelineCounts {
            records_read: self.records_read.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
            records_dead_lettered: self.records_dead_lettered.load(Ordering::Relaxed),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

/// Aggregate record counts for a pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineCounts {
    pub records_read: u64,
    pub records_written: u64,
    pub records_dead_lettered: u64,
    pub duplicates_skipped: u64,
    pub retries: u64,
}

impl PipelineCounts {
    #[must_use]
    pub fn to_run_stats(self, error_message: Option<String>) -> RunStats {
        RunStats {
            records_read: self.records_read,
            records_written: self.records_written,
            records_dead_lettered: self.records_dead_lettered,
            duplicates_skipped: self.duplicates_skipped,
            retries: self.retries,
            error_message,
        }
    }
}

/// Result of a pipeline run that was not aborted by a fatal error.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub pipeline: String,
    pub run_id: i64,
    pub status: RunStatus,
    pub counts: PipelineCounts,
    /// Buffered records acknowledged during recovery.
    pub recovered: u64,
    pub duration_secs: f64,
}

/// Result of `check`.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub pipeline: String,
    pub sources: Vec<SourceCheck>,
    pub state_ok: bool,
    pub warehouse_ok: bool,
    pub buffer_ok: bool,
}

impl CheckResult {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.state_ok && self.warehouse_ok && self.buffer_ok && self.sources.iter().all(|s| s.ok)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceCheck {
    pub name: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Operator view of a pipeline's durable state.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub pipeline: String,
    pub checkpoints: Vec<CheckpointState>,
    pub buffer_records: u64,
    pub buffer_bytes: u64,
    pub pending_sources: Vec<SourceId>,
    pub dead_letters: u64,
    pub recent_runs: Vec<RunRecord>,
    /// In-process source states. Only populated inside a running process.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub source_states: BTreeMap<SourceId, SourceState>,
}

/// Result of resubmitting dead-lettered records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    /// Entries read from the dead-letter sink.
    pub replayed: u64,
    /// Newly applied to the warehouse.
    pub applied: u64,
    /// Already present in the warehouse.
    pub duplicates: u64,
    /// Rejected again; their entries stay in the sink.
    pub still_rejected: u64,
}
