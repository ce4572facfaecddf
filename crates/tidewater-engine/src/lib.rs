//! Core runtime for Tidewater pipelines: durable buffering, transformation,
//! dead-lettering, idempotent warehouse commits, and checkpointing.

pub mod buffer;
pub mod checkpoint;
pub mod config;
pub mod dlq;
pub mod error;
pub mod lifecycle;
pub mod orchestrator;
pub(crate) mod resolve;
pub mod result;
pub mod source;
pub mod transform;
pub mod warehouse;
pub(crate) mod worker;

use tidewater_types::record::Timestamp;

// Re-export public API for convenience
pub use error::PipelineError;
pub use orchestrator::{
    check_pipeline, list_dead_letters, pipeline_status, replay_dead_letters, run_pipeline,
    Pipeline, PipelineBuilder,
};
pub use result::{CheckResult, PipelineCounts, PipelineResult, ReplayReport, StatusReport};

/// Current UTC time as an RFC 3339 timestamp.
pub(crate) fn now() -> Timestamp {
    Timestamp::new(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
}
