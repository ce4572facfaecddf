pub mod check;
pub mod dlq;
pub mod run;
pub mod status;

use std::path::Path;

use anyhow::{Context, Result};
use tidewater_engine::config::parser;
use tidewater_engine::config::types::PipelineConfig;
use tidewater_engine::config::validator;

/// Parse and validate a pipeline file.
pub(crate) fn load(pipeline_path: &Path) -> Result<PipelineConfig> {
    let config = parser::parse_pipeline(pipeline_path)
        .with_context(|| format!("Failed to parse pipeline: {}", pipeline_path.display()))?;
    validator::validate_pipeline(&config)?;
    Ok(config)
}
