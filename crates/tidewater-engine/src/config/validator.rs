//! Semantic validation for parsed pipeline configuration values.

use std::collections::BTreeSet;

use anyhow::{bail, Result};

use crate::config::types::{parse_byte_size, PipelineConfig, WarehouseBackendKind};
use crate::transform::rules::CompiledRules;

/// Push an error for every name that appears more than once.
fn check_unique<'a>(
    names: impl IntoIterator<Item = &'a str>,
    context: &str,
    errors: &mut Vec<String>,
) {
    let mut seen = BTreeSet::new();
    for name in names {
        if name.trim().is_empty() {
            errors.push(format!("{context}: name must not be empty"));
        } else if !seen.insert(name) {
            errors.push(format!("{context}: duplicate name '{name}'"));
        }
    }
}

/// Validate a parsed pipeline configuration.
/// Returns `Ok(())` if valid, Err with all validation errors if not.
///
/// # Errors
///
/// Returns an error listing all validation failures found in the pipeline config.
pub fn validate_pipeline(config: &PipelineConfig) -> Result<()> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(format!(
            "Unsupported pipeline version '{}', expected '1.0'",
            config.version
        ));
    }

    if config.pipeline.trim().is_empty() {
        errors.push("Pipeline name must not be empty".to_string());
    }

    if config.sources.is_empty() {
        errors.push("Pipeline must define at least one source".to_string());
    }
    check_unique(
        config.sources.iter().map(|s| s.name.as_str()),
        "sources",
        &mut errors,
    );
    for source in &config.sources {
        if source.path.as_os_str().is_empty() {
            errors.push(format!("Source '{}' has an empty path", source.name));
        }
    }

    if config.buffer.lanes == 0 {
        errors.push("buffer.lanes must be at least 1".to_string());
    }
    if config.buffer.max_records == 0 {
        errors.push("buffer.max_records must be at least 1".to_string());
    }
    match parse_byte_size(&config.buffer.max_bytes) {
        Ok(0) => errors.push("buffer.max_bytes must be greater than 0".to_string()),
        Ok(_) => {}
        Err(e) => errors.push(format!("buffer.max_bytes: {e}")),
    }
    if config.buffer.path.is_none() {
        tracing::warn!(
            pipeline = config.pipeline,
            "buffer.path not set: buffered records will not survive a restart"
        );
    }

    let processing = &config.processing;
    if processing.batch_size == 0 {
        errors.push("processing.batch_size must be at least 1".to_string());
    }
    if processing.max_attempts == 0 {
        errors.push("processing.max_attempts must be at least 1".to_string());
    }
    if processing.backoff.max_ms == 0 {
        errors.push("processing.backoff.max_ms must be greater than 0".to_string());
    }
    if processing.backoff.base_ms > processing.backoff.max_ms {
        errors.push(format!(
            "processing.backoff.base_ms ({}) must not exceed max_ms ({})",
            processing.backoff.base_ms, processing.backoff.max_ms
        ));
    }

    check_unique(
        config.transform.schema.iter().map(|f| f.name.as_str()),
        "transform.schema",
        &mut errors,
    );
    if let Err(e) = CompiledRules::compile(&config.transform) {
        errors.push(format!("transform: {e}"));
    }

    if config.warehouse.backend == WarehouseBackendKind::Sqlite && config.warehouse.path.is_none()
    {
        errors.push("warehouse.path is required for the sqlite backend".to_string());
    }
    check_unique(
        config.warehouse.columns.iter().map(|c| c.name.as_str()),
        "warehouse.columns",
        &mut errors,
    );

    if errors.is_empty() {
        Ok(())
    } else {
        bail!("Pipeline validation failed:\n  - {}", errors.join("\n  - "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parser::parse_pipeline_str;

    fn base_yaml() -> String {
        r#"
version: "1.0"
pipeline: orders_etl
sources:
  - { name: orders, kind: csv, path: data/orders.csv }
buffer:
  path: state/buffer.db
warehouse:
  path: warehouse.db
"#
        .to_string()
    }

    fn validate_yaml(yaml: &str) -> Result<()> {
        validate_pipeline(&parse_pipeline_str(yaml).unwrap())
    }

    #[test]
    fn test_valid_pipeline_passes() {
        validate_yaml(&base_yaml()).unwrap();
    }

    #[test]
    fn test_wrong_version() {
        let yaml = base_yaml().replace("\"1.0\"", "\"2.0\"");
        let err = validate_yaml(&yaml).unwrap_err().to_string();
        assert!(err.contains("Unsupported pipeline version '2.0'"));
    }

    #[test]
    fn test_no_sources() {
        let yaml = "version: \"1.0\"\npipeline: p\nwarehouse: { backend: memory }\n";
        let err = validate_yaml(yaml).unwrap_err().to_string();
        assert!(err.contains("at least one source"));
    }

    #[test]
    fn test_duplicate_source_names() {
        let yaml = base_yaml().replace(
            "sources:\n",
            "sources:\n  - { name: orders, kind: jsonl, path: other.jsonl }\n",
        );
        let err = validate_yaml(&yaml).unwrap_err().to_string();
        assert!(err.contains("duplicate name 'orders'"));
    }

    #[test]
    fn test_sqlite_warehouse_requires_path() {
        let yaml = base_yaml().replace("  path: warehouse.db\n", "  backend: sqlite\n");
        let err = validate_yaml(&yaml).unwrap_err().to_string();
        assert!(err.contains("warehouse.path is required"));
    }

    #[test]
    fn test_all_errors_reported_together() {
        let yaml = r#"
version: "1.0"
pipeline: ""
sources:
  - { name: orders, kind: csv, path: a.csv }
buffer: { lanes: 0, max_bytes: lots }
processing: { batch_size: 0, max_attempts: 0, backoff: { base_ms: 500, max_ms: 100 } }
transform:
  rules:
    - assert_regex: { field: sku, pattern: "([" }
warehouse: { backend: memory }
"#;
        let err = validate_yaml(yaml).unwrap_err().to_string();
        for needle in [
            "Pipeline name must not be empty",
            "buffer.lanes",
            "buffer.max_bytes",
            "processing.batch_size",
            "processing.max_attempts",
            "base_ms (500) must not exceed max_ms (100)",
            "invalid regex pattern for field 'sku'",
        ] {
            assert!(err.contains(needle), "missing '{needle}' in:\n{err}");
        }
    }

    #[test]
    fn test_unknown_reference_table() {
        let yaml = base_yaml()
            + "transform:\n  rules:\n    - assert_reference: { field: country, table: countries }\n";
        let err = validate_yaml(&yaml).unwrap_err().to_string();
        assert!(err.contains("unknown reference table 'countries'"));
    }
}
