//! Pipeline YAML configuration types.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Number, Value};
use tidewater_types::state::PipelineId;

use crate::error::BackoffPolicy;

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub version: String,
    pub pipeline: String,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub transform: TransformConfig,
    #[serde(default)]
    pub warehouse: WarehouseConfig,
    #[serde(default)]
    pub state: StateConfig,
}

impl PipelineConfig {
    #[must_use]
    pub fn pipeline_id(&self) -> PipelineId {
        PipelineId::new(self.pipeline.clone())
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Csv,
    Jsonl,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub kind: SourceKind,
    pub path: PathBuf,
    /// CSV field delimiter. Defaults to `,`.
    #[serde(default)]
    pub delimiter: Option<char>,
}

// ---------------------------------------------------------------------------
// Buffer and processing
// ---------------------------------------------------------------------------

fn default_max_records() -> u64 {
    100_000
}

fn default_max_bytes() -> String {
    "64mb".to_string()
}

fn default_lanes() -> u32 {
    4
}

#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    /// Buffer database file. `None` keeps the buffer in memory (not durable).
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_max_records")]
    pub max_records: u64,
    /// Human-readable byte size (`"64mb"`, `"512kb"`, `"1048576"`).
    #[serde(default = "default_max_bytes")]
    pub max_bytes: String,
    #[serde(default = "default_lanes")]
    pub lanes: u32,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_records: default_max_records(),
            max_bytes: default_max_bytes(),
            lanes: default_lanes(),
        }
    }
}

fn default_batch_size() -> usize {
    500
}

fn default_max_attempts() -> u32 {
    3
}

fn default_commit_retries() -> u32 {
    5
}

fn default_poll_interval_ms() -> u64 {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Transform attempts before a faulting record is rejected.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Retries of a batch commit on `WriteUnavailable` before failing the run.
    #[serde(default = "default_commit_retries")]
    pub commit_retries: u32,
    /// Sleep between polls when a source has nothing new.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            backoff: BackoffConfig::default(),
            commit_retries: default_commit_retries(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl ProcessingConfig {
    #[must_use]
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.backoff.base_ms),
            max: Duration::from_millis(self.backoff.max_ms),
        }
    }
}

fn default_base_ms() -> u64 {
    100
}

fn default_max_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            max_ms: default_max_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Transform
// ---------------------------------------------------------------------------

/// Declared field types, shared by the transform schema and warehouse columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Datetime,
    Object,
    Array,
}

impl FieldType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Datetime => "datetime",
            Self::Object => "object",
            Self::Array => "array",
        }
    }

    /// Whether a non-null JSON value has this type.
    #[must_use]
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Datetime => value
                .as_str()
                .is_some_and(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok()),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_true() -> bool {
    true
}

/// One declared payload field.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default = "default_true")]
    pub required: bool,
    /// Filled in when the field is missing or null.
    #[serde(default)]
    pub default: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransformConfig {
    #[serde(default)]
    pub schema: Vec<FieldSpec>,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
    #[serde(default)]
    pub cleaning: CleaningConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    /// Read-only reference tables for referential checks and lookups.
    #[serde(default)]
    pub references: BTreeMap<String, ReferenceTable>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RuleSpec {
    NotNull { assert_not_null: FieldSelector },
    Regex { assert_regex: RegexSelector },
    Range { assert_range: RangeSelector },
    Reference { assert_reference: ReferenceSelector },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FieldSelector {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RegexSelector {
    One(RegexRule),
    Many(Vec<RegexRule>),
    Map(BTreeMap<String, String>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegexRule {
    pub field: String,
    pub pattern: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RangeSelector {
    One(RangeRule),
    Many(Vec<RangeRule>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct RangeRule {
    pub field: String,
    pub min: Option<Number>,
    pub max: Option<Number>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ReferenceSelector {
    One(ReferenceRule),
    Many(Vec<ReferenceRule>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReferenceRule {
    pub field: String,
    pub table: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CleaningConfig {
    #[serde(default = "default_true")]
    pub trim_strings: bool,
    /// Coerce values to the declared schema type (`"42"` to 42).
    #[serde(default = "default_true")]
    pub coerce_types: bool,
    /// Values for missing or null fields, applied after schema defaults.
    #[serde(default)]
    pub defaults: BTreeMap<String, Value>,
    #[serde(default)]
    pub drop_fields: Vec<String>,
    /// `old_name: new_name`, applied before any other step.
    #[serde(default)]
    pub rename: BTreeMap<String, String>,
}

impl Default for CleaningConfig {
    fn default() -> Self {
        Self {
            trim_strings: true,
            coerce_types: true,
            defaults: BTreeMap::new(),
            drop_fields: Vec::new(),
            rename: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnrichmentConfig {
    /// Attach `_metadata` (source, offset, ingestion time, tags).
    #[serde(default = "default_true")]
    pub metadata: bool,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub lookups: Vec<LookupSpec>,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            metadata: true,
            tags: BTreeMap::new(),
            lookups: Vec::new(),
        }
    }
}

/// Copy attributes of the reference row keyed by `field` into `into`.
#[derive(Debug, Clone, Deserialize)]
pub struct LookupSpec {
    pub field: String,
    pub table: String,
    /// Target field. Defaults to the table name.
    #[serde(default)]
    pub into: Option<String>,
    /// Reject the record when the key has no row.
    #[serde(default)]
    pub required: bool,
}

impl LookupSpec {
    #[must_use]
    pub fn target(&self) -> &str {
        self.into.as_deref().unwrap_or(&self.table)
    }
}

/// A reference table: either a bare key set or keyed attribute rows.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ReferenceTable {
    Keys(Vec<String>),
    Rows(BTreeMap<String, serde_json::Map<String, Value>>),
}

// ---------------------------------------------------------------------------
// Warehouse and state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarehouseBackendKind {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WarehouseConfig {
    #[serde(default)]
    pub backend: WarehouseBackendKind,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub columns: Vec<ColumnSpec>,
}

/// A warehouse column the committed payload must satisfy.
#[derive(Debug, Clone, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: FieldType,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackendKind {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StateConfig {
    #[serde(default)]
    pub backend: StateBackendKind,
    /// State database file. Defaults to `~/.tidewater/state.db`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Parse a human-readable byte size (`"64mb"`, `"512KB"`, `"1g"`, `"4096"`).
///
/// # Errors
///
/// Returns a description of the problem when the string is not a size.
pub fn parse_byte_size(input: &str) -> Result<u64, String> {
    let s = input.trim().to_ascii_lowercase();
    if s.is_empty() {
        return Err("byte size must not be empty".to_string());
    }
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid byte size '{input}'"))?;
    let multiplier: u64 = match unit.trim() {
        "" | "b" => 1,
        "k" | "kb" => 1024,
        "m" | "mb" => 1024 * 1024,
        "g" | "gb" => 1024 * 1024 * 1024,
        other => return Err(format!("unknown byte size unit '{other}' in '{input}'")),
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("byte size '{input}' overflows"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_byte_size() {
        assert_eq!(parse_byte_size("64mb").unwrap(), 64 * 1024 * 1024);
        assert_eq!(parse_byte_size("512KB").unwrap(), 512 * 1024);
        assert_eq!(parse_byte_size("1g").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_byte_size("4096").unwrap(), 4096);
        assert_eq!(parse_byte_size(" 10 b ").unwrap(), 10);
        assert!(parse_byte_size("").is_err());
        assert!(parse_byte_size("mb").is_err());
        assert!(parse_byte_size("10tb").is_err());
    }

    #[test]
    fn test_field_type_matches() {
        assert!(FieldType::Integer.matches(&serde_json::json!(42)));
        assert!(!FieldType::Integer.matches(&serde_json::json!(4.2)));
        assert!(FieldType::Number.matches(&serde_json::json!(4.2)));
        assert!(FieldType::Datetime.matches(&serde_json::json!("2024-01-15T10:00:00Z")));
        assert!(!FieldType::Datetime.matches(&serde_json::json!("yesterday")));
        assert!(FieldType::Array.matches(&serde_json::json!([1])));
    }

    #[test]
    fn test_defaults_when_sections_omitted() {
        let config: PipelineConfig =
            serde_yaml::from_str("version: \"1.0\"\npipeline: p\n").unwrap();
        assert!(config.sources.is_empty());
        assert_eq!(config.buffer.lanes, 4);
        assert_eq!(config.buffer.max_bytes, "64mb");
        assert_eq!(config.processing.batch_size, 500);
        assert_eq!(config.processing.max_attempts, 3);
        assert_eq!(config.processing.commit_retries, 5);
        assert!(config.transform.cleaning.trim_strings);
        assert!(config.transform.enrichment.metadata);
        assert_eq!(config.warehouse.backend, WarehouseBackendKind::Sqlite);
        assert_eq!(config.state.backend, StateBackendKind::Sqlite);
    }

    #[test]
    fn test_rule_selectors_deserialize() {
        let yaml = r#"
- assert_not_null: id
- assert_not_null: [id, amount]
- assert_regex: { field: email, pattern: "^.+@.+$" }
- assert_regex: { sku: "^[A-Z]{3}-\\d+$" }
- assert_range: { field: amount, min: 0 }
- assert_reference: { field: country, table: countries }
"#;
        let rules: Vec<RuleSpec> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rules.len(), 6);
        assert!(matches!(rules[1], RuleSpec::NotNull { assert_not_null: FieldSelector::Many(_) }));
        assert!(matches!(rules[3], RuleSpec::Regex { assert_regex: RegexSelector::Map(_) }));
        assert!(matches!(rules[5], RuleSpec::Reference { .. }));
    }

    #[test]
    fn test_reference_tables_keys_and_rows() {
        let yaml = r#"
countries: [US, DE]
regions:
  US: { region: NA }
  DE: { region: EU }
"#;
        let refs: BTreeMap<String, ReferenceTable> = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(refs["countries"], ReferenceTable::Keys(ref k) if k.len() == 2));
        assert!(matches!(refs["regions"], ReferenceTable::Rows(ref r) if r["DE"]["region"] == "EU"));
    }

    #[test]
    fn test_backoff_policy_from_processing() {
        let processing = ProcessingConfig {
            backoff: BackoffConfig {
                base_ms: 5,
                max_ms: 50,
            },
            ..ProcessingConfig::default()
        };
        let policy = processing.backoff_policy();
        assert_eq!(policy.base, Duration::from_millis(5));
        assert_eq!(policy.max, Duration::from_millis(50));
    }
}
