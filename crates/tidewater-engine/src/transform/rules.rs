//! Rule compilation and per-record evaluation.

use regex::Regex;
use serde_json::{Map, Number, Value};
use tidewater_types::error::StageError;

use crate::config::types::{
    FieldSelector, FieldSpec, RangeSelector, ReferenceSelector, RegexSelector, RuleSpec,
    TransformConfig,
};
use crate::transform::lookup::{key_of, LookupError, ReferenceLookup};
use crate::transform::Failure;

#[derive(Debug, Clone)]
pub enum CompiledRule {
    NotNull {
        field: String,
    },
    Regex {
        field: String,
        pattern: String,
        regex: Regex,
    },
    Range {
        field: String,
        min: Option<NumericBound>,
        max: Option<NumericBound>,
    },
    Reference {
        field: String,
        table: String,
    },
}

#[derive(Debug, Clone)]
pub struct NumericBound {
    pub literal: String,
    pub value: f64,
}

/// One failed assertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleFailure {
    pub rule: &'static str,
    pub field: String,
    pub message: String,
}

/// Schema and rules, compiled once and shared read-only.
#[derive(Debug, Clone, Default)]
pub struct CompiledRules {
    pub schema: Vec<FieldSpec>,
    pub rules: Vec<CompiledRule>,
}

impl CompiledRules {
    /// Compile the rule section of a transform configuration.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid rule.
    pub fn compile(config: &TransformConfig) -> Result<Self, String> {
        let known_table = |table: &str| -> Result<(), String> {
            if config.references.contains_key(table) {
                Ok(())
            } else {
                Err(format!("unknown reference table '{table}'"))
            }
        };

        let mut compiled = Vec::new();
        for rule in &config.rules {
            match rule {
                RuleSpec::NotNull { assert_not_null } => {
                    assert_not_null.try_for_each_field(|field| {
                        compiled.push(CompiledRule::NotNull {
                            field: field.to_string(),
                        });
                        Ok(())
                    })?;
                }
                RuleSpec::Regex { assert_regex } => {
                    assert_regex.try_for_each_rule(|field, pattern| {
                        if pattern.trim().is_empty() {
                            return Err(format!(
                                "regex pattern for field '{field}' must not be empty"
                            ));
                        }
                        let regex = Regex::new(pattern)
                            .map_err(|e| format!("invalid regex pattern for field '{field}': {e}"))?;
                        compiled.push(CompiledRule::Regex {
                            field: field.to_string(),
                            pattern: pattern.to_string(),
                            regex,
                        });
                        Ok(())
                    })?;
                }
                RuleSpec::Range { assert_range } => {
                    assert_range.try_for_each_rule(|field, min, max| {
                        if min.is_none() && max.is_none() {
                            return Err(format!(
                                "range rule for field '{field}' must set min and/or max"
                            ));
                        }
                        let min_bound = min
                            .map(|bound| NumericBound::from_number(bound, field, "min"))
                            .transpose()?;
                        let max_bound = max
                            .map(|bound| NumericBound::from_number(bound, field, "max"))
                            .transpose()?;
                        if let (Some(minimum), Some(maximum)) = (&min_bound, &max_bound) {
                            if minimum.value > maximum.value {
                                return Err(format!(
                                    "range rule for field '{field}' has min > max ({} > {})",
                                    minimum.literal, maximum.literal
                                ));
                            }
                        }
                        compiled.push(CompiledRule::Range {
                            field: field.to_string(),
                            min: min_bound,
                            max: max_bound,
                        });
                        Ok(())
                    })?;
                }
                RuleSpec::Reference { assert_reference } => {
                    assert_reference.try_for_each_rule(|field, table| {
                        known_table(table)?;
                        compiled.push(CompiledRule::Reference {
                            field: field.to_string(),
                            table: table.to_string(),
                        });
                        Ok(())
                    })?;
                }
            }
        }

        for lookup in &config.enrichment.lookups {
            ensure_non_empty_field(&lookup.field)?;
            known_table(&lookup.table)?;
        }
        for field in &config.schema {
            ensure_non_empty_field(&field.name)?;
        }

        Ok(Self {
            schema: config.schema.clone(),
            rules: compiled,
        })
    }

    /// Check declared field presence and types.
    pub(crate) fn check_schema(&self, payload: &Map<String, Value>) -> Result<(), Failure> {
        let mut failures = Vec::new();
        for spec in &self.schema {
            match payload.get(&spec.name) {
                None | Some(Value::Null) if spec.required => failures.push(RuleFailure {
                    rule: "schema",
                    field: spec.name.clone(),
                    message: format!("required field '{}' is missing", spec.name),
                }),
                None | Some(Value::Null) => {}
                Some(value) if !spec.field_type.matches(value) => failures.push(RuleFailure {
                    rule: "schema",
                    field: spec.name.clone(),
                    message: format!(
                        "field '{}' expected {}, got {}",
                        spec.name,
                        spec.field_type,
                        json_type(value)
                    ),
                }),
                Some(_) => {}
            }
        }
        reject_if_any(failures, |first| StageError::schema("SCHEMA_MISMATCH", first))
    }

    /// Evaluate every assertion against a cleaned payload.
    ///
    /// Rule failures reject; an unavailable reference table is a fault.
    pub(crate) fn check(
        &self,
        payload: &Map<String, Value>,
        lookup: &dyn ReferenceLookup,
    ) -> Result<(), Failure> {
        let mut failures = Vec::new();
        let mut reference_failure = false;

        for rule in &self.rules {
            let failure = match rule {
                CompiledRule::NotNull { field } => check_not_null(payload, field),
                CompiledRule::Regex {
                    field,
                    pattern,
                    regex,
                } => check_regex(payload, field, pattern, regex),
                CompiledRule::Range { field, min, max } => {
                    check_range(payload, field, min.as_ref(), max.as_ref())
                }
                CompiledRule::Reference { field, table } => {
                    let failure = check_reference(payload, field, table, lookup)?;
                    reference_failure |= failure.is_some();
                    failure
                }
            };
            failures.extend(failure);
        }

        if reference_failure && failures.iter().all(|f| f.rule == "reference") {
            return reject_if_any(failures, |first| StageError::reference("UNKNOWN_KEY", first));
        }
        reject_if_any(failures, |first| StageError::validation("RULE_FAILED", first))
    }
}

fn reject_if_any(
    failures: Vec<RuleFailure>,
    build: impl FnOnce(String) -> StageError,
) -> Result<(), Failure> {
    let Some(first) = failures.first() else {
        return Ok(());
    };
    let details: Vec<Value> = failures
        .iter()
        .map(|f| serde_json::json!({"rule": f.rule, "field": f.field, "message": f.message}))
        .collect();
    let message = if failures.len() == 1 {
        first.message.clone()
    } else {
        format!("{} (and {} more)", first.message, failures.len() - 1)
    };
    Err(Failure::Reject(
        build(message).with_details(serde_json::json!({ "failures": details })),
    ))
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn check_not_null(payload: &Map<String, Value>, field: &str) -> Option<RuleFailure> {
    let message = match payload.get(field) {
        None => format!("assert_not_null({field}) failed: field missing"),
        Some(Value::Null) => format!("assert_not_null({field}) failed: value is null"),
        Some(_) => return None,
    };
    Some(RuleFailure {
        rule: "not_null",
        field: field.to_string(),
        message,
    })
}

fn check_regex(
    payload: &Map<String, Value>,
    field: &str,
    pattern: &str,
    regex: &Regex,
) -> Option<RuleFailure> {
    let message = match payload.get(field) {
        None => format!("assert_regex({field}, {pattern}) failed: field missing"),
        Some(Value::Null) => format!("assert_regex({field}, {pattern}) failed: value is null"),
        Some(Value::String(value)) if regex.is_match(value) => return None,
        Some(Value::String(value)) => {
            format!("assert_regex({field}, {pattern}) failed: value '{value}' does not match")
        }
        Some(_) => format!("assert_regex({field}, {pattern}) failed: field is not string"),
    };
    Some(RuleFailure {
        rule: "regex",
        field: field.to_string(),
        message,
    })
}

fn check_range(
    payload: &Map<String, Value>,
    field: &str,
    min: Option<&NumericBound>,
    max: Option<&NumericBound>,
) -> Option<RuleFailure> {
    let message = match payload.get(field) {
        None => format!("assert_range({field}) failed: field missing"),
        Some(Value::Null) => format!("assert_range({field}) failed: value is null"),
        Some(Value::Number(number)) => {
            let value = number.as_f64()?;
            let below = min.is_some_and(|bound| value < bound.value);
            let above = max.is_some_and(|bound| value > bound.value);
            if !below && !above {
                return None;
            }
            format!(
                "assert_range({field}) failed: value {number} outside bounds [{}, {}]",
                min.map_or("-inf", |b| b.literal.as_str()),
                max.map_or("+inf", |b| b.literal.as_str()),
            )
        }
        Some(_) => format!("assert_range({field}) failed: field is not numeric"),
    };
    Some(RuleFailure {
        rule: "range",
        field: field.to_string(),
        message,
    })
}

fn check_reference(
    payload: &Map<String, Value>,
    field: &str,
    table: &str,
    lookup: &dyn ReferenceLookup,
) -> Result<Option<RuleFailure>, Failure> {
    let Some(key) = payload.get(field).and_then(key_of) else {
        return Ok(Some(RuleFailure {
            rule: "reference",
            field: field.to_string(),
            message: format!("assert_reference({field}, {table}) failed: no scalar key"),
        }));
    };
    match lookup.contains(table, &key) {
        Ok(true) => Ok(None),
        Ok(false) => Ok(Some(RuleFailure {
            rule: "reference",
            field: field.to_string(),
            message: format!("assert_reference({field}, {table}) failed: '{key}' not found"),
        })),
        Err(err) => Err(lookup_failure(&err)),
    }
}

/// Map a lookup error onto the retry taxonomy.
pub(crate) fn lookup_failure(err: &LookupError) -> Failure {
    match err {
        LookupError::Unavailable { table, .. } => Failure::Fault(
            StageError::transient("LOOKUP_UNAVAILABLE", err.to_string())
                .with_details(serde_json::json!({ "table": table })),
        ),
        LookupError::UnknownTable(_) => {
            Failure::Reject(StageError::reference("UNKNOWN_TABLE", err.to_string()))
        }
    }
}

fn ensure_non_empty_field(field: &str) -> Result<(), String> {
    if field.trim().is_empty() {
        Err("field name must not be empty".to_string())
    } else {
        Ok(())
    }
}

impl FieldSelector {
    fn try_for_each_field(
        &self,
        mut callback: impl FnMut(&str) -> Result<(), String>,
    ) -> Result<(), String> {
        match self {
            Self::One(field) => {
                ensure_non_empty_field(field)?;
                callback(field)
            }
            Self::Many(fields) => {
                for field in fields {
                    ensure_non_empty_field(field)?;
                    callback(field)?;
                }
                Ok(())
            }
        }
    }
}

impl RegexSelector {
    fn try_for_each_rule(
        &self,
        mut callback: impl FnMut(&str, &str) -> Result<(), String>,
    ) -> Result<(), String> {
        let pairs: Vec<(&str, &str)> = match self {
            Self::One(rule) => vec![(rule.field.as_str(), rule.pattern.as_str())],
            Self::Many(rules) => rules
                .iter()
                .map(|r| (r.field.as_str(), r.pattern.as_str()))
                .collect(),
            Self::Map(map) => map.iter().map(|(f, p)| (f.as_str(), p.as_str())).collect(),
        };
        for (field, pattern) in pairs {
            ensure_non_empty_field(field)?;
            callback(field, pattern)?;
        }
        Ok(())
    }
}

impl RangeSelector {
    fn try_for_each_rule(
        &self,
        mut callback: impl FnMut(&str, Option<&Number>, Option<&Number>) -> Result<(), String>,
    ) -> Result<(), String> {
        let rules = match self {
            Self::One(rule) => std::slice::from_ref(rule),
            Self::Many(rules) => rules.as_slice(),
        };
        for rule in rules {
            ensure_non_empty_field(&rule.field)?;
            callback(&rule.field, rule.min.as_ref(), rule.max.as_ref())?;
        }
        Ok(())
    }
}

impl ReferenceSelector {
    fn try_for_each_rule(
        &self,
        mut callback: impl FnMut(&str, &str) -> Result<(), String>,
    ) -> Result<(), String> {
        let rules = match self {
            Self::One(rule) => std::slice::from_ref(rule),
            Self::Many(rules) => rules.as_slice(),
        };
        for rule in rules {
            ensure_non_empty_field(&rule.field)?;
            callback(&rule.field, &rule.table)?;
        }
        Ok(())
    }
}

impl NumericBound {
    fn from_number(number: &Number, field: &str, bound_name: &str) -> Result<Self, String> {
        let literal = number.to_string();
        let value = number.as_f64().ok_or_else(|| {
            format!("range rule for field '{field}' has non-numeric {bound_name} value '{literal}'")
        })?;
        if !value.is_finite() {
            return Err(format!(
                "range rule for field '{field}' has non-finite {bound_name} value '{literal}'"
            ));
        }
        Ok(Self { literal, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::lookup::StaticReferences;

    fn config(yaml: &str) -> TransformConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn payload(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    fn rejection(result: Result<(), Failure>) -> StageError {
        match result {
            Err(Failure::Reject(err)) => err,
            Err(Failure::Fault(err)) => panic!("expected rejection, got fault: {err}"),
            Ok(()) => panic!("expected rejection, got pass"),
        }
    }

    #[test]
    fn compile_expands_selectors() {
        let rules = CompiledRules::compile(&config(
            r#"
rules:
  - assert_not_null: [id, amount]
  - assert_regex: { email: "^.+@.+$", sku: "^[A-Z]+$" }
  - assert_range: [{ field: amount, min: 0 }, { field: qty, max: 10 }]
"#,
        ))
        .unwrap();
        assert_eq!(rules.rules.len(), 6);
    }

    #[test]
    fn compile_rejects_bad_rules() {
        let err = CompiledRules::compile(&config("rules:\n  - assert_range: { field: a }\n"))
            .unwrap_err();
        assert!(err.contains("must set min and/or max"));

        let err = CompiledRules::compile(&config(
            "rules:\n  - assert_range: { field: a, min: 5, max: 1 }\n",
        ))
        .unwrap_err();
        assert!(err.contains("min > max (5 > 1)"));

        let err = CompiledRules::compile(&config("rules:\n  - assert_not_null: \"  \"\n"))
            .unwrap_err();
        assert!(err.contains("field name must not be empty"));

        let err = CompiledRules::compile(&config(
            "enrichment:\n  lookups: [{ field: country, table: regions }]\n",
        ))
        .unwrap_err();
        assert!(err.contains("unknown reference table 'regions'"));
    }

    #[test]
    fn schema_reports_missing_and_mistyped_fields() {
        let rules = CompiledRules::compile(&config(
            r"
schema:
  - { name: id, type: integer }
  - { name: note, type: string, required: false }
  - { name: amount, type: number }
",
        ))
        .unwrap();

        rules.check_schema(&payload(serde_json::json!({"id": 1, "amount": 2.5}))).unwrap();

        let err = rejection(rules.check_schema(&payload(serde_json::json!({"id": "x"}))));
        assert_eq!(err.code, "SCHEMA_MISMATCH");
        assert!(err.message.contains("field 'id' expected integer, got string"));
        assert!(err.message.contains("(and 1 more)"));
        assert_eq!(err.details.unwrap()["failures"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn not_null_regex_and_range() {
        let rules = CompiledRules::compile(&config(
            r#"
rules:
  - assert_not_null: id
  - assert_regex: { field: sku, pattern: "^[A-Z]{3}-\\d+$" }
  - assert_range: { field: amount, min: 0, max: 1000 }
"#,
        ))
        .unwrap();
        let refs = StaticReferences::default();

        rules
            .check(&payload(serde_json::json!({"id": 1, "sku": "ABC-1", "amount": 10})), &refs)
            .unwrap();

        let err = rejection(rules.check(
            &payload(serde_json::json!({"id": null, "sku": "ABC-1", "amount": 10})),
            &refs,
        ));
        assert!(err.message.contains("assert_not_null(id) failed: value is null"));

        let err = rejection(rules.check(
            &payload(serde_json::json!({"id": 1, "sku": "abc", "amount": 10})),
            &refs,
        ));
        assert!(err.message.contains("does not match"));

        let err = rejection(rules.check(
            &payload(serde_json::json!({"id": 1, "sku": "ABC-1", "amount": -1})),
            &refs,
        ));
        assert_eq!(err.code, "RULE_FAILED");
        assert!(err.message.contains("assert_range(amount) failed: value -1 outside bounds [0, 1000]"));
    }

    #[test]
    fn reference_rule_uses_lookup() {
        let cfg = config(
            r"
rules:
  - assert_reference: { field: country, table: countries }
references:
  countries: [US, DE]
",
        );
        let rules = CompiledRules::compile(&cfg).unwrap();
        let refs = StaticReferences::from_config(&cfg.references);

        rules.check(&payload(serde_json::json!({"country": "US"})), &refs).unwrap();
        let err = rejection(rules.check(&payload(serde_json::json!({"country": "XX"})), &refs));
        assert_eq!(err.category, tidewater_types::error::ErrorCategory::Reference);
        assert!(err.message.contains("'XX' not found"));
    }

    struct DownLookup;

    impl ReferenceLookup for DownLookup {
        fn contains(&self, table: &str, _key: &str) -> Result<bool, LookupError> {
            Err(LookupError::Unavailable {
                table: table.to_string(),
                reason: "connection refused".into(),
            })
        }

        fn row(&self, table: &str, key: &str) -> Result<Option<Map<String, Value>>, LookupError> {
            self.contains(table, key).map(|_| None)
        }
    }

    #[test]
    fn unavailable_lookup_is_a_fault() {
        let cfg = config(
            "rules:\n  - assert_reference: { field: country, table: countries }\nreferences:\n  countries: [US]\n",
        );
        let rules = CompiledRules::compile(&cfg).unwrap();
        let result = rules.check(&payload(serde_json::json!({"country": "US"})), &DownLookup);
        assert!(matches!(result, Err(Failure::Fault(ref e)) if e.retryable));
    }
}
