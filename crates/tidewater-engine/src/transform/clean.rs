//! Cleaning: rename, drop, trim, coerce, default.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{Map, Number, Value};
use tidewater_types::error::StageError;

use crate::config::types::{CleaningConfig, FieldSpec, FieldType};
use crate::transform::Failure;

/// Apply every cleaning step in place.
///
/// A value that cannot be coerced to its declared type rejects the record.
pub(crate) fn clean(
    payload: &mut Map<String, Value>,
    config: &CleaningConfig,
    schema: &[FieldSpec],
) -> Result<(), Failure> {
    for (from, to) in &config.rename {
        if let Some(value) = payload.remove(from) {
            payload.insert(to.clone(), value);
        }
    }

    for field in &config.drop_fields {
        payload.remove(field);
    }

    if config.trim_strings {
        for value in payload.values_mut() {
            if let Value::String(s) = value {
                let trimmed = s.trim();
                if trimmed.len() != s.len() {
                    *s = trimmed.to_string();
                }
            }
        }
    }

    if config.coerce_types {
        for spec in schema {
            let Some(value) = payload.get_mut(&spec.name) else {
                continue;
            };
            match coerce(value, spec.field_type) {
                Ok(Some(coerced)) => *value = coerced,
                Ok(None) => {}
                Err(message) => {
                    return Err(Failure::Reject(
                        StageError::validation("COERCION_FAILED", message)
                            .with_details(serde_json::json!({ "field": spec.name })),
                    ));
                }
            }
        }
    }

    for spec in schema {
        if let Some(default) = &spec.default {
            fill_default(payload, &spec.name, default);
        }
    }
    for (field, default) in &config.defaults {
        fill_default(payload, field, default);
    }

    Ok(())
}

fn fill_default(payload: &mut Map<String, Value>, field: &str, default: &Value) {
    match payload.get(field) {
        None | Some(Value::Null) => {
            payload.insert(field.to_string(), default.clone());
        }
        Some(_) => {}
    }
}

/// Coerce one value. `Ok(None)` leaves it untouched.
fn coerce(value: &Value, target: FieldType) -> Result<Option<Value>, String> {
    if let (FieldType::Datetime, Value::String(s)) = (target, value) {
        // Valid RFC 3339 with a non-UTC offset still needs normalizing.
        if target.matches(value) {
            return Ok(parse_datetime(s)
                .filter(|utc| utc != s)
                .map(Value::String));
        }
    }
    if target.matches(value) || value.is_null() {
        return Ok(None);
    }
    if let Value::String(s) = value {
        if s.is_empty() && target != FieldType::String {
            return Ok(Some(Value::Null));
        }
    }

    let coerced = match (target, value) {
        (FieldType::String, Value::Number(n)) => Some(Value::String(n.to_string())),
        (FieldType::String, Value::Bool(b)) => Some(Value::String(b.to_string())),
        (FieldType::Integer, Value::Number(n)) => n
            .as_f64()
            .filter(|f| f.fract() == 0.0 && f.abs() < 9.007_199_254_740_992e15)
            .map(|f| {
                #[allow(clippy::cast_possible_truncation)]
                let whole = f as i64;
                Value::from(whole)
            }),
        (FieldType::Integer, Value::String(s)) => s.parse::<i64>().ok().map(Value::from),
        (FieldType::Number, Value::String(s)) => s
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number),
        (FieldType::Boolean, Value::String(s)) => match s.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(Value::Bool(true)),
            "false" | "0" | "no" => Some(Value::Bool(false)),
            _ => None,
        },
        (FieldType::Boolean, Value::Number(n)) => match n.as_i64() {
            Some(1) => Some(Value::Bool(true)),
            Some(0) => Some(Value::Bool(false)),
            _ => None,
        },
        (FieldType::Datetime, Value::String(s)) => parse_datetime(s).map(Value::String),
        (FieldType::Datetime, Value::Number(n)) => n
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .map(|dt| Value::String(dt.to_rfc3339_opts(SecondsFormat::Secs, true))),
        _ => None,
    };

    coerced
        .map(Some)
        .ok_or_else(|| format!("cannot coerce {value} to {target}"))
}

/// Normalize common datetime spellings to UTC RFC 3339.
fn parse_datetime(s: &str) -> Option<String> {
    let utc = if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        dt.with_timezone(&Utc)
    } else if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        naive.and_utc()
    } else if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        date.and_hms_opt(0, 0, 0)?.and_utc()
    } else {
        return None;
    };
    Some(utc.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(yaml: &str) -> Vec<FieldSpec> {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn rename_drop_and_trim() {
        let config: CleaningConfig = serde_yaml::from_str(
            "rename: { cust: customer }\ndrop_fields: [internal]\n",
        )
        .unwrap();
        let mut payload = object(serde_json::json!({
            "cust": "  acme ",
            "internal": "x",
            "keep": " y",
        }));
        clean(&mut payload, &config, &[]).unwrap();
        assert_eq!(
            Value::Object(payload),
            serde_json::json!({"customer": "acme", "keep": "y"})
        );
    }

    #[test]
    fn coerces_to_declared_types() {
        let schema = schema(
            r"
- { name: id, type: integer }
- { name: amount, type: number }
- { name: paid, type: boolean }
- { name: at, type: datetime }
- { name: label, type: string }
- { name: blank, type: integer, required: false }
",
        );
        let mut payload = object(serde_json::json!({
            "id": " 42 ",
            "amount": "19.5",
            "paid": "yes",
            "at": "2024-01-15 10:30:00",
            "label": 7,
            "blank": "",
        }));
        clean(&mut payload, &CleaningConfig::default(), &schema).unwrap();
        assert_eq!(payload["id"], 42);
        assert_eq!(payload["amount"], 19.5);
        assert_eq!(payload["paid"], true);
        assert_eq!(payload["at"], "2024-01-15T10:30:00Z");
        assert_eq!(payload["label"], "7");
        assert!(payload["blank"].is_null());
    }

    #[test]
    fn datetime_spellings_normalize_to_utc() {
        assert_eq!(parse_datetime("2024-01-15").as_deref(), Some("2024-01-15T00:00:00Z"));
        assert_eq!(
            parse_datetime("2024-01-15T12:00:00+02:00").as_deref(),
            Some("2024-01-15T10:00:00Z")
        );
        assert!(parse_datetime("last tuesday").is_none());
        assert_eq!(
            coerce(&serde_json::json!(0), FieldType::Datetime).unwrap(),
            Some(serde_json::json!("1970-01-01T00:00:00Z"))
        );
    }

    #[test]
    fn offset_datetime_is_rewritten_to_utc() {
        assert_eq!(
            coerce(&serde_json::json!("2024-01-15T12:00:00+02:00"), FieldType::Datetime).unwrap(),
            Some(serde_json::json!("2024-01-15T10:00:00Z"))
        );
        assert_eq!(
            coerce(&serde_json::json!("2024-01-15T10:00:00.250Z"), FieldType::Datetime).unwrap(),
            None
        );

        let schema = schema("- { name: at, type: datetime }\n");
        let mut payload = object(serde_json::json!({ "at": "2024-01-15T01:30:00-05:00" }));
        clean(&mut payload, &CleaningConfig::default(), &schema).unwrap();
        assert_eq!(payload["at"], "2024-01-15T06:30:00Z");
    }

    #[test]
    fn integer_from_whole_float_only() {
        assert_eq!(
            coerce(&serde_json::json!(3.0), FieldType::Integer).unwrap(),
            Some(serde_json::json!(3))
        );
        assert!(coerce(&serde_json::json!(3.5), FieldType::Integer).is_err());
    }

    #[test]
    fn failed_coercion_rejects() {
        let schema = schema("- { name: id, type: integer }\n");
        let mut payload = object(serde_json::json!({"id": "abc"}));
        let err = clean(&mut payload, &CleaningConfig::default(), &schema).unwrap_err();
        match err {
            Failure::Reject(e) => {
                assert_eq!(e.code, "COERCION_FAILED");
                assert!(e.message.contains("cannot coerce \"abc\" to integer"));
            }
            Failure::Fault(e) => panic!("unexpected fault: {e}"),
        }
    }

    #[test]
    fn defaults_fill_missing_and_null() {
        let schema = schema("- { name: amount, type: number, default: 0 }\n");
        let config: CleaningConfig =
            serde_yaml::from_str("defaults: { currency: USD, amount: 99 }\n").unwrap();
        let mut payload = object(serde_json::json!({"amount": null}));
        clean(&mut payload, &config, &schema).unwrap();
        assert_eq!(payload["amount"], 0);
        assert_eq!(payload["currency"], "USD");
    }

    #[test]
    fn coercion_can_be_disabled() {
        let schema = schema("- { name: id, type: integer }\n");
        let config: CleaningConfig = serde_yaml::from_str("coerce_types: false\n").unwrap();
        let mut payload = object(serde_json::json!({"id": "42"}));
        clean(&mut payload, &config, &schema).unwrap();
        assert_eq!(payload["id"], "42");
    }
}
