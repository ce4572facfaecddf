//! Enrichment: ingestion metadata and reference lookups.

use serde_json::{Map, Value};
use tidewater_types::error::StageError;
use tidewater_types::record::Record;

use crate::config::types::EnrichmentConfig;
use crate::transform::lookup::{key_of, ReferenceLookup};
use crate::transform::rules::lookup_failure;
use crate::transform::Failure;

pub(crate) const METADATA_FIELD: &str = "_metadata";

pub(crate) fn enrich(
    payload: &mut Map<String, Value>,
    record: &Record,
    config: &EnrichmentConfig,
    lookup: &dyn ReferenceLookup,
) -> Result<(), Failure> {
    for spec in &config.lookups {
        let key = payload.get(&spec.field).and_then(key_of);
        let row = match key {
            Some(ref key) => lookup.row(&spec.table, key).map_err(|e| lookup_failure(&e))?,
            None => None,
        };
        match row {
            Some(row) => {
                payload.insert(spec.target().to_string(), Value::Object(row));
            }
            None if spec.required => {
                return Err(Failure::Reject(
                    StageError::reference(
                        "LOOKUP_MISS",
                        format!(
                            "lookup({}, {}) failed: no row for {}",
                            spec.field,
                            spec.table,
                            key.map_or_else(|| "missing key".to_string(), |k| format!("'{k}'")),
                        ),
                    )
                    .with_details(serde_json::json!({ "field": spec.field, "table": spec.table })),
                ));
            }
            None => {}
        }
    }

    if config.metadata {
        let mut metadata = Map::new();
        metadata.insert("source".into(), Value::from(record.source().as_str()));
        metadata.insert("offset".into(), Value::from(record.offset().get()));
        metadata.insert(
            "ingested_at".into(),
            Value::from(record.ingested_at().as_str()),
        );
        if !config.tags.is_empty() {
            let tags = config
                .tags
                .iter()
                .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
                .collect();
            metadata.insert("tags".into(), Value::Object(tags));
        }
        payload.insert(METADATA_FIELD.to_string(), Value::Object(metadata));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::lookup::StaticReferences;
    use tidewater_types::record::{Offset, SourceId, Timestamp};

    fn record() -> Record {
        Record::new(
            SourceId::new("orders"),
            Offset::new(7),
            "{}",
            Timestamp::new("2024-01-15T10:00:00Z"),
        )
    }

    fn refs() -> StaticReferences {
        let yaml = "regions:\n  US: { region: NA }\n";
        StaticReferences::from_config(&serde_yaml::from_str(yaml).unwrap())
    }

    #[test]
    fn metadata_and_tags_attached() {
        let config: EnrichmentConfig = serde_yaml::from_str("tags: { team: finance }\n").unwrap();
        let mut payload = Map::new();
        enrich(&mut payload, &record(), &config, &refs()).unwrap();
        assert_eq!(
            payload[METADATA_FIELD],
            serde_json::json!({
                "source": "orders",
                "offset": 7,
                "ingested_at": "2024-01-15T10:00:00Z",
                "tags": { "team": "finance" },
            })
        );
    }

    #[test]
    fn lookup_copies_row_into_target() {
        let config: EnrichmentConfig = serde_yaml::from_str(
            "metadata: false\nlookups: [{ field: country, table: regions, into: geo }]\n",
        )
        .unwrap();
        let mut payload = serde_json::json!({"country": "US"}).as_object().unwrap().clone();
        enrich(&mut payload, &record(), &config, &refs()).unwrap();
        assert_eq!(payload["geo"], serde_json::json!({"region": "NA"}));
        assert!(!payload.contains_key(METADATA_FIELD));
    }

    #[test]
    fn optional_lookup_miss_is_ignored_required_rejects() {
        let optional: EnrichmentConfig =
            serde_yaml::from_str("lookups: [{ field: country, table: regions }]\n").unwrap();
        let mut payload = serde_json::json!({"country": "FR"}).as_object().unwrap().clone();
        enrich(&mut payload, &record(), &optional, &refs()).unwrap();
        assert!(!payload.contains_key("regions"));

        let required: EnrichmentConfig = serde_yaml::from_str(
            "lookups: [{ field: country, table: regions, required: true }]\n",
        )
        .unwrap();
        match enrich(&mut payload, &record(), &required, &refs()) {
            Err(Failure::Reject(e)) => {
                assert_eq!(e.code, "LOOKUP_MISS");
                assert!(e.message.contains("no row for 'FR'"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}
