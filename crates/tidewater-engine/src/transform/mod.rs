//! Transformation engine: validation, cleaning and enrichment.
//!
//! [`Transformer`] holds only compiled, read-only configuration and is
//! shared across lane workers behind an `Arc`.

pub mod clean;
pub mod enrich;
pub mod lookup;
pub mod rules;

use std::sync::Arc;

use serde_json::{Map, Value};
use tidewater_types::error::StageError;
use tidewater_types::record::{Payload, Record};
use tidewater_types::result::{Attempt, ProcessingResult};

use crate::config::types::TransformConfig;
use crate::transform::lookup::ReferenceLookup;
use crate::transform::rules::CompiledRules;

/// Why a single transform attempt did not produce a record.
#[derive(Debug)]
pub(crate) enum Failure {
    /// Permanent; never retried.
    Reject(StageError),
    /// Transient; retried up to the attempt ceiling.
    Fault(StageError),
}

pub struct Transformer {
    config: TransformConfig,
    rules: CompiledRules,
    lookup: Arc<dyn ReferenceLookup>,
    max_attempts: u32,
}

impl std::fmt::Debug for Transformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transformer")
            .field("rules", &self.rules.rules.len())
            .field("schema", &self.rules.schema.len())
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl Transformer {
    /// Compile a transformer.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid rule.
    pub fn from_config(
        config: &TransformConfig,
        lookup: Arc<dyn ReferenceLookup>,
        max_attempts: u32,
    ) -> Result<Self, String> {
        let rules = CompiledRules::compile(config)?;
        Ok(Self {
            config: config.clone(),
            rules,
            lookup,
            max_attempts: max_attempts.max(1),
        })
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Transform one record.
    ///
    /// `attempts` is the history returned by an earlier `Retryable` result
    /// for the same record, or empty on first delivery.
    #[must_use]
    pub fn transform(&self, record: Record, mut attempts: Vec<Attempt>) -> ProcessingResult {
        match self.apply(&record) {
            Ok(payload) => ProcessingResult::Accepted(record.with_payload(payload)),
            Err(Failure::Reject(reason)) => ProcessingResult::Rejected {
                record,
                reason,
                attempts,
            },
            Err(Failure::Fault(error)) => {
                let number = u32::try_from(attempts.len()).unwrap_or(u32::MAX).saturating_add(1);
                attempts.push(Attempt::from_error(number, &error, crate::now()));
                if number >= self.max_attempts {
                    let mut reason = StageError::transient(
                        "RETRIES_EXHAUSTED",
                        format!("gave up after {number} attempts: {}", error.message),
                    );
                    reason.retryable = false;
                    ProcessingResult::Rejected {
                        record,
                        reason,
                        attempts,
                    }
                } else {
                    ProcessingResult::Retryable {
                        record,
                        error,
                        attempts,
                    }
                }
            }
        }
    }

    fn apply(&self, record: &Record) -> Result<Payload, Failure> {
        let value: Value = record.payload().to_json().map_err(|e| {
            Failure::Reject(StageError::schema(
                "INVALID_JSON",
                format!("payload is not valid JSON: {e}"),
            ))
        })?;
        let Value::Object(mut payload) = value else {
            return Err(Failure::Reject(StageError::schema(
                "NOT_AN_OBJECT",
                "payload must be a JSON object",
            )));
        };

        clean::clean(&mut payload, &self.config.cleaning, &self.rules.schema)?;
        self.rules.check_schema(&payload)?;
        self.rules.check(&payload, self.lookup.as_ref())?;
        enrich::enrich(
            &mut payload,
            record,
            &self.config.enrichment,
            self.lookup.as_ref(),
        )?;

        encode(&payload)
    }
}

fn encode(payload: &Map<String, Value>) -> Result<Payload, Failure> {
    Payload::from_json(payload).map_err(|e| {
        Failure::Reject(StageError::internal(
            "ENCODE_FAILED",
            format!("cannot serialize transformed payload: {e}"),
        ))
    })
}
