//! Dead-letter sink: durable capture and replay of rejected records.

use std::collections::VecDeque;
use std::sync::Arc;

use tidewater_state::backend::StoredDeadLetter;
use tidewater_state::{DeadLetterStore, StateBackend, StateError};
use tidewater_types::dead_letter::DeadLetterEntry;
use tidewater_types::error::StageError;
use tidewater_types::record::{Record, SourceId};
use tidewater_types::result::Attempt;
use tidewater_types::state::PipelineId;

use crate::error::PipelineError;

/// Entries fetched per page while replaying.
const REPLAY_PAGE_SIZE: usize = 256;

#[derive(Clone)]
pub struct DeadLetterSink {
    state: Arc<dyn StateBackend>,
    pipeline: PipelineId,
}

impl DeadLetterSink {
    #[must_use]
    pub fn new(state: Arc<dyn StateBackend>, pipeline: PipelineId) -> Self {
        Self { state, pipeline }
    }

    /// Persist one rejected record. Returns `false` when an entry for the
    /// same `(source, offset)` already exists.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Infrastructure` if the state store fails.
    pub async fn record_failure(
        &self,
        record: Record,
        reason: &StageError,
        attempts: Vec<Attempt>,
    ) -> Result<bool, PipelineError> {
        let entry = DeadLetterEntry::new(record, reason, attempts, crate::now());
        tracing::warn!(
            pipeline = self.pipeline.as_str(),
            source = %entry.record.source(),
            offset = entry.record.offset().get(),
            category = %entry.error_category,
            attempts = entry.attempts.len(),
            error = entry.error_message.as_str(),
            "Routing record to dead-letter sink"
        );

        let state = Arc::clone(&self.state);
        let pipeline = self.pipeline.clone();
        let inserted = tokio::task::spawn_blocking(move || state.append_dead_letter(&pipeline, &entry))
            .await
            .map_err(|e| PipelineError::task("dead-letter append", &e))?
            .map_err(|e| PipelineError::state("Failed to persist dead-letter entry", e))?;
        if !inserted {
            tracing::debug!(
                pipeline = self.pipeline.as_str(),
                "Dead-letter entry already present, skipped"
            );
        }
        Ok(inserted)
    }

    /// Up to `limit` entries for `source`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Infrastructure` if the state store fails.
    pub async fn list(
        &self,
        source: &SourceId,
        limit: usize,
    ) -> Result<Vec<StoredDeadLetter>, PipelineError> {
        let state = Arc::clone(&self.state);
        let pipeline = self.pipeline.clone();
        let source = source.clone();
        tokio::task::spawn_blocking(move || state.dead_letter_page(&pipeline, &source, 0, limit))
            .await
            .map_err(|e| PipelineError::task("dead-letter list", &e))?
            .map_err(|e| PipelineError::state("Failed to list dead-letter entries", e))
    }

    /// # Errors
    ///
    /// Returns `PipelineError::Infrastructure` if the state store fails.
    pub async fn count(&self, source: Option<&SourceId>) -> Result<u64, PipelineError> {
        let state = Arc::clone(&self.state);
        let pipeline = self.pipeline.clone();
        let source = source.cloned();
        tokio::task::spawn_blocking(move || state.dead_letter_count(&pipeline, source.as_ref()))
            .await
            .map_err(|e| PipelineError::task("dead-letter count", &e))?
            .map_err(|e| PipelineError::state("Failed to count dead-letter entries", e))
    }

    /// Lazy iterator over the original records of `source`.
    ///
    /// Performs blocking reads; drive it from `spawn_blocking`.
    #[must_use]
    pub fn replay(&self, source: &SourceId) -> DeadLetterReplay {
        DeadLetterReplay {
            state: Arc::clone(&self.state),
            pipeline: self.pipeline.clone(),
            source: source.clone(),
            after_id: 0,
            page: VecDeque::new(),
            done: false,
        }
    }
}

/// Paged, owned iterator returned by [`DeadLetterSink::replay`].
pub struct DeadLetterReplay {
    state: Arc<dyn StateBackend>,
    pipeline: PipelineId,
    source: SourceId,
    after_id: i64,
    page: VecDeque<StoredDeadLetter>,
    done: bool,
}

impl Iterator for DeadLetterReplay {
    type Item = Result<Record, StateError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.done {
            match self.state.dead_letter_page(
                &self.pipeline,
                &self.source,
                self.after_id,
                REPLAY_PAGE_SIZE,
            ) {
                Ok(page) => {
                    self.done = page.len() < REPLAY_PAGE_SIZE;
                    self.page = page.into();
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        let stored = self.page.pop_front()?;
        self.after_id = stored.id;
        Some(Ok(stored.entry.record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidewater_state::SqliteStateBackend;
    use tidewater_types::record::{Offset, Timestamp};

    fn rec(offset: u64) -> Record {
        Record::new(
            SourceId::new("orders"),
            Offset::new(offset),
            format!(r#"{{"id":{offset}}}"#).into_bytes(),
            Timestamp::new("2024-01-15T10:00:00Z"),
        )
    }

    fn sink() -> DeadLetterSink {
        DeadLetterSink::new(
            Arc::new(SqliteStateBackend::in_memory().unwrap()),
            PipelineId::new("orders_etl"),
        )
    }

    #[tokio::test]
    async fn record_failure_is_idempotent_per_offset() {
        let sink = sink();
        let reason = StageError::validation("RULE_FAILED", "amount < 0");
        assert!(sink.record_failure(rec(57), &reason, Vec::new()).await.unwrap());
        assert!(!sink.record_failure(rec(57), &reason, Vec::new()).await.unwrap());
        assert_eq!(sink.count(Some(&SourceId::new("orders"))).await.unwrap(), 1);

        let listed = sink.list(&SourceId::new("orders"), 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].entry.record.offset(), Offset::new(57));
        assert!(listed[0].entry.error_message.contains("amount < 0"));
    }

    #[tokio::test]
    async fn replay_pages_through_every_entry() {
        let sink = sink();
        let reason = StageError::validation("RULE_FAILED", "bad");
        let total = REPLAY_PAGE_SIZE as u64 + 3;
        for offset in 1..=total {
            sink.record_failure(rec(offset), &reason, Vec::new()).await.unwrap();
        }

        let replay = sink.replay(&SourceId::new("orders"));
        let offsets = tokio::task::spawn_blocking(move || {
            replay
                .map(|r| r.map(|record| record.offset().get()))
                .collect::<Result<Vec<_>, _>>()
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(offsets, (1..=total).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn replay_of_unknown_source_is_empty() {
        let mut replay = sink().replay(&SourceId::new("nothing"));
        assert!(replay.next().is_none());
    }
}
