//! Lane workers: transform, dead-letter, commit, checkpoint, acknowledge.
//!
//! One worker owns one lane, and a source lives on exactly one lane, so
//! batches of a source are processed strictly one after another.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use tidewater_types::error::StageError;
use tidewater_types::record::{Offset, Record, SourceId};
use tidewater_types::result::{Attempt, ProcessingResult};
use tidewater_types::state::SourceState;
use tokio_util::sync::CancellationToken;

use crate::buffer::{BufferLane, IngestionBuffer};
use crate::checkpoint::Checkpointer;
use crate::dlq::DeadLetterSink;
use crate::error::{backoff_sleep, compute_backoff, millis, BackoffPolicy, PipelineError};
use crate::lifecycle::SourceStateRegistry;
use crate::result::RunCounters;
use crate::transform::Transformer;
use crate::warehouse::{CommitResult, Warehouse, WarehouseError};

/// A permanently failed record with its history.
pub(crate) struct Rejection {
    pub record: Record,
    pub reason: StageError,
    pub attempts: Vec<Attempt>,
}

/// A transformed record and the input it came from.
pub(crate) struct Accepted {
    pub record: Record,
    pub original: Record,
}

pub(crate) struct Transformed {
    pub accepted: Vec<Accepted>,
    pub rejected: Vec<Rejection>,
}

/// Transform, dead-letter and commit steps shared by lane workers and
/// dead-letter replay.
#[derive(Clone)]
pub(crate) struct Stages {
    pub transformer: Arc<Transformer>,
    pub warehouse: Arc<dyn Warehouse>,
    pub sink: DeadLetterSink,
    pub counters: Arc<RunCounters>,
    pub policy: BackoffPolicy,
    pub commit_retries: u32,
}

impl Stages {
    /// Run each record through the transformer, retrying faults with backoff.
    pub(crate) async fn transform_all(
        &self,
        batch: Vec<Record>,
        cancel: &CancellationToken,
    ) -> Result<Transformed, PipelineError> {
        let mut accepted = Vec::with_capacity(batch.len());
        let mut rejected = Vec::new();
        for record in batch {
            let original = record.clone();
            let mut result = self.transformer.transform(record, Vec::new());
            loop {
                match result {
                    ProcessingResult::Accepted(record) => {
                        accepted.push(Accepted { record, original });
                        break;
                    }
                    ProcessingResult::Rejected {
                        record,
                        reason,
                        attempts,
                    } => {
                        rejected.push(Rejection {
                            record,
                            reason,
                            attempts,
                        });
                        break;
                    }
                    ProcessingResult::Retryable {
                        record,
                        error,
                        attempts,
                    } => {
                        let attempt = u32::try_from(attempts.len()).unwrap_or(u32::MAX);
                        let delay = compute_backoff(&self.policy, &error, attempt);
                        self.counters.add_retries(1);
                        tracing::debug!(
                            source = %record.source(),
                            offset = record.offset().get(),
                            attempt,
                            max_attempts = self.transformer.max_attempts(),
                            delay_ms = millis(delay),
                            code = error.code.as_str(),
                            "Transform fault, will retry"
                        );
                        backoff_sleep(delay, cancel).await?;
                        result = self.transformer.transform(record, attempts);
                    }
                }
            }
        }
        Ok(Transformed { accepted, rejected })
    }

    /// Persist rejections. Returns how many entries were new.
    pub(crate) async fn dead_letter(&self, rejected: Vec<Rejection>) -> Result<u64, PipelineError> {
        let mut written = 0;
        for rejection in rejected {
            if self
                .sink
                .record_failure(rejection.record, &rejection.reason, rejection.attempts)
                .await?
            {
                written += 1;
            }
        }
        self.counters.add_dead_lettered(written);
        Ok(written)
    }

    /// Commit the transformed records, retrying unavailability and routing
    /// schema offenders to the dead-letter sink before recommitting the rest.
    /// Offenders are dead-lettered in their original, untransformed form.
    ///
    /// Cancellation is only observed while sleeping between attempts, when
    /// nothing from this batch has been applied.
    pub(crate) async fn commit(
        &self,
        accepted: Vec<Accepted>,
        cancel: &CancellationToken,
    ) -> Result<CommitResult, PipelineError> {
        let (mut records, mut originals): (Vec<Record>, Vec<Record>) = accepted
            .into_iter()
            .map(|a| (a.record, a.original))
            .unzip();
        let mut unavailable = 0u32;
        loop {
            if records.is_empty() {
                return Ok(CommitResult::default());
            }
            let warehouse = Arc::clone(&self.warehouse);
            let (returned, outcome) = tokio::task::spawn_blocking(move || {
                let outcome = warehouse.commit_batch(&records);
                (records, outcome)
            })
            .await
            .map_err(|e| PipelineError::task("warehouse commit", &e))?;
            records = returned;

            match outcome {
                Ok(result) => {
                    self.counters.add_written(result.applied);
                    self.counters.add_duplicates(result.duplicates);
                    return Ok(result);
                }
                Err(WarehouseError::WriteUnavailable { reason }) => {
                    unavailable += 1;
                    let error = StageError::write_unavailable("WAREHOUSE_UNAVAILABLE", reason);
                    if unavailable > self.commit_retries {
                        tracing::error!(
                            attempts = unavailable,
                            error = error.message.as_str(),
                            "Warehouse commit retries exhausted"
                        );
                        return Err(PipelineError::Stage(error));
                    }
                    self.counters.add_retries(1);
                    let delay = compute_backoff(&self.policy, &error, unavailable);
                    tracing::warn!(
                        attempt = unavailable,
                        max_retries = self.commit_retries,
                        delay_ms = millis(delay),
                        error = error.message.as_str(),
                        "Warehouse unavailable, will retry commit"
                    );
                    backoff_sleep(delay, cancel).await?;
                }
                Err(WarehouseError::SchemaViolation { violations }) => {
                    let offenders: HashSet<(SourceId, Offset)> = violations
                        .iter()
                        .map(|v| (v.source.clone(), v.offset))
                        .collect();
                    let mut reasons: BTreeMap<(SourceId, Offset), String> = violations
                        .into_iter()
                        .map(|v| ((v.source, v.offset), v.message))
                        .collect();
                    let (bad, good): (Vec<_>, Vec<_>) = records
                        .into_iter()
                        .zip(originals)
                        .partition(|(r, _)| offenders.contains(&(r.source().clone(), r.offset())));
                    tracing::warn!(
                        offenders = bad.len(),
                        remaining = good.len(),
                        "Warehouse schema violation, dead-lettering offenders"
                    );
                    let rejected = bad
                        .into_iter()
                        .map(|(_, record)| {
                            let message = reasons
                                .remove(&(record.source().clone(), record.offset()))
                                .unwrap_or_default();
                            Rejection {
                                reason: StageError::schema("WAREHOUSE_SCHEMA", message),
                                record,
                                attempts: Vec::new(),
                            }
                        })
                        .collect();
                    self.dead_letter(rejected).await?;
                    (records, originals) = good.into_iter().unzip();
                }
                Err(e) => return Err(PipelineError::Stage(e.to_stage_error())),
            }
        }
    }
}

pub(crate) struct LaneWorker {
    pub lane: BufferLane,
    pub buffer: IngestionBuffer,
    pub stages: Stages,
    pub checkpoints: Checkpointer,
    pub registry: SourceStateRegistry,
    pub batch_size: usize,
}

impl LaneWorker {
    /// Process batches until `cancel` fires or a fatal error occurs.
    pub(crate) async fn run(mut self, cancel: CancellationToken) -> Result<(), PipelineError> {
        let lane = self.lane.id();
        tracing::debug!(lane, "Lane worker started");
        loop {
            let batch = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                batch = self.lane.dequeue_batch(self.batch_size) => batch?,
            };
            match self.process(batch, &cancel).await {
                Ok(()) => {}
                Err(PipelineError::Cancelled) => {
                    tracing::info!(lane, "Batch abandoned on shutdown, will be redelivered");
                    break;
                }
                Err(e) => {
                    tracing::error!(lane, error = %e, "Lane worker failed");
                    return Err(e);
                }
            }
        }
        tracing::debug!(lane, "Lane worker stopped");
        Ok(())
    }

    fn mark(&self, sources: &BTreeSet<SourceId>, state: SourceState) {
        for source in sources {
            self.registry.transition(source, state);
        }
    }

    async fn process(
        &self,
        batch: Vec<Record>,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let mut last_offsets: BTreeMap<SourceId, Offset> = BTreeMap::new();
        for record in &batch {
            last_offsets.insert(record.source().clone(), record.offset());
        }
        let sources: BTreeSet<SourceId> = last_offsets.keys().cloned().collect();
        let result = self.execute(batch, &sources, &last_offsets, cancel).await;
        if result.is_err() {
            // The batch stays in the buffer and is redelivered after recovery.
            self.mark(&sources, SourceState::Recovering);
        }
        result
    }

    async fn execute(
        &self,
        batch: Vec<Record>,
        sources: &BTreeSet<SourceId>,
        last_offsets: &BTreeMap<SourceId, Offset>,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let size = batch.len();
        self.mark(sources, SourceState::Ingesting);
        self.mark(sources, SourceState::Transforming);
        let transformed = self.stages.transform_all(batch, cancel).await?;

        let rejected = transformed.rejected.len();
        if !transformed.rejected.is_empty() {
            let failing: BTreeSet<SourceId> = transformed
                .rejected
                .iter()
                .map(|r| r.record.source().clone())
                .collect();
            self.mark(&failing, SourceState::DeadLettering);
            self.stages.dead_letter(transformed.rejected).await?;
        }

        self.mark(sources, SourceState::Committing);
        let result = self.stages.commit(transformed.accepted, cancel).await?;

        // Every offset in the batch is now either in the warehouse or in the
        // dead-letter sink.
        self.checkpoints.persist_committed(last_offsets).await?;
        for (source, offset) in last_offsets {
            self.buffer.acknowledge(source, *offset).await?;
        }
        self.mark(sources, SourceState::Idle);

        tracing::info!(
            lane = self.lane.id(),
            records = size,
            applied = result.applied,
            duplicates = result.duplicates,
            dead_lettered = rejected,
            "Batch committed"
        );
        Ok(())
    }
}
