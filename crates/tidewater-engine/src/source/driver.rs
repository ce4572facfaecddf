//! Moves records from one connector into the ingestion buffer.

use std::sync::Arc;
use std::time::Duration;

use tidewater_state::backend::AppendOutcome;
use tidewater_state::StateError;
use tidewater_types::error::StageError;
use tidewater_types::record::{Offset, Record};
use tokio_util::sync::CancellationToken;

use crate::buffer::{BufferError, IngestionBuffer};
use crate::checkpoint::Checkpointer;
use crate::dlq::DeadLetterSink;
use crate::error::{backoff_sleep, compute_backoff, millis, BackoffPolicy, PipelineError};
use crate::result::RunCounters;
use crate::source::{Poll, SourceConnector};

/// Per-connector statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStats {
    pub enqueued: u64,
    pub duplicates: u64,
    pub backpressure_waits: u64,
    pub resumed_after: Option<Offset>,
}

#[derive(Clone)]
pub struct ConnectorDriver {
    pub(crate) buffer: IngestionBuffer,
    pub(crate) checkpoints: Checkpointer,
    pub(crate) sink: DeadLetterSink,
    pub(crate) counters: Arc<RunCounters>,
    pub(crate) policy: BackoffPolicy,
    pub(crate) poll_size: usize,
    pub(crate) poll_interval: Duration,
}

impl ConnectorDriver {
    /// Drive `source` until it is exhausted or `cancel` fires.
    ///
    /// Resumes after the later of the committed checkpoint and the buffer's
    /// high-water mark, so records already buffered are not read twice.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Cancelled`] on shutdown, or an
    /// infrastructure error if the buffer or state store fails.
    pub async fn run<S: SourceConnector>(
        &self,
        mut source: S,
        cancel: &CancellationToken,
    ) -> Result<DriverStats, PipelineError> {
        let id = source.source_id().clone();
        let checkpoint = self.checkpoints.read(&id).await?;
        let high_water = self.buffer.high_water(&id).await?;
        let mut stats = DriverStats {
            resumed_after: checkpoint.max(high_water),
            ..DriverStats::default()
        };
        if let Some(offset) = stats.resumed_after {
            source.resume_after(offset);
        }
        tracing::info!(
            source = %id,
            checkpoint = checkpoint.map(Offset::get),
            high_water = high_water.map(Offset::get),
            "Source connector started"
        );

        loop {
            let poll = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(PipelineError::Cancelled),
                poll = source.poll(self.poll_size) => poll?,
            };
            match poll {
                Poll::Records(records) => {
                    for record in records {
                        self.enqueue(record, &mut stats, cancel).await?;
                    }
                }
                Poll::Idle => backoff_sleep(self.poll_interval, cancel).await?,
                Poll::Exhausted => break,
            }
        }

        tracing::info!(
            source = %id,
            enqueued = stats.enqueued,
            duplicates = stats.duplicates,
            backpressure_waits = stats.backpressure_waits,
            "Source connector exhausted"
        );
        Ok(stats)
    }

    /// Enqueue one record, waiting out backpressure. The same record is
    /// retried until it fits, which keeps per-source order.
    async fn enqueue(
        &self,
        record: Record,
        stats: &mut DriverStats,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let mut attempt = 0u32;
        loop {
            match self.buffer.enqueue(record.clone()).await {
                Ok(AppendOutcome::Appended { .. }) => {
                    stats.enqueued += 1;
                    self.counters.add_read(1);
                    return Ok(());
                }
                Ok(AppendOutcome::Duplicate { high_water }) => {
                    stats.duplicates += 1;
                    self.counters.add_duplicates(1);
                    tracing::debug!(
                        source = %record.source(),
                        offset = record.offset().get(),
                        high_water = high_water.get(),
                        "Skipping already-buffered record"
                    );
                    return Ok(());
                }
                Err(e) if e.is_capacity_exceeded() => {
                    attempt = attempt.saturating_add(1);
                    stats.backpressure_waits += 1;
                    let hint = StageError::capacity("BUFFER_FULL", e.to_string());
                    let delay = compute_backoff(&self.policy, &hint, attempt);
                    tracing::debug!(
                        source = %record.source(),
                        offset = record.offset().get(),
                        attempt,
                        delay_ms = millis(delay),
                        "Buffer full, pausing connector"
                    );
                    backoff_sleep(delay, cancel).await?;
                }
                Err(BufferError::State(e @ StateError::RecordTooLarge { .. })) => {
                    let mut reason = StageError::capacity("RECORD_TOO_LARGE", e.to_string());
                    reason.retryable = false;
                    if self.sink.record_failure(record, &reason, Vec::new()).await? {
                        self.counters.add_dead_lettered(1);
                    }
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{channel, MemorySource};
    use tidewater_state::backend::BufferLimits;
    use tidewater_state::{DeadLetterStore, SqliteBufferStore, SqliteStateBackend, StateBackend};
    use tidewater_types::record::{Payload, SourceId};
    use tidewater_types::state::PipelineId;

    fn driver(limits: BufferLimits) -> (ConnectorDriver, Arc<dyn StateBackend>) {
        let state: Arc<dyn StateBackend> = Arc::new(SqliteStateBackend::in_memory().unwrap());
        let pipeline = PipelineId::new("p");
        let store = SqliteBufferStore::in_memory(limits, 1).unwrap();
        let driver = ConnectorDriver {
            buffer: IngestionBuffer::new(Arc::new(store), 1),
            checkpoints: Checkpointer::new(Arc::clone(&state), pipeline.clone()),
            sink: DeadLetterSink::new(Arc::clone(&state), pipeline),
            counters: Arc::new(RunCounters::default()),
            policy: BackoffPolicy {
                base: Duration::from_millis(1),
                max: Duration::from_millis(5),
            },
            poll_size: 10,
            poll_interval: Duration::from_millis(1),
        };
        (driver, state)
    }

    fn rows(n: u64) -> MemorySource {
        let payloads = (1..=n).map(|i| Payload::from(format!("{{\"id\":{i}}}").into_bytes()));
        MemorySource::numbered(SourceId::new("orders"), payloads)
    }

    #[tokio::test]
    async fn resumes_after_checkpoint() {
        let (driver, _state) = driver(BufferLimits::default());
        driver
            .checkpoints
            .advance(&SourceId::new("orders"), Offset::new(3))
            .await
            .unwrap();

        let stats = driver.run(rows(5), &CancellationToken::new()).await.unwrap();
        assert_eq!(stats.resumed_after, Some(Offset::new(3)));
        assert_eq!(stats.enqueued, 2);
        assert_eq!(driver.buffer.depth().await.unwrap().records, 2);
    }

    #[tokio::test]
    async fn second_run_sees_high_water_and_enqueues_nothing() {
        let (driver, _state) = driver(BufferLimits::default());
        driver.run(rows(4), &CancellationToken::new()).await.unwrap();
        let again = driver.run(rows(4), &CancellationToken::new()).await.unwrap();
        assert_eq!(again.resumed_after, Some(Offset::new(4)));
        assert_eq!(again.enqueued, 0);
    }

    #[tokio::test]
    async fn backpressure_waits_then_continues_in_order() {
        let limits = BufferLimits {
            max_records: 2,
            max_bytes: 1024 * 1024,
        };
        let (driver, _state) = driver(limits);
        let cancel = CancellationToken::new();

        let consumer = {
            let buffer = driver.buffer.clone();
            tokio::spawn(async move {
                let mut lane = buffer.lane(0);
                let mut seen = Vec::new();
                while seen.len() < 6 {
                    for record in lane.dequeue_batch(10).await.unwrap() {
                        seen.push(record.offset().get());
                        buffer.acknowledge(record.source(), record.offset()).await.unwrap();
                    }
                }
                seen
            })
        };

        let stats = driver.run(rows(6), &cancel).await.unwrap();
        assert_eq!(stats.enqueued, 6);
        assert!(stats.backpressure_waits > 0);
        assert_eq!(consumer.await.unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn cancel_stops_a_waiting_push_source() {
        let (driver, _state) = driver(BufferLimits::default());
        let (_producer, source) = channel(SourceId::new("events"), 4);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = driver.run(source, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn oversized_record_is_dead_lettered() {
        let limits = BufferLimits {
            max_records: 10,
            max_bytes: 8,
        };
        let (driver, state) = driver(limits);
        let source = MemorySource::numbered(
            SourceId::new("orders"),
            [Payload::from("{\"this is\":\"far too long\"}"), Payload::from("{}")],
        );
        let stats = driver.run(source, &CancellationToken::new()).await.unwrap();
        assert_eq!(stats.enqueued, 1);
        assert_eq!(
            state
                .dead_letter_count(&PipelineId::new("p"), Some(&SourceId::new("orders")))
                .unwrap(),
            1
        );
    }
}
