//! Async front end of the ingestion buffer.
//!
//! Storage work runs on the blocking pool. Each lane has its own [`Notify`]
//! so an empty lane parks its worker until the next append.

use std::sync::Arc;

use tidewater_state::backend::{AppendOutcome, BufferDepth, BufferStore, BufferedRecord};
use tidewater_state::StateError;
use tidewater_types::record::{Offset, Record, SourceId};
use tokio::sync::Notify;

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error("buffer task panicked: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl BufferError {
    #[must_use]
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(self, Self::State(e) if e.is_capacity_exceeded())
    }
}

type Result<T> = std::result::Result<T, BufferError>;

/// Shared handle to the buffer. Cheap to clone.
#[derive(Clone)]
pub struct IngestionBuffer {
    store: Arc<dyn BufferStore>,
    lanes: Arc<[Notify]>,
    acked: Arc<Notify>,
}

impl IngestionBuffer {
    /// Wrap `store`, which must have been opened with the same lane count.
    #[must_use]
    pub fn new(store: Arc<dyn BufferStore>, lanes: u32) -> Self {
        let lanes: Arc<[Notify]> = (0..lanes.max(1)).map(|_| Notify::new()).collect();
        Self {
            store,
            lanes,
            acked: Arc::new(Notify::new()),
        }
    }

    #[must_use]
    pub fn lane_count(&self) -> u32 {
        u32::try_from(self.lanes.len()).unwrap_or(u32::MAX)
    }

    #[must_use]
    pub fn lane_of(&self, source: &SourceId) -> u32 {
        source.lane(self.lane_count())
    }

    fn notifier(&self, lane: u32) -> &Notify {
        let index = usize::try_from(lane).unwrap_or(usize::MAX);
        self.lanes.get(index).unwrap_or(&self.lanes[0])
    }

    /// Durably append `record` to its source's lane.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::State`] wrapping
    /// [`StateError::CapacityExceeded`] when the buffer is full.
    pub async fn enqueue(&self, record: Record) -> Result<AppendOutcome> {
        let lane = self.lane_of(record.source());
        let store = Arc::clone(&self.store);
        let outcome = tokio::task::spawn_blocking(move || store.append(lane, &record)).await??;
        if matches!(outcome, AppendOutcome::Appended { .. }) {
            self.notifier(lane).notify_one();
        }
        Ok(outcome)
    }

    /// Consumer handle for one lane, starting at the oldest pending record.
    #[must_use]
    pub fn lane(&self, lane: u32) -> BufferLane {
        BufferLane {
            buffer: self.clone(),
            lane,
            cursor: 0,
        }
    }

    /// Remove committed records of `source` up to and including `through`.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError`] on storage failure.
    pub async fn acknowledge(&self, source: &SourceId, through: Offset) -> Result<u64> {
        let store = Arc::clone(&self.store);
        let source = source.clone();
        let removed =
            tokio::task::spawn_blocking(move || store.acknowledge(&source, through)).await??;
        self.acked.notify_waiters();
        Ok(removed)
    }

    /// Pending records and bytes.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError`] on storage failure.
    pub async fn depth(&self) -> Result<BufferDepth> {
        let store = Arc::clone(&self.store);
        Ok(tokio::task::spawn_blocking(move || store.depth()).await??)
    }

    /// Highest offset ever appended for `source`.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError`] on storage failure.
    pub async fn high_water(&self, source: &SourceId) -> Result<Option<Offset>> {
        let store = Arc::clone(&self.store);
        let source = source.clone();
        Ok(tokio::task::spawn_blocking(move || store.high_water(&source)).await??)
    }

    /// # Errors
    ///
    /// Returns [`BufferError`] on storage failure.
    pub async fn pending_sources(&self) -> Result<Vec<SourceId>> {
        let store = Arc::clone(&self.store);
        Ok(tokio::task::spawn_blocking(move || store.pending_sources()).await??)
    }

    /// Resolve once every buffered record has been acknowledged.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError`] on storage failure.
    pub async fn wait_drained(&self) -> Result<()> {
        loop {
            // Registered before the check so an acknowledgement in between
            // still wakes us.
            let acked = self.acked.notified();
            if self.depth().await?.records == 0 {
                return Ok(());
            }
            acked.await;
        }
    }
}

/// Ordered consumer of one lane.
///
/// The cursor only moves forward within a process. Records fetched but never
/// acknowledged are fetched again by the next process.
pub struct BufferLane {
    buffer: IngestionBuffer,
    lane: u32,
    cursor: i64,
}

impl BufferLane {
    #[must_use]
    pub fn id(&self) -> u32 {
        self.lane
    }

    /// Up to `max` records in append order, waiting while the lane is empty.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError`] on storage failure.
    pub async fn dequeue_batch(&mut self, max: usize) -> Result<Vec<Record>> {
        loop {
            let batch = self.fetch(max).await?;
            if let Some(last) = batch.last() {
                self.cursor = last.seq;
                return Ok(batch.into_iter().map(|b| b.record).collect());
            }
            self.buffer.notifier(self.lane).notified().await;
        }
    }

    async fn fetch(&self, max: usize) -> Result<Vec<BufferedRecord>> {
        let store = Arc::clone(&self.buffer.store);
        let (lane, cursor) = (self.lane, self.cursor);
        Ok(tokio::task::spawn_blocking(move || store.fetch(lane, cursor, max.max(1))).await??)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use tidewater_state::backend::BufferLimits;
    use tidewater_state::SqliteBufferStore;
    use tidewater_types::record::Timestamp;

    fn rec(source: &str, offset: u64) -> Record {
        Record::new(
            SourceId::new(source),
            Offset::new(offset),
            format!(r#"{{"n":{offset}}}"#).into_bytes(),
            Timestamp::new("2024-01-15T10:00:00Z"),
        )
    }

    fn buffer(limits: BufferLimits, lanes: u32) -> IngestionBuffer {
        let store = SqliteBufferStore::in_memory(limits, lanes).unwrap();
        IngestionBuffer::new(Arc::new(store), lanes)
    }

    #[tokio::test]
    async fn dequeue_preserves_enqueue_order() {
        let buf = buffer(BufferLimits::default(), 2);
        for i in 1..=5 {
            buf.enqueue(rec("orders", i)).await.unwrap();
        }
        let mut lane = buf.lane(buf.lane_of(&SourceId::new("orders")));
        let first = lane.dequeue_batch(3).await.unwrap();
        let second = lane.dequeue_batch(10).await.unwrap();
        let offsets: Vec<u64> = first.iter().chain(&second).map(|r| r.offset().get()).collect();
        assert_eq!(offsets, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn empty_lane_waits_for_enqueue() {
        let buf = buffer(BufferLimits::default(), 1);
        let mut lane = buf.lane(0);
        let waiter = tokio::spawn(async move { lane.dequeue_batch(10).await.unwrap() });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        buf.enqueue(rec("orders", 1)).await.unwrap();
        let batch = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn duplicates_are_not_stored() {
        let buf = buffer(BufferLimits::default(), 1);
        buf.enqueue(rec("orders", 1)).await.unwrap();
        let outcome = buf.enqueue(rec("orders", 1)).await.unwrap();
        assert_eq!(
            outcome,
            AppendOutcome::Duplicate {
                high_water: Offset::new(1)
            }
        );
        assert_eq!(buf.depth().await.unwrap().records, 1);
    }

    #[tokio::test]
    async fn full_buffer_reports_capacity() {
        let limits = BufferLimits {
            max_records: 1,
            max_bytes: 1024,
        };
        let buf = buffer(limits, 1);
        buf.enqueue(rec("orders", 1)).await.unwrap();
        let err = buf.enqueue(rec("orders", 2)).await.unwrap_err();
        assert!(err.is_capacity_exceeded());

        buf.acknowledge(&SourceId::new("orders"), Offset::new(1))
            .await
            .unwrap();
        buf.enqueue(rec("orders", 2)).await.unwrap();
    }

    #[tokio::test]
    async fn wait_drained_resolves_after_ack() {
        let buf = buffer(BufferLimits::default(), 1);
        buf.enqueue(rec("orders", 1)).await.unwrap();
        buf.enqueue(rec("orders", 2)).await.unwrap();

        let drained = {
            let buf = buf.clone();
            tokio::spawn(async move { buf.wait_drained().await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!drained.is_finished());

        buf.acknowledge(&SourceId::new("orders"), Offset::new(2))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), drained)
            .await
            .unwrap()
            .unwrap();
        assert!(buf.pending_sources().await.unwrap().is_empty());
        assert_eq!(
            buf.high_water(&SourceId::new("orders")).await.unwrap(),
            Some(Offset::new(2))
        );
    }
}
