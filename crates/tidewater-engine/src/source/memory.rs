//! Fixed in-memory connector, mostly for tests and demos.

use std::collections::VecDeque;

use tidewater_types::record::{Offset, Payload, Record, SourceId};

use crate::error::PipelineError;
use crate::source::{Poll, SourceConnector};

pub struct MemorySource {
    id: SourceId,
    pending: VecDeque<(Offset, Payload)>,
    resume_after: Offset,
}

impl MemorySource {
    /// `rows` must be in increasing offset order.
    #[must_use]
    pub fn new(id: SourceId, rows: impl IntoIterator<Item = (Offset, Payload)>) -> Self {
        Self {
            id,
            pending: rows.into_iter().collect(),
            resume_after: Offset::default(),
        }
    }

    /// Rows numbered `1..=n` from their position.
    #[must_use]
    pub fn numbered(id: SourceId, payloads: impl IntoIterator<Item = Payload>) -> Self {
        let rows = payloads
            .into_iter()
            .zip(1u64..)
            .map(|(payload, n)| (Offset::new(n), payload));
        Self::new(id, rows)
    }
}

impl SourceConnector for MemorySource {
    fn source_id(&self) -> &SourceId {
        &self.id
    }

    fn resume_after(&mut self, offset: Offset) {
        self.resume_after = self.resume_after.max(offset);
        while self
            .pending
            .front()
            .is_some_and(|(offset, _)| *offset <= self.resume_after)
        {
            self.pending.pop_front();
        }
    }

    async fn poll(&mut self, max: usize) -> Result<Poll, PipelineError> {
        if self.pending.is_empty() {
            return Ok(Poll::Exhausted);
        }
        let take = max.max(1).min(self.pending.len());
        let records = self
            .pending
            .drain(..take)
            .map(|(offset, payload)| Record::new(self.id.clone(), offset, payload, crate::now()))
            .collect();
        Ok(Poll::Records(records))
    }
}
