//! Push connector: producers send through an mpsc channel.

use tidewater_types::record::{Offset, Payload, Record, SourceId};
use tokio::sync::mpsc;

use crate::error::PipelineError;
use crate::source::{Poll, SourceConnector};

/// Create a bounded push source and its producer handle.
///
/// The source reports [`Poll::Exhausted`] once every producer is dropped
/// and the channel is empty.
#[must_use]
pub fn channel(id: SourceId, capacity: usize) -> (ChannelProducer, ChannelSource) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ChannelProducer { tx },
        ChannelSource {
            id,
            rx,
            resume_after: None,
        },
    )
}

#[derive(Debug, thiserror::Error)]
#[error("channel source closed")]
pub struct ChannelClosed;

#[derive(Clone)]
pub struct ChannelProducer {
    tx: mpsc::Sender<(Offset, Payload)>,
}

impl ChannelProducer {
    /// Send one record, waiting while the channel is full.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelClosed`] if the source was dropped.
    pub async fn send(
        &self,
        offset: Offset,
        payload: impl Into<Payload>,
    ) -> Result<(), ChannelClosed> {
        self.tx
            .send((offset, payload.into()))
            .await
            .map_err(|_| ChannelClosed)
    }
}

pub struct ChannelSource {
    id: SourceId,
    rx: mpsc::Receiver<(Offset, Payload)>,
    /// Highest offset already covered by the checkpoint, if any.
    resume_after: Option<Offset>,
}

impl SourceConnector for ChannelSource {
    fn source_id(&self) -> &SourceId {
        &self.id
    }

    fn resume_after(&mut self, offset: Offset) {
        self.resume_after = Some(self.resume_after.map_or(offset, |current| current.max(offset)));
    }

    async fn poll(&mut self, max: usize) -> Result<Poll, PipelineError> {
        let mut received = Vec::with_capacity(max.max(1));
        if self.rx.recv_many(&mut received, max.max(1)).await == 0 {
            return Ok(Poll::Exhausted);
        }
        let records: Vec<Record> = received
            .into_iter()
            .filter(|(offset, _)| self.resume_after.map_or(true, |after| *offset > after))
            .map(|(offset, payload)| Record::new(self.id.clone(), offset, payload, crate::now()))
            .collect();
        if records.is_empty() {
            return Ok(Poll::Idle);
        }
        Ok(Poll::Records(records))
    }
}
