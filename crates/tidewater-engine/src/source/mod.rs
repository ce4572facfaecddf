//! Source connectors and the driver that feeds them into the buffer.
//!
//! A connector emits records with strictly increasing offsets. Pull
//! connectors are polled; [`ChannelSource`] adapts push producers to the
//! same contract.

pub mod channel;
pub mod csv;
pub mod driver;
pub mod jsonl;
pub mod memory;

use std::future::Future;
use std::path::Path;

use tidewater_types::record::{Offset, Record, SourceId};

use crate::config::types::{SourceConfig, SourceKind};
use crate::error::PipelineError;

pub use channel::{channel, ChannelProducer, ChannelSource};
pub use self::csv::CsvSource;
pub use driver::ConnectorDriver;
pub use jsonl::JsonLinesSource;
pub use memory::MemorySource;

/// Result of one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll {
    /// At least one new record, in offset order.
    Records(Vec<Record>),
    /// Nothing new right now; poll again later.
    Idle,
    /// The stream has ended.
    Exhausted,
}

pub trait SourceConnector: Send {
    fn source_id(&self) -> &SourceId;

    /// Skip every record with offset `<= offset` from now on.
    fn resume_after(&mut self, offset: Offset);

    /// Up to `max` records after the current position.
    fn poll(&mut self, max: usize) -> impl Future<Output = Result<Poll, PipelineError>> + Send;
}

/// Any built-in connector.
pub enum AnySource {
    Csv(CsvSource),
    Jsonl(JsonLinesSource),
    Channel(ChannelSource),
    Memory(MemorySource),
}

impl AnySource {
    /// Build the file connector described by `config`.
    #[must_use]
    pub fn from_config(config: &SourceConfig) -> Self {
        let id = SourceId::new(config.name.as_str());
        match config.kind {
            SourceKind::Csv => Self::Csv(CsvSource::new(
                id,
                &config.path,
                config.delimiter.unwrap_or(','),
            )),
            SourceKind::Jsonl => Self::Jsonl(JsonLinesSource::new(id, &config.path)),
        }
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Csv(s) => Some(s.path()),
            Self::Jsonl(s) => Some(s.path()),
            Self::Channel(_) | Self::Memory(_) => None,
        }
    }
}

impl From<CsvSource> for AnySource {
    fn from(source: CsvSource) -> Self {
        Self::Csv(source)
    }
}

impl From<JsonLinesSource> for AnySource {
    fn from(source: JsonLinesSource) -> Self {
        Self::Jsonl(source)
    }
}

impl From<ChannelSource> for AnySource {
    fn from(source: ChannelSource) -> Self {
        Self::Channel(source)
    }
}

impl From<MemorySource> for AnySource {
    fn from(source: MemorySource) -> Self {
        Self::Memory(source)
    }
}

impl SourceConnector for AnySource {
    fn source_id(&self) -> &SourceId {
        match self {
            Self::Csv(s) => s.source_id(),
            Self::Jsonl(s) => s.source_id(),
            Self::Channel(s) => s.source_id(),
            Self::Memory(s) => s.source_id(),
        }
    }

    fn resume_after(&mut self, offset: Offset) {
        match self {
            Self::Csv(s) => s.resume_after(offset),
            Self::Jsonl(s) => s.resume_after(offset),
            Self::Channel(s) => s.resume_after(offset),
            Self::Memory(s) => s.resume_after(offset),
        }
    }

    async fn poll(&mut self, max: usize) -> Result<Poll, PipelineError> {
        match self {
            Self::Csv(s) => s.poll(max).await,
            Self::Jsonl(s) => s.poll(max).await,
            Self::Channel(s) => s.poll(max).await,
            Self::Memory(s) => s.poll(max).await,
        }
    }
}
