//! Async checkpoint access for one pipeline.

use std::collections::BTreeMap;
use std::sync::Arc;

use tidewater_state::{CheckpointStore, StateBackend, StateError};
use tidewater_types::record::{Offset, SourceId};
use tidewater_types::state::{CheckpointState, PipelineId};

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error("checkpoint task panicked: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Result of an advance request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    Advanced,
    /// The stored offset is already at or past the request. Nothing changed.
    Stale { stored: Offset },
}

#[derive(Clone)]
pub struct Checkpointer {
    state: Arc<dyn StateBackend>,
    pipeline: PipelineId,
}

impl Checkpointer {
    #[must_use]
    pub fn new(state: Arc<dyn StateBackend>, pipeline: PipelineId) -> Self {
        Self { state, pipeline }
    }

    /// # Errors
    ///
    /// Returns [`CheckpointError`] on storage failure.
    pub async fn read(&self, source: &SourceId) -> Result<Option<Offset>, CheckpointError> {
        let state = Arc::clone(&self.state);
        let pipeline = self.pipeline.clone();
        let source = source.clone();
        Ok(
            tokio::task::spawn_blocking(move || state.read_checkpoint(&pipeline, &source))
                .await??,
        )
    }

    /// Move `source` forward to `offset`. A non-forward move is reported as
    /// [`Advance::Stale`], not an error.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] on storage failure.
    pub async fn advance(
        &self,
        source: &SourceId,
        offset: Offset,
    ) -> Result<Advance, CheckpointError> {
        let state = Arc::clone(&self.state);
        let pipeline = self.pipeline.clone();
        let source = source.clone();
        let result =
            tokio::task::spawn_blocking(move || state.advance_checkpoint(&pipeline, &source, offset))
                .await?;
        match result {
            Ok(()) => Ok(Advance::Advanced),
            Err(StateError::NonMonotonic { stored, .. }) => Ok(Advance::Stale {
                stored: Offset::new(stored),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// # Errors
    ///
    /// Returns [`CheckpointError`] on storage failure.
    pub async fn list(&self) -> Result<Vec<CheckpointState>, CheckpointError> {
        let state = Arc::clone(&self.state);
        let pipeline = self.pipeline.clone();
        Ok(tokio::task::spawn_blocking(move || state.list_checkpoints(&pipeline)).await??)
    }

    /// Advance every source in `committed` after a successful warehouse commit.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] on the first storage failure.
    pub async fn persist_committed(
        &self,
        committed: &BTreeMap<SourceId, Offset>,
    ) -> Result<u64, CheckpointError> {
        let mut advanced = 0;
        for (source, &offset) in committed {
            match self.advance(source, offset).await? {
                Advance::Advanced => {
                    advanced += 1;
                    tracing::debug!(
                        pipeline = self.pipeline.as_str(),
                        source = %source,
                        offset = offset.get(),
                        "Checkpoint advanced"
                    );
                }
                Advance::Stale { stored } => {
                    tracing::debug!(
                        pipeline = self.pipeline.as_str(),
                        source = %source,
                        offset = offset.get(),
                        stored = stored.get(),
                        "Skipping checkpoint advance: already at or past offset"
                    );
                }
            }
        }
        Ok(advanced)
    }
}
