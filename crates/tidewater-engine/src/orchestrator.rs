//! Pipeline orchestrator: recovery, lane workers, connector drivers, and
//! the operator entry points behind the CLI.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tidewater_state::backend::StoredDeadLetter;
use tidewater_state::{BufferStore, RunStore, StateBackend};
use tidewater_types::record::{Record, SourceId};
use tidewater_types::state::{PipelineId, RunStatus, SourceState};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::buffer::IngestionBuffer;
use crate::checkpoint::Checkpointer;
use crate::config::types::{PipelineConfig, SourceKind};
use crate::config::validator::validate_pipeline;
use crate::dlq::DeadLetterSink;
use crate::error::PipelineError;
use crate::lifecycle::SourceStateRegistry;
use crate::resolve::{create_buffer_store, create_state_backend, create_warehouse};
use crate::result::{
    CheckResult, PipelineResult, ReplayReport, RunCounters, SourceCheck, StatusReport,
};
use crate::source::csv::list_csv_files;
use crate::source::{AnySource, ConnectorDriver, SourceConnector};
use crate::transform::lookup::{ReferenceLookup, StaticReferences};
use crate::transform::Transformer;
use crate::warehouse::Warehouse;
use crate::worker::{LaneWorker, Stages};

/// Runs shown by [`Pipeline::status`].
const RECENT_RUNS: usize = 10;

/// Builds a [`Pipeline`], opening any store not supplied explicitly from
/// the configuration.
pub struct PipelineBuilder {
    config: PipelineConfig,
    state: Option<Arc<dyn StateBackend>>,
    warehouse: Option<Arc<dyn Warehouse>>,
    lookup: Option<Arc<dyn ReferenceLookup>>,
    buffer_store: Option<Arc<dyn BufferStore>>,
}

impl PipelineBuilder {
    #[must_use]
    pub fn state(mut self, state: Arc<dyn StateBackend>) -> Self {
        self.state = Some(state);
        self
    }

    #[must_use]
    pub fn warehouse(mut self, warehouse: Arc<dyn Warehouse>) -> Self {
        self.warehouse = Some(warehouse);
        self
    }

    /// Replace the reference tables loaded from `transform.references`.
    #[must_use]
    pub fn lookup(mut self, lookup: Arc<dyn ReferenceLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    #[must_use]
    pub fn buffer_store(mut self, store: Arc<dyn BufferStore>) -> Self {
        self.buffer_store = Some(store);
        self
    }

    /// Validate the configuration and open the remaining stores.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails or a store cannot be opened.
    pub fn build(self) -> Result<Pipeline> {
        validate_pipeline(&self.config)?;
        let config = self.config;
        let state = match self.state {
            Some(state) => state,
            None => create_state_backend(&config)?,
        };
        let warehouse = match self.warehouse {
            Some(warehouse) => warehouse,
            None => create_warehouse(&config)?,
        };
        let store = match self.buffer_store {
            Some(store) => store,
            None => create_buffer_store(&config.buffer)?,
        };
        let lookup = self.lookup.unwrap_or_else(|| {
            Arc::new(StaticReferences::from_config(&config.transform.references))
        });
        let transformer =
            Transformer::from_config(&config.transform, lookup, config.processing.max_attempts)
                .map_err(|e| anyhow::anyhow!("transform: {e}"))?;

        let pipeline = config.pipeline_id();
        Ok(Pipeline {
            checkpoints: Checkpointer::new(Arc::clone(&state), pipeline.clone()),
            sink: DeadLetterSink::new(Arc::clone(&state), pipeline.clone()),
            buffer: IngestionBuffer::new(store, config.buffer.lanes),
            transformer: Arc::new(transformer),
            registry: SourceStateRegistry::new(),
            pipeline,
            state,
            warehouse,
            config,
        })
    }
}

/// A configured pipeline and its open stores.
pub struct Pipeline {
    config: PipelineConfig,
    pipeline: PipelineId,
    state: Arc<dyn StateBackend>,
    warehouse: Arc<dyn Warehouse>,
    buffer: IngestionBuffer,
    transformer: Arc<Transformer>,
    checkpoints: Checkpointer,
    sink: DeadLetterSink,
    registry: SourceStateRegistry,
}

impl Pipeline {
    #[must_use]
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder {
            config,
            state: None,
            warehouse: None,
            lookup: None,
            buffer_store: None,
        }
    }

    /// Open every store from the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails or a store cannot be opened.
    pub fn open(config: PipelineConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[must_use]
    pub fn warehouse(&self) -> &Arc<dyn Warehouse> {
        &self.warehouse
    }

    #[must_use]
    pub fn buffer(&self) -> &IngestionBuffer {
        &self.buffer
    }

    #[must_use]
    pub fn checkpoints(&self) -> &Checkpointer {
        &self.checkpoints
    }

    #[must_use]
    pub fn dead_letters(&self) -> &DeadLetterSink {
        &self.sink
    }

    #[must_use]
    pub fn registry(&self) -> &SourceStateRegistry {
        &self.registry
    }

    /// The file connectors named in the configuration.
    #[must_use]
    pub fn configured_sources(&self) -> Vec<AnySource> {
        self.config.sources.iter().map(AnySource::from_config).collect()
    }

    fn stages(&self, counters: Arc<RunCounters>) -> Stages {
        Stages {
            transformer: Arc::clone(&self.transformer),
            warehouse: Arc::clone(&self.warehouse),
            sink: self.sink.clone(),
            counters,
            policy: self.config.processing.backoff_policy(),
            commit_retries: self.config.processing.commit_retries,
        }
    }

    /// Re-derive every known source's position from the checkpoint store,
    /// dropping buffered records the warehouse already holds.
    ///
    /// Returns the number of buffered records dropped.
    ///
    /// # Errors
    ///
    /// Returns an infrastructure error if the buffer or state store fails.
    pub async fn recover(&self) -> Result<u64, PipelineError> {
        let configured = self
            .config
            .sources
            .iter()
            .map(|s| SourceId::new(s.name.as_str()));
        self.recover_sources(configured).await
    }

    async fn recover_sources(
        &self,
        extra: impl IntoIterator<Item = SourceId>,
    ) -> Result<u64, PipelineError> {
        let mut sources: BTreeSet<SourceId> =
            self.buffer.pending_sources().await?.into_iter().collect();
        sources.extend(extra);

        let mut dropped = 0;
        for source in &sources {
            self.registry.transition(source, SourceState::Recovering);
            let checkpoint = self.checkpoints.read(source).await?;
            if let Some(offset) = checkpoint {
                let acked = self.buffer.acknowledge(source, offset).await?;
                if acked > 0 {
                    tracing::info!(
                        pipeline = self.pipeline.as_str(),
                        source = %source,
                        checkpoint = offset.get(),
                        dropped = acked,
                        "Dropped buffered records already covered by checkpoint"
                    );
                }
                dropped += acked;
            }
            self.registry.transition(source, SourceState::Idle);
            tracing::debug!(
                source = %source,
                checkpoint = checkpoint.map(|o| o.get()),
                "Source recovered"
            );
        }
        Ok(dropped)
    }

    /// Run until every source is exhausted and the buffer has drained, or
    /// until `cancel` fires.
    ///
    /// A cancelled run abandons in-flight batches before commit; they are
    /// redelivered on the next run.
    ///
    /// # Errors
    ///
    /// Returns a `PipelineError` when storage becomes unavailable. The run
    /// is recorded as failed first.
    pub async fn run(
        &self,
        sources: Vec<AnySource>,
        cancel: &CancellationToken,
    ) -> Result<PipelineResult, PipelineError> {
        let start = Instant::now();
        tracing::info!(
            pipeline = self.pipeline.as_str(),
            sources = sources.len(),
            lanes = self.buffer.lane_count(),
            "Starting pipeline run"
        );

        let state = Arc::clone(&self.state);
        let pipeline = self.pipeline.clone();
        let run_id = tokio::task::spawn_blocking(move || state.start_run(&pipeline))
            .await
            .map_err(|e| PipelineError::task("start_run", &e))?
            .map_err(|e| PipelineError::state("Failed to record run start", e))?;

        let counters = Arc::new(RunCounters::default());
        let outcome = self.execute(sources, cancel, &counters).await;
        let counts = counters.snapshot();

        let (status, error_message) = match &outcome {
            Ok((status, _)) => (*status, None),
            Err(e) => (RunStatus::Failed, Some(e.to_string())),
        };
        let stats = counts.to_run_stats(error_message);
        let state = Arc::clone(&self.state);
        tokio::task::spawn_blocking(move || state.complete_run(run_id, status, &stats))
            .await
            .map_err(|e| PipelineError::task("complete_run", &e))?
            .map_err(|e| PipelineError::state("Failed to record run completion", e))?;

        let duration_secs = start.elapsed().as_secs_f64();
        match outcome {
            Ok((status, recovered)) => {
                tracing::info!(
                    pipeline = self.pipeline.as_str(),
                    run_id,
                    status = %status,
                    records_read = counts.records_read,
                    records_written = counts.records_written,
                    records_dead_lettered = counts.records_dead_lettered,
                    duplicates_skipped = counts.duplicates_skipped,
                    retries = counts.retries,
                    duration_secs,
                    "Pipeline run finished"
                );
                Ok(PipelineResult {
                    pipeline: self.pipeline.to_string(),
                    run_id,
                    status,
                    counts,
                    recovered,
                    duration_secs,
                })
            }
            Err(err) => {
                if let Some(stage) = err.as_stage_error() {
                    tracing::error!(
                        pipeline = self.pipeline.as_str(),
                        run_id,
                        category = %stage.category,
                        scope = %stage.scope,
                        code = stage.code.as_str(),
                        "Pipeline run failed: {}",
                        stage.message
                    );
                } else {
                    tracing::error!(
                        pipeline = self.pipeline.as_str(),
                        run_id,
                        "Infrastructure error, failing pipeline: {}",
                        err
                    );
                }
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        sources: Vec<AnySource>,
        cancel: &CancellationToken,
        counters: &Arc<RunCounters>,
    ) -> Result<(RunStatus, u64), PipelineError> {
        let ids: Vec<SourceId> = sources.iter().map(|s| s.source_id().clone()).collect();
        let recovered = self.recover_sources(ids).await?;

        let token = cancel.child_token();
        let stages = self.stages(Arc::clone(counters));
        let mut workers = JoinSet::new();
        for lane in 0..self.buffer.lane_count() {
            let worker = LaneWorker {
                lane: self.buffer.lane(lane),
                buffer: self.buffer.clone(),
                stages: stages.clone(),
                checkpoints: self.checkpoints.clone(),
                registry: self.registry.clone(),
                batch_size: self.config.processing.batch_size,
            };
            workers.spawn(worker.run(token.clone()));
        }

        let driver = ConnectorDriver {
            buffer: self.buffer.clone(),
            checkpoints: self.checkpoints.clone(),
            sink: self.sink.clone(),
            counters: Arc::clone(counters),
            policy: self.config.processing.backoff_policy(),
            poll_size: self.config.processing.batch_size,
            poll_interval: Duration::from_millis(self.config.processing.poll_interval_ms),
        };
        let mut drivers = JoinSet::new();
        for source in sources {
            let driver = driver.clone();
            let token = token.clone();
            drivers.spawn(async move { driver.run(source, &token).await });
        }

        let mut outcome = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::info!(pipeline = self.pipeline.as_str(), "Shutdown requested");
                    break Ok(RunStatus::Cancelled);
                }
                Some(joined) = workers.join_next() => match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => break Err(e),
                    Err(e) => break Err(PipelineError::task("lane worker", &e)),
                },
                Some(joined) = drivers.join_next() => match joined {
                    Ok(Ok(_)) | Ok(Err(PipelineError::Cancelled)) => {}
                    Ok(Err(e)) => break Err(e),
                    Err(e) => break Err(PipelineError::task("source connector", &e)),
                },
                drained = self.buffer.wait_drained(), if drivers.is_empty() => match drained {
                    Ok(()) => break Ok(RunStatus::Completed),
                    Err(e) => break Err(e.into()),
                },
            }
        };

        // Workers finish any in-flight commit and checkpoint before exiting.
        token.cancel();
        while let Some(joined) = drivers.join_next().await {
            match joined {
                Ok(Ok(_)) | Ok(Err(PipelineError::Cancelled)) => {}
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Source connector failed during shutdown");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Source connector task panicked during shutdown");
                }
            }
        }
        while let Some(joined) = workers.join_next().await {
            let err = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(e) => PipelineError::task("lane worker", &e),
            };
            if outcome.is_ok() {
                outcome = Err(err);
            } else {
                tracing::warn!(error = %err, "Additional lane worker failure");
            }
        }

        outcome.map(|status| (status, recovered))
    }

    /// Resubmit dead-lettered records of `source` through transform and
    /// commit. The buffer and checkpoints are not touched; warehouse
    /// idempotence makes repeated replay safe.
    ///
    /// # Errors
    ///
    /// Returns a `PipelineError` if the state store or warehouse fails.
    pub async fn replay_dead_letters(
        &self,
        source: &SourceId,
        cancel: &CancellationToken,
    ) -> Result<ReplayReport, PipelineError> {
        let stages = self.stages(Arc::new(RunCounters::default()));
        let batch_size = self.config.processing.batch_size;
        let mut replay = self.sink.replay(source);
        let mut report = ReplayReport::default();

        loop {
            let (returned, chunk) = tokio::task::spawn_blocking(move || {
                let chunk: Result<Vec<Record>, _> = replay.by_ref().take(batch_size).collect();
                (replay, chunk)
            })
            .await
            .map_err(|e| PipelineError::task("dead-letter replay", &e))?;
            replay = returned;
            let mut chunk =
                chunk.map_err(|e| PipelineError::state("Failed to read dead-letter entries", e))?;
            if chunk.is_empty() {
                break;
            }
            chunk.sort_by_key(Record::offset);
            chunk.dedup_by_key(|r| r.offset());
            report.replayed += chunk.len() as u64;

            let transformed = stages.transform_all(chunk, cancel).await?;
            report.still_rejected += transformed.rejected.len() as u64;
            let accepted = transformed.accepted.len() as u64;
            let result = stages.commit(transformed.accepted, cancel).await?;
            report.applied += result.applied;
            report.duplicates += result.duplicates;
            report.still_rejected += accepted.saturating_sub(result.applied + result.duplicates);
        }

        tracing::info!(
            pipeline = self.pipeline.as_str(),
            source = %source,
            replayed = report.replayed,
            applied = report.applied,
            duplicates = report.duplicates,
            still_rejected = report.still_rejected,
            "Dead-letter replay finished"
        );
        Ok(report)
    }

    /// Checkpoints, buffer depth, dead-letter count, and recent runs.
    ///
    /// # Errors
    ///
    /// Returns a `PipelineError` if the state store or buffer fails.
    pub async fn status(&self) -> Result<StatusReport, PipelineError> {
        let checkpoints = self.checkpoints.list().await?;
        let depth = self.buffer.depth().await?;
        let pending_sources = self.buffer.pending_sources().await?;
        let dead_letters = self.sink.count(None).await?;
        let state = Arc::clone(&self.state);
        let pipeline = self.pipeline.clone();
        let recent_runs =
            tokio::task::spawn_blocking(move || state.recent_runs(&pipeline, RECENT_RUNS))
                .await
                .map_err(|e| PipelineError::task("recent_runs", &e))?
                .map_err(|e| PipelineError::state("Failed to read run history", e))?;

        Ok(StatusReport {
            pipeline: self.pipeline.to_string(),
            checkpoints,
            buffer_records: depth.records,
            buffer_bytes: depth.bytes,
            pending_sources,
            dead_letters,
            recent_runs,
            source_states: self.registry.snapshot(),
        })
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Run a pipeline over its configured file sources.
///
/// # Errors
///
/// Returns a `PipelineError` if the pipeline cannot be opened or storage
/// becomes unavailable.
pub async fn run_pipeline(
    config: &PipelineConfig,
    cancel: &CancellationToken,
) -> Result<PipelineResult, PipelineError> {
    let pipeline = Pipeline::open(config.clone()).map_err(PipelineError::Infrastructure)?;
    let sources = pipeline.configured_sources();
    pipeline.run(sources, cancel).await
}

/// Pre-flight check: configuration, source files, and every store.
///
/// # Errors
///
/// Returns an error if the configuration is invalid.
pub async fn check_pipeline(config: &PipelineConfig) -> Result<CheckResult> {
    tracing::info!(pipeline = config.pipeline, "Checking pipeline configuration");
    validate_pipeline(config)?;

    let sources = config
        .sources
        .iter()
        .map(|source| {
            let opened = check_source_path(source.kind, &source.path);
            let kind = match source.kind {
                SourceKind::Csv => "csv",
                SourceKind::Jsonl => "jsonl",
            };
            match opened {
                Ok(_) => {
                    tracing::info!(source = source.name, kind, "Source: OK");
                    SourceCheck {
                        name: source.name.clone(),
                        ok: true,
                        error: None,
                    }
                }
                Err(e) => {
                    tracing::error!(source = source.name, kind, "Source: FAILED: {:#}", e);
                    SourceCheck {
                        name: source.name.clone(),
                        ok: false,
                        error: Some(format!("{e:#}")),
                    }
                }
            }
        })
        .collect();

    let state_ok = report_check("State backend", create_state_backend(config).map(drop));
    let warehouse_ok = report_check("Warehouse", create_warehouse(config).map(drop));
    let buffer_ok = report_check("Buffer", create_buffer_store(&config.buffer).map(drop));

    Ok(CheckResult {
        pipeline: config.pipeline.clone(),
        sources,
        state_ok,
        warehouse_ok,
        buffer_ok,
    })
}

/// A CSV source may be a directory holding at least one `*.csv` file; any
/// other source must be a readable file.
fn check_source_path(kind: SourceKind, path: &Path) -> Result<()> {
    if kind == SourceKind::Csv && path.is_dir() {
        let files = list_csv_files(path)?;
        anyhow::ensure!(!files.is_empty(), "No *.csv files in {}", path.display());
        return Ok(());
    }
    anyhow::ensure!(!path.is_dir(), "{} is a directory", path.display());
    std::fs::File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    Ok(())
}

fn report_check(what: &str, result: Result<()>) -> bool {
    match result {
        Ok(()) => {
            tracing::info!("{what}: OK");
            true
        }
        Err(e) => {
            tracing::error!("{what}: FAILED: {:#}", e);
            false
        }
    }
}

/// # Errors
///
/// Returns a `PipelineError` if the pipeline cannot be opened or read.
pub async fn pipeline_status(config: &PipelineConfig) -> Result<StatusReport, PipelineError> {
    let pipeline = Pipeline::open(config.clone()).map_err(PipelineError::Infrastructure)?;
    pipeline.status().await
}

/// # Errors
///
/// Returns a `PipelineError` if the pipeline cannot be opened or read.
pub async fn list_dead_letters(
    config: &PipelineConfig,
    source: &str,
    limit: usize,
) -> Result<Vec<StoredDeadLetter>, PipelineError> {
    let pipeline = Pipeline::open(config.clone()).map_err(PipelineError::Infrastructure)?;
    pipeline.sink.list(&SourceId::new(source), limit).await
}

/// # Errors
///
/// Returns a `PipelineError` if the pipeline cannot be opened or storage
/// fails during replay.
pub async fn replay_dead_letters(
    config: &PipelineConfig,
    source: &str,
    cancel: &CancellationToken,
) -> Result<ReplayReport, PipelineError> {
    let pipeline = Pipeline::open(config.clone()).map_err(PipelineError::Infrastructure)?;
    pipeline
        .replay_dead_letters(&SourceId::new(source), cancel)
        .await
}
