use std::path::Path;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use tidewater_engine::orchestrator;

/// Execute the `run` command: parse, validate, and run a pipeline.
pub async fn execute(pipeline_path: &Path) -> Result<()> {
    let config = super::load(pipeline_path)?;

    tracing::info!(
        pipeline = config.pipeline,
        sources = config.sources.len(),
        lanes = config.buffer.lanes,
        "Pipeline validated"
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received, stopping after in-flight commits");
            on_signal.cancel();
        }
    });

    let result = orchestrator::run_pipeline(&config, &cancel).await?;
    let counts = result.counts;

    println!("Pipeline '{}' {}.", result.pipeline, result.status);
    println!("  Run id:           {}", result.run_id);
    println!("  Records read:     {}", counts.records_read);
    println!("  Records written:  {}", counts.records_written);
    println!("  Dead-lettered:    {}", counts.records_dead_lettered);
    println!("  Duplicates:       {}", counts.duplicates_skipped);
    if counts.retries > 0 {
        println!("  Retries:          {}", counts.retries);
    }
    if result.recovered > 0 {
        println!("  Recovered:        {}", result.recovered);
    }
    println!("  Duration:         {:.2}s", result.duration_secs);
    if result.duration_secs > 0.0 {
        #[allow(clippy::cast_precision_loss)]
        let rate = counts.records_written as f64 / result.duration_secs;
        println!("  Throughput:       {rate:.0} records/sec");
    }

    // Machine-readable JSON for scripts
    println!("@@TIDEWATER_JSON@@{}", serde_json::to_string(&result)?);

    Ok(())
}
