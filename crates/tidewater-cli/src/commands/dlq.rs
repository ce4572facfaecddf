use std::path::Path;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use tidewater_engine::orchestrator;

/// Execute `dlq list`: print dead-lettered records of one source.
pub async fn list(pipeline_path: &Path, source: &str, limit: usize) -> Result<()> {
    let config = super::load(pipeline_path)?;
    let entries = orchestrator::list_dead_letters(&config, source, limit).await?;

    if entries.is_empty() {
        println!("No dead-lettered records for source '{source}'.");
        return Ok(());
    }
    for stored in &entries {
        let entry = &stored.entry;
        println!(
            "#{} offset {} [{}] {} ({} attempt(s), failed at {})",
            stored.id,
            entry.record.offset().get(),
            entry.error_category,
            entry.error_message,
            entry.attempts.len(),
            entry.failed_at,
        );
        println!(
            "    {}",
            String::from_utf8_lossy(entry.record.payload().as_bytes())
        );
    }
    Ok(())
}

/// Execute `dlq replay`: resubmit dead-lettered records through the pipeline.
pub async fn replay(pipeline_path: &Path, source: &str) -> Result<()> {
    let config = super::load(pipeline_path)?;
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let report = orchestrator::replay_dead_letters(&config, source, &cancel).await?;
    println!("Replayed {} record(s) from source '{source}'.", report.replayed);
    println!("  Applied:         {}", report.applied);
    println!("  Already present: {}", report.duplicates);
    println!("  Still rejected:  {}", report.still_rejected);
    println!("@@TIDEWATER_JSON@@{}", serde_json::to_string(&report)?);
    Ok(())
}
