use std::path::Path;

use anyhow::Result;

use tidewater_engine::orchestrator;

/// Execute the `status` command: report durable pipeline state.
pub async fn execute(pipeline_path: &Path, json: bool) -> Result<()> {
    let config = super::load(pipeline_path)?;
    let report = orchestrator::pipeline_status(&config).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Pipeline '{}'", report.pipeline);
    println!(
        "  Buffer:        {} record(s), {} byte(s) pending",
        report.buffer_records, report.buffer_bytes
    );
    if !report.pending_sources.is_empty() {
        let pending: Vec<&str> = report.pending_sources.iter().map(|s| s.as_str()).collect();
        println!("  Pending:       {}", pending.join(", "));
    }
    println!("  Dead letters:  {}", report.dead_letters);

    println!("\nCheckpoints:");
    if report.checkpoints.is_empty() {
        println!("  (none)");
    }
    for checkpoint in &report.checkpoints {
        println!(
            "  {:20} {:>10}  {}",
            checkpoint.source.as_str(),
            checkpoint.offset.get(),
            checkpoint.updated_at
        );
    }

    println!("\nRecent runs:");
    if report.recent_runs.is_empty() {
        println!("  (none)");
    }
    for run in &report.recent_runs {
        println!(
            "  #{:<5} {:10} started {}  read {}  written {}  dead-lettered {}",
            run.id,
            run.status.as_str(),
            run.started_at,
            run.stats.records_read,
            run.stats.records_written,
            run.stats.records_dead_lettered,
        );
        if let Some(error) = &run.stats.error_message {
            println!("         error: {error}");
        }
    }
    Ok(())
}
