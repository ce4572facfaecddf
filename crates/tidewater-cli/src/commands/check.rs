use std::path::Path;

use anyhow::{Context, Result};

use tidewater_engine::config::parser;
use tidewater_engine::orchestrator;

/// Execute the `check` command: validate configuration, sources, and stores.
pub async fn execute(pipeline_path: &Path) -> Result<()> {
    let config = parser::parse_pipeline(pipeline_path)
        .with_context(|| format!("Failed to parse pipeline: {}", pipeline_path.display()))?;

    let result = orchestrator::check_pipeline(&config).await?;
    println!("Pipeline structure: OK");

    for source in &result.sources {
        let label = format!("Source '{}':", source.name);
        if source.ok {
            println!("{label:20} OK");
        } else {
            println!("{label:20} FAILED");
        }
        if let Some(error) = &source.error {
            println!("  {error}");
        }
    }
    print_status("State backend:", result.state_ok);
    print_status("Warehouse:", result.warehouse_ok);
    print_status("Buffer:", result.buffer_ok);

    if result.is_ok() {
        println!("\nAll checks passed.");
        Ok(())
    } else {
        anyhow::bail!("One or more checks failed")
    }
}

fn print_status(label: &str, ok: bool) {
    println!("{label:20} {}", if ok { "OK" } else { "FAILED" });
}
