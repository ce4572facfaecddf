mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::logging::LogFormat;

#[derive(Parser)]
#[command(
    name = "tidewater",
    version,
    about = "Ingest records into a warehouse with effectively-once delivery"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline until its sources are exhausted (Ctrl-C stops cleanly)
    Run {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
    },
    /// Validate pipeline configuration, source files, and stores
    Check {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
    },
    /// Show checkpoints, buffer depth, dead letters, and recent runs
    Status {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect or replay dead-lettered records
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },
}

#[derive(Subcommand)]
enum DlqCommands {
    /// List dead-lettered records of one source
    List {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Source name
        #[arg(long)]
        source: String,
        /// Maximum entries to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Resubmit dead-lettered records of one source through transform and commit
    Replay {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Source name
        #[arg(long)]
        source: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before anything reads the environment; existing variables win.
    let dotenv = dotenvy::dotenv().ok();

    let cli = Cli::parse();

    logging::init(&cli.log_level, cli.log_format);
    if let Some(path) = dotenv {
        tracing::debug!(path = %path.display(), "Loaded environment file");
    }

    match cli.command {
        Commands::Run { pipeline } => commands::run::execute(&pipeline).await,
        Commands::Check { pipeline } => commands::check::execute(&pipeline).await,
        Commands::Status { pipeline, json } => commands::status::execute(&pipeline, json).await,
        Commands::Dlq { command } => match command {
            DlqCommands::List {
                pipeline,
                source,
                limit,
            } => commands::dlq::list(&pipeline, &source, limit).await,
            DlqCommands::Replay { pipeline, source } => {
                commands::dlq::replay(&pipeline, &source).await
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_dlq_list_with_defaults() {
        let cli = Cli::try_parse_from(["tidewater", "dlq", "list", "p.yaml", "--source", "orders"])
            .unwrap();
        let Commands::Dlq {
            command: DlqCommands::List { source, limit, .. },
        } = cli.command
        else {
            panic!("expected dlq list");
        };
        assert_eq!(source, "orders");
        assert_eq!(limit, 20);
        assert_eq!(cli.log_format, LogFormat::Text);
    }

    #[test]
    fn global_log_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "tidewater",
            "run",
            "p.yaml",
            "--log-format",
            "json",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(cli.log_level, "debug");
    }

    #[test]
    fn env_file_values_reach_pipeline_substitution() {
        std::env::remove_var("TW_CLI_ENV_FILE_DIR");
        std::env::set_var("TW_CLI_ENV_FILE_LANES", "3");
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join(".env");
        std::fs::write(
            &env_file,
            "TW_CLI_ENV_FILE_DIR=/srv/tidewater\nTW_CLI_ENV_FILE_LANES=9\n",
        )
        .unwrap();
        dotenvy::from_path(&env_file).unwrap();

        let config = tidewater_engine::config::parser::parse_pipeline_str(
            r#"
version: "1.0"
pipeline: env_file
sources:
  - name: orders
    kind: csv
    path: ${TW_CLI_ENV_FILE_DIR}/orders.csv
buffer:
  lanes: ${TW_CLI_ENV_FILE_LANES}
warehouse:
  backend: memory
state:
  backend: ${TW_CLI_ENV_FILE_STATE:-memory}
"#,
        )
        .unwrap();
        assert_eq!(
            config.sources[0].path,
            PathBuf::from("/srv/tidewater/orders.csv")
        );
        // Already-set variables are not overridden by the file.
        assert_eq!(config.buffer.lanes, 3);
        std::env::remove_var("TW_CLI_ENV_FILE_DIR");
        std::env::remove_var("TW_CLI_ENV_FILE_LANES");
    }
}
