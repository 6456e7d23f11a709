//! Athena CLI - Main entry point

mod cli;

use athena_foundation::AthenaConfig;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Athena - task scheduler with retries and log archival
#[derive(Parser, Debug)]
#[command(name = "athena")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Directory holding the task database (overrides config)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler until Ctrl-C
    Serve,
    /// Submit a shell command as a new task
    Submit {
        /// Command executed with `sh -c`
        command: String,

        /// Task type label
        #[arg(short = 't', long = "type", default_value = "shell")]
        task_type: String,

        /// Attempts allowed (config default when omitted)
        #[arg(short, long)]
        max_tries: Option<u32>,
    },
    /// List task records
    List {
        /// Only show one stage
        #[arg(short, long, value_enum)]
        stage: Option<Stage>,

        /// Records shown per stage
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
    /// Print the archived log of a finished task
    Logs {
        task_id: i64,

        /// First line, 0-based
        #[arg(short, long, default_value = "0")]
        line: usize,

        /// Maximum number of lines
        #[arg(short, long, default_value = "100")]
        rows: usize,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Waiting,
    Running,
    Finished,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    // Load configuration
    let mut config = AthenaConfig::load().unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config: {}", e);
        AthenaConfig::default()
    });
    if let Some(dir) = args.data_dir {
        config = config.with_data_dir(dir);
    }
    config.validate()?;

    match args.command {
        Command::Serve => cli::serve(&config).await,
        Command::Submit {
            command,
            task_type,
            max_tries,
        } => cli::submit(&config, &task_type, &command, max_tries),
        Command::List { stage, limit } => cli::list(&config, stage, limit),
        Command::Logs { task_id, line, rows } => cli::logs(&config, task_id, line, rows).await,
    }
}
