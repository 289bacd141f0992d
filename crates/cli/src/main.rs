// claimq CLI
//
// Design Decision: Use clap derive with `env =` so flags, environment and .env share one path.
// Design Decision: Support text/json/yaml output formats for scripting.
// Design Decision: Exit code 2 is reserved for "store unreachable" so supervisors can restart with backoff.

mod commands;
mod executors;
mod output;
mod telemetry;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use claimq_durable::persistence::StoreError;
use claimq_durable::worker::{PollerError, WorkerError};

#[derive(Parser)]
#[command(name = "claimq")]
#[command(about = "claimq - Durable task queue with atomic worker claiming")]
#[command(version)]
pub struct Cli {
    /// Database URL (memory:, sqlite:<path>, postgres://...)
    #[arg(
        long,
        global = true,
        env = "CLAIMQ_DATABASE_URL",
        default_value = "sqlite://claimq.db"
    )]
    pub database_url: String,

    /// Output format
    #[arg(long, short, global = true, default_value = "text", value_parser = ["text", "json", "yaml"])]
    pub output: String,

    /// Log format
    #[arg(long, global = true, env = "CLAIMQ_LOG_FORMAT", default_value = "text", value_parser = ["text", "json"])]
    pub log_format: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run workers
    Worker {
        #[command(subcommand)]
        command: commands::worker::WorkerCommand,
    },

    /// Run the stale-claim reaper on its own
    Reaper {
        #[command(subcommand)]
        command: commands::reaper::ReaperCommand,
    },

    /// Add a task to the queue
    Enqueue(commands::enqueue::EnqueueArgs),

    /// Show queue counts or one task
    Status {
        /// Task ID
        #[arg(long)]
        task: Option<i64>,
    },

    /// Show or change stored queue settings
    Config {
        #[command(subcommand)]
        command: commands::config::ConfigCommand,
    },

    /// Create the database schema
    Migrate,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load before parsing so `env =` flags see .env values
    let dotenv = dotenvy::dotenv();

    let cli = Cli::parse();
    telemetry::init(telemetry::TelemetryConfig::from_env(&cli.log_format));
    if let Ok(path) = dotenv {
        tracing::debug!("Loaded .env from {}", path.display());
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "claimq failed");
            eprintln!("Error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let output_format = output::OutputFormat::from_str(&cli.output);
    let database_url = cli.database_url.as_str();

    match cli.command {
        Commands::Worker { command } => {
            commands::worker::run(command, database_url, output_format).await
        }
        Commands::Reaper { command } => {
            commands::reaper::run(command, database_url, output_format).await
        }
        Commands::Enqueue(args) => commands::enqueue::run(args, database_url, output_format).await,
        Commands::Status { task } => commands::status::run(database_url, output_format, task).await,
        Commands::Config { command } => {
            commands::config::run(command, database_url, output_format).await
        }
        Commands::Migrate => commands::migrate::run(database_url, output_format).await,
    }
}

/// 2 when the store could not be reached, 1 otherwise
fn exit_code(err: &anyhow::Error) -> u8 {
    let unavailable = err.chain().any(|cause| {
        if let Some(e) = cause.downcast_ref::<StoreError>() {
            return e.is_unavailable();
        }
        if let Some(e) = cause.downcast_ref::<WorkerError>() {
            return e.is_store_unavailable();
        }
        matches!(
            cause.downcast_ref::<PollerError>(),
            Some(PollerError::StoreUnavailable { .. })
        )
    });

    if unavailable {
        2
    } else {
        1
    }
}
