// pyfleet CLI
//
// Design Decision: Use clap derive for ergonomic argument parsing.
// Design Decision: Support text/json/yaml output formats for scripting.
// Design Decision: Flags override PYFLEET_* environment configuration, which
// overrides built-in defaults.

mod commands;
mod fleet;
mod output;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use pyfleet_core::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "pyfleet")]
#[command(about = "pyfleet CLI - Run commands on a pool of Python workers")]
#[command(version)]
pub struct Cli {
    /// Worker script launched for each worker
    #[arg(long, env = "PYFLEET_SCRIPT")]
    pub script: Option<PathBuf>,

    /// Python interpreter
    #[arg(long, env = "PYFLEET_PYTHON")]
    pub python: Option<String>,

    /// Number of workers
    #[arg(long, env = "PYFLEET_POOL_SIZE")]
    pub size: Option<usize>,

    /// Use in-process scripted workers instead of Python
    #[arg(long)]
    pub in_memory: bool,

    /// Output format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json", "yaml"])]
    pub output: String,

    /// Suppress non-essential output
    #[arg(long, short)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute one command on a worker
    Exec {
        /// Command name understood by the worker
        command: String,

        /// Arguments as a JSON object
        #[arg(long, short, default_value = "{}")]
        args: String,

        /// Route through a session's worker
        #[arg(long, short)]
        session: Option<String>,

        /// Attempts including the first (defaults to PYFLEET_RETRY_MAX_ATTEMPTS)
        #[arg(long)]
        attempts: Option<u32>,

        /// Circuit breaker to route the call through
        #[arg(long)]
        circuit: Option<String>,
    },

    /// Probe every worker and report their health
    Health,

    /// Show pool and worker status
    Status {
        /// Include transition history per worker
        #[arg(long)]
        history: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine
    let _ = dotenvy::dotenv();
    init_telemetry(TelemetryConfig::from_env());

    let cli = Cli::parse();
    let output_format = output::OutputFormat::from_str(&cli.output);
    let fleet = fleet::Fleet::start(&cli)
        .await
        .context("failed to start worker pool")?;

    let result = match cli.command {
        Commands::Exec {
            command,
            args,
            session,
            attempts,
            circuit,
        } => {
            commands::exec::run(
                &fleet,
                output_format,
                commands::exec::ExecArgs {
                    command,
                    args,
                    session,
                    attempts,
                    circuit,
                },
            )
            .await
        }
        Commands::Health => commands::health::run(&fleet, output_format, cli.quiet).await,
        Commands::Status { history } => {
            commands::status::run(&fleet, output_format, cli.quiet, history)
        }
    };

    fleet.shutdown().await;
    result
}
