//! Stepwise command-line entry point.
//!
//! Binary name: `stepwise`
//!
//! Parses CLI arguments, sets up tracing, opens the engine over the SQLite
//! store in the data directory, then dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;
use stepwise_observe::tracing_setup::{init_tracing, shutdown_tracing, LogFormat, TracingOptions};

use cli::{Cli, Commands, ListResource};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&TracingOptions {
        default_filter: cli.log_filter().to_string(),
        format: if cli.log_json { LogFormat::Json } else { LogFormat::Pretty },
        enable_otel: cli.otel,
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = run(cli).await;
    shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let json = cli.json;

    match cli.command {
        // No database needed
        Commands::Validate { file } => cli::definition::validate(&file, json).await,
        Commands::Config { init, force } => cli::config::handle_config(init, force, json).await,
        command => {
            let state = AppState::init().await?;
            dispatch(&state, command, json).await
        }
    }
}

async fn dispatch(state: &AppState, command: Commands, json: bool) -> anyhow::Result<()> {
    match command {
        Commands::Register { path } => cli::definition::register(state, &path, json).await,

        Commands::Run {
            target,
            vars,
            payload,
            initiated_by,
        } => cli::execution::run(state, &target, &vars, payload.as_deref(), initiated_by, json).await,

        Commands::Signal {
            execution_id,
            step_id,
            output,
        } => cli::execution::signal(state, execution_id, &step_id, output.as_deref(), json).await,

        Commands::Cancel { execution_id } => cli::execution::cancel(state, execution_id, json).await,
        Commands::Suspend { execution_id } => cli::execution::suspend(state, execution_id, json).await,
        Commands::Resume { execution_id } => cli::execution::resume(state, execution_id, json).await,
        Commands::Show { execution_id } => cli::execution::show(state, execution_id, json).await,

        Commands::List { resource } => match resource {
            ListResource::Definitions => cli::definition::list(state, json).await,
            ListResource::Executions { status } => cli::execution::list(state, status, json).await,
        },

        Commands::Worker { interval_ms } => cli::worker::run_worker(state, interval_ms, json).await,

        // Handled in `run` before the database is opened
        Commands::Validate { .. } | Commands::Config { .. } => Ok(()),
    }
}
