//! CLI command definitions for the `stepwise` binary.
//!
//! Uses clap derive macros for argument parsing. Definitions are authored as
//! YAML/JSON files; executions are addressed by UUID.

pub mod config;
pub mod definition;
pub mod execution;
pub mod worker;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use comfy_table::{Cell, Color};
use serde::Serialize;
use stepwise_types::execution::{ExecutionStatus, StepExecutionStatus};
use uuid::Uuid;

/// Run and inspect durable workflows.
#[derive(Parser)]
#[command(name = "stepwise", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit log lines as JSON.
    #[arg(long, global = true, env = "STEPWISE_LOG_JSON")]
    pub log_json: bool,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Log filter used when `RUST_LOG` is unset.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 if self.quiet => "error",
            0 => "warn",
            1 => "info,stepwise_core=debug,stepwise_infra=debug",
            _ => "trace",
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a definition file without storing it.
    Validate {
        /// Path to a YAML or JSON definition.
        file: PathBuf,
    },

    /// Validate and store definitions from a file or a directory tree.
    Register {
        /// Definition file, or a directory searched recursively.
        path: PathBuf,
    },

    /// Start an execution and drive it until it finishes or waits.
    Run {
        /// Stored definition ID, or a definition file (registered first).
        target: String,

        /// Process variable as KEY=VALUE. VALUE is parsed as JSON when it can be.
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,

        /// JSON trigger payload.
        #[arg(long)]
        payload: Option<String>,

        /// Principal recorded as the initiator.
        #[arg(long)]
        initiated_by: Option<String>,
    },

    /// Complete a waiting user task or event step.
    Signal {
        execution_id: Uuid,
        step_id: String,

        /// JSON output for the step.
        #[arg(long)]
        output: Option<String>,
    },

    /// Cancel an execution.
    Cancel { execution_id: Uuid },

    /// Pause an execution at its next step boundary.
    Suspend { execution_id: Uuid },

    /// Continue a suspended execution.
    Resume { execution_id: Uuid },

    /// Show an execution with its step audit trail.
    Show { execution_id: Uuid },

    /// List stored resources.
    #[command(alias = "ls")]
    List {
        #[command(subcommand)]
        resource: ListResource,
    },

    /// Recover interrupted executions and fire durable timers until Ctrl+C.
    Worker {
        /// Poll interval override in milliseconds.
        #[arg(long)]
        interval_ms: Option<u64>,
    },

    /// Show the effective engine configuration.
    Config {
        /// Write the current configuration to config.toml.
        #[arg(long)]
        init: bool,

        /// Overwrite an existing config.toml.
        #[arg(long, requires = "init")]
        force: bool,
    },
}

#[derive(Subcommand)]
pub enum ListResource {
    /// Latest version of every stored definition.
    Definitions,

    /// Executions, oldest first.
    Executions {
        /// Only executions with this status.
        #[arg(long)]
        status: Option<ExecutionStatus>,
    },
}

// ---------------------------------------------------------------------------
// Shared output helpers
// ---------------------------------------------------------------------------

/// snake_case name of a serde enum value.
pub(crate) fn label<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => "-".to_string(),
    }
}

pub(crate) fn status_cell(status: ExecutionStatus) -> Cell {
    let color = match status {
        ExecutionStatus::Pending => Color::Yellow,
        ExecutionStatus::Running => Color::Blue,
        ExecutionStatus::Suspended => Color::Magenta,
        ExecutionStatus::Completed => Color::Green,
        ExecutionStatus::Failed | ExecutionStatus::Timeout | ExecutionStatus::Aborted => Color::Red,
        ExecutionStatus::Cancelled => Color::DarkYellow,
    };
    Cell::new(status.as_str()).fg(color)
}

pub(crate) fn step_status_cell(status: StepExecutionStatus) -> Cell {
    let color = match status {
        StepExecutionStatus::Pending | StepExecutionStatus::Waiting => Color::Yellow,
        StepExecutionStatus::Running => Color::Blue,
        StepExecutionStatus::Completed => Color::Green,
        StepExecutionStatus::Skipped => Color::DarkGrey,
        StepExecutionStatus::Failed | StepExecutionStatus::Timeout => Color::Red,
    };
    Cell::new(label(&status)).fg(color)
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_maps_to_filter() {
        let cli = Cli::parse_from(["stepwise", "-q", "list", "definitions"]);
        assert_eq!(cli.log_filter(), "error");
        let cli = Cli::parse_from(["stepwise", "-vv", "list", "definitions"]);
        assert_eq!(cli.log_filter(), "trace");
        let cli = Cli::parse_from(["stepwise", "list", "definitions"]);
        assert_eq!(cli.log_filter(), "warn");
    }

    #[test]
    fn test_parse_run_and_list_status() {
        let cli = Cli::parse_from([
            "stepwise", "run", "flows/expense.yaml", "--var", "amount=120", "--var", "owner=ana",
        ]);
        match cli.command {
            Commands::Run { target, vars, .. } => {
                assert_eq!(target, "flows/expense.yaml");
                assert_eq!(vars, vec!["amount=120", "owner=ana"]);
            }
            _ => panic!("expected run"),
        }

        let cli = Cli::parse_from(["stepwise", "ls", "executions", "--status", "suspended"]);
        match cli.command {
            Commands::List {
                resource: ListResource::Executions { status },
            } => assert_eq!(status, Some(ExecutionStatus::Suspended)),
            _ => panic!("expected list executions"),
        }

        assert!(Cli::try_parse_from(["stepwise", "cancel", "not-a-uuid"]).is_err());
        assert!(Cli::try_parse_from(["stepwise", "config", "--force"]).is_err());
    }

    #[test]
    fn test_label_uses_serde_names() {
        assert_eq!(label(&StepExecutionStatus::Waiting), "waiting");
        assert_eq!(label(&ExecutionStatus::Timeout), "timeout");
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
