//! Execution subcommands: run, signal, cancel, suspend, resume, show, list.

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;
use serde_json::Value;
use stepwise_core::workflow::definition::load_definition_file;
use stepwise_types::context::ExecutionContext;
use stepwise_types::execution::{ExecutionStatus, WorkflowExecution};
use uuid::Uuid;

use super::{print_json, status_cell, step_status_cell};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub async fn run(
    state: &AppState,
    target: &str,
    vars: &[String],
    payload: Option<&str>,
    initiated_by: Option<String>,
    json: bool,
) -> Result<()> {
    let context = build_context(vars, payload, initiated_by)?;

    let path = Path::new(target);
    let exec = if path.is_file() {
        let def = load_definition_file(path)
            .with_context(|| format!("failed to load definition {}", path.display()))?;
        let report = state.engine.register(&def).await?;
        if !report.is_valid() {
            for issue in &report.errors {
                eprintln!("  {} {}", style("error").red(), issue);
            }
            bail!("'{}' has {} validation error(s)", def.name, report.errors.len());
        }
        state.engine.execute(&def, context).await?
    } else {
        let definition_id: Uuid = target
            .parse()
            .with_context(|| format!("'{target}' is neither a definition file nor a definition ID"))?;
        state.engine.execute_by_id(definition_id, context).await?
    };

    report_execution(&exec, "Execution", json)
}

/// Build the starting context from `--var`, `--payload` and `--initiated-by`.
pub(crate) fn build_context(
    vars: &[String],
    payload: Option<&str>,
    initiated_by: Option<String>,
) -> Result<ExecutionContext> {
    let mut context = ExecutionContext::new();
    for raw in vars {
        let (name, value) = parse_var(raw)?;
        context.set_variable(name, value);
    }
    if let Some(payload) = payload {
        context = context.with_trigger_payload(parse_json_arg("--payload", payload)?);
    }
    context.initiated_by = initiated_by;
    Ok(context)
}

/// Split `KEY=VALUE`; VALUE is JSON when it parses, a plain string otherwise.
pub(crate) fn parse_var(raw: &str) -> Result<(String, Value)> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("variable '{raw}' must be KEY=VALUE"))?;
    let name = name.trim();
    if name.is_empty() {
        bail!("variable '{raw}' has an empty name");
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

fn parse_json_arg(flag: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("{flag} is not valid JSON"))
}

// ---------------------------------------------------------------------------
// Signal / control
// ---------------------------------------------------------------------------

pub async fn signal(
    state: &AppState,
    execution_id: Uuid,
    step_id: &str,
    output: Option<&str>,
    json: bool,
) -> Result<()> {
    let output = match output {
        Some(raw) => parse_json_arg("--output", raw)?,
        None => Value::Object(Default::default()),
    };
    let exec = state.engine.signal(execution_id, step_id, output).await?;
    report_execution(&exec, &format!("Signalled step '{step_id}' of"), json)
}

pub async fn cancel(state: &AppState, execution_id: Uuid, json: bool) -> Result<()> {
    let exec = state.engine.cancel(execution_id).await?;
    report_execution(&exec, "Cancelled", json)
}

pub async fn suspend(state: &AppState, execution_id: Uuid, json: bool) -> Result<()> {
    let exec = state.engine.suspend(execution_id).await?;
    report_execution(&exec, "Suspended", json)
}

pub async fn resume(state: &AppState, execution_id: Uuid, json: bool) -> Result<()> {
    let exec = state.engine.resume(execution_id).await?;
    report_execution(&exec, "Resumed", json)
}

// ---------------------------------------------------------------------------
// Show
// ---------------------------------------------------------------------------

pub async fn show(state: &AppState, execution_id: Uuid, json: bool) -> Result<()> {
    let exec = state.engine.get_execution(execution_id).await?;
    if json {
        return print_json(&exec);
    }

    print_summary(&exec, "Execution");

    if !exec.step_executions.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("#").fg(Color::Cyan),
                Cell::new("Step"),
                Cell::new("Type"),
                Cell::new("Status"),
                Cell::new("Attempts"),
                Cell::new("Assigned"),
                Cell::new("Duration"),
                Cell::new("Error"),
            ]);

        for (i, step) in exec.step_executions.iter().enumerate() {
            let duration = if step.completed_at.is_some() {
                format!("{}ms", step.duration_ms())
            } else {
                "-".to_string()
            };
            let error = match (&step.error_code, &step.error_message) {
                (Some(code), Some(msg)) => format!("{}: {msg}", code.as_str()),
                (Some(code), None) => code.as_str().to_string(),
                (None, Some(msg)) => msg.clone(),
                (None, None) => "-".to_string(),
            };
            let assigned = match (&step.assigned_to, step.escalated) {
                (Some(who), true) => format!("{who} (escalated)"),
                (Some(who), false) => who.clone(),
                (None, _) => "-".to_string(),
            };
            table.add_row(vec![
                Cell::new(i + 1),
                Cell::new(&step.step_id),
                Cell::new(step.step_type.as_str()),
                step_status_cell(step.status),
                Cell::new(step.attempts),
                Cell::new(assigned),
                Cell::new(duration),
                Cell::new(error),
            ]);
        }
        println!("{table}");
    }

    if !exec.context.variables.is_empty() {
        let mut names: Vec<&String> = exec.context.variables.keys().collect();
        names.sort();
        println!();
        println!("  {}", style("Variables").bold());
        for name in names {
            println!("    {name} = {}", exec.context.variables[name]);
        }
    }

    let m = &exec.metrics;
    println!();
    println!(
        "  {} {}ms, steps {} completed / {} failed / {} skipped, actions {} run / {} failed, {} retries",
        style("Metrics").bold(),
        m.total_duration_ms,
        m.steps_completed,
        m.steps_failed,
        m.steps_skipped,
        m.actions_executed,
        m.actions_failed,
        m.retries
    );
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

pub async fn list(state: &AppState, status: Option<ExecutionStatus>, json: bool) -> Result<()> {
    let executions = state.engine.list_executions(status).await?;

    if json {
        let out: Vec<_> = executions
            .iter()
            .map(|e| {
                serde_json::json!({
                    "id": e.id,
                    "workflow": e.workflow_name,
                    "version": e.version,
                    "status": e.status,
                    "waiting_step": e.waiting_step(),
                    "created_at": e.created_at,
                    "completed_at": e.completed_at,
                })
            })
            .collect();
        return print_json(&out);
    }

    if executions.is_empty() {
        println!();
        println!("  No executions found.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Execution ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Status"),
            Cell::new("Waiting on"),
            Cell::new("Created"),
            Cell::new("Completed"),
        ]);

    for e in &executions {
        let completed = e
            .completed_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(e.id),
            Cell::new(format!("{} v{}", e.workflow_name, e.version)),
            status_cell(e.status),
            Cell::new(e.waiting_step().unwrap_or("-")),
            Cell::new(e.created_at.format("%Y-%m-%d %H:%M").to_string()),
            Cell::new(completed),
        ]);
    }

    println!("{table}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn report_execution(exec: &WorkflowExecution, verb: &str, json: bool) -> Result<()> {
    if json {
        return print_json(exec);
    }
    print_summary(exec, verb);
    println!();
    Ok(())
}

fn print_summary(exec: &WorkflowExecution, verb: &str) {
    let status = match exec.status {
        ExecutionStatus::Completed => style(exec.status.as_str()).green().bold(),
        ExecutionStatus::Failed | ExecutionStatus::Timeout | ExecutionStatus::Aborted => {
            style(exec.status.as_str()).red().bold()
        }
        ExecutionStatus::Cancelled => style(exec.status.as_str()).yellow().bold(),
        _ => style(exec.status.as_str()).cyan().bold(),
    };

    println!();
    println!("  {verb} {} of '{}' v{}: {status}", exec.id, style(&exec.workflow_name).cyan(), exec.version);
    if let Some(step) = exec.waiting_step() {
        let assigned = exec
            .last_step_execution(step)
            .and_then(|s| s.assigned_to.as_deref())
            .map(|who| format!(" (assigned to {who})"))
            .unwrap_or_default();
        println!("  Waiting on step '{}'{assigned}", style(step).yellow());
    }
    if let Some(failure) = &exec.failure {
        let at = failure
            .step_id
            .as_deref()
            .map(|s| format!(" at step '{s}'"))
            .unwrap_or_default();
        println!(
            "  {} [{}] {}{at}",
            style("Failure").red(),
            failure.code.as_str(),
            failure.message
        );
    }
}
