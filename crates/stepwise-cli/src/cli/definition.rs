//! Definition subcommands: validate, register, list.

use std::path::Path;

use anyhow::{bail, Context, Result};
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;
use serde_json::json;
use stepwise_core::repository::execution::ExecutionRepository;
use stepwise_core::workflow::definition::{discover_definitions, load_definition_file};
use stepwise_core::workflow::validate_definition;
use stepwise_types::definition::{TriggerConfig, WorkflowDefinition};
use stepwise_types::validation::ValidationReport;

use super::{label, print_json};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

pub async fn validate(file: &Path, json: bool) -> Result<()> {
    let def = load_definition_file(file)
        .with_context(|| format!("failed to load definition {}", file.display()))?;
    let report = validate_definition(&def);

    if json {
        print_json(&json!({
            "id": def.id,
            "name": def.name,
            "version": def.version,
            "valid": report.is_valid(),
            "report": report,
        }))?;
    } else {
        println!();
        print_report(&def, &report);
    }

    if !report.is_valid() {
        bail!("'{}' has {} validation error(s)", def.name, report.errors.len());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Register
// ---------------------------------------------------------------------------

pub async fn register(state: &AppState, path: &Path, json: bool) -> Result<()> {
    let defs: Vec<WorkflowDefinition> = if path.is_dir() {
        discover_definitions(path)
            .with_context(|| format!("failed to scan {}", path.display()))?
            .into_iter()
            .map(|(_, def)| def)
            .collect()
    } else {
        vec![load_definition_file(path).with_context(|| format!("failed to load definition {}", path.display()))?]
    };

    if defs.is_empty() {
        bail!("no definitions found under {}", path.display());
    }

    let mut results = Vec::with_capacity(defs.len());
    for def in &defs {
        let report = state
            .engine
            .register(def)
            .await
            .with_context(|| format!("failed to register '{}'", def.name))?;
        results.push((def, report));
    }
    let rejected = results.iter().filter(|(_, r)| !r.is_valid()).count();

    if json {
        let out: Vec<_> = results
            .iter()
            .map(|(def, report)| {
                json!({
                    "id": def.id,
                    "name": def.name,
                    "version": def.version,
                    "registered": report.is_valid(),
                    "report": report,
                })
            })
            .collect();
        print_json(&out)?;
    } else {
        println!();
        for (def, report) in &results {
            if report.is_valid() {
                println!(
                    "  {} Registered '{}' v{} ({})",
                    style("*").green().bold(),
                    style(&def.name).cyan(),
                    def.version,
                    def.id
                );
                for w in &report.warnings {
                    println!("    {} {}", style("warning").yellow(), w);
                }
            } else {
                print_report(def, report);
            }
        }
        println!();
    }

    if rejected > 0 {
        bail!("{rejected} definition(s) rejected by validation");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

pub async fn list(state: &AppState, json: bool) -> Result<()> {
    let defs = state
        .engine
        .repository()
        .list_definitions()
        .await
        .context("failed to list definitions")?;

    if json {
        let out: Vec<_> = defs
            .iter()
            .map(|d| {
                json!({
                    "id": d.id,
                    "name": d.name,
                    "version": d.version,
                    "status": label(&d.status),
                    "tenant_id": d.tenant_id,
                    "steps": d.steps.len(),
                    "trigger": trigger_summary(&d.trigger),
                })
            })
            .collect();
        return print_json(&out);
    }

    if defs.is_empty() {
        println!();
        println!("  No definitions registered. Use `stepwise register <file>`.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("ID"),
            Cell::new("Version"),
            Cell::new("Status"),
            Cell::new("Steps"),
            Cell::new("Trigger"),
        ]);

    for d in &defs {
        table.add_row(vec![
            Cell::new(&d.name),
            Cell::new(d.id),
            Cell::new(d.version),
            Cell::new(label(&d.status)),
            Cell::new(d.steps.len()),
            Cell::new(trigger_summary(&d.trigger)),
        ]);
    }

    println!("{table}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn trigger_summary(trigger: &TriggerConfig) -> String {
    match trigger {
        TriggerConfig::Manual {} => "manual".to_string(),
        TriggerConfig::Schedule { cron, timezone } => match timezone {
            Some(tz) => format!("schedule {cron} ({tz})"),
            None => format!("schedule {cron}"),
        },
        TriggerConfig::Event { event_type } => format!("event {event_type}"),
        TriggerConfig::Webhook { path } => format!("webhook {path}"),
    }
}

fn print_report(def: &WorkflowDefinition, report: &ValidationReport) {
    let verdict = if report.is_valid() {
        style("valid").green().bold()
    } else {
        style("invalid").red().bold()
    };
    println!("  '{}' v{} is {}", style(&def.name).cyan(), def.version, verdict);

    if report.errors.is_empty() && report.warnings.is_empty() {
        return;
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Severity").fg(Color::Cyan),
            Cell::new("Code"),
            Cell::new("Location"),
            Cell::new("Message"),
        ]);

    let rows = report
        .errors
        .iter()
        .map(|i| (Cell::new("error").fg(Color::Red), i))
        .chain(report.warnings.iter().map(|i| (Cell::new("warning").fg(Color::Yellow), i)));
    for (severity, issue) in rows {
        let location = issue
            .step_id
            .as_deref()
            .map(|s| format!("step {s}"))
            .or_else(|| issue.transition_id.as_deref().map(|t| format!("transition {t}")))
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            severity,
            Cell::new(issue.code.as_str()),
            Cell::new(location),
            Cell::new(&issue.message),
        ]);
    }
    println!("{table}");
}
