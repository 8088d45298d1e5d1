//! Definition subcommands: validate, register, list.

use std::path::Path;

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use conflux_core::workflow::definition::load_definition_file;
use conflux_types::workflow::{DependencyMode, StepKind, WorkflowDefinition};

use crate::state::AppState;

/// Parse and validate a file. Never touches the database.
pub fn validate(file: &Path, json: bool) -> Result<()> {
    let def = load_definition_file(file)
        .with_context(|| format!("{} is not a valid definition", file.display()))?;

    if json {
        let out = serde_json::json!({
            "valid": true,
            "id": def.id,
            "steps": def.steps.len(),
            "error_handlers": def.error_handlers.len(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} '{}' is valid",
        style("*").green().bold(),
        style(&def.id).cyan()
    );
    print_steps(&def);
    println!();
    Ok(())
}

pub async fn register(state: &AppState, file: &Path, json: bool) -> Result<()> {
    let def = load_definition_file(file)
        .with_context(|| format!("{} is not a valid definition", file.display()))?;
    let steps = def.steps.len();
    let reference = state.engine.register_definition(def).await?;

    if json {
        let out = serde_json::json!({
            "id": reference.id,
            "version": reference.version,
            "steps": steps,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Registered '{}' version {}",
        style("*").green().bold(),
        style(&reference.id).cyan(),
        reference.version
    );
    println!(
        "  Start an instance: {}",
        style(format!("cflx run {}", reference.id)).dim()
    );
    println!();
    Ok(())
}

pub async fn list(state: &AppState, json: bool) -> Result<()> {
    let defs = state.engine.list_definitions().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&defs)?);
        return Ok(());
    }

    if defs.is_empty() {
        println!();
        println!("  No definitions registered.");
        println!(
            "  Register one with: {}",
            style("cflx register <file.yaml>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![Cell::new("Definition").fg(Color::Cyan), Cell::new("Version")]);
    for d in &defs {
        table.add_row(vec![Cell::new(&d.id), Cell::new(d.version)]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn print_steps(def: &WorkflowDefinition) {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Type"),
            Cell::new("Detail"),
            Cell::new("Depends on"),
            Cell::new("Attempts"),
        ]);

    for step in &def.steps {
        let detail = match &step.kind {
            StepKind::RemoteCall(call) => format!("{} {} {}", call.method, call.target, call.path),
            StepKind::EventWait(wait) => format!("awaits {}", wait.event_type),
        };
        let deps: Vec<String> = step
            .depends_on
            .iter()
            .map(|dep| match dep.require {
                DependencyMode::Completion => dep.step.clone(),
                DependencyMode::Success => format!("{} (success)", dep.step),
            })
            .collect();
        table.add_row(vec![
            Cell::new(&step.name),
            Cell::new(step.type_name()),
            Cell::new(detail),
            Cell::new(deps.join(", ")),
            Cell::new(step.retry.max_attempts),
        ]);
    }

    println!();
    println!("{table}");
}
