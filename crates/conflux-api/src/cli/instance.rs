//! Instance subcommands: run, show, list, replay.

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::{Map, Value};
use uuid::Uuid;

use conflux_types::instance::{InstanceState, StateLogEntry, StepStatus, WorkflowInstance};

use crate::state::AppState;

/// Parse `--context` into the initial context map.
pub fn parse_context(raw: Option<&str>) -> Result<Map<String, Value>> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str::<Value>(raw).context("--context is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("--context must be a JSON object, got {}", json_type(&other)),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

pub struct RunArgs<'a> {
    pub definition: &'a str,
    pub version: Option<u32>,
    pub context: Option<&'a str>,
    pub correlation_id: Option<String>,
    pub wait: bool,
}

/// Start an instance. With `wait`, drive it here until it reaches a
/// terminal state or the process is interrupted.
pub async fn run(state: &AppState, args: RunArgs<'_>, json: bool) -> Result<()> {
    let context = parse_context(args.context)?;
    let id = state
        .engine
        .start_instance(args.definition, args.version, context, args.correlation_id)
        .await?;

    if !args.wait {
        if json {
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "id": id }))?);
        } else {
            println!();
            println!(
                "  {} Started instance of '{}'",
                style("*").green().bold(),
                style(args.definition).cyan()
            );
            println!("  Instance: {id}");
            println!(
                "  It continues under {}; inspect with {}",
                style("cflx serve").dim(),
                style(format!("cflx show {id}")).dim()
            );
            println!();
        }
        return Ok(());
    }

    if !json {
        println!();
        println!(
            "  {} Running instance {} of '{}'",
            style("⚡").bold(),
            id,
            style(args.definition).cyan()
        );
    }

    let instance = tokio::select! {
        result = state.engine.wait_for_terminal(id) => result?,
        _ = crate::shutdown_signal() => {
            if !json {
                println!(
                    "  {}",
                    style("Interrupted; the instance resumes on the next `cflx serve`.").yellow()
                );
            }
            return Ok(());
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&instance)?);
    } else {
        print_instance(&instance, &[]);
    }
    Ok(())
}

pub async fn show(state: &AppState, id: Uuid, with_log: bool, json: bool) -> Result<()> {
    let snapshot = state.engine.get_state(id).await?;
    let log = if with_log {
        state.engine.state_log(id).await?
    } else {
        Vec::new()
    };

    if json {
        let mut out = serde_json::to_value(&snapshot)?;
        if with_log {
            out["log"] = serde_json::to_value(&log)?;
        }
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    print_instance(&snapshot.instance, &snapshot.ready_steps);
    if with_log {
        print_log(&log);
    }
    Ok(())
}

pub async fn list(state: &AppState, active_only: bool, json: bool) -> Result<()> {
    let instances = state.engine.list_instances(active_only).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&instances)?);
        return Ok(());
    }

    if instances.is_empty() {
        println!();
        println!("  No instances.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Instance").fg(Color::Cyan),
            Cell::new("Definition"),
            Cell::new("State"),
            Cell::new("Correlation"),
            Cell::new("Updated"),
        ]);
    for summary in &instances {
        table.add_row(vec![
            Cell::new(summary.id),
            Cell::new(&summary.definition),
            Cell::new(summary.state.as_str()).fg(state_color(summary.state)),
            Cell::new(&summary.correlation_id),
            Cell::new(summary.updated_at.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

/// Rebuild the instance from the stored log alone.
pub async fn replay(state: &AppState, id: Uuid, json: bool) -> Result<()> {
    let instance = state
        .engine
        .replay(id)
        .await
        .with_context(|| format!("state log of {id} does not replay"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&instance)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Replayed {} log entries",
        style("*").green().bold(),
        instance.last_seq
    );
    print_instance(&instance, &[]);
    Ok(())
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn state_color(state: InstanceState) -> Color {
    match state {
        InstanceState::Completed => Color::Green,
        InstanceState::Failed => Color::Red,
        InstanceState::Cancelled | InstanceState::Paused => Color::Yellow,
        InstanceState::Created | InstanceState::Running => Color::Blue,
    }
}

fn step_label(status: StepStatus) -> (&'static str, Color) {
    match status {
        StepStatus::Pending => ("pending", Color::DarkGrey),
        StepStatus::Running => ("running", Color::Blue),
        StepStatus::Retrying => ("retrying", Color::Yellow),
        StepStatus::Succeeded => ("succeeded", Color::Green),
        StepStatus::Failed => ("failed", Color::Red),
        StepStatus::Notified => ("notified", Color::Magenta),
        StepStatus::Compensating => ("compensating", Color::Yellow),
        StepStatus::Compensated => ("compensated", Color::Magenta),
        StepStatus::Skipped => ("skipped", Color::DarkGrey),
        StepStatus::Aborted => ("aborted", Color::Red),
    }
}

fn print_instance(instance: &WorkflowInstance, ready_steps: &[String]) {
    println!();
    println!("  Instance:    {}", style(instance.id).cyan());
    println!("  Definition:  {}", instance.definition);
    println!("  Correlation: {}", instance.correlation_id);
    println!("  State:       {}", instance.state);
    if instance.cancel_requested && !instance.state.is_terminal() {
        println!("  {}", style("Cancellation requested").yellow());
    }
    if let Some(error) = &instance.error {
        let origin = instance.originating_step.as_deref().unwrap_or("-");
        println!("  Failed at:   {} ({})", style(origin).red(), error);
    }
    if !ready_steps.is_empty() {
        println!("  Ready:       {}", ready_steps.join(", "));
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Attempt"),
            Cell::new("Result"),
        ]);
    for (name, step) in &instance.steps {
        let (label, color) = step_label(step.status);
        let result = match (&step.failure, &step.output) {
            (Some(failure), _) => failure.to_string(),
            (None, Some(output)) => truncate(&output.to_string(), 60),
            (None, None) => String::new(),
        };
        table.add_row(vec![
            Cell::new(name),
            Cell::new(label).fg(color),
            Cell::new(step.attempt),
            Cell::new(result),
        ]);
    }

    println!();
    println!("{table}");
    println!("  {} executions recorded", instance.executions.len());
    println!();
}

fn print_log(log: &[StateLogEntry]) {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Seq").fg(Color::Cyan),
            Cell::new("Transition"),
            Cell::new("Step"),
            Cell::new("At"),
        ]);
    for entry in log {
        table.add_row(vec![
            Cell::new(entry.seq),
            Cell::new(entry.transition.name()),
            Cell::new(entry.transition.step().unwrap_or("")),
            Cell::new(entry.timestamp.format("%H:%M:%S%.3f")),
        ]);
    }
    println!("{table}");
    println!();
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_defaults_to_empty() {
        assert!(parse_context(None).unwrap().is_empty());
    }

    #[test]
    fn context_must_be_an_object() {
        let map = parse_context(Some(r#"{"taskId":"t-1","priority":2}"#)).unwrap();
        assert_eq!(map["taskId"], "t-1");

        let err = parse_context(Some("[1,2]")).unwrap_err();
        assert!(err.to_string().contains("an array"));

        assert!(parse_context(Some("{not json")).is_err());
    }

    #[test]
    fn truncates_long_output() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 4), "abcd...");
    }
}
