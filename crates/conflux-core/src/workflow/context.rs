//! Template rendering and field extraction for step inputs.
//!
//! Inputs and correlation filters are JSON values whose string leaves may
//! contain minijinja expressions. They render against a scope of three
//! roots:
//!
//! ```json
//! {
//!   "context":  { "taskId": "t1", "prepare": { ... } },
//!   "steps":    { "prepare": { ... } },
//!   "instance": { "id": "...", "correlation_id": "...", "definition": "...", "version": 1 }
//! }
//! ```
//!
//! `steps` holds the outputs of the step's direct dependencies. A string that
//! is exactly one `{{ expr }}` keeps the JSON type of the evaluated value, so
//! `"{{ context.count }}"` renders to a number, not `"3"`.

use conflux_types::error::StepFailure;
use conflux_types::instance::WorkflowInstance;
use conflux_types::workflow::StepDefinition;
use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;
use serde_json::{Map, Value, json};
use thiserror::Error;

/// Maximum size of a single step output written into the context (1 MB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("template error at '{path}': {message}")]
pub struct TemplateError {
    pub path: String,
    pub message: String,
}

impl From<TemplateError> for StepFailure {
    fn from(err: TemplateError) -> Self {
        StepFailure::permanent(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// The values a template can see.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateScope {
    pub context: Map<String, Value>,
    pub steps: Map<String, Value>,
    pub instance: Value,
}

impl TemplateScope {
    /// Scope for rendering `step` inside `instance`.
    pub fn for_step(instance: &WorkflowInstance, step: &StepDefinition) -> Self {
        let steps = step
            .depends_on
            .iter()
            .filter_map(|dep| {
                instance
                    .steps
                    .get(&dep.step)
                    .and_then(|s| s.output.clone())
                    .map(|output| (dep.step.clone(), output))
            })
            .collect();
        Self {
            context: instance.context.clone(),
            steps,
            instance: instance_value(instance),
        }
    }

    /// Scope for error handlers: the whole context, no dependency outputs.
    pub fn for_instance(instance: &WorkflowInstance) -> Self {
        Self {
            context: instance.context.clone(),
            steps: Map::new(),
            instance: instance_value(instance),
        }
    }
}

fn instance_value(instance: &WorkflowInstance) -> Value {
    json!({
        "id": instance.id.to_string(),
        "correlation_id": instance.correlation_id,
        "definition": instance.definition.id,
        "version": instance.definition.version,
    })
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn environment() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env
}

/// Render every string leaf of `template` against `scope`.
///
/// Referencing an undefined value is an error rather than an empty string.
pub fn render_value(template: &Value, scope: &TemplateScope) -> Result<Value, TemplateError> {
    let env = environment();
    let ctx = minijinja::Value::from_serialize(scope);
    render_at(&env, template, &ctx, "$")
}

fn render_at(
    env: &Environment<'_>,
    template: &Value,
    ctx: &minijinja::Value,
    path: &str,
) -> Result<Value, TemplateError> {
    match template {
        Value::String(s) => render_string(env, s, ctx, path),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| render_at(env, item, ctx, &format!("{path}[{i}]")))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), render_at(env, v, ctx, &format!("{path}.{k}"))?)))
            .collect::<Result<Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// Inner expression if `s` is exactly one `{{ ... }}` block.
fn single_expression(s: &str) -> Option<&str> {
    let inner = s.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

fn render_string(
    env: &Environment<'_>,
    s: &str,
    ctx: &minijinja::Value,
    path: &str,
) -> Result<Value, TemplateError> {
    let error = |message: String| TemplateError {
        path: path.to_string(),
        message,
    };

    if let Some(expr) = single_expression(s) {
        let compiled = env
            .compile_expression(expr)
            .map_err(|e| error(e.to_string()))?;
        let value = compiled.eval(ctx.clone()).map_err(|e| error(e.to_string()))?;
        if value.is_undefined() {
            return Err(error(format!("'{expr}' is undefined")));
        }
        return serde_json::to_value(&value).map_err(|e| error(e.to_string()));
    }

    if s.contains("{{") || s.contains("{%") {
        return env
            .render_str(s, ctx.clone())
            .map(Value::String)
            .map_err(|e| error(e.to_string()));
    }

    Ok(Value::String(s.to_string()))
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Select part of a response.
///
/// `selector` is a JSON pointer (`/data/id`); a dotted path (`data.id`) is
/// accepted as shorthand. A missing field is a permanent failure.
pub fn extract(response: &Value, selector: &str) -> Result<Value, StepFailure> {
    let pointer = if selector.is_empty() || selector.starts_with('/') {
        selector.to_string()
    } else {
        format!("/{}", selector.replace('.', "/"))
    };
    response.pointer(&pointer).cloned().ok_or_else(|| {
        StepFailure::permanent(format!("response has no field at '{selector}'"))
    })
}

/// Bound a step output before it enters the context.
pub fn bounded_output(step: &str, output: Value) -> Value {
    let size = serde_json::to_string(&output).map(|s| s.len()).unwrap_or(0);
    if size <= MAX_STEP_OUTPUT_SIZE {
        return output;
    }
    tracing::warn!(
        step,
        size,
        max = MAX_STEP_OUTPUT_SIZE,
        "step output exceeds size limit, truncating"
    );
    json!({
        "_truncated": true,
        "_original_size": size,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use conflux_types::error::FailureKind;

    fn scope() -> TemplateScope {
        let mut context = Map::new();
        context.insert("taskId".to_string(), json!("t1"));
        context.insert("count".to_string(), json!(3));
        let mut steps = Map::new();
        steps.insert("assign".to_string(), json!({"agent": {"id": "a-7"}}));
        TemplateScope {
            context,
            steps,
            instance: json!({"id": "i-1", "correlation_id": "corr-9"}),
        }
    }

    #[test]
    fn single_expression_keeps_type() {
        let rendered = render_value(
            &json!({"count": "{{ context.count }}", "agent": "{{ steps.assign.agent }}"}),
            &scope(),
        )
        .unwrap();
        assert_eq!(rendered, json!({"count": 3, "agent": {"id": "a-7"}}));
    }

    #[test]
    fn mixed_strings_render_to_text() {
        let rendered = render_value(
            &json!(["task {{ context.taskId }} for {{ instance.correlation_id }}", 42, null]),
            &scope(),
        )
        .unwrap();
        assert_eq!(rendered, json!(["task t1 for corr-9", 42, null]));
    }

    #[test]
    fn filters_are_available() {
        let rendered = render_value(&json!("{{ context.taskId | upper }}"), &scope()).unwrap();
        assert_eq!(rendered, json!("T1"));
    }

    #[test]
    fn undefined_values_are_errors() {
        let err = render_value(&json!({"x": "{{ context.missing }}"}), &scope()).unwrap_err();
        assert_eq!(err.path, "$.x");

        let err = render_value(&json!("id={{ steps.nope.id }}"), &scope()).unwrap_err();
        assert_eq!(err.path, "$");

        let failure: StepFailure = err.into();
        assert_eq!(failure.kind, FailureKind::Permanent);
    }

    #[test]
    fn plain_strings_pass_through() {
        let rendered = render_value(&json!("no templates here"), &scope()).unwrap();
        assert_eq!(rendered, json!("no templates here"));
    }

    #[test]
    fn extraction_by_pointer_and_dotted_path() {
        let response = json!({"data": {"id": "x1", "items": [1, 2]}});
        assert_eq!(extract(&response, "/data/id").unwrap(), json!("x1"));
        assert_eq!(extract(&response, "data.items.1").unwrap(), json!(2));
        assert_eq!(extract(&response, "").unwrap(), response);

        let err = extract(&response, "/data/missing").unwrap_err();
        assert_eq!(err.kind, FailureKind::Permanent);
    }

    #[test]
    fn oversized_output_is_truncated() {
        let big = json!("x".repeat(MAX_STEP_OUTPUT_SIZE + 10));
        let bounded = bounded_output("s", big);
        assert_eq!(bounded["_truncated"], json!(true));
        assert_eq!(bounded_output("s", json!({"ok": 1})), json!({"ok": 1}));
    }
}
