//! Workflow definition types for Conflux.
//!
//! `WorkflowDefinition` is the canonical intermediate representation of a
//! workflow: YAML files, JSON request bodies, and the persisted definition
//! table all convert to and from this struct. A registered definition is
//! immutable; a change is a new `(id, version)` row.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Workflow Definition (canonical IR)
// ---------------------------------------------------------------------------

/// A versioned, immutable DAG of steps plus per-step error handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Stable identifier shared by every version (e.g. "task-assignment").
    pub id: String,
    /// Version number. `0` asks the definition store to assign `latest + 1`.
    #[serde(default)]
    pub version: u32,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Ordered list of steps forming the workflow DAG.
    pub steps: Vec<StepDefinition>,
    /// Error handlers, at most one per step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_handlers: Vec<ErrorHandler>,
    /// Extensible metadata (for custom integrations).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl WorkflowDefinition {
    /// Reference pinning this exact version.
    pub fn reference(&self) -> DefinitionRef {
        DefinitionRef {
            id: self.id.clone(),
            version: self.version,
        }
    }

    /// Look up a step by name.
    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// The error handler declared for a step, if any.
    pub fn handler_for(&self, step: &str) -> Option<&ErrorHandler> {
        self.error_handlers.iter().find(|h| h.step == step)
    }
}

/// Pinned `(id, version)` pair identifying one immutable definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DefinitionRef {
    pub id: String,
    pub version: u32,
}

impl fmt::Display for DefinitionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.id, self.version)
    }
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step in the workflow DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step name, unique within a definition.
    pub name: String,
    /// What the step does. Tagged by `type` (`remote_call` | `event_wait`).
    #[serde(flatten)]
    pub kind: StepKind,
    /// Upstream steps this step waits on (DAG edges).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<Dependency>,
    /// Attempt budget and backoff for this step.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Per-attempt timeout for remote calls; wait deadline for event waits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl StepDefinition {
    pub fn type_name(&self) -> &'static str {
        match self.kind {
            StepKind::RemoteCall(_) => "remote_call",
            StepKind::EventWait(_) => "event_wait",
        }
    }
}

/// The two step primitives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Call an operation on a downstream service.
    RemoteCall(RemoteCallSpec),
    /// Suspend until a correlated event arrives or the timeout elapses.
    EventWait(EventWaitSpec),
}

/// A call to a named downstream target.
///
/// `input` is a JSON value whose string leaves may hold `{{ expr }}`
/// templates rendered against the instance context and dependency outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCallSpec {
    /// Logical target name resolved through the service registry.
    pub target: String,
    /// HTTP method (default `POST`).
    #[serde(default = "default_method")]
    pub method: String,
    /// Path appended to the resolved target address.
    #[serde(default)]
    pub path: String,
    /// Request body template.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub input: Value,
    /// JSON pointer applied to the response before it is stored in context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extract: Option<String>,
}

fn default_method() -> String {
    "POST".to_string()
}

/// A wait for an asynchronous event.
///
/// Every entry in `correlation` must match the event exactly; values are
/// templates rendered when the wait is registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventWaitSpec {
    /// Event type to listen for (e.g. "task.completed").
    pub event_type: String,
    /// Field path (dotted, into the event payload) to expected value.
    #[serde(default)]
    pub correlation: BTreeMap<String, Value>,
}

// ---------------------------------------------------------------------------
// Dependencies
// ---------------------------------------------------------------------------

/// How an upstream outcome satisfies a dependency edge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyMode {
    /// Upstream succeeded, was skipped, or failed non-halting (notify).
    #[default]
    Completion,
    /// Upstream must have succeeded.
    Success,
}

/// One `depends_on` edge.
///
/// Accepts either a bare step name or `{ step, require }`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "RawDependency")]
pub struct Dependency {
    pub step: String,
    pub require: DependencyMode,
}

impl Dependency {
    pub fn on(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            require: DependencyMode::Completion,
        }
    }

    pub fn requiring_success(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            require: DependencyMode::Success,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDependency {
    Name(String),
    Edge {
        step: String,
        #[serde(default)]
        require: DependencyMode,
    },
}

impl From<RawDependency> for Dependency {
    fn from(raw: RawDependency) -> Self {
        match raw {
            RawDependency::Name(step) => Dependency::on(step),
            RawDependency::Edge { step, require } => Dependency { step, require },
        }
    }
}

// ---------------------------------------------------------------------------
// Retry Policy
// ---------------------------------------------------------------------------

/// Attempt budget and exponential backoff for a step.
///
/// The delay after failed attempt `n` is `base_delay_ms * multiplier^(n-1)`,
/// capped at `max_delay_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts per round (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt (default 100 ms).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Growth factor between consecutive delays (default 2.0).
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Upper bound on a single delay (default 30 s).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Whether a timed-out attempt may be retried (default false).
    #[serde(default)]
    pub retry_on_timeout: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            retry_on_timeout: false,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Error handlers
// ---------------------------------------------------------------------------

/// Per-step policy consulted after the step's retries are exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorHandler {
    /// Step this handler covers.
    pub step: String,
    #[serde(flatten)]
    pub policy: HandlerPolicy,
}

/// What to do with a permanently failed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum HandlerPolicy {
    /// Run further rounds, each bounded by the step's own retry policy.
    Retry {
        #[serde(default = "default_rounds")]
        rounds: u32,
        #[serde(default)]
        delay_ms: u64,
    },
    /// Signal the failure to an external target and continue as best-effort.
    Notify {
        target: String,
        #[serde(default)]
        path: String,
    },
    /// Run a compensating call; the step stays failed for dependency purposes.
    Compensate { action: RemoteCallSpec },
}

fn default_rounds() -> u32 {
    1
}

impl HandlerPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            HandlerPolicy::Retry { .. } => "retry",
            HandlerPolicy::Notify { .. } => "notify",
            HandlerPolicy::Compensate { .. } => "compensate",
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const YAML: &str = r#"
id: task-assignment
steps:
  - name: prepare
    type: remote_call
    target: projects
    path: /tasks/prepare
    input:
      task_id: "{{ taskId }}"
  - name: assign
    type: remote_call
    target: agents
    depends_on: [prepare]
    extract: /assignment
    retry:
      max_attempts: 5
      base_delay_ms: 250
  - name: wait_completion
    type: event_wait
    event_type: task.completed
    depends_on:
      - step: assign
        require: success
    correlation:
      correlationId: "{{ instance.correlation_id }}"
      taskId: "{{ taskId }}"
    timeout_secs: 3600
error_handlers:
  - step: assign
    policy: notify
    target: alerts
"#;

    #[test]
    fn parses_yaml_definition() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(YAML).unwrap();
        assert_eq!(def.id, "task-assignment");
        assert_eq!(def.version, 0, "version defaults to auto-assign");
        assert_eq!(def.steps.len(), 3);

        let prepare = def.step("prepare").unwrap();
        match &prepare.kind {
            StepKind::RemoteCall(spec) => {
                assert_eq!(spec.method, "POST");
                assert_eq!(spec.input, json!({"task_id": "{{ taskId }}"}));
            }
            other => panic!("unexpected kind: {other:?}"),
        }
        assert_eq!(prepare.retry, RetryPolicy::default());

        let assign = def.step("assign").unwrap();
        assert_eq!(assign.depends_on, vec![Dependency::on("prepare")]);
        assert_eq!(assign.retry.max_attempts, 5);
        assert_eq!(assign.retry.multiplier, 2.0);

        let wait = def.step("wait_completion").unwrap();
        assert_eq!(wait.type_name(), "event_wait");
        assert_eq!(wait.depends_on, vec![Dependency::requiring_success("assign")]);
        assert_eq!(wait.timeout_secs, Some(3600));

        let handler = def.handler_for("assign").unwrap();
        assert_eq!(handler.policy.name(), "notify");
        assert!(def.handler_for("prepare").is_none());
    }

    #[test]
    fn dependency_accepts_name_or_edge() {
        let deps: Vec<Dependency> =
            serde_json::from_value(json!(["a", {"step": "b"}, {"step": "c", "require": "success"}]))
                .unwrap();
        assert_eq!(deps[0], Dependency::on("a"));
        assert_eq!(deps[1], Dependency::on("b"));
        assert_eq!(deps[2], Dependency::requiring_success("c"));
    }

    #[test]
    fn json_roundtrip_preserves_definition() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(YAML).unwrap();
        let json = serde_json::to_string(&def).unwrap();
        let parsed: WorkflowDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, def);
    }

    #[test]
    fn compensate_handler_parses_action() {
        let handler: ErrorHandler = serde_json::from_value(json!({
            "step": "charge",
            "policy": "compensate",
            "action": {"target": "billing", "path": "/refund", "method": "DELETE"}
        }))
        .unwrap();
        match handler.policy {
            HandlerPolicy::Compensate { action } => {
                assert_eq!(action.target, "billing");
                assert_eq!(action.method, "DELETE");
            }
            other => panic!("unexpected policy: {other:?}"),
        }
    }

    #[test]
    fn definition_ref_display() {
        let r = DefinitionRef {
            id: "onboarding".to_string(),
            version: 4,
        };
        assert_eq!(r.to_string(), "onboarding@v4");
    }
}
