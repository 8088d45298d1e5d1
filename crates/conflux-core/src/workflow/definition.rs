//! Workflow definition parsing, validation, and the versioned definition store.
//!
//! Converts YAML/JSON documents into the canonical `WorkflowDefinition` IR,
//! validates structural constraints (unique names, known dependencies,
//! acyclic graph, correlation filters), and registers immutable
//! `(id, version)` rows through a `WorkflowRepository`.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use conflux_types::error::RepositoryError;
use conflux_types::workflow::{
    DefinitionRef, HandlerPolicy, RetryPolicy, StepKind, WorkflowDefinition,
};
use dashmap::DashMap;
use thiserror::Error;

use super::dag::find_cycle;
use crate::repository::workflow::WorkflowRepository;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// The dependency graph contains a cycle. `cycle` starts and ends on the
/// same step, following `depends_on` edges.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cyclic dependency: {}", .cycle.join(" -> "))]
pub struct CyclicDependencyError {
    pub cycle: Vec<String>,
}

/// Errors raised while parsing, validating, registering or loading definitions.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid definition id '{0}' (only alphanumeric, '-' and '_' allowed)")]
    InvalidId(String),

    #[error("workflow must have at least one step")]
    NoSteps,

    #[error("duplicate step name: '{0}'")]
    DuplicateStep(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error(transparent)]
    Cycle(#[from] CyclicDependencyError),

    #[error("event_wait step '{0}' must declare a non-empty correlation filter")]
    MissingCorrelationFilter(String),

    #[error("invalid retry policy on '{step}': {reason}")]
    InvalidRetryPolicy { step: String, reason: String },

    #[error("'{0}' has an empty call target")]
    EmptyTarget(String),

    #[error("error handler references unknown step '{0}'")]
    UnknownHandlerStep(String),

    #[error("step '{0}' has more than one error handler")]
    DuplicateHandler(String),

    #[error("definition {0} already exists")]
    VersionConflict(DefinitionRef),

    #[error("definition '{id}' not found{}", .version.map(|v| format!(" at version {v}")).unwrap_or_default())]
    NotFound { id: String, version: Option<u32> },

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML or JSON document into a validated `WorkflowDefinition`.
///
/// Documents starting with `{` are read as JSON, everything else as YAML.
pub fn parse_definition(text: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition = if text.trim_start().starts_with('{') {
        serde_json::from_str(text).map_err(|e| DefinitionError::Parse(e.to_string()))?
    } else {
        serde_yaml_ng::from_str(text).map_err(|e| DefinitionError::Parse(e.to_string()))?
    };
    validate(&def)?;
    Ok(def)
}

/// Load and validate a definition file.
pub fn load_definition_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    parse_definition(&content)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks, in order:
/// - id is non-empty and contains only alphanumerics, `-` and `_`
/// - at least one step, all step names unique
/// - every `depends_on` entry names an existing step
/// - the dependency graph is acyclic
/// - every `event_wait` declares a non-empty correlation filter
/// - retry policies are usable and call targets non-empty
/// - at most one error handler per step, each naming an existing step
pub fn validate(def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if def.id.is_empty()
        || !def
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(DefinitionError::InvalidId(def.id.clone()));
    }

    if def.steps.is_empty() {
        return Err(DefinitionError::NoSteps);
    }

    let mut names = HashSet::new();
    for step in &def.steps {
        if !names.insert(step.name.as_str()) {
            return Err(DefinitionError::DuplicateStep(step.name.clone()));
        }
    }

    for step in &def.steps {
        for dep in &step.depends_on {
            if !names.contains(dep.step.as_str()) {
                return Err(DefinitionError::UnknownDependency {
                    step: step.name.clone(),
                    dependency: dep.step.clone(),
                });
            }
        }
    }

    if let Some(cycle) = find_cycle(&def.steps) {
        return Err(CyclicDependencyError { cycle }.into());
    }

    for step in &def.steps {
        match &step.kind {
            StepKind::EventWait(wait) if wait.correlation.is_empty() => {
                return Err(DefinitionError::MissingCorrelationFilter(step.name.clone()));
            }
            StepKind::RemoteCall(call) if call.target.trim().is_empty() => {
                return Err(DefinitionError::EmptyTarget(step.name.clone()));
            }
            _ => {}
        }
        validate_retry(&step.name, &step.retry)?;
    }

    let mut handled = HashSet::new();
    for handler in &def.error_handlers {
        if !names.contains(handler.step.as_str()) {
            return Err(DefinitionError::UnknownHandlerStep(handler.step.clone()));
        }
        if !handled.insert(handler.step.as_str()) {
            return Err(DefinitionError::DuplicateHandler(handler.step.clone()));
        }
        match &handler.policy {
            HandlerPolicy::Notify { target, .. } if target.trim().is_empty() => {
                return Err(DefinitionError::EmptyTarget(format!(
                    "notify handler of '{}'",
                    handler.step
                )));
            }
            HandlerPolicy::Compensate { action } if action.target.trim().is_empty() => {
                return Err(DefinitionError::EmptyTarget(format!(
                    "compensate handler of '{}'",
                    handler.step
                )));
            }
            _ => {}
        }
    }

    Ok(())
}

fn validate_retry(step: &str, policy: &RetryPolicy) -> Result<(), DefinitionError> {
    let invalid = |reason: &str| DefinitionError::InvalidRetryPolicy {
        step: step.to_string(),
        reason: reason.to_string(),
    };
    if policy.max_attempts == 0 {
        return Err(invalid("max_attempts must be >= 1"));
    }
    if !policy.multiplier.is_finite() || policy.multiplier < 1.0 {
        return Err(invalid("multiplier must be >= 1.0"));
    }
    if policy.max_delay_ms < policy.base_delay_ms {
        return Err(invalid("max_delay_ms must be >= base_delay_ms"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Definition store
// ---------------------------------------------------------------------------

/// How many times `register` re-reads the latest version after losing a race.
const AUTO_VERSION_RETRIES: u32 = 5;

/// Versioned, immutable definition storage with a read-through cache.
///
/// Registered rows are never updated, so cached entries never go stale.
pub struct DefinitionStore<R: WorkflowRepository> {
    repo: Arc<R>,
    cache: DashMap<(String, u32), Arc<WorkflowDefinition>>,
}

impl<R: WorkflowRepository> DefinitionStore<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self {
            repo,
            cache: DashMap::new(),
        }
    }

    /// Validate and publish a definition.
    ///
    /// Version `0` means "next version": the highest registered version for
    /// the id plus one. An explicit version that is already taken fails with
    /// `VersionConflict`.
    pub async fn register(
        &self,
        mut def: WorkflowDefinition,
    ) -> Result<DefinitionRef, DefinitionError> {
        validate(&def)?;

        if def.version == 0 {
            let mut tries = 0;
            loop {
                let latest = self.repo.latest_version(&def.id).await?.unwrap_or(0);
                def.version = latest + 1;
                match self.repo.insert_definition(&def).await {
                    Ok(()) => break,
                    Err(RepositoryError::Conflict(_)) if tries < AUTO_VERSION_RETRIES => {
                        tries += 1;
                    }
                    Err(RepositoryError::Conflict(_)) => {
                        return Err(DefinitionError::VersionConflict(def.reference()));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        } else {
            match self.repo.insert_definition(&def).await {
                Ok(()) => {}
                Err(RepositoryError::Conflict(_)) => {
                    return Err(DefinitionError::VersionConflict(def.reference()));
                }
                Err(e) => return Err(e.into()),
            }
        }

        let reference = def.reference();
        tracing::info!(definition = %reference, steps = def.steps.len(), "registered workflow definition");
        self.cache
            .insert((def.id.clone(), def.version), Arc::new(def));
        Ok(reference)
    }

    /// Fetch one pinned version.
    pub async fn get(
        &self,
        id: &str,
        version: u32,
    ) -> Result<Arc<WorkflowDefinition>, DefinitionError> {
        if let Some(def) = self.cache.get(&(id.to_string(), version)) {
            return Ok(def.clone());
        }
        let def = self
            .repo
            .get_definition(id, version)
            .await?
            .ok_or_else(|| DefinitionError::NotFound {
                id: id.to_string(),
                version: Some(version),
            })?;
        let def = Arc::new(def);
        self.cache.insert((id.to_string(), version), def.clone());
        Ok(def)
    }

    /// Fetch the highest registered version of `id`.
    pub async fn latest(&self, id: &str) -> Result<Arc<WorkflowDefinition>, DefinitionError> {
        let version = self
            .repo
            .latest_version(id)
            .await?
            .ok_or_else(|| DefinitionError::NotFound {
                id: id.to_string(),
                version: None,
            })?;
        self.get(id, version).await
    }

    /// Resolve an optional version: `None` means latest.
    pub async fn resolve(
        &self,
        id: &str,
        version: Option<u32>,
    ) -> Result<Arc<WorkflowDefinition>, DefinitionError> {
        match version {
            Some(v) => self.get(id, v).await,
            None => self.latest(id).await,
        }
    }

    /// All registered `(id, version)` pairs.
    pub async fn list(&self) -> Result<Vec<DefinitionRef>, DefinitionError> {
        Ok(self.repo.list_definitions().await?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryWorkflowRepository;
    use conflux_types::workflow::{
        Dependency, ErrorHandler, EventWaitSpec, RemoteCallSpec, StepDefinition,
    };
    use serde_json::json;
    use std::collections::{BTreeMap, HashMap};

    fn call(name: &str, deps: &[&str]) -> StepDefinition {
        StepDefinition {
            name: name.to_string(),
            kind: StepKind::RemoteCall(RemoteCallSpec {
                target: "tasks".to_string(),
                method: "POST".to_string(),
                path: format!("/{name}"),
                input: json!({}),
                extract: None,
            }),
            depends_on: deps.iter().map(|d| Dependency::on(*d)).collect(),
            retry: RetryPolicy::default(),
            timeout_secs: None,
        }
    }

    fn definition(id: &str, steps: Vec<StepDefinition>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: id.to_string(),
            version: 0,
            description: None,
            steps,
            error_handlers: vec![],
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn rejects_two_step_cycle_naming_it() {
        let def = definition("loop", vec![call("a", &["b"]), call("b", &["a"])]);
        let err = validate(&def).unwrap_err();
        match err {
            DefinitionError::Cycle(cycle) => {
                assert_eq!(cycle.cycle, vec!["a", "b", "a"]);
                assert_eq!(cycle.to_string(), "cyclic dependency: a -> b -> a");
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_self_dependency() {
        let def = definition("selfish", vec![call("a", &["a"])]);
        assert!(matches!(validate(&def), Err(DefinitionError::Cycle(_))));
    }

    #[test]
    fn rejects_unknown_dependency_and_duplicates() {
        let def = definition("d", vec![call("a", &["ghost"])]);
        assert!(matches!(
            validate(&def),
            Err(DefinitionError::UnknownDependency { dependency, .. }) if dependency == "ghost"
        ));

        let def = definition("d", vec![call("a", &[]), call("a", &[])]);
        assert!(matches!(validate(&def), Err(DefinitionError::DuplicateStep(_))));

        let def = definition("bad id!", vec![call("a", &[])]);
        assert!(matches!(validate(&def), Err(DefinitionError::InvalidId(_))));

        let def = definition("empty", vec![]);
        assert!(matches!(validate(&def), Err(DefinitionError::NoSteps)));
    }

    #[test]
    fn event_wait_requires_correlation_filter() {
        let mut wait = call("wait", &[]);
        wait.kind = StepKind::EventWait(EventWaitSpec {
            event_type: "task.completed".to_string(),
            correlation: BTreeMap::new(),
        });
        let def = definition("w", vec![wait]);
        assert!(matches!(
            validate(&def),
            Err(DefinitionError::MissingCorrelationFilter(step)) if step == "wait"
        ));
    }

    #[test]
    fn rejects_bad_retry_policy_and_handlers() {
        let mut step = call("a", &[]);
        step.retry.max_attempts = 0;
        let def = definition("r", vec![step]);
        assert!(matches!(
            validate(&def),
            Err(DefinitionError::InvalidRetryPolicy { .. })
        ));

        let mut def = definition("h", vec![call("a", &[])]);
        def.error_handlers = vec![ErrorHandler {
            step: "nope".to_string(),
            policy: HandlerPolicy::Retry {
                rounds: 1,
                delay_ms: 0,
            },
        }];
        assert!(matches!(
            validate(&def),
            Err(DefinitionError::UnknownHandlerStep(_))
        ));

        let handler = ErrorHandler {
            step: "a".to_string(),
            policy: HandlerPolicy::Notify {
                target: "ops".to_string(),
                path: "/alerts".to_string(),
            },
        };
        def.error_handlers = vec![handler.clone(), handler];
        assert!(matches!(
            validate(&def),
            Err(DefinitionError::DuplicateHandler(_))
        ));
    }

    #[test]
    fn parses_yaml_and_json() {
        let yaml = r#"
id: onboarding
steps:
  - name: prepare
    type: remote_call
    target: projects
    path: /prepare
  - name: wait
    type: event_wait
    event_type: task.completed
    correlation:
      correlationId: "{{ instance.correlation_id }}"
    depends_on: [prepare]
"#;
        let def = parse_definition(yaml).unwrap();
        assert_eq!(def.steps.len(), 2);

        let json = serde_json::to_string(&def).unwrap();
        let again = parse_definition(&json).unwrap();
        assert_eq!(again, def);

        assert!(matches!(
            parse_definition("steps: [[["),
            Err(DefinitionError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn register_assigns_versions_and_rejects_conflicts() {
        let store = DefinitionStore::new(Arc::new(InMemoryWorkflowRepository::new()));

        let r1 = store.register(definition("flow", vec![call("a", &[])])).await.unwrap();
        let r2 = store.register(definition("flow", vec![call("a", &[])])).await.unwrap();
        assert_eq!(r1.version, 1);
        assert_eq!(r2.version, 2);

        let mut pinned = definition("flow", vec![call("a", &[])]);
        pinned.version = 2;
        assert!(matches!(
            store.register(pinned).await,
            Err(DefinitionError::VersionConflict(_))
        ));

        assert_eq!(store.latest("flow").await.unwrap().version, 2);
        assert_eq!(store.get("flow", 1).await.unwrap().version, 1);
        let missing = store.get("flow", 9).await.unwrap_err();
        assert_eq!(missing.to_string(), "definition 'flow' not found at version 9");
        assert!(matches!(
            store.latest("other").await,
            Err(DefinitionError::NotFound { version: None, .. })
        ));
    }

    #[tokio::test]
    async fn cyclic_definition_is_never_stored() {
        let repo = Arc::new(InMemoryWorkflowRepository::new());
        let store = DefinitionStore::new(repo.clone());
        let def = definition("loop", vec![call("a", &["b"]), call("b", &["a"])]);
        assert!(store.register(def).await.is_err());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[test]
    fn loads_yaml_and_json_files() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("flow.yaml");
        std::fs::write(
            &yaml,
            "id: flow\nsteps:\n  - { name: a, type: remote_call, target: svc, path: /a }\n",
        )
        .unwrap();
        let json_path = dir.path().join("flow.json");
        std::fs::write(
            &json_path,
            r#"{"id":"flow","steps":[{"name":"a","type":"remote_call","target":"svc","path":"/a"}]}"#,
        )
        .unwrap();

        let from_yaml = load_definition_file(&yaml).unwrap();
        let from_json = load_definition_file(&json_path).unwrap();
        assert_eq!(from_yaml, from_json);
        assert_eq!(from_yaml.steps[0].type_name(), "remote_call");

        assert!(matches!(
            load_definition_file(&dir.path().join("missing.yaml")),
            Err(DefinitionError::Io(_))
        ));
    }
}
