//! Error handler policies for permanently failed steps.
//!
//! Consulted once a step's retry budget for the current round is spent.
//! `retry` grants further rounds, `notify` signals the failure and lets the
//! workflow carry on, `compensate` runs an undo call. A step without a
//! handler, or whose handler ran out of options, halts the instance.

use std::time::Duration;

use conflux_types::error::StepFailure;
use conflux_types::instance::{StepState, WorkflowInstance};
use conflux_types::workflow::{HandlerPolicy, RemoteCallSpec, WorkflowDefinition};
use serde_json::{Value, json};

/// What the scheduler does with an exhausted step.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureResolution {
    /// Start handler round `round` after `delay`.
    RetryRound { round: u32, delay: Duration },
    /// Signal the failure to `target` and treat the step as best-effort.
    Notify { target: String, path: String },
    /// Run the compensating action.
    Compensate { action: RemoteCallSpec },
    /// Stop dispatching and fail the instance.
    Halt,
}

impl FailureResolution {
    pub fn name(&self) -> &'static str {
        match self {
            FailureResolution::RetryRound { .. } => "retry",
            FailureResolution::Notify { .. } => "notify",
            FailureResolution::Compensate { .. } => "compensate",
            FailureResolution::Halt => "halt",
        }
    }
}

/// Decide how to resolve `step`, given what its handler already did.
pub fn resolve(def: &WorkflowDefinition, step: &str, state: &StepState) -> FailureResolution {
    if state.halted {
        return FailureResolution::Halt;
    }
    let Some(handler) = def.handler_for(step) else {
        return FailureResolution::Halt;
    };
    match &handler.policy {
        HandlerPolicy::Retry { rounds, delay_ms } if state.round < *rounds => {
            FailureResolution::RetryRound {
                round: state.round + 1,
                delay: Duration::from_millis(*delay_ms),
            }
        }
        HandlerPolicy::Retry { .. } => FailureResolution::Halt,
        HandlerPolicy::Notify { target, path } => FailureResolution::Notify {
            target: target.clone(),
            path: path.clone(),
        },
        HandlerPolicy::Compensate { action } => FailureResolution::Compensate {
            action: action.clone(),
        },
    }
}

/// Body sent to a `notify` target.
pub fn notification_body(
    instance: &WorkflowInstance,
    step: &str,
    failure: Option<&StepFailure>,
) -> Value {
    json!({
        "instance_id": instance.id.to_string(),
        "correlation_id": instance.correlation_id,
        "definition": instance.definition.id,
        "version": instance.definition.version,
        "step": step,
        "error": failure.map(|f| f.to_string()),
    })
}

/// Idempotency key of a handler call for `step`.
pub fn handler_key(instance: &WorkflowInstance, step: &str, policy: &str) -> String {
    format!("{}:{step}:{policy}", instance.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conflux_types::workflow::ErrorHandler;

    fn definition(policy: Option<HandlerPolicy>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: "flow".to_string(),
            version: 1,
            description: None,
            steps: Vec::new(),
            error_handlers: policy
                .map(|policy| {
                    vec![ErrorHandler {
                        step: "charge".to_string(),
                        policy,
                    }]
                })
                .unwrap_or_default(),
            metadata: Default::default(),
        }
    }

    #[test]
    fn no_handler_halts() {
        let def = definition(None);
        assert_eq!(
            resolve(&def, "charge", &StepState::default()),
            FailureResolution::Halt
        );
    }

    #[test]
    fn retry_rounds_are_bounded() {
        let def = definition(Some(HandlerPolicy::Retry {
            rounds: 2,
            delay_ms: 500,
        }));
        let mut state = StepState::default();
        assert_eq!(
            resolve(&def, "charge", &state),
            FailureResolution::RetryRound {
                round: 1,
                delay: Duration::from_millis(500)
            }
        );
        state.round = 1;
        assert!(matches!(
            resolve(&def, "charge", &state),
            FailureResolution::RetryRound { round: 2, .. }
        ));
        state.round = 2;
        assert_eq!(resolve(&def, "charge", &state), FailureResolution::Halt);
    }

    #[test]
    fn notify_and_compensate_map_through() {
        let def = definition(Some(HandlerPolicy::Notify {
            target: "alerts".to_string(),
            path: "/failures".to_string(),
        }));
        assert_eq!(resolve(&def, "charge", &StepState::default()).name(), "notify");
        assert_eq!(resolve(&def, "other", &StepState::default()).name(), "halt");

        let def = definition(Some(HandlerPolicy::Compensate {
            action: RemoteCallSpec {
                target: "billing".to_string(),
                method: "POST".to_string(),
                path: "/refund".to_string(),
                input: Value::Null,
                extract: None,
            },
        }));
        assert_eq!(resolve(&def, "charge", &StepState::default()).name(), "compensate");

        let halted = StepState {
            halted: true,
            ..StepState::default()
        };
        assert_eq!(resolve(&def, "charge", &halted), FailureResolution::Halt);
    }
}
