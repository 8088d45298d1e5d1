//! Folding the state log into a `WorkflowInstance`.
//!
//! `apply` is the only code that mutates an instance. It is pure: given the
//! same entries in the same order it produces the same instance, so the live
//! scheduler and a replay from entry 1 always agree. Entries that would move
//! the instance illegally are rejected rather than skipped.

use chrono::{DateTime, Duration, Utc};
use conflux_types::instance::{
    ExecutionStatus, InstanceState, StateLogEntry, StepExecution, StepState, StepStatus,
    Transition, WorkflowInstance,
};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayError {
    #[error("state log is empty")]
    Empty,

    #[error("state log must start with instance_created, found {0}")]
    MissingCreation(&'static str),

    #[error("sequence gap: expected seq {expected}, found {found}")]
    SequenceGap { expected: u64, found: u64 },

    #[error("entry {seq} belongs to instance {found}, expected {expected}")]
    ForeignEntry { seq: u64, expected: Uuid, found: Uuid },

    #[error("{transition} at seq {seq} is not allowed while the instance is {state}")]
    IllegalTransition {
        seq: u64,
        transition: &'static str,
        state: InstanceState,
    },

    #[error("{transition} at seq {seq} is not allowed for step '{step}' in status {status:?}")]
    IllegalStepTransition {
        seq: u64,
        transition: &'static str,
        step: String,
        status: StepStatus,
    },
}

/// Rebuild an instance from its complete log.
pub fn replay(entries: &[StateLogEntry]) -> Result<WorkflowInstance, ReplayError> {
    let (first, rest) = entries.split_first().ok_or(ReplayError::Empty)?;
    let mut instance = created(first)?;
    for entry in rest {
        apply(&mut instance, entry)?;
    }
    Ok(instance)
}

/// Instance described by an `InstanceCreated` entry with seq 1.
pub fn created(entry: &StateLogEntry) -> Result<WorkflowInstance, ReplayError> {
    if entry.seq != 1 {
        return Err(ReplayError::SequenceGap {
            expected: 1,
            found: entry.seq,
        });
    }
    let Transition::InstanceCreated {
        definition,
        correlation_id,
        context,
    } = &entry.transition
    else {
        return Err(ReplayError::MissingCreation(entry.transition.name()));
    };
    Ok(WorkflowInstance {
        id: entry.instance_id,
        definition: definition.clone(),
        correlation_id: correlation_id.clone(),
        context: context.clone(),
        state: InstanceState::Created,
        steps: Default::default(),
        executions: Vec::new(),
        cancel_requested: false,
        originating_step: None,
        error: None,
        created_at: entry.timestamp,
        completed_at: None,
        last_seq: 1,
    })
}

/// Apply the next entry of the log.
pub fn apply(instance: &mut WorkflowInstance, entry: &StateLogEntry) -> Result<(), ReplayError> {
    if entry.instance_id != instance.id {
        return Err(ReplayError::ForeignEntry {
            seq: entry.seq,
            expected: instance.id,
            found: entry.instance_id,
        });
    }
    let expected = instance.last_seq + 1;
    if entry.seq != expected {
        return Err(ReplayError::SequenceGap {
            expected,
            found: entry.seq,
        });
    }

    let transition = &entry.transition;
    if !instance_allows(instance.state, transition) {
        return Err(ReplayError::IllegalTransition {
            seq: entry.seq,
            transition: transition.name(),
            state: instance.state,
        });
    }

    if let Some(step) = transition.step() {
        let status = instance.step_status(step);
        if status.is_settled() {
            return Err(ReplayError::IllegalStepTransition {
                seq: entry.seq,
                transition: transition.name(),
                step: step.to_string(),
                status,
            });
        }
        apply_step(instance, transition, entry.timestamp);
    } else {
        apply_instance(instance, transition, entry.timestamp);
    }

    instance.last_seq = entry.seq;
    Ok(())
}

fn instance_allows(state: InstanceState, transition: &Transition) -> bool {
    use InstanceState::*;
    match transition {
        Transition::InstanceCreated { .. } => false,
        Transition::InstanceStarted => state == Created,
        Transition::InstancePaused => state == Running,
        Transition::InstanceResumed => state == Paused,
        Transition::CancelRequested | Transition::InstanceCancelled => {
            matches!(state, Created | Running | Paused)
        }
        Transition::InstanceCompleted | Transition::InstanceFailed { .. } => state == Running,
        // step transitions: in-flight work keeps reporting while paused
        _ => matches!(state, Running | Paused),
    }
}

fn apply_instance(instance: &mut WorkflowInstance, transition: &Transition, at: DateTime<Utc>) {
    match transition {
        Transition::CancelRequested => instance.cancel_requested = true,
        Transition::InstanceFailed {
            originating_step,
            error,
        } => {
            instance.originating_step = Some(originating_step.clone());
            instance.error = Some(error.clone());
        }
        _ => {}
    }
    if let Some(state) = transition.resulting_state() {
        instance.state = state;
        if state.is_terminal() {
            instance.completed_at = Some(at);
        }
    }
}

fn finish_execution(
    instance: &mut WorkflowInstance,
    step: &str,
    attempt: u32,
    status: ExecutionStatus,
    output: Option<Value>,
    at: DateTime<Utc>,
) {
    let failure = instance.steps.get(step).and_then(|s| s.failure.clone());
    if let Some(exec) = instance
        .executions
        .iter_mut()
        .rev()
        .find(|e| e.step == step && e.attempt == attempt && e.status == ExecutionStatus::Running)
    {
        exec.status = status;
        exec.finished_at = Some(at);
        match status {
            ExecutionStatus::Succeeded => exec.output = output,
            ExecutionStatus::Failed => exec.error = failure,
            _ => {}
        }
    }
}

fn apply_step(instance: &mut WorkflowInstance, transition: &Transition, at: DateTime<Utc>) {
    match transition {
        Transition::ActivityRecorded {
            step,
            attempt,
            activity,
        } => {
            let state = instance.steps.entry(step.clone()).or_default();
            state.status = StepStatus::Running;
            state.attempt = *attempt;
            state.activity = Some(activity.clone());
            state.retry_at = None;
            state.started_at.get_or_insert(at);
            instance.executions.push(StepExecution {
                step: step.clone(),
                attempt: *attempt,
                status: ExecutionStatus::Running,
                activity: activity.clone(),
                output: None,
                error: None,
                started_at: at,
                finished_at: None,
            });
        }
        Transition::StepSucceeded {
            step,
            attempt,
            output,
        } => {
            let state = instance.steps.entry(step.clone()).or_default();
            state.status = StepStatus::Succeeded;
            state.attempt = *attempt;
            state.output = Some(output.clone());
            state.failure = None;
            state.activity = None;
            state.finished_at = Some(at);
            instance.context.insert(step.clone(), output.clone());
            finish_execution(
                instance,
                step,
                *attempt,
                ExecutionStatus::Succeeded,
                Some(output.clone()),
                at,
            );
        }
        Transition::StepAttemptFailed {
            step,
            attempt,
            failure,
            retry_in_ms,
        } => {
            let state = instance.steps.entry(step.clone()).or_default();
            state.status = StepStatus::Retrying;
            state.attempt = *attempt;
            state.failure = Some(failure.clone());
            state.activity = None;
            state.retry_at = Some(at + Duration::milliseconds(*retry_in_ms as i64));
            finish_execution(instance, step, *attempt, ExecutionStatus::Failed, None, at);
        }
        Transition::StepFailed {
            step,
            attempt,
            failure,
        } => {
            let state = instance.steps.entry(step.clone()).or_default();
            state.status = StepStatus::Failed;
            state.attempt = *attempt;
            state.failure = Some(failure.clone());
            state.activity = None;
            state.retry_at = None;
            state.finished_at = Some(at);
            finish_execution(instance, step, *attempt, ExecutionStatus::Failed, None, at);
        }
        Transition::HandlerRetryScheduled {
            step,
            round,
            delay_ms,
        } => {
            let state = instance.steps.entry(step.clone()).or_default();
            state.status = StepStatus::Retrying;
            state.round = *round;
            state.round_base = state.attempt;
            state.retry_at = Some(at + Duration::milliseconds(*delay_ms as i64));
            state.finished_at = None;
        }
        Transition::FailureNotified { step, .. } => {
            let state = instance.steps.entry(step.clone()).or_default();
            state.status = StepStatus::Notified;
            state.finished_at = Some(at);
        }
        Transition::CompensationStarted { step, activity } => {
            let state = instance.steps.entry(step.clone()).or_default();
            state.status = StepStatus::Compensating;
            state.compensation = Some(activity.clone());
        }
        Transition::CompensationSucceeded { step, .. } => {
            let state = instance.steps.entry(step.clone()).or_default();
            state.status = StepStatus::Compensated;
            state.compensation = None;
            state.finished_at = Some(at);
        }
        Transition::CompensationFailed { step, failure } => {
            let state = instance.steps.entry(step.clone()).or_default();
            state.status = StepStatus::Failed;
            state.failure = Some(failure.clone());
            state.compensation = None;
            state.halted = true;
            state.finished_at = Some(at);
        }
        Transition::StepSkipped { step, .. } => {
            let state = instance.steps.entry(step.clone()).or_default();
            state.status = StepStatus::Skipped;
            state.finished_at = Some(at);
        }
        Transition::StepAborted { step } => {
            let state = instance.steps.entry(step.clone()).or_default();
            let attempt = state.attempt;
            state.status = StepStatus::Aborted;
            state.activity = None;
            state.compensation = None;
            state.retry_at = None;
            state.finished_at = Some(at);
            finish_execution(instance, step, attempt, ExecutionStatus::Aborted, None, at);
        }
        _ => {}
    }
}

/// Steps with outstanding work, in name order.
pub fn unsettled_steps(instance: &WorkflowInstance) -> Vec<(&str, &StepState)> {
    instance
        .steps
        .iter()
        .filter(|(_, s)| !s.status.is_settled() && s.status != StepStatus::Pending)
        .map(|(name, s)| (name.as_str(), s))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use conflux_types::error::StepFailure;
    use conflux_types::instance::ActivityRecord;
    use conflux_types::workflow::DefinitionRef;
    use serde_json::{Map, json};

    struct Log {
        id: Uuid,
        entries: Vec<StateLogEntry>,
    }

    impl Log {
        fn new() -> Self {
            let mut log = Self {
                id: Uuid::now_v7(),
                entries: vec![],
            };
            let mut context = Map::new();
            context.insert("taskId".to_string(), json!("t1"));
            log.push(Transition::InstanceCreated {
                definition: DefinitionRef {
                    id: "flow".to_string(),
                    version: 1,
                },
                correlation_id: "corr".to_string(),
                context,
            });
            log
        }

        fn push(&mut self, transition: Transition) -> &mut Self {
            self.entries.push(StateLogEntry {
                instance_id: self.id,
                seq: self.entries.len() as u64 + 1,
                transition,
                timestamp: Utc::now(),
            });
            self
        }
    }

    fn call_record(key: &str) -> ActivityRecord {
        ActivityRecord::RemoteCall {
            target: "tasks".to_string(),
            method: "POST".to_string(),
            path: "/tasks".to_string(),
            body: json!({"id": 1}),
            idempotency_key: key.to_string(),
            extract: None,
            timeout_ms: 1000,
        }
    }

    #[test]
    fn successful_run_projects_outputs_into_context() {
        let mut log = Log::new();
        log.push(Transition::InstanceStarted)
            .push(Transition::ActivityRecorded {
                step: "prepare".to_string(),
                attempt: 1,
                activity: call_record("k1"),
            })
            .push(Transition::StepSucceeded {
                step: "prepare".to_string(),
                attempt: 1,
                output: json!({"projectId": "p1"}),
            })
            .push(Transition::InstanceCompleted);

        let instance = replay(&log.entries).unwrap();
        assert_eq!(instance.state, InstanceState::Completed);
        assert_eq!(instance.context["prepare"], json!({"projectId": "p1"}));
        assert_eq!(instance.context["taskId"], json!("t1"));
        assert_eq!(instance.executions.len(), 1);
        assert_eq!(instance.executions[0].status, ExecutionStatus::Succeeded);
        assert!(instance.completed_at.is_some());
        assert_eq!(instance.last_seq, 5);
    }

    #[test]
    fn retries_and_handler_rounds_track_attempts() {
        let mut log = Log::new();
        log.push(Transition::InstanceStarted);
        log.push(Transition::ActivityRecorded {
            step: "s".to_string(),
            attempt: 1,
            activity: call_record("k1"),
        })
        .push(Transition::StepAttemptFailed {
            step: "s".to_string(),
            attempt: 1,
            failure: StepFailure::transient("503"),
            retry_in_ms: 100,
        })
        .push(Transition::ActivityRecorded {
            step: "s".to_string(),
            attempt: 2,
            activity: call_record("k2"),
        });
        log.push(Transition::StepFailed {
            step: "s".to_string(),
            attempt: 2,
            failure: StepFailure::transient("503"),
        })
        .push(Transition::HandlerRetryScheduled {
            step: "s".to_string(),
            round: 1,
            delay_ms: 500,
        });

        let instance = replay(&log.entries).unwrap();
        let state = &instance.steps["s"];
        assert_eq!(instance.executions.len(), 2);
        assert_eq!(instance.executions[0].status, ExecutionStatus::Failed);
        assert_eq!(instance.executions[1].status, ExecutionStatus::Failed);
        assert_eq!(state.status, StepStatus::Retrying);
        assert_eq!(state.round, 1);
        assert_eq!(state.round_base, 2);
        assert_eq!(state.attempts_in_round(), 0);
        assert!(state.retry_at.is_some());
    }

    #[test]
    fn rejects_gaps_and_foreign_entries() {
        let mut log = Log::new();
        log.push(Transition::InstanceStarted);
        let mut entries = log.entries.clone();
        entries[1].seq = 3;
        assert_eq!(
            replay(&entries),
            Err(ReplayError::SequenceGap {
                expected: 2,
                found: 3
            })
        );

        let mut entries = log.entries.clone();
        entries[1].instance_id = Uuid::now_v7();
        assert!(matches!(
            replay(&entries),
            Err(ReplayError::ForeignEntry { .. })
        ));

        assert_eq!(replay(&[]), Err(ReplayError::Empty));
        assert!(matches!(
            replay(&entries[1..]),
            Err(ReplayError::SequenceGap { expected: 1, .. })
        ));
    }

    #[test]
    fn nothing_leaves_a_terminal_state() {
        let mut log = Log::new();
        log.push(Transition::InstanceStarted)
            .push(Transition::InstanceCompleted)
            .push(Transition::InstancePaused);
        assert!(matches!(
            replay(&log.entries),
            Err(ReplayError::IllegalTransition {
                transition: "instance_paused",
                state: InstanceState::Completed,
                ..
            })
        ));
    }

    #[test]
    fn settled_steps_accept_no_more_transitions() {
        let mut log = Log::new();
        log.push(Transition::InstanceStarted)
            .push(Transition::StepSkipped {
                step: "s".to_string(),
                reason: "upstream compensated".to_string(),
            })
            .push(Transition::StepAborted {
                step: "s".to_string(),
            });
        assert!(matches!(
            replay(&log.entries),
            Err(ReplayError::IllegalStepTransition { .. })
        ));
    }

    #[test]
    fn cancel_and_failure_bookkeeping() {
        let mut log = Log::new();
        log.push(Transition::InstanceStarted)
            .push(Transition::ActivityRecorded {
                step: "s".to_string(),
                attempt: 1,
                activity: call_record("k"),
            })
            .push(Transition::CancelRequested)
            .push(Transition::StepAborted {
                step: "s".to_string(),
            })
            .push(Transition::InstanceCancelled);
        let instance = replay(&log.entries).unwrap();
        assert!(instance.cancel_requested);
        assert_eq!(instance.state, InstanceState::Cancelled);
        assert_eq!(instance.executions[0].status, ExecutionStatus::Aborted);

        let mut log = Log::new();
        log.push(Transition::InstanceStarted)
            .push(Transition::InstanceFailed {
                originating_step: "wait".to_string(),
                error: "timeout".to_string(),
            });
        let instance = replay(&log.entries).unwrap();
        assert_eq!(instance.originating_step.as_deref(), Some("wait"));
    }

    #[test]
    fn incremental_apply_matches_full_replay() {
        let mut log = Log::new();
        log.push(Transition::InstanceStarted)
            .push(Transition::ActivityRecorded {
                step: "a".to_string(),
                attempt: 1,
                activity: call_record("k"),
            })
            .push(Transition::StepAttemptFailed {
                step: "a".to_string(),
                attempt: 1,
                failure: StepFailure::transient("503"),
                retry_in_ms: 100,
            })
            .push(Transition::InstancePaused);

        let mut live = created(&log.entries[0]).unwrap();
        for entry in &log.entries[1..] {
            apply(&mut live, entry).unwrap();
        }
        assert_eq!(live, replay(&log.entries).unwrap());
        assert_eq!(unsettled_steps(&live).len(), 1);
    }
}
