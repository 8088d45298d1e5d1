//! Workflow instance types: the state log and its projection.
//!
//! A `WorkflowInstance` is never written directly. The scheduler appends
//! `StateLogEntry` rows and the instance is rebuilt by folding them in `seq`
//! order. Everything in this module is plain data; the fold lives in
//! `conflux-core`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::StepFailure;
use crate::workflow::DefinitionRef;

// ---------------------------------------------------------------------------
// Instance state machine
// ---------------------------------------------------------------------------

/// Workflow-level state.
///
/// `Created -> Running <-> Paused`, `Running -> Completed | Failed`,
/// `{Running, Paused} -> Cancelled`. The last three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceState::Completed | InstanceState::Failed | InstanceState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceState::Created => "created",
            InstanceState::Running => "running",
            InstanceState::Paused => "paused",
            InstanceState::Completed => "completed",
            InstanceState::Failed => "failed",
            InstanceState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InstanceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(InstanceState::Created),
            "running" => Ok(InstanceState::Running),
            "paused" => Ok(InstanceState::Paused),
            "completed" => Ok(InstanceState::Completed),
            "failed" => Ok(InstanceState::Failed),
            "cancelled" => Ok(InstanceState::Cancelled),
            other => Err(format!("invalid instance state: '{other}'")),
        }
    }
}

/// Per-step state inside one instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not dispatched yet.
    #[default]
    Pending,
    /// An attempt is recorded and in flight.
    Running,
    /// An attempt failed; the next one is scheduled.
    Retrying,
    Succeeded,
    /// Retries exhausted; the error handler has not resolved it (yet).
    Failed,
    /// Failed, and the failure was signalled by a `notify` handler. Non-halting.
    Notified,
    /// Compensating action in flight.
    Compensating,
    /// Failed and compensated. Blocks dependents, does not halt.
    Compensated,
    /// Never ran because an upstream edge could not be satisfied.
    Skipped,
    /// Force-stopped by cancellation.
    Aborted,
}

impl StepStatus {
    /// Whether the step has reached a final outcome for this instance.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded
                | StepStatus::Notified
                | StepStatus::Compensated
                | StepStatus::Skipped
                | StepStatus::Aborted
        )
    }

    /// Whether work for the step is still outstanding.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            StepStatus::Running | StepStatus::Retrying | StepStatus::Compensating
        )
    }
}

// ---------------------------------------------------------------------------
// Activity records
// ---------------------------------------------------------------------------

/// The literal outbound call or event subscription of one attempt.
///
/// Logged before the attempt starts so that recovery can re-issue the same
/// call under the same idempotency key, or re-register the same wait.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityRecord {
    RemoteCall {
        target: String,
        method: String,
        path: String,
        body: Value,
        idempotency_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extract: Option<String>,
        timeout_ms: u64,
    },
    EventWait {
        event_type: String,
        filter: BTreeMap<String, Value>,
        deadline: DateTime<Utc>,
    },
}

impl ActivityRecord {
    /// Payload shown as the attempt's input in execution history.
    pub fn input(&self) -> Value {
        match self {
            ActivityRecord::RemoteCall { body, .. } => body.clone(),
            ActivityRecord::EventWait { filter, .. } => {
                serde_json::to_value(filter).unwrap_or(Value::Null)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// State log
// ---------------------------------------------------------------------------

/// One state transition. The log of these is the only source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transition {
    InstanceCreated {
        definition: DefinitionRef,
        correlation_id: String,
        context: Map<String, Value>,
    },
    InstanceStarted,
    ActivityRecorded {
        step: String,
        attempt: u32,
        activity: ActivityRecord,
    },
    StepSucceeded {
        step: String,
        attempt: u32,
        output: Value,
    },
    StepAttemptFailed {
        step: String,
        attempt: u32,
        failure: StepFailure,
        retry_in_ms: u64,
    },
    StepFailed {
        step: String,
        attempt: u32,
        failure: StepFailure,
    },
    HandlerRetryScheduled {
        step: String,
        round: u32,
        delay_ms: u64,
    },
    FailureNotified {
        step: String,
        target: String,
        delivered: bool,
    },
    CompensationStarted {
        step: String,
        activity: ActivityRecord,
    },
    CompensationSucceeded {
        step: String,
        output: Value,
    },
    CompensationFailed {
        step: String,
        failure: StepFailure,
    },
    StepSkipped {
        step: String,
        reason: String,
    },
    StepAborted {
        step: String,
    },
    InstancePaused,
    InstanceResumed,
    CancelRequested,
    InstanceCompleted,
    InstanceFailed {
        originating_step: String,
        error: String,
    },
    InstanceCancelled,
}

impl Transition {
    /// Short name used in logs and tables.
    pub fn name(&self) -> &'static str {
        match self {
            Transition::InstanceCreated { .. } => "instance_created",
            Transition::InstanceStarted => "instance_started",
            Transition::ActivityRecorded { .. } => "activity_recorded",
            Transition::StepSucceeded { .. } => "step_succeeded",
            Transition::StepAttemptFailed { .. } => "step_attempt_failed",
            Transition::StepFailed { .. } => "step_failed",
            Transition::HandlerRetryScheduled { .. } => "handler_retry_scheduled",
            Transition::FailureNotified { .. } => "failure_notified",
            Transition::CompensationStarted { .. } => "compensation_started",
            Transition::CompensationSucceeded { .. } => "compensation_succeeded",
            Transition::CompensationFailed { .. } => "compensation_failed",
            Transition::StepSkipped { .. } => "step_skipped",
            Transition::StepAborted { .. } => "step_aborted",
            Transition::InstancePaused => "instance_paused",
            Transition::InstanceResumed => "instance_resumed",
            Transition::CancelRequested => "cancel_requested",
            Transition::InstanceCompleted => "instance_completed",
            Transition::InstanceFailed { .. } => "instance_failed",
            Transition::InstanceCancelled => "instance_cancelled",
        }
    }

    /// The step a transition concerns, if it is step-scoped.
    pub fn step(&self) -> Option<&str> {
        match self {
            Transition::ActivityRecorded { step, .. }
            | Transition::StepSucceeded { step, .. }
            | Transition::StepAttemptFailed { step, .. }
            | Transition::StepFailed { step, .. }
            | Transition::HandlerRetryScheduled { step, .. }
            | Transition::FailureNotified { step, .. }
            | Transition::CompensationStarted { step, .. }
            | Transition::CompensationSucceeded { step, .. }
            | Transition::CompensationFailed { step, .. }
            | Transition::StepSkipped { step, .. }
            | Transition::StepAborted { step } => Some(step),
            _ => None,
        }
    }

    /// The instance state this transition moves to, if it changes it.
    pub fn resulting_state(&self) -> Option<InstanceState> {
        match self {
            Transition::InstanceCreated { .. } => Some(InstanceState::Created),
            Transition::InstanceStarted | Transition::InstanceResumed => {
                Some(InstanceState::Running)
            }
            Transition::InstancePaused => Some(InstanceState::Paused),
            Transition::InstanceCompleted => Some(InstanceState::Completed),
            Transition::InstanceFailed { .. } => Some(InstanceState::Failed),
            Transition::InstanceCancelled => Some(InstanceState::Cancelled),
            _ => None,
        }
    }
}

/// Append-only log row: `(instance_id, seq, transition, timestamp)`.
///
/// `seq` starts at 1 and increases by exactly 1 per instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateLogEntry {
    pub instance_id: Uuid,
    pub seq: u64,
    pub transition: Transition,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Projection
// ---------------------------------------------------------------------------

/// Derived state of one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub status: StepStatus,
    /// Last attempt number (1-based, keeps counting across handler rounds).
    pub attempt: u32,
    /// Handler retry rounds used so far.
    pub round: u32,
    /// Attempts consumed before the current round started.
    pub round_base: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<StepFailure>,
    /// Activity of the in-flight attempt (no outcome logged yet).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<ActivityRecord>,
    /// When the next attempt is due, while `Retrying`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
    /// Compensating call in flight, while `Compensating`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<ActivityRecord>,
    /// The error handler ran and could not recover the step.
    #[serde(default)]
    pub halted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepState {
    /// Attempts made in the current round.
    pub fn attempts_in_round(&self) -> u32 {
        self.attempt.saturating_sub(self.round_base)
    }
}

/// Outcome of a single attempt in execution history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
    Aborted,
}

/// One row per `(step, attempt)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub step: String,
    pub attempt: u32,
    pub status: ExecutionStatus,
    pub activity: ActivityRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Workflow instance as reconstructed from its state log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub definition: DefinitionRef,
    pub correlation_id: String,
    /// Key/value bag visible to all steps. Step outputs land under the step name.
    pub context: Map<String, Value>,
    pub state: InstanceState,
    pub steps: BTreeMap<String, StepState>,
    pub executions: Vec<StepExecution>,
    pub cancel_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub originating_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub last_seq: u64,
}

impl WorkflowInstance {
    /// Status of a step, `Pending` if nothing was logged for it.
    pub fn step_status(&self, step: &str) -> StepStatus {
        self.steps
            .get(step)
            .map(|s| s.status)
            .unwrap_or(StepStatus::Pending)
    }
}

/// Row of the instance index, maintained alongside the state log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub id: Uuid,
    pub definition: DefinitionRef,
    pub correlation_id: String,
    pub state: InstanceState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
