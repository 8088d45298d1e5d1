//! Workflow scheduler: drives instances from `Created` to a terminal state.
//!
//! Every live instance is owned by one driver task. The driver computes the
//! ready set from the instance projection, spawns one task per ready step
//! onto a `JoinSet`, and reacts to step exits, pause/resume/cancel commands
//! and the cancellation grace deadline. Step tasks and the driver only ever
//! change state by appending to the instance's `InstanceJournal`, so the
//! projection that `get_state` returns is always a prefix of the durable log.
//!
//! # Step phases
//!
//! 1. `Attempt`: wait out the backoff, take an admission permit, render and
//!    log the activity, execute it.
//! 2. `Execute`: re-run an activity logged before a crash (same attempt
//!    number, same idempotency key).
//! 3. `Exhausted`: the retry budget of the round is spent; consult the error
//!    handler.
//! 4. `Compensate`: run the compensating call under the step's retry policy.
//!
//! Recovery replays each non-terminal instance and maps every unsettled step
//! back onto one of these phases.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use conflux_types::breaker::BreakerSnapshot;
use conflux_types::config::EngineConfig;
use conflux_types::error::{FailureKind, RepositoryError, StepFailure};
use conflux_types::event::{EngineEvent, InboundEvent};
use conflux_types::instance::{
    ActivityRecord, InstanceState, InstanceSummary, StateLogEntry, StepStatus, Transition,
    WorkflowInstance,
};
use conflux_types::workflow::{DefinitionRef, StepDefinition, StepKind, WorkflowDefinition};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::Instrument;
use uuid::Uuid;

use super::activity::{ActivityInvoker, AdmissionControl, EventWaitActivity, RemoteCallActivity};
use super::breaker::CircuitBreakerRegistry;
use super::compensation::{self, FailureResolution};
use super::context::TemplateScope;
use super::correlation::CorrelationManager;
use super::dag;
use super::definition::{DefinitionError, DefinitionStore};
use super::journal::{InstanceJournal, JournalError};
use super::projection::{self, ReplayError};
use super::retry::{RetryDecision, RetryEvaluator};
use crate::event::EventBus;
use crate::remote::{BoxTransport, ServiceRegistry};
use crate::repository::workflow::WorkflowRepository;

/// Capacity of each instance's command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 16;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("state log replay failed: {0}")]
    Replay(#[from] ReplayError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error("instance {0} not found")]
    InstanceNotFound(Uuid),

    #[error("cannot {action} instance {id} in state '{state}'")]
    InvalidState {
        id: Uuid,
        state: InstanceState,
        action: &'static str,
    },

    #[error("instance {0} is not being driven by this engine")]
    NotActive(Uuid),

    #[error("engine is shutting down")]
    ShuttingDown,
}

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Answer to `get_state`: the projection plus the steps ready to dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub instance: WorkflowInstance,
    pub ready_steps: Vec<String>,
    /// Whether this engine is currently driving the instance.
    pub live: bool,
}

#[derive(Debug, Clone, Copy)]
enum CommandKind {
    Pause,
    Resume,
    Cancel,
}

impl CommandKind {
    fn action(self) -> &'static str {
        match self {
            CommandKind::Pause => "pause",
            CommandKind::Resume => "resume",
            CommandKind::Cancel => "cancel",
        }
    }
}

struct Command {
    kind: CommandKind,
    reply: oneshot::Sender<Result<(), EngineError>>,
}

struct InstanceHandle<R: WorkflowRepository> {
    journal: Arc<InstanceJournal<R>>,
    commands: mpsc::Sender<Command>,
    /// Cancelled when the driver task ends, however it ends.
    exited: CancellationToken,
}

struct EngineInner<R: WorkflowRepository> {
    repo: Arc<R>,
    definitions: DefinitionStore<R>,
    config: EngineConfig,
    bus: EventBus,
    breakers: Arc<CircuitBreakerRegistry>,
    correlation: Arc<CorrelationManager>,
    invoker: ActivityInvoker,
    admission: AdmissionControl,
    instances: DashMap<Uuid, InstanceHandle<R>>,
    shutdown: CancellationToken,
    drivers: Mutex<JoinSet<()>>,
    persister: Mutex<Option<JoinHandle<()>>>,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// The orchestration engine. Cheap to clone; clones share all state.
pub struct WorkflowEngine<R: WorkflowRepository> {
    inner: Arc<EngineInner<R>>,
}

impl<R: WorkflowRepository> Clone for WorkflowEngine<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: WorkflowRepository + 'static> WorkflowEngine<R> {
    /// Build an engine. Must be called inside a Tokio runtime.
    ///
    /// Breaker state changes are persisted by a background task; instances
    /// are not resumed until `recover` is called.
    pub fn new(
        repo: Arc<R>,
        transport: BoxTransport,
        registry: Arc<dyn ServiceRegistry>,
        config: EngineConfig,
    ) -> Self {
        let bus = EventBus::new(config.event_bus_capacity.max(1));
        let shutdown = CancellationToken::new();

        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        let breakers = Arc::new(
            CircuitBreakerRegistry::new(config.breaker.clone())
                .with_events(bus.clone())
                .with_change_feed(changes_tx),
        );
        let persister = tokio::spawn(persist_breakers(
            Arc::clone(&repo),
            changes_rx,
            shutdown.clone(),
        ));

        let correlation = Arc::new(CorrelationManager::new().with_events(bus.clone()));
        let default_timeout = Duration::from_secs(config.default_step_timeout_secs);
        let invoker = ActivityInvoker::new(
            RemoteCallActivity::new(transport, registry, Arc::clone(&breakers), default_timeout),
            EventWaitActivity::new(Arc::clone(&correlation), default_timeout),
        );
        let admission = AdmissionControl::new(config.max_concurrent_steps, config.per_target_limit);

        Self {
            inner: Arc::new(EngineInner {
                definitions: DefinitionStore::new(Arc::clone(&repo)),
                repo,
                config,
                bus,
                breakers,
                correlation,
                invoker,
                admission,
                instances: DashMap::new(),
                shutdown,
                drivers: Mutex::new(JoinSet::new()),
                persister: Mutex::new(Some(persister)),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    pub async fn register_definition(
        &self,
        def: WorkflowDefinition,
    ) -> Result<DefinitionRef, EngineError> {
        Ok(self.inner.definitions.register(def).await?)
    }

    /// Fetch a definition; `None` selects the latest version.
    pub async fn get_definition(
        &self,
        id: &str,
        version: Option<u32>,
    ) -> Result<Arc<WorkflowDefinition>, EngineError> {
        Ok(self.inner.definitions.resolve(id, version).await?)
    }

    pub async fn list_definitions(&self) -> Result<Vec<DefinitionRef>, EngineError> {
        Ok(self.inner.definitions.list().await?)
    }

    // -----------------------------------------------------------------------
    // Trigger API
    // -----------------------------------------------------------------------

    /// Create and start an instance of a definition.
    ///
    /// The instance pins the resolved version. Without an explicit
    /// correlation id the instance id is used.
    pub async fn start_instance(
        &self,
        definition_id: &str,
        version: Option<u32>,
        context: Map<String, Value>,
        correlation_id: Option<String>,
    ) -> Result<Uuid, EngineError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }
        let def = self.inner.definitions.resolve(definition_id, version).await?;

        let id = Uuid::now_v7();
        let correlation_id = correlation_id.unwrap_or_else(|| id.to_string());
        let journal = InstanceJournal::create(
            Arc::clone(&self.inner.repo),
            self.inner.bus.clone(),
            id,
            def.reference(),
            correlation_id.clone(),
            context,
        )
        .await?;
        journal.append(Transition::InstanceStarted).await?;

        tracing::info!(
            instance_id = %id,
            definition = %def.reference(),
            correlation_id = %correlation_id,
            "started workflow instance"
        );
        self.launch(def, journal);
        Ok(id)
    }

    pub async fn pause(&self, id: Uuid) -> Result<(), EngineError> {
        self.send_command(id, CommandKind::Pause).await
    }

    pub async fn resume(&self, id: Uuid) -> Result<(), EngineError> {
        self.send_command(id, CommandKind::Resume).await
    }

    /// Request cancellation. In-flight remote calls get the configured grace
    /// period before their steps are force-marked aborted.
    pub async fn cancel(&self, id: Uuid) -> Result<(), EngineError> {
        self.send_command(id, CommandKind::Cancel).await
    }

    /// Consistent snapshot of an instance, live or not.
    pub async fn get_state(&self, id: Uuid) -> Result<InstanceSnapshot, EngineError> {
        let live = self
            .inner
            .instances
            .get(&id)
            .map(|handle| handle.journal.snapshot());
        let (instance, is_live) = match live {
            Some(snapshot) => ((*snapshot).clone(), true),
            None => (self.replay(id).await?, false),
        };

        let ready_steps = if instance.state == InstanceState::Running && !instance.cancel_requested
        {
            let def = self
                .inner
                .definitions
                .get(&instance.definition.id, instance.definition.version)
                .await?;
            dag::ready_steps(&def, &instance).ready
        } else {
            Vec::new()
        };

        Ok(InstanceSnapshot {
            instance,
            ready_steps,
            live: is_live,
        })
    }

    /// Full state log of an instance.
    pub async fn state_log(&self, id: Uuid) -> Result<Vec<StateLogEntry>, EngineError> {
        let entries = self.inner.repo.load_log(&id).await?;
        if entries.is_empty() {
            return Err(EngineError::InstanceNotFound(id));
        }
        Ok(entries)
    }

    /// Rebuild an instance from its stored log.
    pub async fn replay(&self, id: Uuid) -> Result<WorkflowInstance, EngineError> {
        let entries = self.state_log(id).await?;
        Ok(projection::replay(&entries)?)
    }

    pub async fn list_instances(
        &self,
        active_only: bool,
    ) -> Result<Vec<InstanceSummary>, EngineError> {
        Ok(self.inner.repo.list_instances(active_only).await?)
    }

    /// Resolve once the instance reaches a terminal state.
    pub async fn wait_for_terminal(&self, id: Uuid) -> Result<WorkflowInstance, EngineError> {
        let live = self
            .inner
            .instances
            .get(&id)
            .map(|handle| (Arc::clone(&handle.journal), handle.exited.clone()));
        let Some((journal, exited)) = live else {
            let instance = self.replay(id).await?;
            if instance.state.is_terminal() {
                return Ok(instance);
            }
            return Err(EngineError::NotActive(id));
        };

        let mut rx = journal.subscribe();
        tokio::select! {
            result = rx.wait_for(|instance| instance.state.is_terminal()) => match result {
                Ok(instance) => Ok((**instance).clone()),
                Err(_) => Err(EngineError::NotActive(id)),
            },
            _ = exited.cancelled() => {
                let instance = journal.snapshot();
                if instance.state.is_terminal() {
                    Ok((*instance).clone())
                } else {
                    Err(EngineError::NotActive(id))
                }
            }
            _ = self.inner.shutdown.cancelled() => Err(EngineError::ShuttingDown),
        }
    }

    // -----------------------------------------------------------------------
    // Events and breakers
    // -----------------------------------------------------------------------

    /// Hand an inbound event to the correlation manager. Returns the number
    /// of waiting steps it resumed.
    pub fn deliver_event(&self, event: &InboundEvent) -> usize {
        let resumed = self.inner.correlation.deliver(event);
        tracing::debug!(event_type = %event.event_type, resumed, "delivered inbound event");
        resumed
    }

    /// Event types some step is currently waiting for.
    pub fn awaited_event_types(&self) -> BTreeSet<String> {
        self.inner.correlation.awaited_event_types()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.bus.subscribe()
    }

    pub fn breakers(&self) -> Vec<BreakerSnapshot> {
        self.inner.breakers.snapshots()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Restore breaker state and resume every non-terminal instance.
    ///
    /// An instance whose log does not replay or whose pinned definition is
    /// missing is logged and left untouched; the rest still resume. Returns
    /// the ids of the resumed instances.
    pub async fn recover(&self) -> Result<Vec<Uuid>, EngineError> {
        let breakers = self.inner.repo.list_breakers().await?;
        self.inner.breakers.restore(&breakers);

        let mut resumed = Vec::new();
        let mut skipped = 0usize;
        for summary in self.inner.repo.list_instances(true).await? {
            if self.inner.instances.contains_key(&summary.id) {
                continue;
            }
            match self.recover_instance(summary.id).await {
                Ok(()) => resumed.push(summary.id),
                Err(e) => {
                    skipped += 1;
                    tracing::error!(
                        instance_id = %summary.id,
                        definition = %summary.definition,
                        error = %e,
                        "cannot recover workflow instance, skipping"
                    );
                }
            }
        }

        tracing::info!(
            instances = resumed.len(),
            skipped,
            breakers = breakers.len(),
            "recovery complete"
        );
        Ok(resumed)
    }

    async fn recover_instance(&self, id: Uuid) -> Result<(), EngineError> {
        let entries = self.inner.repo.load_log(&id).await?;
        let journal = InstanceJournal::resume(
            Arc::clone(&self.inner.repo),
            self.inner.bus.clone(),
            &entries,
        )?;
        let snapshot = journal.snapshot();
        let def = self
            .inner
            .definitions
            .get(&snapshot.definition.id, snapshot.definition.version)
            .await?;
        if snapshot.state == InstanceState::Created && !snapshot.cancel_requested {
            journal.append(Transition::InstanceStarted).await?;
        }

        tracing::info!(
            instance_id = %id,
            definition = %snapshot.definition,
            state = %snapshot.state,
            last_seq = snapshot.last_seq,
            "recovering workflow instance"
        );
        self.launch(def, journal);
        Ok(())
    }

    /// Stop every driver and step task without writing anything to the log.
    ///
    /// Equivalent to a process crash from the log's point of view; a new
    /// engine over the same repository picks up with `recover`.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let mut drivers = {
            let mut guard = self
                .inner
                .drivers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *guard)
        };
        while drivers.join_next().await.is_some() {}

        let persister = self
            .inner
            .persister
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = persister {
            let _ = handle.await;
        }
        self.inner.instances.clear();
        tracing::info!("workflow engine stopped");
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn launch(&self, def: Arc<WorkflowDefinition>, journal: Arc<InstanceJournal<R>>) {
        let id = journal.id();
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let exited = CancellationToken::new();
        self.inner.instances.insert(
            id,
            InstanceHandle {
                journal: Arc::clone(&journal),
                commands: tx,
                exited: exited.clone(),
            },
        );

        let driver = Driver {
            inner: Arc::clone(&self.inner),
            def,
            journal,
            cancel: CancellationToken::new(),
            tasks: JoinSet::new(),
            running: HashMap::new(),
            halt: None,
            grace: None,
            _exited: exited.drop_guard(),
        };
        let span = tracing::info_span!("instance", instance_id = %id);

        let mut drivers = self
            .inner
            .drivers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while drivers.try_join_next().is_some() {}
        drivers.spawn(driver.drive(rx).instrument(span));
    }

    async fn send_command(&self, id: Uuid, kind: CommandKind) -> Result<(), EngineError> {
        let sender = self
            .inner
            .instances
            .get(&id)
            .map(|handle| handle.commands.clone());
        let Some(sender) = sender else {
            return Err(self.inactive_error(id, kind).await);
        };

        let (reply, response) = oneshot::channel();
        if sender.send(Command { kind, reply }).await.is_err() {
            return Err(self.inactive_error(id, kind).await);
        }
        match response.await {
            Ok(result) => result,
            Err(_) => Err(self.inactive_error(id, kind).await),
        }
    }

    async fn inactive_error(&self, id: Uuid, kind: CommandKind) -> EngineError {
        match self.replay(id).await {
            Ok(instance) if instance.state.is_terminal() => EngineError::InvalidState {
                id,
                state: instance.state,
                action: kind.action(),
            },
            Ok(_) if self.inner.shutdown.is_cancelled() => EngineError::ShuttingDown,
            Ok(_) => EngineError::NotActive(id),
            Err(e) => e,
        }
    }
}

impl<R: WorkflowRepository> std::fmt::Debug for WorkflowEngine<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("live_instances", &self.inner.instances.len())
            .field("pending_waits", &self.inner.correlation.pending_count())
            .finish()
    }
}

async fn persist_breakers<R: WorkflowRepository>(
    repo: Arc<R>,
    mut changes: mpsc::UnboundedReceiver<BreakerSnapshot>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            change = changes.recv() => match change {
                Some(snapshot) => upsert_breaker(repo.as_ref(), &snapshot).await,
                None => return,
            },
            _ = stop.cancelled() => break,
        }
    }
    while let Ok(snapshot) = changes.try_recv() {
        upsert_breaker(repo.as_ref(), &snapshot).await;
    }
}

async fn upsert_breaker<R: WorkflowRepository>(repo: &R, snapshot: &BreakerSnapshot) {
    if let Err(e) = repo.upsert_breaker(snapshot).await {
        tracing::warn!(target_name = %snapshot.target, error = %e, "failed to persist breaker state");
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Owns one live instance.
struct Driver<R: WorkflowRepository> {
    inner: Arc<EngineInner<R>>,
    def: Arc<WorkflowDefinition>,
    journal: Arc<InstanceJournal<R>>,
    /// Tripped by a cancel request; observed by every step task.
    cancel: CancellationToken,
    tasks: JoinSet<StepExit>,
    running: HashMap<tokio::task::Id, String>,
    /// First step that halted the instance, with its last error.
    halt: Option<(String, String)>,
    /// When in-flight steps are force-aborted after a cancel request.
    grace: Option<Instant>,
    _exited: DropGuard,
}

impl<R: WorkflowRepository + 'static> Driver<R> {
    async fn drive(mut self, mut commands: mpsc::Receiver<Command>) {
        let id = self.journal.id();
        if let Err(e) = self.run(&mut commands).await {
            tracing::error!(instance_id = %id, error = %e, "instance driver stopped");
            self.tasks.shutdown().await;
        }
        self.inner.instances.remove(&id);
    }

    async fn run(&mut self, commands: &mut mpsc::Receiver<Command>) -> Result<(), JournalError> {
        self.resume_in_flight();

        loop {
            let state = self.journal.snapshot();
            if state.state.is_terminal() {
                return Ok(());
            }

            if state.cancel_requested {
                if !self.cancel.is_cancelled() {
                    self.cancel.cancel();
                }
                if self.tasks.is_empty() {
                    return self.finish_cancel().await;
                }
            } else if state.state == InstanceState::Running {
                if self.halt.is_none() {
                    self.dispatch().await?;
                }
                if self.tasks.is_empty() {
                    return self.settle().await;
                }
            }

            let grace = self.grace;
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => {
                    self.tasks.shutdown().await;
                    return Ok(());
                }
                Some(command) = commands.recv() => {
                    let result = self.handle_command(command.kind).await;
                    let _ = command.reply.send(result);
                }
                Some(joined) = self.tasks.join_next_with_id(), if !self.tasks.is_empty() => {
                    self.handle_exit(joined).await?;
                }
                _ = tokio::time::sleep_until(grace.unwrap_or_else(Instant::now)), if grace.is_some() => {
                    tracing::warn!(
                        instance_id = %self.journal.id(),
                        steps = self.tasks.len(),
                        "cancel grace period elapsed, aborting in-flight steps"
                    );
                    self.grace = None;
                    self.tasks.abort_all();
                }
            }
        }
    }

    /// Write the terminal transition once nothing is in flight.
    async fn settle(&mut self) -> Result<(), JournalError> {
        let state = self.journal.snapshot();
        let unsettled = self
            .def
            .steps
            .iter()
            .find(|s| !state.step_status(&s.name).is_settled());

        let halt = match (self.halt.take(), unsettled) {
            (Some(halt), _) => halt,
            (None, None) => {
                self.journal.append(Transition::InstanceCompleted).await?;
                tracing::info!(instance_id = %state.id, "workflow instance completed");
                return Ok(());
            }
            (None, Some(step)) => {
                // nothing runs and nothing is ready: a step task died without reporting
                tracing::error!(
                    instance_id = %state.id,
                    step = %step.name,
                    status = ?state.step_status(&step.name),
                    "instance stalled with no runnable step"
                );
                (step.name.clone(), "no runnable work remains".to_string())
            }
        };

        let (step, error) = halt;
        self.journal
            .append(Transition::InstanceFailed {
                originating_step: step.clone(),
                error: error.clone(),
            })
            .await?;
        tracing::warn!(
            instance_id = %state.id,
            originating_step = %step,
            error = %error,
            "workflow instance failed"
        );
        Ok(())
    }

    /// Skip blocked steps until none are left, then spawn the ready ones.
    async fn dispatch(&mut self) -> Result<(), JournalError> {
        loop {
            let state = self.journal.snapshot();
            let readiness = dag::ready_steps(&self.def, &state);

            let mut skipped = false;
            for (step, reason) in readiness.blocked {
                if self.is_running(&step) {
                    continue;
                }
                tracing::info!(instance_id = %state.id, step = %step, reason = %reason, "skipping step");
                self.journal
                    .append(Transition::StepSkipped { step, reason })
                    .await?;
                skipped = true;
            }
            if skipped {
                continue;
            }

            for step in readiness.ready {
                if self.is_running(&step) {
                    continue;
                }
                let attempt = state.steps.get(&step).map(|s| s.attempt).unwrap_or(0) + 1;
                self.spawn(
                    step,
                    Phase::Attempt {
                        attempt,
                        delay: Duration::ZERO,
                    },
                );
            }
            return Ok(());
        }
    }

    /// Map unsettled steps of a replayed projection back onto step phases.
    fn resume_in_flight(&mut self) {
        let state = self.journal.snapshot();
        if state.cancel_requested {
            self.cancel.cancel();
            return;
        }

        for (name, step) in &state.steps {
            if self.def.step(name).is_none() {
                continue;
            }
            let phase = match step.status {
                StepStatus::Running => match &step.activity {
                    Some(record) => Phase::Execute {
                        attempt: step.attempt,
                        record: record.clone(),
                    },
                    None => Phase::Attempt {
                        attempt: step.attempt + 1,
                        delay: Duration::ZERO,
                    },
                },
                StepStatus::Retrying => Phase::Attempt {
                    attempt: step.attempt + 1,
                    delay: step
                        .retry_at
                        .and_then(|at| (at - Utc::now()).to_std().ok())
                        .unwrap_or(Duration::ZERO),
                },
                StepStatus::Failed if step.halted => {
                    let error = step
                        .failure
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| "step failed".to_string());
                    self.halt.get_or_insert((name.clone(), error));
                    continue;
                }
                StepStatus::Failed => Phase::Exhausted(
                    step.failure
                        .clone()
                        .unwrap_or_else(|| StepFailure::permanent("step failed")),
                ),
                StepStatus::Compensating => match &step.compensation {
                    Some(record) => Phase::Compensate(record.clone()),
                    None => Phase::Exhausted(
                        step.failure
                            .clone()
                            .unwrap_or_else(|| StepFailure::permanent("step failed")),
                    ),
                },
                _ => continue,
            };
            tracing::info!(
                instance_id = %state.id,
                step = %name,
                phase = phase.name(),
                "resuming step"
            );
            self.spawn(name.clone(), phase);
        }
    }

    fn spawn(&mut self, step: String, phase: Phase) {
        let runner = StepRunner {
            inner: Arc::clone(&self.inner),
            def: Arc::clone(&self.def),
            journal: Arc::clone(&self.journal),
            step: step.clone(),
            cancel: self.cancel.clone(),
        };
        let handle = self.tasks.spawn(runner.run(phase).in_current_span());
        self.running.insert(handle.id(), step);
    }

    fn is_running(&self, step: &str) -> bool {
        self.running.values().any(|s| s == step)
    }

    async fn handle_exit(
        &mut self,
        joined: Result<(tokio::task::Id, StepExit), JoinError>,
    ) -> Result<(), JournalError> {
        match joined {
            Ok((task, exit)) => {
                let step = self.running.remove(&task).unwrap_or_default();
                match exit {
                    StepExit::Settled => Ok(()),
                    StepExit::Halt { error } => {
                        if self.halt.is_none() {
                            tracing::warn!(
                                instance_id = %self.journal.id(),
                                step = %step,
                                error = %error,
                                "step halted the instance, draining in-flight steps"
                            );
                            self.halt = Some((step, error));
                        }
                        Ok(())
                    }
                    StepExit::Aborted => self.abort_step(&step).await,
                    StepExit::Fault(e) => Err(e),
                }
            }
            Err(e) => {
                let step = self.running.remove(&e.id()).unwrap_or_default();
                if e.is_panic() {
                    tracing::error!(instance_id = %self.journal.id(), step = %step, "step task panicked");
                    self.halt
                        .get_or_insert((step, "step task panicked".to_string()));
                    Ok(())
                } else {
                    self.abort_step(&step).await
                }
            }
        }
    }

    async fn handle_command(&mut self, kind: CommandKind) -> Result<(), EngineError> {
        let state = self.journal.snapshot();
        let invalid = || EngineError::InvalidState {
            id: state.id,
            state: state.state,
            action: kind.action(),
        };

        match kind {
            CommandKind::Pause => match state.state {
                InstanceState::Running if !state.cancel_requested => {
                    self.journal.append(Transition::InstancePaused).await?;
                    tracing::info!(instance_id = %state.id, "workflow instance paused");
                    Ok(())
                }
                InstanceState::Paused => Ok(()),
                _ => Err(invalid()),
            },
            CommandKind::Resume => match state.state {
                InstanceState::Paused if !state.cancel_requested => {
                    self.journal.append(Transition::InstanceResumed).await?;
                    tracing::info!(instance_id = %state.id, "workflow instance resumed");
                    Ok(())
                }
                InstanceState::Running => Ok(()),
                _ => Err(invalid()),
            },
            CommandKind::Cancel => {
                if state.cancel_requested {
                    return Ok(());
                }
                if state.state.is_terminal() {
                    return Err(invalid());
                }
                self.journal.append(Transition::CancelRequested).await?;
                self.cancel.cancel();
                let grace = Duration::from_millis(self.inner.config.cancel_grace_ms);
                self.grace = Some(Instant::now() + grace);
                tracing::info!(
                    instance_id = %state.id,
                    in_flight = self.tasks.len(),
                    grace_ms = grace.as_millis() as u64,
                    "cancel requested"
                );
                Ok(())
            }
        }
    }

    async fn abort_step(&self, step: &str) -> Result<(), JournalError> {
        let status = self.journal.snapshot().step_status(step);
        if status.is_settled() || status == StepStatus::Pending {
            return Ok(());
        }
        match self
            .journal
            .append(Transition::StepAborted {
                step: step.to_string(),
            })
            .await
        {
            Ok(_) => Ok(()),
            // an outcome landed first
            Err(JournalError::Rejected(e)) => {
                tracing::debug!(step, error = %e, "step settled before abort was logged");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn finish_cancel(&mut self) -> Result<(), JournalError> {
        let state = self.journal.snapshot();
        let unsettled: Vec<String> = projection::unsettled_steps(&state)
            .into_iter()
            .map(|(name, _)| name.to_string())
            .collect();
        for step in &unsettled {
            self.abort_step(step).await?;
        }
        self.journal.append(Transition::InstanceCancelled).await?;
        tracing::info!(
            instance_id = %state.id,
            aborted = unsettled.len(),
            "workflow instance cancelled"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Step tasks
// ---------------------------------------------------------------------------

enum Phase {
    Attempt { attempt: u32, delay: Duration },
    Execute { attempt: u32, record: ActivityRecord },
    Exhausted(StepFailure),
    Compensate(ActivityRecord),
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::Attempt { .. } => "attempt",
            Phase::Execute { .. } => "execute",
            Phase::Exhausted(_) => "exhausted",
            Phase::Compensate(_) => "compensate",
        }
    }
}

/// How a step task ended.
enum StepExit {
    /// The step reached a settled status in the log.
    Settled,
    /// The step failed for good and its handler did not recover it.
    Halt { error: String },
    /// Stopped by cancellation; the driver logs the abort.
    Aborted,
    /// The log could not be written.
    Fault(JournalError),
}

enum Flow {
    Next(Phase),
    Exit(StepExit),
}

struct StepRunner<R: WorkflowRepository> {
    inner: Arc<EngineInner<R>>,
    def: Arc<WorkflowDefinition>,
    journal: Arc<InstanceJournal<R>>,
    step: String,
    cancel: CancellationToken,
}

impl<R: WorkflowRepository + 'static> StepRunner<R> {
    async fn run(self, mut phase: Phase) -> StepExit {
        let Some(step) = self.def.step(&self.step).cloned() else {
            return StepExit::Halt {
                error: format!("step '{}' is not part of the definition", self.step),
            };
        };

        loop {
            let flow = match phase {
                Phase::Attempt { attempt, delay } => self.attempt(&step, attempt, delay, None).await,
                Phase::Execute { attempt, record } => {
                    self.attempt(&step, attempt, Duration::ZERO, Some(record))
                        .await
                }
                Phase::Exhausted(failure) => self.resolve(&step, failure).await,
                Phase::Compensate(record) => self.compensate(&step, record).await,
            };
            match flow {
                Ok(Flow::Next(next)) => phase = next,
                Ok(Flow::Exit(exit)) => return exit,
                Err(e) => return StepExit::Fault(e),
            }
        }
    }

    /// Sleep for `delay` unless cancelled first. Returns false on cancel.
    async fn pause_for(&self, delay: Duration) -> bool {
        if delay.is_zero() {
            return !self.cancel.is_cancelled();
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => !self.cancel.is_cancelled(),
            _ = self.cancel.cancelled() => false,
        }
    }

    async fn attempt(
        &self,
        step: &StepDefinition,
        attempt: u32,
        delay: Duration,
        recorded: Option<ActivityRecord>,
    ) -> Result<Flow, JournalError> {
        if !self.pause_for(delay).await {
            return Ok(Flow::Exit(StepExit::Aborted));
        }

        let permit = match &step.kind {
            StepKind::RemoteCall(spec) => {
                let permit = tokio::select! {
                    permit = self.inner.admission.acquire(&spec.target) => permit.ok(),
                    _ = self.cancel.cancelled() => None,
                };
                match permit {
                    Some(permit) => Some(permit),
                    None => return Ok(Flow::Exit(StepExit::Aborted)),
                }
            }
            StepKind::EventWait(_) => None,
        };

        let instance_id = self.journal.id();
        let fresh = recorded.is_none();
        let record = match recorded {
            Some(record) => record,
            None => {
                let snapshot = self.journal.snapshot();
                match self.inner.invoker.prepare(&snapshot, step, attempt) {
                    Ok(record) => record,
                    Err(failure) => {
                        tracing::warn!(
                            instance_id = %instance_id,
                            step = %step.name,
                            error = %failure,
                            "could not render step"
                        );
                        self.journal
                            .append(Transition::StepFailed {
                                step: step.name.clone(),
                                attempt,
                                failure: failure.clone(),
                            })
                            .await?;
                        return Ok(Flow::Next(Phase::Exhausted(failure)));
                    }
                }
            }
        };
        // a recovered attempt is already in the log
        if fresh {
            self.journal
                .append(Transition::ActivityRecorded {
                    step: step.name.clone(),
                    attempt,
                    activity: record.clone(),
                })
                .await?;
        }

        tracing::debug!(
            instance_id = %instance_id,
            step = %step.name,
            attempt,
            kind = step.type_name(),
            "executing step attempt"
        );
        let result = self
            .inner
            .invoker
            .execute(instance_id, &step.name, attempt, &record, &self.cancel)
            .await;
        drop(permit);

        match result {
            Ok(output) => {
                self.journal
                    .append(Transition::StepSucceeded {
                        step: step.name.clone(),
                        attempt,
                        output,
                    })
                    .await?;
                tracing::info!(instance_id = %instance_id, step = %step.name, attempt, "step succeeded");
                Ok(Flow::Exit(StepExit::Settled))
            }
            Err(failure) if failure.kind == FailureKind::Cancelled => {
                Ok(Flow::Exit(StepExit::Aborted))
            }
            Err(failure) => {
                let round_base = self
                    .journal
                    .snapshot()
                    .steps
                    .get(&step.name)
                    .map(|s| s.round_base)
                    .unwrap_or(0);
                let in_round = attempt.saturating_sub(round_base);
                match RetryEvaluator::decide(&step.retry, in_round, &failure) {
                    RetryDecision::RetryAfter(delay) => {
                        tracing::info!(
                            instance_id = %instance_id,
                            step = %step.name,
                            attempt,
                            error = %failure,
                            retry_in_ms = delay.as_millis() as u64,
                            "step attempt failed, retrying"
                        );
                        self.journal
                            .append(Transition::StepAttemptFailed {
                                step: step.name.clone(),
                                attempt,
                                failure,
                                retry_in_ms: delay.as_millis() as u64,
                            })
                            .await?;
                        Ok(Flow::Next(Phase::Attempt {
                            attempt: attempt + 1,
                            delay,
                        }))
                    }
                    RetryDecision::Exhausted => {
                        tracing::warn!(
                            instance_id = %instance_id,
                            step = %step.name,
                            attempt,
                            error = %failure,
                            "step failed"
                        );
                        self.journal
                            .append(Transition::StepFailed {
                                step: step.name.clone(),
                                attempt,
                                failure: failure.clone(),
                            })
                            .await?;
                        Ok(Flow::Next(Phase::Exhausted(failure)))
                    }
                }
            }
        }
    }

    async fn resolve(
        &self,
        step: &StepDefinition,
        failure: StepFailure,
    ) -> Result<Flow, JournalError> {
        if self.cancel.is_cancelled() {
            return Ok(Flow::Exit(StepExit::Aborted));
        }
        let snapshot = self.journal.snapshot();
        let state = snapshot.steps.get(&step.name).cloned().unwrap_or_default();
        let resolution = compensation::resolve(&self.def, &step.name, &state);
        tracing::debug!(
            instance_id = %snapshot.id,
            step = %step.name,
            resolution = resolution.name(),
            "resolving failed step"
        );

        match resolution {
            FailureResolution::RetryRound { round, delay } => {
                self.journal
                    .append(Transition::HandlerRetryScheduled {
                        step: step.name.clone(),
                        round,
                        delay_ms: delay.as_millis() as u64,
                    })
                    .await?;
                Ok(Flow::Next(Phase::Attempt {
                    attempt: state.attempt + 1,
                    delay,
                }))
            }
            FailureResolution::Notify { target, path } => {
                let body = compensation::notification_body(&snapshot, &step.name, Some(&failure));
                let key = compensation::handler_key(&snapshot, &step.name, "notify");
                let timeout = Duration::from_secs(self.inner.config.default_step_timeout_secs);
                let delivered = match self
                    .inner
                    .invoker
                    .remote()
                    .call(&target, "POST", &path, body, &key, timeout)
                    .await
                {
                    Ok(_) => true,
                    Err(e) => {
                        tracing::warn!(
                            instance_id = %snapshot.id,
                            step = %step.name,
                            target_name = %target,
                            error = %e,
                            "failure notification was not delivered"
                        );
                        false
                    }
                };
                self.journal
                    .append(Transition::FailureNotified {
                        step: step.name.clone(),
                        target,
                        delivered,
                    })
                    .await?;
                self.inner.bus.publish(EngineEvent::StepFailureSignalled {
                    instance_id: snapshot.id,
                    correlation_id: snapshot.correlation_id.clone(),
                    step: step.name.clone(),
                    error: failure.to_string(),
                });
                Ok(Flow::Exit(StepExit::Settled))
            }
            FailureResolution::Compensate { action } => {
                let scope = TemplateScope::for_instance(&snapshot);
                let key = compensation::handler_key(&snapshot, &step.name, "compensate");
                let timeout = step.timeout_secs.map(Duration::from_secs);
                match self
                    .inner
                    .invoker
                    .remote()
                    .prepare_call(&action, &scope, key, timeout)
                {
                    Ok(record) => {
                        self.journal
                            .append(Transition::CompensationStarted {
                                step: step.name.clone(),
                                activity: record.clone(),
                            })
                            .await?;
                        Ok(Flow::Next(Phase::Compensate(record)))
                    }
                    Err(render) => {
                        self.journal
                            .append(Transition::CompensationFailed {
                                step: step.name.clone(),
                                failure: render.clone(),
                            })
                            .await?;
                        Ok(Flow::Exit(StepExit::Halt {
                            error: format!("compensation failed: {render}"),
                        }))
                    }
                }
            }
            FailureResolution::Halt => Ok(Flow::Exit(StepExit::Halt {
                error: state
                    .failure
                    .map(|f| f.to_string())
                    .unwrap_or_else(|| failure.to_string()),
            })),
        }
    }

    /// Run the compensating call, retried under the step's own policy.
    async fn compensate(
        &self,
        step: &StepDefinition,
        record: ActivityRecord,
    ) -> Result<Flow, JournalError> {
        let mut attempt = 1;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(Flow::Exit(StepExit::Aborted));
            }
            match self.inner.invoker.remote().execute(&step.name, &record).await {
                Ok(output) => {
                    self.journal
                        .append(Transition::CompensationSucceeded {
                            step: step.name.clone(),
                            output,
                        })
                        .await?;
                    tracing::info!(instance_id = %self.journal.id(), step = %step.name, "step compensated");
                    return Ok(Flow::Exit(StepExit::Settled));
                }
                Err(failure) => match RetryEvaluator::decide(&step.retry, attempt, &failure) {
                    RetryDecision::RetryAfter(delay) => {
                        tracing::debug!(
                            step = %step.name,
                            attempt,
                            error = %failure,
                            "compensation attempt failed, retrying"
                        );
                        if !self.pause_for(delay).await {
                            return Ok(Flow::Exit(StepExit::Aborted));
                        }
                        attempt += 1;
                    }
                    RetryDecision::Exhausted => {
                        self.journal
                            .append(Transition::CompensationFailed {
                                step: step.name.clone(),
                                failure: failure.clone(),
                            })
                            .await?;
                        return Ok(Flow::Exit(StepExit::Halt {
                            error: format!("compensation failed: {failure}"),
                        }));
                    }
                },
            }
        }
    }
}
