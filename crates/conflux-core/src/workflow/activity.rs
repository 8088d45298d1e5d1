//! The two step primitives: `remote_call` and `event_wait`.
//!
//! Each attempt runs in two phases. `prepare` renders the step against the
//! instance and produces the `ActivityRecord` that is logged before anything
//! leaves the process. `execute` then performs exactly what the record says,
//! so a recovered instance re-issues a recorded call (same idempotency key)
//! or re-registers a recorded wait (same deadline) without re-rendering.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use conflux_types::error::{FailureKind, StepFailure};
use conflux_types::instance::{ActivityRecord, WorkflowInstance};
use conflux_types::workflow::{EventWaitSpec, RemoteCallSpec, StepDefinition, StepKind};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::breaker::CircuitBreakerRegistry;
use super::context::{self, TemplateScope};
use super::correlation::{CorrelationError, CorrelationManager};
use crate::remote::{BoxTransport, RemoteRequest, ServiceRegistry, TransportError};

/// Upper bound for wait deadlines that overflow the clock.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Identifier of one attempt. Doubles as the idempotency key of its call.
pub fn execution_id(instance_id: Uuid, step: &str, attempt: u32) -> String {
    format!("{instance_id}:{step}:{attempt}")
}

// ---------------------------------------------------------------------------
// remote_call
// ---------------------------------------------------------------------------

/// Issues calls to downstream targets through their circuit breakers.
pub struct RemoteCallActivity {
    transport: BoxTransport,
    registry: Arc<dyn ServiceRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    default_timeout: Duration,
}

impl RemoteCallActivity {
    pub fn new(
        transport: BoxTransport,
        registry: Arc<dyn ServiceRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            registry,
            breakers,
            default_timeout,
        }
    }

    /// Render a call spec into a loggable record.
    pub fn prepare_call(
        &self,
        spec: &RemoteCallSpec,
        scope: &TemplateScope,
        idempotency_key: String,
        timeout: Option<Duration>,
    ) -> Result<ActivityRecord, StepFailure> {
        let body = context::render_value(&spec.input, scope)?;
        let path = match context::render_value(&Value::String(spec.path.clone()), scope)? {
            Value::String(s) => s,
            other => other.to_string(),
        };
        Ok(ActivityRecord::RemoteCall {
            target: spec.target.clone(),
            method: spec.method.clone(),
            path,
            body,
            idempotency_key,
            extract: spec.extract.clone(),
            timeout_ms: timeout.unwrap_or(self.default_timeout).as_millis() as u64,
        })
    }

    /// Perform a recorded call and apply its extraction.
    pub async fn execute(&self, step: &str, record: &ActivityRecord) -> Result<Value, StepFailure> {
        let ActivityRecord::RemoteCall {
            target,
            method,
            path,
            body,
            idempotency_key,
            extract,
            timeout_ms,
        } = record
        else {
            return Err(StepFailure::permanent("record is not a remote call"));
        };

        let response = self
            .call(
                target,
                method,
                path,
                body.clone(),
                idempotency_key,
                Duration::from_millis(*timeout_ms),
            )
            .await?;
        let output = match extract {
            Some(selector) => context::extract(&response, selector)?,
            None => response,
        };
        Ok(context::bounded_output(step, output))
    }

    /// One call through the breaker of `target`.
    ///
    /// Rejected calls never touch the network. A permanent error means the
    /// target answered, so it counts as a healthy call for the breaker.
    pub async fn call(
        &self,
        target: &str,
        method: &str,
        path: &str,
        body: Value,
        idempotency_key: &str,
        timeout: Duration,
    ) -> Result<Value, StepFailure> {
        let permit = self
            .breakers
            .try_acquire(target)
            .map_err(|wait| StepFailure::circuit_open(target, wait.as_millis() as u64))?;

        let address = match self.registry.resolve(target) {
            Ok(address) => address,
            Err(e) => {
                permit.fail();
                return Err(StepFailure::transient(e.to_string()));
            }
        };

        let request = RemoteRequest {
            target: target.to_string(),
            address,
            method: method.to_string(),
            path: path.to_string(),
            body,
            idempotency_key: idempotency_key.to_string(),
            timeout,
        };

        tracing::debug!(
            target_name = target,
            method,
            path,
            idempotency_key,
            trial = permit.is_trial(),
            "issuing remote call"
        );

        let outcome = match tokio::time::timeout(timeout, self.transport.call(&request)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };

        match outcome {
            Ok(response) => {
                permit.succeed();
                Ok(response.body)
            }
            Err(e) => {
                let failure = e.into_failure(target);
                if failure.kind == FailureKind::Permanent {
                    permit.succeed();
                } else {
                    permit.fail();
                }
                tracing::debug!(target_name = target, error = %failure, "remote call failed");
                Err(failure)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// event_wait
// ---------------------------------------------------------------------------

/// Suspends a step until a correlated event arrives.
pub struct EventWaitActivity {
    correlation: Arc<CorrelationManager>,
    default_timeout: Duration,
}

impl EventWaitActivity {
    pub fn new(correlation: Arc<CorrelationManager>, default_timeout: Duration) -> Self {
        Self {
            correlation,
            default_timeout,
        }
    }

    /// Render the correlation filter and fix the absolute deadline.
    pub fn prepare(
        &self,
        spec: &EventWaitSpec,
        scope: &TemplateScope,
        timeout: Option<Duration>,
    ) -> Result<ActivityRecord, StepFailure> {
        let mut filter = BTreeMap::new();
        for (field, template) in &spec.correlation {
            filter.insert(field.clone(), context::render_value(template, scope)?);
        }
        let timeout = timeout.unwrap_or(self.default_timeout);
        let deadline = chrono::TimeDelta::from_std(timeout)
            .ok()
            .and_then(|delta| Utc::now().checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Ok(ActivityRecord::EventWait {
            event_type: spec.event_type.clone(),
            filter,
            deadline,
        })
    }

    /// Wait for the recorded event until the recorded deadline.
    ///
    /// The output is the payload of the matching event.
    pub async fn execute(
        &self,
        step: &str,
        wait_id: &str,
        record: &ActivityRecord,
        cancel: &CancellationToken,
    ) -> Result<Value, StepFailure> {
        let ActivityRecord::EventWait {
            event_type,
            filter,
            deadline,
        } = record
        else {
            return Err(StepFailure::permanent("record is not an event wait"));
        };

        let remaining = (*deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let now = tokio::time::Instant::now();
        let deadline = now
            .checked_add(remaining)
            .unwrap_or_else(|| now + FAR_FUTURE);
        let pending = self
            .correlation
            .register(wait_id, event_type.clone(), filter.clone())
            .map_err(|e| StepFailure::permanent(e.to_string()))?;

        tokio::select! {
            result = pending.wait_until(deadline) => match result {
                Ok(event) => Ok(context::bounded_output(step, event.payload)),
                Err(CorrelationError::TimedOut { event_type }) => Err(StepFailure::timeout(
                    format!("no '{event_type}' event arrived before the deadline"),
                )),
                Err(e) => Err(StepFailure::transient(e.to_string())),
            },
            _ = cancel.cancelled() => Err(StepFailure::cancelled()),
        }
    }
}

// ---------------------------------------------------------------------------
// Invoker
// ---------------------------------------------------------------------------

/// Dispatches a step to the primitive matching its kind.
pub struct ActivityInvoker {
    remote: RemoteCallActivity,
    wait: EventWaitActivity,
}

impl ActivityInvoker {
    pub fn new(remote: RemoteCallActivity, wait: EventWaitActivity) -> Self {
        Self { remote, wait }
    }

    pub fn remote(&self) -> &RemoteCallActivity {
        &self.remote
    }

    /// Build the record of attempt `attempt` of `step`.
    pub fn prepare(
        &self,
        instance: &WorkflowInstance,
        step: &StepDefinition,
        attempt: u32,
    ) -> Result<ActivityRecord, StepFailure> {
        let scope = TemplateScope::for_step(instance, step);
        let timeout = step.timeout_secs.map(Duration::from_secs);
        match &step.kind {
            StepKind::RemoteCall(spec) => self.remote.prepare_call(
                spec,
                &scope,
                execution_id(instance.id, &step.name, attempt),
                timeout,
            ),
            StepKind::EventWait(spec) => self.wait.prepare(spec, &scope, timeout),
        }
    }

    /// Run a recorded attempt.
    ///
    /// Event waits abort as soon as `cancel` fires. Remote calls run to
    /// completion; the caller bounds them with its cancellation grace period.
    pub async fn execute(
        &self,
        instance_id: Uuid,
        step: &str,
        attempt: u32,
        record: &ActivityRecord,
        cancel: &CancellationToken,
    ) -> Result<Value, StepFailure> {
        match record {
            ActivityRecord::RemoteCall { .. } => self.remote.execute(step, record).await,
            ActivityRecord::EventWait { .. } => {
                let wait_id = execution_id(instance_id, step, attempt);
                self.wait.execute(step, &wait_id, record, cancel).await
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Admission control
// ---------------------------------------------------------------------------

/// Global and per-target bounds on concurrently executing remote calls.
///
/// A step that cannot get a permit stays queued (and `Pending` in the log)
/// until one frees up.
pub struct AdmissionControl {
    global: Arc<Semaphore>,
    per_target: DashMap<String, Arc<Semaphore>>,
    per_target_limit: usize,
}

/// Held for the duration of one remote-call attempt.
#[derive(Debug)]
pub struct AdmissionPermit {
    _target: OwnedSemaphorePermit,
    _global: OwnedSemaphorePermit,
}

impl AdmissionControl {
    pub fn new(max_concurrent: usize, per_target_limit: usize) -> Self {
        Self {
            global: Arc::new(Semaphore::new(max_concurrent.max(1))),
            per_target: DashMap::new(),
            per_target_limit: per_target_limit.max(1),
        }
    }

    pub async fn acquire(&self, target: &str) -> Result<AdmissionPermit, AcquireError> {
        let semaphore = self
            .per_target
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_target_limit)))
            .clone();
        let target_permit = semaphore.acquire_owned().await?;
        let global_permit = self.global.clone().acquire_owned().await?;
        Ok(AdmissionPermit {
            _target: target_permit,
            _global: global_permit,
        })
    }

    /// Free global slots right now.
    pub fn available(&self) -> usize {
        self.global.available_permits()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{RemoteResponse, RemoteTransport, StaticServiceRegistry};
    use conflux_types::breaker::BreakerState;
    use conflux_types::config::BreakerConfig;
    use conflux_types::event::InboundEvent;
    use conflux_types::workflow::{DefinitionRef, RetryPolicy};
    use serde_json::{Map, json};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct Recording {
        requests: Arc<Mutex<Vec<RemoteRequest>>>,
        status: Arc<AtomicUsize>,
    }

    impl RemoteTransport for Recording {
        async fn call(&self, request: &RemoteRequest) -> Result<RemoteResponse, TransportError> {
            self.requests.lock().unwrap().push(request.clone());
            match self.status.load(Ordering::SeqCst) as u16 {
                0 | 200 => Ok(RemoteResponse {
                    status: 200,
                    body: json!({"data": {"id": "x-1"}, "echo": request.body.clone()}),
                }),
                status => Err(TransportError::Status {
                    status,
                    body: Value::Null,
                }),
            }
        }
    }

    fn instance() -> WorkflowInstance {
        let mut context = Map::new();
        context.insert("taskId".to_string(), json!("t1"));
        WorkflowInstance {
            id: Uuid::nil(),
            definition: DefinitionRef {
                id: "flow".to_string(),
                version: 1,
            },
            correlation_id: "corr-1".to_string(),
            context,
            state: conflux_types::instance::InstanceState::Running,
            steps: Default::default(),
            executions: Vec::new(),
            cancel_requested: false,
            originating_step: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
            last_seq: 2,
        }
    }

    fn remote_step(extract: Option<&str>) -> StepDefinition {
        StepDefinition {
            name: "prepare".to_string(),
            kind: StepKind::RemoteCall(RemoteCallSpec {
                target: "projects".to_string(),
                method: "POST".to_string(),
                path: "/tasks/{{ context.taskId }}".to_string(),
                input: json!({"task": "{{ context.taskId }}"}),
                extract: extract.map(str::to_string),
            }),
            depends_on: Vec::new(),
            retry: RetryPolicy::default(),
            timeout_secs: None,
        }
    }

    fn invoker(
        transport: Recording,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> (ActivityInvoker, Arc<CorrelationManager>) {
        let registry: Arc<dyn ServiceRegistry> = Arc::new(
            StaticServiceRegistry::default().with_service("projects", "http://projects:8080"),
        );
        let correlation = Arc::new(CorrelationManager::new());
        let invoker = ActivityInvoker::new(
            RemoteCallActivity::new(
                BoxTransport::new(transport),
                registry,
                breakers,
                Duration::from_secs(30),
            ),
            EventWaitActivity::new(correlation.clone(), Duration::from_secs(60)),
        );
        (invoker, correlation)
    }

    #[tokio::test]
    async fn remote_call_renders_records_and_extracts() {
        let transport = Recording::default();
        let breakers = Arc::new(CircuitBreakerRegistry::new(BreakerConfig::default()));
        let (invoker, _) = invoker(transport.clone(), breakers);
        let instance = instance();
        let step = remote_step(Some("/data/id"));

        let record = invoker.prepare(&instance, &step, 2).unwrap();
        match &record {
            ActivityRecord::RemoteCall {
                path,
                body,
                idempotency_key,
                timeout_ms,
                ..
            } => {
                assert_eq!(path, "/tasks/t1");
                assert_eq!(body, &json!({"task": "t1"}));
                assert_eq!(idempotency_key, &format!("{}:prepare:2", Uuid::nil()));
                assert_eq!(*timeout_ms, 30_000);
            }
            other => panic!("unexpected record: {other:?}"),
        }

        let output = invoker
            .execute(instance.id, "prepare", 2, &record, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output, json!("x-1"));

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].address, "http://projects:8080");
    }

    #[tokio::test]
    async fn server_errors_feed_the_breaker_but_client_errors_do_not() {
        let transport = Recording::default();
        let breakers = Arc::new(CircuitBreakerRegistry::new(BreakerConfig {
            failure_threshold: 2,
            ..BreakerConfig::default()
        }));
        let (invoker, _) = invoker(transport.clone(), breakers.clone());
        let remote = invoker.remote();

        transport.status.store(400, Ordering::SeqCst);
        for _ in 0..3 {
            let err = remote
                .call("projects", "POST", "/", Value::Null, "k", Duration::from_secs(1))
                .await
                .unwrap_err();
            assert_eq!(err.kind, FailureKind::Permanent);
        }
        assert_eq!(breakers.state("projects"), BreakerState::Closed);

        transport.status.store(503, Ordering::SeqCst);
        for _ in 0..2 {
            let err = remote
                .call("projects", "POST", "/", Value::Null, "k", Duration::from_secs(1))
                .await
                .unwrap_err();
            assert_eq!(err.kind, FailureKind::Transient);
        }
        assert_eq!(breakers.state("projects"), BreakerState::Open);

        let err = remote
            .call("projects", "POST", "/", Value::Null, "k", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::CircuitOpen);
        assert_eq!(transport.requests.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn unknown_target_is_transient() {
        let breakers = Arc::new(CircuitBreakerRegistry::new(BreakerConfig::default()));
        let (invoker, _) = invoker(Recording::default(), breakers);
        let err = invoker
            .remote()
            .call("nowhere", "GET", "/", Value::Null, "k", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Transient);
    }

    #[tokio::test]
    async fn event_wait_resumes_on_matching_event() {
        let breakers = Arc::new(CircuitBreakerRegistry::new(BreakerConfig::default()));
        let (invoker, correlation) = invoker(Recording::default(), breakers);
        let instance = instance();
        let step = StepDefinition {
            name: "wait".to_string(),
            kind: StepKind::EventWait(EventWaitSpec {
                event_type: "task.completed".to_string(),
                correlation: BTreeMap::from([
                    ("correlationId".to_string(), json!("{{ instance.correlation_id }}")),
                    ("taskId".to_string(), json!("{{ context.taskId }}")),
                ]),
            }),
            depends_on: Vec::new(),
            retry: RetryPolicy::once(),
            timeout_secs: Some(60),
        };

        let record = invoker.prepare(&instance, &step, 1).unwrap();
        let cancel = CancellationToken::new();
        let invoker = Arc::new(invoker);
        let task = {
            let invoker = invoker.clone();
            let record = record.clone();
            tokio::spawn(async move {
                invoker
                    .execute(Uuid::nil(), "wait", 1, &record, &cancel)
                    .await
            })
        };

        while correlation.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        let partial = InboundEvent::new("task.completed", json!({"correlationId": "corr-1"}));
        assert_eq!(correlation.deliver(&partial), 0);
        let full = InboundEvent::new(
            "task.completed",
            json!({"correlationId": "corr-1", "taskId": "t1", "result": "done"}),
        );
        assert_eq!(correlation.deliver(&full), 1);

        let output = task.await.unwrap().unwrap();
        assert_eq!(output["result"], json!("done"));
    }

    #[tokio::test(start_paused = true)]
    async fn event_wait_times_out_and_honours_cancel() {
        let breakers = Arc::new(CircuitBreakerRegistry::new(BreakerConfig::default()));
        let (invoker, correlation) = invoker(Recording::default(), breakers);
        let record = ActivityRecord::EventWait {
            event_type: "never".to_string(),
            filter: BTreeMap::from([("k".to_string(), json!(1))]),
            deadline: Utc::now() + chrono::Duration::seconds(5),
        };

        let err = invoker
            .execute(Uuid::nil(), "w", 1, &record, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Timeout);
        assert_eq!(correlation.pending_count(), 0);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = invoker
            .execute(Uuid::nil(), "w", 2, &record, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Cancelled);
        assert_eq!(correlation.pending_count(), 0);
    }

    #[tokio::test]
    async fn admission_bounds_per_target() {
        let admission = AdmissionControl::new(4, 1);
        let first = admission.acquire("a").await.unwrap();
        assert_eq!(admission.available(), 3);

        let queued = tokio::time::timeout(Duration::from_millis(20), admission.acquire("a")).await;
        assert!(queued.is_err(), "second call to the same target must queue");

        let other = admission.acquire("b").await.unwrap();
        assert_eq!(admission.available(), 2);
        drop(first);
        drop(other);
        let _again = admission.acquire("a").await.unwrap();
    }
}
