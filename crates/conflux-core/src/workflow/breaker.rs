//! Per-target circuit breakers.
//!
//! Each downstream target gets its own breaker, stored in a sharded
//! `DashMap` so that unrelated targets never contend on the same lock.
//! Callers obtain a `BreakerPermit` before touching the network and report
//! the outcome through it; a rejected call never reaches the transport.
//!
//! State changes are published as `EngineEvent::BreakerTransition`. When a
//! change feed is attached, every state change and every change of the
//! consecutive-failure count is sent as a snapshot for persistence.

use std::time::Duration;

use chrono::{DateTime, Utc};
use conflux_types::breaker::{BreakerSnapshot, BreakerState};
use conflux_types::config::BreakerConfig;
use conflux_types::event::EngineEvent;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::event::EventBus;

/// Retry hint returned while another caller holds the half-open trial.
const TRIAL_BUSY_RETRY: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// Breaker state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum CircuitState {
    Closed,
    Open {
        until: Instant,
        opened_at: DateTime<Utc>,
    },
    HalfOpen {
        trial_in_flight: bool,
        opened_at: DateTime<Utc>,
    },
}

impl CircuitState {
    fn public(&self) -> BreakerState {
        match self {
            CircuitState::Closed => BreakerState::Closed,
            CircuitState::Open { .. } => BreakerState::Open,
            CircuitState::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    /// Consecutive failures; reset by any success.
    failure_count: u32,
    /// Cooldown applied the next time the breaker opens from half-open.
    cooldown: Duration,
}

impl Breaker {
    fn new(config: &BreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            cooldown: Duration::from_millis(config.cooldown_ms),
        }
    }

    fn opened_at(&self) -> Option<DateTime<Utc>> {
        match &self.state {
            CircuitState::Closed => None,
            CircuitState::Open { opened_at, .. } | CircuitState::HalfOpen { opened_at, .. } => {
                Some(*opened_at)
            }
        }
    }

    fn snapshot(&self, target: &str) -> BreakerSnapshot {
        BreakerSnapshot {
            target: target.to_string(),
            state: self.state.public(),
            failure_count: self.failure_count,
            opened_at: self.opened_at(),
            cooldown_ms: self.cooldown.as_millis() as u64,
        }
    }
}

type Change = (BreakerState, BreakerState, BreakerSnapshot);

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// All breakers of the engine, keyed by call target.
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, Breaker>,
    events: Option<EventBus>,
    changes: Option<mpsc::UnboundedSender<BreakerSnapshot>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
            events: None,
            changes: None,
        }
    }

    /// Publish state transitions on the engine event bus.
    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    /// Send a snapshot on every transition and failure-count change.
    pub fn with_change_feed(mut self, tx: mpsc::UnboundedSender<BreakerSnapshot>) -> Self {
        self.changes = Some(tx);
        self
    }

    /// Ask to call `target`.
    ///
    /// Returns a permit when the breaker is closed, or when the cooldown has
    /// elapsed and no other trial is in flight (the permit is then the single
    /// half-open trial). Otherwise returns how long the caller should wait.
    pub fn try_acquire(&self, target: &str) -> Result<BreakerPermit<'_>, Duration> {
        let mut change = None;
        let result = {
            let mut breaker = self
                .breakers
                .entry(target.to_string())
                .or_insert_with(|| Breaker::new(&self.config));
            let now = Instant::now();
            match breaker.state.clone() {
                CircuitState::Closed => Ok(false),
                CircuitState::Open { until, opened_at } => {
                    if now >= until {
                        breaker.state = CircuitState::HalfOpen {
                            trial_in_flight: true,
                            opened_at,
                        };
                        change = Some((
                            BreakerState::Open,
                            BreakerState::HalfOpen,
                            breaker.snapshot(target),
                        ));
                        Ok(true)
                    } else {
                        Err(until - now)
                    }
                }
                CircuitState::HalfOpen {
                    trial_in_flight: true,
                    ..
                } => Err(TRIAL_BUSY_RETRY),
                CircuitState::HalfOpen {
                    trial_in_flight: false,
                    opened_at,
                } => {
                    breaker.state = CircuitState::HalfOpen {
                        trial_in_flight: true,
                        opened_at,
                    };
                    Ok(true)
                }
            }
        };
        self.notify(change);

        result.map(|trial| {
            if trial {
                tracing::info!(target_name = target, "circuit half-open, allowing trial call");
            }
            BreakerPermit {
                registry: self,
                target: target.to_string(),
                trial,
                settled: false,
            }
        })
    }

    fn record_success(&self, target: &str, trial: bool) {
        let mut change = None;
        let mut reset = None;
        if let Some(mut breaker) = self.breakers.get_mut(target) {
            let had_failures = breaker.failure_count > 0;
            breaker.failure_count = 0;
            if trial || matches!(breaker.state, CircuitState::HalfOpen { .. }) {
                let from = breaker.state.public();
                breaker.state = CircuitState::Closed;
                breaker.cooldown = Duration::from_millis(self.config.cooldown_ms);
                change = Some((from, BreakerState::Closed, breaker.snapshot(target)));
            } else if had_failures {
                reset = Some(breaker.snapshot(target));
            }
        }
        if change.is_some() {
            tracing::info!(target_name = target, "circuit closed");
        }
        self.notify(change);
        self.persist(reset);
    }

    fn record_failure(&self, target: &str, trial: bool) {
        let mut change = None;
        let mut counted = None;
        if let Some(mut breaker) = self.breakers.get_mut(target) {
            breaker.failure_count = breaker.failure_count.saturating_add(1);
            let now = Instant::now();
            match breaker.state.clone() {
                CircuitState::Closed if breaker.failure_count >= self.config.failure_threshold => {
                    breaker.cooldown = Duration::from_millis(self.config.cooldown_ms);
                    breaker.state = CircuitState::Open {
                        until: now + breaker.cooldown,
                        opened_at: Utc::now(),
                    };
                    change = Some((
                        BreakerState::Closed,
                        BreakerState::Open,
                        breaker.snapshot(target),
                    ));
                }
                CircuitState::HalfOpen { .. } if trial => {
                    let grown = breaker.cooldown.as_millis() as f64
                        * self.config.cooldown_multiplier.max(1.0);
                    breaker.cooldown =
                        Duration::from_millis(grown.min(self.config.max_cooldown_ms as f64) as u64);
                    breaker.state = CircuitState::Open {
                        until: now + breaker.cooldown,
                        opened_at: Utc::now(),
                    };
                    change = Some((
                        BreakerState::HalfOpen,
                        BreakerState::Open,
                        breaker.snapshot(target),
                    ));
                }
                _ => counted = Some(breaker.snapshot(target)),
            }
        }
        if let Some((_, _, snapshot)) = &change {
            tracing::warn!(
                target_name = target,
                failures = snapshot.failure_count,
                cooldown_ms = snapshot.cooldown_ms,
                "circuit opened"
            );
        }
        self.notify(change);
        self.persist(counted);
    }

    fn release_trial(&self, target: &str) {
        if let Some(mut breaker) = self.breakers.get_mut(target) {
            if let CircuitState::HalfOpen { opened_at, .. } = breaker.state {
                breaker.state = CircuitState::HalfOpen {
                    trial_in_flight: false,
                    opened_at,
                };
            }
        }
    }

    fn notify(&self, change: Option<Change>) {
        let Some((from, to, snapshot)) = change else {
            return;
        };
        if let Some(bus) = &self.events {
            bus.publish(EngineEvent::BreakerTransition {
                target: snapshot.target.clone(),
                from,
                to,
            });
        }
        self.persist(Some(snapshot));
    }

    fn persist(&self, snapshot: Option<BreakerSnapshot>) {
        if let (Some(tx), Some(snapshot)) = (&self.changes, snapshot) {
            let _ = tx.send(snapshot);
        }
    }

    // -----------------------------------------------------------------------
    // Introspection and restore
    // -----------------------------------------------------------------------

    /// Current state of one target; unknown targets are closed.
    pub fn state(&self, target: &str) -> BreakerState {
        self.breakers
            .get(target)
            .map(|b| b.state.public())
            .unwrap_or(BreakerState::Closed)
    }

    pub fn snapshot(&self, target: &str) -> Option<BreakerSnapshot> {
        self.breakers.get(target).map(|b| b.snapshot(target))
    }

    /// Snapshots of every known breaker, ordered by target.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut all: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| entry.value().snapshot(entry.key()))
            .collect();
        all.sort_by(|a, b| a.target.cmp(&b.target));
        all
    }

    /// Load persisted breaker rows after a restart.
    ///
    /// Open breakers keep whatever remains of their cooldown; a breaker that
    /// was half-open comes back open with no time left, so the next call is
    /// the trial.
    pub fn restore(&self, snapshots: &[BreakerSnapshot]) {
        let now = Instant::now();
        let wall_now = Utc::now();
        for snap in snapshots {
            let cooldown = Duration::from_millis(snap.cooldown_ms);
            let state = match (snap.state, snap.opened_at) {
                (BreakerState::Closed, _) | (_, None) => CircuitState::Closed,
                (BreakerState::Open, Some(opened_at)) => {
                    let elapsed = (wall_now - opened_at).to_std().unwrap_or_default();
                    CircuitState::Open {
                        until: now + cooldown.saturating_sub(elapsed),
                        opened_at,
                    }
                }
                (BreakerState::HalfOpen, Some(opened_at)) => CircuitState::Open {
                    until: now,
                    opened_at,
                },
            };
            self.breakers.insert(
                snap.target.clone(),
                Breaker {
                    state,
                    failure_count: snap.failure_count,
                    cooldown,
                },
            );
        }
        tracing::debug!(count = snapshots.len(), "restored circuit breakers");
    }
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("config", &self.config)
            .field("targets", &self.breakers.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Permit
// ---------------------------------------------------------------------------

/// Permission to make one call. Report the outcome with `succeed` or `fail`.
///
/// Dropping an unsettled trial permit (e.g. the call was cancelled) frees the
/// half-open slot without changing the breaker state.
#[must_use = "report the call outcome through the permit"]
pub struct BreakerPermit<'a> {
    registry: &'a CircuitBreakerRegistry,
    target: String,
    trial: bool,
    settled: bool,
}

impl BreakerPermit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.registry.record_success(&self.target, self.trial);
    }

    pub fn fail(mut self) {
        self.settled = true;
        self.registry.record_failure(&self.target, self.trial);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.registry.release_trial(&self.target);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
