//! Per-instance state log writer.
//!
//! `InstanceJournal` is the single writer of one instance's log. Every
//! transition is validated against the current projection, persisted through
//! the `WorkflowRepository`, folded into the projection, and only then
//! published on the event bus. Writers serialize on an instance-scoped lock,
//! so `seq` numbers are dense and never interleave.
//!
//! Readers get the latest projection from a `watch` channel and never block
//! on a write in progress.

use std::sync::Arc;

use chrono::Utc;
use conflux_types::error::RepositoryError;
use conflux_types::event::EngineEvent;
use conflux_types::instance::{StateLogEntry, Transition, WorkflowInstance};
use conflux_types::workflow::DefinitionRef;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use uuid::Uuid;

use super::projection::{self, ReplayError};
use crate::event::EventBus;
use crate::repository::workflow::WorkflowRepository;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error(transparent)]
    Rejected(#[from] ReplayError),

    #[error("failed to persist state log entry: {0}")]
    Repository(#[from] RepositoryError),

    #[error("state log writer stopped before the entry was persisted")]
    Interrupted,
}

pub struct InstanceJournal<R: WorkflowRepository> {
    id: Uuid,
    repo: Arc<R>,
    bus: EventBus,
    writer: Mutex<()>,
    state: watch::Sender<Arc<WorkflowInstance>>,
}

impl<R: WorkflowRepository + 'static> InstanceJournal<R> {
    /// Start a new log with its `InstanceCreated` entry.
    pub async fn create(
        repo: Arc<R>,
        bus: EventBus,
        id: Uuid,
        definition: DefinitionRef,
        correlation_id: String,
        context: Map<String, Value>,
    ) -> Result<Arc<Self>, JournalError> {
        let entry = StateLogEntry {
            instance_id: id,
            seq: 1,
            transition: Transition::InstanceCreated {
                definition,
                correlation_id,
                context,
            },
            timestamp: Utc::now(),
        };
        let instance = projection::created(&entry)?;
        repo.append_entry(&entry).await?;
        bus.publish(EngineEvent::Transition { entry });

        let (state, _) = watch::channel(Arc::new(instance));
        Ok(Arc::new(Self {
            id,
            repo,
            bus,
            writer: Mutex::new(()),
            state,
        }))
    }

    /// Reopen an existing log after replaying it.
    pub fn resume(
        repo: Arc<R>,
        bus: EventBus,
        entries: &[StateLogEntry],
    ) -> Result<Arc<Self>, ReplayError> {
        let instance = projection::replay(entries)?;
        let id = instance.id;
        let (state, _) = watch::channel(Arc::new(instance));
        Ok(Arc::new(Self {
            id,
            repo,
            bus,
            writer: Mutex::new(()),
            state,
        }))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Latest projection. Always a consistent, fully-applied state.
    pub fn snapshot(&self) -> Arc<WorkflowInstance> {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<WorkflowInstance>> {
        self.state.subscribe()
    }

    /// Append one transition and return the new projection.
    ///
    /// The write runs on its own task: once started it completes even if the
    /// caller is aborted, so a persisted entry is never missing from the
    /// projection.
    pub async fn append(
        self: &Arc<Self>,
        transition: Transition,
    ) -> Result<Arc<WorkflowInstance>, JournalError> {
        let journal = Arc::clone(self);
        tokio::spawn(async move { journal.write(transition).await })
            .await
            .map_err(|_| JournalError::Interrupted)?
    }

    async fn write(&self, transition: Transition) -> Result<Arc<WorkflowInstance>, JournalError> {
        let _guard = self.writer.lock().await;

        let current = self.snapshot();
        let entry = StateLogEntry {
            instance_id: self.id,
            seq: current.last_seq + 1,
            transition,
            timestamp: Utc::now(),
        };
        let mut next = (*current).clone();
        projection::apply(&mut next, &entry)?;
        self.repo.append_entry(&entry).await?;

        tracing::debug!(
            instance_id = %self.id,
            seq = entry.seq,
            transition = entry.transition.name(),
            step = entry.transition.step().unwrap_or(""),
            "appended state log entry"
        );

        let next = Arc::new(next);
        self.state.send_replace(next.clone());
        self.bus.publish(EngineEvent::Transition { entry });
        Ok(next)
    }
}

impl<R: WorkflowRepository> std::fmt::Debug for InstanceJournal<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceJournal")
            .field("id", &self.id)
            .field("last_seq", &self.state.borrow().last_seq)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryWorkflowRepository;
    use conflux_types::instance::InstanceState;

    async fn journal(
        repo: Arc<InMemoryWorkflowRepository>,
        bus: EventBus,
    ) -> Arc<InstanceJournal<InMemoryWorkflowRepository>> {
        InstanceJournal::create(
            repo,
            bus,
            Uuid::now_v7(),
            DefinitionRef {
                id: "flow".to_string(),
                version: 1,
            },
            "corr".to_string(),
            Map::new(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn appends_are_dense_and_published() {
        let repo = Arc::new(InMemoryWorkflowRepository::new());
        let bus = EventBus::new(16);
        let mut events = bus.subscribe();
        let journal = journal(repo.clone(), bus).await;

        let state = journal.append(Transition::InstanceStarted).await.unwrap();
        assert_eq!(state.state, InstanceState::Running);
        assert_eq!(state.last_seq, 2);
        assert_eq!(repo.log_len(&journal.id()), 2);

        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        match (first, second) {
            (EngineEvent::Transition { entry: a }, EngineEvent::Transition { entry: b }) => {
                assert_eq!((a.seq, b.seq), (1, 2));
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[tokio::test]
    async fn illegal_transitions_are_not_persisted() {
        let repo = Arc::new(InMemoryWorkflowRepository::new());
        let journal = journal(repo.clone(), EventBus::new(4)).await;

        let err = journal.append(Transition::InstanceResumed).await.unwrap_err();
        assert!(matches!(err, JournalError::Rejected(_)));
        assert_eq!(repo.log_len(&journal.id()), 1);
        assert_eq!(journal.snapshot().last_seq, 1);
    }

    #[tokio::test]
    async fn concurrent_writers_serialize() {
        let repo = Arc::new(InMemoryWorkflowRepository::new());
        let journal = journal(repo.clone(), EventBus::new(64)).await;
        journal.append(Transition::InstanceStarted).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..10 {
            let journal = journal.clone();
            handles.push(tokio::spawn(async move {
                journal
                    .append(Transition::StepSkipped {
                        step: format!("s{i}"),
                        reason: "test".to_string(),
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let entries = repo.load_log(&journal.id()).await.unwrap();
        let seqs: Vec<u64> = entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=12).collect::<Vec<_>>());
        assert_eq!(projection::replay(&entries).unwrap(), *journal.snapshot());
    }

    #[tokio::test]
    async fn resume_rebuilds_from_log() {
        let repo = Arc::new(InMemoryWorkflowRepository::new());
        let live = journal(repo.clone(), EventBus::new(4)).await;
        live.append(Transition::InstanceStarted).await.unwrap();
        live.append(Transition::InstancePaused).await.unwrap();

        let entries = repo.load_log(&live.id()).await.unwrap();
        let reopened = InstanceJournal::resume(repo.clone(), EventBus::new(4), &entries).unwrap();
        assert_eq!(*reopened.snapshot(), *live.snapshot());
        reopened.append(Transition::InstanceResumed).await.unwrap();
        assert_eq!(repo.log_len(&live.id()), 4);
    }
}
