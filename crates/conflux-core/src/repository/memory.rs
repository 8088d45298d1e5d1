//! In-memory `WorkflowRepository` for tests and single-process embedding.
//!
//! Same contract as the SQLite implementation: definitions are insert-only,
//! log appends are checked against the last stored `seq`.

use std::collections::BTreeMap;

use conflux_types::breaker::BreakerSnapshot;
use conflux_types::error::RepositoryError;
use conflux_types::instance::{InstanceState, InstanceSummary, StateLogEntry, Transition};
use conflux_types::workflow::{DefinitionRef, WorkflowDefinition};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

use super::workflow::WorkflowRepository;

#[derive(Debug, Default)]
pub struct InMemoryWorkflowRepository {
    definitions: DashMap<(String, u32), WorkflowDefinition>,
    logs: DashMap<Uuid, Vec<StateLogEntry>>,
    breakers: DashMap<String, BreakerSnapshot>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries stored for an instance.
    pub fn log_len(&self, instance_id: &Uuid) -> usize {
        self.logs.get(instance_id).map(|l| l.len()).unwrap_or(0)
    }
}

fn summarize(log: &[StateLogEntry]) -> Option<InstanceSummary> {
    let first = log.first()?;
    let Transition::InstanceCreated {
        definition,
        correlation_id,
        ..
    } = &first.transition
    else {
        return None;
    };
    let state = log
        .iter()
        .filter_map(|e| e.transition.resulting_state())
        .last()
        .unwrap_or(InstanceState::Created);
    let updated_at = log.last().map(|e| e.timestamp).unwrap_or(first.timestamp);

    Some(InstanceSummary {
        id: first.instance_id,
        definition: definition.clone(),
        correlation_id: correlation_id.clone(),
        state,
        created_at: first.timestamp,
        updated_at,
    })
}

impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn insert_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        match self.definitions.entry((def.id.clone(), def.version)) {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "definition {}@v{} already exists",
                def.id, def.version
            ))),
            Entry::Vacant(slot) => {
                slot.insert(def.clone());
                Ok(())
            }
        }
    }

    async fn get_definition(
        &self,
        id: &str,
        version: u32,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self
            .definitions
            .get(&(id.to_string(), version))
            .map(|d| d.value().clone()))
    }

    async fn latest_version(&self, id: &str) -> Result<Option<u32>, RepositoryError> {
        Ok(self
            .definitions
            .iter()
            .filter(|e| e.key().0 == id)
            .map(|e| e.key().1)
            .max())
    }

    async fn list_definitions(&self) -> Result<Vec<DefinitionRef>, RepositoryError> {
        let mut refs: Vec<DefinitionRef> = self
            .definitions
            .iter()
            .map(|e| DefinitionRef {
                id: e.key().0.clone(),
                version: e.key().1,
            })
            .collect();
        refs.sort();
        Ok(refs)
    }

    async fn append_entry(&self, entry: &StateLogEntry) -> Result<(), RepositoryError> {
        let mut log = self.logs.entry(entry.instance_id).or_default();
        let expected = log.len() as u64 + 1;
        if entry.seq != expected {
            return Err(RepositoryError::Conflict(format!(
                "instance {} expected seq {expected}, got {}",
                entry.instance_id, entry.seq
            )));
        }
        log.push(entry.clone());
        Ok(())
    }

    async fn load_log(&self, instance_id: &Uuid) -> Result<Vec<StateLogEntry>, RepositoryError> {
        Ok(self
            .logs
            .get(instance_id)
            .map(|l| l.value().clone())
            .unwrap_or_default())
    }

    async fn list_instances(
        &self,
        active_only: bool,
    ) -> Result<Vec<InstanceSummary>, RepositoryError> {
        let mut rows: Vec<InstanceSummary> = self
            .logs
            .iter()
            .filter_map(|e| summarize(e.value()))
            .filter(|s| !active_only || !s.state.is_terminal())
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(rows)
    }

    async fn upsert_breaker(&self, snapshot: &BreakerSnapshot) -> Result<(), RepositoryError> {
        self.breakers
            .insert(snapshot.target.clone(), snapshot.clone());
        Ok(())
    }

    async fn list_breakers(&self) -> Result<Vec<BreakerSnapshot>, RepositoryError> {
        let sorted: BTreeMap<String, BreakerSnapshot> = self
            .breakers
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        Ok(sorted.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::Map;

    fn created(instance_id: Uuid) -> StateLogEntry {
        StateLogEntry {
            instance_id,
            seq: 1,
            transition: Transition::InstanceCreated {
                definition: DefinitionRef {
                    id: "wf".to_string(),
                    version: 1,
                },
                correlation_id: "c-1".to_string(),
                context: Map::new(),
            },
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn append_rejects_sequence_gaps() {
        let repo = InMemoryWorkflowRepository::new();
        let id = Uuid::now_v7();
        repo.append_entry(&created(id)).await.unwrap();

        let skipped = StateLogEntry {
            seq: 3,
            transition: Transition::InstanceStarted,
            ..created(id)
        };
        let err = repo.append_entry(&skipped).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        let next = StateLogEntry {
            seq: 2,
            transition: Transition::InstanceStarted,
            ..created(id)
        };
        repo.append_entry(&next).await.unwrap();
        assert_eq!(repo.log_len(&id), 2);
    }

    #[tokio::test]
    async fn list_instances_filters_terminal() {
        let repo = InMemoryWorkflowRepository::new();
        let running = Uuid::now_v7();
        let done = Uuid::now_v7();
        for id in [running, done] {
            repo.append_entry(&created(id)).await.unwrap();
            repo.append_entry(&StateLogEntry {
                seq: 2,
                transition: Transition::InstanceStarted,
                ..created(id)
            })
            .await
            .unwrap();
        }
        repo.append_entry(&StateLogEntry {
            seq: 3,
            transition: Transition::InstanceCompleted,
            ..created(done)
        })
        .await
        .unwrap();

        let all = repo.list_instances(false).await.unwrap();
        assert_eq!(all.len(), 2);
        let active = repo.list_instances(true).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, running);
        assert_eq!(active[0].state, InstanceState::Running);
    }
}
