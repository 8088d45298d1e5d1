//! Workflow repository trait definition.
//!
//! Defines the storage interface for the three persisted tables: immutable
//! definitions, the append-only state log, and circuit breaker state. The
//! infrastructure layer (conflux-infra) implements this trait with SQLite
//! persistence; `InMemoryWorkflowRepository` backs tests and embedding.

use conflux_types::breaker::BreakerSnapshot;
use conflux_types::error::RepositoryError;
use conflux_types::instance::{InstanceSummary, StateLogEntry};
use conflux_types::workflow::{DefinitionRef, WorkflowDefinition};
use uuid::Uuid;

/// Repository trait for workflow persistence.
///
/// Covers three entity families:
/// - **Definitions:** insert-only rows keyed by `(id, version)`.
/// - **State log:** append-only, ordered by `(instance_id, seq)`, plus the
///   instance index derived from it.
/// - **Breakers:** one upserted row per downstream target.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Insert a definition. Fails with `Conflict` if `(id, version)` exists.
    fn insert_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get one pinned definition version.
    fn get_definition(
        &self,
        id: &str,
        version: u32,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// Highest registered version of a definition id.
    fn latest_version(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<Option<u32>, RepositoryError>> + Send;

    /// All registered `(id, version)` pairs, ordered by id then version.
    fn list_definitions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<DefinitionRef>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // State log
    // -----------------------------------------------------------------------

    /// Append one entry. Fails with `Conflict` unless `seq` is exactly one
    /// past the instance's last stored entry (1 for a new instance).
    fn append_entry(
        &self,
        entry: &StateLogEntry,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Full log for an instance in `seq` order. Empty if unknown.
    fn load_log(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StateLogEntry>, RepositoryError>> + Send;

    /// Instance index rows, newest first. `active_only` drops terminal ones.
    fn list_instances(
        &self,
        active_only: bool,
    ) -> impl std::future::Future<Output = Result<Vec<InstanceSummary>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Circuit breakers
    // -----------------------------------------------------------------------

    /// Insert or replace the row for `snapshot.target`.
    fn upsert_breaker(
        &self,
        snapshot: &BreakerSnapshot,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// All persisted breaker rows.
    fn list_breakers(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<BreakerSnapshot>, RepositoryError>> + Send;
}
