//! Application state wiring the engine to its infra adapters.
//!
//! AppState is shared by the CLI commands and the Trigger API handlers. The
//! engine is generic over its repository; here it is pinned to SQLite.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use conflux_core::remote::BoxTransport;
use conflux_core::workflow::WorkflowEngine;
use conflux_infra::config::{load_engine_config, resolve_data_dir, service_registry};
use conflux_infra::remote::HttpTransport;
use conflux_infra::sqlite::{DatabasePool, SqliteWorkflowRepository};

/// The engine pinned to the concrete infra implementations.
pub type ConcreteEngine = WorkflowEngine<SqliteWorkflowRepository>;

#[derive(Clone)]
pub struct AppState {
    pub engine: ConcreteEngine,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Open the data directory named by the environment.
    pub async fn init() -> anyhow::Result<Self> {
        Self::open(resolve_data_dir()).await
    }

    /// Load config, open the database and build the engine.
    ///
    /// Instances are not resumed here; long-running commands call
    /// `engine.recover()` themselves.
    pub async fn open(data_dir: PathBuf) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await?;
        let pool = DatabasePool::open_in(&data_dir)
            .await
            .context("failed to open the engine database")?;
        let transport =
            HttpTransport::new(&config.http).context("failed to build the HTTP client")?;
        let registry = service_registry(&config);

        let engine = WorkflowEngine::new(
            Arc::new(SqliteWorkflowRepository::new(pool)),
            BoxTransport::new(transport),
            Arc::new(registry),
            config,
        );

        tracing::debug!(data_dir = %data_dir.display(), "application state ready");
        Ok(Self { engine, data_dir })
    }
}
