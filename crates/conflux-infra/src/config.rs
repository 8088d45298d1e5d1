//! Engine configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.conflux/` unless
//! `CONFLUX_DATA_DIR` says otherwise) into [`EngineConfig`]. A missing file
//! yields the defaults; a malformed one is an error, since a silently ignored
//! breaker or concurrency setting is worse than refusing to start.

use std::path::{Path, PathBuf};

use conflux_core::remote::StaticServiceRegistry;
use conflux_types::config::EngineConfig;
use thiserror::Error;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "CONFLUX_DATA_DIR";

/// Name of the config file inside the data directory.
pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Data directory: `CONFLUX_DATA_DIR`, else `~/.conflux`.
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".conflux")
}

/// Load `{data_dir}/config.toml`, or the defaults when it does not exist.
pub async fn load_engine_config(data_dir: &Path) -> Result<EngineConfig, ConfigError> {
    let path = data_dir.join(CONFIG_FILE);

    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(EngineConfig::default());
        }
        Err(source) => return Err(ConfigError::Read { path, source }),
    };

    let config: EngineConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.clone(),
        source,
    })?;
    tracing::debug!(
        path = %path.display(),
        services = config.services.len(),
        "loaded engine config"
    );
    Ok(config)
}

/// Service registry built from the `[services]` table.
pub fn service_registry(config: &EngineConfig) -> StaticServiceRegistry {
    StaticServiceRegistry::new(config.services.clone())
}
