//! Engine configuration types for Conflux.
//!
//! `EngineConfig` represents the top-level `config.toml` in the data
//! directory. Every field has a default so an empty file is valid.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the workflow engine.
///
/// Loaded from `~/.conflux/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Remote-call steps allowed in flight across all instances.
    #[serde(default = "default_max_concurrent_steps")]
    pub max_concurrent_steps: usize,

    /// Remote-call steps allowed in flight against one target.
    #[serde(default = "default_per_target_limit")]
    pub per_target_limit: usize,

    /// How long in-flight activities may run after a cancel request.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,

    /// Step timeout used when a step declares none.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,

    /// Capacity of the in-process engine event channel.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub http: HttpConfig,

    /// Static service registry: target name to base URL.
    #[serde(default)]
    pub services: BTreeMap<String, String>,
}

fn default_max_concurrent_steps() -> usize {
    64
}

fn default_per_target_limit() -> usize {
    16
}

fn default_cancel_grace_ms() -> u64 {
    5_000
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_event_bus_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_steps: default_max_concurrent_steps(),
            per_target_limit: default_per_target_limit(),
            cancel_grace_ms: default_cancel_grace_ms(),
            default_step_timeout_secs: default_step_timeout_secs(),
            event_bus_capacity: default_event_bus_capacity(),
            breaker: BreakerConfig::default(),
            http: HttpConfig::default(),
            services: BTreeMap::new(),
        }
    }
}

/// Circuit breaker thresholds, shared by every target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// First open window.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Growth of the open window each time a half-open trial fails.
    #[serde(default = "default_cooldown_multiplier")]
    pub cooldown_multiplier: f64,
    /// Upper bound on the open window.
    #[serde(default = "default_max_cooldown_ms")]
    pub max_cooldown_ms: u64,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown_ms() -> u64 {
    30_000
}

fn default_cooldown_multiplier() -> f64 {
    1.0
}

fn default_max_cooldown_ms() -> u64 {
    300_000
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
            cooldown_multiplier: default_cooldown_multiplier(),
            max_cooldown_ms: default_max_cooldown_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Connect timeout for outbound calls.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_user_agent() -> String {
    "conflux-engine/0.1".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_steps, 64);
        assert_eq!(config.breaker.failure_threshold, 3);
        assert!(config.services.is_empty());
    }

    #[test]
    fn test_engine_config_deserialize_with_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
max_concurrent_steps = 8
cancel_grace_ms = 250

[breaker]
failure_threshold = 5
cooldown_ms = 1000
cooldown_multiplier = 2.0

[services]
projects = "http://projects.internal:8080"
agents = "http://agents.internal:8080"
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.max_concurrent_steps, 8);
        assert_eq!(config.per_target_limit, 16);
        assert_eq!(config.cancel_grace_ms, 250);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.max_cooldown_ms, 300_000);
        assert_eq!(config.services.len(), 2);
        assert_eq!(
            config.services.get("projects").map(String::as_str),
            Some("http://projects.internal:8080")
        );
    }
}
