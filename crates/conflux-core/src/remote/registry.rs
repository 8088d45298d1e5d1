//! Service registry port: logical target name to network address.

use std::collections::BTreeMap;

/// Resolution failure. Treated as a transient step failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown target '{0}'")]
    UnknownTarget(String),

    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

pub trait ServiceRegistry: Send + Sync {
    fn resolve(&self, target: &str) -> Result<String, RegistryError>;
}

/// Registry backed by a fixed name-to-address map.
#[derive(Debug, Clone, Default)]
pub struct StaticServiceRegistry {
    services: BTreeMap<String, String>,
}

impl StaticServiceRegistry {
    pub fn new(services: BTreeMap<String, String>) -> Self {
        Self { services }
    }

    pub fn with_service(mut self, target: impl Into<String>, address: impl Into<String>) -> Self {
        self.services.insert(target.into(), address.into());
        self
    }
}

impl ServiceRegistry for StaticServiceRegistry {
    fn resolve(&self, target: &str) -> Result<String, RegistryError> {
        self.services
            .get(target)
            .map(|address| address.trim_end_matches('/').to_string())
            .ok_or_else(|| RegistryError::UnknownTarget(target.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_targets_and_trims_slash() {
        let registry = StaticServiceRegistry::default().with_service("agents", "http://agents:80/");
        assert_eq!(registry.resolve("agents").unwrap(), "http://agents:80");
        assert!(matches!(
            registry.resolve("nope"),
            Err(RegistryError::UnknownTarget(t)) if t == "nope"
        ));
    }
}
