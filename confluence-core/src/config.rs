//! Throttle configuration.
//!
//! Queue capacities are usually decided by deployment rather than code, so
//! they can be loaded from JSON:
//!
//! ```json
//! { "queues": { "redis": 8, "http": 2 } }
//! ```

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::throttle::QueueKey;

/// Settings for one throttle gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Maximum number of concurrently admitted forks.
    pub max: usize,

    /// Named queue to share. Omitted means a private queue.
    #[serde(default)]
    pub queue: Option<String>,
}

impl ThrottleConfig {
    pub fn key(&self) -> QueueKey {
        self.queue.clone().into()
    }
}

/// Named queues to create up front in a registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub queues: IndexMap<String, usize>,
}

impl RegistryConfig {
    /// Parse from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| FlowError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throttle::{ManualExecutor, ThrottleRegistry};

    #[test]
    fn parses_registry_config() {
        let config = RegistryConfig::from_json(r#"{"queues": {"redis": 8, "http": 2}}"#).unwrap();
        assert_eq!(config.queues["redis"], 8);
        assert_eq!(config.queues.get_index(1), Some((&"http".to_string(), &2)));
    }

    #[test]
    fn missing_queues_default_to_empty() {
        assert_eq!(RegistryConfig::from_json("{}").unwrap(), RegistryConfig::default());
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = RegistryConfig::from_json(r#"{"queues": {"redis": -1}}"#).unwrap_err();
        assert!(matches!(err, FlowError::Config(_)));
    }

    #[test]
    fn throttle_config_without_queue_is_private() {
        let config: ThrottleConfig = serde_json::from_str(r#"{"max": 3}"#).unwrap();
        assert_eq!(config.key(), QueueKey::Private);

        let config: ThrottleConfig = serde_json::from_str(r#"{"max": 3, "queue": "http"}"#).unwrap();
        assert_eq!(config.key(), QueueKey::Shared("http".into()));
    }

    #[test]
    fn registry_is_built_from_config() {
        let config = RegistryConfig::from_json(r#"{"queues": {"redis": 8}}"#).unwrap();
        let registry = ThrottleRegistry::from_config(&config, ManualExecutor::new()).unwrap();
        assert_eq!(registry.get("redis").map(|t| t.max()), Some(8));
    }
}
