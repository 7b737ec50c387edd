//! Runtime configuration for the orchestration core.
//!
//! Every field has a default so an empty document is a valid configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OrchestraConfig {
    /// Event dispatch tuning
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Interaction log queue
    #[serde(default)]
    pub interaction_log: InteractionLogConfig,
}

/// Event dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchConfig {
    /// Capacity of the in-memory event queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How long a component may take to answer `can_activate`
    #[serde(default = "default_activation_timeout_ms")]
    pub activation_timeout_ms: u64,

    /// Attempts for an optimistic execution update before giving up
    #[serde(default = "default_max_update_attempts")]
    pub max_update_attempts: u32,
}

/// Interaction log configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InteractionLogConfig {
    /// Whether interaction entries are forwarded at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Bounded queue size; entries beyond it are dropped
    #[serde(default = "default_log_capacity")]
    pub capacity: usize,
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_activation_timeout_ms() -> u64 {
    5_000
}

fn default_max_update_attempts() -> u32 {
    16
}

fn default_enabled() -> bool {
    true
}

fn default_log_capacity() -> usize {
    256
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            activation_timeout_ms: default_activation_timeout_ms(),
            max_update_attempts: default_max_update_attempts(),
        }
    }
}

impl DispatchConfig {
    /// Activation timeout as a duration
    pub fn activation_timeout(&self) -> Duration {
        Duration::from_millis(self.activation_timeout_ms)
    }
}

impl Default for InteractionLogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            capacity: default_log_capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: OrchestraConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, OrchestraConfig::default());
        assert_eq!(config.dispatch.queue_capacity, 1024);
        assert_eq!(config.dispatch.activation_timeout(), Duration::from_secs(5));
        assert!(config.interaction_log.enabled);
    }

    #[test]
    fn test_partial_override() {
        let config: OrchestraConfig =
            serde_json::from_str(r#"{"dispatch": {"max_update_attempts": 3}}"#).unwrap();
        assert_eq!(config.dispatch.max_update_attempts, 3);
        assert_eq!(config.dispatch.queue_capacity, 1024);
    }
}
