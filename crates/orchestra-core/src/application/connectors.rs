//! Connector callbacks
//!
//! Components that wait on the outside world (webhooks, signals) park a
//! one-shot callback here keyed by run and node. Delivering a payload removes
//! the callback before invoking it, so a connector fires at most once.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

use crate::CoreError;

/// Callback invoked with the payload delivered to a connector
pub type ConnectorCallback = Box<dyn FnOnce(Value) + Send>;

/// Connector address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectorKey {
    /// Run id
    pub run_key: String,
    /// Node key within the run
    pub node_key: String,
}

impl ConnectorKey {
    /// Key for a run and node
    pub fn new(run_key: impl Into<String>, node_key: impl Into<String>) -> Self {
        Self {
            run_key: run_key.into(),
            node_key: node_key.into(),
        }
    }
}

impl fmt::Display for ConnectorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.run_key, self.node_key)
    }
}

/// Pending connector callbacks
#[derive(Default)]
pub struct ConnectorRegistry {
    listeners: Mutex<HashMap<ConnectorKey, ConnectorCallback>>,
}

impl ConnectorRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a callback. A second listener for the same key is rejected.
    pub fn add_listener(&self, key: ConnectorKey, callback: ConnectorCallback) -> Result<(), CoreError> {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        if listeners.contains_key(&key) {
            return Err(CoreError::DuplicateKey {
                collection: "connectors".to_string(),
                field: "key".to_string(),
                value: key.to_string(),
            });
        }
        debug!(connector = %key, "Connector listener added");
        listeners.insert(key, callback);
        Ok(())
    }

    /// Deliver `payload` to the listener for `key`, consuming it
    pub fn invoke(&self, key: &ConnectorKey, payload: Value) -> Result<(), CoreError> {
        // Released before the callback runs; callbacks may re-enter the registry.
        let callback = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .ok_or_else(|| CoreError::not_found("Connector", key.to_string()))?;
        debug!(connector = %key, "Connector invoked");
        callback(payload);
        Ok(())
    }

    /// Drop the listener for `key`, returning whether one existed
    pub fn remove_listener(&self, key: &ConnectorKey) -> bool {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    /// Drop every listener of a run, returning how many were removed
    pub fn remove_run(&self, run_key: &str) -> usize {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|key, _| key.run_key != run_key);
        before - listeners.len()
    }

    /// Whether a listener is parked under `key`
    pub fn contains(&self, key: &ConnectorKey) -> bool {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Number of parked listeners
    pub fn len(&self) -> usize {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no listener is parked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
