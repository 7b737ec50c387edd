//! Logging and observability for the Orchestra platform.

use serde::{Deserialize, Serialize};

pub mod interactions;
pub mod logging;

pub use interactions::TracingInteractionSink;
pub use logging::{init_logging, LogExt};

/// Configuration for initializing logging
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Service name attached to the startup line
    pub service_name: String,
    /// Log level filter (e.g., "info,orchestra_core=debug"); `RUST_LOG` wins when set
    pub log_filter: String,
    /// JSON lines instead of pretty output
    pub json: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service_name: "orchestra".to_string(),
            log_filter: "info".to_string(),
            json: false,
        }
    }
}
