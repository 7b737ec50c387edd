//! Runner configuration
//!
//! Layered: built-in defaults, then an optional file, then `ORCHESTRA__*`
//! environment variables (`ORCHESTRA__MONITORING__JSON=true`).

use orchestra_core::OrchestraConfig;
use orchestra_monitoring::MonitoringConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Everything the runner needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Core runtime tuning
    pub orchestra: OrchestraConfig,
    /// Logging
    pub monitoring: MonitoringConfig,
    /// Give up on a run after this many seconds
    pub run_timeout_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            orchestra: OrchestraConfig::default(),
            monitoring: MonitoringConfig {
                service_name: "orchestra-cli".to_string(),
                ..MonitoringConfig::default()
            },
            run_timeout_secs: 60,
        }
    }
}

impl RunnerConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&RunnerConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("ORCHESTRA")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Run timeout as a duration
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}
