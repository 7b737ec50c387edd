// Module definitions for the various component categories

pub mod data;
pub mod flow_control;
pub mod webhook;

pub use data::*;
pub use flow_control::*;
pub use webhook::*;

use orchestra_core::{ComponentConfig, CoreError};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Read a typed configuration out of a node's component config
pub(crate) fn parse_config<T: DeserializeOwned>(component: &str, config: &ComponentConfig) -> Result<T, CoreError> {
    serde_json::from_value(Value::Object(config.clone()))
        .map_err(|e| CoreError::ConfigurationError(format!("{}: {}", component, e)))
}

#[cfg(test)]
pub(crate) mod testing {
    use orchestra_core::application::interaction::InteractionLog;
    use orchestra_core::runtime::{StepInfo, StepResult};
    use orchestra_core::{ComponentEmitter, CorrelationId, StepLogger, WorkflowExecutionId};
    use tokio::sync::oneshot;

    pub fn emitter(component: &str) -> (ComponentEmitter, oneshot::Receiver<StepResult>) {
        ComponentEmitter::channel(StepLogger::new(
            StepInfo {
                execution_id: WorkflowExecutionId::from("run-1"),
                workflow_domain: "std.test".to_string(),
                correlation_id: CorrelationId::from("corr-1"),
                node_id: "step".to_string(),
                node_key: "task_step".to_string(),
                component: component.to_string(),
            },
            InteractionLog::disabled(),
        ))
    }
}
