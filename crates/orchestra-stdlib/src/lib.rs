//!
//! Standard library of components for the Orchestra platform
//!

use orchestra_core::domain::component::{Actor, WorkflowComponent};
use orchestra_core::{ComponentFactory, ComponentRuntime, ConnectorRegistry, CoreError, RuntimeInterface};
use std::sync::Arc;
use tracing::info;

pub mod components;

use crate::components::{Delay, Echo, Fail, Gate, Webhook};

/// Merges its `output` config into the variables
pub const ECHO: &str = "std.echo";
/// Fails with its `message` config
pub const FAIL: &str = "std.fail";
/// Sleeps for `durationMs`
pub const DELAY: &str = "std.delay";
/// Cannot activate until `when` holds
pub const GATE: &str = "std.gate";
/// Waits for an external payload
pub const WEBHOOK: &str = "std.webhook";

/// Every component domain this crate provides
pub const DOMAINS: [&str; 5] = [ECHO, FAIL, DELAY, GATE, WEBHOOK];

/// Factory module for creating Standard Library components
pub mod factory {
    use super::*;

    /// Creates a component instance for a domain.
    pub fn create_component(
        domain: &str,
        connectors: &Arc<ConnectorRegistry>,
    ) -> Result<Box<dyn ComponentRuntime>, CoreError> {
        match domain {
            ECHO => Ok(Box::new(Echo::new())),
            FAIL => Ok(Box::new(Fail::new())),
            DELAY => Ok(Box::new(Delay::new())),
            GATE => Ok(Box::new(Gate::new())),
            WEBHOOK => Ok(Box::new(Webhook::new(connectors.clone()))),
            _ => Err(CoreError::not_found("Component", domain)),
        }
    }

    /// Factory handing out fresh instances of one domain
    pub fn factory_for(domain: &str, connectors: &Arc<ConnectorRegistry>) -> Option<Arc<dyn ComponentFactory>> {
        let factory: Arc<dyn ComponentFactory> = match domain {
            ECHO => Arc::new(|| Box::new(Echo::new()) as Box<dyn ComponentRuntime>),
            FAIL => Arc::new(|| Box::new(Fail::new()) as Box<dyn ComponentRuntime>),
            DELAY => Arc::new(|| Box::new(Delay::new()) as Box<dyn ComponentRuntime>),
            GATE => Arc::new(|| Box::new(Gate::new()) as Box<dyn ComponentRuntime>),
            WEBHOOK => {
                let connectors = connectors.clone();
                Arc::new(move || Box::new(Webhook::new(connectors.clone())) as Box<dyn ComponentRuntime>)
            }
            _ => return None,
        };
        Some(factory)
    }
}

fn catalogue_entry(domain: &str) -> WorkflowComponent {
    let component = WorkflowComponent::new(domain);
    match domain {
        ECHO => component.with_description("Merge fixed values into the run variables"),
        FAIL => component.with_description("Fail the step with a configured message"),
        DELAY => component.with_description("Pause for a fixed number of milliseconds"),
        GATE => component.with_description("Hold activation until an expression over the variables holds"),
        WEBHOOK => {
            let mut component = component.with_description("Wait for an externally delivered payload");
            component.actors = vec![Actor::System, Actor::Human];
            component
        }
        _ => component,
    }
}

/// Register every standard component with the runtime, catalogue entry and
/// local factory together
pub async fn register_all(runtime: &RuntimeInterface) -> Result<(), CoreError> {
    for domain in DOMAINS {
        let factory = factory::factory_for(domain, runtime.connectors());
        runtime.register_component(catalogue_entry(domain), factory).await?;
    }
    info!(count = DOMAINS.len(), "Standard library components registered");
    Ok(())
}
