//! Component runtime engine
//!
//! Answers the orchestrator's activation, invocation and termination requests.
//! Local components are built from the runtime registry, configured and run
//! in their own task; remote components are handed out as `ComponentActivate`
//! events and report back with `ComponentFinished`.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::application::connectors::ConnectorRegistry;
use crate::application::dispatch::EventPublisher;
use crate::application::interaction::InteractionLog;
use crate::application::registry::WorkflowComponentRegistry;
use crate::domain::component::ProviderKind;
use crate::domain::context::Context;
use crate::domain::events::{Activation, Event, EventOrigin, EventPayload, StepOutcome};
use crate::domain::workflow::WorkflowNode;
use crate::runtime::{ComponentEmitter, ComponentRuntime, RuntimeRegistry, StepInfo, StepLogger};
use crate::CoreError;

enum Provider {
    Local(Box<dyn ComponentRuntime>),
    Remote,
    Missing,
}

/// Executes nodes on behalf of the orchestrator
pub struct RuntimeEngine {
    runtimes: Arc<RuntimeRegistry>,
    components: Arc<WorkflowComponentRegistry>,
    connectors: Arc<ConnectorRegistry>,
    publisher: EventPublisher,
    interactions: InteractionLog,
    activation_timeout: Duration,
}

impl RuntimeEngine {
    /// New engine
    pub fn new(
        runtimes: Arc<RuntimeRegistry>,
        components: Arc<WorkflowComponentRegistry>,
        connectors: Arc<ConnectorRegistry>,
        publisher: EventPublisher,
        interactions: InteractionLog,
        activation_timeout: Duration,
    ) -> Self {
        Self {
            runtimes,
            components,
            connectors,
            publisher,
            interactions,
            activation_timeout,
        }
    }

    /// Decide whether a node can activate
    pub async fn on_activation_request(&self, event: &Event) -> Result<Vec<Event>, CoreError> {
        let EventPayload::ActivationRequest {
            workflow_id,
            workflow_execution_id,
            node_key,
            context,
        } = &event.payload
        else {
            return Err(unexpected(event));
        };
        let node = self.node(event, node_key)?;

        let activation = match component_of(&node) {
            None => Activation::Activate {
                context: context.clone(),
            },
            Some(component) => match self.resolve(component).await? {
                Provider::Remote => Activation::Activate {
                    context: context.clone(),
                },
                Provider::Missing => Activation::Reject {
                    message: CoreError::not_found("Component", component).to_string(),
                },
                Provider::Local(mut runtime) => match runtime.configure(&node.component_config) {
                    Err(e) => Activation::Reject { message: e.to_string() },
                    Ok(()) => {
                        let logger = self.step_logger(event, &node, component)?;
                        self.check_activation(runtime.as_ref(), context, logger).await
                    }
                },
            },
        };

        debug!(%node_key, ?activation, "Activation answered");
        Ok(vec![event.follow_up(
            EventOrigin::RuntimeEngine,
            EventPayload::ActivationResponse {
                workflow_id: workflow_id.clone(),
                workflow_execution_id: workflow_execution_id.clone(),
                node_key: node_key.clone(),
                activation,
            },
        )])
    }

    /// Run a node. Local outcomes are published from a background task once
    /// the component reports; remote nodes are handed to their provider.
    pub async fn on_invocation_request(&self, event: &Event) -> Result<Vec<Event>, CoreError> {
        let EventPayload::InvocationRequest {
            workflow_id,
            workflow_execution_id,
            node_key,
            context,
        } = &event.payload
        else {
            return Err(unexpected(event));
        };
        let node = self.node(event, node_key)?;
        let respond = |outcome: StepOutcome| {
            event.follow_up(
                EventOrigin::RuntimeEngine,
                EventPayload::InvocationResponse {
                    workflow_id: workflow_id.clone(),
                    workflow_execution_id: workflow_execution_id.clone(),
                    node_key: node_key.clone(),
                    outcome,
                },
            )
        };

        let Some(component) = component_of(&node) else {
            return Ok(vec![respond(StepOutcome::Success {
                context: context.clone(),
            })]);
        };

        let mut runtime = match self.resolve(component).await? {
            Provider::Remote => {
                info!(%node_key, %component, "Handing node to remote provider");
                return Ok(vec![event.follow_up(
                    EventOrigin::RuntimeEngine,
                    EventPayload::ComponentActivate {
                        workflow_id: workflow_id.clone(),
                        workflow_execution_id: workflow_execution_id.clone(),
                        node_key: node_key.clone(),
                        component: component.to_string(),
                        component_config: node.component_config.clone(),
                        context: context.clone(),
                    },
                )]);
            }
            Provider::Missing => {
                return Ok(vec![respond(StepOutcome::Failure {
                    message: CoreError::not_found("Component", component).to_string(),
                })]);
            }
            Provider::Local(runtime) => runtime,
        };
        if let Err(e) = runtime.configure(&node.component_config) {
            return Ok(vec![respond(StepOutcome::Failure { message: e.to_string() })]);
        }

        let logger = self.step_logger(event, &node, component)?;
        let (emitter, outcome) = ComponentEmitter::channel(logger);
        let template = respond(StepOutcome::Failure {
            message: String::new(),
        });
        let publisher = self.publisher.clone();
        let context = context.clone();
        let node_key = node_key.clone();

        tokio::spawn(async move {
            let run = tokio::spawn(async move { runtime.run(context, emitter).await });
            if let Err(e) = run.await {
                error!(%node_key, error = %e, "Component task aborted");
            }
            let outcome = match outcome.await {
                Ok(Ok(context)) => StepOutcome::Success { context },
                Ok(Err(message)) => StepOutcome::Failure { message },
                Err(_) => StepOutcome::Failure {
                    message: "component finished without reporting an outcome".to_string(),
                },
            };
            let mut response = template;
            if let EventPayload::InvocationResponse { outcome: slot, .. } = &mut response.payload {
                *slot = outcome;
            }
            if let Err(e) = publisher.publish(response).await {
                error!(%node_key, error = %e, "Could not publish invocation response");
            }
        });

        Ok(Vec::new())
    }

    /// Drop everything a run left behind and acknowledge
    pub async fn on_termination_request(&self, event: &Event) -> Result<Vec<Event>, CoreError> {
        let EventPayload::TerminationRequest {
            workflow_id,
            workflow_execution_id,
            reason,
        } = &event.payload
        else {
            return Err(unexpected(event));
        };

        let removed = self.connectors.remove_run(workflow_execution_id.as_str());
        info!(
            execution_id = %workflow_execution_id,
            connectors = removed,
            reason = reason.as_deref().unwrap_or(""),
            "Run resources released"
        );
        Ok(vec![event.follow_up(
            EventOrigin::RuntimeEngine,
            EventPayload::TerminationResponse {
                workflow_id: workflow_id.clone(),
                workflow_execution_id: workflow_execution_id.clone(),
            },
        )])
    }

    /// Relay a remote outcome to the orchestrator
    pub async fn on_component_finished(&self, event: &Event) -> Result<Vec<Event>, CoreError> {
        let EventPayload::ComponentFinished {
            workflow_id,
            workflow_execution_id,
            node_key,
            outcome,
        } = &event.payload
        else {
            return Err(unexpected(event));
        };

        Ok(vec![event.follow_up(
            EventOrigin::RuntimeEngine,
            EventPayload::InvocationResponse {
                workflow_id: workflow_id.clone(),
                workflow_execution_id: workflow_execution_id.clone(),
                node_key: node_key.clone(),
                outcome: outcome.clone(),
            },
        )])
    }

    async fn resolve(&self, component: &str) -> Result<Provider, CoreError> {
        if let Some(entry) = self.components.get_by_domain(component).await? {
            if entry.provider == ProviderKind::Remote {
                return Ok(Provider::Remote);
            }
        }
        Ok(match self.runtimes.create(component) {
            Some(runtime) => Provider::Local(runtime),
            None => {
                warn!(%component, "No runtime registered for component");
                Provider::Missing
            }
        })
    }

    async fn check_activation(
        &self,
        runtime: &dyn ComponentRuntime,
        context: &Context,
        logger: StepLogger,
    ) -> Activation {
        let (emitter, outcome) = ComponentEmitter::channel(logger);
        let check = async {
            runtime.can_activate(context, emitter).await;
            outcome.await
        };
        match tokio::time::timeout(self.activation_timeout, check).await {
            Ok(Ok(Ok(context))) => Activation::Activate { context },
            Ok(Ok(Err(reason))) => Activation::Defer { reason },
            Ok(Err(_)) => Activation::Defer {
                reason: "component gave no activation answer".to_string(),
            },
            Err(_) => Activation::Defer {
                reason: format!("activation check timed out after {:?}", self.activation_timeout),
            },
        }
    }

    fn node(&self, event: &Event, node_key: &str) -> Result<WorkflowNode, CoreError> {
        let topology = event.context()?.workflow.topology();
        topology.node(node_key).cloned().ok_or_else(|| {
            CoreError::ProtocolViolation(format!("node {} is not part of the workflow", node_key))
        })
    }

    fn step_logger(&self, event: &Event, node: &WorkflowNode, component: &str) -> Result<StepLogger, CoreError> {
        let context = event.context()?;
        Ok(StepLogger::new(
            StepInfo {
                execution_id: context.execution.workflow_execution_id.clone(),
                workflow_domain: context.workflow.domain.clone(),
                correlation_id: event.correlation_id.clone(),
                node_id: node.node_id.clone(),
                node_key: node.node_key.clone(),
                component: component.to_string(),
            },
            self.interactions.clone(),
        ))
    }
}

fn component_of(node: &WorkflowNode) -> Option<&str> {
    node.component.as_deref().filter(|c| !c.is_empty())
}

fn unexpected(event: &Event) -> CoreError {
    CoreError::ProtocolViolation(format!("unexpected {} event {}", event.class(), event.event_id))
}
