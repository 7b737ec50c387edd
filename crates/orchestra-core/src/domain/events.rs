//! Orchestration events
//!
//! Events are append-only records. Every event carries a correlation id shared
//! by one request/response round trip, the id of the event that caused it,
//! and the origin of the actor that produced it. The payload is a closed set
//! of variants discriminated by `eventClass`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::domain::context::Context;
use crate::domain::execution::WorkflowExecution;
use crate::domain::workflow::{ComponentConfig, Workflow};
use crate::types::{CausationId, CorrelationId, EventId, WorkflowExecutionId, WorkflowId};
use crate::CoreError;

/// Actor that produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventOrigin {
    /// The orchestrator state machine
    Orchestrator,
    /// The component runtime engine
    RuntimeEngine,
    /// A component (local or remote)
    Component,
}

/// Event discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventClass {
    /// Ask the runtime whether a node can activate
    ActivationRequest,
    /// Runtime's activation answer
    ActivationResponse,
    /// Ask the runtime to run a node
    InvocationRequest,
    /// Runtime's run outcome
    InvocationResponse,
    /// Ask the runtime to stop a run
    TerminationRequest,
    /// Runtime's termination acknowledgement
    TerminationResponse,
    /// Runtime engine asks a remote provider to run a node
    ComponentActivate,
    /// A component asks for a parked node to be re-activated
    ComponentTrigger,
    /// A remote provider reports a run outcome
    ComponentFinished,
}

impl fmt::Display for EventClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Runtime answer to an activation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Activation {
    /// The node can run; carries the (unchanged) context
    Activate {
        /// Context to invoke with
        context: Context,
    },
    /// The node cannot run yet and stays parked
    Defer {
        /// Why activation was refused
        reason: String,
    },
    /// Activation failed for good (bad configuration, unknown component)
    Reject {
        /// Failure message
        message: String,
    },
}

/// Outcome of a component run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepOutcome {
    /// Run succeeded with an updated context
    Success {
        /// Output context
        context: Context,
    },
    /// Run failed
    Failure {
        /// Failure message
        message: String,
    },
}

/// Event payloads
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventClass", rename_all_fields = "camelCase")]
pub enum EventPayload {
    /// See [`EventClass::ActivationRequest`]
    ActivationRequest {
        workflow_id: WorkflowId,
        workflow_execution_id: WorkflowExecutionId,
        node_key: String,
        context: Context,
    },
    /// See [`EventClass::ActivationResponse`]
    ActivationResponse {
        workflow_id: WorkflowId,
        workflow_execution_id: WorkflowExecutionId,
        node_key: String,
        activation: Activation,
    },
    /// See [`EventClass::InvocationRequest`]
    InvocationRequest {
        workflow_id: WorkflowId,
        workflow_execution_id: WorkflowExecutionId,
        node_key: String,
        context: Context,
    },
    /// See [`EventClass::InvocationResponse`]
    InvocationResponse {
        workflow_id: WorkflowId,
        workflow_execution_id: WorkflowExecutionId,
        node_key: String,
        outcome: StepOutcome,
    },
    /// See [`EventClass::TerminationRequest`]
    TerminationRequest {
        workflow_id: WorkflowId,
        workflow_execution_id: WorkflowExecutionId,
        #[serde(default)]
        reason: Option<String>,
    },
    /// See [`EventClass::TerminationResponse`]
    TerminationResponse {
        workflow_id: WorkflowId,
        workflow_execution_id: WorkflowExecutionId,
    },
    /// See [`EventClass::ComponentActivate`]
    ComponentActivate {
        workflow_id: WorkflowId,
        workflow_execution_id: WorkflowExecutionId,
        node_key: String,
        component: String,
        #[serde(default)]
        component_config: ComponentConfig,
        context: Context,
    },
    /// See [`EventClass::ComponentTrigger`]
    ComponentTrigger {
        workflow_id: WorkflowId,
        workflow_execution_id: WorkflowExecutionId,
        node_key: String,
    },
    /// See [`EventClass::ComponentFinished`]
    ComponentFinished {
        workflow_id: WorkflowId,
        workflow_execution_id: WorkflowExecutionId,
        node_key: String,
        outcome: StepOutcome,
    },
}

impl EventPayload {
    /// Discriminator of this payload
    pub fn class(&self) -> EventClass {
        match self {
            EventPayload::ActivationRequest { .. } => EventClass::ActivationRequest,
            EventPayload::ActivationResponse { .. } => EventClass::ActivationResponse,
            EventPayload::InvocationRequest { .. } => EventClass::InvocationRequest,
            EventPayload::InvocationResponse { .. } => EventClass::InvocationResponse,
            EventPayload::TerminationRequest { .. } => EventClass::TerminationRequest,
            EventPayload::TerminationResponse { .. } => EventClass::TerminationResponse,
            EventPayload::ComponentActivate { .. } => EventClass::ComponentActivate,
            EventPayload::ComponentTrigger { .. } => EventClass::ComponentTrigger,
            EventPayload::ComponentFinished { .. } => EventClass::ComponentFinished,
        }
    }

    /// Workflow referenced by the payload
    pub fn workflow_id(&self) -> &WorkflowId {
        match self {
            EventPayload::ActivationRequest { workflow_id, .. }
            | EventPayload::ActivationResponse { workflow_id, .. }
            | EventPayload::InvocationRequest { workflow_id, .. }
            | EventPayload::InvocationResponse { workflow_id, .. }
            | EventPayload::TerminationRequest { workflow_id, .. }
            | EventPayload::TerminationResponse { workflow_id, .. }
            | EventPayload::ComponentActivate { workflow_id, .. }
            | EventPayload::ComponentTrigger { workflow_id, .. }
            | EventPayload::ComponentFinished { workflow_id, .. } => workflow_id,
        }
    }

    /// Run referenced by the payload
    pub fn execution_id(&self) -> &WorkflowExecutionId {
        match self {
            EventPayload::ActivationRequest { workflow_execution_id, .. }
            | EventPayload::ActivationResponse { workflow_execution_id, .. }
            | EventPayload::InvocationRequest { workflow_execution_id, .. }
            | EventPayload::InvocationResponse { workflow_execution_id, .. }
            | EventPayload::TerminationRequest { workflow_execution_id, .. }
            | EventPayload::TerminationResponse { workflow_execution_id, .. }
            | EventPayload::ComponentActivate { workflow_execution_id, .. }
            | EventPayload::ComponentTrigger { workflow_execution_id, .. }
            | EventPayload::ComponentFinished { workflow_execution_id, .. } => workflow_execution_id,
        }
    }

    /// Node referenced by the payload, if any
    pub fn node_key(&self) -> Option<&str> {
        match self {
            EventPayload::ActivationRequest { node_key, .. }
            | EventPayload::ActivationResponse { node_key, .. }
            | EventPayload::InvocationRequest { node_key, .. }
            | EventPayload::InvocationResponse { node_key, .. }
            | EventPayload::ComponentActivate { node_key, .. }
            | EventPayload::ComponentTrigger { node_key, .. }
            | EventPayload::ComponentFinished { node_key, .. } => Some(node_key),
            EventPayload::TerminationRequest { .. } | EventPayload::TerminationResponse { .. } => None,
        }
    }
}

/// Workflow and run resolved for an event before handling
#[derive(Debug)]
pub struct EventContext {
    /// The workflow, inflated
    pub workflow: Workflow,
    /// The run as loaded
    pub execution: WorkflowExecution,
}

/// A persisted orchestration event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Unique event id
    pub event_id: EventId,

    /// Shared by one request/response round trip
    pub correlation_id: CorrelationId,

    /// Event that produced this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<CausationId>,

    /// Producing actor
    pub origin: EventOrigin,

    /// Creation time
    pub created_date: DateTime<Utc>,

    /// Set once by the handler that consumes the event
    #[serde(default)]
    pub processed_date: Option<DateTime<Utc>>,

    /// Typed payload
    pub payload: EventPayload,

    #[serde(skip)]
    context: Option<Arc<EventContext>>,
}

impl Event {
    /// New event
    pub fn new(
        origin: EventOrigin,
        correlation_id: CorrelationId,
        causation_id: Option<CausationId>,
        payload: EventPayload,
    ) -> Self {
        Self {
            event_id: EventId::generate(),
            correlation_id,
            causation_id,
            origin,
            created_date: Utc::now(),
            processed_date: None,
            payload,
            context: None,
        }
    }

    /// New event in the same round trip, caused by this one
    pub fn follow_up(&self, origin: EventOrigin, payload: EventPayload) -> Self {
        Self::new(
            origin,
            self.correlation_id.clone(),
            Some(CausationId::from(&self.event_id)),
            payload,
        )
    }

    /// Discriminator
    pub fn class(&self) -> EventClass {
        self.payload.class()
    }

    /// Whether a handler already consumed the event
    pub fn is_processed(&self) -> bool {
        self.processed_date.is_some()
    }

    /// Attach the resolved workflow and run
    pub fn attach_context(&mut self, context: Arc<EventContext>) {
        self.context = Some(context);
    }

    /// Resolved workflow and run
    pub fn context(&self) -> Result<&EventContext, CoreError> {
        self.context.as_deref().ok_or_else(|| {
            CoreError::ProtocolViolation(format!(
                "event {} ({}) has no orchestration context attached",
                self.event_id,
                self.class()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn activation_request() -> Event {
        Event::new(
            EventOrigin::Orchestrator,
            CorrelationId::generate(),
            None,
            EventPayload::ActivationRequest {
                workflow_id: WorkflowId::from("wf"),
                workflow_execution_id: WorkflowExecutionId::from("run"),
                node_key: "task_a".to_string(),
                context: Context::default(),
            },
        )
    }

    #[test]
    fn test_wire_format() {
        let event = activation_request();
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["origin"], json!("ORCHESTRATOR"));
        assert_eq!(value["payload"]["eventClass"], json!("ActivationRequest"));
        assert_eq!(value["payload"]["nodeKey"], json!("task_a"));
        assert_eq!(value["payload"]["workflowExecutionId"], json!("run"));
        assert!(value["processedDate"].is_null());
        assert!(value.get("causationId").is_none());

        let back: Event = serde_json::from_value(value).unwrap();
        assert_eq!(back.class(), EventClass::ActivationRequest);
        assert_eq!(back.event_id, event.event_id);
    }

    #[test]
    fn test_outcome_wire_format() {
        let response = activation_request().follow_up(
            EventOrigin::RuntimeEngine,
            EventPayload::InvocationResponse {
                workflow_id: WorkflowId::from("wf"),
                workflow_execution_id: WorkflowExecutionId::from("run"),
                node_key: "task_a".to_string(),
                outcome: StepOutcome::Failure {
                    message: "boom".to_string(),
                },
            },
        );
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["payload"]["outcome"]["status"], json!("FAILURE"));
        assert_eq!(value["payload"]["outcome"]["message"], json!("boom"));
    }

    #[test]
    fn test_follow_up_keeps_correlation_and_sets_causation() {
        let request = activation_request();
        let response = request.follow_up(
            EventOrigin::RuntimeEngine,
            EventPayload::ActivationResponse {
                workflow_id: WorkflowId::from("wf"),
                workflow_execution_id: WorkflowExecutionId::from("run"),
                node_key: "task_a".to_string(),
                activation: Activation::Defer {
                    reason: "closed".to_string(),
                },
            },
        );

        assert_eq!(response.correlation_id, request.correlation_id);
        assert_eq!(response.causation_id.as_ref().unwrap().as_str(), request.event_id.as_str());
        assert_ne!(response.event_id, request.event_id);
        assert_eq!(response.payload.node_key(), Some("task_a"));
        assert_eq!(response.payload.execution_id().as_str(), "run");
    }

    #[test]
    fn test_context_is_required_and_not_serialized() {
        let event = activation_request();
        assert!(matches!(event.context(), Err(CoreError::ProtocolViolation(_))));
    }
}
