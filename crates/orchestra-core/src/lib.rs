//!
//! Orchestra Core - event-sourced workflow orchestration
//!
//! Workflows are directed graphs of nodes executed by components. A run is
//! driven forward by request/response events between the orchestrator and
//! the runtime engine; every event is persisted before it is published and
//! handled at most once.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - workflow graphs, runs, events and the store abstraction
pub mod domain;

/// Application services - orchestration, dispatch and registries
pub mod application;

/// Component runtime abstraction
pub mod runtime;

/// Runtime configuration
pub mod config;

/// Core types
pub mod types;

/// Error types
pub mod error;

pub use config::OrchestraConfig;
pub use error::CoreError;
pub use types::{CausationId, CorrelationId, EventId, LogLevel, Variables, WorkflowExecutionId, WorkflowId};

pub use application::connectors::{ConnectorKey, ConnectorRegistry};
pub use application::converter::{ProcessConverter, YamlWorkflowConverter};
pub use application::runtime_interface::{RuntimeInterface, Stores};
pub use domain::context::{Context, MergeStrategy, NodeState};
pub use domain::events::{Activation, Event, EventClass, EventOrigin, EventPayload, StepOutcome};
pub use domain::execution::{ExecutionStatus, WorkflowExecution};
pub use domain::workflow::{ComponentConfig, Workflow, WorkflowNode, WorkflowNodeType};
pub use runtime::{ComponentEmitter, ComponentFactory, ComponentRuntime, StepLogger};
