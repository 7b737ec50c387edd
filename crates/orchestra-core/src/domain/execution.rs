//! Workflow execution (run) domain models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::context::{Context, NodeState};
use crate::domain::workflow::WorkflowNode;
use crate::types::{CorrelationId, WorkflowExecutionId, WorkflowId};

/// Overall status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Created, no activation answered yet
    Created,
    /// At least one node activated
    Running,
    /// A node could not activate and is parked
    Waiting,
    /// Every branch finished without failure
    Completed,
    /// A node failed
    Failed,
    /// Stopped by a termination request
    Terminated,
}

impl ExecutionStatus {
    /// Whether the status can no longer change through normal progress
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Terminated
        )
    }

    /// Whether response events are still applied to the run.
    ///
    /// A FAILED run still records the outcomes of its in-flight siblings.
    pub fn accepts_events(self) -> bool {
        !matches!(self, ExecutionStatus::Completed | ExecutionStatus::Terminated)
    }

    /// Whether a transition to `next` is allowed
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (a, b) if a == b => false,
            (Completed | Terminated, _) => false,
            (Failed, Terminated) => true,
            (Failed, _) => false,
            (_, Created) => false,
            _ => true,
        }
    }
}

/// One status change of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    /// New status
    pub status: ExecutionStatus,
    /// When it was entered
    pub at: DateTime<Utc>,
}

/// Failure details exposed on a failed run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionError {
    /// Key of the failing node
    pub node_key: String,
    /// Error message
    pub message: String,
}

/// Record of one node activation within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowNodeExecution {
    /// Correlation id of the activation that created this record
    pub correlation_id: CorrelationId,

    /// Copy of the node being executed
    pub workflow_node: WorkflowNode,

    /// Progress state
    pub state: NodeState,

    /// Context produced for this step; replaced by the component output when done
    pub stage_context: Context,

    /// Failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Why the last activation was deferred; cleared on activation or trigger
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deferred: Option<String>,

    /// Creation time
    pub created_date: DateTime<Utc>,

    /// Last update time
    pub updated_date: DateTime<Utc>,

    /// Time the node reached DONE or FAILED
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_date: Option<DateTime<Utc>>,
}

impl WorkflowNodeExecution {
    /// New IDLE record
    pub fn new(correlation_id: CorrelationId, workflow_node: WorkflowNode, stage_context: Context) -> Self {
        let now = Utc::now();
        Self {
            correlation_id,
            workflow_node,
            state: NodeState::Idle,
            stage_context,
            error: None,
            deferred: None,
            created_date: now,
            updated_date: now,
            completed_date: None,
        }
    }

    /// Key of the executed node
    pub fn node_key(&self) -> &str {
        &self.workflow_node.node_key
    }

    /// Whether the record is IDLE or WORKING
    pub fn is_open(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Move to a new state, stamping timestamps
    pub fn set_state(&mut self, state: NodeState) {
        let now = Utc::now();
        self.state = state;
        self.updated_date = now;
        if state.is_terminal() {
            self.completed_date = Some(now);
        }
    }
}

/// A run of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    /// Run identifier
    pub workflow_execution_id: WorkflowExecutionId,

    /// Workflow being run
    pub workflow_id: WorkflowId,

    /// Overall status
    pub status: ExecutionStatus,

    /// Run-level context: merged node states and decisions of every branch
    #[serde(default)]
    pub context: Context,

    /// Node activation history, in creation order
    #[serde(default)]
    pub node_executions: Vec<WorkflowNodeExecution>,

    /// Status transitions, oldest first
    #[serde(default)]
    pub status_history: Vec<StatusChange>,

    /// First failure of the run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,

    /// Creation time
    pub created_date: DateTime<Utc>,

    /// Last update time
    pub updated_date: DateTime<Utc>,
}

impl WorkflowExecution {
    /// New run in CREATED status
    pub fn new(workflow_id: WorkflowId) -> Self {
        let now = Utc::now();
        Self {
            workflow_execution_id: WorkflowExecutionId::generate(),
            workflow_id,
            status: ExecutionStatus::Created,
            context: Context::default(),
            node_executions: Vec::new(),
            status_history: vec![StatusChange {
                status: ExecutionStatus::Created,
                at: now,
            }],
            error: None,
            created_date: now,
            updated_date: now,
        }
    }

    /// Move to `status` if allowed. Returns whether the status changed.
    pub fn transition(&mut self, status: ExecutionStatus) -> bool {
        if !self.status.can_transition_to(status) {
            return false;
        }
        let now = Utc::now();
        self.status = status;
        self.updated_date = now;
        self.status_history.push(StatusChange { status, at: now });
        true
    }

    /// Record a failure of `node_key` and move to FAILED. The first error is kept.
    pub fn fail(&mut self, node_key: &str, message: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(ExecutionError {
                node_key: node_key.to_string(),
                message: message.into(),
            });
        }
        self.context.set_state(node_key, NodeState::Failed);
        self.transition(ExecutionStatus::Failed);
    }

    /// Move to COMPLETED when nothing is in flight and nothing failed.
    /// Returns whether the run completed.
    pub fn settle(&mut self) -> bool {
        if self.status.is_terminal()
            || !self.context.in_flight().is_empty()
            || self.context.has_failures()
        {
            return false;
        }
        self.transition(ExecutionStatus::Completed)
    }

    /// Move to WAITING when every open record is a deferred activation.
    /// A run with work still in flight keeps its status.
    pub fn park(&mut self) -> bool {
        if !matches!(self.status, ExecutionStatus::Created | ExecutionStatus::Running) {
            return false;
        }
        let mut open = self.node_executions.iter().filter(|n| n.is_open()).peekable();
        if open.peek().is_none() || !open.all(|n| n.deferred.is_some()) {
            return false;
        }
        self.transition(ExecutionStatus::Waiting)
    }

    /// Record for a correlation id
    pub fn node_execution(&self, correlation_id: &CorrelationId) -> Option<&WorkflowNodeExecution> {
        self.node_executions
            .iter()
            .find(|n| &n.correlation_id == correlation_id)
    }

    /// Mutable record for a correlation id
    pub fn node_execution_mut(
        &mut self,
        correlation_id: &CorrelationId,
    ) -> Option<&mut WorkflowNodeExecution> {
        self.node_executions
            .iter_mut()
            .find(|n| &n.correlation_id == correlation_id)
    }

    /// Open (IDLE or WORKING) record for a node key
    pub fn open_execution_for(&self, node_key: &str) -> Option<&WorkflowNodeExecution> {
        self.node_executions
            .iter()
            .find(|n| n.node_key() == node_key && n.is_open())
    }

    /// Most recent DONE record for a node key
    pub fn last_done(&self, node_key: &str) -> Option<&WorkflowNodeExecution> {
        self.node_executions
            .iter()
            .rev()
            .find(|n| n.node_key() == node_key && n.state == NodeState::Done)
    }

    /// Every record for a node key, oldest first
    pub fn executions_of<'a>(&'a self, node_key: &'a str) -> impl Iterator<Item = &'a WorkflowNodeExecution> {
        self.node_executions.iter().filter(move |n| n.node_key() == node_key)
    }

    /// Append a record
    pub fn record(&mut self, execution: WorkflowNodeExecution) {
        self.updated_date = execution.created_date;
        self.node_executions.push(execution);
    }

    /// Merge an incoming copy over this one. Non-empty fields win and
    /// collections are replaced wholesale.
    pub fn merge(&mut self, incoming: WorkflowExecution) {
        self.workflow_id = incoming.workflow_id;
        self.status = incoming.status;
        if !incoming.context.graph_nodes.is_empty() || !incoming.context.variables.is_empty() {
            self.context = incoming.context;
        }
        if !incoming.node_executions.is_empty() {
            self.node_executions = incoming.node_executions;
        }
        if !incoming.status_history.is_empty() {
            self.status_history = incoming.status_history;
        }
        if incoming.error.is_some() {
            self.error = incoming.error;
        }
        self.updated_date = incoming.updated_date;
    }
}
