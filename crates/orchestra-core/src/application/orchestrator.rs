//! Workflow orchestrator
//!
//! Owns run state. Starts runs, applies activation and invocation outcomes,
//! computes successors (resolving component-less decisions and ends inline),
//! gates joins on their live predecessors, and settles runs into a terminal
//! status. Every mutation of a run goes through a compare-and-swap update.

use futures::future::try_join_all;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::application::dispatch::EventPublisher;
use crate::application::registry::{WorkflowExecutionRegistry, WorkflowRegistry};
use crate::domain::condition::ConditionEvaluator;
use crate::domain::context::{Context, NodeState};
use crate::domain::events::{Activation, Event, EventOrigin, EventPayload, StepOutcome};
use crate::domain::execution::{ExecutionStatus, WorkflowExecution, WorkflowNodeExecution};
use crate::domain::workflow::{Workflow, WorkflowNode, WorkflowNodeType, WorkflowTopology};
use crate::types::{CausationId, CorrelationId, Variables, WorkflowExecutionId};
use crate::CoreError;

/// A successor to activate, and the node it is reached from
#[derive(Debug, Clone, PartialEq, Eq)]
struct Step {
    node_key: String,
    parent: String,
}

/// Decision failure raised while planning successors
struct PlanError {
    node_key: String,
    error: CoreError,
}

/// The orchestration state machine
pub struct Orchestrator {
    workflows: Arc<WorkflowRegistry>,
    executions: Arc<WorkflowExecutionRegistry>,
    publisher: EventPublisher,
    evaluator: Arc<dyn ConditionEvaluator>,
}

impl Orchestrator {
    /// New orchestrator
    pub fn new(
        workflows: Arc<WorkflowRegistry>,
        executions: Arc<WorkflowExecutionRegistry>,
        publisher: EventPublisher,
        evaluator: Arc<dyn ConditionEvaluator>,
    ) -> Self {
        Self {
            workflows,
            executions,
            publisher,
            evaluator,
        }
    }

    /// Start a run of the workflow registered under `domain`
    pub async fn start(&self, domain: &str, variables: Variables) -> Result<WorkflowExecutionId, CoreError> {
        let workflow = self.workflows.get_workflow_by_domain(domain).await?;
        self.start_workflow(&workflow, variables).await
    }

    /// Start a run: one activation request per START node, each with its own
    /// correlation id and no causation
    pub async fn start_workflow(
        &self,
        workflow: &Workflow,
        variables: Variables,
    ) -> Result<WorkflowExecutionId, CoreError> {
        if !workflow.active {
            return Err(CoreError::ValidationError(format!(
                "workflow {} is inactive",
                workflow.domain
            )));
        }
        let topology = workflow.topology();
        let starts = topology.start_nodes();
        if starts.is_empty() {
            return Err(CoreError::ValidationError(format!(
                "workflow {} has no START node",
                workflow.domain
            )));
        }

        let mut execution = WorkflowExecution::new(workflow.workflow_id.clone());
        execution.context.variables = variables.clone();
        let mut requests = Vec::with_capacity(starts.len());
        for start in starts {
            let correlation_id = CorrelationId::generate();
            let stage = Context::initial(start, variables.clone());
            execution.context.set_state(&start.node_key, NodeState::Idle);
            execution.record(WorkflowNodeExecution::new(correlation_id.clone(), start.clone(), stage.clone()));
            requests.push(Event::new(
                EventOrigin::Orchestrator,
                correlation_id,
                None,
                EventPayload::ActivationRequest {
                    workflow_id: workflow.workflow_id.clone(),
                    workflow_execution_id: execution.workflow_execution_id.clone(),
                    node_key: start.node_key.clone(),
                    context: stage,
                },
            ));
        }

        let execution = self.executions.register(execution).await?;
        info!(
            execution_id = %execution.workflow_execution_id,
            domain = %workflow.domain,
            starts = requests.len(),
            "Workflow run started"
        );
        try_join_all(requests.into_iter().map(|request| self.publisher.publish(request))).await?;
        Ok(execution.workflow_execution_id)
    }

    /// Stop a run. Returns `false` if it had already completed or terminated.
    pub async fn terminate(&self, execution_id: &WorkflowExecutionId, reason: Option<String>) -> Result<bool, CoreError> {
        let request = self
            .executions
            .update(execution_id, |execution| {
                if !execution.transition(ExecutionStatus::Terminated) {
                    return Ok(None);
                }
                Ok(Some(Event::new(
                    EventOrigin::Orchestrator,
                    CorrelationId::generate(),
                    None,
                    EventPayload::TerminationRequest {
                        workflow_id: execution.workflow_id.clone(),
                        workflow_execution_id: execution.workflow_execution_id.clone(),
                        reason: reason.clone(),
                    },
                )))
            })
            .await?;

        match request {
            Some(request) => {
                info!(%execution_id, reason = reason.as_deref().unwrap_or(""), "Workflow run terminated");
                self.publisher.publish(request).await?;
                Ok(true)
            }
            None => {
                debug!(%execution_id, "Run already finished, nothing to terminate");
                Ok(false)
            }
        }
    }

    /// Apply an activation answer
    pub async fn on_activated(&self, event: &Event) -> Result<Vec<Event>, CoreError> {
        let EventPayload::ActivationResponse {
            workflow_execution_id,
            node_key,
            activation,
            ..
        } = &event.payload
        else {
            return Err(unexpected(event));
        };
        let topology = event.context()?.workflow.topology();
        let node = topology
            .node(node_key)
            .ok_or_else(|| unknown_node(node_key))?
            .clone();

        self.executions
            .update(workflow_execution_id, |execution| {
                if !execution.status.accepts_events() {
                    debug!(execution_id = %workflow_execution_id, status = ?execution.status, "Run closed, ignoring activation");
                    return Ok(Vec::new());
                }
                let index = record_index(execution, event)?;
                if execution.node_executions[index].state != NodeState::Idle {
                    debug!(%node_key, "Stale activation answer, ignoring");
                    return Ok(Vec::new());
                }

                match activation {
                    Activation::Activate { context } => {
                        execution.node_executions[index].deferred = None;
                        execution.transition(ExecutionStatus::Running);
                        if !node.has_component() {
                            return Ok(self.advance(execution, &topology, index, context.clone(), event));
                        }
                        let record = &mut execution.node_executions[index];
                        record.stage_context = context.clone();
                        record.set_state(NodeState::Working);
                        execution.context.set_state(node_key, NodeState::Working);
                        debug!(%node_key, correlation_id = %event.correlation_id, "Node activated, invoking");
                        Ok(vec![event.follow_up(
                            EventOrigin::Orchestrator,
                            EventPayload::InvocationRequest {
                                workflow_id: execution.workflow_id.clone(),
                                workflow_execution_id: workflow_execution_id.clone(),
                                node_key: node_key.clone(),
                                context: context.clone(),
                            },
                        )])
                    }
                    Activation::Defer { reason } => {
                        execution.node_executions[index].deferred = Some(reason.clone());
                        if execution.park() {
                            info!(%node_key, %reason, "Node cannot activate yet, run waiting");
                        } else {
                            info!(%node_key, %reason, "Node cannot activate yet, siblings still in flight");
                        }
                        Ok(Vec::new())
                    }
                    Activation::Reject { message } => {
                        let record = &mut execution.node_executions[index];
                        record.error = Some(message.clone());
                        record.set_state(NodeState::Failed);
                        execution.fail(node_key, message.clone());
                        warn!(%node_key, %message, "Node activation rejected, run failed");
                        Ok(Vec::new())
                    }
                }
            })
            .await
    }

    /// Apply a run outcome
    pub async fn on_invoked(&self, event: &Event) -> Result<Vec<Event>, CoreError> {
        let EventPayload::InvocationResponse {
            workflow_execution_id,
            node_key,
            outcome,
            ..
        } = &event.payload
        else {
            return Err(unexpected(event));
        };
        let topology = event.context()?.workflow.topology();

        self.executions
            .update(workflow_execution_id, |execution| {
                if !execution.status.accepts_events() {
                    debug!(execution_id = %workflow_execution_id, status = ?execution.status, "Run closed, ignoring outcome");
                    return Ok(Vec::new());
                }
                let index = record_index(execution, event)?;
                if execution.node_executions[index].state != NodeState::Working {
                    debug!(%node_key, "Outcome for a node that is not working, ignoring");
                    return Ok(Vec::new());
                }

                match outcome {
                    StepOutcome::Success { context } => {
                        Ok(self.advance(execution, &topology, index, context.clone(), event))
                    }
                    StepOutcome::Failure { message } => {
                        let record = &mut execution.node_executions[index];
                        record.error = Some(message.clone());
                        record.set_state(NodeState::Failed);
                        execution.fail(node_key, message.clone());
                        warn!(%node_key, %message, "Node failed");
                        Ok(Vec::new())
                    }
                }
            })
            .await
    }

    /// Re-issue the activation request of a parked node
    pub async fn on_triggered(&self, event: &Event) -> Result<Vec<Event>, CoreError> {
        let EventPayload::ComponentTrigger {
            workflow_execution_id,
            node_key,
            ..
        } = &event.payload
        else {
            return Err(unexpected(event));
        };

        self.executions
            .update(workflow_execution_id, |execution| {
                if !execution.status.accepts_events() {
                    return Ok(Vec::new());
                }
                let Some(record) = execution
                    .node_executions
                    .iter_mut()
                    .find(|r| r.node_key() == node_key && r.state == NodeState::Idle)
                else {
                    debug!(%node_key, "No parked activation to trigger");
                    return Ok(Vec::new());
                };
                record.deferred = None;
                let record = record.clone();
                if execution.status == ExecutionStatus::Waiting {
                    execution.transition(ExecutionStatus::Running);
                }
                info!(%node_key, correlation_id = %record.correlation_id, "Re-activating parked node");
                Ok(vec![Event::new(
                    EventOrigin::Orchestrator,
                    record.correlation_id,
                    Some(CausationId::from(&event.event_id)),
                    EventPayload::ActivationRequest {
                        workflow_id: execution.workflow_id.clone(),
                        workflow_execution_id: workflow_execution_id.clone(),
                        node_key: node_key.clone(),
                        context: record.stage_context,
                    },
                )])
            })
            .await
    }

    /// Acknowledge a termination
    pub async fn on_terminated(&self, event: &Event) -> Result<Vec<Event>, CoreError> {
        info!(
            execution_id = %event.payload.execution_id(),
            correlation_id = %event.correlation_id,
            "Runtime confirmed termination"
        );
        Ok(Vec::new())
    }

    /// Mark the record at `index` DONE with `output` and emit activation
    /// requests for whatever becomes ready, caused by `cause`.
    fn advance(
        &self,
        execution: &mut WorkflowExecution,
        topology: &WorkflowTopology,
        index: usize,
        mut output: Context,
        cause: &Event,
    ) -> Vec<Event> {
        let node_key = execution.node_executions[index].node_key().to_string();
        output.set_state(&node_key, NodeState::Done);
        {
            let record = &mut execution.node_executions[index];
            record.stage_context = output.clone();
            record.set_state(NodeState::Done);
        }
        execution.context.set_state(&node_key, NodeState::Done);
        execution.context.variables.extend(output.variables.clone());
        if let Some(decision) = output.latest_decision(&node_key).cloned() {
            match execution.context.latest_decision_mut(&node_key) {
                Some(slot) => *slot = decision,
                None => execution.context.decisions.push(decision),
            }
        }
        debug!(%node_key, execution_id = %execution.workflow_execution_id, "Node done");

        let steps = match self.plan(topology, &node_key, &mut output, &mut execution.context) {
            Ok(steps) => steps,
            Err(PlanError { node_key, error }) => {
                warn!(%node_key, error = %error, "Decision could not be resolved, run failed");
                execution.fail(&node_key, error.to_string());
                return Vec::new();
            }
        };

        let mut events = Vec::new();
        let mut joins: Vec<Step> = Vec::new();
        for step in steps {
            let Some(next) = topology.node(&step.node_key) else {
                continue;
            };
            if next.node_type == WorkflowNodeType::Wait {
                if !joins.iter().any(|j| j.node_key == step.node_key) {
                    joins.push(step);
                }
                continue;
            }
            let stage = Context::for_next(&output, &step.parent, next, topology);
            events.push(self.activate(execution, topology, &step, next, stage, cause));
        }

        for step in self.pending_joins(execution, topology) {
            if !joins.iter().any(|j| j.node_key == step.node_key) {
                joins.push(step);
            }
        }
        for join in joins {
            if let Some(event) = self.try_join(execution, topology, &join, cause) {
                events.push(event);
            }
        }

        if execution.settle() {
            info!(execution_id = %execution.workflow_execution_id, "Workflow run completed");
        } else if execution.park() {
            info!(execution_id = %execution.workflow_execution_id, "Only deferred nodes left, run waiting");
        }
        events
    }

    /// Successors of `from`, with component-less DECISION and END nodes
    /// resolved in place on both the branch and run contexts
    fn plan(
        &self,
        topology: &WorkflowTopology,
        from: &str,
        branch: &mut Context,
        run: &mut Context,
    ) -> Result<Vec<Step>, PlanError> {
        let first = match topology.node(from) {
            Some(node) if node.node_type == WorkflowNodeType::Decision => {
                let chosen = match branch.latest_decision(from).map(|d| d.chosen()) {
                    Some(chosen) if !chosen.is_empty() => chosen.into_iter().map(str::to_string).collect(),
                    _ => self.choose(topology, node, branch).map_err(|error| PlanError {
                        node_key: from.to_string(),
                        error,
                    })?,
                };
                mark_chosen(branch, from, &chosen);
                mark_chosen(run, from, &chosen);
                chosen
            }
            _ => topology.children(from).to_vec(),
        };

        let mut queue: VecDeque<Step> = first
            .into_iter()
            .map(|node_key| Step {
                node_key,
                parent: from.to_string(),
            })
            .collect();
        let mut resolved: HashSet<String> = HashSet::new();
        let mut steps = Vec::new();

        while let Some(step) = queue.pop_front() {
            let Some(node) = topology.node(&step.node_key) else {
                continue;
            };
            let inline = !node.has_component()
                && matches!(node.node_type, WorkflowNodeType::Decision | WorkflowNodeType::End);
            if !inline {
                steps.push(step);
                continue;
            }

            branch.visit(&step.parent, node, topology);
            run.visit(&step.parent, node, topology);
            if node.node_type == WorkflowNodeType::Decision {
                if !resolved.insert(node.node_key.clone()) {
                    return Err(PlanError {
                        node_key: node.node_key.clone(),
                        error: CoreError::ValidationError(format!(
                            "decision {} loops back to itself without a task",
                            node.node_key
                        )),
                    });
                }
                let chosen = self.choose(topology, node, branch).map_err(|error| PlanError {
                    node_key: node.node_key.clone(),
                    error,
                })?;
                mark_chosen(branch, &node.node_key, &chosen);
                mark_chosen(run, &node.node_key, &chosen);
                queue.extend(chosen.into_iter().map(|node_key| Step {
                    node_key,
                    parent: node.node_key.clone(),
                }));
            }
            branch.set_state(&node.node_key, NodeState::Done);
            run.set_state(&node.node_key, NodeState::Done);
        }

        Ok(steps)
    }

    /// Options of a DECISION whose guard holds. Unguarded options always
    /// match; default-flow options are taken only when nothing else does.
    fn choose(
        &self,
        topology: &WorkflowTopology,
        decision: &WorkflowNode,
        branch: &Context,
    ) -> Result<Vec<String>, CoreError> {
        let data = branch.variables_value();
        let mut chosen = Vec::new();
        let mut defaults = Vec::new();

        for key in topology.children(&decision.node_key) {
            let Some(option) = topology.node(key) else {
                continue;
            };
            if option.default_flow {
                defaults.push(key.clone());
                continue;
            }
            let matched = match &option.condition {
                None => true,
                Some(condition) => self.evaluator.evaluate(condition, &data)?,
            };
            if matched {
                chosen.push(key.clone());
            }
        }

        if chosen.is_empty() {
            chosen = defaults;
        }
        if chosen.is_empty() {
            return Err(CoreError::ComponentExecutionFailure(format!(
                "no branch of {} matched",
                decision.node_key
            )));
        }
        debug!(decision = %decision.node_key, ?chosen, "Decision resolved");
        Ok(chosen)
    }

    /// Record a fresh IDLE node execution and build its activation request
    fn activate(
        &self,
        execution: &mut WorkflowExecution,
        topology: &WorkflowTopology,
        step: &Step,
        next: &WorkflowNode,
        stage: Context,
        cause: &Event,
    ) -> Event {
        let correlation_id = CorrelationId::generate();
        execution.context.visit(&step.parent, next, topology);
        execution.record(WorkflowNodeExecution::new(correlation_id.clone(), next.clone(), stage.clone()));
        debug!(node_key = %next.node_key, %correlation_id, "Activation requested");

        Event::new(
            EventOrigin::Orchestrator,
            correlation_id,
            Some(CausationId::from(&cause.event_id)),
            EventPayload::ActivationRequest {
                workflow_id: execution.workflow_id.clone(),
                workflow_execution_id: execution.workflow_execution_id.clone(),
                node_key: next.node_key.clone(),
                context: stage,
            },
        )
    }

    /// WAIT nodes with a predecessor that finished since their last activation
    fn pending_joins(&self, execution: &WorkflowExecution, topology: &WorkflowTopology) -> Vec<Step> {
        topology
            .keys()
            .filter_map(|key| topology.node(key))
            .filter(|node| node.node_type == WorkflowNodeType::Wait)
            .filter(|node| execution.open_execution_for(&node.node_key).is_none())
            .filter_map(|node| {
                let last_activation = execution.executions_of(&node.node_key).last().map(|r| r.created_date);
                topology
                    .predecessors(&node.node_key)
                    .into_iter()
                    .find(|pred| {
                        if execution.context.state_of(pred) != Some(NodeState::Done) {
                            return false;
                        }
                        match (last_activation, execution.last_done(pred)) {
                            (None, _) => true,
                            (Some(at), Some(done)) => done.completed_date.map_or(false, |c| c > at),
                            (Some(_), None) => false,
                        }
                    })
                    .map(|parent| Step {
                        node_key: node.node_key.clone(),
                        parent,
                    })
            })
            .collect()
    }

    /// Activate a join once every predecessor that can still arrive is DONE.
    ///
    /// A predecessor is awaited when it is DONE or reachable from an
    /// in-flight or FAILED node; only branches that were never taken drop
    /// out. An awaited predecessor that FAILED (or sits behind a failure)
    /// never becomes DONE, so the join stays closed. Outputs of the awaited
    /// predecessors are combined with the join's merge strategy in
    /// completion order.
    fn try_join(
        &self,
        execution: &mut WorkflowExecution,
        topology: &WorkflowTopology,
        join: &Step,
        cause: &Event,
    ) -> Option<Event> {
        if execution.open_execution_for(&join.node_key).is_some() {
            return None;
        }
        let next = topology.node(&join.node_key)?;
        let predecessors = topology.predecessors(&join.node_key);

        let sources: Vec<&str> = execution
            .context
            .in_flight()
            .into_iter()
            .chain(execution.context.failed())
            .filter(|key| *key != join.node_key)
            .collect();
        let live = topology.reachable_from(sources, Some(&join.node_key));

        let awaited: Vec<&String> = predecessors
            .iter()
            .filter(|p| live.contains(*p) || execution.context.state_of(p) == Some(NodeState::Done))
            .collect();
        if let Some(blocking) = awaited
            .iter()
            .find(|p| execution.context.state_of(p) != Some(NodeState::Done))
        {
            debug!(join = %join.node_key, waiting_on = %blocking, "Join waiting on predecessor");
            return None;
        }

        let mut outputs: Vec<_> = awaited
            .iter()
            .filter_map(|p| execution.last_done(p))
            .map(|r| (r.completed_date.unwrap_or(r.updated_date), r.stage_context.variables.clone()))
            .collect();
        outputs.sort_by_key(|(at, _)| *at);
        let merged = next
            .merge_strategy
            .unwrap_or_default()
            .combine(outputs.into_iter().map(|(_, vars)| vars).collect());

        let mut stage = Context::for_next(&execution.context, &join.parent, next, topology);
        if let Some(entry) = stage.graph_node_mut(&join.node_key) {
            entry.parents.extend(awaited.iter().map(|p| p.to_string()));
        }
        stage.variables = merged;
        info!(join = %join.node_key, arrivals = awaited.len(), "Join ready");

        let event = self.activate(execution, topology, join, next, stage, cause);
        if let Some(entry) = execution.context.graph_node_mut(&join.node_key) {
            entry.parents.extend(awaited.iter().map(|p| p.to_string()));
        }
        Some(event)
    }
}

fn mark_chosen(context: &mut Context, decision: &str, chosen: &[String]) {
    if let Some(record) = context.latest_decision_mut(decision) {
        for key in chosen {
            record.option_nodes.insert(key.clone(), true);
        }
    }
}

fn record_index(execution: &WorkflowExecution, event: &Event) -> Result<usize, CoreError> {
    execution
        .node_executions
        .iter()
        .position(|n| n.correlation_id == event.correlation_id)
        .ok_or_else(|| {
            CoreError::ProtocolViolation(format!(
                "no node execution for correlation {} in run {}",
                event.correlation_id, execution.workflow_execution_id
            ))
        })
}

fn unexpected(event: &Event) -> CoreError {
    CoreError::ProtocolViolation(format!("unexpected {} event {}", event.class(), event.event_id))
}

fn unknown_node(node_key: &str) -> CoreError {
    CoreError::ProtocolViolation(format!("node {} is not part of the workflow", node_key))
}
