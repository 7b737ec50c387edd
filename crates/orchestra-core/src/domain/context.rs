//! Per-step execution context
//!
//! A [`Context`] is the working snapshot handed to a component runtime: the
//! progress state of every graph node touched so far in the run, the pending
//! decisions, and the run variables flowing along the branch.

use crate::domain::workflow::{WorkflowNode, WorkflowNodeType, WorkflowTopology};
use crate::types::Variables;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

/// Progress state of a node within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeState {
    /// Known to the run but not started
    Idle,
    /// Invoked and awaiting its outcome
    Working,
    /// Finished successfully
    Done,
    /// Finished with a failure
    Failed,
}

impl NodeState {
    /// DONE or FAILED
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeState::Done | NodeState::Failed)
    }
}

/// Progress entry for one node key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowGraphNode {
    /// Node key
    pub node: String,
    /// Current state
    pub state: NodeState,
    /// Keys of the predecessors this node was reached from
    #[serde(default)]
    pub parents: IndexSet<String>,
}

/// Branch choice record for one DECISION node visit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDecision {
    /// Key of the DECISION node
    pub decision_node: String,
    /// Candidate child key mapped to whether it was chosen
    pub option_nodes: IndexMap<String, bool>,
}

impl WorkflowDecision {
    /// Keys of the chosen options, in declaration order
    pub fn chosen(&self) -> Vec<&str> {
        self.option_nodes
            .iter()
            .filter(|(_, chosen)| **chosen)
            .map(|(key, _)| key.as_str())
            .collect()
    }
}

/// How a JOIN node picks the variables that propagate past it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeStrategy {
    /// Take the most recently completed predecessor's output
    #[default]
    LastCompleted,
    /// Take the earliest completed predecessor's output
    FirstCompleted,
    /// Shallow-merge all outputs in completion order, later keys winning
    Merge,
}

impl MergeStrategy {
    /// Combine predecessor outputs ordered by completion time (oldest first)
    pub fn combine(self, outputs: Vec<Variables>) -> Variables {
        match self {
            MergeStrategy::LastCompleted => outputs.into_iter().last().unwrap_or_default(),
            MergeStrategy::FirstCompleted => outputs.into_iter().next().unwrap_or_default(),
            MergeStrategy::Merge => outputs.into_iter().fold(Variables::new(), |mut acc, next| {
                acc.extend(next);
                acc
            }),
        }
    }
}

/// Working snapshot handed to a component runtime
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    /// One entry per node touched so far
    #[serde(default)]
    pub graph_nodes: Vec<WorkflowGraphNode>,
    /// One entry per DECISION visit
    #[serde(default)]
    pub decisions: Vec<WorkflowDecision>,
    /// Variables flowing along this branch
    #[serde(default)]
    pub variables: Variables,
}

impl Context {
    /// Context for a start node of a fresh run
    pub fn initial(start: &WorkflowNode, variables: Variables) -> Self {
        Self {
            graph_nodes: vec![WorkflowGraphNode {
                node: start.node_key.clone(),
                state: NodeState::Idle,
                parents: IndexSet::new(),
            }],
            decisions: Vec::new(),
            variables,
        }
    }

    /// Build the context for visiting `next` after `last_executed`.
    ///
    /// An existing entry for `next` is reset to IDLE and its parents extended;
    /// otherwise a new entry is created. Visiting a DECISION appends a fresh
    /// decision record with every option unchosen.
    pub fn for_next(
        prior: &Context,
        last_executed: &str,
        next: &WorkflowNode,
        topology: &WorkflowTopology,
    ) -> Self {
        let mut context = prior.clone();
        context.visit(last_executed, next, topology);
        context
    }

    /// In-place form of [`Context::for_next`]
    pub fn visit(&mut self, last_executed: &str, next: &WorkflowNode, topology: &WorkflowTopology) {
        match self.graph_node_mut(&next.node_key) {
            Some(entry) => {
                entry.state = NodeState::Idle;
                entry.parents.insert(last_executed.to_string());
            }
            None => {
                let mut parents = IndexSet::new();
                parents.insert(last_executed.to_string());
                self.graph_nodes.push(WorkflowGraphNode {
                    node: next.node_key.clone(),
                    state: NodeState::Idle,
                    parents,
                });
            }
        }

        if next.node_type == WorkflowNodeType::Decision {
            self.decisions.push(WorkflowDecision {
                decision_node: next.node_key.clone(),
                option_nodes: topology
                    .children(&next.node_key)
                    .iter()
                    .map(|child| (child.clone(), false))
                    .collect(),
            });
        }
    }

    /// Entry for a node key
    pub fn graph_node(&self, key: &str) -> Option<&WorkflowGraphNode> {
        self.graph_nodes.iter().find(|n| n.node == key)
    }

    /// Mutable entry for a node key
    pub fn graph_node_mut(&mut self, key: &str) -> Option<&mut WorkflowGraphNode> {
        self.graph_nodes.iter_mut().find(|n| n.node == key)
    }

    /// State of a node key, if touched
    pub fn state_of(&self, key: &str) -> Option<NodeState> {
        self.graph_node(key).map(|n| n.state)
    }

    /// Set the state of a node key, creating an entry without parents if absent
    pub fn set_state(&mut self, key: &str, state: NodeState) {
        match self.graph_node_mut(key) {
            Some(entry) => entry.state = state,
            None => self.graph_nodes.push(WorkflowGraphNode {
                node: key.to_string(),
                state,
                parents: IndexSet::new(),
            }),
        }
    }

    /// Keys of nodes that are IDLE or WORKING
    pub fn in_flight(&self) -> Vec<&str> {
        self.graph_nodes
            .iter()
            .filter(|n| !n.state.is_terminal())
            .map(|n| n.node.as_str())
            .collect()
    }

    /// Whether any node is FAILED
    pub fn has_failures(&self) -> bool {
        self.graph_nodes.iter().any(|n| n.state == NodeState::Failed)
    }

    /// Keys of nodes that are FAILED
    pub fn failed(&self) -> Vec<&str> {
        self.graph_nodes
            .iter()
            .filter(|n| n.state == NodeState::Failed)
            .map(|n| n.node.as_str())
            .collect()
    }

    /// Most recent decision record for a DECISION node
    pub fn latest_decision_mut(&mut self, key: &str) -> Option<&mut WorkflowDecision> {
        self.decisions.iter_mut().rev().find(|d| d.decision_node == key)
    }

    /// Most recent decision record for a DECISION node
    pub fn latest_decision(&self, key: &str) -> Option<&WorkflowDecision> {
        self.decisions.iter().rev().find(|d| d.decision_node == key)
    }

    /// Variables as a JSON value for expression evaluation
    pub fn variables_value(&self) -> serde_json::Value {
        serde_json::Value::Object(self.variables.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::workflow::{Workflow, WorkflowNode, WorkflowNodeType};
    use serde_json::json;

    fn decision_topology() -> (Workflow, WorkflowTopology) {
        let start = WorkflowNode::new(WorkflowNodeType::Start, "s").into_ref();
        let gate = WorkflowNode::new(WorkflowNodeType::Decision, "d").into_ref();
        let a = WorkflowNode::new(WorkflowNodeType::Task, "a").into_ref();
        let b = WorkflowNode::new(WorkflowNodeType::Task, "b").into_ref();
        WorkflowNode::link(&start, &gate);
        WorkflowNode::link(&gate, &a);
        WorkflowNode::link(&gate, &b);
        let workflow = Workflow::new("ctx.test", "ctx").with_roots(vec![start]);
        let topology = workflow.topology();
        (workflow, topology)
    }

    #[test]
    fn test_initial_context() {
        let start = WorkflowNode::new(WorkflowNodeType::Start, "s");
        let mut vars = Variables::new();
        vars.insert("x".to_string(), json!(1));

        let context = Context::initial(&start, vars);

        assert_eq!(context.graph_nodes.len(), 1);
        assert_eq!(context.state_of("start_s"), Some(NodeState::Idle));
        assert!(context.graph_nodes[0].parents.is_empty());
        assert_eq!(context.variables["x"], json!(1));
    }

    #[test]
    fn test_for_next_creates_entry_and_decision() {
        let (_workflow, topology) = decision_topology();
        let start = topology.node("start_s").unwrap().clone();
        let gate = topology.node("decision_d").unwrap().clone();

        let mut prior = Context::initial(&start, Variables::new());
        prior.set_state("start_s", NodeState::Done);

        let context = Context::for_next(&prior, "start_s", &gate, &topology);

        let entry = context.graph_node("decision_d").unwrap();
        assert_eq!(entry.state, NodeState::Idle);
        assert_eq!(entry.parents.iter().collect::<Vec<_>>(), vec!["start_s"]);
        let decision = context.latest_decision("decision_d").unwrap();
        assert_eq!(
            decision.option_nodes.keys().collect::<Vec<_>>(),
            vec!["task_a", "task_b"]
        );
        assert!(decision.option_nodes.values().all(|chosen| !chosen));
        // prior untouched
        assert!(prior.graph_node("decision_d").is_none());
    }

    #[test]
    fn test_for_next_resets_existing_entry_and_extends_parents() {
        let (_workflow, topology) = decision_topology();
        let a = topology.node("task_a").unwrap().clone();

        let mut prior = Context::default();
        prior.graph_nodes.push(WorkflowGraphNode {
            node: "task_a".to_string(),
            state: NodeState::Done,
            parents: ["decision_d".to_string()].into_iter().collect(),
        });

        let context = Context::for_next(&prior, "task_b", &a, &topology);

        let entry = context.graph_node("task_a").unwrap();
        assert_eq!(entry.state, NodeState::Idle);
        assert_eq!(
            entry.parents.iter().collect::<Vec<_>>(),
            vec!["decision_d", "task_b"]
        );
        assert_eq!(context.graph_nodes.len(), 1);
    }

    #[test]
    fn test_merge_strategies() {
        let first: Variables = serde_json::from_value(json!({"a": 1, "shared": "first"})).unwrap();
        let second: Variables = serde_json::from_value(json!({"b": 2, "shared": "second"})).unwrap();
        let outputs = vec![first.clone(), second.clone()];

        assert_eq!(MergeStrategy::LastCompleted.combine(outputs.clone()), second);
        assert_eq!(MergeStrategy::FirstCompleted.combine(outputs.clone()), first);

        let merged = MergeStrategy::Merge.combine(outputs);
        assert_eq!(merged["a"], json!(1));
        assert_eq!(merged["b"], json!(2));
        assert_eq!(merged["shared"], json!("second"));
        assert!(MergeStrategy::default().combine(Vec::new()).is_empty());
    }

    #[test]
    fn test_in_flight_and_failures() {
        let mut context = Context::default();
        context.set_state("a", NodeState::Done);
        context.set_state("b", NodeState::Working);
        context.set_state("c", NodeState::Idle);

        assert_eq!(context.in_flight(), vec!["b", "c"]);
        assert!(!context.has_failures());

        context.set_state("b", NodeState::Failed);
        assert!(context.has_failures());
        assert_eq!(context.in_flight(), vec!["c"]);
    }
}
