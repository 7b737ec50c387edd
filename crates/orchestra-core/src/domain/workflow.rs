//! Workflow definition domain models
//!
//! A [`Workflow`] holds its node graph in one of two forms. Inflated, the
//! graph is a list of root [`NodeRef`] handles whose children are resolved
//! handles (cycles allowed). Flattened, it is an id-indexed node map plus the
//! root id set, which is what gets persisted. [`Workflow::flatten`] and
//! [`Workflow::inflate`] convert between the two using [`crate::domain::graph`].

use crate::domain::condition::ConditionExpression;
use crate::domain::context::MergeStrategy;
use crate::domain::graph::{self, NodeAdapter};
use crate::types::WorkflowId;
use crate::CoreError;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize, Serializer};
use std::borrow::Cow;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

/// Opaque component configuration attached to a node
pub type ComponentConfig = serde_json::Map<String, serde_json::Value>;

/// Shared handle to a node of an inflated graph
pub type NodeRef = Arc<RwLock<WorkflowNode>>;

/// Kind of a workflow node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkflowNodeType {
    /// Entry point of a run
    #[serde(alias = "start")]
    Start,
    /// Terminal node
    #[serde(alias = "end")]
    End,
    /// Unit of work executed by a component
    #[serde(alias = "task")]
    Task,
    /// Branch point; children are the options
    #[serde(alias = "decision")]
    Decision,
    /// Join / wait point; awaits its predecessors
    #[serde(alias = "wait", alias = "join", alias = "JOIN")]
    Wait,
}

impl WorkflowNodeType {
    /// Lower-case element type name used in node keys
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowNodeType::Start => "start",
            WorkflowNodeType::End => "end",
            WorkflowNodeType::Task => "task",
            WorkflowNodeType::Decision => "decision",
            WorkflowNodeType::Wait => "wait",
        }
    }
}

/// A node of a workflow graph
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowNode {
    /// Unique node id (graph storage key)
    pub node_id: String,

    /// Stable key derived from the source element type and id
    pub node_key: String,

    /// Node kind
    #[serde(rename = "type")]
    pub node_type: WorkflowNodeType,

    /// Domain of the component executing this node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,

    /// Component configuration
    #[serde(default)]
    pub component_config: ComponentConfig,

    /// Guard evaluated when this node is an option of a DECISION
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionExpression>,

    /// Taken when no guarded option of the parent DECISION matches
    #[serde(default)]
    pub default_flow: bool,

    /// Payload selection when this node joins several branches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_strategy: Option<MergeStrategy>,

    /// Ids of the children (persisted form)
    #[serde(default)]
    pub children_ids: Vec<String>,

    #[serde(skip)]
    children: Vec<NodeRef>,
}

fn read(node: &NodeRef) -> RwLockReadGuard<'_, WorkflowNode> {
    node.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(node: &NodeRef) -> RwLockWriteGuard<'_, WorkflowNode> {
    node.write().unwrap_or_else(PoisonError::into_inner)
}

impl WorkflowNode {
    /// Create a node for a source element
    pub fn new(node_type: WorkflowNodeType, element_id: &str) -> Self {
        Self {
            node_id: Uuid::new_v4().to_string(),
            node_key: Self::derive_key(node_type.as_str(), element_id),
            node_type,
            component: None,
            component_config: ComponentConfig::new(),
            condition: None,
            default_flow: false,
            merge_strategy: None,
            children_ids: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Stable node key for a source element
    pub fn derive_key(element_type: &str, element_id: &str) -> String {
        format!("{}_{}", element_type, element_id).to_lowercase()
    }

    /// Attach a component and its configuration
    pub fn with_component(mut self, component: impl Into<String>, config: ComponentConfig) -> Self {
        self.component = Some(component.into());
        self.component_config = config;
        self
    }

    /// Attach a branch guard
    pub fn with_condition(mut self, condition: ConditionExpression) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Mark as the default option of its DECISION
    pub fn as_default_flow(mut self) -> Self {
        self.default_flow = true;
        self
    }

    /// Set the join merge strategy
    pub fn with_merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.merge_strategy = Some(strategy);
        self
    }

    /// Wrap into a shared handle
    pub fn into_ref(self) -> NodeRef {
        Arc::new(RwLock::new(self))
    }

    /// Append `child` to the children of `parent`
    pub fn link(parent: &NodeRef, child: &NodeRef) {
        write(parent).children.push(child.clone());
    }

    /// Resolved child handles of an inflated node
    pub fn children(&self) -> &[NodeRef] {
        &self.children
    }

    /// Whether a component executes this node
    pub fn has_component(&self) -> bool {
        self.component.as_deref().is_some_and(|c| !c.is_empty())
    }

    fn detached_copy(&self) -> WorkflowNode {
        WorkflowNode {
            node_id: self.node_id.clone(),
            node_key: self.node_key.clone(),
            node_type: self.node_type,
            component: self.component.clone(),
            component_config: self.component_config.clone(),
            condition: self.condition.clone(),
            default_flow: self.default_flow,
            merge_strategy: self.merge_strategy,
            children_ids: self.children_ids.clone(),
            children: Vec::new(),
        }
    }
}

impl PartialEq for WorkflowNode {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id
            && self.node_key == other.node_key
            && self.node_type == other.node_type
            && self.component == other.component
            && self.component_config == other.component_config
            && self.condition == other.condition
            && self.default_flow == other.default_flow
            && self.merge_strategy == other.merge_strategy
            && self.children_ids == other.children_ids
    }
}

// Children are printed by id only; resolved handles may form cycles.
impl fmt::Debug for WorkflowNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowNode")
            .field("node_id", &self.node_id)
            .field("node_key", &self.node_key)
            .field("node_type", &self.node_type)
            .field("component", &self.component)
            .field("children_ids", &self.children_ids)
            .field("resolved_children", &self.children.len())
            .finish()
    }
}

/// Graph codec adapter for [`NodeRef`] handles keyed by `node_id`
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkflowNodeAdapter;

impl NodeAdapter<NodeRef> for WorkflowNodeAdapter {
    type Id = String;

    fn id(&self, node: &NodeRef) -> String {
        read(node).node_id.clone()
    }

    fn children(&self, node: &NodeRef) -> Vec<NodeRef> {
        read(node).children.clone()
    }

    fn set_children(&self, node: &NodeRef, children: Vec<NodeRef>) {
        write(node).children = children;
    }

    fn children_ids(&self, node: &NodeRef) -> Vec<String> {
        read(node).children_ids.clone()
    }

    fn set_children_ids(&self, node: &NodeRef, ids: Vec<String>) {
        write(node).children_ids = ids;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum GraphForm {
    Inflated,
    #[default]
    Flattened,
}

/// A named, versioned, domain-scoped workflow definition
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// Generated identifier
    pub workflow_id: WorkflowId,

    /// Unique, human-addressable key
    pub domain: String,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Description
    #[serde(default)]
    pub description: Option<String>,

    /// Version label
    #[serde(default)]
    pub version: Option<String>,

    /// Whether new runs may be started
    #[serde(default = "default_active")]
    pub active: bool,

    #[serde(default)]
    nodes: IndexMap<String, WorkflowNode>,

    #[serde(default)]
    root_ids: IndexSet<String>,

    #[serde(skip)]
    roots: Vec<NodeRef>,

    #[serde(skip)]
    form: GraphForm,
}

fn default_active() -> bool {
    true
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkflowRecord<'a> {
    workflow_id: &'a WorkflowId,
    domain: &'a str,
    name: &'a str,
    description: &'a Option<String>,
    version: &'a Option<String>,
    active: bool,
    nodes: Cow<'a, IndexMap<String, WorkflowNode>>,
    root_ids: Cow<'a, IndexSet<String>>,
}

// Always persisted in flattened form, whichever form is authoritative.
impl Serialize for Workflow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let (nodes, root_ids) = match self.form {
            GraphForm::Flattened => (Cow::Borrowed(&self.nodes), Cow::Borrowed(&self.root_ids)),
            GraphForm::Inflated => {
                let (nodes, root_ids) = self.snapshot();
                (Cow::Owned(nodes), Cow::Owned(root_ids))
            }
        };
        WorkflowRecord {
            workflow_id: &self.workflow_id,
            domain: &self.domain,
            name: &self.name,
            description: &self.description,
            version: &self.version,
            active: self.active,
            nodes,
            root_ids,
        }
        .serialize(serializer)
    }
}

impl Workflow {
    /// Create an empty workflow with a generated id
    pub fn new(domain: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            workflow_id: WorkflowId::generate(),
            domain: domain.into(),
            name: name.into(),
            description: None,
            version: None,
            active: true,
            nodes: IndexMap::new(),
            root_ids: IndexSet::new(),
            roots: Vec::new(),
            form: GraphForm::Flattened,
        }
    }

    /// Replace the graph with inflated roots
    pub fn with_roots(mut self, roots: Vec<NodeRef>) -> Self {
        self.set_roots(roots);
        self
    }

    /// Replace the graph with inflated roots
    pub fn set_roots(&mut self, roots: Vec<NodeRef>) {
        self.release();
        self.nodes.clear();
        self.root_ids.clear();
        self.roots = roots;
        self.form = GraphForm::Inflated;
    }

    /// Whether the inflated form is authoritative
    pub fn is_inflated(&self) -> bool {
        self.form == GraphForm::Inflated
    }

    /// Root handles (empty while flattened)
    pub fn roots(&self) -> &[NodeRef] {
        &self.roots
    }

    /// Id-indexed nodes (empty while inflated)
    pub fn nodes(&self) -> &IndexMap<String, WorkflowNode> {
        &self.nodes
    }

    /// Root ids (empty while inflated)
    pub fn root_ids(&self) -> &IndexSet<String> {
        &self.root_ids
    }

    /// Whether the workflow carries any graph
    pub fn has_graph(&self) -> bool {
        match self.form {
            GraphForm::Inflated => !self.roots.is_empty(),
            GraphForm::Flattened => !self.nodes.is_empty(),
        }
    }

    /// Convert to the flattened form. No-op if already flattened.
    pub fn flatten(&mut self) {
        if self.form == GraphForm::Flattened {
            return;
        }
        let adapter = WorkflowNodeAdapter;
        let (handles, root_ids) = graph::flatten(&self.roots, &adapter);
        self.nodes = handles
            .iter()
            .map(|(id, handle)| (id.clone(), read(handle).detached_copy()))
            .collect();
        self.root_ids = root_ids;
        graph::detach(&self.roots, &adapter);
        self.roots.clear();
        self.form = GraphForm::Flattened;
    }

    /// Convert to the inflated form. No-op if already inflated.
    pub fn inflate(&mut self) {
        if self.form == GraphForm::Inflated {
            return;
        }
        let handles: IndexMap<String, NodeRef> = std::mem::take(&mut self.nodes)
            .into_iter()
            .map(|(id, node)| (id, node.into_ref()))
            .collect();
        self.roots = graph::inflate(&handles, self.root_ids.iter(), &WorkflowNodeAdapter);
        self.root_ids.clear();
        self.form = GraphForm::Inflated;
    }

    /// Merge an incoming update over this workflow.
    ///
    /// Non-empty fields of `incoming` win; the graph is replaced wholesale
    /// when `incoming` carries one. The workflow id is kept.
    pub fn merge(&mut self, mut incoming: Workflow) {
        if !incoming.domain.is_empty() {
            self.domain = std::mem::take(&mut incoming.domain);
        }
        if !incoming.name.is_empty() {
            self.name = std::mem::take(&mut incoming.name);
        }
        if incoming.description.is_some() {
            self.description = incoming.description.take();
        }
        if incoming.version.is_some() {
            self.version = incoming.version.take();
        }
        self.active = incoming.active;

        if incoming.has_graph() {
            self.release();
            std::mem::swap(&mut self.roots, &mut incoming.roots);
            std::mem::swap(&mut self.nodes, &mut incoming.nodes);
            std::mem::swap(&mut self.root_ids, &mut incoming.root_ids);
            std::mem::swap(&mut self.form, &mut incoming.form);
        }
    }

    /// Key-indexed read-only view of the graph, from either form
    pub fn topology(&self) -> WorkflowTopology {
        let (nodes, root_ids) = self.snapshot();
        WorkflowTopology::from_flattened(&nodes, &root_ids)
    }

    /// Apply `change` to the node with `key`, inflating first.
    /// Returns whether such a node exists.
    pub fn update_node<F>(&mut self, key: &str, change: F) -> bool
    where
        F: FnOnce(&mut WorkflowNode),
    {
        self.inflate();
        let handle = graph::walk(&self.roots, &WorkflowNodeAdapter)
            .into_values()
            .find(|handle| read(handle).node_key == key);
        match handle {
            Some(handle) => {
                change(&mut write(&handle));
                true
            }
            None => false,
        }
    }

    /// Check structural invariants
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.domain.trim().is_empty() {
            return Err(CoreError::ValidationError(
                "Workflow domain must not be empty".to_string(),
            ));
        }

        let (nodes, root_ids) = self.snapshot();
        let topology = WorkflowTopology::from_flattened(&nodes, &root_ids);
        if topology.len() != nodes.len() {
            return Err(CoreError::ValidationError(format!(
                "Workflow {} has duplicate node keys",
                self.domain
            )));
        }

        let starts: Vec<&str> = topology
            .start_nodes()
            .iter()
            .map(|n| n.node_key.as_str())
            .collect();
        if starts.is_empty() {
            return Err(CoreError::ValidationError(format!(
                "Workflow {} has no START node",
                self.domain
            )));
        }

        let reachable = topology.reachable_from(starts, None);
        if let Some(orphan) = topology.keys().find(|key| !reachable.contains(*key)) {
            return Err(CoreError::ValidationError(format!(
                "Node {} is not reachable from a START node",
                orphan
            )));
        }

        Ok(())
    }

    fn snapshot(&self) -> (IndexMap<String, WorkflowNode>, IndexSet<String>) {
        match self.form {
            GraphForm::Flattened => (self.nodes.clone(), self.root_ids.clone()),
            GraphForm::Inflated => {
                let reached = graph::walk(&self.roots, &WorkflowNodeAdapter);
                let nodes = reached
                    .iter()
                    .map(|(id, handle)| {
                        let (mut node, children) = {
                            let guard = read(handle);
                            (guard.detached_copy(), guard.children.clone())
                        };
                        node.children_ids = children.iter().map(|c| read(c).node_id.clone()).collect();
                        (id.clone(), node)
                    })
                    .collect();
                let root_ids = self.roots.iter().map(|r| read(r).node_id.clone()).collect();
                (nodes, root_ids)
            }
        }
    }

    fn release(&mut self) {
        if self.form == GraphForm::Inflated {
            graph::detach(&self.roots, &WorkflowNodeAdapter);
        }
    }
}

impl Clone for Workflow {
    fn clone(&self) -> Self {
        let (nodes, root_ids) = self.snapshot();
        let mut copy = Workflow {
            workflow_id: self.workflow_id.clone(),
            domain: self.domain.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            version: self.version.clone(),
            active: self.active,
            nodes,
            root_ids,
            roots: Vec::new(),
            form: GraphForm::Flattened,
        };
        if self.is_inflated() {
            copy.inflate();
        }
        copy
    }
}

// Dropping an inflated workflow detaches its handles so cycles are freed.
impl Drop for Workflow {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("workflow_id", &self.workflow_id)
            .field("domain", &self.domain)
            .field("name", &self.name)
            .field("version", &self.version)
            .field("active", &self.active)
            .field("form", &self.form)
            .field("nodes", &self.nodes.len())
            .field("roots", &self.roots.len().max(self.root_ids.len()))
            .finish()
    }
}

/// Key-indexed snapshot of a workflow graph used by the orchestrator
#[derive(Debug, Clone, Default)]
pub struct WorkflowTopology {
    nodes: IndexMap<String, WorkflowNode>,
    children: IndexMap<String, Vec<String>>,
    roots: Vec<String>,
}

impl WorkflowTopology {
    fn from_flattened(nodes: &IndexMap<String, WorkflowNode>, root_ids: &IndexSet<String>) -> Self {
        let key_of = |id: &String| nodes.get(id).map(|n| n.node_key.clone());

        let mut topology = WorkflowTopology::default();
        for node in nodes.values() {
            let child_keys = node.children_ids.iter().filter_map(key_of).collect();
            topology.children.insert(node.node_key.clone(), child_keys);
            topology.nodes.insert(node.node_key.clone(), node.clone());
        }
        topology.roots = root_ids.iter().filter_map(key_of).collect();
        topology
    }

    /// Node by key
    pub fn node(&self, key: &str) -> Option<&WorkflowNode> {
        self.nodes.get(key)
    }

    /// Child keys of a node, in order
    pub fn children(&self, key: &str) -> &[String] {
        self.children.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Keys of nodes listing `key` as a child, in graph order
    pub fn predecessors(&self, key: &str) -> Vec<String> {
        self.children
            .iter()
            .filter(|(_, children)| children.iter().any(|c| c == key))
            .map(|(parent, _)| parent.clone())
            .collect()
    }

    /// START nodes, in graph order
    pub fn start_nodes(&self) -> Vec<&WorkflowNode> {
        self.nodes
            .values()
            .filter(|n| n.node_type == WorkflowNodeType::Start)
            .collect()
    }

    /// Root keys
    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    /// Every key, in graph order
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.nodes.keys()
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether there are no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Keys reachable from `sources` (sources included), never entering `avoid`
    pub fn reachable_from<'a, I>(&self, sources: I, avoid: Option<&str>) -> HashSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = sources
            .into_iter()
            .filter(|key| Some(*key) != avoid)
            .map(str::to_string)
            .collect();

        while let Some(key) = queue.pop_front() {
            if !seen.insert(key.clone()) {
                continue;
            }
            for child in self.children(&key) {
                if Some(child.as_str()) != avoid && !seen.contains(child) {
                    queue.push_back(child.clone());
                }
            }
        }

        seen
    }
}
