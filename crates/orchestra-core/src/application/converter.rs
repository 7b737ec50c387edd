//! Process converters
//!
//! A converter turns an external process definition into an inflated
//! [`Workflow`]. The bundled [`YamlWorkflowConverter`] reads a flat node list:
//!
//! ```yaml
//! domain: orders.fulfil
//! name: Fulfil order
//! nodes:
//!   - id: begin
//!     type: start
//!     next: [route]
//!   - id: route
//!     type: decision
//!     next: [ship, refuse]
//!   - id: ship
//!     type: task
//!     component: std.echo
//!     config: { output: { shipped: true } }
//!     condition: "amount < `100`"
//!     next: [done]
//!   - id: refuse
//!     type: task
//!     component: std.fail
//!     config: { message: too expensive }
//!     default: true
//!   - id: done
//!     type: end
//! ```

use indexmap::IndexMap;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::PoisonError;

use crate::domain::condition::ConditionExpression;
use crate::domain::context::MergeStrategy;
use crate::domain::workflow::{ComponentConfig, NodeRef, Workflow, WorkflowNode, WorkflowNodeType};
use crate::CoreError;

/// Converts process definitions into workflows
pub trait ProcessConverter: Send + Sync {
    /// Build an inflated workflow from a definition
    fn convert(&self, definition: &str) -> Result<Workflow, CoreError>;

    /// Apply a patch keyed by node key to a converted workflow
    fn annotate(&self, workflow: &mut Workflow, patch: &str) -> Result<(), CoreError>;
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Definition {
    domain: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default = "default_active")]
    active: bool,
    nodes: Vec<NodeDefinition>,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NodeDefinition {
    id: String,
    #[serde(rename = "type")]
    node_type: WorkflowNodeType,
    #[serde(default)]
    component: Option<String>,
    #[serde(default)]
    config: ComponentConfig,
    #[serde(default)]
    next: Vec<String>,
    #[serde(default)]
    condition: Option<Guard>,
    #[serde(default)]
    default: bool,
    #[serde(default)]
    merge: Option<MergeStrategy>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Guard {
    Expression(String),
    Full(ConditionExpression),
}

impl From<Guard> for ConditionExpression {
    fn from(guard: Guard) -> Self {
        match guard {
            Guard::Expression(expression) => ConditionExpression::jmespath(expression),
            Guard::Full(condition) => condition,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct NodePatch {
    #[serde(default)]
    component: Option<String>,
    #[serde(default, alias = "componentConfig")]
    config: Option<ComponentConfig>,
}

/// YAML node-list converter
#[derive(Debug, Default, Clone, Copy)]
pub struct YamlWorkflowConverter;

impl YamlWorkflowConverter {
    /// New converter
    pub fn new() -> Self {
        Self
    }
}

impl ProcessConverter for YamlWorkflowConverter {
    fn convert(&self, definition: &str) -> Result<Workflow, CoreError> {
        let definition: Definition = serde_yaml::from_str(definition)?;
        if definition.nodes.is_empty() {
            return Err(CoreError::ValidationError(format!(
                "process {} declares no nodes",
                definition.domain
            )));
        }

        let mut handles: IndexMap<String, NodeRef> = IndexMap::with_capacity(definition.nodes.len());
        let mut edges: Vec<(String, Vec<String>)> = Vec::with_capacity(definition.nodes.len());
        for def in definition.nodes {
            if handles.contains_key(&def.id) {
                return Err(CoreError::ValidationError(format!("duplicate node id {}", def.id)));
            }
            let mut node = WorkflowNode::new(def.node_type, &def.id);
            if let Some(component) = def.component {
                node = node.with_component(component, def.config);
            }
            if let Some(guard) = def.condition {
                node = node.with_condition(guard.into());
            }
            if def.default {
                node = node.as_default_flow();
            }
            if let Some(strategy) = def.merge {
                node = node.with_merge_strategy(strategy);
            }
            edges.push((def.id.clone(), def.next));
            handles.insert(def.id, node.into_ref());
        }

        let mut referenced = HashSet::new();
        for (id, next) in &edges {
            let parent = &handles[id.as_str()];
            for child_id in next {
                let child = handles.get(child_id).ok_or_else(|| {
                    CoreError::ValidationError(format!("node {} points to unknown node {}", id, child_id))
                })?;
                WorkflowNode::link(parent, child);
                referenced.insert(child_id.as_str());
            }
        }

        // START nodes first, then anything nothing points at.
        let mut roots: Vec<NodeRef> = Vec::new();
        for (id, handle) in &handles {
            let is_start = handle.read().unwrap_or_else(PoisonError::into_inner).node_type == WorkflowNodeType::Start;
            if is_start || !referenced.contains(id.as_str()) {
                roots.push(handle.clone());
            }
        }

        let mut workflow = Workflow::new(definition.domain, definition.name).with_roots(roots);
        workflow.description = definition.description;
        workflow.version = definition.version;
        workflow.active = definition.active;
        workflow.validate()?;
        Ok(workflow)
    }

    fn annotate(&self, workflow: &mut Workflow, patch: &str) -> Result<(), CoreError> {
        let patch: IndexMap<String, NodePatch> = serde_yaml::from_str(patch)?;
        let topology = workflow.topology();
        if let Some(unknown) = patch.keys().find(|key| topology.node(key).is_none()) {
            return Err(CoreError::ValidationError(format!(
                "patch targets unknown node {}",
                unknown
            )));
        }

        for (key, node_patch) in patch {
            workflow.update_node(&key, |node| {
                if let Some(component) = node_patch.component {
                    node.component = Some(component);
                }
                if let Some(config) = node_patch.config {
                    node.component_config = config;
                }
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ORDER: &str = r#"
domain: orders.fulfil
name: Fulfil order
version: "2"
nodes:
  - id: begin
    type: start
    next: [route]
  - id: route
    type: decision
    next: [ship, refuse]
  - id: ship
    type: task
    component: std.echo
    config:
      output: { shipped: true }
    condition: "amount < `100`"
    next: [done]
  - id: refuse
    type: task
    component: std.fail
    default: true
    next: [done]
  - id: done
    type: end
    merge: MERGE
"#;

    #[test]
    fn test_convert_builds_graph() {
        let workflow = YamlWorkflowConverter.convert(ORDER).unwrap();
        assert!(workflow.is_inflated());
        assert_eq!(workflow.domain, "orders.fulfil");
        assert_eq!(workflow.version.as_deref(), Some("2"));

        let topology = workflow.topology();
        assert_eq!(topology.roots(), &["start_begin".to_string()]);
        assert_eq!(topology.children("decision_route"), &["task_ship".to_string(), "task_refuse".to_string()]);
        assert_eq!(topology.predecessors("end_done"), vec!["task_ship", "task_refuse"]);

        let ship = topology.node("task_ship").unwrap();
        assert_eq!(ship.component.as_deref(), Some("std.echo"));
        assert_eq!(ship.component_config["output"], json!({"shipped": true}));
        assert_eq!(ship.condition.as_ref().unwrap().expression, "amount < `100`");
        assert!(topology.node("task_refuse").unwrap().default_flow);
        assert_eq!(topology.node("end_done").unwrap().merge_strategy, Some(MergeStrategy::Merge));
    }

    #[test]
    fn test_convert_rejects_bad_references() {
        let unknown = "domain: x\nnodes:\n  - {id: a, type: start, next: [nowhere]}\n";
        assert!(matches!(
            YamlWorkflowConverter.convert(unknown),
            Err(CoreError::ValidationError(_))
        ));

        let duplicate = "domain: x\nnodes:\n  - {id: a, type: start}\n  - {id: a, type: end}\n";
        assert!(matches!(
            YamlWorkflowConverter.convert(duplicate),
            Err(CoreError::ValidationError(_))
        ));

        let no_start = "domain: x\nnodes:\n  - {id: a, type: task}\n";
        assert!(matches!(
            YamlWorkflowConverter.convert(no_start),
            Err(CoreError::ValidationError(_))
        ));
    }

    #[test]
    fn test_malformed_yaml_is_a_serialization_error() {
        let result = YamlWorkflowConverter.convert("domain: [unclosed");
        assert!(matches!(result, Err(CoreError::SerializationError(_))));
    }

    #[test]
    fn test_annotate_patches_component_and_config() {
        let mut workflow = YamlWorkflowConverter.convert(ORDER).unwrap();
        let patch = r#"
task_refuse:
  component: std.echo
  config:
    output: { refused: true }
"#;
        YamlWorkflowConverter.annotate(&mut workflow, patch).unwrap();

        let refuse = workflow.topology().node("task_refuse").cloned().unwrap();
        assert_eq!(refuse.component.as_deref(), Some("std.echo"));
        assert_eq!(refuse.component_config["output"], json!({"refused": true}));

        let err = YamlWorkflowConverter
            .annotate(&mut workflow, "task_missing: { component: std.echo }")
            .unwrap_err();
        assert!(matches!(err, CoreError::ValidationError(_)));
    }
}
