//! Source process definitions

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::WorkflowId;

/// A source process definition and the workflow converted from it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    /// Process identifier
    pub process_id: String,

    /// Unique domain, shared with the converted workflow
    pub domain: String,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Source text of the definition
    #[serde(default)]
    pub definition: Option<String>,

    /// Workflow converted from this definition
    #[serde(default)]
    pub workflow_id: Option<WorkflowId>,
}

impl Process {
    /// New process for a source definition
    pub fn new(domain: impl Into<String>, definition: impl Into<String>) -> Self {
        Self {
            process_id: Uuid::new_v4().to_string(),
            domain: domain.into(),
            name: String::new(),
            definition: Some(definition.into()),
            workflow_id: None,
        }
    }

    /// Merge an incoming registration over this one; present fields win
    pub fn merge(&mut self, incoming: Process) {
        if !incoming.domain.is_empty() {
            self.domain = incoming.domain;
        }
        if !incoming.name.is_empty() {
            self.name = incoming.name;
        }
        if incoming.definition.is_some() {
            self.definition = incoming.definition;
        }
        if incoming.workflow_id.is_some() {
            self.workflow_id = incoming.workflow_id;
        }
    }
}
