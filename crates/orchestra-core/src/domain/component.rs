//! Component catalogue entries

use serde::{Deserialize, Serialize};

/// Who may invoke a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Actor {
    /// Automated, system-driven steps
    System,
    /// A person completing a task
    Human,
    /// An automated agent acting on behalf of a person
    Agent,
}

/// Where a component's runtime lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderKind {
    /// In-process factory from the runtime registry
    #[default]
    Local,
    /// Out-of-process worker reached through component events
    Remote,
}

/// Registry entry describing an executable unit available to node authors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowComponent {
    /// Component identifier
    pub component_id: String,

    /// Unique domain referenced by nodes
    pub domain: String,

    /// Description
    #[serde(default)]
    pub description: Option<String>,

    /// Allowed invokers
    #[serde(default)]
    pub actors: Vec<Actor>,

    /// Runtime provider
    #[serde(default)]
    pub provider: ProviderKind,
}

impl WorkflowComponent {
    /// New local component invoked by the system
    pub fn new(domain: impl Into<String>) -> Self {
        let domain = domain.into();
        Self {
            component_id: domain.clone(),
            domain,
            description: None,
            actors: vec![Actor::System],
            provider: ProviderKind::Local,
        }
    }

    /// Same component, served by a remote provider
    pub fn remote(mut self) -> Self {
        self.provider = ProviderKind::Remote;
        self
    }

    /// Same component, with a description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Merge an incoming registration. Present fields win; actors are replaced wholesale.
    pub fn merge(&mut self, incoming: WorkflowComponent) {
        if !incoming.domain.is_empty() {
            self.domain = incoming.domain;
        }
        if incoming.description.is_some() {
            self.description = incoming.description;
        }
        if !incoming.actors.is_empty() {
            self.actors = incoming.actors;
        }
        self.provider = incoming.provider;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_replaces_actors_wholesale() {
        let mut existing = WorkflowComponent::new("std.review").with_description("Review");
        existing.actors = vec![Actor::System, Actor::Agent];

        let mut incoming = WorkflowComponent::new("std.review");
        incoming.description = None;
        incoming.actors = vec![Actor::Human];

        existing.merge(incoming);

        assert_eq!(existing.actors, vec![Actor::Human]);
        assert_eq!(existing.description.as_deref(), Some("Review"));
        assert_eq!(existing.provider, ProviderKind::Local);
    }

    #[test]
    fn test_deserialize_defaults() {
        let component: WorkflowComponent =
            serde_json::from_str(r#"{"componentId": "c1", "domain": "ext.scan"}"#).unwrap();
        assert_eq!(component.provider, ProviderKind::Local);
        assert!(component.actors.is_empty());

        let remote = WorkflowComponent::new("ext.scan").remote();
        let value = serde_json::to_value(&remote).unwrap();
        assert_eq!(value["provider"], "REMOTE");
        assert_eq!(value["actors"][0], "SYSTEM");
    }
}
