//! Subflow lookup.
//!
//! Subflow nodes reference other workflows by id; the registry resolves
//! them. Like memory, this is a consumed collaborator; the engine never
//! persists workflow definitions itself.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::workflow::Workflow;

/// Resolves subflow ids to workflow definitions.
pub trait SubflowRegistry: Send + Sync {
    fn get(&self, subflow_id: &str) -> Option<Workflow>;

    /// Known ids, for validation.
    fn list(&self) -> Vec<String>;
}

/// Map-backed registry for tests and embedded use.
#[derive(Debug, Default)]
pub struct InMemorySubflowRegistry {
    workflows: RwLock<HashMap<String, Workflow>>,
}

impl InMemorySubflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: impl Into<String>, workflow: Workflow) {
        self.workflows.write().unwrap().insert(id.into(), workflow);
    }
}

impl SubflowRegistry for InMemorySubflowRegistry {
    fn get(&self, subflow_id: &str) -> Option<Workflow> {
        self.workflows.read().unwrap().get(subflow_id).cloned()
    }

    fn list(&self) -> Vec<String> {
        self.workflows.read().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{node_type, Node};
    use serde_json::json;

    #[test]
    fn insert_and_resolve() {
        let registry = InMemorySubflowRegistry::new();
        assert!(registry.get("child").is_none());

        registry.insert(
            "child",
            Workflow::new(
                "child",
                vec![Node::new("s", node_type::START, json!({}))],
                vec![],
            ),
        );

        assert_eq!(registry.get("child").unwrap().meta.name, "child");
        assert_eq!(registry.list(), vec!["child".to_string()]);
    }
}
