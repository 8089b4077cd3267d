//! Workflow definition model.
//!
//! Workflows are user-authored JSON (schema version `"2.0.0"`): a metadata
//! block plus flat node and edge lists. Node `data` payloads stay untyped
//! here; their shape depends on the node's `type` string, and each
//! [`crate::extension::NodeExtension`] deserializes its own config from the
//! raw value. The engine consumes already-validated documents but still
//! deserializes defensively (unknown fields are ignored, dangling edges are
//! dropped when the graph index is built).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current workflow schema version.
pub const SCHEMA_VERSION: &str = "2.0.0";

/// Node type names with reserved semantics in the engine.
pub mod node_type {
    pub const START: &str = "start";
    pub const AGENT: &str = "agent";
    pub const ROUTER: &str = "router";
    pub const PARALLEL: &str = "parallel";
    pub const WHILE_LOOP: &str = "whileLoop";
    pub const SUBFLOW: &str = "subflow";
    pub const OUTPUT: &str = "output";
}

/// Edge handle names interpreted by the engine.
pub mod handle {
    /// Taken when a node fails and its error handling mode is `branch`.
    pub const ERROR: &str = "error";
    /// Taken when a HITL request is rejected.
    pub const REJECTED: &str = "rejected";
    /// Exit channel of a while-loop node (vs. its body channel).
    pub const EXIT: &str = "exit";
    /// Body channel of a while-loop node.
    pub const BODY: &str = "body";
}

/// Workflow metadata block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowMeta {
    pub version: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Default for WorkflowMeta {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION.to_string(),
            name: "workflow".to_string(),
            description: None,
        }
    }
}

/// Canvas position of a node. Carried through serialization untouched; the
/// engine never reads it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
}

/// A vertex in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    /// Node type string. Extension lookup is dynamic by this value since
    /// workflows are user-authored JSON.
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub position: Position,
    /// Type-dependent payload, deserialized by the node's extension.
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected: Option<bool>,
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            position: Position::default(),
            data,
            selected: None,
        }
    }

    /// Human-readable label from `data.label`, falling back to the node id.
    pub fn label(&self) -> &str {
        self.data
            .get("label")
            .and_then(Value::as_str)
            .unwrap_or(&self.id)
    }
}

/// A directed edge between two nodes. `source_handle` selects a named output
/// channel on the source node; an absent handle is the default channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Edge {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            source_handle: None,
            target_handle: None,
            label: None,
        }
    }

    pub fn with_source_handle(mut self, handle: impl Into<String>) -> Self {
        self.source_handle = Some(handle.into());
        self
    }
}

/// A user-authored workflow: metadata plus the node/edge lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub meta: WorkflowMeta,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self {
            meta: WorkflowMeta {
                version: SCHEMA_VERSION.to_string(),
                name: name.into(),
                description: None,
            },
            nodes,
            edges,
        }
    }

    /// Parse a workflow from persisted JSON, checking the schema version.
    pub fn from_json(json: &str) -> Result<Self, WorkflowParseError> {
        let workflow: Workflow = serde_json::from_str(json)?;
        let version = &workflow.meta.version;
        if version != SCHEMA_VERSION {
            return Err(WorkflowParseError::UnsupportedVersion(version.clone()));
        }
        Ok(workflow)
    }

    /// Serialize back to JSON, shape-for-shape with what was loaded.
    pub fn to_json(&self) -> Result<String, WorkflowParseError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// The unique start node, if the workflow has exactly one.
    pub fn start_node(&self) -> Option<&Node> {
        let mut starts = self.nodes.iter().filter(|n| n.node_type == node_type::START);
        match (starts.next(), starts.next()) {
            (Some(node), None) => Some(node),
            _ => None,
        }
    }
}

/// Failure to load a persisted workflow document.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowParseError {
    #[error("unsupported workflow schema version '{0}'")]
    UnsupportedVersion(String),
    #[error("invalid workflow JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_json() -> String {
        json!({
            "meta": { "version": "2.0.0", "name": "demo" },
            "nodes": [
                { "id": "s", "type": "start", "position": { "x": 0.0, "y": 0.0 }, "data": {} },
                { "id": "a", "type": "agent", "position": { "x": 100.0, "y": 0.0 },
                  "data": { "label": "Writer", "model": "test-model" } }
            ],
            "edges": [
                { "id": "e1", "source": "s", "target": "a" }
            ]
        })
        .to_string()
    }

    #[test]
    fn parses_v2_document() {
        let wf = Workflow::from_json(&sample_json()).unwrap();
        assert_eq!(wf.meta.name, "demo");
        assert_eq!(wf.nodes.len(), 2);
        assert_eq!(wf.edges.len(), 1);
        assert_eq!(wf.nodes[1].label(), "Writer");
    }

    #[test]
    fn rejects_unknown_schema_version() {
        let json = sample_json().replace("2.0.0", "1.0.0");
        let err = Workflow::from_json(&json).unwrap_err();
        assert!(matches!(err, WorkflowParseError::UnsupportedVersion(v) if v == "1.0.0"));
    }

    #[test]
    fn start_node_requires_exactly_one() {
        let mut wf = Workflow::from_json(&sample_json()).unwrap();
        assert_eq!(wf.start_node().unwrap().id, "s");

        wf.nodes.push(Node::new("s2", node_type::START, json!({})));
        assert!(wf.start_node().is_none());
    }

    #[test]
    fn round_trips_through_json() {
        let wf = Workflow::from_json(&sample_json()).unwrap();
        let rendered = wf.to_json().unwrap();
        let back = Workflow::from_json(&rendered).unwrap();
        assert_eq!(back.nodes.len(), wf.nodes.len());
        assert_eq!(back.edges[0].source, "s");
    }
}
