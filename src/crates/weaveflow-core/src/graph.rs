//! Derived adjacency view of a workflow.
//!
//! Built once per execution from the node/edge lists. Edges whose source or
//! target reference a missing node are dropped with a warning rather than
//! failing the run, since editors can persist half-wired canvases.

use std::collections::HashMap;

use tracing::warn;

use crate::workflow::{Edge, Node, Workflow};

/// An outgoing connection: the child node plus the source handle the edge
/// left through (`None` = default channel).
#[derive(Debug, Clone, PartialEq)]
pub struct ChildRef {
    pub node_id: String,
    pub handle: Option<String>,
}

/// Index over a workflow's structure: node lookup, children grouped by
/// source handle, and deduplicated parent lists.
#[derive(Debug, Default)]
pub struct GraphIndex {
    nodes: HashMap<String, Node>,
    children: HashMap<String, Vec<ChildRef>>,
    parents: HashMap<String, Vec<String>>,
    edges: Vec<Edge>,
}

impl GraphIndex {
    /// Build the index, dropping dangling edges.
    pub fn build(workflow: &Workflow) -> Self {
        let mut index = GraphIndex {
            nodes: workflow
                .nodes
                .iter()
                .map(|n| (n.id.clone(), n.clone()))
                .collect(),
            ..Default::default()
        };

        for edge in &workflow.edges {
            if !index.nodes.contains_key(&edge.source) || !index.nodes.contains_key(&edge.target) {
                warn!(
                    edge = %edge.id,
                    source = %edge.source,
                    target = %edge.target,
                    "Dropping edge referencing a missing node"
                );
                continue;
            }

            index
                .children
                .entry(edge.source.clone())
                .or_default()
                .push(ChildRef {
                    node_id: edge.target.clone(),
                    handle: edge.source_handle.clone(),
                });

            let parents = index.parents.entry(edge.target.clone()).or_default();
            if !parents.contains(&edge.source) {
                parents.push(edge.source.clone());
            }

            index.edges.push(edge.clone());
        }

        index
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// All outgoing connections of a node, regardless of handle.
    pub fn children(&self, id: &str) -> &[ChildRef] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Deduplicated parents of a node.
    pub fn parents(&self, id: &str) -> &[String] {
        self.parents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Outgoing edges of a node, filtered by source handle.
    ///
    /// An edge with no `source_handle` matches every requested handle: "no
    /// handle" is the fallback for each named output channel. Requesting
    /// `None` returns only default-channel edges.
    pub fn outgoing_edges(&self, id: &str, handle: Option<&str>) -> Vec<&Edge> {
        self.edges
            .iter()
            .filter(|e| e.source == id)
            .filter(|e| match handle {
                Some(h) => e.source_handle.as_deref() == Some(h) || e.source_handle.is_none(),
                None => e.source_handle.is_none(),
            })
            .collect()
    }

    /// Targets of a node's default-channel edges.
    pub fn default_children(&self, id: &str) -> Vec<String> {
        self.children(id)
            .iter()
            .filter(|c| c.handle.is_none())
            .map(|c| c.node_id.clone())
            .collect()
    }

    /// Targets of a node's edges on a named handle, falling back to
    /// default-channel edges per the handle-resolution rule.
    pub fn handle_children(&self, id: &str, handle: &str) -> Vec<String> {
        self.outgoing_edges(id, Some(handle))
            .into_iter()
            .map(|e| e.target.clone())
            .collect()
    }

    /// Targets on a named handle only, with no default-channel fallback.
    /// Used for reserved handles (`error`, `rejected`) where falling back to
    /// the default channel would re-route normal traffic.
    pub fn strict_handle_children(&self, id: &str, handle: &str) -> Vec<String> {
        self.children(id)
            .iter()
            .filter(|c| c.handle.as_deref() == Some(handle))
            .map(|c| c.node_id.clone())
            .collect()
    }
}
