//! Start node: passes the run input through to all children.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::context::NodeContext;
use crate::extension::{ExtensionError, NodeExtension, NodeOutcome, Ports, PortSpec};
use crate::graph::GraphIndex;
use crate::workflow::{node_type, Node};

pub struct StartExtension;

#[async_trait]
impl NodeExtension for StartExtension {
    fn name(&self) -> &'static str {
        node_type::START
    }

    fn ports(&self) -> Ports {
        Ports {
            inputs: vec![],
            outputs: vec![PortSpec {
                id: "out",
                label: "Output",
            }],
        }
    }

    fn default_data(&self) -> Value {
        json!({ "label": "Start" })
    }

    async fn execute(
        &self,
        ctx: &NodeContext,
        node: &Node,
    ) -> Result<NodeOutcome, ExtensionError> {
        Ok(NodeOutcome::new(ctx.input.clone()).with_next(ctx.all_children(&node.id)))
    }

    fn validate(&self, node: &Node, graph: &GraphIndex) -> Vec<String> {
        if graph.children(&node.id).is_empty() {
            vec![format!("Start node '{}' has no outgoing edges", node.id)]
        } else {
            Vec::new()
        }
    }
}
