//! Subflow node: run a registered workflow as a single node.
//!
//! The child runs on a fresh scheduler that shares the provider but carries
//! its own running state, an extended node path, and a cancellation token
//! chained to the parent's. Input mappings assemble the child's input text
//! from the outer run's context and outputs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::context::NodeContext;
use crate::extension::{ExtensionError, NodeExtension, NodeOutcome, Ports, PortSpec};
use crate::graph::GraphIndex;
use crate::workflow::{node_type, Node};

/// One section of the child's input text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputMapping {
    /// `input`, `originalInput`, `node`, or `literal`.
    pub source: String,
    /// Node id, for `node` mappings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Literal text, for `literal` mappings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Section heading prepended to the resolved value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubflowData {
    pub subflow_id: String,
    pub input_mappings: Vec<InputMapping>,
}

pub struct SubflowExtension;

impl SubflowExtension {
    fn map_input(ctx: &NodeContext, mappings: &[InputMapping]) -> String {
        if mappings.is_empty() {
            return ctx.input.clone();
        }

        let mut sections = Vec::with_capacity(mappings.len());
        for mapping in mappings {
            let value = match mapping.source.as_str() {
                "input" => Some(ctx.input.clone()),
                "originalInput" => Some(ctx.original_input.clone()),
                "node" => mapping
                    .node_id
                    .as_deref()
                    .and_then(|id| ctx.output_of(id)),
                "literal" => mapping.text.clone(),
                _ => None,
            };
            let Some(value) = value else { continue };
            match &mapping.label {
                Some(label) => sections.push(format!("{label}:\n{value}")),
                None => sections.push(value),
            }
        }
        sections.join("\n\n")
    }
}

#[async_trait]
impl NodeExtension for SubflowExtension {
    fn name(&self) -> &'static str {
        node_type::SUBFLOW
    }

    fn ports(&self) -> Ports {
        Ports {
            inputs: vec![PortSpec {
                id: "in",
                label: "Input",
            }],
            outputs: vec![PortSpec {
                id: "out",
                label: "Output",
            }],
        }
    }

    fn default_data(&self) -> Value {
        json!({ "label": "Subflow", "subflowId": "", "inputMappings": [] })
    }

    async fn execute(
        &self,
        ctx: &NodeContext,
        node: &Node,
    ) -> Result<NodeOutcome, ExtensionError> {
        let data: SubflowData = serde_json::from_value(node.data.clone())
            .map_err(|e| ExtensionError::Config(format!("invalid subflow node data: {e}")))?;

        if data.subflow_id.is_empty() {
            return Err(ExtensionError::Config(format!(
                "Subflow node '{}' has no subflow id",
                node.id
            )));
        }
        if ctx.subflow_depth >= ctx.max_subflow_depth {
            return Err(ExtensionError::Engine(Box::new(
                crate::error::EngineError::SubflowDepthExceeded {
                    limit: ctx.max_subflow_depth,
                },
            )));
        }

        let registry = ctx.subflow_registry.as_ref().ok_or_else(|| {
            ExtensionError::Config("No subflow registry configured".to_string())
        })?;
        let child = registry.get(&data.subflow_id).ok_or_else(|| {
            ExtensionError::Config(format!("Subflow '{}' not found", data.subflow_id))
        })?;

        let input = Self::map_input(ctx, &data.input_mappings);
        debug!(node = %node.id, subflow = %data.subflow_id, "Running subflow");

        let result = ctx.execute_workflow(child, input).await?;
        ctx.merge_usage(&result.token_usage_details);
        if !result.success {
            let message = result
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "subflow failed".to_string());
            return Err(ExtensionError::Failed(format!(
                "Subflow '{}' failed: {message}",
                data.subflow_id
            )));
        }

        Ok(NodeOutcome::new(result.final_output).with_next(ctx.default_children()))
    }

    fn validate(&self, node: &Node, _graph: &GraphIndex) -> Vec<String> {
        match serde_json::from_value::<SubflowData>(node.data.clone()) {
            Ok(data) if data.subflow_id.is_empty() => {
                vec![format!("Subflow node '{}' has no subflow id", node.id)]
            }
            Ok(_) => Vec::new(),
            Err(e) => vec![format!("Subflow node '{}' has invalid data: {e}", node.id)],
        }
    }
}
