//! Output node: pure formatter, no LLM call.
//!
//! Interpolates a template against the run's stored outputs. Placeholders
//! are `{{nodeId}}` for whole-node outputs and `{{nodeId:branchId}}` for
//! parallel branches; `{{input}}` resolves to the node's incoming input.
//! Unknown placeholders render as empty strings.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::context::NodeContext;
use crate::extension::{ExtensionError, NodeExtension, NodeOutcome, Ports, PortSpec};
use crate::graph::GraphIndex;
use crate::workflow::{node_type, Node};

/// Rendering applied after interpolation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Markdown,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutputData {
    pub template: String,
    pub format: OutputFormat,
}

pub struct OutputExtension;

fn placeholder_re() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        // The pattern is a literal; it cannot fail to compile.
        Regex::new(r"\{\{\s*([^}]+?)\s*\}\}").expect("placeholder pattern")
    })
}

/// Replace `{{key}}` placeholders from the outputs map.
pub fn interpolate(
    template: &str,
    outputs: &std::collections::HashMap<String, String>,
    input: &str,
) -> String {
    placeholder_re()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let key = &caps[1];
            if key == "input" {
                input.to_string()
            } else {
                outputs.get(key).cloned().unwrap_or_default()
            }
        })
        .into_owned()
}

fn render(format: OutputFormat, text: String) -> String {
    match format {
        OutputFormat::Text | OutputFormat::Markdown => text,
        OutputFormat::Json => match serde_json::from_str::<Value>(&text) {
            Ok(value) => serde_json::to_string_pretty(&value).unwrap_or(text),
            Err(_) => json!({ "output": text }).to_string(),
        },
    }
}

#[async_trait]
impl NodeExtension for OutputExtension {
    fn name(&self) -> &'static str {
        node_type::OUTPUT
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
        json!({ "label": "Output", "template": "{{input}}", "format": "text" })
    }

    async fn execute(
        &self,
        ctx: &NodeContext,
        node: &Node,
    ) -> Result<NodeOutcome, ExtensionError> {
        let data: OutputData = serde_json::from_value(node.data.clone())
            .map_err(|e| ExtensionError::Config(format!("invalid output node data: {e}")))?;

        let template = if data.template.is_empty() {
            "{{input}}"
        } else {
            data.template.as_str()
        };

        let outputs = ctx.outputs_snapshot();
        let rendered = render(data.format, interpolate(template, &outputs, &ctx.input));

        Ok(NodeOutcome::new(rendered).with_next(ctx.default_children()))
    }

    fn validate(&self, node: &Node, graph: &GraphIndex) -> Vec<String> {
        let mut problems = Vec::new();
        let Some(template) = node.data.get("template").and_then(Value::as_str) else {
            return problems;
        };

        for caps in placeholder_re().captures_iter(template) {
            let key = caps[1].trim();
            if key == "input" {
                continue;
            }
            // Branch placeholders reference the node before the colon, and
            // `<id>_error` keys reference the node that may branch on error.
            let node_ref = key.split(':').next().unwrap_or(key);
            let error_ref = node_ref.strip_suffix("_error");
            if graph.node(node_ref).is_none()
                && !error_ref.is_some_and(|id| graph.node(id).is_some())
            {
                problems.push(format!(
                    "Output node '{}' references unknown node '{}' in its template",
                    node.id, node_ref
                ));
            }
        }
        problems
    }
}
