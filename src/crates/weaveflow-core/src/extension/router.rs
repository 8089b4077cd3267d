//! Router node: picks exactly one of its declared routes.
//!
//! Two selection paths. When any route declares a condition, routes are
//! evaluated in order and the first match wins (`contains` / `equals` /
//! `regex` / `custom`). Otherwise the model is asked to choose, and its
//! reply is resolved against route ids, then labels, then containment. A
//! reply that resolves to nothing triggers the fallback policy.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::context::NodeContext;
use crate::extension::{ExtensionError, NodeExtension, NodeOutcome, Ports, PortSpec};
use crate::graph::GraphIndex;
use crate::messages::ChatMessage;
use crate::provider::ChatRequest;
use crate::workflow::{node_type, Node};

/// What to do when the model fails to pick a valid route.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouterFallback {
    /// Take the first declared route.
    #[default]
    First,
    /// Fail the node.
    Error,
    /// Select nothing; execution continues with no next nodes.
    None,
}

/// Condition attached to a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteCondition {
    #[serde(rename = "type")]
    pub kind: ConditionKind,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionKind {
    Contains,
    Equals,
    Regex,
    /// `value` names an evaluator registered on the engine.
    Custom,
}

impl RouteCondition {
    /// Evaluate against the input text. Unknown custom evaluators and
    /// invalid regexes evaluate to false with a warning.
    pub fn matches(&self, input: &str, ctx: &NodeContext) -> bool {
        match self.kind {
            ConditionKind::Contains => input
                .to_lowercase()
                .contains(&self.value.to_lowercase()),
            ConditionKind::Equals => input.trim() == self.value,
            ConditionKind::Regex => match Regex::new(&self.value) {
                Ok(re) => re.is_match(input),
                Err(e) => {
                    warn!(pattern = %self.value, error = %e, "Invalid route regex");
                    false
                }
            },
            ConditionKind::Custom => match ctx.custom_evaluators.get(&self.value) {
                Some(eval) => eval(input),
                None => {
                    warn!(evaluator = %self.value, "Unknown custom evaluator");
                    false
                }
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteData {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<RouteCondition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterData {
    pub routes: Vec<RouteData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Extra routing instructions prepended to the selection prompt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    pub fallback: RouterFallback,
}

pub struct RouterExtension;

impl RouterExtension {
    async fn select_with_llm(
        ctx: &NodeContext,
        node: &Node,
        data: &RouterData,
    ) -> Result<Option<String>, ExtensionError> {
        let routes_listing = data
            .routes
            .iter()
            .map(|r| match &r.label {
                Some(label) => format!("- {} ({})", r.id, label),
                None => format!("- {}", r.id),
            })
            .collect::<Vec<_>>()
            .join("\n");

        let instructions = data.prompt.as_deref().unwrap_or(
            "Decide which route best matches the input.",
        );
        let system = format!(
            "You are a routing step in a workflow. {instructions}\n\
             Available routes:\n{routes_listing}\n\
             Reply with the route id only."
        );

        let mut messages = vec![ChatMessage::system(system)];
        messages.extend(ctx.history());
        messages.push(ChatMessage::user(ctx.input.clone()));

        let model = data
            .model
            .clone()
            .unwrap_or_else(|| ctx.resolve_model(node));
        let request = ChatRequest::new(&model, messages)
            .with_temperature(0.0)
            .with_cancel(ctx.cancel.clone());
        let response = ctx.provider.chat(request).await?;
        if let Some(usage) = response.usage {
            ctx.record_usage(usage, &model);
        }

        let reply = response.content.unwrap_or_default();
        let reply = reply.trim();
        debug!(node = %node.id, reply, "Router model reply");

        // Exact id, then label, then containment.
        if let Some(route) = data.routes.iter().find(|r| r.id == reply) {
            return Ok(Some(route.id.clone()));
        }
        if let Some(route) = data
            .routes
            .iter()
            .find(|r| r.label.as_deref() == Some(reply))
        {
            return Ok(Some(route.id.clone()));
        }
        let lowered = reply.to_lowercase();
        if let Some(route) = data.routes.iter().find(|r| {
            lowered.contains(&r.id.to_lowercase())
                || r.label
                    .as_ref()
                    .is_some_and(|l| lowered.contains(&l.to_lowercase()))
        }) {
            return Ok(Some(route.id.clone()));
        }

        Ok(None)
    }

    fn select_with_conditions(ctx: &NodeContext, data: &RouterData) -> Option<String> {
        data.routes
            .iter()
            .find(|r| {
                r.condition
                    .as_ref()
                    .is_some_and(|c| c.matches(&ctx.input, ctx))
            })
            .map(|r| r.id.clone())
    }
}

#[async_trait]
impl NodeExtension for RouterExtension {
    fn name(&self) -> &'static str {
        node_type::ROUTER
    }

    fn ports(&self) -> Ports {
        Ports {
            inputs: vec![PortSpec {
                id: "in",
                label: "Input",
            }],
            // One output port per route, declared dynamically in node data.
            outputs: vec![],
        }
    }

    fn default_data(&self) -> Value {
        json!({
            "label": "Router",
            "routes": [],
            "fallback": "first"
        })
    }

    async fn execute(
        &self,
        ctx: &NodeContext,
        node: &Node,
    ) -> Result<NodeOutcome, ExtensionError> {
        let data: RouterData = serde_json::from_value(node.data.clone())
            .map_err(|e| ExtensionError::Config(format!("invalid router node data: {e}")))?;

        if data.routes.is_empty() {
            return Err(ExtensionError::Config(format!(
                "Router '{}' declares no routes",
                node.id
            )));
        }

        let has_conditions = data.routes.iter().any(|r| r.condition.is_some());
        let selected = if has_conditions {
            Self::select_with_conditions(ctx, &data)
        } else {
            Self::select_with_llm(ctx, node, &data).await?
        };

        let selected = match (selected, data.fallback) {
            (Some(id), _) => Some(id),
            (None, RouterFallback::First) => {
                warn!(node = %node.id, "No route matched, falling back to first");
                data.routes.first().map(|r| r.id.clone())
            }
            (None, RouterFallback::Error) => {
                return Err(ExtensionError::Failed(format!(
                    "Router '{}' failed to select a valid route",
                    node.id
                )));
            }
            (None, RouterFallback::None) => None,
        };

        let outcome = match selected {
            Some(route_id) => {
                ctx.observer.on_route_selected(&ctx.node_id, &route_id);
                NodeOutcome::new(ctx.input.clone())
                    .with_next(ctx.handle_children(&route_id))
                    .with_metadata(json!({ "selectedRoute": route_id }))
            }
            None => NodeOutcome::new(ctx.input.clone()),
        };

        Ok(outcome)
    }

    fn validate(&self, node: &Node, graph: &GraphIndex) -> Vec<String> {
        let mut problems = Vec::new();
        let data: RouterData = match serde_json::from_value(node.data.clone()) {
            Ok(data) => data,
            Err(e) => return vec![format!("Router '{}' has invalid data: {e}", node.id)],
        };

        if data.routes.is_empty() {
            problems.push(format!("Router '{}' declares no routes", node.id));
        }

        for route in &data.routes {
            let has_edge = graph
                .children(&node.id)
                .iter()
                .any(|c| c.handle.as_deref() == Some(route.id.as_str()) || c.handle.is_none());
            if !has_edge {
                problems.push(format!(
                    "Router '{}' route '{}' has no outgoing edge",
                    node.id, route.id
                ));
            }
        }
        problems
    }
}
