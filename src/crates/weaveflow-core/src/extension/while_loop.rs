//! While-loop node: repeated execution of a body subgraph.
//!
//! The loop's outgoing edges split into two channels: `body` edges lead into
//! the subgraph executed once per iteration, `exit` edges are taken when the
//! loop terminates. Each iteration calls back into the scheduler through
//! `execute_subgraph`, so body nodes run with the shared outputs map and the
//! usual per-node wrapper.
//!
//! Termination: condition evaluates false (`condition` mode), the iteration
//! cap is reached (behavior per `onMaxIterations`), or the run is cancelled.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::context::{NodeContext, SubgraphOptions};
use crate::extension::{ExtensionError, NodeExtension, NodeOutcome, Ports, PortSpec};
use crate::graph::GraphIndex;
use crate::messages::ChatMessage;
use crate::provider::ChatRequest;
use crate::workflow::{handle, node_type, Node};

const DEFAULT_MAX_ITERATIONS: u32 = 3;

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    /// Evaluate a condition after each iteration; loop while true.
    #[default]
    Condition,
    /// Run exactly `maxIterations` iterations.
    Fixed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaxIterationsBehavior {
    /// Fail the node.
    Error,
    /// Log and exit the loop normally.
    #[default]
    Warning,
    /// Exit the loop silently.
    Continue,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopOutputMode {
    /// Final body output.
    #[default]
    Last,
    /// JSON array of every iteration's output.
    Accumulate,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WhileLoopData {
    pub mode: LoopMode,
    /// Condition prompt for the LLM evaluator (`condition` mode).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition_prompt: Option<String>,
    /// Name of a registered custom evaluator replacing the LLM.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluator: Option<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Prepended to each iteration's input.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_prompt: Option<String>,
    /// Append `(iteration i of max)` to each iteration's input.
    pub include_iteration_context: bool,
    pub on_max_iterations: MaxIterationsBehavior,
    pub output_mode: LoopOutputMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

pub struct WhileLoopExtension;

impl WhileLoopExtension {
    fn body_start(ctx: &NodeContext, node: &Node) -> Option<String> {
        let body = ctx.strict_handle_children(handle::BODY);
        if let Some(first) = body.first() {
            return Some(first.clone());
        }
        // Without an explicit body handle, any non-exit child is the body.
        ctx.outgoing_edges(&node.id, None)
            .into_iter()
            .map(|e| e.target)
            .next()
    }

    fn exit_children(ctx: &NodeContext, body_start: &str) -> Vec<String> {
        let exits = ctx.strict_handle_children(handle::EXIT);
        if !exits.is_empty() {
            return exits;
        }
        ctx.default_children()
            .into_iter()
            .filter(|id| id != body_start)
            .collect()
    }

    async fn should_continue(
        ctx: &NodeContext,
        node: &Node,
        data: &WhileLoopData,
        latest_output: &str,
    ) -> Result<bool, ExtensionError> {
        if let Some(name) = &data.evaluator {
            let evaluator = ctx.custom_evaluators.get(name).ok_or_else(|| {
                ExtensionError::Config(format!(
                    "While loop '{}' references unknown evaluator '{}'",
                    node.id, name
                ))
            })?;
            return Ok(evaluator(latest_output));
        }

        let condition = data.condition_prompt.as_deref().ok_or_else(|| {
            ExtensionError::Config(format!(
                "While loop '{}' is in condition mode without a condition prompt",
                node.id
            ))
        })?;

        let model = data.model.clone().unwrap_or_else(|| ctx.resolve_model(node));
        let prompt = format!(
            "{condition}\n\nLatest output:\n{latest_output}\n\nReply with exactly \"true\" or \"false\"."
        );
        let request = ChatRequest::new(&model, vec![ChatMessage::user(prompt)])
            .with_temperature(0.0)
            .with_cancel(ctx.cancel.clone());
        let response = ctx.provider.chat(request).await?;
        if let Some(usage) = response.usage {
            ctx.record_usage(usage, &model);
        }

        let reply = response.content.unwrap_or_default().to_lowercase();
        let reply = reply.trim();
        Ok(reply.starts_with("true") || reply.starts_with("yes"))
    }
}

#[async_trait]
impl NodeExtension for WhileLoopExtension {
    fn name(&self) -> &'static str {
        node_type::WHILE_LOOP
    }

    fn ports(&self) -> Ports {
        Ports {
            inputs: vec![PortSpec {
                id: "in",
                label: "Input",
            }],
            outputs: vec![
                PortSpec {
                    id: handle::BODY,
                    label: "Body",
                },
                PortSpec {
                    id: handle::EXIT,
                    label: "Exit",
                },
            ],
        }
    }

    fn default_data(&self) -> Value {
        json!({
            "label": "While loop",
            "mode": "condition",
            "maxIterations": DEFAULT_MAX_ITERATIONS,
            "outputMode": "last"
        })
    }

    async fn execute(
        &self,
        ctx: &NodeContext,
        node: &Node,
    ) -> Result<NodeOutcome, ExtensionError> {
        let data: WhileLoopData = serde_json::from_value(node.data.clone())
            .map_err(|e| ExtensionError::Config(format!("invalid while-loop node data: {e}")))?;

        let body_start = Self::body_start(ctx, node).ok_or_else(|| {
            ExtensionError::Config(format!("While loop '{}' has no body edge", node.id))
        })?;
        let exit_children = Self::exit_children(ctx, &body_start);

        let max_iterations = data.max_iterations.max(1);
        let mut iteration_outputs: Vec<String> = Vec::new();
        let mut latest = ctx.input.clone();
        let mut hit_cap = false;

        for iteration in 1..=max_iterations {
            if ctx.cancel.is_cancelled() {
                return Err(ExtensionError::Cancelled);
            }

            ctx.observer
                .on_loop_iteration(&ctx.node_id, iteration, max_iterations);

            let mut input = match &data.loop_prompt {
                Some(prompt) if !prompt.trim().is_empty() => format!("{prompt}\n\n{latest}"),
                _ => latest.clone(),
            };
            if data.include_iteration_context {
                input.push_str(&format!("\n\n(iteration {iteration} of {max_iterations})"));
            }

            debug!(node = %node.id, iteration, "Running loop body");
            let outcome = ctx
                .execute_subgraph(
                    &body_start,
                    input,
                    SubgraphOptions {
                        exclude: vec![node.id.clone()],
                        ..Default::default()
                    },
                )
                .await?;

            latest = outcome.output;
            iteration_outputs.push(latest.clone());

            match data.mode {
                LoopMode::Fixed => {
                    if iteration == max_iterations {
                        break;
                    }
                }
                LoopMode::Condition => {
                    if !Self::should_continue(ctx, node, &data, &latest).await? {
                        break;
                    }
                    if iteration == max_iterations {
                        hit_cap = true;
                    }
                }
            }
        }

        if hit_cap {
            match data.on_max_iterations {
                MaxIterationsBehavior::Error => {
                    return Err(ExtensionError::Failed(format!(
                        "While loop '{}' reached its iteration limit ({max_iterations})",
                        node.id
                    )));
                }
                MaxIterationsBehavior::Warning => {
                    warn!(node = %node.id, max_iterations, "Loop reached its iteration limit");
                }
                MaxIterationsBehavior::Continue => {}
            }
        }

        let output = match data.output_mode {
            LoopOutputMode::Last => latest,
            LoopOutputMode::Accumulate => serde_json::to_string(&iteration_outputs)
                .map_err(|e| ExtensionError::Failed(format!("failed to encode loop outputs: {e}")))?,
        };

        Ok(NodeOutcome::new(output).with_next(exit_children))
    }

    fn validate(&self, node: &Node, graph: &GraphIndex) -> Vec<String> {
        let mut problems = Vec::new();
        let data: WhileLoopData = match serde_json::from_value(node.data.clone()) {
            Ok(data) => data,
            Err(e) => return vec![format!("While loop '{}' has invalid data: {e}", node.id)],
        };

        if data.mode == LoopMode::Condition
            && data.condition_prompt.is_none()
            && data.evaluator.is_none()
        {
            problems.push(format!(
                "While loop '{}' is in condition mode but has neither a condition prompt nor an evaluator",
                node.id
            ));
        }
        if graph.children(&node.id).is_empty() {
            problems.push(format!("While loop '{}' has no body edge", node.id));
        }
        problems
    }
}
