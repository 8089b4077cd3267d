//! Parallel node: fan out declared branches, each as its own LLM turn.
//!
//! Branches run concurrently over `history + branch prompt + input`, each
//! racing a per-branch timeout and the run's cancellation token. Branch
//! texts land at the `nodeId:branchId` composite output keys; the node's own
//! output is the merged document.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::context::NodeContext;
use crate::extension::{ExtensionError, NodeExtension, NodeOutcome, Ports, PortSpec};
use crate::graph::GraphIndex;
use crate::messages::ChatMessage;
use crate::provider::{ChatRequest, TokenSink};
use crate::workflow::{node_type, Node};

const DEFAULT_BRANCH_TIMEOUT_MS: u64 = 5 * 60 * 1000;

fn default_branch_timeout_ms() -> u64 {
    DEFAULT_BRANCH_TIMEOUT_MS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchData {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParallelData {
    pub branches: Vec<BranchData>,
    #[serde(default = "default_branch_timeout_ms")]
    pub branch_timeout_ms: u64,
}

pub struct ParallelExtension;

impl ParallelExtension {
    async fn run_branch(
        ctx: &NodeContext,
        node: &Node,
        branch: &BranchData,
        timeout: Duration,
    ) -> Result<String, ExtensionError> {
        ctx.observer.on_branch_start(&ctx.node_id, &branch.id);

        let model = branch
            .model
            .clone()
            .unwrap_or_else(|| ctx.resolve_model(node));

        let mut messages = ctx.history();
        let content = match branch.prompt.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(prompt) => format!("{prompt}\n\n{}", ctx.input),
            None => ctx.input.clone(),
        };
        messages.push(ChatMessage::user(content));

        let on_token: TokenSink = {
            let observer = ctx.observer.clone();
            let node_id = ctx.node_id.clone();
            let branch_id = branch.id.clone();
            Arc::new(move |chunk: &str| observer.on_branch_token(&node_id, &branch_id, chunk))
        };
        let on_reasoning: TokenSink = {
            let observer = ctx.observer.clone();
            let node_id = ctx.node_id.clone();
            let branch_id = branch.id.clone();
            Arc::new(move |chunk: &str| observer.on_branch_reasoning(&node_id, &branch_id, chunk))
        };

        let request = ChatRequest::new(&model, messages)
            .with_tools(ctx.tools.definitions_for(&branch.tools))
            .with_on_token(on_token)
            .with_on_reasoning(on_reasoning)
            .with_cancel(ctx.cancel.clone());

        let chat = ctx.provider.chat(request);
        let response = tokio::select! {
            result = tokio::time::timeout(timeout, chat) => match result {
                Ok(response) => response?,
                Err(_) => {
                    return Err(ExtensionError::Failed(format!(
                        "Branch '{}' timed out after {}ms",
                        branch.id,
                        timeout.as_millis()
                    )));
                }
            },
            _ = ctx.cancel.cancelled() => return Err(ExtensionError::Cancelled),
        };

        if let Some(usage) = response.usage {
            ctx.record_usage(usage, &model);
        }

        let text = response.content.unwrap_or_default();
        ctx.store_branch_output(&branch.id, &text);
        ctx.observer
            .on_branch_complete(&ctx.node_id, &branch.id, &text);
        Ok(text)
    }
}

#[async_trait]
impl NodeExtension for ParallelExtension {
    fn name(&self) -> &'static str {
        node_type::PARALLEL
    }

    fn ports(&self) -> Ports {
        Ports {
            inputs: vec![PortSpec {
                id: "in",
                label: "Input",
            }],
            outputs: vec![PortSpec {
                id: "out",
                label: "Merged output",
            }],
        }
    }

    fn default_data(&self) -> Value {
        json!({
            "label": "Parallel",
            "branches": [],
            "branchTimeoutMs": DEFAULT_BRANCH_TIMEOUT_MS
        })
    }

    async fn execute(
        &self,
        ctx: &NodeContext,
        node: &Node,
    ) -> Result<NodeOutcome, ExtensionError> {
        let data: ParallelData = serde_json::from_value(node.data.clone())
            .map_err(|e| ExtensionError::Config(format!("invalid parallel node data: {e}")))?;

        if data.branches.is_empty() {
            return Err(ExtensionError::Config(format!(
                "Parallel node '{}' declares no branches",
                node.id
            )));
        }

        let timeout = Duration::from_millis(data.branch_timeout_ms);
        debug!(node = %node.id, branches = data.branches.len(), "Fanning out branches");

        let results = join_all(
            data.branches
                .iter()
                .map(|branch| Self::run_branch(ctx, node, branch, timeout)),
        )
        .await;

        let mut sections = Vec::with_capacity(results.len());
        for result in results {
            sections.push(result?);
        }

        let merged = sections
            .iter()
            .enumerate()
            .map(|(i, text)| format!("## Output {}\n{}", i + 1, text))
            .collect::<Vec<_>>()
            .join("\n\n");

        Ok(NodeOutcome::new(merged).with_next(ctx.default_children()))
    }

    fn validate(&self, node: &Node, _graph: &GraphIndex) -> Vec<String> {
        let mut problems = Vec::new();
        let data: ParallelData = match serde_json::from_value(node.data.clone()) {
            Ok(data) => data,
            Err(e) => return vec![format!("Parallel node '{}' has invalid data: {e}", node.id)],
        };

        if data.branches.is_empty() {
            problems.push(format!(
                "Parallel node '{}' declares no branches",
                node.id
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for branch in &data.branches {
            if !seen.insert(branch.id.as_str()) {
                problems.push(format!(
                    "Parallel node '{}' has duplicate branch id '{}'",
                    node.id, branch.id
                ));
            }
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_timeout_defaults_to_five_minutes() {
        let data: ParallelData = serde_json::from_value(json!({ "branches": [] })).unwrap();
        assert_eq!(data.branch_timeout_ms, 300_000);
    }

    #[test]
    fn branches_parse_with_optional_fields() {
        let data: ParallelData = serde_json::from_value(json!({
            "branches": [
                { "id": "a", "prompt": "Summarize" },
                { "id": "b", "model": "other-model", "label": "Critic" }
            ]
        }))
        .unwrap();
        assert_eq!(data.branches.len(), 2);
        assert_eq!(data.branches[1].model.as_deref(), Some("other-model"));
    }
}
