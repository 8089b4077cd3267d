//! Agent node: one conversational LLM turn, with streaming and tool calls.
//!
//! The request is `history + new user turn` (the node's prompt rides along
//! as a system message, it is never written to the session). Tool calls
//! iterate: each round's calls resolve through the engine's tool registry,
//! results are appended as tool messages, and the model is re-invoked, up to
//! `maxToolIterations` rounds. The final assistant text is both the node
//! output and the assistant message handed back to the scheduler for the
//! session append.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::context::NodeContext;
use crate::extension::{ExtensionError, NodeExtension, NodeOutcome, Ports, PortSpec};
use crate::graph::GraphIndex;
use crate::hitl::{HitlAction, HitlConfig, HitlContext, HitlRequest};
use crate::memory::{MemoryEntry, MemoryQuery};
use crate::messages::ChatMessage;
use crate::provider::{ChatRequest, TokenSink};
use crate::workflow::{node_type, Node};

const DEFAULT_MAX_TOOL_ITERATIONS: u32 = 10;

fn default_max_tool_iterations() -> u32 {
    DEFAULT_MAX_TOOL_ITERATIONS
}

/// What happens when the tool-call loop hits its iteration cap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolLimitBehavior {
    /// Append a notice to the output and continue the workflow.
    #[default]
    Warning,
    /// Fail the node.
    Error,
    /// Ask a human whether to keep going.
    Hitl,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// System prompt for this turn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Names of registry tools exposed to the model.
    pub tools: Vec<String>,
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: u32,
    pub on_tool_limit: ToolLimitBehavior,
    /// Inject related memories and store the exchange afterwards.
    pub use_memory: bool,
}

impl Default for AgentData {
    fn default() -> Self {
        Self {
            model: None,
            prompt: None,
            temperature: None,
            max_tokens: None,
            tools: Vec::new(),
            max_tool_iterations: DEFAULT_MAX_TOOL_ITERATIONS,
            on_tool_limit: ToolLimitBehavior::Warning,
            use_memory: false,
        }
    }
}

pub struct AgentExtension;

impl AgentExtension {
    /// The new user turn, or `None` when the history already ends with this
    /// exact input (the seed message of a fresh run).
    fn user_turn(ctx: &NodeContext, history: &[ChatMessage]) -> Option<ChatMessage> {
        let mut content = ctx.input.clone();
        for attachment in ctx.attachments.iter() {
            content.push_str(&format!(
                "\n\n[Attachment: {}]\n{}",
                attachment.name, attachment.content
            ));
        }
        let duplicate = history
            .last()
            .map(|m| m.role == crate::messages::ChatRole::User && m.content == content)
            .unwrap_or(false);
        if duplicate {
            None
        } else {
            Some(ChatMessage::user(content))
        }
    }

    async fn memory_context(ctx: &NodeContext) -> Option<ChatMessage> {
        let memory = ctx.memory.as_ref()?;
        let hits = memory
            .query(MemoryQuery {
                text: Some(ctx.input.clone()),
                limit: Some(5),
                session_id: ctx.session_id.clone(),
                ..Default::default()
            })
            .await;
        if hits.is_empty() {
            return None;
        }
        let listing = hits
            .iter()
            .map(|e| format!("- {}", e.text))
            .collect::<Vec<_>>()
            .join("\n");
        Some(ChatMessage::system(format!("Relevant memory:\n{listing}")))
    }

    /// Ask a human whether the tool loop may continue past its cap.
    async fn confirm_tool_continuation(
        ctx: &NodeContext,
        node: &Node,
    ) -> Result<bool, ExtensionError> {
        let Some(coordinator) = ctx.hitl.clone() else {
            return Ok(false);
        };
        let config: HitlConfig = node
            .data
            .get("hitl")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        let request = HitlRequest::new(
            ctx.scoped_node_id.clone(),
            node.label(),
            &config,
            format!(
                "Agent '{}' hit its tool iteration limit. Continue calling tools?",
                node.label()
            ),
            HitlContext {
                input: ctx.input.clone(),
                output: None,
                workflow_name: ctx.workflow_name.clone(),
                session_id: ctx.session_id.clone(),
            },
        );
        let response = coordinator
            .await_response(request, config.default_action, &ctx.cancel)
            .await?;
        Ok(response.action == HitlAction::Approve)
    }
}

#[async_trait]
impl NodeExtension for AgentExtension {
    fn name(&self) -> &'static str {
        node_type::AGENT
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
        json!({
            "label": "Agent",
            "prompt": "",
            "tools": [],
            "maxToolIterations": DEFAULT_MAX_TOOL_ITERATIONS
        })
    }

    async fn execute(
        &self,
        ctx: &NodeContext,
        node: &Node,
    ) -> Result<NodeOutcome, ExtensionError> {
        if ctx.cancel.is_cancelled() {
            return Err(ExtensionError::Cancelled);
        }

        let data: AgentData = serde_json::from_value(node.data.clone())
            .map_err(|e| ExtensionError::Config(format!("invalid agent node data: {e}")))?;
        let model = data.model.clone().unwrap_or_else(|| ctx.default_model.clone());

        let mut messages: Vec<ChatMessage> = Vec::new();
        if let Some(prompt) = data.prompt.as_deref().filter(|p| !p.trim().is_empty()) {
            messages.push(ChatMessage::system(prompt.to_string()));
        }
        if data.use_memory {
            if let Some(memory_msg) = Self::memory_context(ctx).await {
                messages.push(memory_msg);
            }
        }
        let history = ctx.history();
        if let Some(turn) = Self::user_turn(ctx, &history) {
            messages.extend(history);
            messages.push(turn);
        } else {
            messages.extend(history);
        }

        let tool_defs = ctx.tools.definitions_for(&data.tools);

        let on_token: TokenSink = {
            let observer = ctx.observer.clone();
            let node_id = ctx.node_id.clone();
            std::sync::Arc::new(move |chunk: &str| observer.on_token(&node_id, chunk))
        };
        let on_reasoning: TokenSink = {
            let observer = ctx.observer.clone();
            let node_id = ctx.node_id.clone();
            std::sync::Arc::new(move |chunk: &str| observer.on_reasoning(&node_id, chunk))
        };

        let mut tool_rounds: u32 = 0;
        let mut limit_notice = false;

        let output = loop {
            if ctx.cancel.is_cancelled() {
                return Err(ExtensionError::Cancelled);
            }

            let mut request = ChatRequest::new(&model, messages.clone())
                .with_tools(tool_defs.clone())
                .with_on_token(on_token.clone())
                .with_on_reasoning(on_reasoning.clone())
                .with_cancel(ctx.cancel.clone());
            request.temperature = data.temperature;
            request.max_tokens = data.max_tokens;

            let response = ctx.provider.chat(request).await?;
            if let Some(usage) = response.usage {
                ctx.record_usage(usage, &model);
            }

            let content = response.content.clone().unwrap_or_default();
            if response.tool_calls.is_empty() {
                break content;
            }

            tool_rounds += 1;
            debug!(node = %node.id, round = tool_rounds, calls = response.tool_calls.len(), "Agent tool round");
            if tool_rounds > data.max_tool_iterations {
                if data.on_tool_limit == ToolLimitBehavior::Error {
                    return Err(ExtensionError::Failed(format!(
                        "Agent '{}' exceeded the tool iteration limit ({})",
                        node.id, data.max_tool_iterations
                    )));
                }
                let keep_going = data.on_tool_limit == ToolLimitBehavior::Hitl
                    && Self::confirm_tool_continuation(ctx, node).await?;
                if keep_going {
                    tool_rounds = 0;
                } else {
                    warn!(node = %node.id, "Tool iteration limit reached, stopping tool loop");
                    limit_notice = true;
                    break content;
                }
            }

            messages.push(ChatMessage::assistant(if content.is_empty() {
                format!(
                    "[Calling tools: {}]",
                    response
                        .tool_calls
                        .iter()
                        .map(|c| c.name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            } else {
                content
            }));

            for call in &response.tool_calls {
                ctx.observer.on_tool_call(&ctx.node_id, call);
                let result = match ctx.tools.dispatch(call).await {
                    Ok(result) => result,
                    Err(e) => format!("Error: {e}"),
                };
                messages.push(ChatMessage::tool(result, call.name.clone(), call.id.clone()));
            }
        };

        let output = if limit_notice {
            format!("{output}\n\n[Note: tool iteration limit reached]")
        } else {
            output
        };

        if data.use_memory {
            if let Some(memory) = &ctx.memory {
                let mut entry = MemoryEntry::new(format!("Q: {}\nA: {}", ctx.input, output))
                    .with_metadata(json!({ "nodeId": node.id }));
                if let Some(session) = &ctx.session_id {
                    entry = entry.with_session(session.clone());
                }
                memory.store(entry).await;
            }
        }

        Ok(NodeOutcome::new(output.clone())
            .with_next(ctx.default_children())
            .with_assistant_message(output))
    }

    fn validate(&self, node: &Node, _graph: &GraphIndex) -> Vec<String> {
        match serde_json::from_value::<AgentData>(node.data.clone()) {
            Ok(_) => Vec::new(),
            Err(e) => vec![format!("Agent '{}' has invalid data: {e}", node.id)],
        }
    }
}
