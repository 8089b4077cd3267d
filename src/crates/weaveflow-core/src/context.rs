//! Per-run execution state and the context handed to node extensions.
//!
//! The scheduler exclusively owns a [`RunState`] for the duration of one
//! execute call; extensions see it only through [`NodeContext`] accessors,
//! which snapshot under a short-lived lock. Extensions must not (and cannot)
//! mutate the session directly; history appends travel back through
//! [`crate::extension::NodeOutcome`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::compaction::Compactor;
use crate::error::EngineError;
use crate::graph::GraphIndex;
use crate::memory::MemoryAdapter;
use crate::messages::ChatMessage;
use crate::observer::ExecutionObserver;
use crate::provider::LanguageModel;
use crate::result::{ExecutionResult, TokenUsageDetails};
use crate::subflows::SubflowRegistry;
use crate::tokens::TokenCounter;
use crate::tool::ToolRegistry;
use crate::workflow::{Edge, Node};

/// A file or document attached to the user's input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Text content or data URL.
    pub content: String,
}

/// Synchronous predicate used by router `custom` conditions and while-loop
/// custom evaluators. Receives the text under test.
pub type EvaluatorFn = dyn Fn(&str) -> bool + Send + Sync;

/// Mutable state of one run, guarded by a mutex because ready nodes within a
/// scheduler iteration execute concurrently.
#[derive(Debug, Default)]
pub struct RunState {
    /// Rolling latest output; seeds the next node's input.
    pub current_input: String,
    /// `id`, `id:branch`, and `id_error` keys.
    pub outputs: HashMap<String, String>,
    /// Completion-ordered trace; ids repeat only on loop re-entry.
    pub node_chain: Vec<String>,
    pub messages: Vec<ChatMessage>,
    pub executed: HashSet<String>,
    pub skipped: HashSet<String>,
    pub exec_counts: HashMap<String, u32>,
    pub usage_details: Vec<TokenUsageDetails>,
}

/// Options for an embedded subgraph run (while-loop bodies).
#[derive(Debug, Default)]
pub struct SubgraphOptions {
    /// Nodes pre-marked executed so the walk never enters them (typically
    /// the calling loop node).
    pub exclude: Vec<String>,
    /// Replacement `data` payloads keyed by node id.
    pub node_overrides: HashMap<String, Value>,
}

/// What an embedded subgraph run produced.
#[derive(Debug, Clone)]
pub struct SubgraphOutcome {
    /// Last emitted output.
    pub output: String,
    /// `next_nodes` of the final node, for callers that keep walking.
    pub next_nodes: Vec<String>,
}

/// Recursion seam between extensions and the scheduler: while-loops run
/// subgraphs, subflow nodes run whole workflows.
#[async_trait]
pub trait SubgraphRunner: Send + Sync {
    /// Sequential walk from `start_node_id`, sharing this run's outputs.
    async fn execute_subgraph(
        &self,
        start_node_id: &str,
        input: String,
        options: SubgraphOptions,
    ) -> Result<SubgraphOutcome, EngineError>;

    /// Run a nested workflow on a fresh scheduler (shared provider, extended
    /// node path, scoped observer, chained cancellation).
    async fn execute_workflow(
        &self,
        caller_node_id: &str,
        workflow: crate::workflow::Workflow,
        input: String,
    ) -> Result<ExecutionResult, EngineError>;
}

/// Everything a node extension may touch during `execute`.
#[derive(Clone)]
pub struct NodeContext {
    /// Input text for this node (possibly replaced by a HITL response).
    pub input: String,
    /// The run's original seed input.
    pub original_input: String,
    pub attachments: Arc<Vec<Attachment>>,
    pub node_id: String,
    /// Node id as observers see it (`sf:`-prefixed inside subflows).
    pub scoped_node_id: String,
    pub workflow_name: String,
    pub session_id: Option<String>,
    pub default_model: String,
    pub cancel: CancellationToken,
    pub subflow_depth: usize,
    pub max_subflow_depth: usize,

    pub provider: Arc<dyn LanguageModel>,
    pub tools: Arc<ToolRegistry>,
    pub memory: Option<Arc<dyn MemoryAdapter>>,
    pub subflow_registry: Option<Arc<dyn SubflowRegistry>>,
    /// Already scoped for subflows.
    pub observer: Arc<dyn ExecutionObserver>,
    pub counter: Arc<dyn TokenCounter>,
    pub compactor: Option<Arc<Compactor>>,
    /// Present when the engine was built with a HITL handler; used by the
    /// agent's tool-limit `hitl` behavior.
    pub hitl: Option<crate::hitl::HitlCoordinator>,
    pub custom_evaluators: Arc<HashMap<String, Arc<EvaluatorFn>>>,

    pub(crate) state: Arc<Mutex<RunState>>,
    pub(crate) graph: Arc<GraphIndex>,
    pub(crate) runner: Arc<dyn SubgraphRunner>,
}

impl NodeContext {
    /// Snapshot of the conversation history.
    pub fn history(&self) -> Vec<ChatMessage> {
        self.state.lock().unwrap().messages.clone()
    }

    /// Output of a previously executed node (or branch/error composite key).
    pub fn output_of(&self, key: &str) -> Option<String> {
        self.state.lock().unwrap().outputs.get(key).cloned()
    }

    pub fn outputs_snapshot(&self) -> HashMap<String, String> {
        self.state.lock().unwrap().outputs.clone()
    }

    /// Store a branch output under the `id:branch` composite key.
    pub fn store_branch_output(&self, branch_id: &str, output: &str) {
        self.state
            .lock()
            .unwrap()
            .outputs
            .insert(format!("{}:{}", self.node_id, branch_id), output.to_string());
    }

    pub fn node_chain(&self) -> Vec<String> {
        self.state.lock().unwrap().node_chain.clone()
    }

    pub fn get_node(&self, id: &str) -> Option<Node> {
        self.graph.node(id).cloned()
    }

    /// Outgoing edges filtered by handle; absent handles match everything
    /// (the default-channel fallback rule).
    pub fn outgoing_edges(&self, id: &str, handle: Option<&str>) -> Vec<Edge> {
        self.graph
            .outgoing_edges(id, handle)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Targets of this node's default-channel edges.
    pub fn default_children(&self) -> Vec<String> {
        self.graph.default_children(&self.node_id)
    }

    pub fn handle_children(&self, handle: &str) -> Vec<String> {
        self.graph.handle_children(&self.node_id, handle)
    }

    /// All child node ids regardless of handle, deduplicated.
    pub fn all_children(&self, id: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for child in self.graph.children(id) {
            if !out.contains(&child.node_id) {
                out.push(child.node_id.clone());
            }
        }
        out
    }

    pub fn strict_handle_children(&self, handle: &str) -> Vec<String> {
        self.graph.strict_handle_children(&self.node_id, handle)
    }

    /// Model for this node: `data.model` when present, else the engine
    /// default.
    pub fn resolve_model(&self, node: &Node) -> String {
        node.data
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.default_model.clone())
    }

    /// Context limit for a model: provider capabilities first, counter table
    /// as fallback.
    pub fn context_limit(&self, model: &str) -> u64 {
        self.provider
            .model_capabilities(model)
            .map(|caps| caps.context_length as u64)
            .unwrap_or_else(|| self.counter.limit(model) as u64)
    }

    /// Record one LLM call's usage into the run ledger and notify observers.
    pub fn record_usage(&self, usage: crate::provider::Usage, model: &str) {
        let mut details =
            TokenUsageDetails::from_usage(model, usage, self.context_limit(model));
        if let Some(compactor) = &self.compactor {
            details = details.with_compaction_threshold(compactor.threshold(model));
        }
        self.observer.on_token_usage(&self.node_id, &details);
        self.state.lock().unwrap().usage_details.push(details);
    }

    /// Fold a nested run's usage ledger into this run's, so subflow LLM
    /// calls count toward the top-level aggregate.
    pub fn merge_usage(&self, details: &[TokenUsageDetails]) {
        self.state
            .lock()
            .unwrap()
            .usage_details
            .extend(details.iter().cloned());
    }

    pub async fn execute_subgraph(
        &self,
        start_node_id: &str,
        input: String,
        options: SubgraphOptions,
    ) -> Result<SubgraphOutcome, EngineError> {
        self.runner
            .execute_subgraph(start_node_id, input, options)
            .await
    }

    pub async fn execute_workflow(
        &self,
        workflow: crate::workflow::Workflow,
        input: String,
    ) -> Result<ExecutionResult, EngineError> {
        self.runner
            .execute_workflow(&self.node_id, workflow, input)
            .await
    }
}
