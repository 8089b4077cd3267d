//! The node extension contract.
//!
//! Every node type is implemented by an extension: a capability set of
//! `execute` + `validate` + port/default-data declarations. The registry maps
//! the node's `type` string to its extension (lookup stays dynamic because
//! workflows are user-authored JSON) and is an engine construction
//! parameter, not process-wide state, so nested schedulers and tests get
//! their own.
//!
//! Extensions throw on unrecoverable errors; retry, error-branch routing,
//! and HITL wrapping happen in the scheduler's per-node wrapper, never here.

mod agent;
mod output;
mod parallel;
mod router;
mod start;
mod subflow;
mod while_loop;

pub use agent::{AgentData, AgentExtension, ToolLimitBehavior};
pub use output::{OutputData, OutputExtension, OutputFormat};
pub use parallel::{BranchData, ParallelData, ParallelExtension};
pub use router::{
    ConditionKind, RouteCondition, RouteData, RouterData, RouterExtension, RouterFallback,
};
pub use start::StartExtension;
pub use subflow::{InputMapping, SubflowData, SubflowExtension};
pub use while_loop::{
    LoopMode, LoopOutputMode, MaxIterationsBehavior, WhileLoopData, WhileLoopExtension,
};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::context::NodeContext;
use crate::error::EngineError;
use crate::graph::GraphIndex;
use crate::provider::ProviderError;
use crate::workflow::Node;

/// A named port on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    pub id: &'static str,
    pub label: &'static str,
}

/// Declared input/output ports of an extension.
#[derive(Debug, Clone, Default)]
pub struct Ports {
    pub inputs: Vec<PortSpec>,
    pub outputs: Vec<PortSpec>,
}

/// What a node execution produced.
#[derive(Debug, Clone, Default)]
pub struct NodeOutcome {
    pub output: String,
    /// Nodes to enqueue next. A node returning itself re-enters (loops).
    pub next_nodes: Vec<String>,
    /// Extension-specific extras (e.g. the router's `selectedRoute`).
    pub metadata: Option<Value>,
    /// Assistant turn to append to the session. Explicit return channel so
    /// the scheduler never special-cases node types for history writes.
    pub assistant_message: Option<String>,
}

impl NodeOutcome {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Default::default()
        }
    }

    pub fn with_next(mut self, next_nodes: Vec<String>) -> Self {
        self.next_nodes = next_nodes;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_assistant_message(mut self, message: impl Into<String>) -> Self {
        self.assistant_message = Some(message.into());
        self
    }
}

/// Failure raised by an extension. The scheduler's wrapper classifies it
/// into the structured error taxonomy.
#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Workflow cancelled")]
    Cancelled,

    /// Node configuration is unusable. Classified `VALIDATION`, never
    /// retried.
    #[error("{0}")]
    Config(String),

    /// Anything else; classified by message keywords.
    #[error("{0}")]
    Failed(String),

    /// Fatal engine-level failure surfaced through a nested run.
    #[error(transparent)]
    Engine(Box<EngineError>),
}

impl From<EngineError> for ExtensionError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Cancelled => ExtensionError::Cancelled,
            other => ExtensionError::Engine(Box::new(other)),
        }
    }
}

/// Behavioral implementation of one node type.
#[async_trait]
pub trait NodeExtension: Send + Sync {
    /// The node `type` string this extension serves.
    fn name(&self) -> &'static str;

    fn ports(&self) -> Ports {
        Ports::default()
    }

    /// Template `data` payload for newly created nodes.
    fn default_data(&self) -> Value;

    async fn execute(
        &self,
        ctx: &NodeContext,
        node: &Node,
    ) -> Result<NodeOutcome, ExtensionError>;

    /// Static checks run during preflight validation. Returns human-readable
    /// problems; empty means valid.
    fn validate(&self, _node: &Node, _graph: &GraphIndex) -> Vec<String> {
        Vec::new()
    }
}

/// `type` string → extension. Constructed per engine.
#[derive(Clone, Default)]
pub struct ExtensionRegistry {
    extensions: HashMap<String, Arc<dyn NodeExtension>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with all built-in node types.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(StartExtension));
        registry.register(Arc::new(AgentExtension));
        registry.register(Arc::new(RouterExtension));
        registry.register(Arc::new(ParallelExtension));
        registry.register(Arc::new(WhileLoopExtension));
        registry.register(Arc::new(SubflowExtension));
        registry.register(Arc::new(OutputExtension));
        registry
    }

    pub fn register(&mut self, extension: Arc<dyn NodeExtension>) {
        self.extensions
            .insert(extension.name().to_string(), extension);
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeExtension>> {
        self.extensions.get(node_type).cloned()
    }

    pub fn types(&self) -> Vec<String> {
        self.extensions.keys().cloned().collect()
    }
}
