//! # weaveflow-core: graph execution engine for LLM workflows
//!
//! Executes user-authored workflows: directed graphs of typed nodes (start,
//! agent, router, parallel, whileLoop, subflow, output) over an injected LLM
//! provider. The engine traverses the graph readiness-first, invokes the
//! model at computational nodes, streams tokens to observers, routes control
//! between nodes, manages conversation history (including automatic
//! compaction), handles retries and human-in-the-loop pauses, and returns an
//! aggregate result.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Engine (execute / stop / is_running)                     │
//! │   • preflight validation, result assembly, usage rollup  │
//! └───────────────┬──────────────────────────────────────────┘
//!                 │ one per execute (and per subflow)
//! ┌───────────────▼──────────────────────────────────────────┐
//! │ Scheduler                                                │
//! │   • ready-set traversal, skip propagation, caps          │
//! │   • per-node wrapper: retry / error modes / HITL         │
//! │   • subgraph + sub-workflow recursion                    │
//! └───────────────┬──────────────────────────────────────────┘
//!                 │ dynamic dispatch by node `type`
//! ┌───────────────▼──────────────────────────────────────────┐
//! │ Node extensions (the only LLM callers)                   │
//! │   start · agent · router · parallel · whileLoop ·        │
//! │   subflow · output                                       │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Collaborators are consumed through traits and injected at construction:
//! [`LanguageModel`] (the provider), [`MemoryAdapter`], [`HitlHandler`],
//! [`SubflowRegistry`], and [`Tool`]s. The engine owns none of them and
//! persists nothing.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use weaveflow_core::{Engine, EngineOptions, ExecutionInput, NoopObserver, Workflow};
//!
//! let workflow = Workflow::from_json(&std::fs::read_to_string("flow.json")?)?;
//! let engine = Engine::new(provider, EngineOptions::default());
//! let result = engine
//!     .execute(&workflow, ExecutionInput::text("hello"), Arc::new(NoopObserver))
//!     .await;
//! println!("{}", result.final_output);
//! ```

pub mod compaction;
pub mod context;
pub mod engine;
pub mod error;
pub mod extension;
pub mod graph;
pub mod hitl;
pub mod memory;
pub mod messages;
pub mod observer;
pub mod provider;
pub mod result;
pub mod retry;
mod scheduler;
pub mod subflows;
pub mod tokens;
pub mod tool;
pub mod workflow;

pub use compaction::{
    CompactionConfig, CompactionReport, CompactionStrategy, Compactor, Threshold,
};
pub use context::{Attachment, NodeContext, SubgraphOptions, SubgraphOutcome, SubgraphRunner};
pub use engine::{Engine, EngineOptions, ExecutionInput, ResumeState};
pub use error::{
    EngineError, ErrorCode, ExecutionError, RateLimitInfo, RetryAttempt, RetryTrace,
};
pub use extension::{
    AgentData, AgentExtension, ExtensionError, ExtensionRegistry, NodeExtension, NodeOutcome,
    OutputData, OutputExtension, OutputFormat, ParallelData, ParallelExtension, Ports, PortSpec,
    RouteCondition, RouteData, RouterData, RouterExtension, RouterFallback, StartExtension,
    SubflowData, SubflowExtension, WhileLoopData, WhileLoopExtension,
};
pub use graph::{ChildRef, GraphIndex};
pub use hitl::{
    HitlAction, HitlConfig, HitlContext, HitlCoordinator, HitlHandler, HitlMode, HitlRequest,
    HitlResponse,
};
pub use memory::{InMemoryMemory, MemoryAdapter, MemoryEntry, MemoryQuery};
pub use messages::{ChatMessage, ChatRole};
pub use observer::{ExecutionObserver, NoopObserver, ScopedObserver};
pub use provider::{
    ChatRequest, ChatResponse, LanguageModel, ModelCapabilities, ProviderError, TokenSink, Usage,
};
pub use result::{ExecutionResult, TokenUsage, TokenUsageDetails};
pub use retry::{ErrorHandling, ErrorMode, RetryConfig};
pub use subflows::{InMemorySubflowRegistry, SubflowRegistry};
pub use tokens::{HeuristicTokenCounter, TokenCounter, DEFAULT_CONTEXT_LIMIT};
pub use tool::{Tool, ToolCall, ToolDefinition, ToolError, ToolRegistry};
pub use workflow::{Edge, Node, Position, Workflow, WorkflowMeta, SCHEMA_VERSION};
