//! Public execution facade.
//!
//! An [`Engine`] is constructed once with an LLM provider and an options
//! bundle, then invoked any number of times with `(workflow, input,
//! observer)`. Each `execute` cancels any in-flight run on the same
//! instance, installs a fresh cancellation token, optionally runs preflight
//! validation, and drives a [`Scheduler`](crate::scheduler) over the graph.
//! `execute` never returns an error: failures come back as a result with
//! `success = false` and partial progress preserved.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::compaction::{CompactionConfig, Compactor};
use crate::context::{Attachment, EvaluatorFn};
use crate::error::{EngineError, ErrorCode, ExecutionError};
use crate::extension::ExtensionRegistry;
use crate::graph::GraphIndex;
use crate::hitl::{HitlCoordinator, HitlHandler};
use crate::memory::MemoryAdapter;
use crate::messages::ChatMessage;
use crate::observer::ExecutionObserver;
use crate::provider::LanguageModel;
use crate::result::ExecutionResult;
use crate::scheduler::{Scheduler, Services};
use crate::subflows::SubflowRegistry;
use crate::tokens::{HeuristicTokenCounter, TokenCounter};
use crate::tool::ToolRegistry;
use crate::workflow::{node_type, Workflow};

const DEFAULT_MAX_NODE_EXECUTIONS: u32 = 100;
const DEFAULT_MAX_SUBFLOW_DEPTH: usize = 10;

/// Engine-wide configuration.
pub struct EngineOptions {
    /// Model used when a node does not name one.
    pub default_model: String,
    /// Scheduler iteration cap; `None` means `3 × |nodes|`.
    pub max_iterations: Option<usize>,
    /// Per-node execution circuit breaker.
    pub max_node_executions: u32,
    pub max_subflow_depth: usize,
    /// Run preflight validation before each execute.
    pub validate_before_run: bool,
    pub compaction: Option<CompactionConfig>,
    pub token_counter: Arc<dyn TokenCounter>,
    pub tools: ToolRegistry,
    pub memory: Option<Arc<dyn MemoryAdapter>>,
    pub subflows: Option<Arc<dyn SubflowRegistry>>,
    pub hitl: Option<Arc<dyn HitlHandler>>,
    /// Named predicates for router `custom` conditions and loop evaluators.
    pub custom_evaluators: HashMap<String, Arc<EvaluatorFn>>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            default_model: "gpt-4o-mini".to_string(),
            max_iterations: None,
            max_node_executions: DEFAULT_MAX_NODE_EXECUTIONS,
            max_subflow_depth: DEFAULT_MAX_SUBFLOW_DEPTH,
            validate_before_run: true,
            compaction: None,
            token_counter: HeuristicTokenCounter::shared(),
            tools: ToolRegistry::new(),
            memory: None,
            subflows: None,
            hitl: None,
            custom_evaluators: HashMap::new(),
        }
    }
}

impl EngineOptions {
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = Some(max);
        self
    }

    pub fn with_max_node_executions(mut self, max: u32) -> Self {
        self.max_node_executions = max;
        self
    }

    pub fn with_max_subflow_depth(mut self, max: usize) -> Self {
        self.max_subflow_depth = max;
        self
    }

    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.validate_before_run = enabled;
        self
    }

    pub fn with_compaction(mut self, config: CompactionConfig) -> Self {
        self.compaction = Some(config);
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryAdapter>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_subflows(mut self, subflows: Arc<dyn SubflowRegistry>) -> Self {
        self.subflows = Some(subflows);
        self
    }

    pub fn with_hitl(mut self, handler: Arc<dyn HitlHandler>) -> Self {
        self.hitl = Some(handler);
        self
    }

    pub fn with_evaluator(
        mut self,
        name: impl Into<String>,
        evaluator: Arc<EvaluatorFn>,
    ) -> Self {
        self.custom_evaluators.insert(name.into(), evaluator);
        self
    }
}

/// Saved progress to continue a prior run from.
#[derive(Debug, Clone, Default)]
pub struct ResumeState {
    /// Node to re-run first. `None` resumes a completed run: nothing
    /// re-executes and the restored state is returned as-is.
    pub start_node_id: Option<String>,
    pub node_outputs: HashMap<String, String>,
    pub execution_order: Vec<String>,
    pub last_active_node_id: Option<String>,
    pub final_node_id: Option<String>,
    pub resume_input: Option<String>,
    pub session_messages: Vec<ChatMessage>,
}

/// Input bundle for one execute call.
#[derive(Default)]
pub struct ExecutionInput {
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub session_id: Option<String>,
    pub resume: Option<ResumeState>,
}

impl ExecutionInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_resume(mut self, resume: ResumeState) -> Self {
        self.resume = Some(resume);
        self
    }
}

/// The workflow execution engine.
pub struct Engine {
    services: Arc<Services>,
    running: AtomicBool,
    run_seq: AtomicU64,
    current: Mutex<Option<CancellationToken>>,
}

impl Engine {
    /// Engine with the built-in node extensions.
    pub fn new(provider: Arc<dyn LanguageModel>, options: EngineOptions) -> Self {
        Self::with_extensions(provider, options, ExtensionRegistry::with_defaults())
    }

    /// Engine with a custom extension registry (additional node types, or
    /// replacements for the built-ins).
    pub fn with_extensions(
        provider: Arc<dyn LanguageModel>,
        options: EngineOptions,
        extensions: ExtensionRegistry,
    ) -> Self {
        let counter = options.token_counter.clone();
        let compactor = options
            .compaction
            .clone()
            .map(|config| Arc::new(Compactor::new(config, counter.clone())));
        let hitl = options.hitl.clone().map(HitlCoordinator::new);
        let tools = Arc::new(options.tools.clone());
        let memory = options.memory.clone();
        let subflows = options.subflows.clone();
        let custom_evaluators = Arc::new(options.custom_evaluators.clone());

        let services = Arc::new(Services {
            provider,
            options: Arc::new(options),
            extensions: Arc::new(extensions),
            counter,
            compactor,
            hitl,
            tools,
            memory,
            subflows,
            custom_evaluators,
        });

        Self {
            services,
            running: AtomicBool::new(false),
            run_seq: AtomicU64::new(0),
            current: Mutex::new(None),
        }
    }

    /// Whether an execute call is in flight on this engine.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Abort the in-flight execution, if any. The run unwinds through normal
    /// error propagation and returns a `success = false` result.
    pub fn stop(&self) {
        if let Some(token) = self.current.lock().unwrap().as_ref() {
            info!("Stopping workflow execution");
            token.cancel();
        }
    }

    /// Preflight validation: graph shape plus every extension's own checks.
    pub fn validate(&self, workflow: &Workflow) -> Vec<String> {
        let mut problems = Vec::new();

        let starts = workflow
            .nodes
            .iter()
            .filter(|n| n.node_type == node_type::START)
            .count();
        if starts != 1 {
            problems.push(format!(
                "Workflow must have exactly one start node (found {starts})"
            ));
        }

        let graph = GraphIndex::build(workflow);
        for node in &workflow.nodes {
            match self.services.extensions.get(&node.node_type) {
                None => problems.push(format!(
                    "No extension registered for node type '{}'",
                    node.node_type
                )),
                Some(extension) => problems.extend(extension.validate(node, &graph)),
            }

            let hitl_enabled = node
                .data
                .get("hitl")
                .and_then(|h| h.get("enabled"))
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);
            if hitl_enabled
                && !matches!(node.node_type.as_str(), node_type::AGENT | node_type::ROUTER)
            {
                problems.push(format!(
                    "Node '{}' enables HITL but type '{}' does not support it",
                    node.id, node.node_type
                ));
            }
        }
        problems
    }

    /// Run a workflow to completion. Always returns a result; on failure
    /// `success` is false, `error` is set, and partial progress is kept.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        input: ExecutionInput,
        observer: Arc<dyn ExecutionObserver>,
    ) -> ExecutionResult {
        let seq = self.run_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        {
            let mut current = self.current.lock().unwrap();
            if let Some(previous) = current.take() {
                warn!("Cancelling in-flight execution superseded by a new execute call");
                previous.cancel();
            }
            *current = Some(cancel.clone());
        }
        self.running.store(true, Ordering::SeqCst);

        let result = self
            .execute_inner(workflow, input, observer, cancel)
            .await;

        if self.run_seq.load(Ordering::SeqCst) == seq {
            self.running.store(false, Ordering::SeqCst);
            self.current.lock().unwrap().take();
        }
        result
    }

    async fn execute_inner(
        &self,
        workflow: &Workflow,
        input: ExecutionInput,
        observer: Arc<dyn ExecutionObserver>,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let started = Instant::now();
        info!(workflow = %workflow.meta.name, "Starting workflow execution");

        if self.services.options.validate_before_run {
            let problems = self.validate(workflow);
            if !problems.is_empty() {
                let err = ExecutionError::new(
                    format!("Workflow validation failed: {}", problems.join("; ")),
                    "",
                    "",
                    None,
                )
                .with_code(ErrorCode::Validation);
                observer.on_node_error("", &err);
                let result = failed_result(err, started);
                observer.on_complete(&result);
                return result;
            }
        }

        let Some(start) = workflow.start_node() else {
            let err = EngineError::MissingStartNode.into_execution_error();
            let result = failed_result(err, started);
            observer.on_complete(&result);
            return result;
        };

        let graph = Arc::new(GraphIndex::build(workflow));
        let scheduler = Scheduler::create(
            self.services.clone(),
            observer.clone(),
            graph,
            workflow.meta.name.clone(),
            cancel,
            Vec::new(),
            0,
            input.text.clone(),
            Arc::new(input.attachments),
            input.session_id,
        );

        let start_id = match input.resume {
            Some(resume) => {
                let start_id = resume.start_node_id.clone();
                seed_resume(&scheduler, resume, &input.text);
                match start_id {
                    Some(id) => id,
                    None => {
                        // Completed-run resume: nothing to re-execute.
                        let result = scheduler.assemble_result(None, started);
                        observer.on_complete(&result);
                        return result;
                    }
                }
            }
            None => {
                scheduler.seed(&input.text);
                start.id.clone()
            }
        };

        let run_error = scheduler.run(&start_id).await.err();
        let cancelled = matches!(run_error, Some(EngineError::Cancelled));
        let result = scheduler.assemble_result(run_error, started);

        info!(
            workflow = %workflow.meta.name,
            success = result.success,
            duration_ms = result.duration_ms,
            nodes = result.execution_order.len(),
            "Workflow execution finished"
        );

        if !cancelled {
            observer.on_complete(&result);
        }
        result
    }
}

/// Restore prior progress into a fresh scheduler. The resume target (when
/// set) is left un-executed so it re-runs.
fn seed_resume(scheduler: &Scheduler, resume: ResumeState, fallback_input: &str) {
    let state = scheduler.state();
    let mut state = state.lock().unwrap();

    let mut executed: HashSet<String> = resume
        .node_outputs
        .keys()
        // Composite branch/error keys are outputs, not nodes.
        .filter(|k| !k.contains(':') && !k.ends_with("_error"))
        .cloned()
        .collect();
    if let Some(target) = &resume.start_node_id {
        executed.remove(target);
    }

    state.outputs = resume.node_outputs;
    state.executed = executed;
    state.node_chain = resume.execution_order;
    state.messages = resume.session_messages;
    state.current_input = resume
        .resume_input
        .unwrap_or_else(|| fallback_input.to_string());
}

fn failed_result(err: ExecutionError, started: Instant) -> ExecutionResult {
    ExecutionResult {
        success: false,
        error: Some(err),
        duration_ms: started.elapsed().as_millis() as u64,
        ..Default::default()
    }
}
