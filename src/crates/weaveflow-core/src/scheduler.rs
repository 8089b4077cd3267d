//! Readiness-driven graph traversal.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ seed pending with the start node                            │
//! │ loop (bounded by max_iterations):                           │
//! │   partition pending into ready / deferred                   │
//! │     ready ⇔ every parent executed (start unconditionally)   │
//! │   mark ready nodes executed up-front                        │
//! │   run them concurrently through the per-node wrapper        │
//! │   per result: store output, enqueue next_nodes,             │
//! │               self-queued nodes re-arm (loop re-entry)      │
//! │   then: propagate skips through children not taken          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Skip propagation marks a node executed-without-output once all of its
//! parents are executed (skipped parents count), recursing through its
//! children, so joins downstream of a router unblock even when a branch
//! never fires. Outputs are stored and next nodes enqueued for the whole
//! batch before skips propagate, and an enqueued node is never skipped, so
//! two siblings finishing in the same iteration cannot race a join into the
//! skipped set.
//!
//! The per-node wrapper owns the error machinery: classification, the retry
//! window with status-aware backoff, the `stop`/`continue`/`branch` modes,
//! and the HITL pause points. Extensions only throw.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::compaction::Compactor;
use crate::context::{
    Attachment, EvaluatorFn, NodeContext, RunState, SubgraphOptions, SubgraphOutcome,
    SubgraphRunner,
};
use crate::engine::EngineOptions;
use crate::error::{EngineError, ErrorCode, ExecutionError, RateLimitInfo, RetryAttempt, RetryTrace};
use crate::extension::{ExtensionError, ExtensionRegistry, NodeOutcome};
use crate::graph::GraphIndex;
use crate::hitl::{HitlAction, HitlConfig, HitlContext, HitlCoordinator, HitlRequest, HitlResponse};
use crate::memory::MemoryAdapter;
use crate::messages::{ChatMessage, ChatRole};
use crate::observer::{ExecutionObserver, ScopedObserver};
use crate::provider::LanguageModel;
use crate::result::{ExecutionResult, TokenUsage};
use crate::retry::{sleep_cancellable, ErrorHandling, ErrorMode};
use crate::subflows::SubflowRegistry;
use crate::tokens::TokenCounter;
use crate::tool::ToolRegistry;
use crate::workflow::{handle, node_type, Node, Workflow};

/// Output stored when a HITL request is rejected.
pub const HITL_REJECTED_OUTPUT: &str = "HITL: Rejected";

/// Review-mode re-executions permitted before a rejection becomes terminal.
const MAX_REVIEW_REEXECUTIONS: u32 = 3;

/// Shared, immutable services threaded through every scheduler of a run
/// (top-level and subflow alike).
pub(crate) struct Services {
    pub provider: Arc<dyn LanguageModel>,
    pub options: Arc<EngineOptions>,
    pub extensions: Arc<ExtensionRegistry>,
    pub counter: Arc<dyn TokenCounter>,
    pub compactor: Option<Arc<Compactor>>,
    pub hitl: Option<HitlCoordinator>,
    pub tools: Arc<ToolRegistry>,
    pub memory: Option<Arc<dyn MemoryAdapter>>,
    pub subflows: Option<Arc<dyn SubflowRegistry>>,
    pub custom_evaluators: Arc<HashMap<String, Arc<EvaluatorFn>>>,
}

/// One scheduler instance per `execute` call (subflows get their own).
pub(crate) struct Scheduler {
    services: Arc<Services>,
    /// Unscoped observer, passed down so nested subflows can re-scope it.
    root_observer: Arc<dyn ExecutionObserver>,
    /// Observer this scheduler emits through (`sf:`-scoped inside subflows).
    observer: Arc<dyn ExecutionObserver>,
    graph: Arc<GraphIndex>,
    workflow_name: String,
    cancel: CancellationToken,
    state: Arc<Mutex<RunState>>,
    node_path: Vec<String>,
    subflow_depth: usize,
    original_input: String,
    attachments: Arc<Vec<Attachment>>,
    session_id: Option<String>,
    /// Serializes compaction passes so concurrent LLM nodes do not clobber
    /// each other's history rewrite.
    compaction_gate: tokio::sync::Mutex<()>,
    // Set once at construction; upgrades always succeed while running.
    self_ref: OnceLock<Weak<Scheduler>>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        services: Arc<Services>,
        root_observer: Arc<dyn ExecutionObserver>,
        graph: Arc<GraphIndex>,
        workflow_name: String,
        cancel: CancellationToken,
        node_path: Vec<String>,
        subflow_depth: usize,
        original_input: String,
        attachments: Arc<Vec<Attachment>>,
        session_id: Option<String>,
    ) -> Arc<Self> {
        let observer: Arc<dyn ExecutionObserver> = if node_path.is_empty() {
            root_observer.clone()
        } else {
            Arc::new(ScopedObserver::new(root_observer.clone(), &node_path))
        };

        let scheduler = Arc::new(Self {
            services,
            root_observer,
            observer,
            graph,
            workflow_name,
            cancel,
            state: Arc::new(Mutex::new(RunState::default())),
            node_path,
            subflow_depth,
            original_input,
            attachments,
            session_id,
            compaction_gate: tokio::sync::Mutex::new(()),
            self_ref: OnceLock::new(),
        });
        let _ = scheduler.self_ref.set(Arc::downgrade(&scheduler));
        scheduler
    }

    pub fn state(&self) -> Arc<Mutex<RunState>> {
        self.state.clone()
    }

    fn runner(&self) -> Arc<dyn SubgraphRunner> {
        // Invariant: self_ref is set in create() before any execution starts.
        self.self_ref
            .get()
            .and_then(Weak::upgrade)
            .expect("scheduler self reference set at construction")
    }

    fn options(&self) -> &EngineOptions {
        &self.services.options
    }

    fn max_iterations(&self) -> usize {
        self.options()
            .max_iterations
            .unwrap_or_else(|| 3 * self.graph.node_count().max(1))
    }

    /// Node id as the parent run's observers would see it.
    fn scoped_id(&self, id: &str) -> String {
        if self.node_path.is_empty() {
            id.to_string()
        } else {
            format!("{}{}", crate::observer::scope_prefix(&self.node_path), id)
        }
    }

    /// Seed the session with the user's input message.
    pub fn seed(&self, input: &str) {
        let mut state = self.state.lock().unwrap();
        state.current_input = input.to_string();
        state.messages.push(ChatMessage::user(input.to_string()));
    }

    /// Run the graph from `start_id` and assemble the final result.
    pub async fn run_to_result(&self, start_id: &str) -> ExecutionResult {
        let started = Instant::now();
        let run_error = self.run(start_id).await.err();
        self.assemble_result(run_error, started)
    }

    /// The main readiness loop.
    pub async fn run(&self, start_id: &str) -> Result<(), EngineError> {
        let mut pending: VecDeque<String> = VecDeque::from([start_id.to_string()]);
        let max_iterations = self.max_iterations();
        let max_node_executions = self.options().max_node_executions;
        let mut iterations = 0usize;

        while !pending.is_empty() {
            if self.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            iterations += 1;
            if iterations > max_iterations {
                error!(workflow = %self.workflow_name, max_iterations, "Scheduler iteration cap exceeded");
                return Err(EngineError::IterationLimit {
                    limit: max_iterations,
                });
            }

            // Partition into ready and deferred.
            let mut ready: Vec<String> = Vec::new();
            let mut deferred: VecDeque<String> = VecDeque::new();
            {
                let state = self.state.lock().unwrap();
                let mut seen: HashSet<String> = HashSet::new();
                while let Some(id) = pending.pop_front() {
                    if state.executed.contains(&id) || !seen.insert(id.clone()) {
                        continue;
                    }
                    let is_ready = id == start_id
                        || self
                            .graph
                            .parents(&id)
                            .iter()
                            .all(|p| state.executed.contains(p));
                    if is_ready {
                        ready.push(id);
                    } else {
                        deferred.push_back(id);
                    }
                }
            }

            if ready.is_empty() {
                if deferred.is_empty() {
                    break;
                }
                // Waiting on work that should eventually mark parents
                // complete; the iteration cap bounds a stalled graph.
                pending = deferred;
                continue;
            }

            // Mark executed up-front so concurrent completions cannot
            // re-queue a node mid-iteration, and trip the circuit breaker.
            {
                let mut state = self.state.lock().unwrap();
                for id in &ready {
                    state.executed.insert(id.clone());
                    let count = state.exec_counts.entry(id.clone()).or_insert(0);
                    *count += 1;
                    if *count > max_node_executions {
                        return Err(EngineError::NodeExecutionLimit {
                            node: id.clone(),
                            limit: max_node_executions,
                        });
                    }
                }
            }

            let input = self.state.lock().unwrap().current_input.clone();
            debug!(iteration = iterations, nodes = ?ready, "Executing ready nodes");

            let results = join_all(
                ready
                    .iter()
                    .map(|id| self.run_node(id.clone(), input.clone(), None)),
            )
            .await;

            pending.extend(deferred);

            // First pass: store outputs and enqueue declared next nodes.
            let mut completed: Vec<(String, NodeOutcome)> = Vec::new();
            for (id, result) in ready.into_iter().zip(results) {
                let outcome = result?;
                {
                    let mut state = self.state.lock().unwrap();
                    state.outputs.insert(id.clone(), outcome.output.clone());
                    state.current_input = outcome.output.clone();
                    state.node_chain.push(id.clone());
                    if let Some(message) = &outcome.assistant_message {
                        state.messages.push(ChatMessage::assistant(message.clone()));
                    }
                    if outcome.next_nodes.contains(&id) {
                        // Loop re-entry: the node may run again.
                        state.executed.remove(&id);
                    }
                }
                for next in &outcome.next_nodes {
                    pending.push_back(next.clone());
                }
                completed.push((id, outcome));
            }

            // Second pass: skip propagation for children not taken.
            for (id, outcome) in &completed {
                let node_kind = self
                    .graph
                    .node(id)
                    .map(|n| n.node_type.clone())
                    .unwrap_or_default();
                if node_kind == node_type::WHILE_LOOP {
                    // Loops manage their own control flow.
                    continue;
                }
                let not_taken: Vec<String> = self
                    .graph
                    .children(id)
                    .iter()
                    .map(|c| c.node_id.clone())
                    .filter(|child| !outcome.next_nodes.contains(child))
                    .collect();
                self.propagate_skips(not_taken, &pending);
            }
        }

        Ok(())
    }

    /// Mark candidates (and recursively their children) skipped+executed
    /// once every parent has resolved. Enqueued nodes stay live.
    fn propagate_skips(&self, candidates: Vec<String>, pending: &VecDeque<String>) {
        let mut queue: VecDeque<String> = candidates.into();
        let mut state = self.state.lock().unwrap();

        while let Some(id) = queue.pop_front() {
            if state.executed.contains(&id) || pending.contains(&id) {
                continue;
            }
            let all_resolved = self
                .graph
                .parents(&id)
                .iter()
                .all(|p| state.executed.contains(p));
            if !all_resolved {
                continue;
            }
            debug!(node = %id, "Skipping node (upstream path did not fire)");
            state.executed.insert(id.clone());
            state.skipped.insert(id.clone());
            for child in self.graph.children(&id) {
                queue.push_back(child.node_id.clone());
            }
        }
    }

    fn build_context(&self, node: &Node, input: String) -> NodeContext {
        NodeContext {
            input,
            original_input: self.original_input.clone(),
            attachments: self.attachments.clone(),
            node_id: node.id.clone(),
            scoped_node_id: self.scoped_id(&node.id),
            workflow_name: self.workflow_name.clone(),
            session_id: self.session_id.clone(),
            default_model: self.options().default_model.clone(),
            cancel: self.cancel.clone(),
            subflow_depth: self.subflow_depth,
            max_subflow_depth: self.options().max_subflow_depth,
            provider: self.services.provider.clone(),
            tools: self.services.tools.clone(),
            memory: self.services.memory.clone(),
            subflow_registry: self.services.subflows.clone(),
            observer: self.observer.clone(),
            counter: self.services.counter.clone(),
            compactor: self.services.compactor.clone(),
            hitl: self.services.hitl.clone(),
            custom_evaluators: self.services.custom_evaluators.clone(),
            state: self.state.clone(),
            graph: self.graph.clone(),
            runner: self.runner(),
        }
    }

    /// Compaction runs before LLM-using nodes, serialized across the run.
    async fn maybe_compact(&self, node: &Node) {
        let Some(compactor) = &self.services.compactor else {
            return;
        };
        if !matches!(
            node.node_type.as_str(),
            node_type::AGENT | node_type::ROUTER | node_type::WHILE_LOOP
        ) {
            return;
        }

        let _gate = self.compaction_gate.lock().await;
        let model = node
            .data
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(&self.options().default_model)
            .to_string();

        let mut messages = self.state.lock().unwrap().messages.clone();
        if let Some(report) = compactor
            .compact(&mut messages, &model, self.services.provider.as_ref(), &self.cancel)
            .await
        {
            self.state.lock().unwrap().messages = messages;
            self.observer.on_context_compacted(&report);
        }
    }

    /// Per-node wrapper: HITL, retry window, error-handling modes.
    async fn run_node(
        &self,
        id: String,
        input: String,
        data_override: Option<Value>,
    ) -> Result<NodeOutcome, EngineError> {
        let mut node = self
            .graph
            .node(&id)
            .cloned()
            .ok_or_else(|| EngineError::Validation(format!("Unknown node '{id}'")))?;
        if let Some(data) = data_override {
            node.data = data;
        }
        let extension = self
            .services
            .extensions
            .get(&node.node_type)
            .ok_or_else(|| EngineError::UnknownNodeType {
                node_type: node.node_type.clone(),
            })?;

        self.observer.on_node_start(&id, &node.node_type);
        self.maybe_compact(&node).await;

        let handling: ErrorHandling = node
            .data
            .get("errorHandling")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let retry = &handling.retry;
        let max_attempts = retry.max_attempts();

        let hitl_config = self.hitl_config_for(&node);

        let mut attempt: u32 = 1;
        let mut history: Vec<RetryAttempt> = Vec::new();

        loop {
            let result = self
                .attempt_node(&node, extension.as_ref(), &input, hitl_config.as_ref())
                .await;

            let failure = match result {
                Ok(outcome) => {
                    self.observer.on_node_finish(&id, &outcome.output);
                    return Ok(outcome);
                }
                Err(ExtensionError::Cancelled) => return Err(EngineError::Cancelled),
                Err(ExtensionError::Engine(boxed)) => {
                    let engine_err = *boxed;
                    if matches!(engine_err, EngineError::Cancelled) {
                        return Err(EngineError::Cancelled);
                    }
                    if let EngineError::Node(node_err) = engine_err {
                        self.observer.on_node_error(&id, &node_err);
                        return Err(EngineError::Node(node_err));
                    }
                    return Err(engine_err);
                }
                Err(failure) => failure,
            };

            if self.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let (message, status, retry_after, rate_limit, forced_code) =
                decompose_failure(&failure);
            let code = match (forced_code, status) {
                (Some(code), _) => code,
                (None, Some(status)) => ErrorCode::from_status(status),
                (None, None) => ErrorCode::from_message(&message),
            };

            if attempt < max_attempts && retry.retryable(code) {
                history.push(RetryAttempt {
                    attempt,
                    error: message.clone(),
                    timestamp: Utc::now(),
                });
                let delay = retry.delay(attempt, retry_after);
                warn!(
                    node = %id,
                    attempt,
                    max_attempts,
                    code = ?code,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "Node failed, retrying after delay"
                );
                sleep_cancellable(delay, &self.cancel).await?;
                attempt += 1;
                continue;
            }

            let exec_err = ExecutionError::new(message.clone(), &id, &node.node_type, status)
                .with_code(code)
                .with_retry(RetryTrace {
                    attempts: attempt,
                    max_attempts,
                    history,
                })
                .with_rate_limit(rate_limit)
                .with_cause(failure.to_string());

            match handling.mode {
                ErrorMode::Branch => {
                    let error_children = self.graph.strict_handle_children(&id, handle::ERROR);
                    if !error_children.is_empty() {
                        info!(node = %id, "Routing failure to error branch");
                        self.state
                            .lock()
                            .unwrap()
                            .outputs
                            .insert(format!("{id}_error"), exec_err.to_output_json());
                        self.observer.on_node_error(&id, &exec_err);
                        return Ok(NodeOutcome::new("").with_next(error_children));
                    }
                    // No error edge wired; fall through to stop.
                    self.observer.on_node_error(&id, &exec_err);
                    return Err(EngineError::Node(exec_err));
                }
                ErrorMode::Continue => {
                    warn!(node = %id, error = %exec_err, "Continuing past node failure");
                    self.observer.on_node_error(&id, &exec_err);
                    return Ok(NodeOutcome::new("").with_next(self.graph.default_children(&id)));
                }
                ErrorMode::Stop => {
                    error!(node = %id, error = %exec_err, "Node failed, stopping workflow");
                    self.observer.on_node_error(&id, &exec_err);
                    return Err(EngineError::Node(exec_err));
                }
            }
        }
    }

    /// HITL applies only to agent and router nodes, with a handler present.
    fn hitl_config_for(&self, node: &Node) -> Option<HitlConfig> {
        if self.services.hitl.is_none() {
            return None;
        }
        if !matches!(node.node_type.as_str(), node_type::AGENT | node_type::ROUTER) {
            return None;
        }
        node.data
            .get("hitl")
            .cloned()
            .and_then(|v| serde_json::from_value::<HitlConfig>(v).ok())
            .filter(|c| c.enabled)
    }

    async fn request_decision(
        &self,
        node: &Node,
        config: &HitlConfig,
        prompt: String,
        input: &str,
        output: Option<&str>,
    ) -> Result<HitlResponse, ExtensionError> {
        // Coordinator presence was checked by hitl_config_for.
        let Some(coordinator) = self.services.hitl.clone() else {
            return Err(ExtensionError::Config(
                "HITL requested without a handler".to_string(),
            ));
        };
        let request = HitlRequest::new(
            self.scoped_id(&node.id),
            node.label(),
            config,
            prompt,
            HitlContext {
                input: input.to_string(),
                output: output.map(str::to_string),
                workflow_name: self.workflow_name.clone(),
                session_id: self.session_id.clone(),
            },
        );
        coordinator
            .await_response(request, config.default_action, &self.cancel)
            .await
            .map_err(ExtensionError::from)
    }

    /// Rejection routes to the `rejected` handle when wired, otherwise the
    /// node fails terminally.
    fn rejected_outcome(&self, node: &Node) -> Result<NodeOutcome, ExtensionError> {
        let rejected = self
            .graph
            .strict_handle_children(&node.id, handle::REJECTED);
        if rejected.is_empty() {
            let err = ExecutionError::new(
                format!("HITL request rejected at node '{}'", node.id),
                &node.id,
                &node.node_type,
                None,
            );
            return Err(ExtensionError::Engine(Box::new(EngineError::Node(err))));
        }
        Ok(NodeOutcome::new(HITL_REJECTED_OUTPUT).with_next(rejected))
    }

    /// One attempt: the HITL state machine around the extension call.
    async fn attempt_node(
        &self,
        node: &Node,
        extension: &dyn crate::extension::NodeExtension,
        input: &str,
        hitl: Option<&HitlConfig>,
    ) -> Result<NodeOutcome, ExtensionError> {
        let Some(config) = hitl else {
            let ctx = self.build_context(node, input.to_string());
            return extension.execute(&ctx, node).await;
        };

        match config.mode {
            crate::hitl::HitlMode::Approval | crate::hitl::HitlMode::Input => {
                let verb = if config.mode == crate::hitl::HitlMode::Approval {
                    "Approve execution of"
                } else {
                    "Provide input for"
                };
                let prompt = config
                    .prompt
                    .clone()
                    .unwrap_or_else(|| format!("{verb} '{}'", node.label()));
                let response = self
                    .request_decision(node, config, prompt, input, None)
                    .await?;

                match response.action {
                    HitlAction::Approve | HitlAction::Submit | HitlAction::Modify => {
                        let effective = response.data.unwrap_or_else(|| input.to_string());
                        let ctx = self.build_context(node, effective);
                        extension.execute(&ctx, node).await
                    }
                    HitlAction::Skip => Ok(NodeOutcome::new(input.to_string())
                        .with_next(self.graph.default_children(&node.id))),
                    HitlAction::Reject => self.rejected_outcome(node),
                }
            }
            crate::hitl::HitlMode::Review => {
                let mut rounds = 0u32;
                loop {
                    let ctx = self.build_context(node, input.to_string());
                    let mut outcome = extension.execute(&ctx, node).await?;

                    let prompt = config
                        .prompt
                        .clone()
                        .unwrap_or_else(|| format!("Review the output of '{}'", node.label()));
                    let response = self
                        .request_decision(node, config, prompt, input, Some(&outcome.output))
                        .await?;

                    match response.action {
                        HitlAction::Approve | HitlAction::Submit => return Ok(outcome),
                        HitlAction::Modify => {
                            if let Some(data) = response.data {
                                if outcome.assistant_message.is_some() {
                                    outcome.assistant_message = Some(data.clone());
                                }
                                outcome.output = data;
                            }
                            return Ok(outcome);
                        }
                        HitlAction::Skip => {
                            return Ok(NodeOutcome::new(input.to_string())
                                .with_next(self.graph.default_children(&node.id)));
                        }
                        HitlAction::Reject => {
                            let rejected = self
                                .graph
                                .strict_handle_children(&node.id, handle::REJECTED);
                            if !rejected.is_empty() {
                                return Ok(NodeOutcome::new(HITL_REJECTED_OUTPUT)
                                    .with_next(rejected));
                            }
                            rounds += 1;
                            if rounds >= MAX_REVIEW_REEXECUTIONS {
                                return self.rejected_outcome(node);
                            }
                            // Re-execute and review again.
                        }
                    }
                }
            }
        }
    }

    /// Assemble the final result from the run state.
    pub fn assemble_result(
        &self,
        run_error: Option<EngineError>,
        started: Instant,
    ) -> ExecutionResult {
        let cancelled = matches!(run_error, Some(EngineError::Cancelled));
        let mut state = self.state.lock().unwrap();
        let success = run_error.is_none();

        let final_output = state.current_input.clone();
        if success && !final_output.is_empty() {
            let already = state
                .messages
                .last()
                .map(|m| m.role == ChatRole::Assistant && m.content == final_output)
                .unwrap_or(false);
            if !already {
                state.messages.push(ChatMessage::assistant(final_output.clone()));
            }
        }

        if cancelled {
            // Stopped runs drop their usage ledger so a long-lived engine
            // cannot accumulate events from abandoned executions.
            state.usage_details.clear();
        }

        let error = run_error.map(EngineError::into_execution_error);
        let last_active_node_id = error
            .as_ref()
            .filter(|e| !e.node_id.is_empty())
            .map(|e| e.node_id.clone())
            .or_else(|| state.node_chain.last().cloned());

        ExecutionResult {
            success,
            output: final_output.clone(),
            final_output,
            final_node_id: state.node_chain.last().cloned(),
            execution_order: state.node_chain.clone(),
            last_active_node_id,
            node_outputs: state.outputs.clone(),
            session_messages: state.messages.clone(),
            error,
            duration_ms: started.elapsed().as_millis() as u64,
            usage: TokenUsage::aggregate(&state.usage_details),
            token_usage_details: state.usage_details.clone(),
        }
    }
}

/// Break an extension failure into its classification inputs.
fn decompose_failure(
    failure: &ExtensionError,
) -> (
    String,
    Option<u16>,
    Option<f64>,
    Option<RateLimitInfo>,
    Option<ErrorCode>,
) {
    match failure {
        ExtensionError::Provider(p) => (
            p.message.clone(),
            p.status,
            p.retry_after
                .or_else(|| p.rate_limit.as_ref().and_then(|r| r.retry_after)),
            p.rate_limit.clone(),
            None,
        ),
        ExtensionError::Config(message) => {
            (message.clone(), None, None, None, Some(ErrorCode::Validation))
        }
        other => (other.to_string(), None, None, None, None),
    }
}

#[async_trait]
impl SubgraphRunner for Scheduler {
    /// Sequential walk used by while-loop bodies: pre-marks the start's
    /// parents (and excluded nodes) as executed, shares the run's outputs,
    /// and returns the last emitted output.
    async fn execute_subgraph(
        &self,
        start_node_id: &str,
        input: String,
        options: SubgraphOptions,
    ) -> Result<SubgraphOutcome, EngineError> {
        let mut executed: HashSet<String> = options.exclude.iter().cloned().collect();
        for parent in self.graph.parents(start_node_id) {
            executed.insert(parent.clone());
        }

        let mut pending: VecDeque<String> = VecDeque::from([start_node_id.to_string()]);
        let mut current_input = input.clone();
        let mut last_output = input;
        let mut last_next: Vec<String> = Vec::new();
        let cap = self.max_iterations();
        let mut steps = 0usize;

        while let Some(id) = pending.pop_front() {
            if self.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            steps += 1;
            if steps > cap {
                return Err(EngineError::IterationLimit { limit: cap });
            }
            if executed.contains(&id) {
                continue;
            }

            // Readiness against both the local walk and the outer run.
            let ready = id == start_node_id || {
                let state = self.state.lock().unwrap();
                self.graph
                    .parents(&id)
                    .iter()
                    .all(|p| executed.contains(p) || state.executed.contains(p))
            };
            if !ready {
                pending.push_back(id);
                continue;
            }

            executed.insert(id.clone());
            let data_override = options.node_overrides.get(&id).cloned();
            let outcome = self
                .run_node(id.clone(), current_input.clone(), data_override)
                .await?;

            {
                let mut state = self.state.lock().unwrap();
                state.outputs.insert(id.clone(), outcome.output.clone());
                state.node_chain.push(id.clone());
                if let Some(message) = &outcome.assistant_message {
                    state.messages.push(ChatMessage::assistant(message.clone()));
                }
            }

            current_input = outcome.output.clone();
            last_output = outcome.output.clone();
            last_next = outcome.next_nodes.clone();

            // Skip-and-recurse for children the node did not take, local to
            // this walk.
            let mut skip_queue: VecDeque<String> = self
                .graph
                .children(&id)
                .iter()
                .map(|c| c.node_id.clone())
                .filter(|c| !outcome.next_nodes.contains(c))
                .collect();
            while let Some(skip_id) = skip_queue.pop_front() {
                if executed.contains(&skip_id) || pending.contains(&skip_id) {
                    continue;
                }
                let resolved = {
                    let state = self.state.lock().unwrap();
                    self.graph
                        .parents(&skip_id)
                        .iter()
                        .all(|p| executed.contains(p) || state.executed.contains(p))
                };
                if resolved {
                    executed.insert(skip_id.clone());
                    for child in self.graph.children(&skip_id) {
                        skip_queue.push_back(child.node_id.clone());
                    }
                }
            }

            for next in outcome.next_nodes {
                if !executed.contains(&next) {
                    pending.push_back(next);
                }
            }
        }

        Ok(SubgraphOutcome {
            output: last_output,
            next_nodes: last_next,
        })
    }

    /// Nested workflow on a fresh scheduler: shared services, extended node
    /// path, `sf:`-scoped observer, chained cancellation, suppressed
    /// `on_complete`.
    async fn execute_workflow(
        &self,
        caller_node_id: &str,
        workflow: Workflow,
        input: String,
    ) -> Result<ExecutionResult, EngineError> {
        let start = workflow
            .start_node()
            .ok_or(EngineError::MissingStartNode)?
            .id
            .clone();

        let mut node_path = self.node_path.clone();
        node_path.push(caller_node_id.to_string());

        let graph = Arc::new(GraphIndex::build(&workflow));
        let child = Scheduler::create(
            self.services.clone(),
            self.root_observer.clone(),
            graph,
            workflow.meta.name.clone(),
            self.cancel.child_token(),
            node_path,
            self.subflow_depth + 1,
            input.clone(),
            self.attachments.clone(),
            self.session_id.clone(),
        );

        child.seed(&input);
        Ok(child.run_to_result(&start).await)
    }
}
