//! End-to-end engine tests over mock providers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use weaveflow_core::{
    ChatMessage, ChatRequest, ChatResponse, ChatRole, CompactionConfig, CompactionReport,
    CompactionStrategy, Edge, Engine, EngineOptions, ExecutionError, ExecutionInput,
    ExecutionObserver, ExecutionResult, HitlAction, HitlHandler, HitlRequest, HitlResponse,
    InMemorySubflowRegistry, LanguageModel, Node, ProviderError, ResumeState, Threshold, Tool,
    ToolCall, ToolDefinition, ToolError, ToolRegistry, TokenUsageDetails, Usage, Workflow,
};

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

fn usage() -> Usage {
    Usage {
        prompt_tokens: 10,
        completion_tokens: 5,
        total_tokens: 15,
    }
}

/// Replays a script of responses/errors in call order.
struct SequenceProvider {
    script: Mutex<VecDeque<Result<ChatResponse, ProviderError>>>,
    calls: AtomicU32,
}

impl SequenceProvider {
    fn new(script: Vec<Result<ChatResponse, ProviderError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicU32::new(0),
        }
    }

    fn text(replies: &[&str]) -> Self {
        Self::new(
            replies
                .iter()
                .map(|r| Ok(ChatResponse::text(*r).with_usage(usage())))
                .collect(),
        )
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for SequenceProvider {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Stream the reply so token callbacks fire like a real provider.
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ChatResponse::text("done").with_usage(usage())));
        if let (Ok(response), Some(sink)) = (&next, &request.on_token) {
            if let Some(content) = &response.content {
                sink(content);
            }
        }
        next
    }
}

/// Responds based on the last message's content; order-independent, for
/// concurrent branches.
struct MatchProvider {
    rules: Vec<(&'static str, &'static str)>,
}

#[async_trait]
impl LanguageModel for MatchProvider {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let last = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        for (needle, reply) in &self.rules {
            if last.contains(needle) {
                return Ok(ChatResponse::text(*reply).with_usage(usage()));
            }
        }
        Ok(ChatResponse::text("unmatched").with_usage(usage()))
    }
}

/// Hangs until the request's cancellation token fires.
struct SlowProvider;

#[async_trait]
impl LanguageModel for SlowProvider {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(30)) => {
                Ok(ChatResponse::text("late"))
            }
            _ = request.cancel.cancelled() => Err(ProviderError::new("request cancelled")),
        }
    }
}

/// Observer that records everything it sees.
#[derive(Default)]
struct Recorder {
    starts: Mutex<Vec<String>>,
    finishes: Mutex<Vec<(String, String)>>,
    errors: Mutex<Vec<String>>,
    tokens: Mutex<Vec<(String, String)>>,
    routes: Mutex<Vec<(String, String)>>,
    loop_iterations: Mutex<Vec<(u32, u32)>>,
    branch_completes: Mutex<Vec<(String, String)>>,
    tool_calls: AtomicU32,
    compactions: AtomicU32,
    completes: AtomicU32,
}

impl ExecutionObserver for Recorder {
    fn on_node_start(&self, node_id: &str, _node_type: &str) {
        self.starts.lock().unwrap().push(node_id.to_string());
    }

    fn on_node_finish(&self, node_id: &str, output: &str) {
        self.finishes
            .lock()
            .unwrap()
            .push((node_id.to_string(), output.to_string()));
    }

    fn on_node_error(&self, node_id: &str, _error: &ExecutionError) {
        self.errors.lock().unwrap().push(node_id.to_string());
    }

    fn on_token(&self, node_id: &str, token: &str) {
        self.tokens
            .lock()
            .unwrap()
            .push((node_id.to_string(), token.to_string()));
    }

    fn on_route_selected(&self, node_id: &str, route_id: &str) {
        self.routes
            .lock()
            .unwrap()
            .push((node_id.to_string(), route_id.to_string()));
    }

    fn on_loop_iteration(&self, _node_id: &str, iteration: u32, max_iterations: u32) {
        self.loop_iterations
            .lock()
            .unwrap()
            .push((iteration, max_iterations));
    }

    fn on_branch_complete(&self, _node_id: &str, branch_id: &str, output: &str) {
        self.branch_completes
            .lock()
            .unwrap()
            .push((branch_id.to_string(), output.to_string()));
    }

    fn on_tool_call(&self, _node_id: &str, _call: &ToolCall) {
        self.tool_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn on_token_usage(&self, _node_id: &str, _details: &TokenUsageDetails) {}

    fn on_context_compacted(&self, _report: &CompactionReport) {
        self.compactions.fetch_add(1, Ordering::SeqCst);
    }

    fn on_complete(&self, _result: &ExecutionResult) {
        self.completes.fetch_add(1, Ordering::SeqCst);
    }
}

struct Echo;

#[async_trait]
impl Tool for Echo {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "echo",
            "Echo text back",
            json!({"type": "object", "properties": {"text": {"type": "string"}}}),
        )
    }

    async fn call(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        Ok(arguments["text"].clone())
    }
}

struct Decide(HitlAction);

#[async_trait]
impl HitlHandler for Decide {
    async fn on_request(&self, request: HitlRequest) -> HitlResponse {
        HitlResponse::new(request.id, self.0)
    }
}

// ---------------------------------------------------------------------------
// Workflow builders
// ---------------------------------------------------------------------------

fn linear_workflow() -> Workflow {
    Workflow::new(
        "linear",
        vec![
            Node::new("s", "start", json!({})),
            Node::new("a", "agent", json!({ "model": "test-model", "prompt": "P" })),
            Node::new("out", "output", json!({ "template": "{{a}}" })),
        ],
        vec![Edge::new("e1", "s", "a"), Edge::new("e2", "a", "out")],
    )
}

fn router_workflow() -> Workflow {
    Workflow::new(
        "routed",
        vec![
            Node::new("s", "start", json!({})),
            Node::new(
                "router",
                "router",
                json!({ "routes": [{ "id": "L" }, { "id": "R" }] }),
            ),
            Node::new("agentL", "agent", json!({})),
            Node::new("agentR", "agent", json!({})),
        ],
        vec![
            Edge::new("e1", "s", "router"),
            Edge::new("e2", "router", "agentL").with_source_handle("L"),
            Edge::new("e3", "router", "agentR").with_source_handle("R"),
        ],
    )
}

// ---------------------------------------------------------------------------
// Spec scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn linear_pipeline() {
    let provider = Arc::new(SequenceProvider::text(&["pong"]));
    let engine = Engine::new(provider.clone(), EngineOptions::default());
    let observer = Arc::new(Recorder::default());

    let result = engine
        .execute(&linear_workflow(), ExecutionInput::text("hi"), observer.clone())
        .await;

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.final_output, "pong");
    assert_eq!(result.execution_order, vec!["s", "a", "out"]);
    assert_eq!(provider.calls(), 1);

    // Exactly one finish for the agent, carrying its output.
    let finishes = observer.finishes.lock().unwrap();
    let agent_finishes: Vec<_> = finishes.iter().filter(|(id, _)| id == "a").collect();
    assert_eq!(agent_finishes.len(), 1);
    assert_eq!(agent_finishes[0].1, "pong");

    // Session ends with the assistant turn.
    let last = result.session_messages.last().unwrap();
    assert_eq!(last.role, ChatRole::Assistant);
    assert_eq!(last.content, "pong");

    // Streaming reached the observer.
    assert!(observer
        .tokens
        .lock()
        .unwrap()
        .iter()
        .any(|(id, tok)| id == "a" && tok == "pong"));

    // execution_order ⊆ keys(node_outputs), each id at most once.
    for id in &result.execution_order {
        assert!(result.node_outputs.contains_key(id));
    }
    assert_eq!(result.usage.total_tokens, 15);
    assert_eq!(observer.completes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn router_selects_branch_and_skips_the_other() {
    let provider = Arc::new(SequenceProvider::text(&["R", "right answer"]));
    let engine = Engine::new(provider.clone(), EngineOptions::default());
    let observer = Arc::new(Recorder::default());

    let result = engine
        .execute(&router_workflow(), ExecutionInput::text("go"), observer.clone())
        .await;

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.execution_order, vec!["s", "router", "agentR"]);
    assert!(!result.node_outputs.contains_key("agentL"));
    assert_eq!(result.final_output, "right answer");

    let routes = observer.routes.lock().unwrap();
    assert_eq!(routes.as_slice(), [("router".to_string(), "R".to_string())]);

    // The skipped branch never started.
    assert!(!observer.starts.lock().unwrap().contains(&"agentL".to_string()));
}

#[tokio::test]
async fn retry_then_succeed() {
    let rate_limited = || {
        Err(ProviderError::new("Rate limit exceeded")
            .with_status(429)
            .with_retry_after(0.0))
    };
    let provider = Arc::new(SequenceProvider::new(vec![
        rate_limited(),
        rate_limited(),
        Ok(ChatResponse::text("ok").with_usage(usage())),
    ]));

    let mut workflow = linear_workflow();
    workflow.nodes[1].data["errorHandling"] = json!({
        "mode": "stop",
        "retry": { "maxRetries": 2, "baseDelay": 10 }
    });

    let engine = Engine::new(provider.clone(), EngineOptions::default());
    let observer = Arc::new(Recorder::default());
    let result = engine
        .execute(&workflow, ExecutionInput::text("hi"), observer.clone())
        .await;

    assert!(result.success, "error: {:?}", result.error);
    assert!(result.error.is_none());
    assert_eq!(result.final_output, "ok");
    assert_eq!(provider.calls(), 3);
    assert!(observer.errors.lock().unwrap().is_empty());
}

#[tokio::test]
async fn branch_on_error_routes_to_fallback() {
    let provider = Arc::new(SequenceProvider::new(vec![Err(ProviderError::new(
        "Internal server error",
    )
    .with_status(500))]));

    let workflow = Workflow::new(
        "branching",
        vec![
            Node::new("s", "start", json!({})),
            Node::new(
                "agent",
                "agent",
                json!({ "errorHandling": { "mode": "branch", "retry": { "maxRetries": 0 } } }),
            ),
            Node::new("fallback", "output", json!({ "template": "{{agent_error}}" })),
        ],
        vec![
            Edge::new("e1", "s", "agent"),
            Edge::new("e2", "agent", "fallback").with_source_handle("error"),
        ],
    );

    let engine = Engine::new(provider.clone(), EngineOptions::default());
    let observer = Arc::new(Recorder::default());
    let result = engine
        .execute(&workflow, ExecutionInput::text("hi"), observer.clone())
        .await;

    assert!(result.success, "error: {:?}", result.error);
    assert!(result.execution_order.contains(&"fallback".to_string()));

    let stored = &result.node_outputs["agent_error"];
    let parsed: serde_json::Value = serde_json::from_str(stored).unwrap();
    assert_eq!(parsed["code"], "LLM_ERROR");
    assert_eq!(parsed["nodeId"], "agent");
    assert_eq!(parsed["retry"]["attempts"], 1);

    // The fallback's template interpolated the serialized error.
    assert!(result.final_output.contains("LLM_ERROR"));
    assert_eq!(observer.errors.lock().unwrap().as_slice(), ["agent"]);
}

#[tokio::test]
async fn hitl_approval_reject_routes_to_rejected_handle() {
    let provider = Arc::new(SequenceProvider::text(&["should not be called"]));
    let workflow = Workflow::new(
        "guarded",
        vec![
            Node::new("s", "start", json!({})),
            Node::new(
                "router",
                "router",
                json!({
                    "routes": [{ "id": "go" }],
                    "hitl": { "enabled": true, "mode": "approval" }
                }),
            ),
            Node::new("target", "output", json!({ "template": "{{input}}" })),
            Node::new("safe", "output", json!({ "template": "stopped: {{input}}" })),
        ],
        vec![
            Edge::new("e1", "s", "router"),
            Edge::new("e2", "router", "target").with_source_handle("go"),
            Edge::new("e3", "router", "safe").with_source_handle("rejected"),
        ],
    );

    let engine = Engine::new(
        provider.clone(),
        EngineOptions::default().with_hitl(Arc::new(Decide(HitlAction::Reject))),
    );
    let observer = Arc::new(Recorder::default());
    let result = engine
        .execute(&workflow, ExecutionInput::text("go"), observer.clone())
        .await;

    assert!(result.success, "error: {:?}", result.error);
    // The router body never ran: no LLM call happened.
    assert_eq!(provider.calls(), 0);
    assert!(result.execution_order.contains(&"safe".to_string()));
    assert!(!result.execution_order.contains(&"target".to_string()));

    let finishes = observer.finishes.lock().unwrap();
    assert!(finishes
        .iter()
        .any(|(id, out)| id == "router" && out == "HITL: Rejected"));
}

#[tokio::test]
async fn hitl_approval_approve_runs_the_node() {
    let provider = Arc::new(SequenceProvider::text(&["go", "routed"]));
    let mut workflow = router_workflow();
    workflow.nodes[1].data["routes"] = json!([{ "id": "L" }, { "id": "R" }]);
    workflow.nodes[1].data["hitl"] = json!({ "enabled": true, "mode": "approval" });

    let engine = Engine::new(
        provider.clone(),
        EngineOptions::default().with_hitl(Arc::new(Decide(HitlAction::Approve))),
    );
    let result = engine
        .execute(
            &workflow,
            ExecutionInput::text("go"),
            Arc::new(Recorder::default()),
        )
        .await;

    assert!(result.success, "error: {:?}", result.error);
    // The router's LLM turn happened after approval.
    assert!(provider.calls() >= 1);
}

#[tokio::test]
async fn cancellation_unwinds_with_cancelled_error() {
    let engine = Arc::new(Engine::new(Arc::new(SlowProvider), EngineOptions::default()));
    let observer = Arc::new(Recorder::default());

    let task = {
        let engine = engine.clone();
        let observer = observer.clone();
        let workflow = linear_workflow();
        tokio::spawn(async move {
            engine
                .execute(&workflow, ExecutionInput::text("hi"), observer)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(engine.is_running());
    engine.stop();

    let result = task.await.unwrap();
    assert!(!result.success);
    assert!(result
        .error
        .as_ref()
        .unwrap()
        .message
        .to_lowercase()
        .contains("cancelled"));
    assert!(!engine.is_running());
    // No completion event after stop, and the usage ledger was dropped.
    assert_eq!(observer.completes.load(Ordering::SeqCst), 0);
    assert!(result.token_usage_details.is_empty());
}

// ---------------------------------------------------------------------------
// Further engine behavior
// ---------------------------------------------------------------------------

#[tokio::test]
async fn continue_mode_flows_to_default_children_with_empty_output() {
    let provider = Arc::new(SequenceProvider::new(vec![Err(ProviderError::new(
        "Internal server error",
    )
    .with_status(500))]));

    let mut workflow = linear_workflow();
    workflow.nodes[1].data["errorHandling"] = json!({ "mode": "continue" });
    workflow.nodes[2].data["template"] = json!("got: {{a}}");

    let engine = Engine::new(provider, EngineOptions::default());
    let observer = Arc::new(Recorder::default());
    let result = engine
        .execute(&workflow, ExecutionInput::text("hi"), observer.clone())
        .await;

    assert!(result.success);
    assert_eq!(result.node_outputs["a"], "");
    assert_eq!(result.final_output, "got: ");
    assert_eq!(observer.errors.lock().unwrap().as_slice(), ["a"]);
}

#[tokio::test]
async fn auth_errors_do_not_retry() {
    let provider = Arc::new(SequenceProvider::new(vec![Err(ProviderError::new(
        "Unauthorized",
    )
    .with_status(401))]));

    let mut workflow = linear_workflow();
    workflow.nodes[1].data["errorHandling"] = json!({
        "mode": "stop",
        "retry": { "maxRetries": 5, "baseDelay": 1 }
    });

    let engine = Engine::new(provider.clone(), EngineOptions::default());
    let result = engine
        .execute(&workflow, ExecutionInput::text("hi"), Arc::new(Recorder::default()))
        .await;

    assert!(!result.success);
    assert_eq!(provider.calls(), 1);
    let error = result.error.unwrap();
    assert_eq!(error.status_code, Some(401));
    assert_eq!(error.retry.attempts, 1);
    assert!(error.retry.history.is_empty());
}

#[tokio::test]
async fn retry_history_records_failed_attempts() {
    let provider = Arc::new(SequenceProvider::new(vec![
        Err(ProviderError::new("Internal server error").with_status(500)),
        Err(ProviderError::new("Internal server error").with_status(500)),
        Err(ProviderError::new("Internal server error").with_status(500)),
    ]));

    let mut workflow = linear_workflow();
    workflow.nodes[1].data["errorHandling"] = json!({
        "mode": "stop",
        "retry": { "maxRetries": 2, "baseDelay": 1 }
    });

    let engine = Engine::new(provider.clone(), EngineOptions::default());
    let result = engine
        .execute(&workflow, ExecutionInput::text("hi"), Arc::new(Recorder::default()))
        .await;

    assert!(!result.success);
    assert_eq!(provider.calls(), 3);
    let error = result.error.unwrap();
    // history.len() == attempts - 1
    assert_eq!(error.retry.attempts, 3);
    assert_eq!(error.retry.max_attempts, 3);
    assert_eq!(error.retry.history.len(), 2);
    assert_eq!(error.retry.history[0].attempt, 1);

    // Partial progress is preserved.
    assert_eq!(result.execution_order, vec!["s"]);
    assert!(result.node_outputs.contains_key("s"));
}

#[tokio::test]
async fn parallel_branches_merge_and_store_composite_keys() {
    let provider = Arc::new(MatchProvider {
        rules: vec![("Summarize", "the summary"), ("Critique", "the critique")],
    });

    let workflow = Workflow::new(
        "fanout",
        vec![
            Node::new("s", "start", json!({})),
            Node::new(
                "p",
                "parallel",
                json!({
                    "branches": [
                        { "id": "sum", "prompt": "Summarize" },
                        { "id": "crit", "prompt": "Critique" }
                    ]
                }),
            ),
            Node::new("out", "output", json!({ "template": "{{p:sum}} | {{p:crit}}" })),
        ],
        vec![Edge::new("e1", "s", "p"), Edge::new("e2", "p", "out")],
    );

    let engine = Engine::new(provider, EngineOptions::default());
    let observer = Arc::new(Recorder::default());
    let result = engine
        .execute(&workflow, ExecutionInput::text("the text"), observer.clone())
        .await;

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.node_outputs["p:sum"], "the summary");
    assert_eq!(result.node_outputs["p:crit"], "the critique");
    assert_eq!(
        result.node_outputs["p"],
        "## Output 1\nthe summary\n\n## Output 2\nthe critique"
    );
    assert_eq!(result.final_output, "the summary | the critique");
    assert_eq!(observer.branch_completes.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn while_loop_fixed_mode_runs_exact_iterations() {
    let provider = Arc::new(SequenceProvider::text(&["one", "two", "three"]));

    let workflow = Workflow::new(
        "looped",
        vec![
            Node::new("s", "start", json!({})),
            Node::new(
                "loop",
                "whileLoop",
                json!({ "mode": "fixed", "maxIterations": 3, "outputMode": "accumulate" }),
            ),
            Node::new("body", "agent", json!({})),
            Node::new("out", "output", json!({ "template": "{{loop}}" })),
        ],
        vec![
            Edge::new("e1", "s", "loop"),
            Edge::new("e2", "loop", "body").with_source_handle("body"),
            Edge::new("e3", "loop", "out").with_source_handle("exit"),
        ],
    );

    let engine = Engine::new(provider.clone(), EngineOptions::default());
    let observer = Arc::new(Recorder::default());
    let result = engine
        .execute(&workflow, ExecutionInput::text("go"), observer.clone())
        .await;

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(provider.calls(), 3);
    assert_eq!(
        observer.loop_iterations.lock().unwrap().as_slice(),
        [(1, 3), (2, 3), (3, 3)]
    );

    let accumulated: Vec<String> = serde_json::from_str(&result.node_outputs["loop"]).unwrap();
    assert_eq!(accumulated, vec!["one", "two", "three"]);

    // Loop body re-entries show up per iteration.
    let body_runs = result
        .execution_order
        .iter()
        .filter(|id| *id == "body")
        .count();
    assert_eq!(body_runs, 3);
}

#[tokio::test]
async fn while_loop_condition_mode_stops_when_evaluator_says_so() {
    let provider = Arc::new(SequenceProvider::text(&["more 1", "more 2", "done"]));

    let workflow = Workflow::new(
        "conditional-loop",
        vec![
            Node::new("s", "start", json!({})),
            Node::new(
                "loop",
                "whileLoop",
                json!({ "mode": "condition", "evaluator": "wants-more", "maxIterations": 10 }),
            ),
            Node::new("body", "agent", json!({})),
            Node::new("out", "output", json!({ "template": "{{loop}}" })),
        ],
        vec![
            Edge::new("e1", "s", "loop"),
            Edge::new("e2", "loop", "body").with_source_handle("body"),
            Edge::new("e3", "loop", "out").with_source_handle("exit"),
        ],
    );

    let options = EngineOptions::default()
        .with_evaluator("wants-more", Arc::new(|output: &str| output.contains("more")));
    let engine = Engine::new(provider.clone(), options);
    let result = engine
        .execute(&workflow, ExecutionInput::text("go"), Arc::new(Recorder::default()))
        .await;

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(provider.calls(), 3);
    assert_eq!(result.node_outputs["loop"], "done");
}

#[tokio::test]
async fn subflow_runs_nested_workflow_with_scoped_events() {
    let provider = Arc::new(SequenceProvider::text(&["child says hi"]));

    let child = Workflow::new(
        "child",
        vec![
            Node::new("cs", "start", json!({})),
            Node::new("ca", "agent", json!({})),
        ],
        vec![Edge::new("ce1", "cs", "ca")],
    );
    let registry = Arc::new(InMemorySubflowRegistry::new());
    registry.insert("child", child);

    let workflow = Workflow::new(
        "parent",
        vec![
            Node::new("s", "start", json!({})),
            Node::new("sf", "subflow", json!({ "subflowId": "child" })),
            Node::new("out", "output", json!({ "template": "{{sf}}" })),
        ],
        vec![Edge::new("e1", "s", "sf"), Edge::new("e2", "sf", "out")],
    );

    let engine = Engine::new(
        provider,
        EngineOptions::default().with_subflows(registry),
    );
    let observer = Arc::new(Recorder::default());
    let result = engine
        .execute(&workflow, ExecutionInput::text("hi"), observer.clone())
        .await;

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.final_output, "child says hi");

    // Child node events are scoped under the calling node.
    let starts = observer.starts.lock().unwrap();
    assert!(starts.contains(&"sf:sf|ca".to_string()), "starts: {starts:?}");

    // on_complete fired once, for the top-level run only.
    assert_eq!(observer.completes.load(Ordering::SeqCst), 1);

    // The child's LLM usage counts toward the parent aggregate.
    assert_eq!(result.usage.total_tokens, 15);
}

#[tokio::test]
async fn agent_tool_loop_resolves_calls() {
    let provider = Arc::new(SequenceProvider::new(vec![
        Ok(ChatResponse {
            content: None,
            tool_calls: vec![ToolCall::new("c1", "echo", json!({ "text": "42" }))],
            usage: Some(usage()),
        }),
        Ok(ChatResponse::text("tool says 42").with_usage(usage())),
    ]));

    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(Echo));

    let mut workflow = linear_workflow();
    workflow.nodes[1].data["tools"] = json!(["echo"]);

    let engine = Engine::new(provider.clone(), EngineOptions::default().with_tools(tools));
    let observer = Arc::new(Recorder::default());
    let result = engine
        .execute(&workflow, ExecutionInput::text("hi"), observer.clone())
        .await;

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(provider.calls(), 2);
    assert_eq!(result.node_outputs["a"], "tool says 42");
    assert_eq!(observer.tool_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn compaction_fires_before_second_agent_turn() {
    let long_reply = "x".repeat(400);
    let provider = Arc::new(SequenceProvider::text(&[long_reply.as_str(), "second"]));

    let workflow = Workflow::new(
        "compacting",
        vec![
            Node::new("s", "start", json!({})),
            Node::new("a1", "agent", json!({})),
            Node::new("a2", "agent", json!({})),
        ],
        vec![Edge::new("e1", "s", "a1"), Edge::new("e2", "a1", "a2")],
    );

    let options = EngineOptions::default().with_compaction(
        CompactionConfig::default()
            .with_threshold(Threshold::Tokens(50))
            .with_strategy(CompactionStrategy::Truncate)
            .with_preserve_recent(1),
    );
    let engine = Engine::new(provider, options);
    let observer = Arc::new(Recorder::default());
    let result = engine
        .execute(
            &workflow,
            ExecutionInput::text(&"y".repeat(200)),
            observer.clone(),
        )
        .await;

    assert!(result.success, "error: {:?}", result.error);
    assert!(observer.compactions.load(Ordering::SeqCst) >= 1);
    // The seed user message was compacted away.
    assert!(result
        .session_messages
        .iter()
        .all(|m| m.role != ChatRole::User));
}

#[tokio::test]
async fn preflight_validation_failure_short_circuits() {
    let provider = Arc::new(SequenceProvider::text(&["never"]));
    // Two start nodes: invalid.
    let workflow = Workflow::new(
        "broken",
        vec![
            Node::new("s1", "start", json!({})),
            Node::new("s2", "start", json!({})),
            Node::new("a", "agent", json!({})),
        ],
        vec![Edge::new("e1", "s1", "a"), Edge::new("e2", "s2", "a")],
    );

    let engine = Engine::new(provider.clone(), EngineOptions::default());
    let observer = Arc::new(Recorder::default());
    let result = engine
        .execute(&workflow, ExecutionInput::text("hi"), observer.clone())
        .await;

    assert!(!result.success);
    assert_eq!(provider.calls(), 0);
    let error = result.error.unwrap();
    assert_eq!(format!("{:?}", error.code), "Validation");
    assert!(result.execution_order.is_empty());
    // The synthesized error was surfaced with an empty node id.
    assert_eq!(observer.errors.lock().unwrap().as_slice(), [""]);
}

#[tokio::test]
async fn unknown_node_type_fails_preflight() {
    let provider = Arc::new(SequenceProvider::text(&[]));
    let workflow = Workflow::new(
        "mystery",
        vec![
            Node::new("s", "start", json!({})),
            Node::new("x", "teleporter", json!({})),
        ],
        vec![Edge::new("e1", "s", "x")],
    );

    let engine = Engine::new(provider, EngineOptions::default());
    let result = engine
        .execute(&workflow, ExecutionInput::text("hi"), Arc::new(Recorder::default()))
        .await;

    assert!(!result.success);
    assert!(result.error.unwrap().message.contains("teleporter"));
}

#[tokio::test]
async fn stalled_graph_trips_the_iteration_cap() {
    let provider = Arc::new(SequenceProvider::text(&["unused"]));
    // x waits on y, which nothing ever enqueues.
    let workflow = Workflow::new(
        "stalled",
        vec![
            Node::new("s", "start", json!({})),
            Node::new("x", "agent", json!({})),
            Node::new("y", "agent", json!({})),
        ],
        vec![Edge::new("e1", "s", "x"), Edge::new("e2", "y", "x")],
    );

    let engine = Engine::new(provider, EngineOptions::default().with_validation(false));
    let result = engine
        .execute(&workflow, ExecutionInput::text("hi"), Arc::new(Recorder::default()))
        .await;

    assert!(!result.success);
    assert!(result.error.unwrap().message.contains("iterations"));
}

#[tokio::test]
async fn resume_reruns_only_the_target() {
    let provider = Arc::new(SequenceProvider::text(&[]));
    let resume = ResumeState {
        start_node_id: Some("out".to_string()),
        node_outputs: [
            ("s".to_string(), "hi".to_string()),
            ("a".to_string(), "pong".to_string()),
        ]
        .into(),
        execution_order: vec!["s".to_string(), "a".to_string()],
        last_active_node_id: Some("a".to_string()),
        final_node_id: Some("a".to_string()),
        resume_input: Some("pong".to_string()),
        session_messages: vec![ChatMessage::user("hi"), ChatMessage::assistant("pong")],
    };

    let engine = Engine::new(provider.clone(), EngineOptions::default());
    let result = engine
        .execute(
            &linear_workflow(),
            ExecutionInput::text("hi").with_resume(resume),
            Arc::new(Recorder::default()),
        )
        .await;

    assert!(result.success, "error: {:?}", result.error);
    // Only the resume target ran; the agent's LLM never re-fired.
    assert_eq!(provider.calls(), 0);
    assert_eq!(result.execution_order, vec!["s", "a", "out"]);
    assert_eq!(result.final_output, "pong");
}

#[tokio::test]
async fn resume_of_completed_run_is_a_noop() {
    let provider = Arc::new(SequenceProvider::text(&[]));
    let resume = ResumeState {
        start_node_id: None,
        node_outputs: [
            ("s".to_string(), "hi".to_string()),
            ("a".to_string(), "pong".to_string()),
            ("out".to_string(), "pong".to_string()),
        ]
        .into(),
        execution_order: vec!["s".to_string(), "a".to_string(), "out".to_string()],
        last_active_node_id: Some("out".to_string()),
        final_node_id: Some("out".to_string()),
        resume_input: Some("pong".to_string()),
        session_messages: vec![ChatMessage::user("hi"), ChatMessage::assistant("pong")],
    };

    let engine = Engine::new(provider.clone(), EngineOptions::default());
    let result = engine
        .execute(
            &linear_workflow(),
            ExecutionInput::text("hi").with_resume(resume),
            Arc::new(Recorder::default()),
        )
        .await;

    assert!(result.success);
    assert_eq!(provider.calls(), 0);
    assert_eq!(result.execution_order, vec!["s", "a", "out"]);
}

#[tokio::test]
async fn router_condition_routes_without_llm() {
    let provider = Arc::new(SequenceProvider::text(&["branch output"]));
    let mut workflow = router_workflow();
    workflow.nodes[1].data = json!({
        "routes": [
            { "id": "L", "condition": { "type": "contains", "value": "left" } },
            { "id": "R", "condition": { "type": "regex", "value": "^go right" } }
        ]
    });

    let engine = Engine::new(provider.clone(), EngineOptions::default());
    let observer = Arc::new(Recorder::default());
    let result = engine
        .execute(
            &workflow,
            ExecutionInput::text("go right now"),
            observer.clone(),
        )
        .await;

    assert!(result.success, "error: {:?}", result.error);
    // One call for agentR only; the router decided by condition.
    assert_eq!(provider.calls(), 1);
    assert!(result.execution_order.contains(&"agentR".to_string()));
    assert_eq!(
        observer.routes.lock().unwrap().as_slice(),
        [("router".to_string(), "R".to_string())]
    );
}

#[tokio::test]
async fn merge_node_waits_for_skipped_branch() {
    // Router picks R; the join after both branches must still run because
    // the L side resolves as skipped.
    let provider = Arc::new(SequenceProvider::text(&["R", "right out"]));
    let workflow = Workflow::new(
        "diamond",
        vec![
            Node::new("s", "start", json!({})),
            Node::new(
                "router",
                "router",
                json!({ "routes": [{ "id": "L" }, { "id": "R" }] }),
            ),
            Node::new("agentL", "agent", json!({})),
            Node::new("agentR", "agent", json!({})),
            Node::new("join", "output", json!({ "template": "{{agentL}}{{agentR}}" })),
        ],
        vec![
            Edge::new("e1", "s", "router"),
            Edge::new("e2", "router", "agentL").with_source_handle("L"),
            Edge::new("e3", "router", "agentR").with_source_handle("R"),
            Edge::new("e4", "agentL", "join"),
            Edge::new("e5", "agentR", "join"),
        ],
    );

    let engine = Engine::new(provider, EngineOptions::default());
    let result = engine
        .execute(&workflow, ExecutionInput::text("go"), Arc::new(Recorder::default()))
        .await;

    assert!(result.success, "error: {:?}", result.error);
    assert!(result.execution_order.contains(&"join".to_string()));
    // Only the live branch contributed.
    assert_eq!(result.final_output, "right out");
}
