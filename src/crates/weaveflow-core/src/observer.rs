//! Execution observation.
//!
//! One observer interface with default no-op methods instead of deep optional
//! callback bundles. The scheduler guarantees per-node ordering: `on_node_start`,
//! then streaming events, then exactly one of `on_node_finish` / `on_node_error`;
//! `on_token_usage` fires in between; `on_complete` fires exactly once per
//! top-level execute and never for subflows.
//!
//! Subflow events reach the parent's observer through [`ScopedObserver`],
//! which prefixes node ids with `sf:<path>|` so nested events stay
//! distinguishable without layering closures.

use std::sync::Arc;

use crate::compaction::CompactionReport;
use crate::error::ExecutionError;
use crate::result::{ExecutionResult, TokenUsageDetails};
use crate::tool::ToolCall;

/// Observer of a single execution. All methods default to no-ops.
#[allow(unused_variables)]
pub trait ExecutionObserver: Send + Sync {
    fn on_node_start(&self, node_id: &str, node_type: &str) {}

    fn on_node_finish(&self, node_id: &str, output: &str) {}

    fn on_node_error(&self, node_id: &str, error: &ExecutionError) {}

    /// A streamed content chunk from an LLM-backed node.
    fn on_token(&self, node_id: &str, token: &str) {}

    /// A streamed reasoning chunk, for models that expose reasoning.
    fn on_reasoning(&self, node_id: &str, token: &str) {}

    fn on_branch_start(&self, node_id: &str, branch_id: &str) {}

    fn on_branch_token(&self, node_id: &str, branch_id: &str, token: &str) {}

    fn on_branch_reasoning(&self, node_id: &str, branch_id: &str, token: &str) {}

    fn on_branch_complete(&self, node_id: &str, branch_id: &str, output: &str) {}

    /// Fires after a router's decision, before its `on_node_finish`.
    fn on_route_selected(&self, node_id: &str, route_id: &str) {}

    fn on_loop_iteration(&self, node_id: &str, iteration: u32, max_iterations: u32) {}

    fn on_token_usage(&self, node_id: &str, details: &TokenUsageDetails) {}

    /// Fires before the LLM call whose history was compacted.
    fn on_context_compacted(&self, report: &CompactionReport) {}

    fn on_tool_call(&self, node_id: &str, call: &ToolCall) {}

    /// Fires exactly once per top-level execute. Suppressed for subflows.
    fn on_complete(&self, result: &ExecutionResult) {}
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl ExecutionObserver for NoopObserver {}

/// Wraps a parent observer, prefixing node ids with `sf:<path>|` and
/// suppressing `on_complete`.
pub struct ScopedObserver {
    inner: Arc<dyn ExecutionObserver>,
    prefix: String,
}

impl ScopedObserver {
    /// `path` is the subflow node-path, outermost first.
    pub fn new(inner: Arc<dyn ExecutionObserver>, path: &[String]) -> Self {
        Self {
            inner,
            prefix: scope_prefix(path),
        }
    }

    fn scoped(&self, node_id: &str) -> String {
        format!("{}{}", self.prefix, node_id)
    }
}

/// The `sf:<path>|` prefix applied to node ids raised from a nested run.
pub fn scope_prefix(path: &[String]) -> String {
    format!("sf:{}|", path.join("/"))
}

impl ExecutionObserver for ScopedObserver {
    fn on_node_start(&self, node_id: &str, node_type: &str) {
        self.inner.on_node_start(&self.scoped(node_id), node_type);
    }

    fn on_node_finish(&self, node_id: &str, output: &str) {
        self.inner.on_node_finish(&self.scoped(node_id), output);
    }

    fn on_node_error(&self, node_id: &str, error: &ExecutionError) {
        self.inner.on_node_error(&self.scoped(node_id), error);
    }

    fn on_token(&self, node_id: &str, token: &str) {
        self.inner.on_token(&self.scoped(node_id), token);
    }

    fn on_reasoning(&self, node_id: &str, token: &str) {
        self.inner.on_reasoning(&self.scoped(node_id), token);
    }

    fn on_branch_start(&self, node_id: &str, branch_id: &str) {
        self.inner.on_branch_start(&self.scoped(node_id), branch_id);
    }

    fn on_branch_token(&self, node_id: &str, branch_id: &str, token: &str) {
        self.inner
            .on_branch_token(&self.scoped(node_id), branch_id, token);
    }

    fn on_branch_reasoning(&self, node_id: &str, branch_id: &str, token: &str) {
        self.inner
            .on_branch_reasoning(&self.scoped(node_id), branch_id, token);
    }

    fn on_branch_complete(&self, node_id: &str, branch_id: &str, output: &str) {
        self.inner
            .on_branch_complete(&self.scoped(node_id), branch_id, output);
    }

    fn on_route_selected(&self, node_id: &str, route_id: &str) {
        self.inner.on_route_selected(&self.scoped(node_id), route_id);
    }

    fn on_loop_iteration(&self, node_id: &str, iteration: u32, max_iterations: u32) {
        self.inner
            .on_loop_iteration(&self.scoped(node_id), iteration, max_iterations);
    }

    fn on_token_usage(&self, node_id: &str, details: &TokenUsageDetails) {
        self.inner.on_token_usage(&self.scoped(node_id), details);
    }

    fn on_context_compacted(&self, report: &CompactionReport) {
        self.inner.on_context_compacted(report);
    }

    fn on_tool_call(&self, node_id: &str, call: &ToolCall) {
        self.inner.on_tool_call(&self.scoped(node_id), call);
    }

    fn on_complete(&self, _result: &ExecutionResult) {
        // Subflows never complete the parent's run.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl ExecutionObserver for Recorder {
        fn on_node_start(&self, node_id: &str, _node_type: &str) {
            self.events.lock().unwrap().push(format!("start:{node_id}"));
        }

        fn on_complete(&self, _result: &ExecutionResult) {
            self.events.lock().unwrap().push("complete".to_string());
        }
    }

    #[test]
    fn scoped_observer_prefixes_and_suppresses_complete() {
        let recorder = Arc::new(Recorder::default());
        let scoped = ScopedObserver::new(recorder.clone(), &["outer".to_string()]);

        scoped.on_node_start("inner", "agent");
        scoped.on_complete(&ExecutionResult::default());

        let events = recorder.events.lock().unwrap();
        assert_eq!(events.as_slice(), ["start:sf:outer|inner"]);
    }

    #[test]
    fn nested_path_joins_segments() {
        assert_eq!(
            scope_prefix(&["a".to_string(), "b".to_string()]),
            "sf:a/b|"
        );
    }
}
