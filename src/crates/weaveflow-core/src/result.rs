//! Execution results and token-usage accounting.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ExecutionError;
use crate::messages::ChatMessage;
use crate::provider::Usage;

/// Token usage of a single LLM call, annotated with context headroom.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsageDetails {
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub context_limit: u64,
    /// Compaction trigger point, when compaction is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compaction_threshold: Option<u64>,
    /// Tokens left before compaction would fire.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_before_compaction: Option<u64>,
    /// Tokens left in the model's context window.
    pub remaining_context: u64,
}

impl TokenUsageDetails {
    pub fn from_usage(model: impl Into<String>, usage: Usage, context_limit: u64) -> Self {
        Self {
            model: model.into(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            context_limit,
            compaction_threshold: None,
            remaining_before_compaction: None,
            remaining_context: context_limit.saturating_sub(usage.total_tokens),
        }
    }

    pub fn with_compaction_threshold(mut self, threshold: u64) -> Self {
        self.compaction_threshold = Some(threshold);
        self.remaining_before_compaction = Some(threshold.saturating_sub(self.total_tokens));
        self
    }
}

/// Aggregate token usage over an execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    /// Per-model rollup.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub by_model: HashMap<String, Usage>,
}

impl TokenUsage {
    pub fn add(&mut self, details: &TokenUsageDetails) {
        self.prompt_tokens += details.prompt_tokens;
        self.completion_tokens += details.completion_tokens;
        self.total_tokens += details.total_tokens;

        let entry = self.by_model.entry(details.model.clone()).or_default();
        entry.prompt_tokens += details.prompt_tokens;
        entry.completion_tokens += details.completion_tokens;
        entry.total_tokens += details.total_tokens;
    }

    pub fn aggregate(details: &[TokenUsageDetails]) -> Self {
        let mut usage = TokenUsage::default();
        for d in details {
            usage.add(d);
        }
        usage
    }
}

/// Final outcome of one `execute` call. Always returned, never thrown:
/// failures set `success = false` and `error`, preserving partial progress.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    /// Latest output when the run ended; equals `final_output` on success.
    pub output: String,
    pub final_output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_node_id: Option<String>,
    /// Node ids in completion order, repeated only on loop re-entry.
    pub execution_order: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_active_node_id: Option<String>,
    pub node_outputs: HashMap<String, String>,
    pub session_messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    pub duration_ms: u64,
    pub usage: TokenUsage,
    pub token_usage_details: Vec<TokenUsageDetails>,
}
