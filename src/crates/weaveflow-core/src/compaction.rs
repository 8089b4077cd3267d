//! Conversation history compaction.
//!
//! Before each LLM-using node runs, the scheduler asks the compactor to check
//! the session against a token threshold:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │ threshold = auto ? max(limit(model) - 10000, 1000) : cfg  │
//! │ tokens    = Σ count(message.content)                      │
//! │ tokens ≤ threshold            → no-op                     │
//! │ split: preserve last N (default 5), compact the rest      │
//! │ strategy:                                                 │
//! │   truncate   → drop the prefix                            │
//! │   summarize  → one LLM call, replace prefix with a single │
//! │               "[Previous conversation summary]: …" system │
//! │               message (falls back to truncate on failure) │
//! │   custom     → user closure (same fallback)               │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! The session list is replaced in place; the preserved tail is never
//! rewritten.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::messages::{ChatMessage, ChatRole};
use crate::provider::{ChatRequest, LanguageModel};
use crate::tokens::TokenCounter;

/// Prefix of the summary system message produced by the summarize strategy.
pub const SUMMARY_PREFIX: &str = "[Previous conversation summary]: ";

const DEFAULT_PRESERVE_RECENT: usize = 5;
const AUTO_THRESHOLD_MARGIN: u64 = 10_000;
const AUTO_THRESHOLD_FLOOR: u64 = 1_000;

const DEFAULT_SUMMARIZE_PROMPT: &str = "Summarize the conversation below, preserving key facts, \
decisions, constraints, and unresolved questions. Reply with the summary only.\n\n{{messages}}";

/// User-provided compaction function: receives the prefix to compact and
/// returns its replacement.
pub type CustomCompactor = dyn Fn(Vec<ChatMessage>) -> BoxFuture<'static, Result<Vec<ChatMessage>, String>>
    + Send
    + Sync;

/// How the compacted prefix is rewritten.
#[derive(Clone)]
pub enum CompactionStrategy {
    /// Replace the prefix with a single LLM-produced summary message.
    Summarize,
    /// Drop the prefix.
    Truncate,
    /// Delegate to a user closure; truncate on failure.
    Custom(Arc<CustomCompactor>),
}

impl std::fmt::Debug for CompactionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactionStrategy::Summarize => write!(f, "Summarize"),
            CompactionStrategy::Truncate => write!(f, "Truncate"),
            CompactionStrategy::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Compaction trigger point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Threshold {
    /// `max(context_limit - 10000, 1000)` for the active model.
    #[default]
    Auto,
    /// Fixed token count.
    Tokens(u64),
}

/// Compaction configuration, set on the engine options.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    pub threshold: Threshold,
    /// Messages at the tail that are never compacted.
    pub preserve_recent: usize,
    pub strategy: CompactionStrategy,
    /// Model for the summarize call; defaults to the node's model.
    pub summarize_model: Option<String>,
    /// Summarize prompt; `{{messages}}` is replaced with the transcript.
    pub prompt_template: Option<String>,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            threshold: Threshold::Auto,
            preserve_recent: DEFAULT_PRESERVE_RECENT,
            strategy: CompactionStrategy::Summarize,
            summarize_model: None,
            prompt_template: None,
        }
    }
}

impl CompactionConfig {
    pub fn with_threshold(mut self, threshold: Threshold) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_preserve_recent(mut self, count: usize) -> Self {
        self.preserve_recent = count;
        self
    }

    pub fn with_strategy(mut self, strategy: CompactionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_summarize_model(mut self, model: impl Into<String>) -> Self {
        self.summarize_model = Some(model.into());
        self
    }
}

/// What a compaction pass did, emitted via `on_context_compacted`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionReport {
    pub compacted: bool,
    /// The session as it stands after compaction.
    pub messages: Vec<ChatMessage>,
    pub tokens_before: u64,
    pub tokens_after: u64,
    pub messages_compacted: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Token-counted history rewriter.
pub struct Compactor {
    config: CompactionConfig,
    counter: Arc<dyn TokenCounter>,
}

impl Compactor {
    pub fn new(config: CompactionConfig, counter: Arc<dyn TokenCounter>) -> Self {
        Self { config, counter }
    }

    /// The trigger threshold for a model.
    pub fn threshold(&self, model: &str) -> u64 {
        match self.config.threshold {
            Threshold::Tokens(tokens) => tokens,
            Threshold::Auto => {
                let limit = self.counter.limit(model) as u64;
                limit.saturating_sub(AUTO_THRESHOLD_MARGIN).max(AUTO_THRESHOLD_FLOOR)
            }
        }
    }

    fn count_all(&self, messages: &[ChatMessage], model: &str) -> u64 {
        messages
            .iter()
            .map(|m| self.counter.count(&m.content, Some(model)) as u64)
            .sum()
    }

    /// Compact `messages` in place if they exceed the threshold. Returns the
    /// report when anything changed, `None` on a no-op.
    pub async fn compact(
        &self,
        messages: &mut Vec<ChatMessage>,
        model: &str,
        provider: &dyn LanguageModel,
        cancel: &CancellationToken,
    ) -> Option<CompactionReport> {
        let threshold = self.threshold(model);
        let tokens_before = self.count_all(messages, model);
        if tokens_before <= threshold {
            return None;
        }

        let preserve = self.config.preserve_recent.min(messages.len());
        let split_at = messages.len() - preserve;
        if split_at == 0 {
            // Nothing older than the preserved tail; identity.
            return None;
        }

        let to_compact: Vec<ChatMessage> = messages[..split_at].to_vec();
        let to_preserve: Vec<ChatMessage> = messages[split_at..].to_vec();
        let messages_compacted = to_compact.len();

        debug!(
            model,
            tokens_before,
            threshold,
            compacting = messages_compacted,
            preserving = preserve,
            "Compacting conversation history"
        );

        let (mut rewritten, summary) = match &self.config.strategy {
            CompactionStrategy::Truncate => (Vec::new(), None),
            CompactionStrategy::Summarize => {
                match self
                    .summarize(&to_compact, model, provider, cancel.clone())
                    .await
                {
                    Ok(summary) => {
                        let message =
                            ChatMessage::system(format!("{SUMMARY_PREFIX}{summary}"));
                        (vec![message], Some(summary))
                    }
                    Err(reason) => {
                        warn!(%reason, "Summarization failed, falling back to truncate");
                        (Vec::new(), None)
                    }
                }
            }
            CompactionStrategy::Custom(custom) => match custom(to_compact.clone()).await {
                Ok(replacement) => (replacement, None),
                Err(reason) => {
                    warn!(%reason, "Custom compaction failed, falling back to truncate");
                    (Vec::new(), None)
                }
            },
        };

        rewritten.extend(to_preserve);
        let tokens_after = self.count_all(&rewritten, model);
        *messages = rewritten;

        Some(CompactionReport {
            compacted: true,
            messages: messages.clone(),
            tokens_before,
            tokens_after,
            messages_compacted,
            summary,
        })
    }

    async fn summarize(
        &self,
        to_compact: &[ChatMessage],
        model: &str,
        provider: &dyn LanguageModel,
        cancel: CancellationToken,
    ) -> Result<String, String> {
        let transcript = render_transcript(to_compact);
        let template = self
            .config
            .prompt_template
            .as_deref()
            .unwrap_or(DEFAULT_SUMMARIZE_PROMPT);
        let prompt = template.replace("{{messages}}", &transcript);
        let summarize_model = self.config.summarize_model.as_deref().unwrap_or(model);

        let request = ChatRequest::new(summarize_model, vec![ChatMessage::user(prompt)])
            .with_cancel(cancel);
        let response = provider.chat(request).await.map_err(|e| e.to_string())?;
        response
            .content
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| "empty summary".to_string())
    }
}

fn render_transcript(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str(), m.content))
        .collect::<Vec<_>>()
        .join("\n")
}
