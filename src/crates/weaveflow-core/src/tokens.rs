//! Approximate token counting and per-model context limits.
//!
//! The engine never tokenizes for real; it needs counts that are cheap and
//! stable enough to decide when compaction should fire and how much context
//! remains. The default implementation approximates at four characters per
//! token and looks context limits up in a small table of known model
//! families.

use std::sync::Arc;

/// Context limit assumed for models the counter does not recognize.
pub const DEFAULT_CONTEXT_LIMIT: usize = 8_192;

/// Token counting contract used by the compactor and the usage ledger.
pub trait TokenCounter: Send + Sync {
    /// Approximate token count of a text for the given model.
    fn count(&self, text: &str, model: Option<&str>) -> usize;

    /// Context window size of a model, in tokens.
    fn limit(&self, model: &str) -> usize;
}

/// Character-ratio token counter with a lookup table of known limits.
#[derive(Debug, Clone, Default)]
pub struct HeuristicTokenCounter;

impl HeuristicTokenCounter {
    pub fn new() -> Self {
        Self
    }

    /// Shared-arc convenience for engine options.
    pub fn shared() -> Arc<dyn TokenCounter> {
        Arc::new(Self)
    }
}

/// Known context limits by model-name fragment. First match wins, so more
/// specific fragments come first.
const MODEL_LIMITS: &[(&str, usize)] = &[
    ("gpt-4o", 128_000),
    ("gpt-4-turbo", 128_000),
    ("gpt-4", 8_192),
    ("gpt-3.5-turbo-16k", 16_384),
    ("gpt-3.5", 4_096),
    ("o1", 200_000),
    ("claude-3", 200_000),
    ("claude", 200_000),
    ("gemini-1.5", 1_000_000),
    ("gemini", 32_768),
    ("deepseek", 64_000),
    ("llama-3.1", 128_000),
    ("llama", 8_192),
    ("mistral", 32_768),
    ("mixtral", 32_768),
];

impl TokenCounter for HeuristicTokenCounter {
    fn count(&self, text: &str, _model: Option<&str>) -> usize {
        // ceil(len / 4)
        text.len().div_ceil(4)
    }

    fn limit(&self, model: &str) -> usize {
        let lowered = model.to_lowercase();
        MODEL_LIMITS
            .iter()
            .find(|(fragment, _)| lowered.contains(fragment))
            .map(|(_, limit)| *limit)
            .unwrap_or(DEFAULT_CONTEXT_LIMIT)
    }
}
