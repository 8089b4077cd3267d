//! LLM provider contract.
//!
//! The engine is an orchestration layer, not an LLM client: it consumes a
//! [`LanguageModel`] implementation injected at construction and stays
//! agnostic of transport details. Implementations are expected to stream,
//! invoking the request's token/reasoning sinks per chunk, and to abort
//! in-flight requests when the request's cancellation token fires.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::RateLimitInfo;
use crate::messages::ChatMessage;
use crate::tool::{ToolCall, ToolDefinition};

/// Per-chunk streaming sink.
pub type TokenSink = Arc<dyn Fn(&str) + Send + Sync>;

/// A chat completion request.
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: Option<String>,
    pub response_format: Option<Value>,
    /// Invoked per content chunk while the response streams.
    pub on_token: Option<TokenSink>,
    /// Invoked per reasoning chunk, for models that expose reasoning.
    pub on_reasoning: Option<TokenSink>,
    /// Aborts the in-flight request when cancelled.
    pub cancel: CancellationToken,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
            tools: Vec::new(),
            tool_choice: None,
            response_format: None,
            on_token: None,
            on_reasoning: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_on_token(mut self, sink: TokenSink) -> Self {
        self.on_token = Some(sink);
        self
    }

    pub fn with_on_reasoning(mut self, sink: TokenSink) -> Self {
        self.on_reasoning = Some(sink);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl fmt::Debug for ChatRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatRequest")
            .field("model", &self.model)
            .field("messages", &self.messages.len())
            .field("tools", &self.tools.len())
            .field("streaming", &self.on_token.is_some())
            .finish()
    }
}

/// Token usage reported by the provider for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// A complete chat response.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
}

impl ChatResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Static capabilities of a model, when the provider knows them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCapabilities {
    pub id: String,
    pub name: String,
    pub input_modalities: Vec<String>,
    pub output_modalities: Vec<String>,
    pub context_length: usize,
    pub supported_parameters: Vec<String>,
}

/// Failure surface of a provider call.
///
/// Carries the HTTP status and any rate-limit metadata the transport
/// exposed, so the retry machinery can classify and pace without re-parsing
/// responses. Classification reads this error; it never writes to it.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub message: String,
    pub status: Option<u16>,
    /// Seconds from a `Retry-After` header, when present.
    pub retry_after: Option<f64>,
    pub rate_limit: Option<RateLimitInfo>,
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            retry_after: None,
            rate_limit: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, seconds: f64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitInfo) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }
}

/// Provider-agnostic chat model interface consumed by node extensions.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Run one chat completion. Implementations should invoke the request's
    /// sinks while streaming and honor its cancellation token.
    async fn chat(&self, request: ChatRequest) -> std::result::Result<ChatResponse, ProviderError>;

    /// Capabilities lookup; `None` when the model is unknown.
    fn model_capabilities(&self, _model: &str) -> Option<ModelCapabilities> {
        None
    }
}
