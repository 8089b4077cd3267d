//! Error taxonomy and structured execution errors.
//!
//! Two layers:
//!
//! ```text
//! EngineError                 - terminal scheduler failures
//! ├── Cancelled               - stop() or signal-driven abort
//! ├── IterationLimit          - scheduler iteration cap tripped
//! ├── NodeExecutionLimit      - per-node circuit breaker tripped
//! ├── MissingStartNode        - graph has no unique start
//! ├── UnknownNodeType         - no extension registered for a type
//! ├── SubflowDepthExceeded    - nested workflow recursion guard
//! ├── Validation              - preflight validation failure
//! └── Node(ExecutionError)    - a node exhausted its error handling
//! ```
//!
//! [`ExecutionError`] is the structured, serializable record handed to
//! observers and stored at `outputs[<id>_error]` when a node routes its
//! failure to an error branch. Its `code` is derived from the HTTP status
//! when one is present and from message keywords otherwise; classification
//! never mutates the originating error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classified failure category of a node execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Provider-side failure (5xx).
    LlmError,
    /// Request or operation timed out (408/504, "timed out").
    Timeout,
    /// Provider rate limiting (429).
    RateLimit,
    /// Authentication or authorization failure (401/403). Not retryable.
    Auth,
    /// Invalid request or workflow configuration (4xx, "invalid"). Never
    /// retryable.
    Validation,
    /// Transport-level failure ("fetch", "econnrefused", connection errors).
    Network,
    Unknown,
}

impl ErrorCode {
    /// Derive a code from an HTTP status.
    pub fn from_status(status: u16) -> Self {
        match status {
            408 | 504 => ErrorCode::Timeout,
            429 => ErrorCode::RateLimit,
            401 | 403 => ErrorCode::Auth,
            s if s >= 500 => ErrorCode::LlmError,
            s if s >= 400 => ErrorCode::Validation,
            _ => ErrorCode::Unknown,
        }
    }

    /// Derive a code from message keywords. Used when no status is present.
    pub fn from_message(message: &str) -> Self {
        let lowered = message.to_lowercase();

        if lowered.contains("timed out") || lowered.contains("timeout") {
            return ErrorCode::Timeout;
        }
        if lowered.contains("rate limit")
            || lowered.contains("too many requests")
            || lowered.contains("429")
        {
            return ErrorCode::RateLimit;
        }
        if lowered.contains("unauthorized")
            || lowered.contains("forbidden")
            || lowered.contains("api key")
            || lowered.contains("authentication")
        {
            return ErrorCode::Auth;
        }
        if lowered.contains("fetch")
            || lowered.contains("econnrefused")
            || lowered.contains("network")
            || lowered.contains("connection")
        {
            return ErrorCode::Network;
        }
        if lowered.contains("internal server error") || lowered.contains("server error") {
            return ErrorCode::LlmError;
        }
        if lowered.contains("invalid") {
            return ErrorCode::Validation;
        }

        ErrorCode::Unknown
    }
}

/// Rate-limit header snapshot extracted from a provider response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
    /// Seconds to wait before the next attempt, from `Retry-After`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<f64>,
}

/// One recorded failed attempt inside a retry window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryAttempt {
    pub attempt: u32,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Retry bookkeeping attached to a structured error.
///
/// `history.len()` equals the number of failed attempts that were retried,
/// i.e. `actual_attempts - 1` when the final attempt also failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryTrace {
    pub attempts: u32,
    pub max_attempts: u32,
    pub history: Vec<RetryAttempt>,
}

/// Structured error describing a node failure.
#[derive(Debug, Clone, Error, Serialize)]
#[serde(rename_all = "camelCase")]
#[error("{message}")]
pub struct ExecutionError {
    pub message: String,
    pub code: ErrorCode,
    pub node_id: String,
    pub node_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub retry: RetryTrace,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitInfo>,
    /// Display form of the originating error, when distinct from `message`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl ExecutionError {
    /// Build a structured error, deriving the code status-first.
    pub fn new(
        message: impl Into<String>,
        node_id: impl Into<String>,
        node_type: impl Into<String>,
        status_code: Option<u16>,
    ) -> Self {
        let message = message.into();
        let code = match status_code {
            Some(status) => ErrorCode::from_status(status),
            None => ErrorCode::from_message(&message),
        };
        Self {
            message,
            code,
            node_id: node_id.into(),
            node_type: node_type.into(),
            status_code,
            retry: RetryTrace::default(),
            rate_limit: None,
            cause: None,
        }
    }

    /// Override the derived code. Used for synthesized errors (preflight
    /// validation, tool failures) where the category is already known.
    pub fn with_code(mut self, code: ErrorCode) -> Self {
        self.code = code;
        self
    }

    pub fn with_retry(mut self, retry: RetryTrace) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: Option<RateLimitInfo>) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// JSON form stored at `outputs[<id>_error]` for error-branch routing.
    pub fn to_output_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"message\":\"{}\"}}", self.message))
    }
}

/// Terminal failures raised by the engine itself.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Workflow cancelled")]
    Cancelled,

    #[error("Workflow exceeded maximum scheduler iterations ({limit})")]
    IterationLimit { limit: usize },

    #[error("Node '{node}' exceeded maximum executions ({limit})")]
    NodeExecutionLimit { node: String, limit: u32 },

    #[error("Workflow has no start node")]
    MissingStartNode,

    #[error("No extension registered for node type '{node_type}'")]
    UnknownNodeType { node_type: String },

    #[error("Maximum subflow depth ({limit}) exceeded")]
    SubflowDepthExceeded { limit: usize },

    #[error("Workflow validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Node(#[from] ExecutionError),
}

impl EngineError {
    /// Collapse into the structured record carried by the final result.
    pub fn into_execution_error(self) -> ExecutionError {
        match self {
            EngineError::Node(err) => err,
            EngineError::Validation(message) => {
                ExecutionError::new(format!("Workflow validation failed: {message}"), "", "", None)
                    .with_code(ErrorCode::Validation)
            }
            other => ExecutionError::new(other.to_string(), "", "", None),
        }
    }
}

/// Convenience result alias for engine internals.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_is_preferred_order() {
        assert_eq!(ErrorCode::from_status(500), ErrorCode::LlmError);
        assert_eq!(ErrorCode::from_status(503), ErrorCode::LlmError);
        assert_eq!(ErrorCode::from_status(408), ErrorCode::Timeout);
        assert_eq!(ErrorCode::from_status(504), ErrorCode::Timeout);
        assert_eq!(ErrorCode::from_status(429), ErrorCode::RateLimit);
        assert_eq!(ErrorCode::from_status(401), ErrorCode::Auth);
        assert_eq!(ErrorCode::from_status(403), ErrorCode::Auth);
        assert_eq!(ErrorCode::from_status(400), ErrorCode::Validation);
        assert_eq!(ErrorCode::from_status(200), ErrorCode::Unknown);
    }

    #[test]
    fn keyword_classification() {
        assert_eq!(ErrorCode::from_message("request timed out"), ErrorCode::Timeout);
        assert_eq!(ErrorCode::from_message("Rate limit exceeded"), ErrorCode::RateLimit);
        assert_eq!(ErrorCode::from_message("invalid api key"), ErrorCode::Auth);
        assert_eq!(ErrorCode::from_message("fetch failed"), ErrorCode::Network);
        assert_eq!(ErrorCode::from_message("ECONNREFUSED"), ErrorCode::Network);
        assert_eq!(ErrorCode::from_message("invalid template"), ErrorCode::Validation);
        assert_eq!(ErrorCode::from_message("mystery"), ErrorCode::Unknown);
    }

    #[test]
    fn status_wins_over_message() {
        let err = ExecutionError::new("something invalid happened", "n1", "agent", Some(500));
        assert_eq!(err.code, ErrorCode::LlmError);
        assert_eq!(err.status_code, Some(500));
    }

    #[test]
    fn serializes_for_error_branch_output() {
        let err = ExecutionError::new("boom", "a", "agent", Some(500)).with_retry(RetryTrace {
            attempts: 1,
            max_attempts: 1,
            history: vec![],
        });
        let json: serde_json::Value = serde_json::from_str(&err.to_output_json()).unwrap();
        assert_eq!(json["code"], "LLM_ERROR");
        assert_eq!(json["nodeId"], "a");
        assert_eq!(json["statusCode"], 500);
    }

    #[test]
    fn engine_error_collapses_to_structured_record() {
        let err = EngineError::Validation("missing start".into()).into_execution_error();
        assert_eq!(err.code, ErrorCode::Validation);

        let err = EngineError::IterationLimit { limit: 9 }.into_execution_error();
        assert!(err.message.contains("9"));
    }
}
