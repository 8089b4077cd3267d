//! Retry policy and error-handling configuration for node execution.
//!
//! Every node runs inside the scheduler's wrapper, which consults these
//! configs when an extension fails:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │  Node wrapper                                          │
//! │  attempt = 1                                           │
//! │  loop:                                                 │
//! │    execute extension                                   │
//! │    on error: classify, record into retry history       │
//! │      retryable && attempt < max  → sleep(delay), retry │
//! │      else                        → apply ErrorMode     │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! Delay is status-aware: a `Retry-After` (or rate-limit reset) from the
//! provider wins over exponential backoff, both capped at `max_delay_ms`.
//! The sleep races the run's cancellation token.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, ErrorCode};

/// What to do once a node's retry window is exhausted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorMode {
    /// Rethrow; the run fails with this node's error.
    #[default]
    Stop,
    /// Emit the error event, produce an empty output, continue to the
    /// default children.
    Continue,
    /// Route to the node's `error` handle, storing the serialized error at
    /// `outputs[<id>_error]`. Falls back to `Stop` when no error edge exists.
    Branch,
}

/// Retry pacing configuration, embedded in a node's `errorHandling.retry`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Retries beyond the first attempt.
    pub max_retries: u32,
    /// Base delay for exponential backoff, in milliseconds.
    pub base_delay: u64,
    /// Cap applied to every computed delay, in milliseconds.
    pub max_delay: u64,
    /// Add up to 25% random jitter to backoff delays.
    pub jitter: bool,
    /// When set, only these codes retry.
    pub retry_on: Option<Vec<ErrorCode>>,
    /// Codes that never retry, overriding `retry_on`.
    pub skip_on: Vec<ErrorCode>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: 1_000,
            max_delay: 30_000,
            jitter: false,
            retry_on: None,
            skip_on: Vec::new(),
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn with_base_delay(mut self, ms: u64) -> Self {
        self.base_delay = ms;
        self
    }

    pub fn with_max_delay(mut self, ms: u64) -> Self {
        self.max_delay = ms;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_retry_on(mut self, codes: Vec<ErrorCode>) -> Self {
        self.retry_on = Some(codes);
        self
    }

    pub fn with_skip_on(mut self, codes: Vec<ErrorCode>) -> Self {
        self.skip_on = codes;
        self
    }

    /// Total attempts permitted, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Whether an error with this code may be retried.
    ///
    /// `Validation` never retries. `skip_on` overrides `retry_on`. With no
    /// `retry_on` list, everything except `Auth` retries.
    pub fn retryable(&self, code: ErrorCode) -> bool {
        if code == ErrorCode::Validation {
            return false;
        }
        if self.skip_on.contains(&code) {
            return false;
        }
        match &self.retry_on {
            Some(codes) => codes.contains(&code),
            None => code != ErrorCode::Auth,
        }
    }

    /// Delay before the next attempt. `attempt` is 1-based (the attempt that
    /// just failed); `retry_after` is the provider's pacing hint in seconds.
    pub fn delay(&self, attempt: u32, retry_after: Option<f64>) -> Duration {
        let ms = match retry_after {
            Some(seconds) if seconds >= 0.0 => {
                ((seconds * 1_000.0) as u64).min(self.max_delay)
            }
            _ => {
                let exp = self
                    .base_delay
                    .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
                exp.min(self.max_delay)
            }
        };

        let ms = if self.jitter {
            let jitter = (ms as f64 * 0.25 * rand::thread_rng().gen::<f64>()) as u64;
            ms + jitter
        } else {
            ms
        };

        Duration::from_millis(ms)
    }
}

/// Per-node error handling: mode plus retry pacing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ErrorHandling {
    pub mode: ErrorMode,
    pub retry: RetryConfig,
}

/// Sleep that aborts with `EngineError::Cancelled` when the run is stopped.
pub async fn sleep_cancellable(
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<(), EngineError> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = cancel.cancelled() => Err(EngineError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.max_attempts(), 1);
        assert_eq!(config.base_delay, 1_000);
        assert_eq!(config.max_delay, 30_000);
        assert!(!config.jitter);
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let config = RetryConfig::new(5).with_base_delay(1_000).with_max_delay(5_000);

        assert_eq!(config.delay(1, None).as_millis(), 1_000);
        assert_eq!(config.delay(2, None).as_millis(), 2_000);
        assert_eq!(config.delay(3, None).as_millis(), 4_000);
        // 8000 capped at 5000.
        assert_eq!(config.delay(4, None).as_millis(), 5_000);
    }

    #[test]
    fn retry_after_wins_over_backoff() {
        let config = RetryConfig::new(3).with_base_delay(1_000);
        assert_eq!(config.delay(1, Some(2.0)).as_millis(), 2_000);
        // Still capped.
        assert_eq!(config.delay(1, Some(90.0)).as_millis(), 30_000);
        assert_eq!(config.delay(1, Some(0.0)).as_millis(), 0);
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let config = RetryConfig::new(3).with_base_delay(1_000).with_jitter(true);
        for _ in 0..20 {
            let ms = config.delay(1, None).as_millis() as u64;
            assert!((1_000..=1_250).contains(&ms));
        }
    }

    #[test]
    fn auth_and_validation_do_not_retry_by_default() {
        let config = RetryConfig::new(3);
        assert!(!config.retryable(ErrorCode::Auth));
        assert!(!config.retryable(ErrorCode::Validation));
        assert!(config.retryable(ErrorCode::RateLimit));
        assert!(config.retryable(ErrorCode::Timeout));
        assert!(config.retryable(ErrorCode::Network));
        assert!(config.retryable(ErrorCode::LlmError));
    }

    #[test]
    fn retry_on_narrows_and_skip_on_overrides() {
        let config = RetryConfig::new(3)
            .with_retry_on(vec![ErrorCode::RateLimit, ErrorCode::Timeout])
            .with_skip_on(vec![ErrorCode::Timeout]);

        assert!(config.retryable(ErrorCode::RateLimit));
        assert!(!config.retryable(ErrorCode::Timeout));
        assert!(!config.retryable(ErrorCode::LlmError));
        // Validation stays non-retryable even when listed.
        let config = RetryConfig::new(3).with_retry_on(vec![ErrorCode::Validation]);
        assert!(!config.retryable(ErrorCode::Validation));
    }

    #[test]
    fn parses_from_node_data() {
        let handling: ErrorHandling = serde_json::from_value(serde_json::json!({
            "mode": "branch",
            "retry": { "maxRetries": 2, "baseDelay": 10 }
        }))
        .unwrap();
        assert_eq!(handling.mode, ErrorMode::Branch);
        assert_eq!(handling.retry.max_retries, 2);
        assert_eq!(handling.retry.base_delay, 10);
        assert_eq!(handling.retry.max_delay, 30_000);
    }

    #[tokio::test]
    async fn cancellable_sleep_aborts() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = sleep_cancellable(Duration::from_secs(60), &cancel).await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }
}
