//! Human-in-the-loop pause points.
//!
//! Agent and router nodes may be configured to pause for a human decision.
//! The coordinator issues a request through the injected handler and awaits
//! the response racing against the run's cancellation token and an optional
//! deadline. The deadline is wall-clock based and polled at 1 Hz rather than
//! armed as a single timer, so a laptop sleeping through the window still
//! times out on the next tick.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::EngineError;

/// When the pause happens relative to node execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitlMode {
    /// Pause before execution for a yes/no decision.
    #[default]
    Approval,
    /// Pause before execution to collect replacement input.
    Input,
    /// Pause after execution to review (and possibly modify) the output.
    Review,
}

/// The human's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitlAction {
    Approve,
    Reject,
    Submit,
    Modify,
    Skip,
}

/// Node-level HITL configuration, embedded in node `data.hitl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HitlConfig {
    pub enabled: bool,
    pub mode: HitlMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Seconds until the request expires. `None` waits indefinitely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// Action synthesized when the request expires.
    pub default_action: HitlAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

impl Default for HitlConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: HitlMode::Approval,
            prompt: None,
            timeout_seconds: None,
            default_action: HitlAction::Reject,
            options: None,
            input_schema: None,
        }
    }
}

/// Context snapshot included with a request so the human sees what they are
/// deciding about.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HitlContext {
    pub input: String,
    /// Present for `Review` requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    pub workflow_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// A pause request handed to the handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HitlRequest {
    pub id: String,
    pub node_id: String,
    pub node_label: String,
    pub mode: HitlMode,
    pub prompt: String,
    pub context: HitlContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl HitlRequest {
    pub fn new(
        node_id: impl Into<String>,
        node_label: impl Into<String>,
        config: &HitlConfig,
        prompt: impl Into<String>,
        context: HitlContext,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            node_id: node_id.into(),
            node_label: node_label.into(),
            mode: config.mode,
            prompt: prompt.into(),
            context,
            options: config.options.clone(),
            input_schema: config.input_schema.clone(),
            created_at,
            expires_at: config
                .timeout_seconds
                .map(|secs| created_at + chrono::Duration::seconds(secs as i64)),
        }
    }
}

/// The human's (or the timeout's) answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HitlResponse {
    pub request_id: String,
    pub action: HitlAction,
    /// Replacement input (`Submit`), replacement output (`Modify`), or
    /// replacement input on `Approve`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    pub responded_at: DateTime<Utc>,
}

impl HitlResponse {
    pub fn new(request_id: impl Into<String>, action: HitlAction) -> Self {
        Self {
            request_id: request_id.into(),
            action,
            data: None,
            responded_at: Utc::now(),
        }
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }
}

/// Consumer-supplied request handler. Delivery failures should be reported
/// as a `Reject` response rather than panicking the run.
#[async_trait]
pub trait HitlHandler: Send + Sync {
    async fn on_request(&self, request: HitlRequest) -> HitlResponse;
}

/// Issues requests and awaits responses under cancellation and deadline.
#[derive(Clone)]
pub struct HitlCoordinator {
    handler: Arc<dyn HitlHandler>,
}

impl HitlCoordinator {
    pub fn new(handler: Arc<dyn HitlHandler>) -> Self {
        Self { handler }
    }

    /// Await the handler's response. On expiry the response is synthesized
    /// from `default_action`; on cancellation the run unwinds.
    pub async fn await_response(
        &self,
        request: HitlRequest,
        default_action: HitlAction,
        cancel: &CancellationToken,
    ) -> Result<HitlResponse, EngineError> {
        let request_id = request.id.clone();
        let expires_at = request.expires_at;

        let handler_fut = self.handler.on_request(request);
        tokio::pin!(handler_fut);

        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                response = &mut handler_fut => return Ok(response),
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = tick.tick() => {
                    if let Some(deadline) = expires_at {
                        if Utc::now() >= deadline {
                            return Ok(HitlResponse::new(request_id, default_action));
                        }
                    }
                }
            }
        }
    }
}
