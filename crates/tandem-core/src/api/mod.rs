//! Wire client for the agent process.
//!
//! The agent exposes one streaming endpoint per agent type
//! (`POST {base}/{agent_type}/stream`) returning a chunked line protocol,
//! plus a non-streaming fallback (`POST {base}/{agent_type}/complete`) used
//! when the outbound payload carries attached images.

pub mod error;
pub mod event;
pub mod lines;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub use error::ApiError;
pub use event::{AgentEvent, ContextUsage};
pub use lines::{LineStream, STATUS_LINE_PREFIX, decode_lines, parse_status_line};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

/// Outbound body for one agent turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnRequest {
    pub message: String,
    pub agent_type: String,
    pub provider: String,
    pub model: String,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_history: Option<Vec<HistoryMessage>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

impl TurnRequest {
    pub fn has_images(&self) -> bool {
        self.images.as_ref().is_some_and(|imgs| !imgs.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolResultPayload {
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default = "default_success")]
    pub success: bool,
}

fn default_success() -> bool {
    true
}

/// Response of the non-streaming fallback endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct FallbackResponse {
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub tool_results: Vec<ToolResultPayload>,
}

/// Transport seam between the runtime and the agent process.
#[async_trait]
pub trait AgentApi: Send + Sync {
    /// Open a streaming turn. The returned stream yields the synthetic
    /// status line first, then protocol lines until the transport ends.
    async fn stream_turn(
        &self,
        request: TurnRequest,
        cancel: CancellationToken,
    ) -> Result<LineStream, ApiError>;

    /// Non-streaming fallback, used when the request carries images.
    async fn complete_turn(&self, request: TurnRequest) -> Result<FallbackResponse, ApiError>;
}

#[derive(Clone)]
pub struct AgentClient {
    http: reqwest::Client,
    base_url: String,
}

impl AgentClient {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    fn endpoint(&self, agent_type: &str, suffix: &str) -> String {
        format!(
            "{}/{agent_type}/{suffix}",
            self.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl AgentApi for AgentClient {
    async fn stream_turn(
        &self,
        request: TurnRequest,
        cancel: CancellationToken,
    ) -> Result<LineStream, ApiError> {
        if request.message.is_empty() {
            return Err(ApiError::InvalidRequest {
                details: "message must not be empty".to_string(),
            });
        }

        let url = self.endpoint(&request.agent_type, "stream");
        let send = self.http.post(&url).json(&request).send();

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(ApiError::Cancelled);
            }
            res = send => res?,
        };

        // Non-success responses are not an error here: the status travels as
        // the stream's synthetic first line and the caller owns the policy.
        let status = response.status().as_u16();
        Ok(decode_lines(status, response.bytes_stream()))
    }

    async fn complete_turn(&self, request: TurnRequest) -> Result<FallbackResponse, ApiError> {
        let url = self.endpoint(&request.agent_type, "complete");
        let response = self.http.post(&url).json(&request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let details = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                code: status.as_u16(),
                details,
            });
        }

        Ok(response.json().await?)
    }
}
