//! Scripted agent transport for runtime tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::api::lines::STATUS_LINE_PREFIX;
use crate::api::{AgentApi, ApiError, FallbackResponse, LineStream, TurnRequest};

/// One scripted streaming turn.
#[derive(Debug, Clone)]
pub struct ScriptedTurn {
    pub status: u16,
    pub lines: Vec<String>,
    /// Pause between lines, to let tests observe mid-stream state.
    pub line_delay: Duration,
    /// Keep the stream open after the last line until cancelled.
    pub hold_open: bool,
}

impl ScriptedTurn {
    pub fn events(raw_events: &[&str]) -> Self {
        let mut lines = Vec::new();
        for raw in raw_events {
            lines.push(format!("data: {raw}"));
            lines.push(String::new());
        }
        Self {
            status: 200,
            lines,
            line_delay: Duration::ZERO,
            hold_open: false,
        }
    }

    pub fn final_answer(content: &str) -> Self {
        Self::events(&[&format!(
            r#"{{"type":"finalAnswer","content":"{content}"}}"#
        )])
    }

    pub fn held_open() -> Self {
        Self {
            status: 200,
            lines: Vec::new(),
            line_delay: Duration::ZERO,
            hold_open: true,
        }
    }

    pub fn status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn keep_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.line_delay = delay;
        self
    }
}

/// `AgentApi` double that replays scripted turns and records every request.
#[derive(Default)]
pub struct ScriptedAgent {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    fallbacks: Mutex<VecDeque<FallbackResponse>>,
    requests: Mutex<Vec<TurnRequest>>,
    streams_opened: AtomicUsize,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push_turn(&self, turn: ScriptedTurn) {
        self.turns.lock().await.push_back(turn);
    }

    pub async fn push_fallback(&self, response: FallbackResponse) {
        self.fallbacks.lock().await.push_back(response);
    }

    pub fn streams_opened(&self) -> usize {
        self.streams_opened.load(Ordering::SeqCst)
    }

    pub async fn requests(&self) -> Vec<TurnRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl AgentApi for ScriptedAgent {
    async fn stream_turn(
        &self,
        request: TurnRequest,
        cancel: CancellationToken,
    ) -> Result<LineStream, ApiError> {
        self.requests.lock().await.push(request);
        self.streams_opened.fetch_add(1, Ordering::SeqCst);

        let turn = self
            .turns
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| ScriptedTurn::events(&[]));

        Ok(Box::pin(async_stream::stream! {
            yield Ok::<String, ApiError>(format!("{STATUS_LINE_PREFIX}{}", turn.status));
            for line in turn.lines {
                if turn.line_delay > Duration::ZERO {
                    tokio::time::sleep(turn.line_delay).await;
                }
                yield Ok(line);
            }
            if turn.hold_open {
                cancel.cancelled().await;
            }
        }))
    }

    async fn complete_turn(&self, request: TurnRequest) -> Result<FallbackResponse, ApiError> {
        self.requests.lock().await.push(request);
        self.fallbacks
            .lock()
            .await
            .pop_front()
            .ok_or(ApiError::InvalidRequest {
                details: "no scripted fallback response".to_string(),
            })
    }
}
