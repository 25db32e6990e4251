use tracing::debug;

use crate::api::event::{AgentEvent, ContextUsage};
use crate::session::state::TraceEntry;

/// Everything accumulated since the previous flush.
#[derive(Debug, Clone, Default)]
pub struct PendingFlush {
    pub entries: Vec<TraceEntry>,
    pub notices: Vec<String>,
    pub usage: Option<ContextUsage>,
}

/// Complete result of a finished streaming turn.
#[derive(Debug, Clone, Default)]
pub struct TurnOutcome {
    pub trace: Vec<TraceEntry>,
    pub final_answer: Option<String>,
    pub confidence: Option<f32>,
    pub usage: ContextUsage,
    pub error: Option<String>,
    pub tool_steps: usize,
}

/// Stateful collector for one in-flight stream.
///
/// Decoding and flush cadence are decoupled: the orchestrator drains
/// `take_pending_flush` on its own timer, bounding state-change frequency
/// regardless of how fast the network delivers events; `take_final_result`
/// is called once after the stream ends and returns the complete trace.
#[derive(Debug, Default)]
pub struct TurnAccumulator {
    trace: Vec<TraceEntry>,
    flushed: usize,
    notices: Vec<String>,
    final_answer: Option<String>,
    confidence: Option<f32>,
    usage: ContextUsage,
    usage_dirty: bool,
    error: Option<String>,
    tool_steps: usize,
}

impl TurnAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and fold in one raw event payload. Malformed payloads are
    /// skipped; the stream carries on.
    pub fn process_raw(&mut self, raw: &str) -> bool {
        match serde_json::from_str::<AgentEvent>(raw) {
            Ok(event) => {
                self.process_event(event);
                true
            }
            Err(e) => {
                debug!(error = %e, "skipping malformed agent event");
                false
            }
        }
    }

    pub fn process_event(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::Think { content } => {
                self.trace.push(TraceEntry::thought(content));
            }
            AgentEvent::ToolCall { content, tool } => {
                self.tool_steps += 1;
                self.trace.push(TraceEntry::tool_call(content, tool));
            }
            AgentEvent::ToolResult {
                content,
                tool,
                success,
            } => {
                self.trace.push(TraceEntry::tool_result(content, tool, success));
            }
            AgentEvent::SubAgentSpawn { content, tool } => {
                self.trace.push(TraceEntry::sub_agent_spawn(content, tool));
            }
            AgentEvent::SubAgentResult {
                content,
                tool,
                success,
            } => {
                self.trace
                    .push(TraceEntry::sub_agent_result(content, tool, success));
            }
            AgentEvent::FinalAnswer {
                content,
                confidence,
                usage,
            } => {
                if !content.is_empty() {
                    self.final_answer
                        .get_or_insert_with(String::new)
                        .push_str(&content);
                }
                if confidence.is_some() {
                    self.confidence = confidence;
                }
                self.merge_usage(usage);
            }
            AgentEvent::Notify { content } => {
                self.notices.push(content);
            }
            AgentEvent::Error { content } => {
                self.error = Some(content);
            }
        }
    }

    fn merge_usage(&mut self, usage: ContextUsage) {
        if usage.is_empty() {
            return;
        }
        if usage.prompt_tokens.is_some() {
            self.usage.prompt_tokens = usage.prompt_tokens;
        }
        if usage.completion_tokens.is_some() {
            self.usage.completion_tokens = usage.completion_tokens;
        }
        if usage.context_window.is_some() {
            self.usage.context_window = usage.context_window;
        }
        self.usage_dirty = true;
    }

    /// Atomically remove and return everything accumulated since the last
    /// flush. Final-answer state is untouched. Returns `None` when there is
    /// nothing new, so callers can skip a no-op state mutation.
    pub fn take_pending_flush(&mut self) -> Option<PendingFlush> {
        if self.flushed == self.trace.len() && self.notices.is_empty() && !self.usage_dirty {
            return None;
        }

        let entries = self.trace[self.flushed..].to_vec();
        self.flushed = self.trace.len();
        let usage = self.usage_dirty.then(|| self.usage.clone());
        self.usage_dirty = false;

        Some(PendingFlush {
            entries,
            notices: std::mem::take(&mut self.notices),
            usage,
        })
    }

    /// Consume the accumulator once the underlying stream has fully ended.
    pub fn take_final_result(self) -> TurnOutcome {
        TurnOutcome {
            trace: self.trace,
            final_answer: self.final_answer,
            confidence: self.confidence,
            usage: self.usage,
            error: self.error,
            tool_steps: self.tool_steps,
        }
    }
}
