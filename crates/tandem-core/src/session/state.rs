use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const TITLE_MAX_CHARS: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One step of agent reasoning or tool use surfaced during a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub kind: TraceKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default = "default_true")]
    pub success: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    Thought,
    ToolCall,
    ToolResult,
    SubAgentSpawn,
    SubAgentResult,
}

impl TraceEntry {
    pub fn thought(content: impl Into<String>) -> Self {
        Self {
            kind: TraceKind::Thought,
            content: content.into(),
            tool: None,
            success: true,
        }
    }

    pub fn tool_call(content: impl Into<String>, tool: Option<String>) -> Self {
        Self {
            kind: TraceKind::ToolCall,
            content: content.into(),
            tool,
            success: true,
        }
    }

    pub fn tool_result(content: impl Into<String>, tool: Option<String>, success: bool) -> Self {
        Self {
            kind: TraceKind::ToolResult,
            content: content.into(),
            tool,
            success,
        }
    }

    pub fn sub_agent_spawn(content: impl Into<String>, tool: Option<String>) -> Self {
        Self {
            kind: TraceKind::SubAgentSpawn,
            content: content.into(),
            tool,
            success: true,
        }
    }

    pub fn sub_agent_result(
        content: impl Into<String>,
        tool: Option<String>,
        success: bool,
    ) -> Self {
        Self {
            kind: TraceKind::SubAgentResult,
            content: content.into(),
            tool,
            success,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    /// Inline transport or agent failure.
    Error,
    /// Marker appended when the user stops a streaming turn.
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trace: Vec<TraceEntry>,
    pub at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::User, content.into(), Vec::new())
    }

    pub fn assistant(content: impl Into<String>, trace: Vec<TraceEntry>) -> Self {
        Self::with_role(MessageRole::Assistant, content.into(), trace)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::Error, content.into(), Vec::new())
    }

    pub fn stopped() -> Self {
        Self::with_role(MessageRole::Stopped, "Stopped by user".to_string(), Vec::new())
    }

    fn with_role(role: MessageRole, content: String, trace: Vec<TraceEntry>) -> Self {
        Self {
            role,
            content,
            trace,
            at: Utc::now(),
        }
    }
}

/// Durable session record, the unit of persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub title: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub unread: bool,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: SessionId::new(),
            title: String::new(),
            messages: Vec::new(),
            linked_task_id: None,
            created_at: Utc::now(),
            unread: false,
        }
    }

    pub fn for_task(task_id: impl Into<String>) -> Self {
        let mut session = Self::new();
        session.linked_task_id = Some(task_id.into());
        session
    }

    /// Derive a listing title from the first user message.
    pub fn derive_title(text: &str) -> String {
        let trimmed = text.trim();
        if trimmed.chars().count() <= TITLE_MAX_CHARS {
            return trimmed.to_string();
        }
        let mut title: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
        title.push('…');
        title
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancellable reference to an in-flight streaming turn.
#[derive(Debug)]
pub struct StreamHandle {
    pub cancel: CancellationToken,
    pub task: JoinHandle<()>,
}

impl StreamHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Ephemeral per-session state, RAM-only, never persisted directly.
///
/// Lazily created on first access; destroyed only on session deletion or
/// shutdown. Eviction clears its buffers but keeps the instance.
#[derive(Debug)]
pub struct SessionState {
    pub is_loading: bool,
    pub thinking: Vec<TraceEntry>,
    pub queue: VecDeque<String>,
    pub stream: Option<StreamHandle>,
    /// Identity of the in-flight turn; updates from superseded turns are
    /// discarded by comparing against this.
    pub active_turn: Option<u64>,
    pub last_prompt: Option<String>,
    pub was_stopped: bool,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub context_window: u32,
    pub last_access: Instant,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            is_loading: false,
            thinking: Vec::new(),
            queue: VecDeque::new(),
            stream: None,
            active_turn: None,
            last_prompt: None,
            was_stopped: false,
            prompt_tokens: 0,
            completion_tokens: 0,
            context_window: 0,
            last_access: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_access = Instant::now();
    }

    /// Install a new stream handle, cancelling any previous one first.
    /// Returns whether a previous stream was replaced.
    pub fn replace_stream(&mut self, handle: StreamHandle) -> bool {
        let replaced = self.cancel_stream();
        self.stream = Some(handle);
        self.is_loading = true;
        replaced
    }

    /// Cancel the active stream handle, if any.
    pub fn cancel_stream(&mut self) -> bool {
        if let Some(handle) = self.stream.take() {
            handle.cancel();
            true
        } else {
            false
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.is_some()
    }

    /// Drop in-RAM buffers on eviction. The stream handle is untouched:
    /// callers must never evict a streaming session.
    pub fn clear_for_eviction(&mut self) {
        self.thinking.clear();
        self.thinking.shrink_to_fit();
        self.prompt_tokens = 0;
        self.completion_tokens = 0;
        self.context_window = 0;
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_short_text_untruncated() {
        assert_eq!(Session::derive_title("  hello world  "), "hello world");
    }

    #[test]
    fn test_title_truncated_to_forty_chars() {
        let long = "a".repeat(80);
        let title = Session::derive_title(&long);
        assert_eq!(title.chars().count(), 41);
        assert!(title.ends_with('…'));
    }

    #[test]
    fn test_title_truncation_is_char_safe() {
        let long = "é".repeat(60);
        let title = Session::derive_title(&long);
        assert_eq!(title.chars().count(), 41);
    }

    #[tokio::test]
    async fn test_replace_stream_cancels_previous() {
        let mut state = SessionState::new();

        let first = CancellationToken::new();
        let replaced = state.replace_stream(StreamHandle {
            cancel: first.clone(),
            task: tokio::spawn(async {}),
        });
        assert!(!replaced);
        assert!(!first.is_cancelled());
        assert!(state.is_streaming());

        let second = CancellationToken::new();
        let replaced = state.replace_stream(StreamHandle {
            cancel: second.clone(),
            task: tokio::spawn(async {}),
        });
        assert!(replaced);
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
    }

    #[test]
    fn test_eviction_clears_buffers_and_counters() {
        let mut state = SessionState::new();
        state.thinking.push(TraceEntry::thought("step"));
        state.prompt_tokens = 10;
        state.completion_tokens = 5;
        state.context_window = 1000;
        state.clear_for_eviction();
        assert!(state.thinking.is_empty());
        assert_eq!(state.prompt_tokens, 0);
        assert_eq!(state.context_window, 0);
    }
}
