use serde::Deserialize;

fn default_success() -> bool {
    true
}

/// Context-window usage as reported by the agent alongside a final answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextUsage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub context_window: Option<u32>,
}

impl ContextUsage {
    pub fn is_empty(&self) -> bool {
        self.prompt_tokens.is_none()
            && self.completion_tokens.is_none()
            && self.context_window.is_none()
    }
}

/// One decoded protocol event from the agent stream.
///
/// The wire payload is a JSON object discriminated on `type`; unknown fields
/// are ignored and missing fields fall back to defaults so that older agents
/// stay decodable.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AgentEvent {
    Think {
        #[serde(default)]
        content: String,
    },
    ToolCall {
        #[serde(default)]
        content: String,
        #[serde(default)]
        tool: Option<String>,
    },
    ToolResult {
        #[serde(default)]
        content: String,
        #[serde(default)]
        tool: Option<String>,
        #[serde(default = "default_success")]
        success: bool,
    },
    FinalAnswer {
        #[serde(default)]
        content: String,
        #[serde(default)]
        confidence: Option<f32>,
        #[serde(flatten)]
        usage: ContextUsage,
    },
    SubAgentSpawn {
        #[serde(default)]
        content: String,
        #[serde(default)]
        tool: Option<String>,
    },
    SubAgentResult {
        #[serde(default)]
        content: String,
        #[serde(default)]
        tool: Option<String>,
        #[serde(default = "default_success")]
        success: bool,
    },
    Notify {
        #[serde(default)]
        content: String,
    },
    Error {
        #[serde(default)]
        content: String,
    },
}
