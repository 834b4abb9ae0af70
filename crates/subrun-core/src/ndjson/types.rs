//! Message types for the stream-json protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Messages a run reacts to. Everything else is [`Message::Unknown`].
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    SystemInit(SystemInit),
    Assistant(AssistantMessage),
    ControlRequest(ControlRequest),
    Result(SessionResult),
    Unknown { msg_type: String, payload: Value },
}

/// System initialization message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SystemInit {
    pub session_id: String,
    pub model: String,
    pub cwd: PathBuf,
    /// Names of the MCP servers the engine reports as connected.
    pub mcp_servers: Vec<String>,
}

/// Complete assistant message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
    pub usage: Usage,
}

impl AssistantMessage {
    /// Concatenated text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::ToolUse { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Content block in assistant message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
}

/// Token usage statistics.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
}

/// Permission request from the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_id: String,
    pub request: ControlRequestType,
}

/// Control request type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequestType {
    CanUseTool { tool_name: String, input: Value },
    Unknown(Value),
}

/// Final message of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionResult {
    pub subtype: ResultSubtype,
    /// Final answer text; empty when the engine reports none.
    pub result: String,
    pub is_error: bool,
    pub session_id: String,
    pub num_turns: u32,
    pub duration_ms: u64,
    pub cost_usd: Option<f64>,
    pub usage: Usage,
}

/// Result subtype.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResultSubtype {
    #[default]
    Success,
    /// `error_max_turns`: the iteration budget ran out.
    MaxTurns,
    Error,
    Unknown(String),
}
