//! NDJSON parser for the stream-json protocol.
//!
//! Implements tolerant reader pattern: unknown fields ignored, unknown types
//! passed through as [`Message::Unknown`].

use serde_json::Value;

use super::types::*;
use crate::error::{Error, Result};

/// Parse a single NDJSON line from the engine's stdout.
pub fn parse_line(line: &str) -> Result<Message> {
    let raw: Value = serde_json::from_str(line)?;
    parse_value(&raw)
}

/// Parse a JSON value into a canonical message.
pub fn parse_value(raw: &Value) -> Result<Message> {
    let msg_type = raw
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::NdjsonParse("Missing 'type' field".into()))?;

    match msg_type {
        "system" => Ok(parse_system(raw)),
        "assistant" => Ok(parse_assistant(raw)),
        "control_request" => parse_control_request(raw),
        "result" => Ok(parse_result(raw)),
        _ => Ok(Message::Unknown {
            msg_type: msg_type.to_string(),
            payload: raw.clone(),
        }),
    }
}

fn str_field(raw: &Value, key: &str) -> String {
    raw.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn parse_system(raw: &Value) -> Message {
    let mcp_servers = raw
        .get("mcp_servers")
        .and_then(Value::as_array)
        .map(|servers| {
            servers
                .iter()
                .filter_map(|s| s.get("name").and_then(Value::as_str).map(String::from))
                .collect()
        })
        .unwrap_or_default();

    Message::SystemInit(SystemInit {
        session_id: str_field(raw, "session_id"),
        model: str_field(raw, "model"),
        cwd: raw
            .get("cwd")
            .and_then(Value::as_str)
            .map(std::path::PathBuf::from)
            .unwrap_or_default(),
        mcp_servers,
    })
}

fn parse_assistant(raw: &Value) -> Message {
    let msg = raw.get("message").unwrap_or(raw);
    Message::Assistant(AssistantMessage {
        content: parse_content_blocks(msg.get("content")),
        usage: parse_usage(msg.get("usage")),
    })
}

fn parse_content_blocks(content: Option<&Value>) -> Vec<ContentBlock> {
    let Some(arr) = content.and_then(Value::as_array) else {
        return Vec::new();
    };

    arr.iter()
        .filter_map(|block| match block.get("type")?.as_str()? {
            "text" => Some(ContentBlock::Text {
                text: block.get("text")?.as_str()?.to_string(),
            }),
            "tool_use" => Some(ContentBlock::ToolUse {
                id: block.get("id")?.as_str()?.to_string(),
                name: block.get("name")?.as_str()?.to_string(),
                input: block.get("input").cloned().unwrap_or(Value::Null),
            }),
            _ => None,
        })
        .collect()
}

fn parse_usage(val: Option<&Value>) -> Usage {
    val.and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

fn parse_control_request(raw: &Value) -> Result<Message> {
    let request_id = raw
        .get("request_id")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::NdjsonParse("Missing request_id".into()))?
        .to_string();

    let request = raw.get("request").cloned().unwrap_or(Value::Null);
    let request_type = match request.get("subtype").and_then(Value::as_str) {
        Some("can_use_tool") => ControlRequestType::CanUseTool {
            tool_name: str_field(&request, "tool_name"),
            input: request.get("input").cloned().unwrap_or(Value::Null),
        },
        _ => ControlRequestType::Unknown(request),
    };

    Ok(Message::ControlRequest(ControlRequest {
        request_id,
        request: request_type,
    }))
}

fn parse_result(raw: &Value) -> Message {
    let subtype = match raw.get("subtype").and_then(Value::as_str) {
        Some("success") | None => ResultSubtype::Success,
        Some("error_max_turns") => ResultSubtype::MaxTurns,
        Some("error" | "error_during_execution") => ResultSubtype::Error,
        Some(other) => ResultSubtype::Unknown(other.to_string()),
    };
    let is_error = raw
        .get("is_error")
        .and_then(Value::as_bool)
        .unwrap_or(!matches!(subtype, ResultSubtype::Success));

    Message::Result(SessionResult {
        subtype,
        result: str_field(raw, "result"),
        is_error,
        session_id: str_field(raw, "session_id"),
        num_turns: raw
            .get("num_turns")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0),
        duration_ms: raw.get("duration_ms").and_then(Value::as_u64).unwrap_or(0),
        cost_usd: raw.get("total_cost_usd").and_then(Value::as_f64),
        usage: parse_usage(raw.get("usage")),
    })
}
