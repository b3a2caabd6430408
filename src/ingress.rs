//! Ingress normalization
//!
//! Inbound messages arrive in loose shapes: `role` or `type`, framework
//! aliases (`human`, `ai`), plain string or block-list content, tool-call
//! arguments as objects or JSON strings. Everything is normalized into
//! `TurnMessage` here; nothing past this point looks at raw JSON.

use crate::error::{OrchestrationError, Result};
use crate::models::{ContentBlock, MessageContent, MessageMetadata, Role, ToolCall, TurnMessage};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

fn parse_role(raw: &str) -> Result<Role> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "user" | "human" => Ok(Role::User),
        "assistant" | "ai" | "agent" | "model" => Ok(Role::Assistant),
        "system" => Ok(Role::System),
        "tool" | "function" => Ok(Role::Tool),
        other => Err(OrchestrationError::InvalidMessage(format!("unknown role '{}'", other))),
    }
}

fn parse_block(value: &Value) -> Option<ContentBlock> {
    match value {
        Value::String(text) => Some(ContentBlock::Text { text: text.clone() }),
        Value::Object(block) => {
            let kind = block.get("type").and_then(Value::as_str).unwrap_or("text");
            let text = block
                .get("text")
                .or_else(|| block.get("reasoning"))
                .or_else(|| block.get("thinking"))
                .and_then(Value::as_str)?
                .to_string();
            match kind {
                "reasoning" | "thinking" => Some(ContentBlock::Reasoning { text }),
                _ => Some(ContentBlock::Text { text }),
            }
        }
        _ => None,
    }
}

fn parse_content(value: Option<&Value>) -> Result<MessageContent> {
    match value {
        None | Some(Value::Null) => Ok(MessageContent::default()),
        Some(Value::String(text)) => Ok(MessageContent::Text(text.clone())),
        Some(Value::Array(items)) => Ok(MessageContent::Blocks(
            items.iter().filter_map(parse_block).collect(),
        )),
        Some(other) => Err(OrchestrationError::InvalidMessage(format!(
            "unsupported content shape: {}",
            other
        ))),
    }
}

fn parse_tool_call(value: &Value, thread_id: &str, position: usize, index: usize) -> Result<ToolCall> {
    let call = value
        .as_object()
        .ok_or_else(|| OrchestrationError::InvalidMessage("tool call is not an object".to_string()))?;

    // OpenAI-style calls nest name and arguments under `function`.
    let body = call.get("function").and_then(Value::as_object).unwrap_or(call);

    let name = body
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| OrchestrationError::InvalidMessage("tool call without a name".to_string()))?
        .to_string();

    let arguments = match body.get("arguments").or_else(|| body.get("args")) {
        Some(Value::String(raw)) => serde_json::from_str(raw).unwrap_or(Value::String(raw.clone())),
        Some(other) => other.clone(),
        None => Value::Object(Map::new()),
    };

    let id = match call.get("id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => format!("call_{}_{}", &derive_id(thread_id, position)[..8], index),
    };

    Ok(ToolCall { id, name, arguments })
}

fn parse_metadata(value: Option<&Value>) -> MessageMetadata {
    let Some(Value::Object(map)) = value else {
        return MessageMetadata::default();
    };

    let mut metadata = MessageMetadata::default();
    for (key, value) in map {
        match key.as_str() {
            "is_handoff_back" => metadata.is_handoff_back = value.as_bool().unwrap_or(false),
            "is_summary" => metadata.is_summary = value.as_bool().unwrap_or(false),
            _ => {
                metadata.extra.insert(key.clone(), value.clone());
            }
        }
    }
    metadata
}

/// Deterministic message id: SHA-256 of thread id and position, shaped as a UUID
pub fn derive_id(thread_id: &str, position: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(thread_id.as_bytes());
    hasher.update(b":");
    hasher.update(position.to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!(
        "{}-{}-{}-{}-{}",
        &digest[0..8],
        &digest[8..12],
        &digest[12..16],
        &digest[16..20],
        &digest[20..32]
    )
}

/// Normalize one inbound message. `position` is its index in the thread and
/// seeds the id when none is supplied.
pub fn normalize_message(raw: &Value, thread_id: &str, position: usize) -> Result<TurnMessage> {
    let object = raw.as_object().ok_or_else(|| {
        OrchestrationError::InvalidMessage(format!("message at {} is not an object", position))
    })?;

    let role = object
        .get("role")
        .or_else(|| object.get("type"))
        .and_then(Value::as_str)
        .ok_or_else(|| OrchestrationError::InvalidMessage(format!("message at {} has no role", position)))
        .and_then(parse_role)?;

    let content = parse_content(object.get("content"))?;

    let tool_calls = match object.get("tool_calls") {
        Some(Value::Array(calls)) => calls
            .iter()
            .enumerate()
            .map(|(i, call)| parse_tool_call(call, thread_id, position, i))
            .collect::<Result<Vec<_>>>()?,
        _ => Vec::new(),
    };

    let tool_call_id = object
        .get("tool_call_id")
        .and_then(Value::as_str)
        .map(str::to_string);

    if role == Role::Tool && tool_call_id.is_none() {
        return Err(OrchestrationError::InvalidMessage(format!(
            "tool message at {} has no tool_call_id",
            position
        )));
    }

    let id = match object.get("id") {
        Some(Value::String(id)) if !id.trim().is_empty() => id.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => derive_id(thread_id, position),
    };

    let created_at = object
        .get("created_at")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Ok(TurnMessage {
        id,
        role,
        content,
        name: object.get("name").and_then(Value::as_str).map(str::to_string),
        metadata: parse_metadata(object.get("metadata")),
        tool_calls,
        tool_call_id,
        created_at,
    })
}

/// Normalize a whole thread history in order
pub fn normalize_history(raw: &[Value], thread_id: &str) -> Result<Vec<TurnMessage>> {
    raw.iter()
        .enumerate()
        .map(|(position, message)| normalize_message(message, thread_id, position))
        .collect()
}
