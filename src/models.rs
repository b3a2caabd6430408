//! Core data models for the turn router

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Messages starting with this prefix were injected by the hydration stage
/// (profile, account context) and are not user-authored dialogue.
pub const INJECTED_CONTEXT_PREFIX: &str = "[USER CONTEXT]";

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompactionReason {
    TokenThreshold,
    UserMessageFallback,
}

//
// ================= Turn Message =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Reasoning { text: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Visible text: plain text, or all text blocks joined (reasoning excluded)
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    ContentBlock::Reasoning { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageMetadata {
    #[serde(default)]
    pub is_handoff_back: bool,
    #[serde(default)]
    pub is_summary: bool,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

/// A tool invocation requested by a model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: format!("call_{}", Uuid::new_v4().simple()),
            name: name.into(),
            arguments,
        }
    }
}

/// One normalized conversation message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnMessage {
    pub id: String,
    pub role: Role,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub metadata: MessageMetadata,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TurnMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: MessageContent::Text(content.into()),
            name: None,
            metadata: MessageMetadata::default(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::new(Role::Tool, content);
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    /// Assistant message carrying tool calls and no visible text
    pub fn tool_request(calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::new(Role::Assistant, String::new());
        msg.tool_calls = calls;
        msg
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn text(&self) -> String {
        self.content.text()
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn is_handoff_back(&self) -> bool {
        self.metadata.is_handoff_back
    }

    /// Hydration-injected context or profile message
    pub fn is_injected_context(&self) -> bool {
        self.text().trim_start().starts_with(INJECTED_CONTEXT_PREFIX)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::System => "System",
            Role::Tool => "Tool",
        };
        write!(f, "{}", s)
    }
}

//
// ================= Context =================
//

/// Replaced wholesale on each compaction
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunningSummary {
    pub summary: String,
    pub summarized_message_ids: BTreeSet<String>,
    pub last_summarized_message_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfirmationRequest {
    pub specialist: String,
    pub tool_call_id: String,
    pub prompt: String,
    #[serde(default)]
    pub payload: Value,
}

/// Per-thread side channel read at turn start and written by the router
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContextMap {
    pub thread_id: String,
    /// Owner of the thread, set by the router from the turn input
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub last_peak_prompt_tokens: u64,
    #[serde(default)]
    pub navigation_events: Vec<Value>,
    #[serde(default)]
    pub running_summary: Option<RunningSummary>,
    #[serde(default)]
    pub last_compaction_reason: Option<CompactionReason>,
    #[serde(default)]
    pub pending_confirmation: Option<ConfirmationRequest>,
    /// Inbound messages accepted so far; seeds derived message ids
    #[serde(default)]
    pub ingress_count: usize,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl ContextMap {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            ..Self::default()
        }
    }

    /// Shallow-merge an opaque patch. Navigation events append; every other
    /// key overwrites the matching entry in `extra`.
    pub fn merge_patch(&mut self, patch: &Map<String, Value>) {
        for (key, value) in patch {
            if key == "navigation_events" {
                if let Value::Array(events) = value {
                    self.navigation_events.extend(events.iter().cloned());
                }
                continue;
            }
            self.extra.insert(key.clone(), value.clone());
        }
    }
}

//
// ================= Sources =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievedSource {
    pub url: String,
    #[serde(default)]
    pub metadata: Value,
}

//
// ================= Delegation =================
//

/// Created once by the coordinator, consumed exactly once by a specialist
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct DelegationTask {
    pub task_id: Uuid,
    pub destination: String,
    pub task_description: String,
    pub guidelines: Vec<String>,
}

//
// ================= Tool I/O =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInput {
    pub tool_name: String,
    pub parameters: Value,
}

impl From<&ToolCall> for ToolInput {
    fn from(call: &ToolCall) -> Self {
        Self {
            tool_name: call.name.clone(),
            parameters: call.arguments.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub data: Value,
    pub error: Option<String>,
}

impl ToolOutput {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: Some(error.into()),
        }
    }

    /// Text fed back to the model as the tool result
    pub fn observation_text(&self) -> String {
        if self.success {
            match &self.data {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }
        } else {
            format!(
                "Tool failed: {}",
                self.error.as_deref().unwrap_or("unknown error")
            )
        }
    }
}
