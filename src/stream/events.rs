//! Events delivered to a turn's listener

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TurnStarted,
    StepStatus,
    TokenDelta,
    ToolStarted,
    ToolEnded,
    /// Diagnostic only
    SummarizationTriggered,
    Sources,
    AwaitingConfirmation,
    TurnCompleted,
    TurnFailed,
}

/// One ordered notification. `seq` increases by one per delivered event
/// within a thread's turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamEvent {
    pub seq: u64,
    pub thread_id: String,
    pub kind: EventKind,
    pub payload: Value,
    pub emitted_at: DateTime<Utc>,
}

impl StreamEvent {
    /// Text of a token delta
    pub fn delta_text(&self) -> Option<&str> {
        if self.kind != EventKind::TokenDelta {
            return None;
        }
        self.payload.get("text").and_then(Value::as_str)
    }
}
