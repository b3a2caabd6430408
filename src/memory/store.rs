//! Conversation history storage
//!
//! Ordered, append-only message log for one thread. The only non-append
//! mutation is a `HistoryOp::ClearAll` issued by compaction, which is always
//! followed by the replacement messages in the same batch.

use crate::memory::estimator::estimate_message_tokens;
use crate::models::TurnMessage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single update to a history
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryOp {
    /// Drop every message currently stored
    ClearAll,
    Append(TurnMessage),
}

/// Conversation history for a thread
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationHistory {
    pub thread_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    messages: Vec<TurnMessage>,
}

impl ConversationHistory {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            messages: Vec::new(),
        }
    }

    pub fn from_messages(thread_id: impl Into<String>, messages: Vec<TurnMessage>) -> Self {
        let mut history = Self::new(thread_id);
        history.messages = messages;
        history
    }

    /// Add a message to history
    pub fn push(&mut self, message: TurnMessage) {
        self.messages.push(message);
        self.updated_at = Utc::now();
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = TurnMessage>) {
        self.messages.extend(messages);
        self.updated_at = Utc::now();
    }

    /// Apply a batch of updates in order
    pub fn apply(&mut self, ops: Vec<HistoryOp>) {
        if ops.is_empty() {
            return;
        }
        for op in ops {
            match op {
                HistoryOp::ClearAll => self.messages.clear(),
                HistoryOp::Append(message) => self.messages.push(message),
            }
        }
        self.updated_at = Utc::now();
    }

    pub fn messages(&self) -> &[TurnMessage] {
        &self.messages
    }

    pub fn last(&self) -> Option<&TurnMessage> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Estimated token count of the whole history
    pub fn estimated_tokens(&self) -> usize {
        self.messages.iter().map(estimate_message_tokens).sum()
    }
}
