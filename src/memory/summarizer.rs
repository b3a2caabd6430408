//! Context Summarization
//!
//! Renders the compacted head of a conversation as a transcript and asks a
//! model for a bounded-length synopsis.

use crate::error::OrchestrationError;
use crate::model::{ModelRequest, SharedModel};
use crate::models::{Role, TurnMessage};
use async_trait::async_trait;
use tracing::{info, warn};

const SUMMARY_SYSTEM_PROMPT: &str = "\
You summarize earlier portions of a conversation between a user and a \
personal finance assistant. Keep facts the assistant will need later: goals, \
amounts, accounts, decisions and open questions. Be concise and factual.";

/// Trait for the summarization model
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Produce a synopsis of `transcript`, folding in `previous` when present
    async fn summarize(
        &self,
        transcript: &str,
        previous: Option<&str>,
        max_tokens: u32,
    ) -> crate::Result<String>;
}

/// Summarizer backed by any `ModelClient`
pub struct ModelSummarizer {
    model: SharedModel,
}

impl ModelSummarizer {
    pub fn new(model: SharedModel) -> Self {
        Self { model }
    }
}

#[async_trait]
impl Summarizer for ModelSummarizer {
    async fn summarize(
        &self,
        transcript: &str,
        previous: Option<&str>,
        max_tokens: u32,
    ) -> crate::Result<String> {
        let mut prompt = String::new();
        if let Some(previous) = previous.filter(|p| !p.trim().is_empty()) {
            prompt.push_str("EXISTING SUMMARY:\n---\n");
            prompt.push_str(previous);
            prompt.push_str("\n---\n\n");
        }
        prompt.push_str("CONVERSATION:\n---\n");
        prompt.push_str(transcript);
        prompt.push_str("\n---\n\nUpdated summary:");

        let request = ModelRequest {
            system: Some(SUMMARY_SYSTEM_PROMPT.to_string()),
            messages: vec![TurnMessage::user(prompt)],
            tools: Vec::new(),
            max_tokens: Some(max_tokens),
        };

        info!(transcript_chars = transcript.len(), "Requesting conversation synopsis");

        match self.model.complete(&request).await {
            Ok(response) => Ok(response.visible_text()),
            Err(e) => {
                warn!("Failed to summarize context: {}", e);
                Err(OrchestrationError::SummarizationError(e.to_string()))
            }
        }
    }
}

/// Format messages into readable text, collapsing consecutive identical
/// role+text pairs and skipping empty messages
pub fn render_transcript(messages: &[&TurnMessage]) -> String {
    let mut text = String::new();
    let mut previous: Option<(Role, String)> = None;

    for msg in messages {
        let body = msg.text();
        let body = body.trim();
        if body.is_empty() {
            continue;
        }

        if let Some((role, prev_body)) = &previous {
            if *role == msg.role && prev_body == body {
                continue;
            }
        }

        text.push_str(&format!("{}: {}\n", msg.role, body));
        previous = Some((msg.role, body.to_string()));
    }

    text
}
