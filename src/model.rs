//! Model boundary
//!
//! Coordinator, specialists and the compactor only talk to language models
//! through `ModelClient`. Concrete backends live elsewhere (`gemini`).

use crate::error::OrchestrationError;
use crate::models::{ContentBlock, ToolCall, TurnMessage};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Tool declaration advertised to a model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Default)]
pub struct ModelRequest {
    pub system: Option<String>,
    pub messages: Vec<TurnMessage>,
    pub tools: Vec<ToolSpec>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResponse {
    pub blocks: Vec<ContentBlock>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
}

impl ModelResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            blocks: vec![ContentBlock::Text { text: text.into() }],
            ..Self::default()
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::default()
        }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            blocks: vec![ContentBlock::Reasoning { text: text.into() }],
            ..Self::default()
        }
    }

    pub fn with_block(mut self, block: ContentBlock) -> Self {
        self.blocks.push(block);
        self
    }

    pub fn with_text(self, text: impl Into<String>) -> Self {
        self.with_block(ContentBlock::Text { text: text.into() })
    }

    pub fn with_usage(mut self, prompt_tokens: u64, completion_tokens: u64) -> Self {
        self.usage = Usage {
            prompt_tokens,
            completion_tokens,
        };
        self
    }

    pub fn visible_text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Reasoning { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn has_text(&self) -> bool {
        !self.visible_text().trim().is_empty()
    }

    pub fn has_reasoning(&self) -> bool {
        self.blocks
            .iter()
            .any(|b| matches!(b, ContentBlock::Reasoning { .. }))
    }
}

/// Trait for a chat-completion backend
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse>;

    /// Complete while reporting visible text incrementally. Backends without
    /// native streaming report the whole text as one delta. Text that comes
    /// with a tool-call request is never reported.
    async fn stream(
        &self,
        request: &ModelRequest,
        on_delta: &(dyn for<'d> Fn(&'d str) + Send + Sync),
    ) -> Result<ModelResponse> {
        let response = self.complete(request).await?;
        report_whole_text(&response, on_delta);
        Ok(response)
    }
}

pub type SharedModel = Arc<dyn ModelClient>;

fn report_whole_text(response: &ModelResponse, on_delta: &(dyn for<'d> Fn(&'d str) + Send + Sync)) {
    if response.has_tool_calls() {
        return;
    }
    let text = response.visible_text();
    if !text.is_empty() {
        on_delta(&text);
    }
}

enum ScriptedStep {
    Respond(ModelResponse),
    Stream(Vec<String>, ModelResponse),
    Fail(String),
}

/// Scripted model for development & testing.
/// Replays queued responses in order and records every request.
pub struct ScriptedModel {
    steps: Mutex<VecDeque<ScriptedStep>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn then(self, response: ModelResponse) -> Self {
        self.push(ScriptedStep::Respond(response))
    }

    /// Queue a text answer delivered as the given stream chunks
    pub fn then_stream(self, chunks: Vec<&str>, prompt_tokens: u64) -> Self {
        let chunks: Vec<String> = chunks.into_iter().map(str::to_string).collect();
        let response = ModelResponse::text(chunks.concat()).with_usage(prompt_tokens, 0);
        self.push(ScriptedStep::Stream(chunks, response))
    }

    pub fn then_fail(self, message: impl Into<String>) -> Self {
        self.push(ScriptedStep::Fail(message.into()))
    }

    fn push(mut self, step: ScriptedStep) -> Self {
        self.steps.get_mut().push_back(step);
        self
    }

    pub async fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.requests.lock().await.len()
    }

    pub async fn remaining(&self) -> usize {
        self.steps.lock().await.len()
    }

    async fn next_step(&self, request: &ModelRequest) -> Option<ScriptedStep> {
        self.requests.lock().await.push(request.clone());
        self.steps.lock().await.pop_front()
    }
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse> {
        match self.next_step(request).await {
            Some(ScriptedStep::Respond(response)) | Some(ScriptedStep::Stream(_, response)) => {
                Ok(response)
            }
            Some(ScriptedStep::Fail(message)) => Err(OrchestrationError::ModelError(message)),
            None => Err(OrchestrationError::ModelError(
                "scripted model has no responses left".to_string(),
            )),
        }
    }

    async fn stream(
        &self,
        request: &ModelRequest,
        on_delta: &(dyn for<'d> Fn(&'d str) + Send + Sync),
    ) -> Result<ModelResponse> {
        match self.next_step(request).await {
            Some(ScriptedStep::Stream(chunks, response)) => {
                for chunk in &chunks {
                    on_delta(chunk);
                }
                Ok(response)
            }
            Some(ScriptedStep::Respond(response)) => {
                report_whole_text(&response, on_delta);
                Ok(response)
            }
            Some(ScriptedStep::Fail(message)) => Err(OrchestrationError::ModelError(message)),
            None => Err(OrchestrationError::ModelError(
                "scripted model has no responses left".to_string(),
            )),
        }
    }
}
