//! Gemini API client
//!
//! Implements `ModelClient` over the Gemini `generateContent` endpoint.
//! Uses a long-lived reqwest::Client for connection pooling.

use crate::error::OrchestrationError;
use crate::model::{ModelClient, ModelRequest, ModelResponse, ToolSpec, Usage};
use crate::models::{ContentBlock, Role, ToolCall, TurnMessage};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, info};

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Reusable Gemini client (connection-pooled)
pub struct GeminiClient {
    client: Client,
    api_key: String,
    endpoint: String,
    temperature: f32,
}

impl GeminiClient {
    pub fn new(api_key: String, model: &str) -> crate::Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            api_key,
            endpoint: format!("{}/{}:generateContent", BASE_URL, model),
            temperature: 0.3,
        })
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    fn build_request(&self, request: &ModelRequest) -> GeminiRequest {
        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(vec![ToolDeclarations {
                function_declarations: request.tools.iter().map(declaration).collect(),
            }])
        };

        GeminiRequest {
            contents: to_contents(&request.messages),
            generation_config: GenerationConfig {
                temperature: self.temperature,
                top_p: 0.9,
                top_k: 40,
                max_output_tokens: request.max_tokens.unwrap_or(1024),
            },
            system_instruction: request.system.as_ref().map(|s| SystemInstruction {
                parts: vec![Part::text(s.clone())],
            }),
            tools,
        }
    }
}

#[async_trait]
impl ModelClient for GeminiClient {
    async fn complete(&self, request: &ModelRequest) -> crate::Result<ModelResponse> {
        if self.api_key.is_empty() {
            return Err(OrchestrationError::ModelError(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let url = format!("{}?key={}", self.endpoint, self.api_key);
        let body = self.build_request(request);

        debug!(
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Calling Gemini API"
        );

        let response = self.client.post(&url).json(&body).send().await.map_err(|e| {
            error!("Gemini API request failed: {}", e);
            OrchestrationError::ModelError(format!("Gemini API error: {}", e))
        })?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Gemini API error response: {}", error_text);
            return Err(OrchestrationError::ModelError(format!(
                "Gemini API error: {}",
                error_text
            )));
        }

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            OrchestrationError::ModelError(format!("Gemini parse error: {}", e))
        })?;

        let parsed = parse_response(gemini_response)?;

        info!(
            prompt_tokens = parsed.usage.prompt_tokens,
            tool_calls = parsed.tool_calls.len(),
            "Gemini response received"
        );

        Ok(parsed)
    }
}

fn declaration(spec: &ToolSpec) -> FunctionDeclaration {
    FunctionDeclaration {
        name: spec.name.clone(),
        description: spec.description.clone(),
        parameters: spec.parameters.clone(),
    }
}

/// Map normalized messages onto Gemini's user/model contents.
/// System messages inside the history become user-side context parts.
fn to_contents(messages: &[TurnMessage]) -> Vec<Content> {
    let mut contents = Vec::with_capacity(messages.len());

    for msg in messages {
        let (role, parts) = match msg.role {
            Role::User | Role::System => ("user", vec![Part::text(msg.text())]),
            Role::Assistant => {
                let mut parts = Vec::new();
                let text = msg.text();
                if !text.is_empty() {
                    parts.push(Part::text(text));
                }
                for call in &msg.tool_calls {
                    parts.push(Part {
                        function_call: Some(FunctionCall {
                            name: call.name.clone(),
                            args: call.arguments.clone(),
                        }),
                        ..Part::default()
                    });
                }
                ("model", parts)
            }
            Role::Tool => (
                "user",
                vec![Part {
                    function_response: Some(FunctionResponse {
                        name: msg.name.clone().unwrap_or_else(|| "tool".to_string()),
                        response: serde_json::json!({ "content": msg.text() }),
                    }),
                    ..Part::default()
                }],
            ),
        };

        if parts.is_empty() {
            continue;
        }

        contents.push(Content {
            role: Some(role.to_string()),
            parts,
        });
    }

    contents
}

fn parse_response(response: GeminiResponse) -> crate::Result<ModelResponse> {
    let candidate = response.candidates.into_iter().next().ok_or_else(|| {
        OrchestrationError::ModelError("No response from Gemini API".to_string())
    })?;

    let mut parsed = ModelResponse::default();

    for part in candidate.content.parts {
        if let Some(call) = part.function_call {
            parsed.tool_calls.push(ToolCall::new(call.name, call.args));
            continue;
        }
        if let Some(text) = part.text {
            if part.thought.unwrap_or(false) {
                parsed.blocks.push(ContentBlock::Reasoning { text });
            } else {
                parsed.blocks.push(ContentBlock::Text { text });
            }
        }
    }

    if let Some(usage) = response.usage_metadata {
        parsed.usage = Usage {
            prompt_tokens: usage.prompt_token_count.max(0) as u64,
            completion_tokens: usage.candidates_token_count.max(0) as u64,
        };
    }

    Ok(parsed)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDeclarations>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thought: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
}

impl Part {
    fn text(text: String) -> Self {
        Self {
            text: Some(text),
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolDeclarations {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: u32,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: i64,
    #[serde(default)]
    candidates_token_count: i64,
}
