//! Tool trait and registry
//!
//! Tools are what specialists call from inside their tool loop.
//! HTTP-backed tools call the financial data service; the ranking and
//! SQL-generation logic behind those endpoints lives in that service.

use crate::error::OrchestrationError;
use crate::hydration::SnapshotSource;
use crate::model::ToolSpec;
use crate::models::{ToolInput, ToolOutput};
use crate::Result;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Trait for a single tool
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;

    /// JSON schema for the arguments
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput>;
}

/// Tool registry for looking up and executing tools
#[derive(Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn with(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Declarations advertised to the model, sorted by name
    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .values()
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Registry containing only the named tools
    pub fn subset(&self, names: &[&str]) -> Self {
        Self {
            tools: self
                .tools
                .iter()
                .filter(|(name, _)| names.contains(&name.as_str()))
                .map(|(name, tool)| (name.clone(), tool.clone()))
                .collect(),
        }
    }

    /// Execute by name. Unknown tools and tool failures become failed outputs
    /// so the model sees them as observations.
    pub async fn execute(&self, input: &ToolInput) -> ToolOutput {
        let Some(tool) = self.get(&input.tool_name) else {
            return ToolOutput::failed(
                OrchestrationError::ToolNotFound(input.tool_name.clone()).to_string(),
            );
        };

        match tool.execute(input).await {
            Ok(output) => output,
            Err(e) => ToolOutput::failed(e.to_string()),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct ServiceApiClient {
    client: Client,
    base_url: String,
}

impl ServiceApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                OrchestrationError::ToolError(format!(
                    "Financial API request failed for {}: {}",
                    path, e
                ))
            })?;

        let status = response.status();
        let body = response
            .json::<Value>()
            .await
            .map_err(|e| OrchestrationError::ToolError(format!("Invalid JSON response: {}", e)))?;

        if !status.is_success() {
            return Err(OrchestrationError::ToolError(format!(
                "Financial API returned {} for {}: {}",
                status, path, body
            )));
        }

        Ok(body)
    }
}

/// Per-user balances and recent activity, injected by the hydration stage
#[async_trait::async_trait]
impl SnapshotSource for ServiceApiClient {
    async fn fetch(&self, user_id: &str) -> Result<Value> {
        self.post_json("/api/v1/users/snapshot", &json!({ "user_id": user_id }))
            .await
            .map_err(|e| OrchestrationError::HydrationError(e.to_string()))
    }
}

fn require_query(input: &ToolInput) -> Result<String> {
    if !input.parameters.is_object() {
        return Err(OrchestrationError::InvalidToolInput(
            "tool_input must be a JSON object".to_string(),
        ));
    }

    input
        .parameters
        .get("query")
        .and_then(|v| v.as_str())
        .or_else(|| input.parameters.get("text").and_then(|v| v.as_str()))
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            OrchestrationError::InvalidToolInput("Expected 'query' in tool_input".to_string())
        })
}

/// Knowledge-base retrieval. Returns `{content, source, metadata}` observations.
pub struct KnowledgeSearchTool {
    api: ServiceApiClient,
}

impl KnowledgeSearchTool {
    pub fn new(api: ServiceApiClient) -> Self {
        Self { api }
    }
}

#[async_trait::async_trait]
impl Tool for KnowledgeSearchTool {
    fn name(&self) -> &str {
        "knowledge_search"
    }

    fn description(&self) -> &str {
        "Search the financial education knowledge base; results carry their source url"
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let query = require_query(input)?;
        let limit = input
            .parameters
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(5);

        let response = self
            .api
            .post_json(
                "/api/v1/knowledge/search",
                &json!({ "query": query, "limit": limit }),
            )
            .await?;

        let results = response.get("results").cloned().unwrap_or(response);
        Ok(ToolOutput::ok(results))
    }
}

/// Natural-language query over the user's accounts and transactions
pub struct AccountQueryTool {
    api: ServiceApiClient,
}

impl AccountQueryTool {
    pub fn new(api: ServiceApiClient) -> Self {
        Self { api }
    }
}

#[async_trait::async_trait]
impl Tool for AccountQueryTool {
    fn name(&self) -> &str {
        "account_query"
    }

    fn description(&self) -> &str {
        "Answer questions about the user's balances, transactions and spending"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "user_id": { "type": "string" }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let query = require_query(input)?;
        let mut body = json!({ "query": query });
        if let Some(user_id) = input.parameters.get("user_id") {
            body["user_id"] = user_id.clone();
        }

        let response = self.api.post_json("/api/v1/accounts/query", &body).await?;
        Ok(ToolOutput::ok(response))
    }
}

/// Fixed-output tool for development & testing
pub struct FixtureTool {
    name: String,
    description: String,
    output: ToolOutput,
}

impl FixtureTool {
    pub fn new(name: impl Into<String>, output: Value) -> Self {
        Self {
            name: name.into(),
            description: "Fixture tool".to_string(),
            output: ToolOutput::ok(output),
        }
    }

    pub fn failing(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: "Fixture tool".to_string(),
            output: ToolOutput::failed(error),
        }
    }
}

#[async_trait::async_trait]
impl Tool for FixtureTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn execute(&self, _input: &ToolInput) -> Result<ToolOutput> {
        Ok(self.output.clone())
    }
}

/// Create a registry with the HTTP-backed service tools.
/// Empty when no service base url is configured.
pub fn create_default_registry(base_url: Option<&str>) -> Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();

    if let Some(base_url) = base_url {
        let api = ServiceApiClient::new(base_url)?;
        registry.register(Arc::new(KnowledgeSearchTool::new(api.clone())));
        registry.register(Arc::new(AccountQueryTool::new(api)));
    }

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_tool_becomes_failed_output() {
        let registry = ToolRegistry::new();
        let output = registry
            .execute(&ToolInput {
                tool_name: "missing".to_string(),
                parameters: json!({}),
            })
            .await;
        assert!(!output.success);
        assert!(output.error.unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn test_fixture_tool_and_specs() {
        let registry = ToolRegistry::new()
            .with(Arc::new(FixtureTool::new("b_tool", json!({"ok": true}))))
            .with(Arc::new(FixtureTool::new("a_tool", json!({"ok": true}))));

        let names: Vec<String> = registry.specs().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["a_tool".to_string(), "b_tool".to_string()]);

        let output = registry
            .execute(&ToolInput {
                tool_name: "a_tool".to_string(),
                parameters: json!({}),
            })
            .await;
        assert!(output.success);
        assert_eq!(registry.subset(&["b_tool"]).list(), vec!["b_tool"]);
    }

    #[test]
    fn test_require_query() {
        let ok = ToolInput {
            tool_name: "knowledge_search".to_string(),
            parameters: json!({"query": "what is APR"}),
        };
        assert_eq!(require_query(&ok).unwrap(), "what is APR");

        let blank = ToolInput {
            tool_name: "knowledge_search".to_string(),
            parameters: json!({"query": "  "}),
        };
        assert!(require_query(&blank).is_err());

        let not_object = ToolInput {
            tool_name: "knowledge_search".to_string(),
            parameters: json!("what is APR"),
        };
        assert!(require_query(&not_object).is_err());
    }

    #[test]
    fn test_default_registry_without_service() {
        let registry = create_default_registry(None).unwrap();
        assert!(registry.is_empty());
        let registry = create_default_registry(Some("http://localhost:9000/")).unwrap();
        assert_eq!(registry.specs().len(), 2);
    }
}
