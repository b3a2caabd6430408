//! Memory hydration stage
//!
//! Two enrichment calls run between compaction and the coordinator:
//! `hotpath` then `context_hydrate`. Their output is an opaque patch of
//! messages to append and context keys to merge. The router treats both as
//! best-effort.

use crate::error::{OrchestrationError, Result};
use crate::memory::ConversationHistory;
use crate::models::{ContextMap, TurnMessage, INJECTED_CONTEXT_PREFIX};
use crate::session::SnapshotCache;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

/// Messages to append plus context keys to merge
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextPatch {
    pub messages: Vec<TurnMessage>,
    pub context: Map<String, Value>,
}

impl ContextPatch {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.context.is_empty()
    }

    pub fn with_message(mut self, message: TurnMessage) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_key(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Append the messages to history and shallow-merge the context keys
    pub fn apply(self, history: &mut ConversationHistory, context: &mut ContextMap) {
        context.merge_patch(&self.context);
        history.extend(self.messages);
    }
}

#[async_trait]
pub trait MemoryHydrator: Send + Sync {
    /// Fast recall for the current turn
    async fn hotpath(&self, history: &ConversationHistory, context: &ContextMap) -> Result<ContextPatch>;

    /// Slower, profile-level enrichment
    async fn context_hydrate(
        &self,
        history: &ConversationHistory,
        context: &ContextMap,
    ) -> Result<ContextPatch>;
}

/// Hydrator that contributes nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHydrator;

#[async_trait]
impl MemoryHydrator for NoopHydrator {
    async fn hotpath(&self, _: &ConversationHistory, _: &ContextMap) -> Result<ContextPatch> {
        Ok(ContextPatch::default())
    }

    async fn context_hydrate(&self, _: &ConversationHistory, _: &ContextMap) -> Result<ContextPatch> {
        Ok(ContextPatch::default())
    }
}

/// Source of per-user financial snapshots (balances, recent transactions)
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self, user_id: &str) -> Result<Value>;
}

/// Injects a per-user snapshot as a prefixed context message. Fetches are
/// cached per user; injection is per thread, whenever the thread's history
/// holds no live injected context (new thread, or compacted away).
pub struct SnapshotHydrator {
    source: Arc<dyn SnapshotSource>,
    cache: Arc<SnapshotCache>,
}

impl SnapshotHydrator {
    pub fn new(source: Arc<dyn SnapshotSource>, cache: Arc<SnapshotCache>) -> Self {
        Self { source, cache }
    }

    async fn snapshot(&self, user_id: &str) -> Result<Value> {
        if let Some(snapshot) = self.cache.get(&user_id.to_string()).await {
            debug!(user_id, "Snapshot cache hit");
            return Ok(snapshot);
        }

        let snapshot = self.source.fetch(user_id).await?;
        self.cache.insert(user_id.to_string(), snapshot.clone()).await;
        Ok(snapshot)
    }
}

#[async_trait]
impl MemoryHydrator for SnapshotHydrator {
    async fn hotpath(&self, _: &ConversationHistory, _: &ContextMap) -> Result<ContextPatch> {
        Ok(ContextPatch::default())
    }

    async fn context_hydrate(
        &self,
        history: &ConversationHistory,
        context: &ContextMap,
    ) -> Result<ContextPatch> {
        let Some(user_id) = context.user_id.as_deref() else {
            return Ok(ContextPatch::default());
        };

        if history.messages().iter().any(TurnMessage::is_injected_context) {
            return Ok(ContextPatch::default());
        }

        let snapshot = self.snapshot(user_id).await?;
        let rendered = serde_json::to_string(&snapshot)
            .map_err(|e| OrchestrationError::HydrationError(e.to_string()))?;

        Ok(ContextPatch::default()
            .with_message(TurnMessage::user(format!("{} {}", INJECTED_CONTEXT_PREFIX, rendered)))
            .with_key("snapshot_injected_at", Value::String(chrono::Utc::now().to_rfc3339())))
    }
}
