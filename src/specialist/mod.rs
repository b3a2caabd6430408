//! Specialists
//!
//! A specialist receives exactly one delegation message and hands control
//! back with a completion pair, whatever happened inside. Compiled handles
//! are built per user and cached with a TTL.

pub mod tool_loop;
pub mod worker;

pub use tool_loop::{LoopDecision, LoopOutcome, LoopReport, LoopState, ToolLoop, ToolLoopRun};
pub use worker::{ToolLoopFactory, ToolLoopSpecialist};

use crate::error::{OrchestrationError, Result};
use crate::handoff::{complete_handoff, ControlReturn, SUPERVISOR_ID};
use crate::models::{RetrievedSource, TurnMessage};
use crate::session::{Clock, TtlCache};
use crate::stream::EventEmitter;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Per-invocation settings handed to a specialist
pub struct RunConfig<'a> {
    pub thread_id: &'a str,
    pub user_id: Option<&'a str>,
    pub emitter: &'a EventEmitter,
}

#[derive(Debug, Clone)]
pub struct SpecialistOutput {
    /// Ends with exactly one completion pair
    pub messages: Vec<TurnMessage>,
    pub control: ControlReturn,
    /// Retrieved sources the answer actually used
    pub sources: Vec<RetrievedSource>,
    pub peak_prompt_tokens: u64,
}

impl SpecialistOutput {
    /// A single assistant message followed by the completion pair
    pub fn reply(specialist_id: &str, text: impl Into<String>) -> Self {
        let (pair, control) = complete_handoff(specialist_id, SUPERVISOR_ID).into_messages();
        let mut messages = vec![TurnMessage::assistant(text).with_name(specialist_id)];
        messages.extend(pair);
        Self {
            messages,
            control,
            sources: Vec::new(),
            peak_prompt_tokens: 0,
        }
    }
}

#[async_trait]
pub trait Specialist: Send + Sync {
    fn id(&self) -> &str;

    /// Never fails: errors become an apology plus the completion pair
    async fn invoke(&self, delegation: TurnMessage, run: &RunConfig<'_>) -> SpecialistOutput;
}

/// Builds a user's compiled specialist handle
#[async_trait]
pub trait SpecialistFactory: Send + Sync {
    fn id(&self) -> &str;
    fn description(&self) -> &str;
    async fn build(&self, user_id: &str) -> Result<Arc<dyn Specialist>>;
}

type HandleKey = (String, String);

/// Registered specialists and their cached per-user handles
pub struct SpecialistDirectory {
    factories: BTreeMap<String, Arc<dyn SpecialistFactory>>,
    handles: TtlCache<HandleKey, Arc<dyn Specialist>>,
}

impl SpecialistDirectory {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            factories: BTreeMap::new(),
            handles: TtlCache::new("specialist_handles", ttl, clock),
        }
    }

    pub fn register(&mut self, factory: Arc<dyn SpecialistFactory>) {
        self.factories.insert(factory.id().to_string(), factory);
    }

    pub fn with(mut self, factory: Arc<dyn SpecialistFactory>) -> Self {
        self.register(factory);
        self
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    /// `(id, description)` pairs in id order
    pub fn descriptions(&self) -> Vec<(&str, &str)> {
        self.factories
            .values()
            .map(|f| (f.id(), f.description()))
            .collect()
    }

    /// Cached handle for this user, built on a miss or after expiry
    pub async fn resolve(&self, id: &str, user_id: &str) -> Result<Arc<dyn Specialist>> {
        let factory = self
            .factories
            .get(id)
            .ok_or_else(|| OrchestrationError::UnknownSpecialist(id.to_string()))?;

        let key = (user_id.to_string(), id.to_string());
        if let Some(handle) = self.handles.get(&key).await {
            return Ok(handle);
        }

        debug!(specialist = id, user_id, "Building specialist handle");
        let handle = factory.build(user_id).await?;
        self.handles.insert(key, handle.clone()).await;
        Ok(handle)
    }

    pub async fn sweep_expired(&self) -> usize {
        self.handles.sweep_expired().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handoff::{count_completion_pairs, ends_with_completion};
    use crate::session::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoSpecialist;

    #[async_trait]
    impl Specialist for EchoSpecialist {
        fn id(&self) -> &str {
            "echo"
        }

        async fn invoke(&self, delegation: TurnMessage, _run: &RunConfig<'_>) -> SpecialistOutput {
            SpecialistOutput::reply("echo", delegation.text())
        }
    }

    struct CountingFactory {
        builds: AtomicUsize,
    }

    #[async_trait]
    impl SpecialistFactory for CountingFactory {
        fn id(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Repeats the task"
        }

        async fn build(&self, _user_id: &str) -> Result<Arc<dyn Specialist>> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(EchoSpecialist))
        }
    }

    #[test]
    fn test_reply_ends_with_one_completion_pair() {
        let output = SpecialistOutput::reply("echo", "done");
        assert_eq!(output.messages.len(), 3);
        assert_eq!(count_completion_pairs(&output.messages), 1);
        assert!(ends_with_completion(&output.messages));
        assert_eq!(output.control, ControlReturn::Coordinator(SUPERVISOR_ID.to_string()));
    }

    #[tokio::test]
    async fn test_handles_cached_per_user_until_ttl() {
        let clock = Arc::new(ManualClock::default());
        let factory = Arc::new(CountingFactory {
            builds: AtomicUsize::new(0),
        });
        let directory =
            SpecialistDirectory::new(Duration::from_secs(900), clock.clone()).with(factory.clone());

        directory.resolve("echo", "user-1").await.unwrap();
        directory.resolve("echo", "user-1").await.unwrap();
        directory.resolve("echo", "user-2").await.unwrap();
        assert_eq!(factory.builds.load(Ordering::SeqCst), 2);

        clock.advance(Duration::from_secs(900));
        directory.resolve("echo", "user-1").await.unwrap();
        assert_eq!(factory.builds.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unknown_specialist() {
        let directory = SpecialistDirectory::new(Duration::from_secs(1), Arc::new(ManualClock::default()));
        let err = directory.resolve("nope", "user-1").await.err().unwrap();
        assert!(matches!(err, OrchestrationError::UnknownSpecialist(_)));
    }
}
