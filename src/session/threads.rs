//! Per-thread state and turn serialization
//!
//! At most one turn runs per thread: callers hold the thread's lock for the
//! whole turn. Distinct threads proceed independently. History lives in the
//! thread's slot and expires with the session; whenever the stored context is
//! gone, the history goes with it.

use crate::error::Result;
use crate::memory::{summary_message, ConversationHistory};
use crate::models::ContextMap;
use crate::session::cache::TtlCache;
use crate::session::clock::Clock;
use crate::session::store::SessionStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadState {
    pub history: ConversationHistory,
    pub context: ContextMap,
}

impl ThreadState {
    pub fn new(thread_id: &str) -> Self {
        Self {
            history: ConversationHistory::new(thread_id),
            context: ContextMap::new(thread_id),
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.context.thread_id
    }
}

pub type ThreadSlots = TtlCache<String, Arc<Mutex<ThreadState>>>;

pub struct ThreadRegistry {
    slots: Arc<ThreadSlots>,
    store: Arc<dyn SessionStore>,
}

impl ThreadRegistry {
    /// `ttl` should match the session store's, so slots and contexts expire together
    pub fn new(store: Arc<dyn SessionStore>, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: Arc::new(TtlCache::new("threads", ttl, clock)),
            store,
        }
    }

    /// Underlying slot cache, for attaching a sweeper
    pub fn slots(&self) -> Arc<ThreadSlots> {
        self.slots.clone()
    }

    /// Exclusive access to a thread for one turn. The persisted context is
    /// reloaded on every checkout. A missing context resets the whole thread;
    /// a context whose history was lost gets its summary back as the prefix.
    pub async fn checkout(&self, thread_id: &str) -> Result<OwnedMutexGuard<ThreadState>> {
        let slot = self
            .slots
            .touch_or_insert_with(thread_id.to_string(), || {
                Arc::new(Mutex::new(ThreadState::new(thread_id)))
            })
            .await;

        let mut guard = slot.lock_owned().await;

        match self.store.get(thread_id).await? {
            Some(context) => {
                if guard.history.is_empty() {
                    if let Some(summary) = &context.running_summary {
                        debug!(thread_id, "Restoring summary prefix for a cold thread");
                        guard.history.push(summary_message(&summary.summary));
                    }
                }
                guard.context = context;
            }
            None => {
                if !guard.history.is_empty() {
                    debug!(thread_id, "Session context expired, resetting the thread");
                }
                *guard = ThreadState::new(thread_id);
            }
        }

        Ok(guard)
    }

    /// Write the thread's context back to the session store
    pub async fn persist(&self, state: &ThreadState) -> Result<()> {
        self.store.set(state.thread_id(), &state.context).await
    }

    pub async fn thread_count(&self) -> usize {
        self.slots.len().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RunningSummary, TurnMessage};
    use crate::session::clock::ManualClock;
    use crate::session::store::InMemorySessionStore;
    use std::time::Duration;

    fn registry(clock: Arc<ManualClock>) -> ThreadRegistry {
        let store = Arc::new(InMemorySessionStore::new(Duration::from_secs(600), clock.clone()));
        ThreadRegistry::new(store, Duration::from_secs(600), clock)
    }

    #[tokio::test]
    async fn test_context_survives_between_checkouts() {
        let registry = registry(Arc::new(ManualClock::default()));

        {
            let mut state = registry.checkout("t1").await.unwrap();
            state.history.push(TurnMessage::user("hello"));
            state.context.last_peak_prompt_tokens = 42;
            registry.persist(&state).await.unwrap();
        }

        let state = registry.checkout("t1").await.unwrap();
        assert_eq!(state.history.len(), 1);
        assert_eq!(state.context.last_peak_prompt_tokens, 42);
    }

    #[tokio::test]
    async fn test_expired_context_resets() {
        let clock = Arc::new(ManualClock::default());
        let registry = registry(clock.clone());

        {
            let mut state = registry.checkout("t1").await.unwrap();
            state.context.last_peak_prompt_tokens = 42;
            registry.persist(&state).await.unwrap();
        }

        clock.advance(Duration::from_secs(601));
        let state = registry.checkout("t1").await.unwrap();
        assert_eq!(state.context.last_peak_prompt_tokens, 0);
        assert_eq!(state.context.thread_id, "t1");
    }

    #[tokio::test]
    async fn test_history_resets_with_expired_context() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemorySessionStore::new(Duration::from_secs(600), clock.clone()));
        // Slots outlive the stored context here, as after a missed persist.
        let registry = ThreadRegistry::new(store.clone(), Duration::from_secs(3600), clock.clone());

        {
            let mut state = registry.checkout("t1").await.unwrap();
            state.history.push(summary_message("Earlier they asked about budgets."));
            state.history.push(TurnMessage::user("and now?"));
            state.context.running_summary = Some(RunningSummary {
                summary: "Earlier they asked about budgets.".to_string(),
                ..RunningSummary::default()
            });
            registry.persist(&state).await.unwrap();
        }

        clock.advance(Duration::from_secs(601));
        let state = registry.checkout("t1").await.unwrap();
        assert!(state.history.is_empty());
        assert!(state.context.running_summary.is_none());
    }

    #[tokio::test]
    async fn test_cold_thread_gets_summary_prefix_back() {
        let clock = Arc::new(ManualClock::default());
        let store: Arc<InMemorySessionStore> =
            Arc::new(InMemorySessionStore::new(Duration::from_secs(600), clock.clone()));

        let mut context = ContextMap::new("t1");
        context.running_summary = Some(RunningSummary {
            summary: "They are saving for a car.".to_string(),
            ..RunningSummary::default()
        });
        store.set("t1", &context).await.unwrap();

        // A registry with no slots, as after a restart.
        let registry = ThreadRegistry::new(store, Duration::from_secs(600), clock);
        let state = registry.checkout("t1").await.unwrap();

        assert_eq!(state.history.len(), 1);
        let first = &state.history.messages()[0];
        assert!(first.metadata.is_summary);
        assert!(first.text().contains("They are saving for a car."));
    }

    #[tokio::test]
    async fn test_idle_slots_expire() {
        let clock = Arc::new(ManualClock::default());
        let registry = registry(clock.clone());
        drop(registry.checkout("t1").await.unwrap());
        drop(registry.checkout("t2").await.unwrap());
        assert_eq!(registry.thread_count().await, 2);

        clock.advance(Duration::from_secs(600));
        assert_eq!(registry.slots().sweep_expired().await, 2);
        assert_eq!(registry.thread_count().await, 0);
    }

    #[tokio::test]
    async fn test_same_thread_is_serialized() {
        let registry = Arc::new(registry(Arc::new(ManualClock::default())));
        let first = registry.checkout("t1").await.unwrap();

        let contender = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.checkout("t1").await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        // A different thread is not blocked.
        let other = registry.checkout("t2").await.unwrap();
        assert_eq!(other.thread_id(), "t2");

        drop(first);
        contender.await.unwrap().unwrap();
        assert_eq!(registry.thread_count().await, 2);
    }
}
