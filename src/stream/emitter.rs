//! Per-turn event emitter
//!
//! Enqueueing never blocks: a full channel drops the event and counts it, a
//! closed channel (listener gone) tears the sink down while the turn keeps
//! running. Consecutive token deltas with identical payloads are collapsed.

use crate::stream::events::{EventKind, StreamEvent};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

/// Fire-and-forget event sink
pub trait EventSink: Send + Sync {
    /// Returns whether the event was enqueued
    fn emit(&self, kind: EventKind, payload: Value) -> bool;
}

#[derive(Debug, Default)]
struct EmitterState {
    seq: u64,
    last_delta: Option<Value>,
    closed: bool,
}

pub struct EventEmitter {
    thread_id: String,
    tx: Option<mpsc::Sender<StreamEvent>>,
    state: Mutex<EmitterState>,
    dropped: AtomicU64,
}

/// Bounded channel for one turn of one thread
pub fn channel(
    thread_id: impl Into<String>,
    capacity: usize,
    idle_timeout: Duration,
) -> (EventEmitter, EventStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let emitter = EventEmitter {
        thread_id: thread_id.into(),
        tx: Some(tx),
        state: Mutex::new(EmitterState::default()),
        dropped: AtomicU64::new(0),
    };
    (emitter, EventStream { rx, idle_timeout })
}

impl EventEmitter {
    /// Emitter with no listener; events are sequenced and discarded
    pub fn detached(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            tx: None,
            state: Mutex::new(EmitterState::default()),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    fn lock_state(&self) -> MutexGuard<'_, EmitterState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn turn_started(&self, user_text: &str) -> bool {
        self.emit(EventKind::TurnStarted, json!({ "input": user_text }))
    }

    pub fn step_status(&self, step: &str, message: &str) -> bool {
        self.emit(EventKind::StepStatus, json!({ "step": step, "message": message }))
    }

    pub fn token_delta(&self, text: &str) -> bool {
        if text.is_empty() {
            return false;
        }
        self.emit(EventKind::TokenDelta, json!({ "text": text }))
    }

    pub fn tool_started(&self, agent: &str, tool: &str, call_id: &str) -> bool {
        self.emit(
            EventKind::ToolStarted,
            json!({ "agent": agent, "tool": tool, "call_id": call_id }),
        )
    }

    pub fn tool_ended(&self, agent: &str, tool: &str, call_id: &str, success: bool) -> bool {
        self.emit(
            EventKind::ToolEnded,
            json!({ "agent": agent, "tool": tool, "call_id": call_id, "success": success }),
        )
    }
}

impl EventSink for EventEmitter {
    fn emit(&self, kind: EventKind, payload: Value) -> bool {
        let mut state = self.lock_state();
        if state.closed {
            return false;
        }

        if kind == EventKind::TokenDelta && state.last_delta.as_ref() == Some(&payload) {
            debug!(thread_id = %self.thread_id, "Suppressed repeated token delta");
            return false;
        }
        // Only a delivered event moves the dedupe window.
        let delivered_delta = (kind == EventKind::TokenDelta).then(|| payload.clone());

        let Some(tx) = &self.tx else {
            state.seq += 1;
            state.last_delta = delivered_delta;
            return true;
        };

        let event = StreamEvent {
            seq: state.seq + 1,
            thread_id: self.thread_id.clone(),
            kind,
            payload,
            emitted_at: Utc::now(),
        };

        match tx.try_send(event) {
            Ok(()) => {
                state.seq += 1;
                state.last_delta = delivered_delta;
                true
            }
            Err(TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    thread_id = %self.thread_id,
                    kind = ?event.kind,
                    dropped,
                    "Event channel full, dropping event"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                state.closed = true;
                info!(thread_id = %self.thread_id, "Listener disconnected, emission sink closed");
                false
            }
        }
    }
}

/// What a bounded wait on the stream produced
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    Event(StreamEvent),
    /// Nothing arrived within the idle timeout; the turn may still be running
    Idle,
    /// The producer finished and every event has been drained
    Closed,
}

/// Consumer half of a turn's channel
pub struct EventStream {
    rx: mpsc::Receiver<StreamEvent>,
    idle_timeout: Duration,
}

impl EventStream {
    pub async fn next(&mut self) -> Received {
        match tokio::time::timeout(self.idle_timeout, self.rx.recv()).await {
            Ok(Some(event)) => Received::Event(event),
            Ok(None) => Received::Closed,
            Err(_) => Received::Idle,
        }
    }

    /// Drain until the producer is done, treating idle waits as "keep waiting"
    pub async fn collect(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        loop {
            match self.next().await {
                Received::Event(event) => events.push(event),
                Received::Idle => continue,
                Received::Closed => return events,
            }
        }
    }

    /// Drop the listener side; the producer keeps running
    pub fn disconnect(self) {
        drop(self.rx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_channel(capacity: usize) -> (EventEmitter, EventStream) {
        channel("thread-1", capacity, Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_events_are_ordered_with_sequence_numbers() {
        let (emitter, stream) = test_channel(16);
        emitter.turn_started("hi");
        emitter.step_status("supervisor", "Thinking");
        emitter.token_delta("Hello");
        emitter.token_delta(" there");
        drop(emitter);

        let events = stream.collect().await;
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
        assert_eq!(events[0].kind, EventKind::TurnStarted);
        assert_eq!(events[3].delta_text(), Some(" there"));
    }

    #[tokio::test]
    async fn test_consecutive_identical_deltas_collapse() {
        let (emitter, stream) = test_channel(16);
        assert!(emitter.token_delta("ab"));
        assert!(!emitter.token_delta("ab"));
        assert!(emitter.token_delta("cd"));
        assert!(emitter.token_delta("ab"));
        emitter.tool_started("accounts", "account_query", "c1");
        assert!(emitter.token_delta("ab"));
        drop(emitter);

        let deltas: Vec<String> = stream
            .collect()
            .await
            .iter()
            .filter_map(|e| e.delta_text().map(str::to_string))
            .collect();
        assert_eq!(deltas, vec!["ab", "cd", "ab", "ab"]);
    }

    #[tokio::test]
    async fn test_full_channel_drops_without_blocking() {
        let (emitter, mut stream) = test_channel(1);
        assert!(emitter.step_status("a", "one"));
        assert!(!emitter.step_status("b", "two"));
        assert_eq!(emitter.dropped_count(), 1);

        match stream.next().await {
            Received::Event(event) => assert_eq!(event.seq, 1),
            other => panic!("expected event, got {:?}", other),
        }
        assert!(emitter.step_status("c", "three"));
        match stream.next().await {
            Received::Event(event) => assert_eq!(event.seq, 2),
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dropped_delta_does_not_suppress_retry() {
        let (emitter, mut stream) = test_channel(1);
        assert!(emitter.token_delta("ab"));
        assert!(!emitter.token_delta("cd"));
        assert_eq!(emitter.dropped_count(), 1);

        match stream.next().await {
            Received::Event(event) => assert_eq!(event.delta_text(), Some("ab")),
            other => panic!("expected event, got {:?}", other),
        }
        assert!(emitter.token_delta("cd"));
        assert!(!emitter.token_delta("cd"));
        drop(emitter);

        let deltas: Vec<String> = stream
            .collect()
            .await
            .iter()
            .filter_map(|e| e.delta_text().map(str::to_string))
            .collect();
        assert_eq!(deltas, vec!["cd"]);
    }

    #[tokio::test]
    async fn test_idle_is_not_closed() {
        let (emitter, mut stream) = test_channel(4);
        assert_eq!(stream.next().await, Received::Idle);
        emitter.step_status("late", "still running");
        assert!(matches!(stream.next().await, Received::Event(_)));
        drop(emitter);
        assert_eq!(stream.next().await, Received::Closed);
    }

    #[tokio::test]
    async fn test_disconnect_closes_sink_only() {
        let (emitter, stream) = test_channel(4);
        stream.disconnect();
        assert!(!emitter.step_status("x", "nobody listening"));
        assert!(emitter.is_closed());
        assert!(!emitter.token_delta("still fine"));
    }

    #[test]
    fn test_detached_emitter_accepts_events() {
        let emitter = EventEmitter::detached("t");
        assert!(emitter.token_delta("a"));
        assert!(!emitter.token_delta("a"));
    }
}
