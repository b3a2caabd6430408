//! Streaming of turn progress and answer text

pub mod emitter;
pub mod events;

pub use emitter::{channel, EventEmitter, EventSink, EventStream, Received};
pub use events::{EventKind, StreamEvent};
