//! Ephemeral per-thread and per-user state with TTL eviction

pub mod cache;
pub mod clock;
pub mod store;
pub mod threads;

pub use cache::{spawn_sweeper, SnapshotCache, TtlCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use store::{InMemorySessionStore, PgSessionStore, SessionStore};
pub use threads::{ThreadRegistry, ThreadSlots, ThreadState};
