//! Finance Turn Router
//!
//! Orchestration core for a conversational financial assistant:
//! - Compacts long conversations into a running summary plus a recent tail
//! - Routes each turn through a coordinator that delegates to specialists
//! - Bounds every specialist's tool loop with a budget
//! - Surfaces only the retrieved sources an answer actually used
//! - Streams ordered, duplicate-free progress and answer events
//!
//! TURN GRAPH:
//! START → (SUMMARIZE) → HOTPATH → CONTEXT-HYDRATE → SUPERVISOR ⇄ SPECIALIST → END

pub mod attribution;
pub mod config;
pub mod error;
pub mod gemini;
pub mod handoff;
pub mod hydration;
pub mod ingress;
pub mod memory;
pub mod model;
pub mod models;
pub mod router;
pub mod session;
pub mod specialist;
pub mod stream;
pub mod tools;

pub use error::Result;

// Re-export common types
pub use config::OrchestratorConfig;
pub use models::*;
pub use router::{spawn_turn, TurnInput, TurnOutcome, TurnReport, TurnRouter};
