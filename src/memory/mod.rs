//! Conversation memory
//!
//! History storage, token estimation and compaction of long conversations
//! into a running summary plus a verbatim recent tail.

pub mod compactor;
pub mod estimator;
pub mod store;
pub mod summarizer;

pub use compactor::{compaction_reason, should_compact, summary_message, CompactionResult, Compactor};
pub use store::{ConversationHistory, HistoryOp};
pub use summarizer::{ModelSummarizer, Summarizer};
