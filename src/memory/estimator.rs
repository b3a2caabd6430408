//! Token estimation
//!
//! Character-length heuristic: one token per four characters, rounded up,
//! never less than one per message.

use crate::models::TurnMessage;

const CHARS_PER_TOKEN: usize = 4;

pub fn estimate_text_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    chars.div_ceil(CHARS_PER_TOKEN).max(1)
}

pub fn estimate_message_tokens(message: &TurnMessage) -> usize {
    estimate_text_tokens(&message.text())
}

/// Sum of per-message estimates
pub fn estimate_messages_tokens<'a>(messages: impl IntoIterator<Item = &'a TurnMessage>) -> usize {
    messages.into_iter().map(estimate_message_tokens).sum()
}
