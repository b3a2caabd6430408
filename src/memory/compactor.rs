//! History compaction
//!
//! Decides, once per turn, whether the conversation must be compacted, and
//! replaces everything older than a token-budgeted tail with a synopsis.

use crate::config::CompactionConfig;
use crate::handoff::DELEGATION_SENDER;
use crate::memory::estimator::estimate_messages_tokens;
use crate::memory::store::HistoryOp;
use crate::memory::summarizer::{render_transcript, Summarizer};
use crate::models::{CompactionReason, ContextMap, Role, RunningSummary, TurnMessage};
use crate::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Prefix of the system message that carries the synopsis
pub const SUMMARY_MESSAGE_PREFIX: &str = "Summary of the earlier conversation:";

/// User-authored dialogue, excluding injected context and delegation notes
fn is_countable_user_message(msg: &TurnMessage) -> bool {
    msg.role == Role::User
        && !msg.is_injected_context()
        && !msg.is_handoff_back()
        && msg.name.as_deref() != Some(DELEGATION_SENDER)
}

/// Messages that take part in compaction
fn is_dialogue(msg: &TurnMessage) -> bool {
    match msg.role {
        Role::User => is_countable_user_message(msg),
        Role::Assistant => {
            !msg.is_handoff_back()
                && !msg.has_tool_calls()
                && !msg.metadata.is_summary
                && !msg.is_injected_context()
        }
        Role::System | Role::Tool => false,
    }
}

/// The system message that stands in for a summarized prefix
pub fn summary_message(synopsis: &str) -> TurnMessage {
    let mut message = TurnMessage::system(format!("{}\n{}", SUMMARY_MESSAGE_PREFIX, synopsis));
    message.metadata.is_summary = true;
    message
}

/// Which trigger fires, if any. The token trigger is checked first.
pub fn compaction_reason(
    history: &[TurnMessage],
    context: &ContextMap,
    trigger_tokens: u64,
    fallback_user_count: usize,
) -> Option<CompactionReason> {
    if context.last_peak_prompt_tokens >= trigger_tokens {
        return Some(CompactionReason::TokenThreshold);
    }

    let user_messages = history
        .iter()
        .filter(|m| is_countable_user_message(m))
        .count();

    if user_messages >= fallback_user_count {
        return Some(CompactionReason::UserMessageFallback);
    }

    None
}

pub fn should_compact(
    history: &[TurnMessage],
    context: &ContextMap,
    trigger_tokens: u64,
    fallback_user_count: usize,
) -> bool {
    compaction_reason(history, context, trigger_tokens, fallback_user_count).is_some()
}

/// One user message and the assistant messages that follow it
#[derive(Debug, Clone)]
pub struct DialogueTurn<'a> {
    pub messages: Vec<&'a TurnMessage>,
}

impl DialogueTurn<'_> {
    pub fn estimated_tokens(&self) -> usize {
        estimate_messages_tokens(self.messages.iter().copied())
    }
}

/// Partition filtered dialogue into turns. Assistant messages before the
/// first user message form a leading turn of their own.
pub fn partition_turns<'a>(messages: &[&'a TurnMessage]) -> Vec<DialogueTurn<'a>> {
    let mut turns: Vec<DialogueTurn<'a>> = Vec::new();

    for msg in messages {
        let starts_turn = msg.role == Role::User || turns.is_empty();
        if starts_turn {
            turns.push(DialogueTurn {
                messages: vec![*msg],
            });
        } else if let Some(current) = turns.last_mut() {
            current.messages.push(*msg);
        }
    }

    turns
}

/// Index of the first tail turn. Walks newest to oldest and stops before
/// the turn that would push the tail over budget; the newest turn is always
/// kept.
pub fn tail_start(turns: &[DialogueTurn<'_>], tail_token_budget: usize) -> usize {
    let mut start = turns.len();
    let mut accumulated = 0usize;

    for (index, turn) in turns.iter().enumerate().rev() {
        let cost = turn.estimated_tokens();
        if start < turns.len() && accumulated + cost > tail_token_budget {
            break;
        }
        accumulated += cost;
        start = index;
    }

    start
}

/// Head/tail split of a history
#[derive(Debug)]
pub struct CompactionPlan<'a> {
    pub head: Vec<&'a TurnMessage>,
    pub tail: Vec<&'a TurnMessage>,
    pub head_turns: usize,
    pub tail_turns: usize,
}

pub fn plan_compaction(history: &[TurnMessage], tail_token_budget: usize) -> CompactionPlan<'_> {
    let dialogue: Vec<&TurnMessage> = history.iter().filter(|m| is_dialogue(m)).collect();
    let turns = partition_turns(&dialogue);
    let start = tail_start(&turns, tail_token_budget);

    let (head_turns, tail_turns) = turns.split_at(start);

    CompactionPlan {
        head: head_turns
            .iter()
            .flat_map(|t| t.messages.iter().copied())
            .collect(),
        tail: tail_turns
            .iter()
            .flat_map(|t| t.messages.iter().copied())
            .collect(),
        head_turns: head_turns.len(),
        tail_turns: tail_turns.len(),
    }
}

/// Result of a compaction operation. Empty `ops` means nothing changed.
#[derive(Debug, Clone)]
pub struct CompactionResult {
    pub ops: Vec<HistoryOp>,
    pub context: ContextMap,
    pub turns_compacted: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

impl CompactionResult {
    fn noop(context: &ContextMap) -> Self {
        Self {
            ops: Vec::new(),
            context: context.clone(),
            turns_compacted: 0,
            tokens_before: 0,
            tokens_after: 0,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Compacts conversations by summarizing older turns
pub struct Compactor {
    config: CompactionConfig,
    summarizer: Arc<dyn Summarizer>,
}

impl Compactor {
    pub fn new(config: CompactionConfig, summarizer: Arc<dyn Summarizer>) -> Self {
        Self { config, summarizer }
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    pub fn reason(&self, history: &[TurnMessage], context: &ContextMap) -> Option<CompactionReason> {
        compaction_reason(
            history,
            context,
            self.config.trigger_tokens,
            self.config.fallback_user_count,
        )
    }

    /// Summarize the head and keep the tail. Summarization errors propagate;
    /// a blank synopsis leaves the history untouched.
    pub async fn compact(
        &self,
        history: &[TurnMessage],
        context: &ContextMap,
    ) -> Result<CompactionResult> {
        let plan = plan_compaction(history, self.config.tail_token_budget);

        if plan.head.is_empty() {
            debug!(
                thread_id = %context.thread_id,
                tail_turns = plan.tail_turns,
                "Tail covers whole dialogue, nothing to compact"
            );
            return Ok(CompactionResult::noop(context));
        }

        let transcript = render_transcript(&plan.head);
        let previous = context.running_summary.as_ref().map(|s| s.summary.as_str());

        let synopsis = self
            .summarizer
            .summarize(&transcript, previous, self.config.max_summary_tokens)
            .await?;

        let synopsis = synopsis.trim();
        if synopsis.is_empty() {
            warn!(
                thread_id = %context.thread_id,
                "Summarizer returned an empty synopsis, leaving history untouched"
            );
            return Ok(CompactionResult::noop(context));
        }

        let synopsis_message = summary_message(synopsis);

        let tokens_before = estimate_messages_tokens(history.iter());
        let tokens_after = estimate_messages_tokens(
            std::iter::once(&synopsis_message).chain(plan.tail.iter().copied()),
        );

        let mut summarized_ids = context
            .running_summary
            .as_ref()
            .map(|s| s.summarized_message_ids.clone())
            .unwrap_or_default();
        summarized_ids.extend(plan.head.iter().map(|m| m.id.clone()));

        let mut new_context = context.clone();
        new_context.running_summary = Some(RunningSummary {
            summary: synopsis.to_string(),
            summarized_message_ids: summarized_ids,
            last_summarized_message_id: plan.head.last().map(|m| m.id.clone()),
        });
        new_context.last_peak_prompt_tokens = 0;

        let mut ops = Vec::with_capacity(plan.tail.len() + 2);
        ops.push(HistoryOp::ClearAll);
        ops.push(HistoryOp::Append(synopsis_message));
        ops.extend(plan.tail.iter().map(|m| HistoryOp::Append((*m).clone())));

        info!(
            thread_id = %context.thread_id,
            turns_compacted = plan.head_turns,
            turns_kept = plan.tail_turns,
            tokens_before,
            tokens_after,
            "Compacted conversation history"
        );

        Ok(CompactionResult {
            ops,
            context: new_context,
            turns_compacted: plan.head_turns,
            tokens_before,
            tokens_after,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::summarizer::ModelSummarizer;
    use crate::memory::ConversationHistory;
    use crate::model::{ModelResponse, ScriptedModel};
    use crate::models::INJECTED_CONTEXT_PREFIX;

    /// 20 characters -> 5 estimated tokens
    fn five_token_text(tag: usize) -> String {
        format!("{:0>20}", tag)
    }

    fn history_of_user_turns(count: usize) -> Vec<TurnMessage> {
        (0..count)
            .map(|i| TurnMessage::user(five_token_text(i)))
            .collect()
    }

    fn compactor_with(model: ScriptedModel, tail_token_budget: usize) -> (Compactor, Arc<ScriptedModel>) {
        let model = Arc::new(model);
        let config = CompactionConfig {
            tail_token_budget,
            ..CompactionConfig::default()
        };
        (
            Compactor::new(config, Arc::new(ModelSummarizer::new(model.clone()))),
            model,
        )
    }

    #[test]
    fn test_should_compact_truth_table() {
        let history = history_of_user_turns(3);
        let mut ctx = ContextMap::new("t");

        assert!(!should_compact(&history, &ctx, 100, 4));
        assert!(should_compact(&history, &ctx, 100, 3));

        ctx.last_peak_prompt_tokens = 100;
        assert!(should_compact(&history, &ctx, 100, 4));
        assert!(should_compact(&history, &ctx, 100, 3));

        ctx.last_peak_prompt_tokens = 99;
        assert!(!should_compact(&history, &ctx, 100, 4));
    }

    #[test]
    fn test_token_trigger_short_circuits() {
        let history = history_of_user_turns(30);
        let mut ctx = ContextMap::new("t");
        ctx.last_peak_prompt_tokens = 30_000;
        assert_eq!(
            compaction_reason(&history, &ctx, 25_000, 20),
            Some(CompactionReason::TokenThreshold)
        );
    }

    #[test]
    fn test_fallback_ignores_injected_and_delegation_messages() {
        let mut history = history_of_user_turns(2);
        history.push(TurnMessage::user(format!("{} profile", INJECTED_CONTEXT_PREFIX)));
        history.push(TurnMessage::user("do the thing").with_name(DELEGATION_SENDER));
        let ctx = ContextMap::new("t");

        assert!(!should_compact(&history, &ctx, 25_000, 3));
        assert!(should_compact(&history, &ctx, 25_000, 2));
    }

    #[test]
    fn test_fallback_path_with_twenty_five_user_messages() {
        let mut history = Vec::new();
        for i in 0..25 {
            history.push(TurnMessage::user(five_token_text(i)));
            history.push(TurnMessage::assistant(five_token_text(100 + i)));
        }
        let ctx = ContextMap::new("t");

        assert_eq!(
            compaction_reason(&history, &ctx, 25_000, 20),
            Some(CompactionReason::UserMessageFallback)
        );

        let plan = plan_compaction(&history, 40);
        let tail_tokens = estimate_messages_tokens(plan.tail.iter().copied());
        assert!(tail_tokens <= 40);
        assert_eq!(plan.tail_turns, 4);
        assert_eq!(plan.head_turns, 21);
    }

    #[test]
    fn test_tail_of_four_equal_turns() {
        let history = history_of_user_turns(4);
        let refs: Vec<&TurnMessage> = history.iter().collect();
        let turns = partition_turns(&refs);
        assert!(turns.iter().all(|t| t.estimated_tokens() == 5));

        assert_eq!(tail_start(&turns, 12), 2);
    }

    #[test]
    fn test_newest_turn_always_kept() {
        let history = vec![
            TurnMessage::user("short"),
            TurnMessage::user("x".repeat(400)),
        ];
        let plan = plan_compaction(&history, 10);
        assert_eq!(plan.tail_turns, 1);
        assert_eq!(plan.tail[0].id, history[1].id);
    }

    #[test]
    fn test_partition_groups_assistant_replies() {
        let history = vec![
            TurnMessage::assistant("welcome"),
            TurnMessage::user("q1"),
            TurnMessage::assistant("a1"),
            TurnMessage::assistant("a1 more"),
            TurnMessage::user("q2"),
        ];
        let refs: Vec<&TurnMessage> = history.iter().collect();
        let turns = partition_turns(&refs);
        let sizes: Vec<usize> = turns.iter().map(|t| t.messages.len()).collect();
        assert_eq!(sizes, vec![1, 3, 1]);
    }

    #[tokio::test]
    async fn test_noop_when_tail_covers_everything() {
        let (compactor, model) = compactor_with(ScriptedModel::new(), 10_000);
        let history = history_of_user_turns(4);
        let result = compactor.compact(&history, &ContextMap::new("t")).await.unwrap();

        assert!(result.is_noop());
        assert_eq!(model.call_count().await, 0);
    }

    #[tokio::test]
    async fn test_compaction_replaces_head_with_summary() {
        let (compactor, _model) =
            compactor_with(ScriptedModel::new().then(ModelResponse::text("User likes budgets.")), 12);

        let mut history = Vec::new();
        history.push(TurnMessage::system("[context] stale"));
        history.extend(history_of_user_turns(4));
        let mut handoff = TurnMessage::assistant("returning control");
        handoff.metadata.is_handoff_back = true;
        history.push(handoff);

        let mut ctx = ContextMap::new("t");
        ctx.last_peak_prompt_tokens = 40_000;
        let result = compactor.compact(&history, &ctx).await.unwrap();

        assert!(!result.is_noop());
        assert_eq!(result.ops[0], HistoryOp::ClearAll);
        assert_eq!(result.turns_compacted, 2);

        let mut rebuilt = ConversationHistory::from_messages("t", history.clone());
        rebuilt.apply(result.ops.clone());
        let messages = rebuilt.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[0].text().contains("User likes budgets."));
        assert_eq!(messages[1].id, history[3].id);
        assert_eq!(messages[2].id, history[4].id);

        let summary = result.context.running_summary.unwrap();
        assert_eq!(summary.summarized_message_ids.len(), 2);
        assert!(summary.summarized_message_ids.contains(&history[1].id));
        assert!(summary.summarized_message_ids.contains(&history[2].id));
        assert_eq!(summary.last_summarized_message_id, Some(history[2].id.clone()));
        assert_eq!(result.context.last_peak_prompt_tokens, 0);
    }

    #[tokio::test]
    async fn test_blank_synopsis_is_noop() {
        let (compactor, _model) =
            compactor_with(ScriptedModel::new().then(ModelResponse::text("  \n ")), 5);
        let history = history_of_user_turns(4);
        let result = compactor.compact(&history, &ContextMap::new("t")).await.unwrap();
        assert!(result.is_noop());
        assert!(result.context.running_summary.is_none());
    }

    #[tokio::test]
    async fn test_summarizer_failure_propagates() {
        let (compactor, _model) = compactor_with(ScriptedModel::new().then_fail("boom"), 5);
        let history = history_of_user_turns(4);
        assert!(compactor.compact(&history, &ContextMap::new("t")).await.is_err());
    }

    #[tokio::test]
    async fn test_recompaction_unions_summarized_ids() {
        let (compactor, model) =
            compactor_with(ScriptedModel::new().then(ModelResponse::text("merged")), 5);
        let history = history_of_user_turns(3);
        let mut ctx = ContextMap::new("t");
        ctx.running_summary = Some(RunningSummary {
            summary: "earlier facts".to_string(),
            summarized_message_ids: ["old-1".to_string()].into_iter().collect(),
            last_summarized_message_id: Some("old-1".to_string()),
        });

        let result = compactor.compact(&history, &ctx).await.unwrap();
        let summary = result.context.running_summary.unwrap();
        assert!(summary.summarized_message_ids.contains("old-1"));
        assert_eq!(summary.summarized_message_ids.len(), 3);
        assert!(model.requests().await[0].messages[0]
            .text()
            .contains("earlier facts"));
    }
}
