//! Bounded tool-call loop
//!
//! `ToolLoop` is the policy: it owns the budget counter and decides what a
//! model response turns into. `ToolLoopRun` drives it through
//! `AwaitModel -> AwaitTools -> AwaitModel ... -> Done` for one specialist
//! invocation. The coordinator reuses the same policy with its own driver.

use crate::attribution::SourceAccumulator;
use crate::model::{ModelClient, ModelRequest, ModelResponse, ToolSpec};
use crate::models::{ConfirmationRequest, RetrievedSource, ToolCall, ToolInput, TurnMessage};
use crate::stream::EventEmitter;
use crate::tools::ToolRegistry;
use crate::Result;
use tracing::{debug, info, warn};

/// Answer used when the budget runs out
pub const FORCED_COMPLETION_MESSAGE: &str =
    "I've gathered as much as I can for this request. Here is what I found so far; ask me to dig further if you need more.";

pub const UNABLE_TO_FIND_MESSAGE: &str =
    "I wasn't able to find that information with the tools available to me.";

pub const SEARCH_FIRST_INSTRUCTION: &str =
    "Do not answer from reasoning alone. Use the available tools to look up the information first, then answer.";

/// Where the loop is
#[derive(Debug, Clone, PartialEq)]
pub enum LoopState {
    AwaitModel,
    AwaitTools(Vec<ToolCall>),
    Done(String),
}

/// What the policy makes of one model response
#[derive(Debug, Clone, PartialEq)]
pub enum LoopDecision {
    /// Dispatch exactly these calls; the budget is already charged
    ExecuteTools(Vec<ToolCall>),
    Finish { answer: String, forced: bool },
    /// Re-prompt the model with an extra instruction
    Retry(String),
}

#[derive(Debug, Clone)]
pub struct ToolLoop {
    ceiling: u32,
    tool_call_count: u32,
    has_tool_results: bool,
    search_nudged: bool,
}

impl ToolLoop {
    pub fn new(ceiling: u32) -> Self {
        Self {
            ceiling,
            tool_call_count: 0,
            has_tool_results: false,
            search_nudged: false,
        }
    }

    pub fn tool_call_count(&self) -> u32 {
        self.tool_call_count
    }

    pub fn remaining(&self) -> u32 {
        self.ceiling.saturating_sub(self.tool_call_count)
    }

    pub fn has_tool_results(&self) -> bool {
        self.has_tool_results
    }

    fn forced_answer(&self) -> String {
        FORCED_COMPLETION_MESSAGE.to_string()
    }

    /// Checked before every model call. `Some` means skip the model and
    /// finish with a forced-completion answer.
    pub fn on_enter(&self) -> Option<String> {
        if self.tool_call_count >= self.ceiling {
            info!(
                tool_calls = self.tool_call_count,
                ceiling = self.ceiling,
                "Tool budget exhausted, forcing completion"
            );
            return Some(self.forced_answer());
        }
        None
    }

    pub fn on_model_response(&mut self, response: &ModelResponse) -> LoopDecision {
        let text = response.visible_text();

        if response.has_tool_calls() {
            // Text next to a tool call is never an answer.
            if !text.trim().is_empty() {
                warn!("Discarded answer text emitted alongside a tool call");
            }

            let mut calls = response.tool_calls.clone();
            let remaining = self.remaining() as usize;

            if calls.len() > remaining {
                if self.has_tool_results || remaining == 0 {
                    info!(
                        requested = calls.len(),
                        remaining, "Tool request exceeds budget with results in hand, forcing completion"
                    );
                    return LoopDecision::Finish {
                        answer: self.forced_answer(),
                        forced: true,
                    };
                }
                debug!(
                    requested = calls.len(),
                    remaining, "Truncating tool request to remaining budget"
                );
                calls.truncate(remaining);
            }

            self.tool_call_count += calls.len() as u32;
            return LoopDecision::ExecuteTools(calls);
        }

        if !text.trim().is_empty() {
            return LoopDecision::Finish {
                answer: text.trim().to_string(),
                forced: false,
            };
        }

        if response.has_reasoning() && !self.has_tool_results && !self.search_nudged {
            self.search_nudged = true;
            debug!("Reasoning-only response before any tool result, asking to search first");
            return LoopDecision::Retry(SEARCH_FIRST_INSTRUCTION.to_string());
        }

        LoopDecision::Finish {
            answer: UNABLE_TO_FIND_MESSAGE.to_string(),
            forced: false,
        }
    }

    pub fn record_tool_result(&mut self) {
        self.has_tool_results = true;
    }
}

/// How a specialist's loop ended
#[derive(Debug, Clone, PartialEq)]
pub enum LoopOutcome {
    Answer { text: String, forced: bool },
    /// A confirmation tool was requested; the turn suspends
    AwaitConfirmation(ConfirmationRequest),
}

#[derive(Debug, Clone)]
pub struct LoopReport {
    pub outcome: LoopOutcome,
    pub sources: Vec<RetrievedSource>,
    pub tool_calls: u32,
    pub peak_prompt_tokens: u64,
}

/// One specialist invocation's loop
pub struct ToolLoopRun<'a> {
    pub agent_id: &'a str,
    pub model: &'a dyn ModelClient,
    pub tools: &'a ToolRegistry,
    pub system: Option<String>,
    pub ceiling: u32,
    pub confirmation_tool: Option<&'a ToolSpec>,
    pub emitter: &'a EventEmitter,
}

impl ToolLoopRun<'_> {
    fn request(&self, messages: &[TurnMessage]) -> ModelRequest {
        let mut tools = self.tools.specs();
        if let Some(spec) = self.confirmation_tool {
            tools.push(spec.clone());
        }
        ModelRequest {
            system: self.system.clone(),
            messages: messages.to_vec(),
            tools,
            max_tokens: None,
        }
    }

    fn is_confirmation(&self, call: &ToolCall) -> bool {
        self.confirmation_tool
            .map(|spec| spec.name == call.name)
            .unwrap_or(false)
    }

    /// Drive the loop over `messages`, the specialist's private working set
    pub async fn run(&self, messages: &mut Vec<TurnMessage>) -> Result<LoopReport> {
        let mut policy = ToolLoop::new(self.ceiling);
        let mut sources = SourceAccumulator::new();
        let mut peak_prompt_tokens = 0u64;
        let mut forced = false;
        let mut state = LoopState::AwaitModel;

        let outcome = loop {
            state = match state {
                LoopState::AwaitModel => {
                    if let Some(answer) = policy.on_enter() {
                        forced = true;
                        state = LoopState::Done(answer);
                        continue;
                    }

                    let response = self.model.complete(&self.request(messages)).await?;
                    peak_prompt_tokens = peak_prompt_tokens.max(response.usage.prompt_tokens);

                    match policy.on_model_response(&response) {
                        LoopDecision::ExecuteTools(calls) => {
                            messages.push(
                                TurnMessage::tool_request(calls.clone()).with_name(self.agent_id),
                            );
                            LoopState::AwaitTools(calls)
                        }
                        LoopDecision::Finish {
                            answer,
                            forced: substituted,
                        } => {
                            forced = substituted;
                            LoopState::Done(answer)
                        }
                        LoopDecision::Retry(instruction) => {
                            messages.push(TurnMessage::user(instruction));
                            LoopState::AwaitModel
                        }
                    }
                }
                LoopState::AwaitTools(calls) => {
                    if let Some(call) = calls.iter().find(|c| self.is_confirmation(c)) {
                        info!(agent = self.agent_id, "Suspending for end-user confirmation");
                        break LoopOutcome::AwaitConfirmation(ConfirmationRequest {
                            specialist: self.agent_id.to_string(),
                            tool_call_id: call.id.clone(),
                            prompt: call
                                .arguments
                                .get("prompt")
                                .and_then(|v| v.as_str())
                                .unwrap_or("Please confirm to continue.")
                                .to_string(),
                            payload: call.arguments.clone(),
                        });
                    }

                    for call in calls {
                        self.emitter.tool_started(self.agent_id, &call.name, &call.id);
                        let output = self.tools.execute(&ToolInput::from(&call)).await;
                        self.emitter
                            .tool_ended(self.agent_id, &call.name, &call.id, output.success);

                        if !output.success {
                            debug!(agent = self.agent_id, tool = %call.name, "Tool returned a failure");
                        }

                        sources.observe(&output);
                        messages.push(
                            TurnMessage::tool_result(call.id.clone(), output.observation_text())
                                .with_name(call.name.clone()),
                        );
                        policy.record_tool_result();
                    }
                    LoopState::AwaitModel
                }
                LoopState::Done(answer) => {
                    break LoopOutcome::Answer {
                        text: answer,
                        forced,
                    }
                }
            };
        };

        debug!(
            agent = self.agent_id,
            tool_calls = policy.tool_call_count(),
            "Tool loop finished"
        );

        Ok(LoopReport {
            outcome,
            sources: sources.sources().to_vec(),
            tool_calls: policy.tool_call_count(),
            peak_prompt_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ScriptedModel;
    use crate::tools::FixtureTool;
    use serde_json::json;
    use std::sync::Arc;

    fn search_call() -> ToolCall {
        ToolCall::new("knowledge_search", json!({"query": "roth ira"}))
    }

    fn calls(n: usize) -> Vec<ToolCall> {
        (0..n).map(|_| search_call()).collect()
    }

    fn registry() -> ToolRegistry {
        ToolRegistry::new().with(Arc::new(FixtureTool::new(
            "knowledge_search",
            json!([{
                "content": "Roth contributions are after-tax.",
                "source": "https://kb.example/roth",
                "metadata": {"title": "Roth basics"}
            }]),
        )))
    }

    #[test]
    fn test_budget_exhausted_on_entry_skips_model() {
        let mut policy = ToolLoop::new(2);
        assert!(policy.on_enter().is_none());
        assert!(matches!(
            policy.on_model_response(&ModelResponse::tool_calls(calls(2))),
            LoopDecision::ExecuteTools(c) if c.len() == 2
        ));
        assert_eq!(policy.on_enter(), Some(FORCED_COMPLETION_MESSAGE.to_string()));
    }

    #[test]
    fn test_truncates_when_no_results_yet() {
        let mut policy = ToolLoop::new(3);
        match policy.on_model_response(&ModelResponse::tool_calls(calls(5))) {
            LoopDecision::ExecuteTools(c) => assert_eq!(c.len(), 3),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(policy.tool_call_count(), 3);
    }

    #[test]
    fn test_forces_completion_when_results_exist() {
        let mut policy = ToolLoop::new(3);
        policy.on_model_response(&ModelResponse::tool_calls(calls(2)));
        policy.record_tool_result();
        policy.record_tool_result();

        let decision = policy.on_model_response(&ModelResponse::tool_calls(calls(2)));
        assert_eq!(
            decision,
            LoopDecision::Finish {
                answer: FORCED_COMPLETION_MESSAGE.to_string(),
                forced: true
            }
        );
        assert_eq!(policy.tool_call_count(), 2);
    }

    #[test]
    fn test_text_next_to_tool_call_never_becomes_the_answer() {
        let mut policy = ToolLoop::new(1);
        let response = ModelResponse::tool_calls(calls(1)).with_text("Your balance is $40");
        assert!(matches!(
            policy.on_model_response(&response),
            LoopDecision::ExecuteTools(_)
        ));
        assert_eq!(policy.on_enter(), Some(FORCED_COMPLETION_MESSAGE.to_string()));

        let mut policy = ToolLoop::new(3);
        policy.on_model_response(&ModelResponse::tool_calls(calls(1)).with_text("Probably $40"));
        assert_eq!(
            policy.on_model_response(&ModelResponse::reasoning("hmm")),
            LoopDecision::Retry(SEARCH_FIRST_INSTRUCTION.to_string())
        );
        assert_eq!(
            policy.on_model_response(&ModelResponse::reasoning("hmm")),
            LoopDecision::Finish {
                answer: UNABLE_TO_FIND_MESSAGE.to_string(),
                forced: false
            }
        );
    }

    #[test]
    fn test_reasoning_only_asks_to_search_once() {
        let mut policy = ToolLoop::new(3);
        let reasoning = ModelResponse::reasoning("I think the answer is 4%");
        assert_eq!(
            policy.on_model_response(&reasoning),
            LoopDecision::Retry(SEARCH_FIRST_INSTRUCTION.to_string())
        );
        assert_eq!(
            policy.on_model_response(&reasoning),
            LoopDecision::Finish {
                answer: UNABLE_TO_FIND_MESSAGE.to_string(),
                forced: false
            }
        );
    }

    #[test]
    fn test_reasoning_after_results_is_stripped() {
        let mut policy = ToolLoop::new(3);
        policy.on_model_response(&ModelResponse::tool_calls(calls(1)));
        policy.record_tool_result();

        let response = ModelResponse::reasoning("internal notes").with_text("Roth is after-tax.");
        assert_eq!(
            policy.on_model_response(&response),
            LoopDecision::Finish {
                answer: "Roth is after-tax.".to_string(),
                forced: false
            }
        );

        let mut policy = ToolLoop::new(3);
        policy.on_model_response(&ModelResponse::tool_calls(calls(1)));
        policy.record_tool_result();
        assert_eq!(
            policy.on_model_response(&ModelResponse::reasoning("only notes")),
            LoopDecision::Finish {
                answer: UNABLE_TO_FIND_MESSAGE.to_string(),
                forced: false
            }
        );
    }

    #[test]
    fn test_ceiling_never_exceeded_for_any_response_sequence() {
        for ceiling in 0..6u32 {
            for pattern in [vec![1, 1, 1, 1, 1, 1, 1], vec![4, 4, 4], vec![10], vec![2, 0, 3, 7]] {
                let mut policy = ToolLoop::new(ceiling);
                let mut dispatched = 0u32;
                for n in pattern {
                    if policy.on_enter().is_some() {
                        break;
                    }
                    let response = if n == 0 {
                        ModelResponse::reasoning("thinking")
                    } else {
                        ModelResponse::tool_calls(calls(n))
                    };
                    match policy.on_model_response(&response) {
                        LoopDecision::ExecuteTools(c) => {
                            dispatched += c.len() as u32;
                            policy.record_tool_result();
                        }
                        LoopDecision::Finish { .. } => break,
                        LoopDecision::Retry(_) => {}
                    }
                    assert!(dispatched <= ceiling);
                }
                assert!(dispatched <= ceiling, "ceiling {} dispatched {}", ceiling, dispatched);
                assert_eq!(dispatched, policy.tool_call_count());
            }
        }
    }

    #[tokio::test]
    async fn test_run_executes_tools_and_collects_sources() {
        let model = ScriptedModel::new()
            .then(ModelResponse::tool_calls(vec![search_call()]).with_usage(900, 10))
            .then(
                ModelResponse::text("Roth contributions are after-tax.")
                    .with_usage(1400, 20),
            );
        let tools = registry();
        let emitter = EventEmitter::detached("t");
        let run = ToolLoopRun {
            agent_id: "education",
            model: &model,
            tools: &tools,
            system: None,
            ceiling: 5,
            confirmation_tool: None,
            emitter: &emitter,
        };

        let mut messages = vec![TurnMessage::user("Explain Roth IRAs")];
        let report = run.run(&mut messages).await.unwrap();

        assert_eq!(
            report.outcome,
            LoopOutcome::Answer {
                text: "Roth contributions are after-tax.".to_string(),
                forced: false
            }
        );
        assert_eq!(report.tool_calls, 1);
        assert_eq!(report.peak_prompt_tokens, 1400);
        assert_eq!(report.sources.len(), 1);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2].name.as_deref(), Some("knowledge_search"));
    }

    #[tokio::test]
    async fn test_run_stops_at_ceiling_without_calling_model_again() {
        let model = ScriptedModel::new()
            .then(ModelResponse::tool_calls(calls(1)))
            .then(ModelResponse::tool_calls(calls(1)))
            .then(ModelResponse::text("never reached"));
        let tools = registry();
        let emitter = EventEmitter::detached("t");
        let run = ToolLoopRun {
            agent_id: "education",
            model: &model,
            tools: &tools,
            system: None,
            ceiling: 2,
            confirmation_tool: None,
            emitter: &emitter,
        };

        let mut messages = vec![TurnMessage::user("Explain Roth IRAs")];
        let report = run.run(&mut messages).await.unwrap();

        assert!(matches!(report.outcome, LoopOutcome::Answer { forced: true, .. }));
        assert_eq!(report.tool_calls, 2);
        assert_eq!(model.call_count().await, 2);
        assert_eq!(model.remaining().await, 1);
    }

    #[tokio::test]
    async fn test_run_suspends_on_confirmation_tool() {
        let confirm = ToolSpec {
            name: "request_confirmation".to_string(),
            description: "Ask the user to confirm".to_string(),
            parameters: json!({"type": "object"}),
        };
        let model = ScriptedModel::new().then(ModelResponse::tool_calls(vec![ToolCall::new(
            "request_confirmation",
            json!({"prompt": "Save goal 'Vacation' for $2,000?"}),
        )]));
        let tools = ToolRegistry::new();
        let emitter = EventEmitter::detached("t");
        let run = ToolLoopRun {
            agent_id: "capture",
            model: &model,
            tools: &tools,
            system: None,
            ceiling: 3,
            confirmation_tool: Some(&confirm),
            emitter: &emitter,
        };

        let mut messages = vec![TurnMessage::user("Save a vacation goal")];
        let report = run.run(&mut messages).await.unwrap();
        match report.outcome {
            LoopOutcome::AwaitConfirmation(request) => {
                assert_eq!(request.specialist, "capture");
                assert_eq!(request.prompt, "Save goal 'Vacation' for $2,000?");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
