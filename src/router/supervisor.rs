//! Coordinator driver
//!
//! The supervisor sees the whole conversation, answers directly or transfers
//! to one specialist at a time. Its tool loop uses the same budget policy as
//! the specialists; transfer calls count against it. A transfer suspends the
//! run so the router can execute the specialist, then `advance` resumes.

use crate::handoff::{delegation_from_call, transfer_destination, transfer_tool_spec, SUPERVISOR_ID};
use crate::memory::ConversationHistory;
use crate::model::{ModelRequest, ModelResponse, SharedModel, ToolSpec};
use crate::models::{DelegationTask, ToolCall, ToolInput, TurnMessage};
use crate::specialist::worker::APOLOGY_MESSAGE;
use crate::specialist::{LoopDecision, SpecialistDirectory, ToolLoop};
use crate::stream::EventEmitter;
use crate::tools::ToolRegistry;
use crate::Result;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

pub struct Supervisor {
    model: SharedModel,
    tools: ToolRegistry,
    instructions: String,
    ceiling: u32,
}

/// What the router should do next
#[derive(Debug)]
pub enum SupervisorStep {
    Delegate(DelegationTask),
    Answer { text: String, forced: bool },
}

impl Supervisor {
    pub fn new(model: SharedModel, tools: ToolRegistry, instructions: impl Into<String>, ceiling: u32) -> Self {
        Self {
            model,
            tools,
            instructions: instructions.into(),
            ceiling,
        }
    }

    /// Fresh per-turn run
    pub fn start<'a>(&'a self, directory: &'a SpecialistDirectory, max_handoffs: u32) -> SupervisorRun<'a> {
        let mut tool_specs: Vec<ToolSpec> = directory
            .descriptions()
            .into_iter()
            .map(|(id, description)| transfer_tool_spec(id, description))
            .collect();
        tool_specs.extend(self.tools.specs());

        SupervisorRun {
            supervisor: self,
            directory,
            tool_specs,
            policy: ToolLoop::new(self.ceiling),
            pending: VecDeque::new(),
            scratch: Vec::new(),
            handoffs: 0,
            max_handoffs,
            peak_prompt_tokens: 0,
        }
    }

    fn system_prompt(&self, directory: &SpecialistDirectory) -> String {
        let mut prompt = self.instructions.trim().to_string();
        let specialists = directory.descriptions();
        if !specialists.is_empty() {
            prompt.push_str("\n\nSpecialists you can transfer to:");
            for (id, description) in specialists {
                prompt.push_str(&format!("\n- {}: {}", id, description));
            }
        }
        prompt
    }
}

/// Keep at most one transfer; extra transfers are dropped before budgeting
fn single_transfer(mut response: ModelResponse) -> ModelResponse {
    let mut seen_transfer = false;
    let before = response.tool_calls.len();
    response.tool_calls.retain(|call| {
        if transfer_destination(call).is_none() {
            return true;
        }
        if seen_transfer {
            return false;
        }
        seen_transfer = true;
        true
    });
    if response.tool_calls.len() < before {
        warn!(
            dropped = before - response.tool_calls.len(),
            "Supervisor requested several transfers at once, keeping the first"
        );
    }
    response
}

pub struct SupervisorRun<'a> {
    supervisor: &'a Supervisor,
    directory: &'a SpecialistDirectory,
    tool_specs: Vec<ToolSpec>,
    policy: ToolLoop,
    pending: VecDeque<ToolCall>,
    /// Loop-guard instructions sent to the model but kept out of history
    scratch: Vec<TurnMessage>,
    handoffs: u32,
    max_handoffs: u32,
    peak_prompt_tokens: u64,
}

impl SupervisorRun<'_> {
    pub fn handoffs(&self) -> u32 {
        self.handoffs
    }

    pub fn peak_prompt_tokens(&self) -> u64 {
        self.peak_prompt_tokens
    }

    pub fn tool_call_count(&self) -> u32 {
        self.policy.tool_call_count()
    }

    /// Run until the supervisor either transfers or answers
    pub async fn advance(
        &mut self,
        history: &mut ConversationHistory,
        emitter: &EventEmitter,
    ) -> Result<SupervisorStep> {
        loop {
            while let Some(call) = self.pending.pop_front() {
                if let Some(task) = self.dispatch(call, history, emitter).await {
                    return Ok(SupervisorStep::Delegate(task));
                }
            }

            if let Some(answer) = self.policy.on_enter() {
                return Ok(self.finish(answer, true, false, history, emitter));
            }

            emitter.step_status(SUPERVISOR_ID, "Thinking");

            let mut messages = history.messages().to_vec();
            messages.extend(self.scratch.iter().cloned());
            let request = ModelRequest {
                system: Some(self.supervisor.system_prompt(self.directory)),
                messages,
                tools: self.tool_specs.clone(),
                max_tokens: None,
            };

            let streamed = AtomicBool::new(false);
            let on_delta = |chunk: &str| {
                if emitter.token_delta(chunk) {
                    streamed.store(true, Ordering::Relaxed);
                }
            };
            // An upstream failure degrades to an apology; it never fails the turn.
            let response = match self.supervisor.model.stream(&request, &on_delta).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "Supervisor model call failed, answering with an apology");
                    return Ok(self.finish(APOLOGY_MESSAGE.to_string(), true, false, history, emitter));
                }
            };
            self.peak_prompt_tokens = self.peak_prompt_tokens.max(response.usage.prompt_tokens);

            match self.policy.on_model_response(&single_transfer(response)) {
                LoopDecision::ExecuteTools(calls) => {
                    debug!(tool_calls = calls.len(), "Supervisor requested tools");
                    history.push(TurnMessage::tool_request(calls.clone()).with_name(SUPERVISOR_ID));
                    self.pending.extend(calls);
                }
                LoopDecision::Finish { answer, forced } => {
                    let streamed = streamed.load(Ordering::Relaxed);
                    return Ok(self.finish(answer, forced, streamed, history, emitter));
                }
                LoopDecision::Retry(instruction) => {
                    self.scratch.push(TurnMessage::user(instruction));
                }
            }
        }
    }

    fn finish(
        &self,
        answer: String,
        forced: bool,
        streamed: bool,
        history: &mut ConversationHistory,
        emitter: &EventEmitter,
    ) -> SupervisorStep {
        if !streamed {
            emitter.token_delta(&answer);
        }
        history.push(TurnMessage::assistant(answer.clone()).with_name(SUPERVISOR_ID));
        info!(
            tool_calls = self.policy.tool_call_count(),
            handoffs = self.handoffs,
            forced,
            "Supervisor answered"
        );
        SupervisorStep::Answer { text: answer, forced }
    }

    /// Execute one budgeted call. Returns the delegation when it is an
    /// accepted transfer.
    async fn dispatch(
        &mut self,
        call: ToolCall,
        history: &mut ConversationHistory,
        emitter: &EventEmitter,
    ) -> Option<DelegationTask> {
        if let Some(task) = delegation_from_call(&call) {
            let refusal = if self.handoffs >= self.max_handoffs {
                warn!(handoffs = self.handoffs, "Handoff cap reached for this turn");
                Some("Handoff limit reached for this turn. Answer with the information you already have.".to_string())
            } else if !self.directory.contains(&task.destination) {
                warn!(destination = %task.destination, "Transfer to unknown specialist");
                Some(format!("There is no specialist named '{}'.", task.destination))
            } else {
                None
            };

            self.policy.record_tool_result();

            if let Some(refusal) = refusal {
                history.push(TurnMessage::tool_result(call.id, refusal).with_name(call.name));
                return None;
            }

            history.push(
                TurnMessage::tool_result(
                    call.id.clone(),
                    format!("Successfully transferred to {}", task.destination),
                )
                .with_name(call.name),
            );
            self.handoffs += 1;
            return Some(task);
        }

        emitter.tool_started(SUPERVISOR_ID, &call.name, &call.id);
        let output = self.supervisor.tools.execute(&ToolInput::from(&call)).await;
        emitter.tool_ended(SUPERVISOR_ID, &call.name, &call.id, output.success);
        self.policy.record_tool_result();
        history.push(TurnMessage::tool_result(call.id, output.observation_text()).with_name(call.name));
        None
    }
}
