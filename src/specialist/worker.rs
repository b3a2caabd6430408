//! Tool-loop specialist
//!
//! The generic worker behind every financial sub-domain (accounts and
//! spending, goals, education). The capture variant also advertises a
//! confirmation tool and can suspend the turn instead of executing it.

use crate::attribution::{reconcile, USED_SOURCES_MARKER};
use crate::handoff::{delegated_task_text, ControlReturn};
use crate::model::{SharedModel, ToolSpec};
use crate::models::TurnMessage;
use crate::specialist::tool_loop::{LoopOutcome, ToolLoopRun};
use crate::specialist::{RunConfig, Specialist, SpecialistFactory, SpecialistOutput};
use crate::tools::ToolRegistry;
use crate::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const MISSING_IDENTITY_MESSAGE: &str =
    "I can't look this up because I couldn't identify whose accounts to use.";

pub const MISSING_TASK_MESSAGE: &str = "I didn't receive a task to work on.";

pub const APOLOGY_MESSAGE: &str =
    "Sorry, I ran into a problem while working on this and couldn't finish it.";

pub const CONFIRMATION_TOOL: &str = "request_confirmation";

/// Tool the capture specialist calls to ask the end user to confirm
pub fn confirmation_tool_spec() -> ToolSpec {
    ToolSpec {
        name: CONFIRMATION_TOOL.to_string(),
        description: "Ask the user to confirm before anything is saved. Pass the exact \
                      question as `prompt` and the record to save as `payload`."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "prompt": { "type": "string" },
                "payload": { "type": "object" }
            },
            "required": ["prompt"]
        }),
    }
}

pub struct ToolLoopSpecialist {
    id: String,
    system_prompt: String,
    model: SharedModel,
    tools: ToolRegistry,
    ceiling: u32,
    confirmation: Option<ToolSpec>,
}

impl ToolLoopSpecialist {
    fn finish(&self, outcome: LoopOutcome) -> SpecialistOutput {
        match outcome {
            LoopOutcome::Answer { text, forced } => {
                if forced {
                    info!(specialist = %self.id, "Answer produced by forced completion");
                }
                SpecialistOutput::reply(&self.id, text)
            }
            LoopOutcome::AwaitConfirmation(request) => {
                let mut output = SpecialistOutput::reply(&self.id, request.prompt.clone());
                output.control = ControlReturn::AwaitConfirmation(request);
                output
            }
        }
    }
}

#[async_trait]
impl Specialist for ToolLoopSpecialist {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(&self, delegation: TurnMessage, run: &RunConfig<'_>) -> SpecialistOutput {
        let id = self.id.as_str();

        if run.user_id.map(str::trim).filter(|u| !u.is_empty()).is_none() {
            warn!(specialist = id, thread_id = run.thread_id, "Delegation without a user identity");
            return SpecialistOutput::reply(id, MISSING_IDENTITY_MESSAGE);
        }

        let Some(task) = delegated_task_text(&delegation) else {
            warn!(specialist = id, thread_id = run.thread_id, "Delegation without task text");
            return SpecialistOutput::reply(id, MISSING_TASK_MESSAGE);
        };

        debug!(specialist = id, task = %task, "Specialist invoked");
        run.emitter.step_status(id, &format!("Working on: {}", task));

        let loop_run = ToolLoopRun {
            agent_id: id,
            model: self.model.as_ref(),
            tools: &self.tools,
            system: Some(self.system_prompt.clone()),
            ceiling: self.ceiling,
            confirmation_tool: self.confirmation.as_ref(),
            emitter: run.emitter,
        };

        let mut working = vec![delegation];
        let report = match loop_run.run(&mut working).await {
            Ok(report) => report,
            Err(e) => {
                warn!(specialist = id, error = %e, "Specialist failed, returning apology");
                return SpecialistOutput::reply(id, APOLOGY_MESSAGE);
            }
        };

        let (outcome, sources) = match report.outcome {
            LoopOutcome::Answer { text, forced } => {
                let attribution = reconcile(&text, &report.sources);
                (
                    LoopOutcome::Answer {
                        text: attribution.visible_text,
                        forced,
                    },
                    attribution.sources,
                )
            }
            suspended => (suspended, Vec::new()),
        };

        let mut output = self.finish(outcome);
        output.sources = sources;
        output.peak_prompt_tokens = report.peak_prompt_tokens;
        output
    }
}

/// Template from which per-user `ToolLoopSpecialist` handles are built
pub struct ToolLoopFactory {
    id: String,
    description: String,
    instructions: String,
    model: SharedModel,
    tools: ToolRegistry,
    ceiling: u32,
    confirmation: Option<ToolSpec>,
}

impl ToolLoopFactory {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        instructions: impl Into<String>,
        model: SharedModel,
        tools: ToolRegistry,
        ceiling: u32,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            instructions: instructions.into(),
            model,
            tools,
            ceiling,
            confirmation: None,
        }
    }

    /// Capture variant: may suspend the turn for end-user confirmation
    pub fn with_confirmation(mut self) -> Self {
        self.confirmation = Some(confirmation_tool_spec());
        self
    }

    fn system_prompt(&self, user_id: &str) -> String {
        format!(
            "{}\n\nYou are acting for user {}. When your answer relies on retrieved \
             sources, end it with `{}: [\"url\", ...]` listing only the urls you used.",
            self.instructions.trim(),
            user_id,
            USED_SOURCES_MARKER
        )
    }
}

#[async_trait]
impl SpecialistFactory for ToolLoopFactory {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn build(&self, user_id: &str) -> Result<Arc<dyn Specialist>> {
        Ok(Arc::new(ToolLoopSpecialist {
            id: self.id.clone(),
            system_prompt: self.system_prompt(user_id),
            model: self.model.clone(),
            tools: self.tools.clone(),
            ceiling: self.ceiling,
            confirmation: self.confirmation.clone(),
        }))
    }
}
