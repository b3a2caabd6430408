//! Turn routing
//!
//! One turn walks an explicit graph:
//!
//! START -> (SUMMARIZE) -> HOTPATH -> CONTEXT-HYDRATE -> SUPERVISOR <-> SPECIALIST -> END
//!
//! SUMMARIZE runs only when the compactor's trigger fires. Every specialist
//! returns to SUPERVISOR, except that the capture specialist may end the turn
//! early to wait for the user's confirmation.

pub mod supervisor;

pub use supervisor::{Supervisor, SupervisorRun, SupervisorStep};

use crate::config::{OrchestratorConfig, StreamConfig};
use crate::error::{OrchestrationError, Result};
use crate::handoff::ControlReturn;
use crate::hydration::{ContextPatch, MemoryHydrator};
use crate::ingress::normalize_message;
use crate::memory::{Compactor, ModelSummarizer};
use crate::model::SharedModel;
use crate::models::{CompactionReason, ConfirmationRequest, DelegationTask, RetrievedSource, Role, TurnMessage};
use crate::session::{Clock, ThreadRegistry, ThreadState};
use crate::specialist::worker::APOLOGY_MESSAGE;
use crate::specialist::{RunConfig, SpecialistDirectory, SpecialistOutput, ToolLoopFactory};
use crate::stream::{channel, EventEmitter, EventKind, EventSink, EventStream};
use crate::tools::ToolRegistry;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const SUPERVISOR_INSTRUCTIONS: &str = "You are a personal finance assistant. Answer directly when you can; \
     transfer to a specialist when the request needs account data, goal changes or research. \
     Transfer to one specialist at a time.";

/// One inbound user turn, still in its wire shape. It is normalized at START.
#[derive(Debug, Clone)]
pub struct TurnInput {
    pub user_id: Option<String>,
    pub raw: Value,
}

impl TurnInput {
    pub fn new(user_id: Option<String>, text: impl Into<String>) -> Self {
        Self::from_json(user_id, json!({ "role": "user", "content": text.into() }))
    }

    pub fn from_json(user_id: Option<String>, raw: Value) -> Self {
        Self { user_id, raw }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed {
        answer: String,
        sources: Vec<RetrievedSource>,
    },
    AwaitingConfirmation(ConfirmationRequest),
}

#[derive(Debug, Clone)]
pub struct TurnReport {
    pub outcome: TurnOutcome,
    pub compaction: Option<CompactionReason>,
    pub handoffs: u32,
    pub peak_prompt_tokens: u64,
}

/// Graph nodes
#[derive(Debug)]
enum Node {
    Start,
    Summarize(CompactionReason),
    Hotpath,
    ContextHydrate,
    Supervisor,
    Specialist(DelegationTask),
    End(TurnOutcome),
}

pub struct TurnRouter {
    compactor: Compactor,
    hydrator: Arc<dyn MemoryHydrator>,
    supervisor: Supervisor,
    directory: Arc<SpecialistDirectory>,
    max_handoffs: u32,
}

impl TurnRouter {
    pub fn new(
        compactor: Compactor,
        hydrator: Arc<dyn MemoryHydrator>,
        supervisor: Supervisor,
        directory: Arc<SpecialistDirectory>,
        max_handoffs: u32,
    ) -> Self {
        Self {
            compactor,
            hydrator,
            supervisor,
            directory,
            max_handoffs,
        }
    }

    /// Router with the standard specialists: accounts, goals (capture) and
    /// education, all backed by one model.
    pub fn from_config(
        config: &OrchestratorConfig,
        model: SharedModel,
        tools: ToolRegistry,
        hydrator: Arc<dyn MemoryHydrator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let ceiling = config.tool_loop.specialist_ceiling;
        let directory = SpecialistDirectory::new(config.cache.specialist_ttl, clock)
            .with(Arc::new(ToolLoopFactory::new(
                "accounts",
                "Balances, transactions and spending analysis",
                "Answer questions about the user's accounts and spending using account_query.",
                model.clone(),
                tools.subset(&["account_query"]),
                ceiling,
            )))
            .with(Arc::new(
                ToolLoopFactory::new(
                    "goals",
                    "Creates and updates savings goals, always after user confirmation",
                    "Help the user define savings goals. Ask for confirmation before saving anything.",
                    model.clone(),
                    tools.subset(&["account_query"]),
                    ceiling,
                )
                .with_confirmation(),
            ))
            .with(Arc::new(ToolLoopFactory::new(
                "education",
                "Explains personal finance concepts with cited sources",
                "Explain financial concepts. Search the knowledge base before answering.",
                model.clone(),
                tools.subset(&["knowledge_search"]),
                ceiling,
            )));

        let compactor = Compactor::new(
            config.compaction.clone(),
            Arc::new(ModelSummarizer::new(model.clone())),
        );
        let supervisor = Supervisor::new(
            model,
            ToolRegistry::new(),
            SUPERVISOR_INSTRUCTIONS,
            config.tool_loop.supervisor_ceiling,
        );

        Self::new(
            compactor,
            hydrator,
            supervisor,
            Arc::new(directory),
            config.tool_loop.max_handoffs_per_turn,
        )
    }

    pub fn directory(&self) -> Arc<SpecialistDirectory> {
        self.directory.clone()
    }

    /// Run one turn against exclusively held thread state. Only compaction
    /// (and model failures of the supervisor itself) fail the turn.
    pub async fn run_turn(
        &self,
        state: &mut ThreadState,
        input: TurnInput,
        emitter: &EventEmitter,
    ) -> Result<TurnReport> {
        match self.route(state, input, emitter).await {
            Ok(report) => {
                let payload = match &report.outcome {
                    TurnOutcome::Completed { answer, sources } => json!({
                        "status": "completed",
                        "answer": answer,
                        "sources": sources,
                    }),
                    TurnOutcome::AwaitingConfirmation(_) => json!({ "status": "awaiting_confirmation" }),
                };
                emitter.emit(EventKind::TurnCompleted, payload);
                Ok(report)
            }
            Err(e) => {
                error!(thread_id = %state.thread_id(), error = %e, "Turn failed");
                emitter.emit(EventKind::TurnFailed, json!({ "error": e.to_string() }));
                Err(e)
            }
        }
    }

    async fn route(
        &self,
        state: &mut ThreadState,
        input: TurnInput,
        emitter: &EventEmitter,
    ) -> Result<TurnReport> {
        let TurnInput { user_id, raw } = input;
        let thread_id = state.thread_id().to_string();

        let message = normalize_message(&raw, &thread_id, state.context.ingress_count)?;
        if message.role != Role::User {
            return Err(OrchestrationError::InvalidMessage(format!(
                "a turn must start with a user message, got {}",
                message.role
            )));
        }
        state.context.ingress_count += 1;
        let reply_text = message.text();

        let mut supervisor = self.supervisor.start(&self.directory, self.max_handoffs);
        let mut compaction = None;
        let mut sources: Vec<RetrievedSource> = Vec::new();
        let mut specialist_peak = 0u64;
        let mut message = Some(message);
        let mut resumed: Option<ConfirmationRequest> = None;
        let mut node = Node::Start;

        let outcome = loop {
            node = match node {
                Node::Start => {
                    if user_id.is_some() {
                        state.context.user_id = user_id.clone();
                    }
                    if let Some(pending) = state.context.pending_confirmation.take() {
                        info!(thread_id = %thread_id, specialist = %pending.specialist, "Resuming after confirmation request");
                        state.history.push(confirmation_notice(&pending)?);
                        resumed = Some(pending);
                    }

                    if let Some(message) = message.take() {
                        emitter.turn_started(&message.text());
                        state.history.push(message);
                    }

                    match self.compactor.reason(state.history.messages(), &state.context) {
                        Some(reason) => Node::Summarize(reason),
                        None => Node::Hotpath,
                    }
                }
                Node::Summarize(reason) => {
                    info!(thread_id = %thread_id, reason = ?reason, "Compaction triggered");
                    emitter.emit(EventKind::SummarizationTriggered, json!({ "reason": reason }));

                    let result = self
                        .compactor
                        .compact(state.history.messages(), &state.context)
                        .await?;
                    state.history.apply(result.ops);
                    state.context = result.context;
                    state.context.last_compaction_reason = Some(reason);
                    compaction = Some(reason);
                    Node::Hotpath
                }
                Node::Hotpath => {
                    let patch = self.hydrator.hotpath(&state.history, &state.context).await;
                    apply_hydration("hotpath", patch, state);
                    Node::ContextHydrate
                }
                Node::ContextHydrate => {
                    let patch = self.hydrator.context_hydrate(&state.history, &state.context).await;
                    apply_hydration("context_hydrate", patch, state);
                    Node::Supervisor
                }
                Node::Supervisor => match supervisor.advance(&mut state.history, emitter).await? {
                    SupervisorStep::Delegate(task) => Node::Specialist(task),
                    SupervisorStep::Answer { text, .. } => Node::End(TurnOutcome::Completed {
                        answer: text,
                        sources: sources.clone(),
                    }),
                },
                Node::Specialist(mut task) => {
                    let destination = task.destination.clone();
                    if resumed.as_ref().is_some_and(|p| p.specialist == destination) {
                        if let Some(pending) = resumed.take() {
                            task.guidelines.push(confirmation_guideline(&pending, &reply_text)?);
                        }
                    }
                    let delegation = task.into_message();
                    state.history.push(delegation.clone());
                    emitter.step_status(&destination, "Delegated");

                    let owner = state.context.user_id.clone();
                    let run = RunConfig {
                        thread_id: &thread_id,
                        user_id: owner.as_deref(),
                        emitter,
                    };
                    let output = match self
                        .directory
                        .resolve(&destination, owner.as_deref().unwrap_or_default())
                        .await
                    {
                        Ok(specialist) => specialist.invoke(delegation, &run).await,
                        Err(e) => {
                            warn!(specialist = %destination, error = %e, "Could not build specialist");
                            SpecialistOutput::reply(&destination, APOLOGY_MESSAGE)
                        }
                    };

                    specialist_peak = specialist_peak.max(output.peak_prompt_tokens);
                    if !output.sources.is_empty() {
                        emitter.emit(
                            EventKind::Sources,
                            json!({ "specialist": destination, "sources": output.sources }),
                        );
                        for source in output.sources {
                            if !sources.iter().any(|s| s.url == source.url) {
                                sources.push(source);
                            }
                        }
                    }
                    state.history.extend(output.messages);

                    match output.control {
                        ControlReturn::Coordinator(_) => Node::Supervisor,
                        ControlReturn::AwaitConfirmation(request) => {
                            emitter.emit(
                                EventKind::AwaitingConfirmation,
                                json!({
                                    "specialist": request.specialist,
                                    "prompt": request.prompt,
                                    "payload": request.payload,
                                }),
                            );
                            state.context.pending_confirmation = Some(request.clone());
                            Node::End(TurnOutcome::AwaitingConfirmation(request))
                        }
                    }
                }
                Node::End(outcome) => break outcome,
            };
        };

        let peak_prompt_tokens = supervisor.peak_prompt_tokens().max(specialist_peak);
        state.context.last_peak_prompt_tokens = peak_prompt_tokens;

        info!(
            thread_id = %thread_id,
            handoffs = supervisor.handoffs(),
            peak_prompt_tokens,
            "Turn finished"
        );

        Ok(TurnReport {
            outcome,
            compaction,
            handoffs: supervisor.handoffs(),
            peak_prompt_tokens,
        })
    }
}

/// Tells the coordinator which request the user is answering
fn confirmation_notice(pending: &ConfirmationRequest) -> Result<TurnMessage> {
    Ok(TurnMessage::system(format!(
        "The {} specialist asked the user to confirm: \"{}\". Proposed action: {}. The user's reply follows.",
        pending.specialist,
        pending.prompt,
        serde_json::to_string(&pending.payload)?
    )))
}

/// Hands the confirmed request back to the specialist that asked for it
fn confirmation_guideline(pending: &ConfirmationRequest, reply: &str) -> Result<String> {
    Ok(format!(
        "You previously asked the user \"{}\" for this action: {}. The user replied: \"{}\". \
         If they agreed, carry it out without asking again.",
        pending.prompt,
        serde_json::to_string(&pending.payload)?,
        reply
    ))
}

/// Hydration is best-effort: failures are logged and skipped
fn apply_hydration(stage: &str, patch: Result<ContextPatch>, state: &mut ThreadState) {
    match patch {
        Ok(patch) if patch.is_empty() => {}
        Ok(patch) => patch.apply(&mut state.history, &mut state.context),
        Err(e) => warn!(thread_id = %state.thread_id(), stage, error = %e, "Hydration failed, continuing without it"),
    }
}

/// Run a turn on its own task. Events stream through the returned receiver;
/// the channel closes when the turn is done.
pub fn spawn_turn(
    router: Arc<TurnRouter>,
    threads: Arc<ThreadRegistry>,
    thread_id: impl Into<String>,
    input: TurnInput,
    stream: &StreamConfig,
) -> (EventStream, JoinHandle<Result<TurnReport>>) {
    let thread_id = thread_id.into();
    let (emitter, events) = channel(thread_id.clone(), stream.channel_capacity, stream.idle_timeout);

    let handle = tokio::spawn(async move {
        let mut state = match threads.checkout(&thread_id).await {
            Ok(state) => state,
            Err(e) => {
                emitter.emit(EventKind::TurnFailed, json!({ "error": e.to_string() }));
                return Err(e);
            }
        };

        let report = router.run_turn(&mut state, input, &emitter).await?;
        threads.persist(&state).await?;
        Ok(report)
    });

    (events, handle)
}
