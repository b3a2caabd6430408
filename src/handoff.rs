//! Handoff protocol between the coordinator and specialists
//!
//! A delegation is a single rendered instruction message: the specialist sees
//! nothing else of the conversation. Completion is an assistant notice plus a
//! matching tool acknowledgement, both flagged as handoff-back artifacts so
//! compaction skips them.

use crate::model::ToolSpec;
use crate::models::{ConfirmationRequest, DelegationTask, ToolCall, TurnMessage};
use serde_json::{json, Value};
use uuid::Uuid;

/// Synthetic sender name on delegation messages
pub const DELEGATION_SENDER: &str = "supervisor_delegation";
pub const SUPERVISOR_ID: &str = "supervisor";
pub const TRANSFER_TOOL_PREFIX: &str = "transfer_to_";
pub const TRANSFER_BACK_TOOL: &str = "transfer_back_to_supervisor";

/// Where control goes when a specialist finishes
#[derive(Debug, Clone, PartialEq)]
pub enum ControlReturn {
    Coordinator(String),
    /// Suspend the turn until the end user confirms
    AwaitConfirmation(ConfirmationRequest),
}

pub fn delegate(
    destination: impl Into<String>,
    task_description: impl Into<String>,
    guidelines: Vec<String>,
) -> DelegationTask {
    DelegationTask {
        task_id: Uuid::new_v4(),
        destination: destination.into(),
        task_description: task_description.into(),
        guidelines,
    }
}

impl DelegationTask {
    pub fn render(&self) -> String {
        let mut text = format!("Task: {}", self.task_description.trim());
        let guidelines: Vec<&str> = self
            .guidelines
            .iter()
            .map(|g| g.trim())
            .filter(|g| !g.is_empty())
            .collect();
        if !guidelines.is_empty() {
            text.push_str("\n\nGuidelines:");
            for guideline in guidelines {
                text.push_str("\n- ");
                text.push_str(guideline);
            }
        }
        text
    }

    /// Consume the task into the specialist's single working message
    pub fn into_message(self) -> TurnMessage {
        let mut message = TurnMessage::user(self.render()).with_name(DELEGATION_SENDER);
        message
            .metadata
            .extra
            .insert("destination".to_string(), json!(self.destination));
        message
            .metadata
            .extra
            .insert("task_id".to_string(), json!(self.task_id.to_string()));
        message
            .metadata
            .extra
            .insert("task_description".to_string(), json!(self.task_description));
        message
    }
}

/// Task text carried by a delegation message
pub fn delegated_task_text(message: &TurnMessage) -> Option<String> {
    message
        .metadata
        .extra
        .get("task_description")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[derive(Debug, Clone)]
pub struct HandoffCompletion {
    pub notice: TurnMessage,
    pub acknowledgement: TurnMessage,
    pub control: ControlReturn,
}

impl HandoffCompletion {
    pub fn into_messages(self) -> (Vec<TurnMessage>, ControlReturn) {
        (vec![self.notice, self.acknowledgement], self.control)
    }
}

pub fn complete_handoff(worker_id: &str, coordinator_id: &str) -> HandoffCompletion {
    let call = ToolCall {
        id: format!("call_{}", Uuid::new_v4().simple()),
        name: TRANSFER_BACK_TOOL.to_string(),
        arguments: json!({}),
    };

    let mut notice = TurnMessage::assistant(format!(
        "Work completed. Returning control to {}.",
        coordinator_id
    ))
    .with_name(worker_id);
    notice.tool_calls = vec![call.clone()];
    notice.metadata.is_handoff_back = true;

    let mut acknowledgement = TurnMessage::tool_result(
        call.id,
        format!("Successfully transferred back to {}", coordinator_id),
    )
    .with_name(TRANSFER_BACK_TOOL);
    acknowledgement.metadata.is_handoff_back = true;

    HandoffCompletion {
        notice,
        acknowledgement,
        control: ControlReturn::Coordinator(coordinator_id.to_string()),
    }
}

fn is_completion_pair(notice: &TurnMessage, ack: &TurnMessage) -> bool {
    notice.is_handoff_back()
        && ack.is_handoff_back()
        && notice
            .tool_calls
            .iter()
            .any(|c| c.name == TRANSFER_BACK_TOOL && ack.tool_call_id.as_deref() == Some(c.id.as_str()))
}

pub fn count_completion_pairs(messages: &[TurnMessage]) -> usize {
    messages
        .windows(2)
        .filter(|w| is_completion_pair(&w[0], &w[1]))
        .count()
}

pub fn ends_with_completion(messages: &[TurnMessage]) -> bool {
    match messages {
        [.., notice, ack] => is_completion_pair(notice, ack),
        _ => false,
    }
}

/// Transfer tool the coordinator uses to delegate to `specialist_id`
pub fn transfer_tool_spec(specialist_id: &str, description: &str) -> ToolSpec {
    ToolSpec {
        name: format!("{}{}", TRANSFER_TOOL_PREFIX, specialist_id),
        description: format!("Delegate to the {} specialist. {}", specialist_id, description),
        parameters: json!({
            "type": "object",
            "properties": {
                "task_description": { "type": "string" },
                "guidelines": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["task_description"]
        }),
    }
}

pub fn transfer_destination(call: &ToolCall) -> Option<&str> {
    call.name.strip_prefix(TRANSFER_TOOL_PREFIX)
}

/// Build the delegation for a transfer call; `None` if it is not a transfer
pub fn delegation_from_call(call: &ToolCall) -> Option<DelegationTask> {
    let destination = transfer_destination(call)?;
    let task = call
        .arguments
        .get("task_description")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let guidelines = call
        .arguments
        .get("guidelines")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Some(delegate(destination, task, guidelines))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    #[test]
    fn test_delegation_message_shape() {
        let task = delegate(
            "goals",
            "Create a savings goal for a $5,000 emergency fund",
            vec!["Confirm the target date".to_string(), " ".to_string()],
        );
        let message = task.into_message();

        assert_eq!(message.role, Role::User);
        assert_eq!(message.name.as_deref(), Some(DELEGATION_SENDER));
        assert_eq!(
            message.text(),
            "Task: Create a savings goal for a $5,000 emergency fund\n\nGuidelines:\n- Confirm the target date"
        );
        assert_eq!(message.metadata.extra["destination"], "goals");
        assert_eq!(
            delegated_task_text(&message).as_deref(),
            Some("Create a savings goal for a $5,000 emergency fund")
        );
    }

    #[test]
    fn test_completion_pair() {
        let completion = complete_handoff("accounts", SUPERVISOR_ID);
        assert_eq!(
            completion.control,
            ControlReturn::Coordinator(SUPERVISOR_ID.to_string())
        );

        let (messages, _) = completion.into_messages();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.is_handoff_back()));
        assert_eq!(messages[0].role, Role::Assistant);
        assert_eq!(messages[0].name.as_deref(), Some("accounts"));
        assert_eq!(messages[1].role, Role::Tool);
        assert_ne!(messages[0].id, messages[1].id);
        assert!(ends_with_completion(&messages));
        assert_eq!(count_completion_pairs(&messages), 1);
    }

    #[test]
    fn test_fresh_ids_per_completion() {
        let (a, _) = complete_handoff("accounts", SUPERVISOR_ID).into_messages();
        let (b, _) = complete_handoff("accounts", SUPERVISOR_ID).into_messages();
        assert_ne!(a[1].tool_call_id, b[1].tool_call_id);
        assert_ne!(a[1].id, b[1].id);
    }

    #[test]
    fn test_transfer_call_parsing() {
        let call = ToolCall::new(
            "transfer_to_education",
            json!({"task_description": "Explain APR", "guidelines": ["Keep it short"]}),
        );
        let task = delegation_from_call(&call).unwrap();
        assert_eq!(task.destination, "education");
        assert_eq!(task.guidelines, vec!["Keep it short".to_string()]);

        let other = ToolCall::new("knowledge_search", json!({}));
        assert!(delegation_from_call(&other).is_none());
        assert_eq!(
            transfer_tool_spec("education", "Explains concepts").name,
            "transfer_to_education"
        );
    }

    #[test]
    fn test_plain_messages_are_not_completion() {
        let messages = vec![TurnMessage::assistant("done"), TurnMessage::tool_result("x", "ok")];
        assert!(!ends_with_completion(&messages));
    }
}
