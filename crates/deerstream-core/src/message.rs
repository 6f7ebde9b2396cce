//! Conversation message aggregate.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::{Agent, EventEnvelope, FinishReason, InterruptOption, Role};

/// Reference material attached to a user turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub uri: String,
    pub title: String,
}

/// Tool call as reassembled on the client.
///
/// Until the owning message finishes, either `args` holds the arguments
/// delivered whole or `args_chunks` collects raw fragments.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolCallRuntime {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args_chunks: Vec<String>,
    /// Receives chunks that arrive without an id.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<Agent>,
    pub role: Role,
    pub is_streaming: bool,
    pub content: String,
    #[serde(default)]
    pub content_chunks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRuntime>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<InterruptOption>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt_feedback: Option<String>,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

impl Message {
    /// A completed user turn.
    pub fn user(
        id: impl Into<String>,
        thread_id: impl Into<String>,
        text: &str,
        resources: Vec<Resource>,
    ) -> Self {
        Self {
            id: id.into(),
            thread_id: thread_id.into(),
            role: Role::User,
            content: text.to_string(),
            content_chunks: vec![text.to_string()],
            resources,
            ..Self::default()
        }
    }

    /// An empty streaming message seeded from an event's envelope.
    pub fn from_envelope(envelope: &EventEnvelope, interrupt_feedback: Option<String>) -> Self {
        Self {
            id: envelope.id.clone(),
            thread_id: envelope.thread_id.clone(),
            agent: envelope.agent,
            role: envelope.role,
            is_streaming: true,
            interrupt_feedback,
            ..Self::default()
        }
    }

    pub fn tool_call(&self, tool_call_id: &str) -> Option<&ToolCallRuntime> {
        self.tool_calls
            .as_deref()
            .and_then(|calls| calls.iter().find(|call| call.id == tool_call_id))
    }

    pub fn has_tool_call(&self, tool_call_id: &str) -> bool {
        self.tool_call(tool_call_id).is_some()
    }
}

/// Parses a JSON object out of model output, tolerating surrounding code fences.
pub fn parse_fenced_json(content: &str) -> Option<Value> {
    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    let body = body.strip_suffix("```").unwrap_or(body).trim();

    serde_json::from_str(body).ok()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_user_message_is_complete() {
        let message = Message::user("u1", "thread", "hello", Vec::new());

        assert_eq!(message.role, Role::User);
        assert!(!message.is_streaming);
        assert_eq!(message.content, "hello");
        assert_eq!(message.content_chunks, vec!["hello".to_string()]);
        assert_eq!(message.agent, None);
    }

    #[test]
    fn test_from_envelope_starts_streaming() {
        let envelope = EventEnvelope {
            id: "run-1".to_string(),
            thread_id: "t".to_string(),
            agent: Some(Agent::Planner),
            role: Role::Assistant,
            finish_reason: Some(FinishReason::Stop),
        };
        let message = Message::from_envelope(&envelope, Some("accepted".to_string()));

        assert!(message.is_streaming);
        assert!(message.content.is_empty());
        assert_eq!(message.agent, Some(Agent::Planner));
        assert_eq!(message.finish_reason, None);
        assert_eq!(message.interrupt_feedback.as_deref(), Some("accepted"));
    }

    #[test]
    fn test_parse_fenced_json() {
        assert_eq!(
            parse_fenced_json("```json\n{\"title\": \"Towers\"}\n```"),
            Some(json!({"title": "Towers"}))
        );
        assert_eq!(
            parse_fenced_json("{\"title\": \"Plain\"}"),
            Some(json!({"title": "Plain"}))
        );
        assert_eq!(parse_fenced_json("```json\n{\"title\": \"Tow"), None);
    }
}
