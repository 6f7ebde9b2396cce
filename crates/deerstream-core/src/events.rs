//! Chat event vocabulary shared by transports, the merge reducer and the store.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::transport::{TransportError, TransportResult};

/// Agent that produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Agent {
    Coordinator,
    Planner,
    Researcher,
    Coder,
    Reporter,
    Podcast,
    /// Any agent name this client does not know about
    #[serde(other)]
    Other,
}

impl Agent {
    /// Agents whose messages are grouped into a research session.
    pub fn is_research_member(self) -> bool {
        matches!(self, Agent::Researcher | Agent::Coder | Agent::Reporter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    #[default]
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Interrupt,
    /// Provider-specific reasons such as `length`
    #[serde(other)]
    Other,
}

/// Fields common to every event.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<Agent>,
    #[serde(default)]
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

/// A complete tool invocation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// A fragment of a tool invocation's arguments.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ToolCallChunk {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<String>,
}

impl ToolCallChunk {
    /// The chunk's target id; an empty id counts as absent.
    pub fn target_id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptOption {
    pub text: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageChunkEvent {
    #[serde(flatten)]
    pub envelope: EventEnvelope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallsEvent {
    #[serde(flatten)]
    pub envelope: EventEnvelope,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tool_call_chunks: Vec<ToolCallChunk>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallChunksEvent {
    #[serde(flatten)]
    pub envelope: EventEnvelope,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tool_call_chunks: Vec<ToolCallChunk>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallResultEvent {
    #[serde(flatten)]
    pub envelope: EventEnvelope,
    pub tool_call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptEvent {
    #[serde(flatten)]
    pub envelope: EventEnvelope,
    #[serde(default, deserialize_with = "null_as_default")]
    pub options: Vec<InterruptOption>,
}

/// One event of a chat turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ChatEvent {
    MessageChunk(MessageChunkEvent),
    ToolCalls(ToolCallsEvent),
    ToolCallChunks(ToolCallChunksEvent),
    ToolCallResult(ToolCallResultEvent),
    Interrupt(InterruptEvent),
}

impl ChatEvent {
    /// Decodes a frame's type and JSON payload into an event.
    ///
    /// # Errors
    /// Returns a decode error for unknown types, missing data or malformed JSON.
    pub fn from_frame(event_type: &str, data: Option<&str>) -> TransportResult<Self> {
        let data = data.filter(|d| !d.trim().is_empty()).ok_or_else(|| {
            TransportError::decode(format!("Missing data for {event_type}"))
        })?;

        let event = match event_type {
            "message_chunk" => ChatEvent::MessageChunk(decode(event_type, data)?),
            "tool_calls" => ChatEvent::ToolCalls(decode(event_type, data)?),
            "tool_call_chunks" => ChatEvent::ToolCallChunks(decode(event_type, data)?),
            "tool_call_result" => ChatEvent::ToolCallResult(decode(event_type, data)?),
            "interrupt" => ChatEvent::Interrupt(decode(event_type, data)?),
            other => {
                return Err(TransportError::decode(format!(
                    "Unknown event type: {other}"
                )));
            }
        };
        Ok(event)
    }

    /// Wire name of the event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            ChatEvent::MessageChunk(_) => "message_chunk",
            ChatEvent::ToolCalls(_) => "tool_calls",
            ChatEvent::ToolCallChunks(_) => "tool_call_chunks",
            ChatEvent::ToolCallResult(_) => "tool_call_result",
            ChatEvent::Interrupt(_) => "interrupt",
        }
    }

    pub fn envelope(&self) -> &EventEnvelope {
        match self {
            ChatEvent::MessageChunk(e) => &e.envelope,
            ChatEvent::ToolCalls(e) => &e.envelope,
            ChatEvent::ToolCallChunks(e) => &e.envelope,
            ChatEvent::ToolCallResult(e) => &e.envelope,
            ChatEvent::Interrupt(e) => &e.envelope,
        }
    }

    pub fn id(&self) -> &str {
        &self.envelope().id
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.envelope().finish_reason
    }
}

fn decode<T: serde::de::DeserializeOwned>(event_type: &str, data: &str) -> TransportResult<T> {
    serde_json::from_str(data).map_err(|err| {
        TransportError::decode(format!("Failed to parse {event_type}: {err}"))
            .with_details(data.to_string())
    })
}

/// Treats an explicit JSON `null` like a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
