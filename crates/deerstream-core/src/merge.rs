//! Merge reducer: folds one chat event into a message snapshot.
//!
//! Tool-call arguments may arrive whole (`tool_calls`) or as string fragments
//! (`tool_call_chunks`). A chunk that names a call id restarts that call's
//! fragment log and makes it the streaming call; chunks without an id extend
//! whichever call is currently streaming. Fragments are joined and parsed
//! once the message receives a finish reason.

use std::fmt;

use serde_json::Value;

use crate::events::{ChatEvent, FinishReason, ToolCall, ToolCallChunk};
use crate::message::{Message, ToolCallRuntime};

/// Failure to fold an event into a message.
#[derive(Debug)]
pub enum MergeError {
    /// Reassembled tool-call arguments are not valid JSON.
    InvalidToolArgs {
        tool_call_id: String,
        source: serde_json::Error,
    },
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeError::InvalidToolArgs {
                tool_call_id,
                source,
            } => write!(
                f,
                "Invalid arguments for tool call {tool_call_id}: {source}"
            ),
        }
    }
}

impl std::error::Error for MergeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MergeError::InvalidToolArgs { source, .. } => Some(source),
        }
    }
}

/// Returns a new snapshot of `message` with `event` applied.
///
/// # Errors
/// Returns [`MergeError::InvalidToolArgs`] when finalization finds malformed arguments.
pub fn merge(message: &Message, event: &ChatEvent) -> Result<Message, MergeError> {
    let mut next = message.clone();

    match event {
        ChatEvent::MessageChunk(chunk) => {
            if let Some(content) = chunk.content.as_deref() {
                append_content(&mut next, content);
            }
        }
        ChatEvent::ToolCalls(calls) => {
            if calls.tool_calls.first().is_some_and(|call| !call.name.is_empty()) {
                next.tool_calls = Some(calls.tool_calls.iter().map(runtime_call).collect());
            }
            apply_chunks(&mut next, &calls.tool_call_chunks);
        }
        ChatEvent::ToolCallChunks(chunks) => apply_chunks(&mut next, &chunks.tool_call_chunks),
        ChatEvent::ToolCallResult(result) => {
            if let Some(call) = next
                .tool_calls
                .as_mut()
                .and_then(|calls| calls.iter_mut().find(|c| c.id == result.tool_call_id))
            {
                call.result = result.content.clone();
            }
        }
        ChatEvent::Interrupt(interrupt) => {
            next.is_streaming = false;
            next.options = Some(interrupt.options.clone());
        }
    }

    if let Some(reason) = event.finish_reason() {
        finalize(&mut next, reason)?;
    }

    Ok(next)
}

fn append_content(message: &mut Message, content: &str) {
    if content.is_empty() {
        return;
    }
    message.content.push_str(content);
    message.content_chunks.push(content.to_string());
}

fn runtime_call(call: &ToolCall) -> ToolCallRuntime {
    ToolCallRuntime {
        id: call.id.clone(),
        name: call.name.clone(),
        args: Some(call.args.clone()),
        ..ToolCallRuntime::default()
    }
}

fn apply_chunks(message: &mut Message, chunks: &[ToolCallChunk]) {
    let calls = message.tool_calls.get_or_insert_with(Vec::new);

    for chunk in chunks {
        let fragment = chunk.args.clone().unwrap_or_default();

        if let Some(id) = chunk.target_id() {
            let Some(index) = calls.iter().position(|call| call.id == id) else {
                tracing::debug!(tool_call_id = id, "ignoring chunk for unknown tool call");
                continue;
            };
            for (i, call) in calls.iter_mut().enumerate() {
                call.streaming = i == index;
            }
            let call = &mut calls[index];
            call.args = None;
            call.args_chunks = vec![fragment];
        } else if let Some(call) = calls.iter_mut().find(|call| call.streaming) {
            call.args_chunks.push(fragment);
        } else {
            tracing::debug!("ignoring anonymous chunk with no streaming tool call");
        }
    }
}

fn finalize(message: &mut Message, reason: FinishReason) -> Result<(), MergeError> {
    message.finish_reason = Some(reason);
    message.is_streaming = false;

    let Some(calls) = message.tool_calls.as_mut() else {
        return Ok(());
    };
    for call in calls.iter_mut().filter(|call| !call.args_chunks.is_empty()) {
        let joined = call.args_chunks.concat();
        let args = if joined.trim().is_empty() {
            Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_str(&joined).map_err(|source| MergeError::InvalidToolArgs {
                tool_call_id: call.id.clone(),
                source,
            })?
        };
        call.args = Some(args);
        call.args_chunks.clear();
        call.streaming = false;
    }
    Ok(())
}
