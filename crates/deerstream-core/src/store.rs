//! Conversation store.
//!
//! Owns the ordered message log, drives one transport stream per turn and
//! keeps research sessions derived from the messages as they arrive.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{ChatSettings, Config, McpSettings};
use crate::events::{Agent, ChatEvent, FinishReason};
use crate::merge::{MergeError, merge};
use crate::message::{Message, ToolCallRuntime, parse_fenced_json};
use crate::research::{MessageMutation, ResearchChange, ResearchState};
use crate::transport::{
    ChatRequest, Transport, TransportError, TransportErrorKind, TurnOptions,
};

/// Default capacity for store event channels.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 128;

/// Notice shown when a turn fails.
pub const TURN_ERROR_NOTICE: &str =
    "An error occurred while generating the response. Please try again.";

/// Notice shown when a turn is cancelled.
pub const TURN_CANCELLED_NOTICE: &str = "The response was cancelled.";

/// Title used when a plan carries no readable title.
pub const UNTITLED_RESEARCH: &str = "Untitled";

/// Observable store changes.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    MessageAppended { id: String },
    MessageUpdated { message: Arc<Message> },
    RespondingChanged { responding: bool },
    ResearchStarted { research_id: String, plan_id: String },
    ResearchClosed { research_id: String },
    Notice { message: String },
}

impl From<ResearchChange> for StoreEvent {
    fn from(change: ResearchChange) -> Self {
        match change {
            ResearchChange::Started {
                research_id,
                plan_id,
            } => StoreEvent::ResearchStarted {
                research_id,
                plan_id,
            },
            ResearchChange::Closed { research_id } => StoreEvent::ResearchClosed { research_id },
        }
    }
}

pub type StoreEventTx = mpsc::Sender<Arc<StoreEvent>>;
pub type StoreEventRx = mpsc::Receiver<Arc<StoreEvent>>;

/// Creates a bounded channel for store events.
pub fn create_event_channel() -> (StoreEventTx, StoreEventRx) {
    mpsc::channel(DEFAULT_EVENT_CHANNEL_CAPACITY)
}

/// Event sender wrapper that provides best-effort and reliable send modes.
///
/// Message updates go through `send_delta()` and may be dropped when the
/// consumer lags; lifecycle events go through `send_important()`.
#[derive(Clone)]
pub struct EventSender {
    tx: StoreEventTx,
}

impl EventSender {
    pub fn new(tx: StoreEventTx) -> Self {
        Self { tx }
    }

    /// Best-effort send: never awaits, drops if channel is full.
    pub fn send_delta(&self, ev: StoreEvent) {
        let _ = self.tx.try_send(Arc::new(ev));
    }

    /// Reliable send: awaits delivery.
    pub async fn send_important(&self, ev: StoreEvent) {
        let _ = self.tx.send(Arc::new(ev)).await;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TurnState {
    #[default]
    Idle,
    Responding,
    Completed,
    Errored(String),
}

/// Why a turn ended early.
#[derive(Debug)]
pub enum TurnError {
    Transport(TransportError),
    Merge(MergeError),
}

impl TurnError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, TurnError::Transport(e) if e.kind == TransportErrorKind::Aborted)
    }
}

impl fmt::Display for TurnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnError::Transport(e) => write!(f, "{e}"),
            TurnError::Merge(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for TurnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TurnError::Transport(e) => Some(e),
            TurnError::Merge(e) => Some(e),
        }
    }
}

impl From<TransportError> for TurnError {
    fn from(e: TransportError) -> Self {
        TurnError::Transport(e)
    }
}

impl From<MergeError> for TurnError {
    fn from(e: MergeError) -> Self {
        TurnError::Merge(e)
    }
}

pub struct ConversationStore {
    thread_id: String,
    settings: ChatSettings,
    mcp_settings: Option<McpSettings>,
    transport: Transport,
    message_ids: Vec<String>,
    messages: HashMap<String, Arc<Message>>,
    research: ResearchState,
    responding: bool,
    turn_state: TurnState,
    events: Option<EventSender>,
    outbox: Vec<StoreEvent>,
}

impl ConversationStore {
    /// Creates an empty conversation with a fresh thread id.
    pub fn new(transport: Transport, settings: ChatSettings) -> Self {
        Self {
            thread_id: Uuid::new_v4().to_string(),
            settings,
            mcp_settings: None,
            transport,
            message_ids: Vec::new(),
            messages: HashMap::new(),
            research: ResearchState::new(),
            responding: false,
            turn_state: TurnState::Idle,
            events: None,
            outbox: Vec::new(),
        }
    }

    /// Builds the transport and request settings from config.
    ///
    /// # Errors
    /// Returns an error if the transport cannot be configured.
    pub fn from_config(config: &Config) -> Result<Self> {
        let transport = Transport::from_config(config)?;
        Ok(Self::new(transport, config.chat.clone()).with_mcp_settings(config.mcp.settings()))
    }

    #[must_use]
    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = thread_id.into();
        self
    }

    #[must_use]
    pub fn with_mcp_settings(mut self, mcp_settings: Option<McpSettings>) -> Self {
        self.mcp_settings = mcp_settings;
        self
    }

    #[must_use]
    pub fn with_event_sender(mut self, sender: EventSender) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Runs one turn to completion, error or cancellation.
    ///
    /// `text` becomes a user message when present; an interrupt answer is
    /// carried in `options.interrupt_feedback`.
    pub async fn submit_turn(
        &mut self,
        text: Option<&str>,
        options: TurnOptions,
        cancel: CancellationToken,
    ) -> TurnState {
        if let Some(text) = text {
            let message = Message::user(
                Uuid::new_v4().to_string(),
                self.thread_id.clone(),
                text,
                options.resources.clone(),
            );
            self.append_message(message);
        }

        let request = ChatRequest::new(
            &self.thread_id,
            text,
            &options,
            &self.settings,
            self.mcp_settings.clone(),
        );

        tracing::info!(
            thread_id = %self.thread_id,
            feedback = options.interrupt_feedback.as_deref().unwrap_or(""),
            "turn started"
        );
        self.set_responding(true).await;

        let mut in_flight = None;
        self.turn_state = match self.stream_turn(&request, cancel, &mut in_flight).await {
            Ok(()) => {
                tracing::info!(messages = self.message_ids.len(), "turn completed");
                TurnState::Completed
            }
            Err(err) => {
                self.fail_turn(&err, in_flight.as_deref()).await;
                TurnState::Errored(err.to_string())
            }
        };

        self.set_responding(false).await;
        self.turn_state.clone()
    }

    async fn stream_turn(
        &mut self,
        request: &ChatRequest,
        cancel: CancellationToken,
        in_flight: &mut Option<String>,
    ) -> Result<(), TurnError> {
        let mut events = self.transport.open(request, cancel).await?;

        while let Some(event) = events.next().await {
            let event = event?;
            tracing::debug!(
                event_type = event.event_type(),
                id = event.id(),
                "applying event"
            );
            *in_flight = Some(event.id().to_string());
            self.apply_event(&event, request.interrupt_feedback.as_deref())?;
            self.flush_outbox().await;
        }
        Ok(())
    }

    async fn fail_turn(&mut self, err: &TurnError, in_flight: Option<&str>) {
        self.flush_outbox().await;

        let notice = if err.is_aborted() {
            tracing::info!("turn cancelled");
            TURN_CANCELLED_NOTICE
        } else {
            tracing::warn!(error = %err, "turn failed");
            TURN_ERROR_NOTICE
        };
        self.emit_important(StoreEvent::Notice {
            message: notice.to_string(),
        })
        .await;

        let stopped = in_flight
            .and_then(|id| self.messages.get(id))
            .filter(|message| message.is_streaming)
            .map(|message| {
                let mut stopped = Message::clone(message);
                stopped.is_streaming = false;
                Arc::new(stopped)
            });
        if let Some(stopped) = stopped {
            self.messages
                .insert(stopped.id.clone(), Arc::clone(&stopped));
            self.emit_delta(StoreEvent::MessageUpdated { message: stopped });
        }

        if let Some(research_id) = self.research.abandon_ongoing() {
            self.emit_important(StoreEvent::ResearchClosed { research_id })
                .await;
        }
    }

    /// Folds one event into the conversation.
    ///
    /// Tool results go to the newest message owning the tool call; every other
    /// event targets the message with the event's id, created on first sight.
    ///
    /// # Errors
    /// Returns an error if the merge fails; the stored snapshot is left unchanged.
    pub fn apply_event(
        &mut self,
        event: &ChatEvent,
        interrupt_feedback: Option<&str>,
    ) -> Result<(), MergeError> {
        let target = if let ChatEvent::ToolCallResult(result) = event {
            self.find_message_by_tool_call_id(&result.tool_call_id)
                .or_else(|| self.messages.get(event.id()).cloned())
        } else {
            if !self.messages.contains_key(event.id()) {
                self.append_message(Message::from_envelope(
                    event.envelope(),
                    interrupt_feedback.map(str::to_string),
                ));
            }
            self.messages.get(event.id()).cloned()
        };

        let Some(target) = target else {
            tracing::debug!(id = event.id(), "no message owns this tool result; skipping");
            return Ok(());
        };

        let merged = merge(&target, event)?;
        self.update_message(merged);
        Ok(())
    }

    fn append_message(&mut self, message: Message) {
        let planner_id = self.latest_planner_id();
        let change = self
            .research
            .apply(MessageMutation::Created(&message), planner_id.as_deref());

        let id = message.id.clone();
        self.message_ids.push(id.clone());
        self.messages.insert(id.clone(), Arc::new(message));

        self.queue_research_change(change);
        self.emit_delta(StoreEvent::MessageAppended { id });
    }

    fn update_message(&mut self, message: Message) {
        let change = self.research.apply(MessageMutation::Updated(&message), None);

        let message = Arc::new(message);
        self.messages
            .insert(message.id.clone(), Arc::clone(&message));

        self.queue_research_change(change);
        self.emit_delta(StoreEvent::MessageUpdated { message });
    }

    fn latest_planner_id(&self) -> Option<String> {
        self.message_ids
            .iter()
            .rev()
            .find(|id| {
                self.messages
                    .get(id.as_str())
                    .is_some_and(|m| m.agent == Some(Agent::Planner))
            })
            .cloned()
    }

    fn find_message_by_tool_call_id(&self, tool_call_id: &str) -> Option<Arc<Message>> {
        self.message_ids
            .iter()
            .rev()
            .filter_map(|id| self.messages.get(id))
            .find(|message| message.has_tool_call(tool_call_id))
            .cloned()
    }

    async fn set_responding(&mut self, responding: bool) {
        self.responding = responding;
        if responding {
            self.turn_state = TurnState::Responding;
        }
        self.emit_important(StoreEvent::RespondingChanged { responding })
            .await;
    }

    fn queue_research_change(&mut self, change: Option<ResearchChange>) {
        if let Some(change) = change
            && self.events.is_some()
        {
            self.outbox.push(change.into());
        }
    }

    async fn flush_outbox(&mut self) {
        let pending = std::mem::take(&mut self.outbox);
        if let Some(events) = &self.events {
            for ev in pending {
                events.send_important(ev).await;
            }
        }
    }

    fn emit_delta(&self, ev: StoreEvent) {
        if let Some(events) = &self.events {
            events.send_delta(ev);
        }
    }

    async fn emit_important(&self, ev: StoreEvent) {
        if let Some(events) = &self.events {
            events.send_important(ev).await;
        }
    }

    pub fn message(&self, id: &str) -> Option<&Arc<Message>> {
        self.messages.get(id)
    }

    pub fn message_ids(&self) -> &[String] {
        &self.message_ids
    }

    /// Messages in arrival order.
    pub fn messages(&self) -> impl Iterator<Item = &Arc<Message>> {
        self.message_ids
            .iter()
            .filter_map(|id| self.messages.get(id))
    }

    /// Every tool call across the conversation, in message order.
    pub fn tool_calls(&self) -> Vec<&ToolCallRuntime> {
        self.messages()
            .filter_map(|message| message.tool_calls.as_deref())
            .flatten()
            .collect()
    }

    /// The latest message, when it is an interrupt and not the first message.
    pub fn last_interrupt_message(&self) -> Option<&Arc<Message>> {
        if self.message_ids.len() < 2 {
            return None;
        }
        self.message_ids
            .last()
            .and_then(|id| self.messages.get(id))
            .filter(|message| message.finish_reason == Some(FinishReason::Interrupt))
    }

    /// Id of the message the user is giving feedback on (the one before the interrupt).
    pub fn last_feedback_message_id(&self) -> Option<&str> {
        self.last_interrupt_message()?;
        self.message_ids
            .get(self.message_ids.len() - 2)
            .map(String::as_str)
    }

    pub fn research(&self) -> &ResearchState {
        &self.research
    }

    pub fn research_ids(&self) -> &[String] {
        self.research.research_ids()
    }

    pub fn research_plan_id(&self, research_id: &str) -> Option<&str> {
        self.research.plan_id(research_id)
    }

    pub fn research_report_id(&self, research_id: &str) -> Option<&str> {
        self.research.report_id(research_id)
    }

    pub fn research_activity_ids(&self, research_id: &str) -> &[String] {
        self.research.activity_ids(research_id)
    }

    /// The plan message of a research session.
    pub fn research_message(&self, research_id: &str) -> Option<&Arc<Message>> {
        self.research_plan_id(research_id)
            .and_then(|plan_id| self.messages.get(plan_id))
    }

    /// Title taken from the session's plan, or [`UNTITLED_RESEARCH`].
    pub fn research_title(&self, research_id: &str) -> Option<String> {
        let plan = self.research_message(research_id)?;
        let title = parse_fenced_json(&plan.content)
            .and_then(|plan| plan.get("title").and_then(|t| t.as_str()).map(str::to_string))
            .unwrap_or_else(|| UNTITLED_RESEARCH.to_string());
        Some(title)
    }

    pub fn ongoing_research_id(&self) -> Option<&str> {
        self.research.ongoing_research_id()
    }

    pub fn open_research_id(&self) -> Option<&str> {
        self.research.open_research_id()
    }

    pub fn open_research(&mut self, research_id: impl Into<String>) {
        self.research.open_research(research_id);
    }

    pub fn close_research(&mut self) {
        self.research.close_research();
    }

    pub fn responding(&self) -> bool {
        self.responding
    }

    pub fn turn_state(&self) -> &TurnState {
        &self.turn_state
    }
}
