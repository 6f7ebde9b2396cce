//! Chat command handler.
//!
//! Turns run on the current task while a renderer task prints store events
//! to stdout as message content grows.

use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use deerstream_core::config::Config;
use deerstream_core::events::{Agent, InterruptOption, Role};
use deerstream_core::message::Message;
use deerstream_core::store::{
    ConversationStore, EventSender, StoreEvent, StoreEventRx, TurnState, create_event_channel,
};
use deerstream_core::transport::{Transport, TurnOptions};
use tokio::sync::Notify;

use crate::cli::ReplayArgs;
use crate::interrupt::{InterruptedError, TurnGuard};

const QUIT_COMMAND: &str = "/quit";

pub async fn run(config: &Config, prompt: Option<&str>, replay: &ReplayArgs) -> Result<()> {
    let config = replay.apply(config);

    let (tx, rx) = create_event_channel();
    let mut store = ConversationStore::from_config(&config)
        .context("create conversation")?
        .with_event_sender(EventSender::new(tx));

    if let Transport::Replay(transport) = store.transport() {
        transport.fast_forward().set(replay.fast_forward);
    }
    tracing::debug!(thread_id = store.thread_id(), "conversation ready");

    let turn_done = Arc::new(Notify::new());
    let renderer = tokio::spawn(render_events(rx, Arc::clone(&turn_done), io::stdout()));

    let result = match prompt {
        Some(prompt) => run_once(&mut store, prompt).await,
        None => run_interactive(&mut store, &turn_done).await,
    };

    // Dropping the store closes the event channel and ends the renderer.
    drop(store);
    renderer.await.context("join renderer")?;
    result
}

async fn run_once(store: &mut ConversationStore, prompt: &str) -> Result<()> {
    let guard = TurnGuard::begin();
    let state = store
        .submit_turn(Some(prompt), TurnOptions::default(), guard.token())
        .await;

    if guard.was_interrupted() {
        return Err(InterruptedError.into());
    }
    if let TurnState::Errored(message) = state {
        bail!("Turn failed: {message}");
    }
    Ok(())
}

async fn run_interactive(store: &mut ConversationStore, turn_done: &Notify) -> Result<()> {
    loop {
        let pending = store
            .last_interrupt_message()
            .and_then(|message| message.options.clone())
            .unwrap_or_default();
        print_prompt(&pending)?;

        let Some(line) = read_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() || line == QUIT_COMMAND {
            break;
        }

        let (text, options) = match match_option(&pending, line) {
            Some(option) => (
                option.text.clone(),
                TurnOptions {
                    interrupt_feedback: Some(option.value.clone()),
                    ..TurnOptions::default()
                },
            ),
            None => (line.to_string(), TurnOptions::default()),
        };

        let guard = TurnGuard::begin();
        let state = store.submit_turn(Some(&text), options, guard.token()).await;
        if let TurnState::Errored(message) = &state
            && !guard.was_interrupted()
        {
            tracing::debug!(error = %message, "turn ended with error");
        }
        drop(guard);

        turn_done.notified().await;
    }
    Ok(())
}

fn print_prompt(options: &[InterruptOption]) -> Result<()> {
    let mut out = io::stdout().lock();
    if !options.is_empty() {
        let choices = options
            .iter()
            .map(|option| format!("{} ({})", option.text, option.value))
            .collect::<Vec<_>>()
            .join(", ");
        writeln!(out, "Options: {choices}")?;
    }
    write!(out, "> ")?;
    out.flush()?;
    Ok(())
}

async fn read_line() -> Result<Option<String>> {
    tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        let read = io::stdin().read_line(&mut line)?;
        Ok::<_, io::Error>((read > 0).then_some(line))
    })
    .await
    .context("join stdin reader")?
    .context("read stdin")
}

/// Picks the interrupt option the input names, by value or by text.
fn match_option<'a>(options: &'a [InterruptOption], input: &str) -> Option<&'a InterruptOption> {
    options.iter().find(|option| {
        option.value.eq_ignore_ascii_case(input) || option.text.eq_ignore_ascii_case(input)
    })
}

/// Drains store events until the store is dropped.
///
/// Keeps draining after a write failure so a waiting turn is still released.
async fn render_events<W: Write>(mut rx: StoreEventRx, turn_done: Arc<Notify>, mut out: W) {
    let mut renderer = Renderer::default();
    let mut writable = true;
    while let Some(event) = rx.recv().await {
        if writable && let Err(e) = renderer.render_flush(&event, &mut out) {
            tracing::warn!(error = %e, "output closed, no longer rendering");
            writable = false;
        }
        if matches!(*event, StoreEvent::RespondingChanged { responding: false }) {
            turn_done.notify_one();
        }
    }
}

/// Prints incremental message output.
///
/// Message updates can be dropped under backpressure, so each message's
/// printed length is tracked and only the unseen suffix is written.
#[derive(Default)]
struct Renderer {
    printed: HashMap<String, usize>,
    current: Option<String>,
    announced_calls: HashSet<String>,
    shown_results: HashSet<String>,
    mid_line: bool,
}

impl Renderer {
    fn render_flush(&mut self, event: &StoreEvent, out: &mut impl Write) -> io::Result<()> {
        self.render(event, out)?;
        out.flush()
    }

    fn render(&mut self, event: &StoreEvent, out: &mut impl Write) -> io::Result<()> {
        match event {
            StoreEvent::MessageUpdated { message } if message.role != Role::User => {
                self.render_message(message, out)?;
            }
            StoreEvent::ResearchStarted { research_id, .. } => {
                self.line_break(out)?;
                writeln!(out, "[research {research_id} started]")?;
            }
            StoreEvent::ResearchClosed { research_id } => {
                self.line_break(out)?;
                writeln!(out, "[research {research_id} closed]")?;
            }
            StoreEvent::Notice { message } => {
                self.line_break(out)?;
                writeln!(out, "! {message}")?;
            }
            StoreEvent::RespondingChanged { responding: false } => {
                self.line_break(out)?;
                self.current = None;
            }
            StoreEvent::MessageUpdated { .. }
            | StoreEvent::MessageAppended { .. }
            | StoreEvent::RespondingChanged { .. } => {}
        }
        Ok(())
    }

    fn render_message(&mut self, message: &Message, out: &mut impl Write) -> io::Result<()> {
        let printed = self.printed.get(&message.id).copied().unwrap_or(0);
        let unseen = message.content.get(printed..).unwrap_or("");

        if !unseen.is_empty() {
            if self.current.as_deref() != Some(message.id.as_str()) {
                self.line_break(out)?;
                writeln!(out, "[{}]", agent_label(message.agent))?;
                self.current = Some(message.id.clone());
            }
            write!(out, "{unseen}")?;
            self.mid_line = !unseen.ends_with('\n');
            self.printed
                .insert(message.id.clone(), message.content.len());
        }

        for call in message.tool_calls.iter().flatten() {
            if let Some(args) = &call.args
                && self.announced_calls.insert(call.id.clone())
            {
                self.line_break(out)?;
                writeln!(out, "-> {}({args})", call.name)?;
            }
            if let Some(result) = &call.result
                && self.shown_results.insert(call.id.clone())
            {
                self.line_break(out)?;
                writeln!(out, "<- {}: {}", call.name, first_line(result))?;
            }
        }
        Ok(())
    }

    fn line_break(&mut self, out: &mut impl Write) -> io::Result<()> {
        if self.mid_line {
            writeln!(out)?;
            self.mid_line = false;
        }
        Ok(())
    }
}

fn agent_label(agent: Option<Agent>) -> &'static str {
    match agent {
        Some(Agent::Coordinator) => "coordinator",
        Some(Agent::Planner) => "planner",
        Some(Agent::Researcher) => "researcher",
        Some(Agent::Coder) => "coder",
        Some(Agent::Reporter) => "reporter",
        Some(Agent::Podcast) => "podcast",
        Some(Agent::Other) | None => "assistant",
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}
