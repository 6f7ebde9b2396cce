//! Research session derivation.
//!
//! Messages from the researcher, coder and reporter agents are grouped into
//! research sessions as they arrive. A session is keyed by the id of the
//! message that opened it and tied to the latest planner message.

use std::collections::HashMap;

use crate::events::Agent;
use crate::message::Message;

/// A change to the message log that may move the session state.
#[derive(Debug, Clone, Copy)]
pub enum MessageMutation<'a> {
    Created(&'a Message),
    Updated(&'a Message),
}

/// Session transition produced by [`ResearchState::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResearchChange {
    Started {
        research_id: String,
        plan_id: String,
    },
    Closed {
        research_id: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResearchState {
    research_ids: Vec<String>,
    plan_ids: HashMap<String, String>,
    report_ids: HashMap<String, String>,
    activity_ids: HashMap<String, Vec<String>>,
    ongoing: Option<String>,
    open: Option<String>,
}

impl ResearchState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the state for one message mutation.
    ///
    /// `latest_planner_id` is only consulted when a new session must be created.
    pub fn apply(
        &mut self,
        mutation: MessageMutation<'_>,
        latest_planner_id: Option<&str>,
    ) -> Option<ResearchChange> {
        match mutation {
            MessageMutation::Created(message) => self.on_created(message, latest_planner_id),
            MessageMutation::Updated(message) => self.on_updated(message),
        }
    }

    fn on_created(
        &mut self,
        message: &Message,
        latest_planner_id: Option<&str>,
    ) -> Option<ResearchChange> {
        let agent = message.agent.filter(|agent| agent.is_research_member())?;

        let mut change = None;
        if self.ongoing.is_none() {
            let Some(plan_id) = latest_planner_id else {
                tracing::warn!(
                    message_id = %message.id,
                    ?agent,
                    "no planner message precedes research activity; not starting a session"
                );
                return None;
            };
            self.start(&message.id, plan_id);
            change = Some(ResearchChange::Started {
                research_id: message.id.clone(),
                plan_id: plan_id.to_string(),
            });
        }

        let research_id = self.ongoing.clone()?;
        let members = self.activity_ids.entry(research_id.clone()).or_default();
        if !members.contains(&message.id) {
            members.push(message.id.clone());
        }
        if agent == Agent::Reporter {
            self.report_ids.insert(research_id, message.id.clone());
        }
        change
    }

    fn on_updated(&mut self, message: &Message) -> Option<ResearchChange> {
        let research_id = self.ongoing.as_ref()?;
        if message.agent != Some(Agent::Reporter) || message.is_streaming {
            return None;
        }
        let is_member = self
            .activity_ids
            .get(research_id)
            .is_some_and(|members| members.contains(&message.id));
        if !is_member {
            return None;
        }

        let research_id = self.ongoing.take()?;
        tracing::info!(%research_id, report_id = %message.id, "research session closed");
        Some(ResearchChange::Closed { research_id })
    }

    fn start(&mut self, research_id: &str, plan_id: &str) {
        tracing::info!(research_id, plan_id, "research session started");
        self.research_ids.push(research_id.to_string());
        self.plan_ids
            .insert(research_id.to_string(), plan_id.to_string());
        self.activity_ids.insert(
            research_id.to_string(),
            vec![plan_id.to_string(), research_id.to_string()],
        );
        self.ongoing = Some(research_id.to_string());
        self.open = Some(research_id.to_string());
    }

    /// Drops the ongoing pointer without closing through a report.
    pub fn abandon_ongoing(&mut self) -> Option<String> {
        self.ongoing.take()
    }

    pub fn open_research(&mut self, research_id: impl Into<String>) {
        self.open = Some(research_id.into());
    }

    pub fn close_research(&mut self) {
        self.open = None;
    }

    pub fn research_ids(&self) -> &[String] {
        &self.research_ids
    }

    pub fn plan_id(&self, research_id: &str) -> Option<&str> {
        self.plan_ids.get(research_id).map(String::as_str)
    }

    pub fn report_id(&self, research_id: &str) -> Option<&str> {
        self.report_ids.get(research_id).map(String::as_str)
    }

    pub fn activity_ids(&self, research_id: &str) -> &[String] {
        self.activity_ids
            .get(research_id)
            .map_or(&[], Vec::as_slice)
    }

    pub fn ongoing_research_id(&self) -> Option<&str> {
        self.ongoing.as_deref()
    }

    pub fn open_research_id(&self) -> Option<&str> {
        self.open.as_deref()
    }
}
