//! Replay transport: re-emits a recorded event log with simulated pacing.
//!
//! Logs live under a replay base (an `http(s)` URL or a local directory) as
//! `mock/<name>.txt` or `replay/<id>.txt`. Each log is fetched once per cache
//! and split with the regular frame grammar.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{self, Stream};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{ChatEventStream, ChatRequest, TransportError, TransportResult, cancelable};
use crate::config::ReplayConfig;
use crate::events::{ChatEvent, Role};
use crate::frame::{Frame, split_frames};

/// Replay used when the query names neither a mock nor a replay id.
pub const DEFAULT_REPLAY_ID: &str = "eiffel-tower-vs-tallest-building";

const DELAY_BEFORE_CHUNK: Duration = Duration::from_millis(50);
const DELAY_BEFORE_TOOL_RESULT: Duration = Duration::from_millis(500);
const DELAY_AFTER_TOOL_RESULT: Duration = Duration::from_millis(800);
const DELAY_AFTER_USER_CHUNK: Duration = Duration::from_millis(500);

/// Where recorded logs are read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplaySource {
    Http(Url),
    Dir(PathBuf),
}

impl ReplaySource {
    /// Treats `http://` and `https://` values as URLs and anything else as a directory.
    pub fn parse(base: &str) -> Self {
        let trimmed = base.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            let with_slash = if trimmed.ends_with('/') {
                trimmed.to_string()
            } else {
                format!("{trimmed}/")
            };
            if let Ok(url) = Url::parse(&with_slash) {
                return ReplaySource::Http(url);
            }
            tracing::warn!(base = trimmed, "replay base is not a valid URL; reading it as a directory");
        }
        ReplaySource::Dir(PathBuf::from(trimmed))
    }

    /// Human-readable location of a log, also used as its cache key.
    fn locate(&self, log_path: &str) -> TransportResult<String> {
        match self {
            ReplaySource::Http(base) => base
                .join(log_path)
                .map(String::from)
                .map_err(|e| TransportError::network(format!("Invalid replay path {log_path}: {e}"))),
            ReplaySource::Dir(dir) => Ok(dir.join(log_path).display().to_string()),
        }
    }
}

/// Log chosen for a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayLog {
    /// Path relative to the replay source, e.g. `replay/<id>.txt`
    pub path: String,
    /// Whether pacing delays should be switched off
    pub fast_forward: bool,
}

/// Picks the log for a turn from the location query and interrupt feedback.
pub fn resolve_replay_log(location_query: &str, interrupt_feedback: Option<&str>) -> ReplayLog {
    let params = query_pairs(location_query);

    if let Some(name) = params.get("mock") {
        if !name.is_empty() {
            return ReplayLog {
                path: format!("mock/{name}.txt"),
                fast_forward: true,
            };
        }
        let file = match interrupt_feedback {
            Some("accepted") => "final-answer",
            Some("edit_plan") => "re-plan",
            _ => "first-plan",
        };
        return ReplayLog {
            path: format!("mock/{file}.txt"),
            fast_forward: true,
        };
    }

    let id = extract_replay_id(location_query).unwrap_or_else(|| DEFAULT_REPLAY_ID.to_string());
    ReplayLog {
        path: format!("replay/{id}.txt"),
        fast_forward: false,
    }
}

/// Returns the non-empty `replay` parameter of a query string.
pub fn extract_replay_id(location_query: &str) -> Option<String> {
    query_pairs(location_query)
        .remove("replay")
        .filter(|id| !id.is_empty())
}

fn query_pairs(location_query: &str) -> HashMap<String, String> {
    let query = location_query.trim().trim_start_matches('?');
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

/// Shared switch that disables replay pacing.
#[derive(Debug, Clone, Default)]
pub struct FastForward(Arc<AtomicBool>);

impl FastForward {
    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::Relaxed);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Fetched log bodies keyed by resolved location.
#[derive(Debug, Clone, Default)]
pub struct ReplayCache(Arc<Mutex<HashMap<String, Arc<str>>>>);

impl ReplayCache {
    pub fn get(&self, location: &str) -> Option<Arc<str>> {
        self.0
            .lock()
            .ok()
            .and_then(|entries| entries.get(location).cloned())
    }

    pub fn insert(&self, location: String, text: Arc<str>) {
        if let Ok(mut entries) = self.0.lock() {
            entries.insert(location, text);
        }
    }

    pub fn len(&self) -> usize {
        self.0.lock().map_or(0, |entries| entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct ReplayTransport {
    client: reqwest::Client,
    source: ReplaySource,
    location_query: String,
    cache: ReplayCache,
    fast_forward: FastForward,
}

impl ReplayTransport {
    pub fn new(source: ReplaySource, location_query: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            source,
            location_query: location_query.into(),
            cache: ReplayCache::default(),
            fast_forward: FastForward::default(),
        }
    }

    pub fn from_config(config: &ReplayConfig) -> Self {
        Self::new(
            ReplaySource::parse(&config.base),
            config.location_query.clone(),
        )
    }

    pub fn source(&self) -> &ReplaySource {
        &self.source
    }

    pub fn cache(&self) -> &ReplayCache {
        &self.cache
    }

    pub fn fast_forward(&self) -> &FastForward {
        &self.fast_forward
    }

    /// Replays the log selected for this turn.
    ///
    /// # Errors
    /// Returns an error if the log cannot be fetched or the turn is cancelled first.
    pub async fn open(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> TransportResult<ChatEventStream> {
        let log = resolve_replay_log(&self.location_query, request.interrupt_feedback.as_deref());
        if log.fast_forward {
            self.fast_forward.set(true);
        }
        tracing::info!(path = %log.path, fast_forward = self.fast_forward.is_set(), "replaying log");

        let text = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(TransportError::aborted()),
            text = self.fetch_log(&log.path) => text?,
        };

        Ok(cancelable(
            replay_events(&text, self.fast_forward.clone()).boxed(),
            cancel,
        ))
    }

    /// Loads a log, serving repeats from the cache.
    ///
    /// # Errors
    /// Returns an error if the log cannot be read.
    pub async fn fetch_log(&self, log_path: &str) -> TransportResult<Arc<str>> {
        let location = self.source.locate(log_path)?;
        if let Some(text) = self.cache.get(&location) {
            tracing::debug!(%location, "replay cache hit");
            return Ok(text);
        }

        let text: Arc<str> = match &self.source {
            ReplaySource::Http(_) => {
                let response = self
                    .client
                    .get(&location)
                    .send()
                    .await
                    .map_err(|e| TransportError::network(format!("Failed to fetch {location}: {e}")))?;
                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(TransportError::http_status(status.as_u16(), &body));
                }
                response
                    .text()
                    .await
                    .map_err(|e| TransportError::network(format!("Failed to read {location}: {e}")))?
                    .into()
            }
            ReplaySource::Dir(_) => tokio::fs::read_to_string(&location)
                .await
                .map_err(|e| TransportError::network(format!("Failed to read {location}: {e}")))?
                .into(),
        };

        self.cache.insert(location, Arc::clone(&text));
        Ok(text)
    }

    /// Runs the default log and returns the content of its first message chunk.
    ///
    /// # Errors
    /// Returns an error if the log cannot be fetched.
    pub async fn fetch_replay_title(&self) -> TransportResult<Option<String>> {
        let log = resolve_replay_log(&self.location_query, None);
        let text = self.fetch_log(&log.path).await?;

        let mut events = Box::pin(replay_events(&text, self.fast_forward.clone()));
        while let Some(event) = events.next().await {
            if let Ok(ChatEvent::MessageChunk(chunk)) = event {
                return Ok(chunk.content);
            }
        }
        Ok(None)
    }
}

struct ReplayCursor {
    frames: std::vec::IntoIter<Frame>,
    fast_forward: FastForward,
    pending_delay: Duration,
}

/// Paced event stream over a complete log body.
///
/// Frames that fail to decode are logged and skipped.
pub fn replay_events(
    text: &str,
    fast_forward: FastForward,
) -> impl Stream<Item = TransportResult<ChatEvent>> + Send + 'static {
    let cursor = ReplayCursor {
        frames: split_frames(text).into_iter(),
        fast_forward,
        pending_delay: Duration::ZERO,
    };

    stream::unfold(cursor, |mut cursor| async move {
        pace(&cursor.fast_forward, std::mem::take(&mut cursor.pending_delay)).await;

        loop {
            let frame = cursor.frames.next()?;
            let event = match ChatEvent::from_frame(&frame.event, frame.data.as_deref()) {
                Ok(event) => event,
                Err(err) => {
                    tracing::warn!(event = %frame.event, error = %err, "skipping malformed replay frame");
                    continue;
                }
            };

            pace(&cursor.fast_forward, delay_before(&event)).await;
            cursor.pending_delay = delay_after(&event);
            return Some((Ok(event), cursor));
        }
    })
}

fn delay_before(event: &ChatEvent) -> Duration {
    match event {
        ChatEvent::MessageChunk(_) if event.finish_reason().is_none() => DELAY_BEFORE_CHUNK,
        ChatEvent::ToolCallResult(_) => DELAY_BEFORE_TOOL_RESULT,
        _ => Duration::ZERO,
    }
}

fn delay_after(event: &ChatEvent) -> Duration {
    match event {
        ChatEvent::ToolCallResult(_) => DELAY_AFTER_TOOL_RESULT,
        ChatEvent::MessageChunk(chunk) if chunk.envelope.role == Role::User => {
            DELAY_AFTER_USER_CHUNK
        }
        _ => Duration::ZERO,
    }
}

async fn pace(fast_forward: &FastForward, delay: Duration) {
    if delay.is_zero() || fast_forward.is_set() {
        return;
    }
    tokio::time::sleep(delay).await;
}
