//! Event transports.
//!
//! A transport turns one outgoing chat turn into a lazy, cancelable stream of
//! [`ChatEvent`]s, either from the live service or from a recorded log.

use std::fmt;

use anyhow::Result;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::events::ChatEvent;

pub mod live;
pub mod replay;
mod request;

pub use live::LiveTransport;
pub use replay::ReplayTransport;
pub use request::{ChatRequest, RequestMessage, TurnOptions};

/// Category of transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Service answered with a non-success status
    HttpStatus,
    /// Connection or body read failed
    Network,
    /// Frame payload could not be decoded into an event
    Decode,
    /// Turn was cancelled by the caller
    Aborted,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorKind::HttpStatus => write!(f, "http_status"),
            TransportErrorKind::Network => write!(f, "network"),
            TransportErrorKind::Decode => write!(f, "decode"),
            TransportErrorKind::Aborted => write!(f, "aborted"),
        }
    }
}

/// Structured transport error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    /// Error category
    pub kind: TransportErrorKind,
    /// One-line summary suitable for display
    pub message: String,
    /// Optional additional details (e.g., raw response body)
    pub details: Option<String>,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    /// Creates an HTTP status error, pulling a readable message out of a JSON body.
    pub fn http_status(status: u16, body: &str) -> Self {
        let message = format!("HTTP {status}");
        if body.is_empty() {
            return Self::new(TransportErrorKind::HttpStatus, message);
        }

        if let Ok(json) = serde_json::from_str::<Value>(body)
            && let Some(detail) = json
                .get("detail")
                .or_else(|| json.get("error").and_then(|e| e.get("message")))
                .and_then(Value::as_str)
        {
            return Self {
                kind: TransportErrorKind::HttpStatus,
                message: format!("HTTP {status}: {detail}"),
                details: Some(body.to_string()),
            };
        }

        Self {
            kind: TransportErrorKind::HttpStatus,
            message,
            details: Some(body.to_string()),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Network, message)
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Decode, message)
    }

    pub fn aborted() -> Self {
        Self::new(TransportErrorKind::Aborted, "Turn cancelled")
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TransportError {}

/// Result type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Stream of chat events for one turn.
pub type ChatEventStream = BoxStream<'static, TransportResult<ChatEvent>>;

/// Event source for a conversation.
#[derive(Debug, Clone)]
pub enum Transport {
    Live(LiveTransport),
    Replay(ReplayTransport),
}

impl Transport {
    /// Picks live or replay according to the replay settings.
    ///
    /// # Errors
    /// Returns an error if the service URL is invalid.
    pub fn from_config(config: &Config) -> Result<Self> {
        if config.replay.enabled() {
            let replay = ReplayTransport::from_config(&config.replay);
            tracing::info!(
                source = ?replay.source(),
                query = %config.replay.location_query,
                "using replay transport"
            );
            return Ok(Transport::Replay(replay));
        }

        let live = LiveTransport::new(&config.effective_api_url()?)?;
        tracing::info!(endpoint = %live.endpoint(), "using live transport");
        Ok(Transport::Live(live))
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, Transport::Replay(_))
    }

    /// Opens the event stream for one turn.
    ///
    /// # Errors
    /// Returns an error if the stream cannot be established.
    pub async fn open(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> TransportResult<ChatEventStream> {
        match self {
            Transport::Live(live) => live.open(request, cancel).await,
            Transport::Replay(replay) => replay.open(request, cancel).await,
        }
    }
}

/// Wraps a stream so cancellation ends it with a single `Aborted` error.
pub(crate) fn cancelable(events: ChatEventStream, cancel: CancellationToken) -> ChatEventStream {
    stream::unfold(Some(events), move |state| {
        let cancel = cancel.clone();
        async move {
            let mut events = state?;
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                next = events.next() => Some(next),
            };
            match next {
                None => Some((Err(TransportError::aborted()), None)),
                Some(item) => item.map(|item| (item, Some(events))),
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_http_status_extracts_detail() {
        let err = TransportError::http_status(422, r#"{"detail":"thread_id missing"}"#);
        assert_eq!(err.kind, TransportErrorKind::HttpStatus);
        assert_eq!(err.message, "HTTP 422: thread_id missing");
        assert!(err.details.is_some());

        let err = TransportError::http_status(500, "boom");
        assert_eq!(err.message, "HTTP 500");
        assert_eq!(err.details.as_deref(), Some("boom"));

        let err = TransportError::http_status(502, "");
        assert_eq!(err.details, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelable_ends_with_single_abort() {
        let slow = stream::unfold(0u32, |n| async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Some((Err(TransportError::decode(format!("tick {n}"))), n + 1))
        })
        .boxed();
        let cancel = CancellationToken::new();
        let mut events = cancelable(slow, cancel.clone());

        let first = events.next().await.unwrap().unwrap_err();
        assert_eq!(first.message, "tick 0");

        cancel.cancel();
        let aborted = events.next().await.unwrap().unwrap_err();
        assert_eq!(aborted.kind, TransportErrorKind::Aborted);
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn test_cancelable_passes_through_when_not_cancelled() {
        let inner = stream::iter(vec![
            Err(TransportError::decode("a")),
            Err(TransportError::decode("b")),
        ])
        .boxed();
        let events: Vec<_> = cancelable(inner, CancellationToken::new()).collect().await;
        assert_eq!(events.len(), 2);
    }
}
