//! Live transport: one streaming POST per turn.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{ChatEventStream, ChatRequest, TransportError, TransportResult, cancelable};
use crate::events::ChatEvent;
use crate::frame::FrameStream;

/// Path of the streaming chat endpoint, relative to the service base URL.
pub const CHAT_STREAM_PATH: &str = "chat/stream";

/// Joins `path` onto `base`, treating `base` as a directory.
///
/// # Errors
/// Returns an error if `base` is not a valid URL.
pub fn resolve_service_url(base: &str, path: &str) -> Result<Url> {
    let mut base = base.trim().to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    let base = Url::parse(&base).with_context(|| format!("Invalid service URL: {base}"))?;
    base.join(path)
        .with_context(|| format!("Failed to resolve {path} against {base}"))
}

#[derive(Debug, Clone)]
pub struct LiveTransport {
    client: reqwest::Client,
    endpoint: Url,
}

impl LiveTransport {
    /// # Errors
    /// Returns an error if `api_url` is not a valid URL.
    pub fn new(api_url: &str) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: resolve_service_url(api_url, CHAT_STREAM_PATH)?,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Sends the turn request and streams decoded events.
    ///
    /// # Errors
    /// Returns an error if the request fails, is cancelled, or the status is not 200.
    pub async fn open(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> TransportResult<ChatEventStream> {
        tracing::debug!(endpoint = %self.endpoint, thread_id = %request.thread_id, "opening chat stream");

        let send = self
            .client
            .post(self.endpoint.clone())
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .json(request)
            .send();

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(TransportError::aborted()),
            response = send => response.map_err(|e| classify_reqwest_error(&e))?,
        };

        let status = response.status();
        if status != StatusCode::OK {
            let error_body = response.text().await.unwrap_or_default();
            return Err(TransportError::http_status(status.as_u16(), &error_body));
        }

        let events = FrameStream::new(Box::pin(response.bytes_stream())).map(|frame| {
            let frame = frame?;
            tracing::debug!(event = %frame.event, "frame received");
            ChatEvent::from_frame(&frame.event, frame.data.as_deref())
        });

        Ok(cancelable(events.boxed(), cancel))
    }
}

fn classify_reqwest_error(e: &reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::network(format!("Request timed out: {e}"))
    } else if e.is_connect() {
        TransportError::network(format!("Connection failed: {e}"))
    } else {
        TransportError::network(format!("Network error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_service_url_ensures_trailing_slash() {
        assert_eq!(
            resolve_service_url("http://localhost:8000/api/", CHAT_STREAM_PATH)
                .unwrap()
                .as_str(),
            "http://localhost:8000/api/chat/stream"
        );
        assert_eq!(
            resolve_service_url("http://localhost:8000/api", CHAT_STREAM_PATH)
                .unwrap()
                .as_str(),
            "http://localhost:8000/api/chat/stream"
        );
        assert!(resolve_service_url("::nope", CHAT_STREAM_PATH).is_err());
    }

    #[test]
    fn test_new_rejects_invalid_url() {
        assert!(LiveTransport::new("not a url").is_err());
        let live = LiveTransport::new("https://example.com/api").unwrap();
        assert_eq!(live.endpoint().as_str(), "https://example.com/api/chat/stream");
    }
}
