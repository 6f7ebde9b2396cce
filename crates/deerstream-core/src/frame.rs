//! Frame parser for `text/event-stream` bodies.
//!
//! A frame is a block of `key: value` lines terminated by a blank line.
//! Only the `event` and `data` keys are meaningful; everything else is ignored.

use std::collections::VecDeque;
use std::pin::Pin;

use bytes::{Buf, Bytes, BytesMut};
use futures_util::Stream;

use crate::transport::{TransportError, TransportResult};

/// Event type used when a frame carries no `event:` line.
pub const DEFAULT_EVENT_TYPE: &str = "message";

/// One decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: String,
    pub data: Option<String>,
}

/// Incremental frame splitter over a byte buffer.
///
/// Bytes are buffered undecoded, so a multi-byte character split across
/// reads is only decoded once its frame is complete.
#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: BytesMut,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and drains every complete frame, in arrival order.
    ///
    /// A frame that is not valid UTF-8 is returned as a `Decode` error in its
    /// place.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<TransportResult<Frame>> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some((end, delimiter_len)) = find_delimiter(&self.buffer) {
            let block = self.buffer.split_to(end);
            self.buffer.advance(delimiter_len);
            frames.extend(decode_block(&block).transpose());
        }
        frames
    }

    /// Flushes a trailing frame that was never terminated by a blank line.
    pub fn finish(&mut self) -> Option<TransportResult<Frame>> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = self.buffer.split();
        decode_block(&rest).transpose()
    }

    /// Number of buffered bytes not yet part of a complete frame.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

fn decode_block(block: &[u8]) -> TransportResult<Option<Frame>> {
    let text = std::str::from_utf8(block).map_err(|e| {
        TransportError::decode("Invalid UTF-8 in event stream frame")
            .with_details(format!("{e} ({} bytes)", block.len()))
    })?;
    Ok(parse_frame(text))
}

/// Finds the earliest frame delimiter, returning `(offset, delimiter_len)`.
fn find_delimiter(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = find_subslice(buf, b"\n\n").map(|pos| (pos, 2));
    let crlf = find_subslice(buf, b"\r\n\r\n").map(|pos| (pos, 4));

    match (lf, crlf) {
        (Some(lf), Some(crlf)) => Some(if crlf.0 < lf.0 { crlf } else { lf }),
        (lf, crlf) => lf.or(crlf),
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Parses a single frame block.
///
/// Returns `None` for a frame that keeps the default type and carries no data.
pub fn parse_frame(block: &str) -> Option<Frame> {
    let mut event = None;
    let mut data = None;

    for line in block.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let Some((key, value)) = line.split_once(": ") else {
            continue;
        };
        match key {
            "event" => event = Some(value.to_string()),
            "data" => data = Some(value.to_string()),
            _ => {}
        }
    }

    let event = event.unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_string());
    if event == DEFAULT_EVENT_TYPE && data.is_none() {
        return None;
    }
    Some(Frame { event, data })
}

/// Splits a complete event log into frames (CRLF is normalized first).
pub fn split_frames(text: &str) -> Vec<Frame> {
    let normalized = text.replace("\r\n", "\n");
    normalized.split("\n\n").filter_map(parse_frame).collect()
}

/// Adapts a byte stream into a stream of frames.
pub struct FrameStream<S> {
    inner: S,
    parser: FrameParser,
    ready: VecDeque<TransportResult<Frame>>,
    done: bool,
}

impl<S> FrameStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            inner: stream,
            parser: FrameParser::new(),
            ready: VecDeque::new(),
            done: false,
        }
    }
}

impl<S, E> Stream for FrameStream<S>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    type Item = TransportResult<Frame>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        use std::task::Poll;

        let this = &mut *self;
        loop {
            if let Some(frame) = this.ready.pop_front() {
                if frame.is_err() {
                    this.done = true;
                    this.ready.clear();
                }
                return Poll::Ready(Some(frame));
            }
            if this.done {
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.ready.extend(this.parser.push(&chunk));
                }
                Poll::Ready(Some(Err(e))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(TransportError::network(format!(
                        "Event stream read failed: {e}"
                    )))));
                }
                Poll::Ready(None) => {
                    this.done = true;
                    if this.parser.buffered_len() > 0 {
                        tracing::debug!(
                            bytes = this.parser.buffered_len(),
                            "flushing unterminated frame at end of stream"
                        );
                    }
                    this.ready.extend(this.parser.finish());
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;
    use crate::transport::TransportErrorKind;

    const SSE_BODY: &str = "event: message_chunk\ndata: {\"id\":\"m1\",\"content\":\"Hel\"}\n\n\
event: message_chunk\ndata: {\"id\":\"m1\",\"content\":\"lo\"}\n\n\
event: tool_call_result\ndata: {\"id\":\"t1\",\"tool_call_id\":\"c1\",\"content\":\"42\"}\n\n";

    fn mock_byte_stream(
        data: &str,
        chunk_size: usize,
    ) -> impl Stream<Item = std::result::Result<Bytes, std::io::Error>> + Unpin {
        let chunks: Vec<_> = data
            .as_bytes()
            .chunks(chunk_size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        futures_util::stream::iter(chunks)
    }

    fn parse_all(chunks: &[&[u8]]) -> Vec<Frame> {
        let mut parser = FrameParser::new();
        let mut frames = Vec::new();
        for chunk in chunks {
            frames.extend(parser.push(chunk));
        }
        frames.extend(parser.finish());
        frames.into_iter().map(|frame| frame.unwrap()).collect()
    }

    #[test]
    fn test_push_extracts_frames_in_order() {
        let frames = parse_all(&[SSE_BODY.as_bytes()]);

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].event, "message_chunk");
        assert_eq!(
            frames[1].data.as_deref(),
            Some("{\"id\":\"m1\",\"content\":\"lo\"}")
        );
        assert_eq!(frames[2].event, "tool_call_result");
    }

    #[test]
    fn test_chunk_boundaries_do_not_change_output() {
        let whole = parse_all(&[SSE_BODY.as_bytes()]);
        let bytes = SSE_BODY.as_bytes();

        for split in 1..bytes.len() {
            let (left, right) = bytes.split_at(split);
            assert_eq!(parse_all(&[left, right]), whole, "split at {split}");
        }

        let single_bytes: Vec<&[u8]> = bytes.chunks(1).collect();
        assert_eq!(parse_all(&single_bytes), whole);
    }

    #[test]
    fn test_partial_frame_stays_buffered() {
        let mut parser = FrameParser::new();

        assert!(parser.push(b"event: message_chunk\ndata: {}").is_empty());
        assert!(parser.buffered_len() > 0);

        let frames = parser.push(b"\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref().unwrap().data.as_deref(), Some("{}"));
        assert_eq!(parser.buffered_len(), 0);
    }

    #[test]
    fn test_crlf_delimiters() {
        let frames = parse_all(&[b"event: interrupt\r\ndata: {\"id\":\"a\"}\r\n\r\nevent: message_chunk\r\ndata: {}\r\n\r\n"]);

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event, "interrupt");
        assert_eq!(frames[0].data.as_deref(), Some("{\"id\":\"a\"}"));
        assert_eq!(frames[1].event, "message_chunk");
    }

    #[test]
    fn test_mixed_line_endings() {
        let frames = parse_all(&[b"event: a\ndata: 1\n\nevent: b\r\ndata: 2\r\n\r\nevent: c\ndata: 3\n\n"]);

        let events: Vec<_> = frames.iter().map(|f| f.event.as_str()).collect();
        assert_eq!(events, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_utf8_split_across_chunks() {
        let body = "event: message_chunk\ndata: {\"content\":\"caf\u{e9} \u{1f600}\"}\n\n";
        let bytes = body.as_bytes();
        let emoji_start = body.find('\u{1f600}').unwrap();

        let frames = parse_all(&[&bytes[..emoji_start + 2], &bytes[emoji_start + 2..]]);

        assert_eq!(frames.len(), 1);
        assert_eq!(
            frames[0].data.as_deref(),
            Some("{\"content\":\"caf\u{e9} \u{1f600}\"}")
        );
    }

    #[test]
    fn test_parse_frame_defaults_and_discards() {
        let frame = parse_frame("data: {\"x\":1}").unwrap();
        assert_eq!(frame.event, DEFAULT_EVENT_TYPE);

        assert_eq!(parse_frame("event: message"), None);
        assert_eq!(parse_frame(": keep-alive comment"), None);
        assert_eq!(
            parse_frame("event: interrupt"),
            Some(Frame {
                event: "interrupt".to_string(),
                data: None,
            })
        );
    }

    #[test]
    fn test_lines_without_separator_are_ignored() {
        let frame = parse_frame("retry:100\nevent: message_chunk\nid 5\ndata: {}").unwrap();
        assert_eq!(frame.event, "message_chunk");
        assert_eq!(frame.data.as_deref(), Some("{}"));
    }

    #[test]
    fn test_value_keeps_later_separators() {
        let frame = parse_frame("data: key: value").unwrap();
        assert_eq!(frame.data.as_deref(), Some("key: value"));
    }

    #[test]
    fn test_finish_flushes_unterminated_frame() {
        let mut parser = FrameParser::new();
        assert!(parser.push(b"event: message_chunk\ndata: {}\n").is_empty());

        let frame = parser.finish().unwrap().unwrap();
        assert_eq!(frame.event, "message_chunk");
        assert!(parser.finish().is_none());
    }

    #[test]
    fn test_invalid_utf8_frame_is_decode_error() {
        let mut parser = FrameParser::new();
        let frames = parser.push(b"event: message_chunk\ndata: {\"content\":\"\xff\xfe\"}\n\nevent: a\ndata: 1\n\n");

        assert_eq!(frames.len(), 2);
        let err = frames[0].as_ref().unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Decode);
        assert!(err.details.is_some());
        assert_eq!(frames[1].as_ref().unwrap().event, "a");
    }

    #[tokio::test]
    async fn test_frame_stream_ends_on_invalid_utf8() {
        let chunks: Vec<std::result::Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"event: a\ndata: 1\n\n")),
            Ok(Bytes::from_static(b"event: b\ndata: \xc3\n\nevent: c\ndata: 3\n\n")),
        ];
        let mut stream = FrameStream::new(futures_util::stream::iter(chunks));

        assert_eq!(stream.next().await.unwrap().unwrap().event, "a");
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Decode);
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_split_frames_normalizes_crlf() {
        let frames = split_frames("event: a\r\ndata: 1\r\n\r\nevent: b\r\ndata: 2\r\n\r\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].data.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_frame_stream_over_chunked_bytes() {
        let mut stream = FrameStream::new(mock_byte_stream(SSE_BODY, 7));

        let mut frames = Vec::new();
        while let Some(result) = stream.next().await {
            frames.push(result.expect("Expected valid frame"));
        }

        assert_eq!(frames, parse_all(&[SSE_BODY.as_bytes()]));
    }

    #[tokio::test]
    async fn test_frame_stream_read_error_ends_stream() {
        let chunks: Vec<std::result::Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"event: a\ndata: 1\n\n")),
            Err(std::io::Error::other("connection reset")),
            Ok(Bytes::from_static(b"event: b\ndata: 2\n\n")),
        ];
        let mut stream = FrameStream::new(futures_util::stream::iter(chunks));

        assert_eq!(stream.next().await.unwrap().unwrap().event, "a");
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Network);
        assert!(err.message.contains("connection reset"));
        assert!(stream.next().await.is_none());
    }
}
