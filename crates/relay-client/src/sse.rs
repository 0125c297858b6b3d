use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tracing::debug;

use relay_core::api::EventByteStream;
use relay_core::errors::RelayError;
use relay_core::session::SessionEvent;

/// Splits a chunked byte stream into lines.
///
/// Bytes are buffered until a `\n` arrives, so a multi-byte character cut
/// across two chunks is decoded only once it is whole. A trailing `\r` is
/// stripped from each line.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buf: Vec<u8>,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let rest = self.buf.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.buf, rest);
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Whatever is left once the stream ends without a final newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let mut line = std::mem::take(&mut self.buf);
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

/// Decode one SSE line. Non-`data:` lines and undecodable payloads yield `None`.
pub fn decode_line(line: &str) -> Option<SessionEvent> {
    let payload = line.strip_prefix("data:")?;
    let payload = payload.strip_prefix(' ').unwrap_or(payload);
    if payload.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<SessionEvent>(payload) {
        Ok(event) => Some(event),
        Err(e) => {
            debug!(error = %e, "skipping undecodable event line");
            None
        }
    }
}

/// Decoded session events over a raw event byte stream.
///
/// Transport errors are passed through as items; the stream ends when the
/// underlying body ends.
pub struct SseEventStream {
    inner: EventByteStream,
    lines: SseLineBuffer,
    pending: VecDeque<SessionEvent>,
    done: bool,
}

impl SseEventStream {
    pub fn new(inner: EventByteStream) -> Self {
        Self {
            inner,
            lines: SseLineBuffer::new(),
            pending: VecDeque::new(),
            done: false,
        }
    }

    fn absorb(&mut self, lines: impl IntoIterator<Item = String>) {
        self.pending
            .extend(lines.into_iter().filter_map(|line| decode_line(&line)));
    }
}

impl Stream for SseEventStream {
    type Item = Result<SessionEvent, RelayError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if self.done {
                return Poll::Ready(None);
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let lines = self.lines.push(&bytes);
                    self.absorb(lines);
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => {
                    self.done = true;
                    let rest = self.lines.finish();
                    self.absorb(rest);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::{stream, StreamExt};

    fn byte_stream(chunks: Vec<Result<&'static str, RelayError>>) -> EventByteStream {
        Box::pin(stream::iter(
            chunks
                .into_iter()
                .map(|c| c.map(|s| Bytes::from_static(s.as_bytes()))),
        ))
    }

    #[test]
    fn lines_survive_chunk_boundaries() {
        let mut buf = SseLineBuffer::new();
        assert!(buf.push(b"data: {\"a\"").is_empty());
        assert_eq!(buf.push(b":1}\r\n\r\nda"), vec!["data: {\"a\":1}", ""]);
        assert_eq!(buf.finish().as_deref(), Some("da"));
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn multibyte_char_split_across_chunks() {
        let text = "data: é\n".as_bytes();
        // 'é' is two bytes; cut between them.
        let split = "data: ".len() + 1;
        let mut buf = SseLineBuffer::new();
        assert!(buf.push(&text[..split]).is_empty());
        assert_eq!(buf.push(&text[split..]), vec!["data: é"]);
    }

    #[test]
    fn decode_line_rules() {
        assert!(decode_line(": keepalive").is_none());
        assert!(decode_line("event: update").is_none());
        assert!(decode_line("data: not json").is_none());
        assert!(decode_line("data:").is_none());
        assert!(matches!(
            decode_line(r#"data: {"type":"heartbeat"}"#),
            Some(SessionEvent::Other)
        ));
        assert!(matches!(
            decode_line(r#"data:{"type":"session-updated","sessionId":"s1","data":{}}"#),
            Some(SessionEvent::SessionUpdated { .. })
        ));
    }

    #[tokio::test]
    async fn stream_skips_malformed_and_keeps_going() {
        let raw = byte_stream(vec![
            Ok("data: {\"type\":\"session-updated\",\"sessionId\":\"s1\",\"data\":{}}\n"),
            Ok("data: {broken\n: comment\n"),
            Ok("data: {\"type\":\"session-updated\",\"sessionId\":\"s2\""),
            Ok(",\"data\":{\"active\":true}}\n"),
        ]);
        let events: Vec<_> = SseEventStream::new(raw).collect().await;
        assert_eq!(events.len(), 2);
        let ids: Vec<String> = events
            .into_iter()
            .map(|e| match e.unwrap() {
                SessionEvent::SessionUpdated { session_id, .. } => session_id.to_string(),
                SessionEvent::Other => "other".into(),
            })
            .collect();
        assert_eq!(ids, vec!["s1", "s2"]);
    }

    #[tokio::test]
    async fn trailing_line_without_newline_is_decoded() {
        let raw = byte_stream(vec![Ok(
            "data: {\"type\":\"session-updated\",\"sessionId\":\"s1\",\"data\":{}}",
        )]);
        let events: Vec<_> = SseEventStream::new(raw).collect().await;
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn transport_errors_pass_through() {
        let raw = byte_stream(vec![
            Ok("data: {\"type\":\"x\"}\n"),
            Err(RelayError::StreamInterrupted("reset".into())),
        ]);
        let mut events = SseEventStream::new(raw);
        assert!(matches!(events.next().await, Some(Ok(SessionEvent::Other))));
        assert!(matches!(
            events.next().await,
            Some(Err(RelayError::StreamInterrupted(_)))
        ));
        assert!(events.next().await.is_none());
    }
}
