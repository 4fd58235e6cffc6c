//! Metered relay of streaming responses.
//!
//! The upstream body is passed to the caller chunk by chunk while an
//! [`SseUsageTracker`] parses events on the side. When the stream ends the
//! [`StreamFinalizer`] runs exactly once with what was observed:
//!
//! - upstream finished: [`StreamEnd::Completed`]
//! - upstream failed mid-stream: [`StreamEnd::Error`]
//! - caller went away and the body was dropped: [`StreamEnd::Aborted`], from a
//!   spawned task

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use bytes::{Bytes, BytesMut};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::Value;

use crate::providers::{ObservedUsage, ProviderAdapter};

const SSE_USAGE_TRACKER_MAX_BUFFER_BYTES: usize = 512 * 1024;
const SSE_USAGE_TRACKER_TAIL_BYTES: usize = 128 * 1024;

/// How a relayed stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The upstream body ended normally.
    Completed,
    /// The upstream body failed part way.
    Error,
    /// The caller stopped reading.
    Aborted,
}

/// Bills (or releases) a call once its stream is over.
#[async_trait]
pub trait StreamFinalizer: Send + 'static {
    /// Consumes the finalizer.
    async fn finalize(self: Box<Self>, usage: ObservedUsage, end: StreamEnd);
}

/// Incremental SSE parser feeding a provider adapter.
#[derive(Debug)]
pub struct SseUsageTracker {
    adapter: Arc<dyn ProviderAdapter>,
    buffer: BytesMut,
    usage: ObservedUsage,
}

impl SseUsageTracker {
    /// A tracker interpreting events with `adapter`.
    #[must_use]
    pub fn new(adapter: Arc<dyn ProviderAdapter>) -> Self {
        Self {
            adapter,
            buffer: BytesMut::new(),
            usage: ObservedUsage::default(),
        }
    }

    /// Feeds one chunk of the body.
    pub fn ingest(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);

        while let Some((pos, delimiter_len)) = find_sse_delimiter(self.buffer.as_ref()) {
            let event_bytes = self.buffer.split_to(pos);
            let _ = self.buffer.split_to(delimiter_len);
            self.observe_event(&event_bytes);
        }

        if self.buffer.len() > SSE_USAGE_TRACKER_MAX_BUFFER_BYTES {
            let keep_from = self
                .buffer
                .len()
                .saturating_sub(SSE_USAGE_TRACKER_TAIL_BYTES);
            self.buffer = self.buffer.split_off(keep_from);
        }
    }

    /// Usage observed so far. A trailing event without its blank line is
    /// still counted.
    #[must_use]
    pub fn observed(&self) -> ObservedUsage {
        let mut usage = self.usage;
        if let Some(data) = extract_sse_data(self.buffer.as_ref()) {
            if let Ok(event) = serde_json::from_slice::<Value>(trim_ascii_whitespace(&data)) {
                self.adapter.observe(&event, &mut usage);
            }
        }
        usage
    }

    fn observe_event(&mut self, event: &[u8]) {
        let Some(data) = extract_sse_data(event) else {
            return;
        };
        let trimmed = trim_ascii_whitespace(&data);
        if trimmed == b"[DONE]" || !(trimmed.starts_with(b"{") || trimmed.starts_with(b"[")) {
            return;
        }
        match serde_json::from_slice::<Value>(trimmed) {
            Ok(event) => self.adapter.observe(&event, &mut self.usage),
            Err(err) => tracing::debug!(error = %err, "Skipping unparseable stream event"),
        }
    }
}

fn find_sse_delimiter(buf: &[u8]) -> Option<(usize, usize)> {
    // Single forward scan: mixed newline styles split at the earliest boundary.
    let mut idx = 0usize;
    while idx + 1 < buf.len() {
        if buf[idx] == b'\n' && buf[idx + 1] == b'\n' {
            return Some((idx, 2));
        }
        if idx + 3 < buf.len() && &buf[idx..idx + 4] == b"\r\n\r\n" {
            return Some((idx, 4));
        }
        idx += 1;
    }
    None
}

fn extract_sse_data(event: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::<u8>::new();
    for line in event.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(rest) = line.strip_prefix(b"data:") else {
            continue;
        };
        let rest = trim_ascii_whitespace(rest);
        if rest.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(b'\n');
        }
        out.extend_from_slice(rest);
    }
    (!out.is_empty()).then_some(out)
}

fn trim_ascii_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |pos| pos + 1);
    &bytes[start..end]
}

type UpstreamStream = BoxStream<'static, Result<Bytes, std::io::Error>>;

struct MeteredStreamState {
    upstream: UpstreamStream,
    tracker: SseUsageTracker,
    finalizer: Option<Box<dyn StreamFinalizer>>,
}

impl MeteredStreamState {
    async fn finalize(&mut self, end: StreamEnd) {
        let Some(finalizer) = self.finalizer.take() else {
            return;
        };
        finalizer.finalize(self.tracker.observed(), end).await;
    }
}

impl Drop for MeteredStreamState {
    fn drop(&mut self) {
        let Some(finalizer) = self.finalizer.take() else {
            return;
        };
        let observed = self.tracker.observed();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(finalizer.finalize(observed, StreamEnd::Aborted));
            }
            Err(_) => {
                tracing::error!(?observed, "Stream dropped outside the runtime; call left unbilled");
            }
        }
    }
}

/// Wraps an upstream byte stream so it is metered as it is relayed.
pub fn metered_body<S, E>(
    upstream: S,
    adapter: Arc<dyn ProviderAdapter>,
    finalizer: Box<dyn StreamFinalizer>,
) -> Body
where
    S: futures_util::Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let state = MeteredStreamState {
        upstream: upstream.map(|chunk| chunk.map_err(std::io::Error::other)).boxed(),
        tracker: SseUsageTracker::new(adapter),
        finalizer: Some(finalizer),
    };

    let stream = futures_util::stream::try_unfold(state, |mut state| async move {
        match state.upstream.next().await {
            Some(Ok(chunk)) => {
                state.tracker.ingest(&chunk);
                Ok(Some((chunk, state)))
            }
            Some(Err(err)) => {
                tracing::warn!(error = %err, "Upstream stream failed");
                state.finalize(StreamEnd::Error).await;
                Err(err)
            }
            None => {
                state.finalize(StreamEnd::Completed).await;
                Ok(None)
            }
        }
    });

    Body::from_stream(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{OpenAi, ProviderEndpoint};
    use axum::body::to_bytes;
    use tokio::sync::mpsc;

    fn openai() -> Arc<dyn ProviderAdapter> {
        Arc::new(OpenAi::new(ProviderEndpoint {
            base_url: "https://api.openai.com".into(),
            api_key: "sk".into(),
        }))
    }

    struct Capture(mpsc::UnboundedSender<(ObservedUsage, StreamEnd)>);

    #[async_trait]
    impl StreamFinalizer for Capture {
        async fn finalize(self: Box<Self>, usage: ObservedUsage, end: StreamEnd) {
            let _ = self.0.send((usage, end));
        }
    }

    const CHAT_STREAM: &str = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\r\n\r\n",
        "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":9,\"completion_tokens\":2}}\n\n",
        "data: [DONE]\n\n",
    );

    #[test]
    fn tracker_handles_split_events() {
        let mut tracker = SseUsageTracker::new(openai());
        for piece in CHAT_STREAM.as_bytes().chunks(7) {
            tracker.ingest(piece);
        }
        let usage = tracker.observed();
        assert_eq!(usage.text_chars, 5);
        assert_eq!(usage.input_tokens, Some(9));
        assert_eq!(usage.output_tokens, Some(2));
    }

    #[test]
    fn oversized_buffer_keeps_tail() {
        let mut tracker = SseUsageTracker::new(openai());
        tracker.ingest(&vec![b'x'; SSE_USAGE_TRACKER_MAX_BUFFER_BYTES + 1]);
        assert_eq!(tracker.buffer.len(), SSE_USAGE_TRACKER_TAIL_BYTES);
    }

    #[tokio::test]
    async fn completed_stream_finalizes_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let chunks: Vec<Result<Bytes, std::io::Error>> =
            vec![Ok(Bytes::from_static(CHAT_STREAM.as_bytes()))];
        let body = metered_body(
            futures_util::stream::iter(chunks),
            openai(),
            Box::new(Capture(tx)),
        );
        let relayed = to_bytes(body, usize::MAX).await.unwrap();
        assert_eq!(relayed, CHAT_STREAM.as_bytes());

        let (usage, end) = rx.recv().await.unwrap();
        assert_eq!(end, StreamEnd::Completed);
        assert_eq!(usage.output_tokens, Some(2));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn upstream_error_is_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"abcd\"}}]}\n\n")),
            Err(std::io::Error::other("connection reset")),
        ];
        let body = metered_body(
            futures_util::stream::iter(chunks),
            openai(),
            Box::new(Capture(tx)),
        );
        assert!(to_bytes(body, usize::MAX).await.is_err());
        let (usage, end) = rx.recv().await.unwrap();
        assert_eq!(end, StreamEnd::Error);
        assert_eq!(usage.text_chars, 4);
    }

    #[tokio::test]
    async fn dropped_body_finalizes_as_aborted() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![Ok(Bytes::from_static(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n",
        ))];
        let never_ends = futures_util::stream::iter(chunks).chain(futures_util::stream::pending());
        let body = metered_body(never_ends, openai(), Box::new(Capture(tx)));

        let mut data = body.into_data_stream();
        let first = data.next().await.unwrap().unwrap();
        assert!(!first.is_empty());
        drop(data);

        let (usage, end) = rx.recv().await.unwrap();
        assert_eq!(end, StreamEnd::Aborted);
        assert_eq!(usage.text_chars, 7);
    }
}
