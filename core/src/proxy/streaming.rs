//! Incremental text extraction from a streamed Gemini body
//!
//! The upstream body arrives as arbitrary byte chunks that do not line up
//! with JSON boundaries. Rather than parse full events, the decoder scans
//! for `"text": "<string>"` fields and emits each one as soon as its closing
//! quote has arrived.

use std::fmt::Display;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

static TEXT_FIELD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""text"\s*:\s*"((?:[^"\\]|\\.)*)""#).expect("text field pattern is valid")
});

/// Prompt-level block, or a candidate finished by a content filter.
static BLOCK_MARKER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#""blockReason"\s*:\s*"[A-Z_]+"|"finishReason"\s*:\s*"(?:SAFETY|PROHIBITED_CONTENT|BLOCKLIST|SPII|RECITATION)""#,
    )
    .expect("block marker pattern is valid")
});

const TEXT_KEY: &str = "\"text\"";

/// Enough trailing text to catch a block marker split across chunks.
const MARKER_TAIL_BYTES: usize = 64;

const CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Error, PartialEq)]
#[error("upstream stream failed: {0}")]
pub struct StreamError(pub String);

/// Decoded fragments in arrival order.
pub type FragmentStream = ReceiverStream<Result<String, StreamError>>;

#[derive(Debug, Default)]
pub struct ChunkDecoder {
    /// Decoded text not yet consumed by a complete match.
    buffer: String,
    /// Trailing bytes of an incomplete UTF-8 sequence.
    pending: Vec<u8>,
    /// Recent decoded text kept only for block marker detection.
    marker_tail: String,
    blocked: bool,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one chunk and return every text value completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let decoded = take_utf8(&mut self.pending);
        self.scan_block_marker(&decoded);
        self.buffer.push_str(&decoded);

        let mut fragments = Vec::new();
        let mut consumed = 0;

        for caps in TEXT_FIELD_RE.captures_iter(&self.buffer) {
            let (Some(whole), Some(raw)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            consumed = whole.end();
            match unescape(raw.as_str()) {
                Some(text) if !text.is_empty() => fragments.push(text),
                Some(_) => {}
                None => tracing::debug!("Skipping undecodable text field ({} bytes)", raw.len()),
            }
        }

        self.buffer.drain(..consumed);
        self.compact();
        fragments
    }

    /// Whether the upstream reported a content-filter block so far.
    pub fn blocked(&self) -> bool {
        self.blocked
    }

    fn scan_block_marker(&mut self, decoded: &str) {
        if self.blocked {
            return;
        }
        self.marker_tail.push_str(decoded);
        if BLOCK_MARKER_RE.is_match(&self.marker_tail) {
            self.blocked = true;
            self.marker_tail.clear();
            return;
        }
        let mut idx = self.marker_tail.len().saturating_sub(MARKER_TAIL_BYTES);
        while !self.marker_tail.is_char_boundary(idx) {
            idx += 1;
        }
        self.marker_tail.drain(..idx);
    }

    /// Drop everything that cannot be part of a future match.
    fn compact(&mut self) {
        let keep_from = match self.buffer.rfind(TEXT_KEY) {
            Some(pos) => pos,
            None => {
                // A key may be split across chunks: keep a tail shorter than it.
                let mut idx = self.buffer.len().saturating_sub(TEXT_KEY.len() - 1);
                while !self.buffer.is_char_boundary(idx) {
                    idx += 1;
                }
                idx
            }
        };
        self.buffer.drain(..keep_from);
    }

    #[cfg(test)]
    fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Split off the longest valid UTF-8 prefix, leaving an incomplete trailing
/// sequence in `pending`. Invalid bytes are replaced.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(s) => {
            let s = s.to_string();
            pending.clear();
            s
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let s = String::from_utf8_lossy(&pending[..valid]).into_owned();
            pending.drain(..valid);
            s
        }
        Err(_) => {
            let s = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            s
        }
    }
}

/// Decode a JSON string body (without the surrounding quotes).
fn unescape(raw: &str) -> Option<String> {
    serde_json::from_str::<String>(&format!("\"{}\"", raw)).ok()
}

/// Decode `upstream` on a background task and hand fragments over a channel.
///
/// The task stops reading and drops `upstream` as soon as the receiving side
/// goes away. An upstream error is forwarded only if nothing was emitted yet;
/// after partial output the stream just ends. A stream that ends without text
/// but with a block marker yields `blocked_reply` instead.
pub fn spawn_decoder<S, E>(trace_id: String, upstream: S, blocked_reply: Option<String>) -> FragmentStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: Display + Send + 'static,
{
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut upstream = upstream;
        let mut decoder = ChunkDecoder::new();
        let mut emitted = 0usize;

        loop {
            let next = tokio::select! {
                _ = tx.closed() => {
                    tracing::info!("[{}] Client disconnected, releasing upstream stream", trace_id);
                    break;
                }
                next = upstream.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    for fragment in decoder.feed(&chunk) {
                        if tx.send(Ok(fragment)).await.is_err() {
                            tracing::info!("[{}] Client disconnected mid-stream", trace_id);
                            return;
                        }
                        emitted += 1;
                    }
                }
                Some(Err(e)) => {
                    if emitted == 0 {
                        tracing::error!("[{}] Upstream stream failed before any output: {}", trace_id, e);
                        let _ = tx.send(Err(StreamError(e.to_string()))).await;
                    } else {
                        tracing::warn!("[{}] Upstream stream ended with error after {} fragments: {}", trace_id, emitted, e);
                    }
                    break;
                }
                None => {
                    if emitted == 0 && decoder.blocked() {
                        if let Some(reply) = blocked_reply {
                            tracing::warn!("[{}] Streamed reply withheld by content filter", trace_id);
                            let _ = tx.send(Ok(reply)).await;
                        }
                    }
                    break;
                }
            }
        }

        tracing::debug!("[{}] Stream finished ({} fragments)", trace_id, emitted);
    });

    ReceiverStream::new(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use pretty_assertions::assert_eq;
    use std::io;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[test]
    fn field_split_across_chunks() {
        let mut decoder = ChunkDecoder::new();
        assert!(decoder.feed(br#"{"text": "Hel"#).is_empty());
        assert_eq!(decoder.feed(br#"lo"}"#), vec!["Hello".to_string()]);
    }

    #[test]
    fn key_split_across_chunks() {
        let mut decoder = ChunkDecoder::new();
        assert!(decoder.feed(br#"{"parts":[{"te"#).is_empty());
        assert_eq!(decoder.feed(br#"xt":"oi"}]}"#), vec!["oi".to_string()]);
    }

    #[test]
    fn several_fields_in_one_chunk() {
        let mut decoder = ChunkDecoder::new();
        let chunk = concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"A\"}]}}]}\n\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"B\"}]}}]}\n\n",
        );
        assert_eq!(decoder.feed(chunk.as_bytes()), vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn unescapes_values() {
        let mut decoder = ChunkDecoder::new();
        let out = decoder.feed(r#"{"text": "linha 1\nele disse \"oi\" á"}"#.as_bytes());
        assert_eq!(out, vec!["linha 1\nele disse \"oi\" á".to_string()]);
    }

    #[test]
    fn escaped_quote_split_across_chunks() {
        let mut decoder = ChunkDecoder::new();
        assert!(decoder.feed(br#"{"text": "say \"#).is_empty());
        assert!(decoder.feed(br#""hi\"#).is_empty());
        assert_eq!(decoder.feed(br#"""}"#), vec!["say \"hi\"".to_string()]);
    }

    #[test]
    fn multibyte_char_split_across_chunks() {
        let bytes = "{\"text\": \"olá\"}".as_bytes();
        let split = bytes.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut decoder = ChunkDecoder::new();
        assert!(decoder.feed(&bytes[..split]).is_empty());
        assert_eq!(decoder.feed(&bytes[split..]), vec!["olá".to_string()]);
    }

    #[test]
    fn bad_escape_skips_only_that_field() {
        let mut decoder = ChunkDecoder::new();
        let out = decoder.feed(br#"{"text": "bad \q"}{"text": "good"}"#);
        assert_eq!(out, vec!["good".to_string()]);
    }

    #[test]
    fn buffer_stays_small_without_text_fields() {
        let mut decoder = ChunkDecoder::new();
        let noise = format!("{{\"inlineData\": \"{}\"}}", "A".repeat(10_000));
        assert!(decoder.feed(noise.as_bytes()).is_empty());
        assert!(decoder.buffered() < TEXT_KEY.len());
        assert_eq!(decoder.feed(br#"{"text":"ok"}"#), vec!["ok".to_string()]);
    }

    #[test]
    fn detects_block_marker_split_across_chunks() {
        let mut decoder = ChunkDecoder::new();
        assert!(decoder.feed(br#"data: {"promptFeedback": {"blockRea"#).is_empty());
        assert!(!decoder.blocked());
        assert!(decoder.feed(br#"son": "SAFETY"}}"#).is_empty());
        assert!(decoder.blocked());
    }

    #[test]
    fn normal_finish_is_not_a_block() {
        let mut decoder = ChunkDecoder::new();
        decoder.feed(br#"{"candidates":[{"content":{"parts":[{"text":"oi"}]},"finishReason":"STOP"}]}"#);
        assert!(!decoder.blocked());
    }

    fn chunks(parts: &[&'static str]) -> Vec<Result<Bytes, io::Error>> {
        parts.iter().map(|p| Ok(Bytes::from_static(p.as_bytes()))).collect()
    }

    async fn collect(stream: FragmentStream) -> Vec<Result<String, StreamError>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn channel_forwards_fragments_in_order() {
        let upstream = stream::iter(chunks(&[r#"{"text": "Hel"#, r#"lo"}, {"text": " world"}"#]));
        let out = collect(spawn_decoder("t".to_string(), upstream, None)).await;
        assert_eq!(out, vec![Ok("Hello".to_string()), Ok(" world".to_string())]);
    }

    #[tokio::test]
    async fn error_before_output_is_forwarded_once() {
        let mut items = chunks(&[r#"{"candidates": ["#]);
        items.push(Err(io::Error::new(io::ErrorKind::Other, "reset")));
        items.push(Err(io::Error::new(io::ErrorKind::Other, "again")));
        let out = collect(spawn_decoder("t".to_string(), stream::iter(items), None)).await;
        assert_eq!(out, vec![Err(StreamError("reset".to_string()))]);
    }

    #[tokio::test]
    async fn error_after_output_ends_cleanly() {
        let mut items = chunks(&[r#"{"text": "parcial"}"#]);
        items.push(Err(io::Error::new(io::ErrorKind::Other, "reset")));
        let out = collect(spawn_decoder("t".to_string(), stream::iter(items), None)).await;
        assert_eq!(out, vec![Ok("parcial".to_string())]);
    }

    #[tokio::test]
    async fn blocked_stream_without_text_yields_blocked_reply() {
        let upstream = stream::iter(chunks(&[
            r#"data: {"candidates":[{"finishReason":"SAFETY","index":0}]}"#,
        ]));
        let out = collect(spawn_decoder("t".to_string(), upstream, Some("desculpe".to_string()))).await;
        assert_eq!(out, vec![Ok("desculpe".to_string())]);
    }

    #[tokio::test]
    async fn blocked_reply_not_added_after_text() {
        let upstream = stream::iter(chunks(&[
            r#"data: {"candidates":[{"content":{"parts":[{"text":"parte"}]}}]}"#,
            r#"data: {"candidates":[{"finishReason":"SAFETY"}]}"#,
        ]));
        let out = collect(spawn_decoder("t".to_string(), upstream, Some("desculpe".to_string()))).await;
        assert_eq!(out, vec![Ok("parte".to_string())]);
    }

    #[tokio::test]
    async fn dropping_the_receiver_releases_upstream() {
        let (dropped_tx, dropped_rx) = oneshot::channel::<()>();
        let upstream = stream::iter(chunks(&[r#"{"text": "a"}"#]))
            .chain(stream::pending())
            .map(move |item| {
                let _guard = &dropped_tx;
                item
            });

        let mut fragments = spawn_decoder("t".to_string(), upstream, None);
        assert_eq!(fragments.next().await, Some(Ok("a".to_string())));
        drop(fragments);

        let released = tokio::time::timeout(Duration::from_secs(2), dropped_rx)
            .await
            .expect("upstream was not released");
        assert!(released.is_err());
    }
}
