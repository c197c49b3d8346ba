//! Incremental decoding of the newline-delimited JSON generation stream.
//!
//! Chunk boundaries from the transport are arbitrary; lines are only parsed
//! once their terminating `\n` has arrived. Every line is one frame carrying a
//! `response` delta and a `done` flag.

use std::collections::VecDeque;

use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::{debug, warn};

use crate::api::GenerateChunk;
use crate::error::ErrorKind;
use crate::transport::ByteStream;

/// One decoded event, in wire order.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Delta(String),
    Done(Completion),
    Error(ErrorKind),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Delta(_))
    }
}

/// Metadata carried by the final frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    /// Token context to send back with the next prompt of the conversation.
    pub context: Vec<i64>,
    pub done_reason: Option<String>,
    pub total_duration: Option<u64>,
    pub prompt_eval_count: Option<u64>,
    pub eval_count: Option<u64>,
}

impl From<&mut GenerateChunk> for Completion {
    fn from(chunk: &mut GenerateChunk) -> Self {
        Self {
            context: std::mem::take(&mut chunk.context),
            done_reason: chunk.done_reason.take(),
            total_duration: chunk.total_duration,
            prompt_eval_count: chunk.prompt_eval_count,
            eval_count: chunk.eval_count,
        }
    }
}

/// Line buffer for a single stream.
///
/// After a terminal event (`Done` or `Error`) the decoder ignores any further
/// input.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
    finished: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feeds one transport chunk and returns the events it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        self.buffer.extend_from_slice(chunk);

        // Process complete lines delimited by newline
        while let Some(newline_pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            let frame = trim_ascii(&line);
            if frame.is_empty() {
                continue; // keep-alive
            }
            Self::decode_frame(frame, &mut events);
            if events.last().is_some_and(StreamEvent::is_terminal) {
                self.finish_with(&events);
                break;
            }
        }
        events
    }

    /// Signals that the transport closed. Returns the events that closing
    /// produces; the last one is always terminal unless the stream had
    /// already finished.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }

        // A last frame without a trailing newline (typical of non-streaming
        // replies) still counts.
        let residual = std::mem::take(&mut self.buffer);
        let frame = trim_ascii(&residual);
        if !frame.is_empty() {
            match parse_frame(frame) {
                Ok(_) => Self::decode_frame(frame, &mut events),
                Err(e) => debug!(error = %e, "discarding partial frame at stream close"),
            }
        }

        if !events.last().is_some_and(StreamEvent::is_terminal) {
            events.push(StreamEvent::Error(ErrorKind::StreamTruncated));
        }
        self.finish_with(&events);
        events
    }

    /// Terminates the stream after a transport read failure.
    pub fn abort(&mut self) -> StreamEvent {
        self.finished = true;
        self.buffer.clear();
        StreamEvent::Error(ErrorKind::StreamTruncated)
    }

    fn finish_with(&mut self, events: &[StreamEvent]) {
        self.finished = true;
        self.buffer.clear();
        if let Some(StreamEvent::Error(kind)) = events.last() {
            warn!(error = %kind, "generation stream failed");
        }
    }

    fn decode_frame(frame: &[u8], events: &mut Vec<StreamEvent>) {
        let mut chunk = match parse_frame(frame) {
            Ok(chunk) => chunk,
            Err(reason) => {
                events.push(StreamEvent::Error(ErrorKind::MalformedChunk(reason)));
                return;
            }
        };

        if let Some(message) = chunk.error.take() {
            events.push(StreamEvent::Error(ErrorKind::BackendRejected {
                status: None,
                message,
            }));
            return;
        }

        match chunk.done {
            Some(true) => {
                if !chunk.response.is_empty() {
                    events.push(StreamEvent::Delta(std::mem::take(&mut chunk.response)));
                }
                events.push(StreamEvent::Done(Completion::from(&mut chunk)));
            }
            Some(false) => events.push(StreamEvent::Delta(chunk.response)),
            None => events.push(StreamEvent::Error(ErrorKind::MalformedChunk(
                "frame is missing the `done` flag".to_string(),
            ))),
        }
    }
}

fn parse_frame(frame: &[u8]) -> Result<GenerateChunk, String> {
    let text = std::str::from_utf8(frame).map_err(|e| format!("invalid UTF-8: {}", e))?;
    serde_json::from_str::<GenerateChunk>(text)
        .map_err(|e| format!("JSON Decode Error: '{}' on line: '{}'", e, text))
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

struct DecodeState {
    body: Option<ByteStream>,
    decoder: StreamDecoder,
    pending: VecDeque<StreamEvent>,
}

/// Lazily decodes a response body into events.
///
/// The sequence ends right after its first terminal event, and the body is
/// dropped (releasing the connection) as soon as that event is produced.
pub fn decode_stream(body: ByteStream) -> BoxStream<'static, StreamEvent> {
    let state = DecodeState {
        body: Some(body),
        decoder: StreamDecoder::new(),
        pending: VecDeque::new(),
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((event, state));
            }
            let body = state.body.as_mut()?;
            let events = match body.next().await {
                Some(Ok(bytes)) => state.decoder.feed(&bytes),
                Some(Err(e)) => {
                    warn!(error = %e, "stream read failed");
                    vec![state.decoder.abort()]
                }
                None => state.decoder.finish(),
            };
            if state.decoder.is_finished() {
                state.body = None;
            }
            state.pending.extend(events);
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use bytes::Bytes;

    fn body(chunks: &[&str]) -> ByteStream {
        let items: Vec<Result<Bytes, TransportError>> = chunks
            .iter()
            .map(|c| Ok(Bytes::from(c.to_string())))
            .collect();
        futures::stream::iter(items).boxed()
    }

    async fn decode_all(chunks: &[&str]) -> Vec<StreamEvent> {
        decode_stream(body(chunks)).collect().await
    }

    fn delta(text: &str) -> StreamEvent {
        StreamEvent::Delta(text.to_string())
    }

    #[tokio::test]
    async fn deltas_then_done_in_arrival_order() {
        let events = decode_all(&[
            "{\"response\":\"Hi\",\"done\":false}\n",
            "{\"response\":\" there\",\"done\":false}\n{\"response\":\"!\",\"done\":false}\n",
            "{\"response\":\"\",\"done\":true,\"context\":[1,2],\"eval_count\":3}\n",
        ])
        .await;

        assert_eq!(events.len(), 4);
        assert_eq!(&events[..3], &[delta("Hi"), delta(" there"), delta("!")]);
        match &events[3] {
            StreamEvent::Done(completion) => {
                assert_eq!(completion.context, vec![1, 2]);
                assert_eq!(completion.eval_count, Some(3));
            }
            other => panic!("expected Done, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn frames_split_across_chunks_are_reassembled() {
        let events = decode_all(&[
            "{\"respon",
            "se\":\"Hel",
            "lo\",\"done\":false}\n{\"response\":\"\",",
            "\"done\":true}\n",
        ])
        .await;
        assert_eq!(events[0], delta("Hello"));
        assert!(matches!(events[1], StreamEvent::Done(_)));
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn multibyte_characters_split_across_chunks_survive() {
        let line = "{\"response\":\"caf\u{e9} \u{1f600}\",\"done\":true}\n";
        let bytes = line.as_bytes();
        let split = line.find('\u{1f600}').unwrap() + 2;
        let items: Vec<Result<Bytes, TransportError>> = vec![
            Ok(Bytes::copy_from_slice(&bytes[..split])),
            Ok(Bytes::copy_from_slice(&bytes[split..])),
        ];
        let events: Vec<StreamEvent> =
            decode_stream(futures::stream::iter(items).boxed()).collect().await;
        assert_eq!(events[0], delta("caf\u{e9} \u{1f600}"));
    }

    #[tokio::test]
    async fn final_frame_text_is_emitted_before_done() {
        let events = decode_all(&[
            "{\"response\":\"Hi\",\"done\":false}\n{\"response\":\" there\",\"done\":true}\n",
        ])
        .await;
        assert_eq!(events[0], delta("Hi"));
        assert_eq!(events[1], delta(" there"));
        assert!(matches!(events[2], StreamEvent::Done(_)));
    }

    #[tokio::test]
    async fn keep_alive_newlines_are_skipped() {
        let events = decode_all(&[
            "\n\r\n",
            "{\"response\":\"a\",\"done\":false}\n\n\n",
            "{\"response\":\"\",\"done\":true}\n",
        ])
        .await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], delta("a"));
    }

    #[tokio::test]
    async fn bytes_after_done_are_ignored() {
        let events = decode_all(&[
            "{\"response\":\"a\",\"done\":true}\n{\"response\":\"late\",\"done\":false}\n",
            "not even json\n",
        ])
        .await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events.last(), Some(StreamEvent::Done(_))));
    }

    #[tokio::test]
    async fn malformed_line_terminates_the_stream() {
        let events = decode_all(&[
            "{\"response\":\"a\",\"done\":false}\n{broken\n",
            "{\"response\":\"b\",\"done\":true}\n",
        ])
        .await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], delta("a"));
        assert!(matches!(
            events[1],
            StreamEvent::Error(ErrorKind::MalformedChunk(_))
        ));
    }

    #[tokio::test]
    async fn missing_done_flag_is_malformed() {
        let events = decode_all(&["{\"response\":\"a\"}\n"]).await;
        assert!(matches!(
            events[0],
            StreamEvent::Error(ErrorKind::MalformedChunk(_))
        ));
    }

    #[tokio::test]
    async fn close_without_done_is_truncated() {
        let events = decode_all(&["{\"response\":\"a\",\"done\":false}\n"]).await;
        assert_eq!(events[0], delta("a"));
        assert_eq!(events[1], StreamEvent::Error(ErrorKind::StreamTruncated));

        let events = decode_all(&[]).await;
        assert_eq!(events, vec![StreamEvent::Error(ErrorKind::StreamTruncated)]);
    }

    #[tokio::test]
    async fn partial_frame_at_close_is_truncated() {
        let events = decode_all(&["{\"response\":\"a\",\"done\":false}\n{\"respo"]).await;
        assert_eq!(events.last(), Some(&StreamEvent::Error(ErrorKind::StreamTruncated)));
    }

    #[tokio::test]
    async fn unterminated_final_object_completes() {
        // stream=false replies carry a single object, often without a newline
        let events = decode_all(&["{\"response\":\"whole answer\",\"done\":true}"]).await;
        assert_eq!(events[0], delta("whole answer"));
        assert!(matches!(events[1], StreamEvent::Done(_)));
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn error_frame_is_backend_rejection() {
        let events = decode_all(&["{\"error\":\"model 'x' not found\"}\n"]).await;
        assert_eq!(
            events,
            vec![StreamEvent::Error(ErrorKind::BackendRejected {
                status: None,
                message: "model 'x' not found".to_string(),
            })]
        );
    }

    #[tokio::test]
    async fn read_failure_is_truncation() {
        let items: Vec<Result<Bytes, TransportError>> = vec![
            Ok(Bytes::from_static(b"{\"response\":\"a\",\"done\":false}\n")),
            Err(TransportError::Body("connection reset".into())),
            Ok(Bytes::from_static(b"{\"response\":\"b\",\"done\":true}\n")),
        ];
        let events: Vec<StreamEvent> =
            decode_stream(futures::stream::iter(items).boxed()).collect().await;
        assert_eq!(
            events,
            vec![delta("a"), StreamEvent::Error(ErrorKind::StreamTruncated)]
        );
    }

    #[test]
    fn feed_returns_nothing_until_a_line_completes() {
        let mut decoder = StreamDecoder::new();
        assert!(decoder.feed(b"{\"response\":\"x\",").is_empty());
        assert_eq!(decoder.feed(b"\"done\":false}\n"), vec![delta("x")]);
        assert!(!decoder.is_finished());
        assert!(matches!(
            decoder.feed(b"{\"response\":\"\",\"done\":true}\n").as_slice(),
            [StreamEvent::Done(_)]
        ));
        assert!(decoder.is_finished());
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn trims_carriage_returns() {
        assert_eq!(trim_ascii(b"  {}\r\n"), b"{}");
        assert_eq!(trim_ascii(b"\r\n"), b"");
    }
}
