use serde_json::Value;

use chorus_core::errors::StreamError;
use chorus_core::stream::StreamEvent;

/// Sentinel payload that terminates a completion stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// One blank-line delimited SSE frame.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// State machine turning SSE frames into [`StreamEvent`]s. Everything after
/// the first terminal event is ignored.
#[derive(Debug, Default)]
pub struct SseParser {
    finished: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Parse a single frame. Keep-alives and empty frames yield nothing.
    pub fn parse_frame(&mut self, frame: &SseFrame) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        let data = frame.data.trim();
        if data.is_empty() {
            return None;
        }
        if data == DONE_SENTINEL {
            self.finished = true;
            return Some(StreamEvent::Done);
        }

        let event = match serde_json::from_str::<Value>(data) {
            Ok(value) => classify_payload(frame.event.as_deref(), &value),
            Err(e) => StreamEvent::Error {
                error: StreamError::Protocol(format!("unparseable event data: {e}")),
            },
        };

        match &event {
            StreamEvent::Delta { content } if content.is_empty() => return None,
            StreamEvent::Delta { .. } => {}
            _ => self.finished = true,
        }
        Some(event)
    }
}

fn classify_payload(event: Option<&str>, value: &Value) -> StreamEvent {
    if let Some(err) = value.get("error") {
        let message = match err {
            Value::String(s) => s.clone(),
            Value::Object(obj) => obj
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("upstream error")
                .to_string(),
            other => other.to_string(),
        };
        return StreamEvent::Error {
            error: StreamError::Upstream(message),
        };
    }
    if event == Some("error") {
        return StreamEvent::Error {
            error: StreamError::Upstream(value.to_string()),
        };
    }
    if let Some(content) = value.get("content").and_then(Value::as_str) {
        return StreamEvent::delta(content);
    }
    // OpenAI-compatible chunk shape.
    if let Some(content) = value
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
    {
        return StreamEvent::delta(content);
    }
    if value.get("done").and_then(Value::as_bool) == Some(true) {
        return StreamEvent::Done;
    }
    StreamEvent::delta("")
}

/// Parse raw SSE text into frames. `data:` lines within one frame are joined
/// with newlines; comment lines (`:`) are skipped.
pub fn parse_sse_frames(raw: &str) -> Vec<SseFrame> {
    let mut frames = Vec::new();
    let mut current = SseFrame::default();
    let mut has_data = false;

    for line in raw.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            if has_data || current.event.is_some() {
                frames.push(std::mem::take(&mut current));
                has_data = false;
            }
            continue;
        }
        if line.starts_with(':') {
            continue;
        }
        if let Some(event) = field(line, "event") {
            current.event = Some(event.to_string());
        } else if let Some(data) = field(line, "data") {
            if has_data {
                current.data.push('\n');
            }
            current.data.push_str(data);
            has_data = true;
        }
    }

    // Trailing frame without blank line
    if has_data || current.event.is_some() {
        frames.push(current);
    }

    frames
}

fn field<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(name)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> SseFrame {
        SseFrame { event: None, data: s.into() }
    }

    #[test]
    fn parse_content_then_done() {
        let mut parser = SseParser::new();
        let e = parser.parse_frame(&data(r#"{"content":"Hel"}"#));
        assert!(matches!(e, Some(StreamEvent::Delta { ref content }) if content == "Hel"));
        let e = parser.parse_frame(&data(r#"{"content":"lo"}"#));
        assert!(matches!(e, Some(StreamEvent::Delta { .. })));
        assert!(matches!(parser.parse_frame(&data("[DONE]")), Some(StreamEvent::Done)));
        assert!(parser.is_finished());
    }

    #[test]
    fn events_after_done_ignored() {
        let mut parser = SseParser::new();
        parser.parse_frame(&data("[DONE]"));
        assert!(parser.parse_frame(&data(r#"{"content":"late"}"#)).is_none());
    }

    #[test]
    fn error_payload_string() {
        let mut parser = SseParser::new();
        let e = parser.parse_frame(&data(r#"{"error":"rate limit"}"#));
        match e {
            Some(StreamEvent::Error { error: StreamError::Upstream(msg) }) => {
                assert_eq!(msg, "rate limit");
            }
            other => panic!("expected upstream error, got {other:?}"),
        }
        assert!(parser.is_finished());
    }

    #[test]
    fn error_payload_object() {
        let mut parser = SseParser::new();
        let e = parser.parse_frame(&data(r#"{"error":{"message":"overloaded","type":"x"}}"#));
        assert!(
            matches!(e, Some(StreamEvent::Error { error: StreamError::Upstream(ref m) }) if m == "overloaded")
        );
    }

    #[test]
    fn openai_chunk_shape() {
        let mut parser = SseParser::new();
        let e = parser.parse_frame(&data(r#"{"choices":[{"delta":{"content":"hey"}}]}"#));
        assert!(matches!(e, Some(StreamEvent::Delta { ref content }) if content == "hey"));
    }

    #[test]
    fn empty_content_skipped() {
        let mut parser = SseParser::new();
        assert!(parser.parse_frame(&data(r#"{"content":""}"#)).is_none());
        assert!(parser.parse_frame(&data(r#"{"role":"assistant"}"#)).is_none());
        assert!(parser.parse_frame(&data("")).is_none());
        assert!(!parser.is_finished());
    }

    #[test]
    fn garbage_is_protocol_error() {
        let mut parser = SseParser::new();
        let e = parser.parse_frame(&data("{not json"));
        assert!(matches!(e, Some(StreamEvent::Error { error: StreamError::Protocol(_) })));
    }

    #[test]
    fn parse_frames_basic() {
        let raw = "data: {\"content\":\"a\"}\n\nevent: error\ndata: {\"x\":1}\n\n: keepalive\n\ndata: [DONE]\n\n";
        let frames = parse_sse_frames(raw);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].data, r#"{"content":"a"}"#);
        assert_eq!(frames[1].event.as_deref(), Some("error"));
        assert_eq!(frames[2].data, "[DONE]");
    }

    #[test]
    fn parse_frames_crlf_and_multiline() {
        let raw = "data: line1\r\ndata: line2\r\n\r\ndata:[DONE]";
        let frames = parse_sse_frames(raw);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, "line1\nline2");
        assert_eq!(frames[1].data, "[DONE]");
    }

    #[test]
    fn named_error_event_without_error_key() {
        let mut parser = SseParser::new();
        let frame = SseFrame { event: Some("error".into()), data: r#"{"detail":"nope"}"#.into() };
        assert!(matches!(parser.parse_frame(&frame), Some(StreamEvent::Error { .. })));
    }
}
