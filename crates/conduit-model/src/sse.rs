// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Generic Server-Sent Events frame parser, independent of any provider's
//! wire format. Provider adapters parse `data:` JSON payloads directly
//! (see `openai_compat.rs`, `anthropic.rs`) since none of them rely on a
//! named `event:` field; this parser implements the full SSE state machine
//! for callers that need it (and for testing the parser itself against the
//! generic contract, since the provider adapters only exercise their own
//! narrower subset).

/// One parsed SSE frame: an optional event name and its (possibly
/// multi-line) data payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE parser. Feed it chunks as they arrive over the wire with
/// [`SseParser::feed`]; call [`SseParser::finish`] at EOF to flush any
/// trailing frame that was never terminated by a blank line.
#[derive(Debug, Default)]
pub struct SseParser {
    buf: String,
    pending_event: Option<String>,
    pending_data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of raw bytes (already UTF-8 decoded) and return every
    /// complete frame and every non-recognised, non-blank line it produced.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buf.push_str(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line = self.buf[..pos].trim_end_matches('\r').to_string();
            self.buf.drain(..=pos);
            if let Some(event) = self.consume_line(&line) {
                out.push(event);
            }
        }
        out
    }

    /// Flush any pending buffered frame. Call once at EOF; any line still
    /// queued in the line buffer (never terminated by `\n`) is ignored, as
    /// the transport layer is expected to deliver complete lines.
    pub fn finish(mut self) -> Option<SseEvent> {
        self.flush_pending()
    }

    fn consume_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.flush_pending();
        }
        if let Some(rest) = line.strip_prefix("event:") {
            self.pending_event = Some(rest.trim_start().to_string());
            None
        } else if let Some(rest) = line.strip_prefix("data:") {
            self.pending_data.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
            None
        } else if line.starts_with(':') {
            None
        } else {
            Some(SseEvent { event: None, data: line.to_string() })
        }
    }

    fn flush_pending(&mut self) -> Option<SseEvent> {
        if self.pending_data.is_empty() {
            self.pending_event = None;
            return None;
        }
        let data = self.pending_data.join("\n");
        self.pending_data.clear();
        let event = self.pending_event.take();
        if data == "[DONE]" {
            return None;
        }
        Some(SseEvent { event, data })
    }
}

/// Parse a complete, already fully-buffered SSE body in one call.
pub fn parse_sse(body: &str) -> Vec<SseEvent> {
    let mut parser = SseParser::new();
    let mut out = parser.feed(body);
    if let Some(tail) = parser.finish() {
        out.push(tail);
    }
    out
}

/// Serialise events back into wire format, inverse of [`parse_sse`] for
/// event sequences without a `[DONE]` payload (which `parse_sse` discards
/// and therefore cannot round-trip).
pub fn serialise_sse(events: &[SseEvent]) -> String {
    let mut out = String::new();
    for ev in events {
        if let Some(name) = &ev.event {
            out.push_str("event: ");
            out.push_str(name);
            out.push('\n');
        }
        for line in ev.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_data_line_yields_one_event() {
        let events = parse_sse("data: hello\n\n");
        assert_eq!(events, vec![SseEvent { event: None, data: "hello".to_string() }]);
    }

    #[test]
    fn multi_line_data_is_joined_with_newlines() {
        let events = parse_sse("event: test\ndata: line1\ndata: line2\ndata: line3\n\n");
        assert_eq!(
            events,
            vec![SseEvent { event: Some("test".to_string()), data: "line1\nline2\nline3".to_string() }]
        );
    }

    #[test]
    fn comment_lines_are_discarded() {
        let events = parse_sse(": keep-alive\ndata: hi\n\n");
        assert_eq!(events, vec![SseEvent { event: None, data: "hi".to_string() }]);
    }

    #[test]
    fn done_marker_is_discarded() {
        let events = parse_sse("data: [DONE]\n\n");
        assert!(events.is_empty());
    }

    #[test]
    fn unrecognised_line_is_yielded_immediately() {
        let events = parse_sse("retry: 1000\n");
        assert_eq!(events, vec![SseEvent { event: None, data: "retry: 1000".to_string() }]);
    }

    #[test]
    fn eof_flushes_pending_frame_without_trailing_blank_line() {
        let mut parser = SseParser::new();
        let mid = parser.feed("data: partial\n");
        assert!(mid.is_empty());
        let tail = parser.finish();
        assert_eq!(tail, Some(SseEvent { event: None, data: "partial".to_string() }));
    }

    #[test]
    fn feed_can_be_called_across_multiple_chunks() {
        let mut parser = SseParser::new();
        let mut events = parser.feed("data: hel");
        events.extend(parser.feed("lo\n\n"));
        assert_eq!(events, vec![SseEvent { event: None, data: "hello".to_string() }]);
    }

    // Testable property 2: exactly one terminal frame per well-formed,
    // blank-line-delimited sequence — no frame is split or merged.
    #[test]
    fn property_one_frame_per_blank_line_delimited_block() {
        let events = parse_sse("data: a\n\ndata: b\n\ndata: c\n\n");
        assert_eq!(events.len(), 3);
    }

    // Testable property 7: parse(serialise(events)) == events for any event
    // sequence without [DONE] payloads.
    #[test]
    fn property_parse_serialise_round_trip() {
        let events = vec![
            SseEvent { event: Some("message".to_string()), data: "line1\nline2".to_string() },
            SseEvent { event: None, data: "plain".to_string() },
            SseEvent { event: Some("ping".to_string()), data: "".to_string() },
        ];
        let wire = serialise_sse(&events);
        assert_eq!(parse_sse(&wire), events);
    }

    #[test]
    fn property_round_trip_holds_for_many_generated_sequences() {
        let candidates: Vec<Vec<SseEvent>> = vec![
            vec![SseEvent { event: None, data: "x".to_string() }],
            vec![
                SseEvent { event: Some("a".to_string()), data: "1".to_string() },
                SseEvent { event: Some("b".to_string()), data: "2\n3".to_string() },
            ],
            vec![],
        ];
        for events in candidates {
            let wire = serialise_sse(&events);
            assert_eq!(parse_sse(&wire), events);
        }
    }
}
