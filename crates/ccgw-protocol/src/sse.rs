use bytes::Bytes;

/// One parsed server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    /// The OpenAI stream terminator frame.
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Incremental SSE parser. Feed it upstream chunks as they arrive; complete
/// events come back as soon as their blank-line terminator is seen.
#[derive(Debug, Default)]
pub struct SseParser {
    pending: String,
    event_name: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &Bytes) -> Vec<SseEvent> {
        // Invalid UTF-8 mid-chunk would only happen on a split multi-byte
        // sequence; lossy decoding keeps the stream moving.
        let text = String::from_utf8_lossy(chunk);
        self.feed_str(&text)
    }

    pub fn feed_str(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.pending.push_str(chunk);
        let mut out = Vec::new();

        while let Some(pos) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                self.flush_into(&mut out);
            } else {
                self.accept_line(line);
            }
        }

        out
    }

    /// Drain whatever is buffered at end-of-stream, including a final event
    /// without its trailing blank line.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            let line = line.trim_end_matches('\r');
            if !line.is_empty() {
                self.accept_line(line);
            }
        }
        let mut out = Vec::new();
        self.flush_into(&mut out);
        out
    }

    fn accept_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => {
                self.event_name = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "data" => self.data_lines.push(value.to_string()),
            _ => {}
        }
    }

    fn flush_into(&mut self, out: &mut Vec<SseEvent>) {
        if self.event_name.is_none() && self.data_lines.is_empty() {
            return;
        }
        out.push(SseEvent {
            event: self.event_name.take(),
            data: self.data_lines.join("\n"),
        });
        self.data_lines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_events_across_chunk_boundaries() {
        let mut parser = SseParser::new();
        assert!(parser.feed_str("event: message_st").is_empty());
        let events = parser.feed_str("art\ndata: {\"a\":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{\"a\":1}");
    }

    #[test]
    fn joins_multi_line_data_and_skips_comments() {
        let mut parser = SseParser::new();
        let events = parser.feed_str(": keep-alive\ndata: a\ndata: b\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "a\nb");
        assert_eq!(events[0].event, None);
    }

    #[test]
    fn crlf_lines_are_tolerated() {
        let mut parser = SseParser::new();
        let events = parser.feed_str("data: hi\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hi");
    }

    #[test]
    fn done_marker_is_surfaced_verbatim() {
        let mut parser = SseParser::new();
        let events = parser.feed_str("data: [DONE]\n\n");
        assert!(events[0].is_done());
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut parser = SseParser::new();
        assert!(parser.feed_str("data: tail").is_empty());
        let events = parser.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "tail");
    }
}
