//! Incremental server-sent events parser.
//!
//! Bytes may arrive split anywhere; only complete lines are decoded, so a
//! multi-byte character split across network reads is never corrupted.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes and return every event completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() && event.is_none() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent { event, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_complete_events() {
        let mut parser = SseParser::new();
        let events = parser.push(
            b"event: ping\ndata: {}\n\nevent: content_block_delta\ndata: {\"a\":1}\n\n",
        );
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.as_deref(), Some("ping"));
        assert_eq!(events[1].data, "{\"a\":1}");
    }

    #[test]
    fn handles_arbitrary_splits() {
        let raw = "event: content_block_delta\r\ndata: {\"text\":\"héllo\"}\r\n\r\n";
        let bytes = raw.as_bytes();
        let mut parser = SseParser::new();
        let mut events = Vec::new();
        for chunk in bytes.chunks(3) {
            events.extend(parser.push(chunk));
        }
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"text\":\"héllo\"}");
    }

    #[test]
    fn multi_line_data_and_comments() {
        let mut parser = SseParser::new();
        let events = parser.push(b": keep-alive\ndata: one\ndata:two\n\n\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: None,
                data: "one\ntwo".to_string()
            }]
        );
    }

    #[test]
    fn incomplete_event_waits() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: partial").is_empty());
        assert!(parser.push(b"\n").is_empty());
        assert_eq!(parser.push(b"\n").len(), 1);
    }
}
