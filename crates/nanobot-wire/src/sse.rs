//! Incremental Server-Sent-Events framing.

/// One decoded SSE event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    /// `event:` field, empty for the default event type.
    pub event: String,
    /// Concatenated `data:` lines, newline-joined.
    pub data: String,
    /// `id:` field, if the server set one.
    pub id: Option<String>,
}

impl SseEvent {
    pub fn is_message(&self) -> bool {
        self.event.is_empty() || self.event == "message"
    }
}

/// Incremental parser fed with arbitrary byte chunks.
///
/// Events are yielded once the terminating blank line arrives; partial
/// lines are buffered across pushes.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    current: SseEvent,
    events: Vec<SseEvent>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every event completed by it.
    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            self.take_line(line);
        }
        std::mem::take(&mut self.events)
    }

    fn take_line(&mut self, line: &str) {
        if line.is_empty() {
            if !self.current.data.is_empty() || !self.current.event.is_empty() {
                self.events.push(std::mem::take(&mut self.current));
            }
            return;
        }
        if line.starts_with(':') {
            return; // comment / keep-alive
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => self.current.event = value.to_string(),
            "data" => {
                if !self.current.data.is_empty() {
                    self.current.data.push('\n');
                }
                self.current.data.push_str(value);
            }
            "id" => self.current.id = Some(value.to_string()),
            _ => {}
        }
    }
}

/// Parse a complete SSE body, as returned when a POST answers with
/// `Content-Type: text/event-stream`.
pub fn parse_body(body: &str) -> Vec<SseEvent> {
    let mut parser = SseParser::new();
    let mut events = parser.push(body);
    // A final event without a trailing blank line still counts.
    events.extend(parser.push("\n\n"));
    events
}
