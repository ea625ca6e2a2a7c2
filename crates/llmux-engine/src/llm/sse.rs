//! Server-sent events line parser.
//!
//! Backends that stream over SSE (genai, OpenAI-compatible, Anthropic) send
//! `data:` lines, optionally preceded by an `event:` line.  [`SseParser`]
//! turns raw lines into `(event type, data)` pairs; interpreting the data is
//! left to each backend's decoder.

/// One complete SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// The most recent `event:` value, if any.
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    /// `true` for the OpenAI `[DONE]` sentinel.
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Stateful line parser.  `event:` lines apply to the next `data:` line.
#[derive(Debug, Default)]
pub struct SseParser {
    current_event_type: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line (without its terminator).
    ///
    /// Returns `Some` for `data:` lines and `None` for comments, blank lines,
    /// `event:` lines and unknown fields.
    pub fn parse_line(&mut self, line: &str) -> Option<SseEvent> {
        let line = line.trim_end_matches(['\r', '\n']);

        if line.is_empty() || line.starts_with(':') {
            return None;
        }

        if let Some(event_type) = field(line, "event") {
            self.current_event_type = Some(event_type.to_owned());
            return None;
        }

        if let Some(data) = field(line, "data") {
            return Some(SseEvent {
                event: self.current_event_type.take(),
                data: data.to_owned(),
            });
        }

        tracing::trace!(line, "ignoring unrecognised SSE line");
        None
    }
}

/// Value of `name:` with at most one leading space removed.
fn field<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(name)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_applies_to_next_data_line_only() {
        let mut parser = SseParser::new();
        assert!(parser.parse_line("event: content_block_delta").is_none());
        let first = parser.parse_line(r#"data: {"index":0}"#).unwrap();
        assert_eq!(first.event.as_deref(), Some("content_block_delta"));
        assert_eq!(first.data, r#"{"index":0}"#);

        let second = parser.parse_line("data: {}").unwrap();
        assert!(second.event.is_none());
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let mut parser = SseParser::new();
        assert!(parser.parse_line("").is_none());
        assert!(parser.parse_line(": keep-alive").is_none());
        assert!(parser.parse_line("id: 7").is_none());
    }

    #[test]
    fn data_without_space_and_crlf() {
        let mut parser = SseParser::new();
        let event = parser.parse_line("data:[DONE]\r").unwrap();
        assert!(event.is_done());
    }
}
