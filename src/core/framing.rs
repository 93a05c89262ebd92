//! Incremental decoders for line-oriented backend output
//!
//! Nothing in here touches I/O: callers feed raw chunks as they arrive and get
//! back whatever complete messages the chunk finished. Partial lines stay
//! buffered until the next `feed`.

use serde_json::Value;

/// Accumulates bytes and yields complete `\n`-terminated lines.
///
/// Bytes are buffered rather than decoded per chunk so a multi-byte UTF-8
/// sequence split across two reads still decodes correctly.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Flush an unterminated trailing line, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let mut rest = std::mem::take(&mut self.pending);
        if rest.last() == Some(&b'\r') {
            rest.pop();
        }
        Some(String::from_utf8_lossy(&rest).into_owned())
    }

    pub fn buffered_len(&self) -> usize {
        self.pending.len()
    }
}

/// How each line of a body is framed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineFormat {
    /// Every non-blank line is one JSON document
    JsonLines,
    /// SSE-style lines: `data: {json}` or bare `{json}`; blank lines,
    /// `:` comments and `event:`/`id:`/`retry:` fields are skipped
    EventStream,
}

/// Output of a decoder for one line
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Message(Value),
    Malformed { line: String, error: String },
}

/// Splits a byte stream into JSON messages, one per line.
#[derive(Debug)]
pub struct JsonLineDecoder {
    lines: LineBuffer,
    format: LineFormat,
}

impl JsonLineDecoder {
    pub fn new(format: LineFormat) -> Self {
        Self {
            lines: LineBuffer::new(),
            format,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Decoded> {
        let format = self.format;
        self.lines
            .feed(chunk)
            .into_iter()
            .filter_map(|line| decode_line(format, &line))
            .collect()
    }

    pub fn finish(&mut self) -> Vec<Decoded> {
        let format = self.format;
        self.lines
            .finish()
            .and_then(|line| decode_line(format, &line))
            .into_iter()
            .collect()
    }
}

fn decode_line(format: LineFormat, line: &str) -> Option<Decoded> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let payload = match format {
        LineFormat::JsonLines => trimmed,
        LineFormat::EventStream => {
            if trimmed.starts_with(':') {
                return None;
            }
            if let Some(data) = trimmed.strip_prefix("data:") {
                let data = data.trim_start();
                if data.is_empty() {
                    return None;
                }
                data
            } else if ["event:", "id:", "retry:"]
                .iter()
                .any(|field| trimmed.starts_with(field))
            {
                return None;
            } else {
                trimmed
            }
        }
    };

    Some(match serde_json::from_str::<Value>(payload) {
        Ok(value) => Decoded::Message(value),
        Err(e) => Decoded::Malformed {
            line: line.to_string(),
            error: e.to_string(),
        },
    })
}

/// One dispatched server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Assembles server-sent events; multi-line `data:` fields are joined with
/// `\n` and an event is dispatched on the blank line that ends it.
#[derive(Debug, Default)]
pub struct SseEventDecoder {
    lines: LineBuffer,
    event: Option<String>,
    data: Vec<String>,
}

impl SseEventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();
        for line in self.lines.feed(chunk) {
            if let Some(event) = self.apply_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing event that was never terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if let Some(line) = self.lines.finish() {
            if let Some(event) = self.apply_line(&line) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn apply_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent { event, data })
    }
}
