use serde::Deserialize;

use super::lines::{data_payload, LineBuffer};
use super::DONE_SENTINEL;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedEvent {
    Fragment(String),
    Done,
}

#[derive(Debug, Deserialize)]
struct ContentChunk {
    content: Option<String>,
}

/// Turns the relay's normalized event stream into content fragments.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    lines: LineBuffer,
    finished: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<DecodedEvent> {
        if self.finished {
            return Vec::new();
        }
        let lines = self.lines.push(chunk);
        self.decode_lines(lines)
    }

    /// Decode a trailing line left without a newline at end of stream.
    pub fn finish(&mut self) -> Vec<DecodedEvent> {
        if self.finished {
            return Vec::new();
        }
        let lines: Vec<String> = self.lines.finish().into_iter().collect();
        self.decode_lines(lines)
    }

    fn decode_lines(&mut self, lines: Vec<String>) -> Vec<DecodedEvent> {
        let mut events = Vec::new();
        for line in lines {
            let Some(payload) = data_payload(&line) else {
                continue;
            };
            let payload = payload.trim();
            if payload == DONE_SENTINEL {
                self.finished = true;
                events.push(DecodedEvent::Done);
                break;
            }
            match serde_json::from_str::<ContentChunk>(payload) {
                Ok(ContentChunk {
                    content: Some(content),
                }) if !content.is_empty() => events.push(DecodedEvent::Fragment(content)),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Failed to parse stream event: {}", e);
                }
            }
        }
        events
    }
}
