//! Stateful wrapper around [`normalize_line`] for chunked byte streams.

use std::collections::HashSet;

use tracing::trace;

use super::event::NormalizedEvent;
use super::normalize::normalize_line;

/// Feeds arbitrary output chunks through the normalizer.
///
/// A chunk may end mid-line; the partial tail is held until the next chunk
/// or [`finish`](Self::finish). Tool calls repeated under the same id (some
/// backends re-send the whole message as it grows) are emitted once.
#[derive(Debug, Default)]
pub struct StreamNormalizer {
    buffer: String,
    keep_plain_text: bool,
    seen_tool_ids: HashSet<String>,
}

impl StreamNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep unstructured lines as `text` events.
    pub fn with_plain_text(mut self, keep: bool) -> Self {
        self.keep_plain_text = keep;
        self
    }

    /// Append a chunk and return events for every complete line in it.
    pub fn push(&mut self, chunk: &str) -> Vec<NormalizedEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            events.extend(self.process(&line));
        }
        events
    }

    /// Normalize one complete line, bypassing the partial-line buffer.
    pub fn push_line(&mut self, line: &str) -> Vec<NormalizedEvent> {
        self.process(line)
    }

    /// Flush a trailing line that never got its newline.
    pub fn finish(&mut self) -> Vec<NormalizedEvent> {
        let rest = std::mem::take(&mut self.buffer);
        self.process(&rest)
    }

    fn process(&mut self, line: &str) -> Vec<NormalizedEvent> {
        let mut events = normalize_line(line, self.keep_plain_text);
        events.retain(|event| match event {
            NormalizedEvent::ToolCall { id, .. } if !id.is_empty() => {
                self.seen_tool_ids.insert(id.clone())
            }
            _ => true,
        });
        for event in &events {
            trace!(kind = event.kind(), ?event, "normalized event");
        }
        events
    }
}
