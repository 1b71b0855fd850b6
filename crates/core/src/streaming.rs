//! Incremental echo of generated text while preserving UTF-8 integrity.

use std::cell::RefCell;

use tracing::warn;

use crate::{metadata::ModelMetadata, tokenizer::TextTokenizer};

/// Computes the suffix of `current` that differs from `previous`.
pub fn extract_delta(previous: &str, current: &str) -> String {
    if let Some(rest) = current.strip_prefix(previous) {
        return rest.to_owned();
    }
    let prefix_bytes: usize = previous
        .chars()
        .zip(current.chars())
        .take_while(|(a, b)| a == b)
        .map(|(a, _)| a.len_utf8())
        .sum();
    current[prefix_bytes..].to_owned()
}

/// Tracks previously emitted text to compute new streaming deltas.
#[derive(Debug, Default, Clone)]
pub struct DeltaTracker {
    previous: String,
}

impl DeltaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the text that should be emitted for the current decode.
    ///
    /// Until `is_final`, a trailing replacement character means a multi-byte
    /// sequence is still incomplete, so only the text before it is released.
    pub fn advance(&mut self, current: &str, is_final: bool) -> String {
        let mut delta = extract_delta(&self.previous, current);
        if !is_final && delta.ends_with(char::REPLACEMENT_CHARACTER) {
            delta.pop();
            self.previous.push_str(&delta);
            return delta;
        }
        self.previous = current.to_owned();
        delta
    }

    pub fn snapshot(&self) -> &str {
        &self.previous
    }
}

/// Decodes generated tokens as they arrive and hands new text to `sink`.
/// Stop tokens are never echoed.
pub struct TextStreamer<'a> {
    tokenizer: &'a dyn TextTokenizer,
    metadata: &'a ModelMetadata,
    tracker: RefCell<DeltaTracker>,
    sink: &'a dyn Fn(&str),
}

impl<'a> TextStreamer<'a> {
    pub fn new(
        tokenizer: &'a dyn TextTokenizer,
        metadata: &'a ModelMetadata,
        sink: &'a dyn Fn(&str),
    ) -> Self {
        Self {
            tokenizer,
            metadata,
            tracker: RefCell::new(DeltaTracker::new()),
            sink,
        }
    }

    pub fn on_tokens(&self, tokens: &[u32]) {
        self.emit(tokens, false);
    }

    /// Flushes whatever the incremental calls held back.
    pub fn finish(&self, tokens: &[u32]) {
        self.emit(tokens, true);
    }

    fn emit(&self, tokens: &[u32], is_final: bool) {
        let visible: Vec<u32> = tokens
            .iter()
            .copied()
            .filter(|id| !self.metadata.is_stop_token(*id))
            .collect();
        let text = match self.tokenizer.decode(&visible, true) {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "Skipping stream update");
                return;
            }
        };
        let delta = self.tracker.borrow_mut().advance(&text, is_final);
        if !delta.is_empty() {
            (self.sink)(&delta);
        }
    }
}
