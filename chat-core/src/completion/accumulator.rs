use super::StreamChunk;
use crate::models::{CompletionResult, Usage, APOLOGY_TEXT};

/// Folds stream chunks into one [`CompletionResult`].
///
/// Usage is taken from the first chunk reporting prompt tokens and never
/// overwritten. `finish` consumes the accumulator, so a result is committed
/// at most once.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    text: String,
    usage: Option<Usage>,
    chunks: usize,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb a chunk; returns its non-empty delta for forwarding.
    pub fn push(&mut self, chunk: StreamChunk) -> Option<String> {
        self.chunks += 1;

        if self.usage.is_none() {
            if let Some(usage) = chunk.usage.filter(|u| u.prompt_tokens > 0) {
                self.usage = Some(usage);
            }
        }

        let delta = chunk.delta.filter(|d| !d.is_empty())?;
        self.text.push_str(&delta);
        Some(delta)
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn chunks(&self) -> usize {
        self.chunks
    }

    pub fn finish(self) -> CompletionResult {
        let usage = self.usage.unwrap_or_default();
        if self.text.is_empty() {
            CompletionResult::new(APOLOGY_TEXT, usage)
        } else {
            CompletionResult::new(self.text, usage)
        }
    }
}
