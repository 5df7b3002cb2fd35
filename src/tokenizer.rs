//! Model-compatible token-count estimation.
//!
//! The chunker treats token counting as an injected dependency (see
//! [`TokenCounter`]) so it stays a pure function of its input and is testable
//! without pulling in a real tokenizer.

use std::sync::Arc;
use tiktoken_rs::CoreBPE;

pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Wraps the `cl100k_base` BPE vocabulary, the encoding used by the
/// `text-embedding-3-*` model family referenced in the embedding config.
pub struct TiktokenCounter {
    bpe: CoreBPE,
}

impl TiktokenCounter {
    pub fn new() -> anyhow::Result<Self> {
        let bpe = tiktoken_rs::cl100k_base()?;
        Ok(Self { bpe })
    }
}

impl TokenCounter for TiktokenCounter {
    fn count(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

/// Crude fallback (whitespace-split) used when the real tokenizer model data
/// cannot be loaded, and in tests that don't care about exact token counts.
pub struct WhitespaceCounter;

impl TokenCounter for WhitespaceCounter {
    fn count(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

pub fn default_counter() -> Arc<dyn TokenCounter> {
    match TiktokenCounter::new() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            tracing::warn!("falling back to whitespace token counter: {e}");
            Arc::new(WhitespaceCounter)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_counter_counts_words() {
        let c = WhitespaceCounter;
        assert_eq!(c.count("one two three"), 3);
        assert_eq!(c.count(""), 0);
    }
}
