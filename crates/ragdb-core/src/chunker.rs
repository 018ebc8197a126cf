use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{Chunk, Document};

/// How far back from a hard window end we look for a sentence terminal.
/// The scan covers `[end - SENTENCE_LOOKBACK, end)`; the character at `end`
/// already belongs to the next window.
pub const SENTENCE_LOOKBACK: usize = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self { chunk_size: 1000, chunk_overlap: 200 }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk_size must be greater than zero".into()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(Error::InvalidConfig(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// A window of the source text, in character offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSpan {
    pub start: usize,
    pub end: usize,
    pub text: String,
}

/// Splits text into overlapping windows, preferring to cut after a sentence.
///
/// All sizes are counted in characters. The splitter is pure: the same input
/// always produces the same spans.
#[derive(Debug, Clone, Copy)]
pub struct ChunkSplitter {
    config: ChunkingConfig,
}

impl ChunkSplitter {
    pub fn new(config: ChunkingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> ChunkingConfig {
        self.config
    }

    pub fn split(&self, text: &str) -> Vec<TextSpan> {
        let chars: Vec<char> = text.chars().collect();
        let len = chars.len();
        let ChunkingConfig { chunk_size, chunk_overlap } = self.config;

        let mut spans = Vec::new();
        let mut start = 0usize;
        while start < len {
            let mut end = (start + chunk_size).min(len);
            if end < len {
                if let Some(cut) = sentence_cut(&chars, start, end) {
                    // A cut that would not move the next window forward is ignored.
                    if cut > start + chunk_overlap {
                        end = cut;
                    }
                }
            }

            let window: String = chars[start..end].iter().collect();
            let trimmed = window.trim();
            if !trimmed.is_empty() {
                spans.push(TextSpan { start, end, text: trimmed.to_string() });
            }

            if end >= len {
                break;
            }
            start = end - chunk_overlap;
        }
        spans
    }

    pub fn split_document(&self, doc: &Document) -> Vec<Chunk> {
        self.split(&doc.raw_text)
            .into_iter()
            .enumerate()
            .map(|(chunk_index, span)| {
                let mut metadata = doc.source_metadata.clone();
                metadata.insert("chunk_index".into(), chunk_index.to_string());
                metadata.insert("start_char".into(), span.start.to_string());
                metadata.insert("end_char".into(), span.end.to_string());
                Chunk {
                    chunk_id: Chunk::make_id(&doc.id, chunk_index),
                    document_id: doc.id.clone(),
                    text: span.text,
                    chunk_index,
                    metadata,
                }
            })
            .collect()
    }
}

/// Position just after the last sentence terminal in `[end - LOOKBACK, end)`.
fn sentence_cut(chars: &[char], start: usize, end: usize) -> Option<usize> {
    let lower = start.max(end.saturating_sub(SENTENCE_LOOKBACK));
    (lower..end)
        .rev()
        .find(|&i| matches!(chars[i], '.' | '!' | '?'))
        .map(|i| i + 1)
}
