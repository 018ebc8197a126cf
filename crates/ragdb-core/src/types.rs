//! Domain types shared by the ingestion and query paths.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub type ChunkId = String;
pub type Meta = BTreeMap<String, String>;

/// Document formats the loaders understand.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Text,
    Markdown,
    Pdf,
    Docx,
}

impl DocumentFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Markdown => "markdown",
            Self::Pdf => "pdf",
            Self::Docx => "docx",
        }
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One loaded source file.
///
/// - `id`: stable identity, the path relative to the ingestion root
/// - `raw_text`: extracted text
/// - `source_metadata`: file name, path, type and size
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub raw_text: String,
    pub source_metadata: Meta,
    pub format: DocumentFormat,
}

/// A piece of a document that is embedded and indexed on its own.
///
/// `chunk_index` starts at 0 per document and is strictly increasing.
/// `metadata` holds the source metadata plus `chunk_index`, `start_char`
/// and `end_char`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub chunk_id: ChunkId,
    pub document_id: String,
    pub text: String,
    pub chunk_index: usize,
    pub metadata: Meta,
}

impl Chunk {
    pub fn make_id(document_id: &str, chunk_index: usize) -> ChunkId {
        format!("{}:{}", document_id, chunk_index)
    }
}

/// Row stored next to the index; position in the table is the internal id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkRecord {
    pub id: ChunkId,
    pub content: String,
    pub metadata: Meta,
}

impl From<Chunk> for ChunkRecord {
    fn from(c: Chunk) -> Self {
        Self { id: c.chunk_id, content: c.text, metadata: c.metadata }
    }
}

/// A retrieved chunk with its similarity score. Higher is better.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    pub chunk_id: ChunkId,
    pub score: f32,
    pub content: String,
    pub metadata: Meta,
}

/// Query stages that talk to something that can fail.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    EmbedQuery,
    Retrieve,
    AssembleContext,
    Generate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::EmbedQuery => "EMBED_QUERY",
            Self::Retrieve => "RETRIEVE",
            Self::AssembleContext => "ASSEMBLE_CONTEXT",
            Self::Generate => "GENERATE",
        };
        f.write_str(s)
    }
}
