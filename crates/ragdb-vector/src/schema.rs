//! On-disk layout of a persisted collection.
//!
//! Each collection directory holds a binary `index.bin` (magic, format
//! version, bincode payload) and a JSON `metadata.json` sidecar describing it.
//! The sidecar's `documents` are ordered by internal id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ragdb_core::types::ChunkRecord;

use crate::index::IndexKind;

pub const INDEX_MAGIC: &[u8; 4] = b"RGIX";
pub const INDEX_FORMAT_VERSION: u16 = 1;
pub const SCHEMA_VERSION: u32 = 1;

pub const INDEX_FILE: &str = "index.bin";
pub const METADATA_FILE: &str = "metadata.json";
pub const METRIC_INNER_PRODUCT: &str = "inner_product";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sidecar {
    pub schema_version: u32,
    pub documents: Vec<ChunkRecord>,
    pub total_documents: usize,
    pub embedding_dimension: usize,
    pub model_name: String,
    pub created_at: DateTime<Utc>,
    pub index_type: IndexKind,
    pub metric: String,
    pub nlist: usize,
}
