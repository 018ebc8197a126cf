//! Document ingestion: load, split, embed, commit and persist.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use ragdb_core::chunker::{ChunkSplitter, ChunkingConfig};
use ragdb_core::loader::{collect_files, load_document};
use ragdb_core::types::{Chunk, ChunkRecord};
use ragdb_core::{Error, Result};
use ragdb_embed::EmbeddingBatcher;
use ragdb_vector::{CollectionStore, IndexKind, RetrievalCache};

use crate::orchestrator::CachedAnswer;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestSource {
    Directory(PathBuf),
    Files(Vec<PathBuf>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    pub source: IngestSource,
    pub collection: String,
    /// Falls back to the configured chunking when unset.
    #[serde(default)]
    pub chunk_size: Option<usize>,
    #[serde(default)]
    pub chunk_overlap: Option<usize>,
}

impl IngestRequest {
    pub fn directory(path: impl Into<PathBuf>, collection: impl Into<String>) -> Self {
        Self { source: IngestSource::Directory(path.into()), collection: collection.into(), chunk_size: None, chunk_overlap: None }
    }

    pub fn files(paths: Vec<PathBuf>, collection: impl Into<String>) -> Self {
        Self { source: IngestSource::Files(paths), collection: collection.into(), chunk_size: None, chunk_overlap: None }
    }

    pub fn with_chunking(mut self, chunk_size: usize, chunk_overlap: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self.chunk_overlap = Some(chunk_overlap);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Success,
    PartialSuccess,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestFailure {
    /// Document path or chunk id.
    pub item: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestReport {
    pub status: IngestStatus,
    pub collection: String,
    pub documents_processed: usize,
    pub documents_failed: usize,
    pub chunks_created: usize,
    pub chunks_stored: usize,
    pub chunks_failed: usize,
    pub failures: Vec<IngestFailure>,
    pub total_vectors: usize,
    pub duration_ms: u64,
}

impl IngestReport {
    /// `Err(IngestionPartialFailure)` unless every chunk was stored.
    pub fn ensure_complete(&self) -> Result<()> {
        match self.status {
            IngestStatus::Success => Ok(()),
            _ => Err(Error::IngestionPartialFailure {
                failed: self.chunks_failed + self.documents_failed,
                total: self.chunks_created + self.documents_failed,
            }),
        }
    }
}

pub struct IngestionPipeline {
    store: Arc<CollectionStore>,
    batcher: EmbeddingBatcher,
    cache: Arc<RetrievalCache<CachedAnswer>>,
    chunking: ChunkingConfig,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<CollectionStore>,
        batcher: EmbeddingBatcher,
        cache: Arc<RetrievalCache<CachedAnswer>>,
        chunking: ChunkingConfig,
    ) -> Self {
        Self { store, batcher, cache, chunking }
    }

    fn splitter_for(&self, request: &IngestRequest) -> Result<ChunkSplitter> {
        ChunkSplitter::new(ChunkingConfig {
            chunk_size: request.chunk_size.unwrap_or(self.chunking.chunk_size),
            chunk_overlap: request.chunk_overlap.unwrap_or(self.chunking.chunk_overlap),
        })
    }

    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestReport> {
        let started = Instant::now();
        let splitter = self.splitter_for(&request)?;
        let name = request.collection.as_str();

        // Fail before embedding anything if the collection belongs to another model.
        let existing = self.store.get(name)?;
        if let Some(c) = &existing {
            if c.model_name() != self.batcher.embedder_id() {
                return Err(Error::ModelMismatch {
                    collection: name.to_string(),
                    expected: c.model_name().to_string(),
                    actual: self.batcher.embedder_id().to_string(),
                });
            }
        }

        let (root, files) = match &request.source {
            IngestSource::Directory(dir) => {
                if !dir.is_dir() {
                    return Err(Error::NotFound(format!("directory {}", dir.display())));
                }
                (Some(dir.as_path()), collect_files(dir))
            }
            IngestSource::Files(files) => (None, files.clone()),
        };
        tracing::info!(collection = name, files = files.len(), "ingestion started");

        let mut failures = Vec::new();
        let mut documents_processed = 0usize;
        let mut chunks: Vec<Chunk> = Vec::new();
        for path in &files {
            match load_document(path, root).await {
                Ok(doc) => {
                    documents_processed += 1;
                    chunks.extend(splitter.split_document(&doc));
                }
                Err(e) => {
                    tracing::warn!(collection = name, path = %path.display(), error = %e, "document failed to load");
                    failures.push(IngestFailure { item: path.display().to_string(), reason: e.to_string() });
                }
            }
        }
        let documents_failed = failures.len();
        let chunks_created = chunks.len();

        let output = self
            .batcher
            .embed_chunks(name, chunks, existing.as_ref().map(|c| c.dimension()))
            .await?;
        let chunks_failed = output.failures.len();
        failures.extend(output.failures.into_iter().map(|f| IngestFailure { item: f.chunk_id, reason: f.reason }));

        let chunks_stored = output.embeddings.len();
        let total_vectors = match output.dimension {
            Some(dimension) if chunks_stored > 0 => {
                let (records, vectors): (Vec<ChunkRecord>, Vec<Vec<f32>>) =
                    output.embeddings.into_iter().map(|e| (ChunkRecord::from(e.chunk), e.vector)).unzip();
                self.commit(name, dimension, records, vectors).await?
            }
            _ => match &existing {
                Some(c) => c.len().await,
                None => 0,
            },
        };

        let status = if chunks_stored == 0 {
            IngestStatus::Failed
        } else if failures.is_empty() {
            IngestStatus::Success
        } else {
            IngestStatus::PartialSuccess
        };
        let report = IngestReport {
            status,
            collection: name.to_string(),
            documents_processed,
            documents_failed,
            chunks_created,
            chunks_stored,
            chunks_failed,
            failures,
            total_vectors,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        tracing::info!(
            collection = name,
            status = ?report.status,
            documents = report.documents_processed,
            chunks = report.chunks_stored,
            failed = report.chunks_failed + report.documents_failed,
            "ingestion finished"
        );
        Ok(report)
    }

    async fn commit(&self, name: &str, dimension: usize, records: Vec<ChunkRecord>, vectors: Vec<Vec<f32>>) -> Result<usize> {
        let collection = self.store.get_or_create(name, dimension, self.batcher.embedder_id())?;
        let mut writer = collection.begin_write().await;
        writer.ensure_trained(&vectors)?;
        writer.add(records, &vectors)?;
        let index = writer.index();
        if index.kind() == IndexKind::Flat && index.len() >= index.params().exact_threshold {
            writer.rebuild()?;
        }
        // Saved before the writer guard drops, so artifacts land in commit order.
        let dir = self.store.collection_dir(name);
        let cache = &self.cache;
        writer.commit_persisted(dir.as_deref(), || cache.invalidate(name)).await
    }

    /// Remove the collection, its artifact and its cache partition.
    pub fn delete_collection(&self, name: &str) -> Result<bool> {
        let existed = self.store.drop_collection(name)?;
        self.cache.remove_partition(name);
        Ok(existed)
    }

    pub fn store(&self) -> &Arc<CollectionStore> {
        &self.store
    }
}

