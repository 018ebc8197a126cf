use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use ragdb_core::config::EmbeddingConfig;
use ragdb_core::retry::{retry_transient, RetryPolicy};
use ragdb_core::traits::EmbeddingService;
use ragdb_core::types::{Chunk, ChunkId};
use ragdb_core::{Error, Result};

use crate::normalize::l2_normalize;

#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl From<&EmbeddingConfig> for BatchConfig {
    fn from(c: &EmbeddingConfig) -> Self {
        Self { batch_size: c.batch_size.max(1), concurrency: c.concurrency.max(1), retry: c.retry_policy() }
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkFailure {
    pub chunk_id: ChunkId,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct BatchOutput {
    /// Successful embeddings in input order.
    pub embeddings: Vec<EmbeddedChunk>,
    pub failures: Vec<ChunkFailure>,
    /// Dimension shared by every vector in `embeddings`.
    pub dimension: Option<usize>,
}

impl BatchOutput {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Embeds chunks in fixed-size batches on a bounded pool of concurrent requests.
///
/// A batch that keeps failing is recorded chunk by chunk and skipped; the run
/// goes on. A vector of the wrong dimension aborts the run, since it means the
/// embedding service and the collection disagree about the model.
pub struct EmbeddingBatcher {
    service: Arc<dyn EmbeddingService>,
    config: BatchConfig,
}

impl EmbeddingBatcher {
    pub fn new(service: Arc<dyn EmbeddingService>, config: BatchConfig) -> Self {
        Self { service, config }
    }

    pub fn embedder_id(&self) -> &str {
        self.service.embedder_id()
    }

    pub async fn embed_chunks(
        &self,
        collection: &str,
        chunks: Vec<Chunk>,
        expected_dim: Option<usize>,
    ) -> Result<BatchOutput> {
        let mut batches: Vec<Vec<Chunk>> = Vec::new();
        let mut it = chunks.into_iter().peekable();
        while it.peek().is_some() {
            batches.push(it.by_ref().take(self.config.batch_size).collect());
        }
        let total_batches = batches.len();

        let service = self.service.as_ref();
        let policy = &self.config.retry;
        let mut results: Vec<(usize, Vec<Chunk>, Result<Vec<Vec<f32>>>)> =
            stream::iter(batches.into_iter().enumerate())
                .map(|(i, batch)| async move {
                    let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
                    let outcome = retry_transient(policy, "embed batch", |_| service.embed(&texts)).await;
                    if let Err(e) = &outcome.result {
                        tracing::warn!(collection, batch = i, attempts = outcome.attempts, error = %e, "embedding batch failed");
                    }
                    (i, batch, outcome.result)
                })
                .buffer_unordered(self.config.concurrency)
                .collect()
                .await;
        results.sort_by_key(|(i, _, _)| *i);

        let mut out = BatchOutput { dimension: expected_dim, ..BatchOutput::default() };
        for (_, batch, result) in results {
            let vectors = match result {
                Ok(v) if v.len() == batch.len() => v,
                Ok(v) => {
                    let reason = format!("service returned {} vectors for {} texts", v.len(), batch.len());
                    out.fail_all(&batch, &reason);
                    continue;
                }
                Err(e) => {
                    out.fail_all(&batch, &e.to_string());
                    continue;
                }
            };
            for (chunk, mut vector) in batch.into_iter().zip(vectors) {
                if vector.is_empty() {
                    out.failures.push(ChunkFailure { chunk_id: chunk.chunk_id, reason: "empty embedding".into() });
                    continue;
                }
                let expected = *out.dimension.get_or_insert(vector.len());
                if vector.len() != expected {
                    return Err(Error::DimensionMismatch {
                        collection: collection.to_string(),
                        expected,
                        actual: vector.len(),
                    });
                }
                if l2_normalize(&mut vector) {
                    out.embeddings.push(EmbeddedChunk { chunk, vector });
                } else {
                    out.failures.push(ChunkFailure { chunk_id: chunk.chunk_id, reason: "zero-norm embedding".into() });
                }
            }
        }

        tracing::info!(
            collection,
            batches = total_batches,
            embedded = out.embeddings.len(),
            failed = out.failures.len(),
            "embedding run finished"
        );
        Ok(out)
    }
}

impl BatchOutput {
    fn fail_all(&mut self, batch: &[Chunk], reason: &str) {
        self.failures.extend(
            batch.iter().map(|c| ChunkFailure { chunk_id: c.chunk_id.clone(), reason: reason.to_string() }),
        );
    }
}
