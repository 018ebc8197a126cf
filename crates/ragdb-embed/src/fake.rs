use async_trait::async_trait;
use std::hash::{Hash, Hasher};
use twox_hash::XxHash64;

use ragdb_core::traits::EmbeddingService;
use ragdb_core::Result;

use crate::normalize::l2_normalize;

/// Deterministic bag-of-words hashing embedder for tests and offline runs.
///
/// Texts sharing words land close together, identical texts map to identical
/// vectors.
pub struct FakeEmbedder {
    id: String,
    dim: usize,
}

impl FakeEmbedder {
    pub fn new(id: impl Into<String>, dim: usize) -> Self {
        Self { id: id.into(), dim: dim.max(1) }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dim];
        for (i, token) in text.split_whitespace().enumerate() {
            let mut hasher = XxHash64::with_seed(0);
            token.to_lowercase().hash(&mut hasher);
            let h = hasher.finish();
            let idx = (h % self.dim as u64) as usize;
            let val = ((h >> 32) as u32) as f32 / u32::MAX as f32;
            v[idx] += val + (i % 3) as f32 * 0.01;
        }
        if !l2_normalize(&mut v) {
            // Empty text still yields a valid unit vector.
            v[0] = 1.0;
        }
        v
    }
}

#[async_trait]
impl EmbeddingService for FakeEmbedder {
    fn embedder_id(&self) -> &str {
        &self.id
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}
