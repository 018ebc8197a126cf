pub mod batcher;
pub mod fake;
pub mod http;
pub mod normalize;

use std::sync::Arc;

use ragdb_core::config::EmbeddingConfig;
use ragdb_core::traits::EmbeddingService;
use ragdb_core::Result;

pub use batcher::{BatchConfig, BatchOutput, ChunkFailure, EmbeddedChunk, EmbeddingBatcher};
pub use fake::FakeEmbedder;
pub use http::HttpEmbedder;
pub use normalize::l2_normalize;

fn fake_requested() -> bool {
    std::env::var("APP_USE_FAKE_EMBEDDINGS")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// The embedding service described by `config`. `APP_USE_FAKE_EMBEDDINGS=1`
/// forces the hashing embedder regardless of the file settings.
pub fn embedder_from_config(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingService>> {
    if config.use_fake || fake_requested() {
        tracing::info!(model = %config.model, dim = config.fake_dim, "using fake embedder");
        return Ok(Arc::new(FakeEmbedder::new(config.model.clone(), config.fake_dim)));
    }
    tracing::info!(url = %config.url, model = %config.model, "using http embedder");
    Ok(Arc::new(HttpEmbedder::new(config.url.clone(), config.model.clone(), config.timeout())?))
}
