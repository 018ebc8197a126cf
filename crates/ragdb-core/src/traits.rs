use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Turns texts into dense vectors.
///
/// Errors must use `Error::Transient` for failures worth retrying and
/// `Error::Rejected` for everything else.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    /// Stable identifier of the model behind this service (e.g. `all-minilm`).
    fn embedder_id(&self) -> &str;
    /// One vector per input text, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationRequest {
    pub model: String,
    pub prompt: String,
    pub temperature: f32,
    pub top_p: f32,
}

/// A text-generation backend addressed by id.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    fn id(&self) -> &str;
    async fn generate(&self, request: &GenerationRequest) -> Result<String>;
}
