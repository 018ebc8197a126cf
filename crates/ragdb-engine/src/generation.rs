use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use ragdb_core::config::BackendConfig;
use ragdb_core::traits::{GenerationBackend, GenerationRequest};
use ragdb_core::{Error, Result};
use ragdb_embed::http::{build_client, classify_send_error, classify_status};

#[derive(Serialize)]
struct Options {
    temperature: f32,
    top_p: f32,
}

#[derive(Serialize)]
struct GenerateBody<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: Options,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Client for an Ollama-compatible `/api/generate` endpoint.
pub struct OllamaGenerator {
    id: String,
    base_url: String,
    model_override: Option<String>,
    client: Client,
}

impl OllamaGenerator {
    pub fn new(id: impl Into<String>, base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            id: id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model_override: None,
            client: build_client(timeout)?,
        })
    }

    pub fn from_config(backend: &BackendConfig, timeout: Duration) -> Result<Self> {
        let mut g = Self::new(backend.id.clone(), backend.url.clone(), timeout)?;
        g.model_override = backend.model.clone();
        Ok(g)
    }
}

#[async_trait]
impl GenerationBackend for OllamaGenerator {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);
        let body = GenerateBody {
            model: self.model_override.as_deref().unwrap_or(&request.model),
            prompt: &request.prompt,
            stream: false,
            options: Options { temperature: request.temperature, top_p: request.top_p },
        };
        let response = self.client.post(&url).json(&body).send().await.map_err(|e| classify_send_error(&e))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }
        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| Error::Rejected(format!("malformed generate response from {}: {}", self.id, e)))?;
        Ok(parsed.response)
    }
}
