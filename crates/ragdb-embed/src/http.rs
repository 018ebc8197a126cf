use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use ragdb_core::traits::EmbeddingService;
use ragdb_core::{Error, Result};

/// Map a non-success HTTP status to the retry taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> Error {
    let msg = format!("HTTP {}: {}", status, body.trim());
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        Error::Transient(msg)
    } else {
        Error::Rejected(msg)
    }
}

/// Map a transport error: timeouts and connection failures are worth a retry.
pub fn classify_send_error(e: &reqwest::Error) -> Error {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        Error::Transient(e.to_string())
    } else if let Some(status) = e.status() {
        classify_status(status, &e.to_string())
    } else {
        Error::Rejected(e.to_string())
    }
}

pub fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::InvalidConfig(format!("http client: {}", e)))
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Client for an Ollama-compatible `/api/embed` endpoint.
pub struct HttpEmbedder {
    client: Client,
    base_url: String,
    model: String,
}

impl HttpEmbedder {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        })
    }
}

#[async_trait]
impl EmbeddingService for HttpEmbedder {
    fn embedder_id(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/api/embed", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&EmbedRequest { model: &self.model, input: texts })
            .send()
            .await
            .map_err(|e| classify_send_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| Error::Rejected(format!("malformed embedding response: {}", e)))?;
        if parsed.embeddings.len() != texts.len() {
            return Err(Error::Rejected(format!(
                "embedding service returned {} vectors for {} inputs",
                parsed.embeddings.len(),
                texts.len()
            )));
        }
        Ok(parsed.embeddings)
    }
}
