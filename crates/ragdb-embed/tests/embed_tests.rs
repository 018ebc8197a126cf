use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ragdb_core::config::EmbeddingConfig;
use ragdb_core::retry::RetryPolicy;
use ragdb_core::traits::EmbeddingService;
use ragdb_core::types::{Chunk, Meta};
use ragdb_core::{Error, Result};
use ragdb_embed::{embedder_from_config, BatchConfig, EmbeddingBatcher, FakeEmbedder, HttpEmbedder};

fn chunks(n: usize) -> Vec<Chunk> {
    (0..n)
        .map(|i| Chunk {
            chunk_id: format!("doc:{}", i),
            document_id: "doc".into(),
            text: format!("chunk number {}", i),
            chunk_index: i,
            metadata: Meta::new(),
        })
        .collect()
}

fn config(batch_size: usize, attempts: u32) -> BatchConfig {
    BatchConfig { batch_size, concurrency: 2, retry: RetryPolicy::new(attempts, Duration::from_millis(1)) }
}

/// Fails every batch containing `poison`, fails the first call for
/// batches containing `flaky`, returns an empty vector for `empty`, and
/// vectors of dimension `dim` otherwise.
struct ScriptedService {
    dim: usize,
    calls: AtomicUsize,
    poison: Option<String>,
    flaky: Option<String>,
    flaky_seen: AtomicUsize,
    empty: Option<String>,
}

impl ScriptedService {
    fn new(dim: usize) -> Self {
        Self { dim, calls: AtomicUsize::new(0), poison: None, flaky: None, flaky_seen: AtomicUsize::new(0), empty: None }
    }
}

#[async_trait]
impl EmbeddingService for ScriptedService {
    fn embedder_id(&self) -> &str {
        "scripted"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(p) = &self.poison {
            if texts.iter().any(|t| t == p) {
                return Err(Error::Transient("backend overloaded".into()));
            }
        }
        if let Some(f) = &self.flaky {
            if texts.iter().any(|t| t == f) && self.flaky_seen.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(Error::Transient("connection reset".into()));
            }
        }
        Ok(texts
            .iter()
            .map(|t| {
                if self.empty.as_ref() == Some(t) {
                    Vec::new()
                } else {
                    vec![t.len() as f32, 2.0, 0.0, 1.0][..self.dim.min(4)].to_vec()
                }
            })
            .collect())
    }
}

#[tokio::test]
async fn fake_embedder_is_deterministic_and_normalized() -> anyhow::Result<()> {
    let embedder = FakeEmbedder::new("fake", 64);
    let embs = embedder.embed(&["hello world".to_string(), "hello world".to_string()]).await?;
    assert_eq!(embs[0].len(), 64);
    let norm: f32 = embs[0].iter().map(|x| x * x).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() <= 1e-3, "vector is L2-normalized (norm={norm})");
    assert_eq!(embs[0], embs[1]);
    Ok(())
}

#[test]
fn env_flag_selects_fake_embedder() {
    std::env::set_var("APP_USE_FAKE_EMBEDDINGS", "1");
    let cfg = EmbeddingConfig { url: "http://127.0.0.1:1".into(), fake_dim: 16, ..EmbeddingConfig::default() };
    let embedder = embedder_from_config(&cfg).expect("embedder");
    assert_eq!(embedder.embedder_id(), cfg.model);
}

#[tokio::test]
async fn failing_batch_is_recorded_and_run_continues() -> anyhow::Result<()> {
    let mut svc = ScriptedService::new(4);
    svc.poison = Some("chunk number 3".into());
    let svc = Arc::new(svc);
    let batcher = EmbeddingBatcher::new(svc.clone(), config(2, 3));

    let out = batcher.embed_chunks("general", chunks(6), None).await?;

    // Batches: [0,1] [2,3] [4,5]; the middle one fails three times.
    assert_eq!(out.embeddings.len(), 4);
    let failed: Vec<&str> = out.failures.iter().map(|f| f.chunk_id.as_str()).collect();
    assert_eq!(failed, vec!["doc:2", "doc:3"]);
    assert!(out.is_partial());
    assert_eq!(svc.calls.load(Ordering::SeqCst), 2 + 3);
    let ids: Vec<&str> = out.embeddings.iter().map(|e| e.chunk.chunk_id.as_str()).collect();
    assert_eq!(ids, vec!["doc:0", "doc:1", "doc:4", "doc:5"], "output keeps input order");
    Ok(())
}

#[tokio::test]
async fn transient_failure_recovers_on_retry() -> anyhow::Result<()> {
    let mut svc = ScriptedService::new(4);
    svc.flaky = Some("chunk number 0".into());
    let batcher = EmbeddingBatcher::new(Arc::new(svc), config(8, 2));

    let out = batcher.embed_chunks("general", chunks(3), None).await?;
    assert_eq!(out.embeddings.len(), 3);
    assert!(out.failures.is_empty());
    assert_eq!(out.dimension, Some(4));
    for e in &out.embeddings {
        let norm: f32 = e.vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }
    Ok(())
}

#[tokio::test]
async fn empty_vector_fails_only_its_chunk() -> anyhow::Result<()> {
    let mut svc = ScriptedService::new(4);
    svc.empty = Some("chunk number 0".into());
    let batcher = EmbeddingBatcher::new(Arc::new(svc), config(2, 1));

    let out = batcher.embed_chunks("general", chunks(4), None).await?;
    assert_eq!(out.dimension, Some(4));
    assert_eq!(out.embeddings.len(), 3);
    assert_eq!(out.failures.len(), 1);
    assert_eq!(out.failures[0].chunk_id, "doc:0");
    Ok(())
}

#[tokio::test]
async fn dimension_mismatch_aborts_the_run() {
    let batcher = EmbeddingBatcher::new(Arc::new(ScriptedService::new(4)), config(4, 1));
    let err = batcher.embed_chunks("general", chunks(2), Some(384)).await.unwrap_err();
    match err {
        Error::DimensionMismatch { collection, expected, actual } => {
            assert_eq!(collection, "general");
            assert_eq!(expected, 384);
            assert_eq!(actual, 4);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn http_embedder_posts_model_and_inputs() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .and(body_partial_json(json!({ "model": "all-minilm", "input": ["a", "b"] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "embeddings": [[1.0, 0.0], [0.0, 3.0]]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let embedder = HttpEmbedder::new(server.uri(), "all-minilm", Duration::from_secs(5))?;
    let vectors = embedder.embed(&["a".to_string(), "b".to_string()]).await?;
    assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 3.0]]);
    Ok(())
}

#[tokio::test]
async fn http_status_codes_map_to_retry_classes() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .and(body_partial_json(json!({ "model": "busy" })))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .and(body_partial_json(json!({ "model": "unknown" })))
        .respond_with(ResponseTemplate::new(404).set_body_string("model not found"))
        .mount(&server)
        .await;

    let busy = HttpEmbedder::new(server.uri(), "busy", Duration::from_secs(5))?;
    let err = busy.embed(&["x".to_string()]).await.unwrap_err();
    assert!(err.is_transient(), "5xx is transient: {err}");

    let unknown = HttpEmbedder::new(server.uri(), "unknown", Duration::from_secs(5))?;
    let err = unknown.embed(&["x".to_string()]).await.unwrap_err();
    assert!(matches!(err, Error::Rejected(_)), "4xx is rejected: {err}");
    Ok(())
}

#[tokio::test]
async fn http_batches_are_normalized_by_the_batcher() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "embeddings": [[3.0, 4.0]] })))
        .mount(&server)
        .await;

    let embedder = Arc::new(HttpEmbedder::new(server.uri(), "all-minilm", Duration::from_secs(5))?);
    let batcher = EmbeddingBatcher::new(embedder, config(1, 1));
    let out = batcher.embed_chunks("general", chunks(1), None).await?;
    assert_eq!(out.embeddings[0].vector, vec![0.6, 0.8]);
    Ok(())
}
