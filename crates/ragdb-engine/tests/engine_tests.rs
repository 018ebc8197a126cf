use async_trait::async_trait;
use serde_json::json;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ragdb_core::config::{BackendConfig, EngineConfig};
use ragdb_core::traits::{EmbeddingService, GenerationBackend, GenerationRequest};
use ragdb_core::types::Stage;
use ragdb_core::{Error, Result};
use ragdb_embed::FakeEmbedder;
use ragdb_engine::{Engine, HealthState, IngestRequest, IngestStatus, QueryRequest};

const SOLAR: &str = "Solar panels convert sunlight into electricity for the homestead.";
const WELL: &str = "The well pump draws water from forty meters below the barn.";
const GARDEN: &str = "Raised garden beds drain well and warm up early in spring.";

enum Mode {
    Answer(&'static str),
    Transient,
    Reject,
    Slow(Duration),
}

/// Generation backend with a fixed behaviour and a call counter.
struct ScriptedBackend {
    id: String,
    mode: Mode,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    fn new(id: &str, mode: Mode) -> Arc<Self> {
        Arc::new(Self { id: id.into(), mode, calls: AtomicUsize::new(0) })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate(&self, _request: &GenerationRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.mode {
            Mode::Answer(a) => Ok(a.to_string()),
            Mode::Transient => Err(Error::Transient("HTTP 503 Service Unavailable".into())),
            Mode::Reject => Err(Error::Rejected("HTTP 400 Bad Request".into())),
            Mode::Slow(d) => {
                tokio::time::sleep(*d).await;
                Ok("too late".into())
            }
        }
    }
}

fn config(data_dir: Option<&Path>) -> EngineConfig {
    let mut c = EngineConfig::default();
    c.index.data_dir = data_dir.map(|d| d.display().to_string()).unwrap_or_default();
    c.query.backoff_ms = 1;
    c.query.max_retries = 1;
    c.embedding.backoff_ms = 1;
    c
}

fn embedder(model: &str) -> Arc<dyn EmbeddingService> {
    Arc::new(FakeEmbedder::new(model, 64))
}

fn engine_with(config: EngineConfig, backends: Vec<Arc<ScriptedBackend>>) -> Engine {
    let backends = backends.into_iter().map(|b| b as Arc<dyn GenerationBackend>).collect();
    Engine::new(config, embedder("fake-minilm"), backends).unwrap()
}

fn write_docs(dir: &Path) {
    fs::write(dir.join("solar.md"), SOLAR).unwrap();
    fs::write(dir.join("well.txt"), WELL).unwrap();
}

#[tokio::test]
async fn repeat_query_is_served_from_cache() -> anyhow::Result<()> {
    let docs = tempfile::tempdir()?;
    write_docs(docs.path());
    let backend = ScriptedBackend::new("primary", Mode::Answer("Sunlight."));
    let engine = engine_with(config(None), vec![backend.clone()]);

    let report = engine.ingest(IngestRequest::directory(docs.path(), "general")).await?;
    assert_eq!(report.status, IngestStatus::Success);
    assert_eq!((report.documents_processed, report.chunks_stored), (2, 2));

    let first = engine.query(QueryRequest::new(SOLAR, "general")).await?;
    assert!(!first.cache_hit);
    assert_eq!(first.answer, "Sunlight.");
    assert_eq!(first.backend.as_deref(), Some("primary"));
    assert_eq!(first.sources[0].chunk_id, "solar.md:0");
    assert!((first.sources[0].score - 1.0).abs() < 1e-4);

    let second = engine.query(QueryRequest::new(format!("  {}  ", SOLAR.to_uppercase()), "general")).await?;
    assert!(second.cache_hit);
    assert_eq!(second.answer, first.answer);
    assert_eq!(second.sources, first.sources);
    assert_eq!(backend.calls(), 1);

    let stats = engine.query_stats();
    assert_eq!((stats.queries_processed, stats.queries_succeeded, stats.cache_hits), (2, 2, 1));
    Ok(())
}

#[tokio::test]
async fn ingestion_invalidates_cached_answers() -> anyhow::Result<()> {
    let docs = tempfile::tempdir()?;
    write_docs(docs.path());
    let backend = ScriptedBackend::new("primary", Mode::Answer("ok"));
    let engine = engine_with(config(None), vec![backend.clone()]);
    engine.ingest(IngestRequest::directory(docs.path(), "general")).await?;

    let other = tempfile::tempdir()?;
    fs::write(other.path().join("garden.md"), GARDEN)?;
    engine.ingest(IngestRequest::directory(other.path(), "manuals")).await?;

    let q = QueryRequest::new(GARDEN, "general");
    engine.query(q.clone()).await?;
    engine.query(QueryRequest::new("pump", "manuals")).await?;

    // Ingesting into another collection leaves `general` cached.
    engine.ingest(IngestRequest::directory(other.path(), "manuals")).await?;
    assert!(engine.query(q.clone()).await?.cache_hit);

    engine.ingest(IngestRequest::directory(other.path(), "general")).await?;
    let after = engine.query(q).await?;
    assert!(!after.cache_hit);
    assert_eq!(after.sources[0].chunk_id, "garden.md:0");
    assert_eq!(backend.calls(), 3);
    Ok(())
}

#[tokio::test]
async fn overlap_not_smaller_than_size_touches_nothing() {
    let docs = tempfile::tempdir().unwrap();
    write_docs(docs.path());
    let engine = engine_with(config(None), vec![ScriptedBackend::new("primary", Mode::Answer("ok"))]);

    let err = engine
        .ingest(IngestRequest::directory(docs.path(), "general").with_chunking(100, 100))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));
    assert!(engine.store().get("general").unwrap().is_none());
}

#[tokio::test]
async fn unreadable_document_gives_partial_success() -> anyhow::Result<()> {
    let docs = tempfile::tempdir()?;
    write_docs(docs.path());
    let engine = engine_with(config(None), vec![ScriptedBackend::new("primary", Mode::Answer("ok"))]);

    let files = vec![docs.path().join("solar.md"), docs.path().join("missing.txt")];
    let report = engine.ingest(IngestRequest::files(files, "general")).await?;
    assert_eq!(report.status, IngestStatus::PartialSuccess);
    assert_eq!((report.documents_processed, report.documents_failed), (1, 1));
    assert_eq!(report.total_vectors, 1);
    assert!(report.failures[0].item.ends_with("missing.txt"));
    assert!(matches!(report.ensure_complete(), Err(Error::IngestionPartialFailure { failed: 1, .. })));
    Ok(())
}

#[tokio::test]
async fn nothing_loadable_is_a_failed_ingestion() -> anyhow::Result<()> {
    let docs = tempfile::tempdir()?;
    let engine = engine_with(config(None), vec![ScriptedBackend::new("primary", Mode::Answer("ok"))]);
    let report = engine.ingest(IngestRequest::files(vec![docs.path().join("nope.md")], "general")).await?;
    assert_eq!(report.status, IngestStatus::Failed);
    assert!(engine.store().get("general")?.is_none());
    Ok(())
}

#[tokio::test]
async fn transient_failures_fail_over_to_next_backend() -> anyhow::Result<()> {
    let docs = tempfile::tempdir()?;
    write_docs(docs.path());
    let primary = ScriptedBackend::new("primary", Mode::Transient);
    let secondary = ScriptedBackend::new("secondary", Mode::Answer("from secondary"));
    let engine = engine_with(config(None), vec![primary.clone(), secondary.clone()]);
    engine.ingest(IngestRequest::directory(docs.path(), "general")).await?;

    let resp = engine.query(QueryRequest::new(WELL, "general")).await?;
    assert_eq!(resp.backend.as_deref(), Some("secondary"));
    assert_eq!(resp.answer, "from secondary");
    // max_retries = 1 means two calls before giving up.
    assert_eq!(primary.calls(), 2);

    let health = engine.health().get("primary").unwrap();
    assert_eq!((health.state, health.consecutive_failures), (HealthState::Degraded, 1));

    let primary_stats = engine.metrics().stats("primary").unwrap();
    assert_eq!(primary_stats.count, 2);
    assert_eq!(primary_stats.success_rate_percent, 0.0);
    let report = engine.metrics().report();
    assert_eq!(report["secondary"].success_rate_percent, 100.0);
    assert!(report.contains_key("embedding:fake-minilm"));
    Ok(())
}

#[tokio::test]
async fn rejected_generation_is_not_retried() -> anyhow::Result<()> {
    let docs = tempfile::tempdir()?;
    write_docs(docs.path());
    let primary = ScriptedBackend::new("primary", Mode::Reject);
    let secondary = ScriptedBackend::new("secondary", Mode::Answer("unused"));
    let engine = engine_with(config(None), vec![primary.clone(), secondary.clone()]);
    engine.ingest(IngestRequest::directory(docs.path(), "general")).await?;

    let err = engine.query(QueryRequest::new(WELL, "general")).await.unwrap_err();
    assert!(matches!(err, Error::Stage { stage: Stage::Generate, attempts: 1, .. }));
    assert!(matches!(err.root(), Error::Rejected(_)));
    assert_eq!((primary.calls(), secondary.calls()), (1, 0));
    assert_eq!(engine.query_stats().queries_failed, 1);
    Ok(())
}

#[tokio::test]
async fn no_selectable_backend_is_service_unavailable() -> anyhow::Result<()> {
    let docs = tempfile::tempdir()?;
    write_docs(docs.path());
    let only = ScriptedBackend::new("primary", Mode::Answer("ok"));
    let engine = engine_with(config(None), vec![only.clone()]);
    engine.ingest(IngestRequest::directory(docs.path(), "general")).await?;

    for _ in 0..3 {
        engine.health().record_failure("primary");
    }
    let err = engine.query(QueryRequest::new(WELL, "general")).await.unwrap_err();
    assert!(matches!(err, Error::Stage { stage: Stage::Generate, attempts: 0, .. }));
    assert!(matches!(err.root(), Error::ServiceUnavailable(_)));
    assert_eq!(only.calls(), 0);
    Ok(())
}

#[tokio::test]
async fn unknown_collection_is_not_found() {
    let engine = engine_with(config(None), vec![ScriptedBackend::new("primary", Mode::Answer("ok"))]);
    let err = engine.query(QueryRequest::new("anything", "ghost")).await.unwrap_err();
    assert!(matches!(err, Error::Stage { stage: Stage::Retrieve, .. }));
    assert!(matches!(err.root(), Error::NotFound(_)));
}

#[tokio::test(start_paused = true)]
async fn slow_generation_times_out_naming_the_stage() -> anyhow::Result<()> {
    let docs = tempfile::tempdir()?;
    write_docs(docs.path());
    let slow = ScriptedBackend::new("primary", Mode::Slow(Duration::from_secs(10)));
    let engine = engine_with(config(None), vec![slow.clone()]);
    engine.ingest(IngestRequest::directory(docs.path(), "general")).await?;

    let mut request = QueryRequest::new(SOLAR, "general");
    request.timeout_ms = Some(5_000);
    let err = engine.query(request).await.unwrap_err();
    match err {
        Error::TimedOut { stage, budget } => {
            assert_eq!(stage, Some(Stage::Generate));
            assert_eq!(budget, Duration::from_secs(5));
        }
        other => panic!("expected TimedOut, got {other:?}"),
    }
    assert_eq!(slow.calls(), 1);

    // The cut-off call is charged to the backend like any other failure.
    let stats = engine.metrics().stats("primary").unwrap();
    assert_eq!(stats.count, 1);
    assert_eq!(stats.success_rate_percent, 0.0);
    let health = engine.health().get("primary").unwrap();
    assert_eq!((health.state, health.consecutive_failures), (HealthState::Degraded, 1));
    Ok(())
}

#[tokio::test]
async fn filters_restrict_sources() -> anyhow::Result<()> {
    let docs = tempfile::tempdir()?;
    write_docs(docs.path());
    let engine = engine_with(config(None), vec![ScriptedBackend::new("primary", Mode::Answer("ok"))]);
    engine.ingest(IngestRequest::directory(docs.path(), "general")).await?;

    let mut request = QueryRequest::new(SOLAR, "general");
    request.filters = Some([("file_type".to_string(), ".txt".to_string())].into_iter().collect());
    let resp = engine.query(request).await?;
    assert_eq!(resp.sources.len(), 1);
    assert_eq!(resp.sources[0].chunk_id, "well.txt:0");
    Ok(())
}

#[tokio::test]
async fn persisted_collection_answers_after_restart() -> anyhow::Result<()> {
    let docs = tempfile::tempdir()?;
    let data = tempfile::tempdir()?;
    write_docs(docs.path());
    fs::write(docs.path().join("garden.md"), GARDEN)?;

    let first = engine_with(config(Some(data.path())), vec![ScriptedBackend::new("primary", Mode::Answer("ok"))]);
    first.ingest(IngestRequest::directory(docs.path(), "general")).await?;
    let before = first.query(QueryRequest::new(GARDEN, "general")).await?;
    assert!(data.path().join("general").join("index.bin").is_file());
    drop(first);

    let second = engine_with(config(Some(data.path())), vec![ScriptedBackend::new("primary", Mode::Answer("ok"))]);
    assert_eq!(second.store().names(), vec!["general".to_string()]);
    let after = second.query(QueryRequest::new(GARDEN, "general")).await?;
    assert!(!after.cache_hit);
    assert_eq!(after.sources, before.sources);

    // Another embedding model cannot open the same data directory.
    let err = Engine::new(config(Some(data.path())), embedder("other-model"), Vec::new()).err().unwrap();
    assert!(matches!(err, Error::ModelMismatch { .. }));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_ingests_and_queries_survive_reload() -> anyhow::Result<()> {
    let docs = tempfile::tempdir()?;
    let data = tempfile::tempdir()?;
    write_docs(docs.path());
    let engine = Arc::new(engine_with(config(Some(data.path())), vec![ScriptedBackend::new("primary", Mode::Answer("ok"))]));
    engine.ingest(IngestRequest::directory(docs.path(), "general")).await?;

    let mut ingests = Vec::new();
    let mut queries = Vec::new();
    for i in 0..12 {
        let file = docs.path().join(format!("note-{i}.txt"));
        fs::write(&file, format!("Inventory note {i}: shelf {i} holds {} jars of preserves.", i * 7))?;
        let engine_i = engine.clone();
        ingests.push(tokio::spawn(async move { engine_i.ingest(IngestRequest::files(vec![file], "general")).await }));
        let engine_q = engine.clone();
        let question = if i % 2 == 0 { SOLAR } else { WELL };
        queries.push(tokio::spawn(async move { engine_q.query(QueryRequest::new(question, "general")).await }));
    }
    for task in ingests {
        assert_eq!(task.await??.status, IngestStatus::Success);
    }
    for task in queries {
        assert!(!task.await??.sources.is_empty());
    }

    let committed = engine.store().require("general")?.len().await;
    assert_eq!(committed, 14);
    drop(engine);

    let reopened = engine_with(config(Some(data.path())), vec![ScriptedBackend::new("primary", Mode::Answer("ok"))]);
    assert_eq!(reopened.store().require("general")?.len().await, committed);
    let hit = reopened.query(QueryRequest::new("Inventory note 11: shelf 11 holds 77 jars of preserves.", "general")).await?;
    assert_eq!(hit.sources[0].chunk_id, "note-11.txt:0");
    Ok(())
}

#[tokio::test]
async fn deleted_collection_is_gone() -> anyhow::Result<()> {
    let docs = tempfile::tempdir()?;
    let data = tempfile::tempdir()?;
    write_docs(docs.path());
    let engine = engine_with(config(Some(data.path())), vec![ScriptedBackend::new("primary", Mode::Answer("ok"))]);
    engine.ingest(IngestRequest::directory(docs.path(), "general")).await?;
    engine.query(QueryRequest::new(SOLAR, "general")).await?;

    assert!(engine.delete_collection("general")?);
    assert!(!data.path().join("general").exists());
    let err = engine.query(QueryRequest::new(SOLAR, "general")).await.unwrap_err();
    assert!(matches!(err.root(), Error::NotFound(_)));
    assert!(!engine.delete_collection("general")?);
    Ok(())
}

#[tokio::test]
async fn unhealthy_backend_is_skipped_after_three_failed_probes() -> anyhow::Result<()> {
    let primary = MockServer::start().await;
    let secondary = MockServer::start().await;
    Mock::given(method("GET")).and(path("/heartbeat")).respond_with(ResponseTemplate::new(500)).mount(&primary).await;
    Mock::given(method("POST")).and(path("/api/generate")).respond_with(ResponseTemplate::new(200)).expect(0).mount(&primary).await;
    Mock::given(method("GET")).and(path("/heartbeat")).respond_with(ResponseTemplate::new(200)).mount(&secondary).await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({"stream": false, "options": {"top_p": 0.9}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"response": "from secondary"})))
        .expect(1)
        .mount(&secondary)
        .await;

    let docs = tempfile::tempdir()?;
    write_docs(docs.path());
    let mut cfg = config(None);
    cfg.embedding.use_fake = true;
    cfg.embedding.fake_dim = 64;
    cfg.backends = vec![
        BackendConfig { id: "primary".into(), url: primary.uri(), model: None, health_path: "/heartbeat".into() },
        BackendConfig { id: "secondary".into(), url: secondary.uri(), model: None, health_path: "/heartbeat".into() },
    ];
    let engine = Engine::from_config(cfg)?;
    engine.ingest(IngestRequest::directory(docs.path(), "general")).await?;

    let monitor = engine.health_monitor()?;
    let mut last = Vec::new();
    for _ in 0..3 {
        last = monitor.probe_once().await;
    }
    assert!(last.contains(&("primary".to_string(), HealthState::Unhealthy)));
    assert!(last.contains(&("secondary".to_string(), HealthState::Healthy)));

    let resp = engine.query(QueryRequest::new(SOLAR, "general")).await?;
    assert_eq!(resp.backend.as_deref(), Some("secondary"));
    assert_eq!(resp.answer, "from secondary");
    Ok(())
}
