//! Query path: cache check, query embedding, retrieval, context assembly and
//! generation with health-aware failover.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ragdb_core::config::QueryConfig;
use ragdb_core::retry::retry_transient;
use ragdb_core::traits::{EmbeddingService, GenerationBackend, GenerationRequest};
use ragdb_core::types::{ChunkId, Meta, SearchHit, Stage};
use ragdb_core::{Error, Result};
use ragdb_embed::l2_normalize;
use ragdb_vector::{cache_key, CollectionStore, RetrievalCache};

use crate::context::{assemble_context, build_prompt};
use crate::health::HealthRegistry;
use crate::metrics::MetricsAggregator;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    pub collection: String,
    #[serde(default)]
    pub k: Option<usize>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub filters: Option<Meta>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>, collection: impl Into<String>) -> Self {
        Self { query: query.into(), collection: collection.into(), ..Self::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub chunk_id: ChunkId,
    pub score: f32,
    pub metadata: Meta,
}

impl From<&SearchHit> for Source {
    fn from(h: &SearchHit) -> Self {
        Self { chunk_id: h.chunk_id.clone(), score: h.score, metadata: h.metadata.clone() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub answer: String,
    pub sources: Vec<Source>,
    pub query: String,
    pub collection: String,
    pub model: String,
    pub backend: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub cache_hit: bool,
    pub latency_ms: u64,
}

/// What the cache keeps for a query.
#[derive(Debug, Clone)]
pub struct CachedAnswer {
    pub answer: String,
    pub sources: Vec<Source>,
    pub backend: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryStats {
    pub queries_processed: u64,
    pub queries_succeeded: u64,
    pub queries_failed: u64,
    pub cache_hits: u64,
    pub mean_latency_ms: f64,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cache_hits: AtomicU64,
    latency_micros: AtomicU64,
}

/// Progress of one query; read when the budget expires.
#[derive(Default)]
struct QueryTrace {
    stage: Mutex<Option<Stage>>,
    /// Backend call in flight and when it started.
    call: Mutex<Option<(String, Instant)>>,
}

impl QueryTrace {
    fn enter(&self, stage: Stage) {
        tracing::debug!(%stage, "entering stage");
        *self.stage.lock() = Some(stage);
    }

    fn current(&self) -> Option<Stage> {
        *self.stage.lock()
    }

    fn call_started(&self, backend: &str) -> Instant {
        let now = Instant::now();
        *self.call.lock() = Some((backend.to_string(), now));
        now
    }

    fn call_finished(&self) {
        self.call.lock().take();
    }

    fn abandoned_call(&self) -> Option<(String, Instant)> {
        self.call.lock().take()
    }
}

pub struct QueryOrchestrator {
    embedder: Arc<dyn EmbeddingService>,
    store: Arc<CollectionStore>,
    cache: Arc<RetrievalCache<CachedAnswer>>,
    backends: Vec<Arc<dyn GenerationBackend>>,
    health: Arc<HealthRegistry>,
    metrics: Arc<MetricsAggregator>,
    config: QueryConfig,
    counters: Counters,
}

impl QueryOrchestrator {
    /// `backends` are tried in the order given.
    pub fn new(
        embedder: Arc<dyn EmbeddingService>,
        store: Arc<CollectionStore>,
        cache: Arc<RetrievalCache<CachedAnswer>>,
        backends: Vec<Arc<dyn GenerationBackend>>,
        health: Arc<HealthRegistry>,
        metrics: Arc<MetricsAggregator>,
        config: QueryConfig,
    ) -> Self {
        for b in &backends {
            health.register(b.id());
        }
        Self { embedder, store, cache, backends, health, metrics, config, counters: Counters::default() }
    }

    pub async fn query(&self, request: QueryRequest) -> Result<QueryResponse> {
        let started = Instant::now();
        let budget = request.timeout_ms.map(Duration::from_millis).unwrap_or_else(|| self.config.timeout());
        let trace = QueryTrace::default();
        tracing::info!(collection = %request.collection, "query received");

        let outcome = match tokio::time::timeout(budget, self.run(&request, &trace, started)).await {
            Ok(result) => result,
            Err(_) => {
                // The cancelled backend call still counts against that backend.
                if let Some((backend, call_started)) = trace.abandoned_call() {
                    self.metrics.record(&backend, call_started.elapsed(), false);
                    let state = self.health.record_failure(&backend);
                    tracing::warn!(backend = %backend, ?state, "generation cut off by query timeout");
                }
                Err(Error::TimedOut { stage: trace.current(), budget })
            }
        };

        let elapsed = started.elapsed();
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        self.counters.latency_micros.fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        match &outcome {
            Ok(resp) => {
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                if resp.cache_hit {
                    self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                }
                tracing::info!(
                    collection = %resp.collection,
                    cache_hit = resp.cache_hit,
                    backend = resp.backend.as_deref().unwrap_or("-"),
                    latency_ms = resp.latency_ms,
                    "query answered"
                );
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(collection = %request.collection, error = %e, "query failed");
            }
        }
        outcome
    }

    async fn run(&self, request: &QueryRequest, trace: &QueryTrace, started: Instant) -> Result<QueryResponse> {
        if request.query.trim().is_empty() {
            return Err(Error::Rejected("empty query".to_string()));
        }
        let k = request.k.unwrap_or(self.config.default_k);
        if k == 0 {
            return Err(Error::InvalidConfig("k must be at least 1".to_string()));
        }
        let model = request.model.clone().unwrap_or_else(|| self.config.default_model.clone());
        let collection_name = request.collection.as_str();

        let key = cache_key(&request.query, collection_name, k, request.filters.as_ref(), &model);
        let generation = self.cache.generation(collection_name);
        if let Some(cached) = self.cache.get(collection_name, &key) {
            tracing::debug!(collection = collection_name, "cache hit");
            return Ok(self.respond(request, &model, cached, true, started));
        }

        trace.enter(Stage::EmbedQuery);
        let collection = self.store.require(collection_name).map_err(|e| e.at_stage(Stage::Retrieve, 1))?;
        collection
            .check_compatible(self.embedder.embedder_id(), collection.dimension())
            .map_err(|e| e.at_stage(Stage::EmbedQuery, 1))?;
        let query_vector = self.embed_query(&request.query, collection.dimension(), collection_name).await?;

        trace.enter(Stage::Retrieve);
        let hits = collection
            .search(&query_vector, k, request.filters.as_ref())
            .await
            .map_err(|e| e.at_stage(Stage::Retrieve, 1))?;

        trace.enter(Stage::AssembleContext);
        let (context, used) = assemble_context(&hits, self.config.max_context_chars);
        tracing::debug!(hits = hits.len(), used = used.len(), chars = context.chars().count(), "context assembled");
        let prompt = build_prompt(&context, &request.query);

        trace.enter(Stage::Generate);
        let gen_request = GenerationRequest {
            model: model.clone(),
            prompt,
            temperature: self.config.temperature,
            top_p: self.config.top_p,
        };
        let (answer, backend) = self.generate(&gen_request, trace).await?;

        let cached = CachedAnswer { answer, sources: hits.iter().map(Source::from).collect(), backend: Some(backend) };
        match self.cache.put(collection_name, key, cached.clone(), generation) {
            Ok(()) => {}
            Err(Error::CacheInvalidationConflict { .. }) => {
                tracing::debug!(collection = collection_name, "collection changed during query, result not cached");
            }
            Err(e) => return Err(e),
        }
        Ok(self.respond(request, &model, cached, false, started))
    }

    async fn embed_query(&self, query: &str, dimension: usize, collection: &str) -> Result<Vec<f32>> {
        let texts = [query.to_string()];
        let embedder_id = self.embedder.embedder_id().to_string();
        let started = Instant::now();
        let outcome = retry_transient(&self.config.retry_policy(), "embed query", |_| self.embedder.embed(&texts)).await;
        self.metrics.record(&format!("embedding:{embedder_id}"), started.elapsed(), outcome.result.is_ok());
        let attempts = outcome.attempts;
        let mut vector = outcome
            .result
            .and_then(|mut v| v.pop().ok_or_else(|| Error::Rejected("embedder returned no vector".to_string())))
            .map_err(|e| e.at_stage(Stage::EmbedQuery, attempts))?;
        if vector.len() != dimension {
            return Err(Error::DimensionMismatch {
                collection: collection.to_string(),
                expected: dimension,
                actual: vector.len(),
            }
            .at_stage(Stage::EmbedQuery, attempts));
        }
        if !l2_normalize(&mut vector) {
            return Err(Error::Rejected("query embedding has zero norm".to_string()).at_stage(Stage::EmbedQuery, attempts));
        }
        Ok(vector)
    }

    /// Try selectable backends in priority order.
    async fn generate(&self, request: &GenerationRequest, trace: &QueryTrace) -> Result<(String, String)> {
        let candidates: Vec<&Arc<dyn GenerationBackend>> =
            self.backends.iter().filter(|b| self.health.is_selectable(b.id())).collect();
        if candidates.is_empty() {
            return Err(Error::ServiceUnavailable("no healthy generation backend".to_string()).at_stage(Stage::Generate, 0));
        }

        let policy = self.config.retry_policy();
        let mut total_attempts = 0u32;
        let mut last_error = None;
        for backend in candidates {
            let id = backend.id();
            let outcome = retry_transient(&policy, id, |attempt| {
                let backend = backend.clone();
                let metrics = self.metrics.clone();
                async move {
                    let started = trace.call_started(backend.id());
                    let result = backend.generate(request).await;
                    trace.call_finished();
                    metrics.record(backend.id(), started.elapsed(), result.is_ok());
                    if let Err(e) = &result {
                        tracing::debug!(backend = backend.id(), attempt, error = %e, "generation attempt failed");
                    }
                    result
                }
            })
            .await;
            total_attempts += outcome.attempts;
            match outcome.result {
                Ok(answer) => {
                    self.health.record_success(id);
                    return Ok((answer, id.to_string()));
                }
                Err(e) if e.is_transient() => {
                    let state = self.health.record_failure(id);
                    tracing::warn!(backend = id, attempts = outcome.attempts, ?state, error = %e, "backend exhausted retries, failing over");
                    last_error = Some(e);
                }
                Err(e) => return Err(e.at_stage(Stage::Generate, total_attempts)),
            }
        }
        let e = last_error.unwrap_or_else(|| Error::ServiceUnavailable("no healthy generation backend".to_string()));
        Err(e.at_stage(Stage::Generate, total_attempts))
    }

    fn respond(&self, request: &QueryRequest, model: &str, cached: CachedAnswer, cache_hit: bool, started: Instant) -> QueryResponse {
        QueryResponse {
            answer: cached.answer,
            sources: cached.sources,
            query: request.query.clone(),
            collection: request.collection.clone(),
            model: model.to_string(),
            backend: cached.backend,
            timestamp: Utc::now(),
            cache_hit,
            latency_ms: started.elapsed().as_millis() as u64,
        }
    }

    pub fn stats(&self) -> QueryStats {
        let processed = self.counters.processed.load(Ordering::Relaxed);
        let micros = self.counters.latency_micros.load(Ordering::Relaxed);
        QueryStats {
            queries_processed: processed,
            queries_succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            queries_failed: self.counters.failed.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            mean_latency_ms: if processed == 0 { 0.0 } else { micros as f64 / processed as f64 / 1000.0 },
        }
    }
}
