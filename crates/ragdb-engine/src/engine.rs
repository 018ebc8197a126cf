use std::sync::Arc;

use ragdb_core::config::EngineConfig;
use ragdb_core::traits::{EmbeddingService, GenerationBackend};
use ragdb_core::Result;
use ragdb_embed::{embedder_from_config, BatchConfig, EmbeddingBatcher};
use ragdb_vector::{CacheStats, CollectionStore, IndexParams, RetrievalCache};

use crate::generation::OllamaGenerator;
use crate::health::{HealthMonitor, HealthRegistry, ProbeTarget};
use crate::ingest::{IngestReport, IngestRequest, IngestionPipeline};
use crate::metrics::MetricsAggregator;
use crate::orchestrator::{CachedAnswer, QueryOrchestrator, QueryRequest, QueryResponse, QueryStats};

/// Every service wired together from one `EngineConfig`.
pub struct Engine {
    config: EngineConfig,
    store: Arc<CollectionStore>,
    cache: Arc<RetrievalCache<CachedAnswer>>,
    health: Arc<HealthRegistry>,
    metrics: Arc<MetricsAggregator>,
    orchestrator: QueryOrchestrator,
    ingestion: IngestionPipeline,
}

impl Engine {
    /// Build from configuration: HTTP (or fake) embedder and one Ollama
    /// generator per configured backend.
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        let embedder = embedder_from_config(&config.embedding)?;
        let timeout = config.query.timeout();
        let backends = config
            .backends
            .iter()
            .map(|b| OllamaGenerator::from_config(b, timeout).map(|g| Arc::new(g) as Arc<dyn GenerationBackend>))
            .collect::<Result<Vec<_>>>()?;
        Self::new(config, embedder, backends)
    }

    /// Build with explicit services. Persisted collections are opened and
    /// checked against `embedder` up front.
    pub fn new(
        config: EngineConfig,
        embedder: Arc<dyn EmbeddingService>,
        backends: Vec<Arc<dyn GenerationBackend>>,
    ) -> Result<Self> {
        config.validate()?;
        let params = IndexParams::from(&config.index);
        let store = Arc::new(CollectionStore::new(config.index.data_dir(), params, embedder.embedder_id(), None));
        let loaded = store.load_all()?;
        if !loaded.is_empty() {
            tracing::info!(collections = ?loaded, "opened persisted collections");
        }

        let cache = Arc::new(RetrievalCache::from_config(&config.cache));
        let health = Arc::new(HealthRegistry::from_config(&config.health));
        let metrics = Arc::new(MetricsAggregator::new(config.metrics.window));
        let orchestrator = QueryOrchestrator::new(
            embedder.clone(),
            store.clone(),
            cache.clone(),
            backends,
            health.clone(),
            metrics.clone(),
            config.query.clone(),
        );
        let batcher = EmbeddingBatcher::new(embedder, BatchConfig::from(&config.embedding));
        let ingestion = IngestionPipeline::new(store.clone(), batcher, cache.clone(), config.chunking);
        Ok(Self { config, store, cache, health, metrics, orchestrator, ingestion })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestReport> {
        self.ingestion.ingest(request).await
    }

    pub async fn query(&self, request: QueryRequest) -> Result<QueryResponse> {
        self.orchestrator.query(request).await
    }

    pub fn delete_collection(&self, name: &str) -> Result<bool> {
        self.ingestion.delete_collection(name)
    }

    /// Monitor probing every configured backend, reporting into this
    /// engine's health registry.
    pub fn health_monitor(&self) -> Result<HealthMonitor> {
        let targets = self.config.backends.iter().map(ProbeTarget::from).collect();
        HealthMonitor::new(self.health.clone(), targets, &self.config.health)
    }

    pub fn store(&self) -> &Arc<CollectionStore> {
        &self.store
    }

    pub fn health(&self) -> &Arc<HealthRegistry> {
        &self.health
    }

    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.metrics
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn query_stats(&self) -> QueryStats {
        self.orchestrator.stats()
    }
}
