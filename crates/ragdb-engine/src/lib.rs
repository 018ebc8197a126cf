//! Retrieval-augmented generation over local document collections.
//!
//! [`Engine`] ties together ingestion (load, chunk, embed, index) and the
//! query path (cache, retrieve, generate) with backend health tracking and
//! latency metrics.

pub mod context;
pub mod engine;
pub mod generation;
pub mod health;
pub mod ingest;
pub mod metrics;
pub mod orchestrator;

pub use engine::Engine;
pub use generation::OllamaGenerator;
pub use health::{BackendHealth, HealthMonitor, HealthRegistry, HealthState, ProbeTarget, RestartHook, RestartPhase};
pub use ingest::{IngestFailure, IngestReport, IngestRequest, IngestSource, IngestStatus, IngestionPipeline};
pub use metrics::{BackendStats, MetricSample, MetricsAggregator};
pub use orchestrator::{CachedAnswer, QueryOrchestrator, QueryRequest, QueryResponse, QueryStats, Source};
