//! Configuration loader and path helpers.
//!
//! Uses Figment to merge built-in defaults, `config.toml`, `config.<env>.toml`
//! and `APP_*` env vars (`__` separates nested keys, e.g.
//! `APP_QUERY__TIMEOUT_MS=5000`) into a typed [`EngineConfig`].

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::chunker::ChunkingConfig;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

pub struct Config {
    figment: Figment,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let env_name = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());

        let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()))
            .merge(Toml::file("config.toml"));
        match env_name.as_str() {
            "dev" | "development" => figment = figment.merge(Toml::file("config.dev.toml")),
            "prod" | "production" => figment = figment.merge(Toml::file("config.prod.toml")),
            "test" | "testing" => figment = figment.merge(Toml::file("config.test.toml")),
            _ => {}
        }
        figment = figment.merge(Env::prefixed("APP_").split("__"));

        let config = Self { figment };
        config.engine()?;
        Ok(config)
    }

    pub fn from_figment(figment: Figment) -> Self {
        Self { figment }
    }

    pub fn get<T>(&self, key: &str) -> anyhow::Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.figment
            .extract_inner(key)
            .map_err(|e| anyhow::anyhow!("Failed to get '{}': {}", key, e))
    }

    /// The typed engine configuration, validated.
    pub fn engine(&self) -> Result<EngineConfig> {
        let cfg: EngineConfig = self
            .figment
            .extract()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub index: IndexConfig,
    pub cache: CacheConfig,
    pub query: QueryConfig,
    pub backends: Vec<BackendConfig>,
    pub health: HealthConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub url: String,
    pub model: String,
    pub batch_size: usize,
    pub max_batch_retries: u32,
    pub backoff_ms: u64,
    pub concurrency: usize,
    pub timeout_secs: u64,
    /// Use the deterministic hashing embedder instead of the HTTP service.
    pub use_fake: bool,
    pub fake_dim: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:11434".into(),
            model: "all-minilm".into(),
            batch_size: 32,
            max_batch_retries: 3,
            backoff_ms: 200,
            concurrency: 4,
            timeout_secs: 30,
            use_fake: false,
            fake_dim: 384,
        }
    }
}

impl EmbeddingConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_batch_retries + 1, Duration::from_millis(self.backoff_ms))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IndexConfig {
    /// Root for persisted collections; empty disables persistence.
    pub data_dir: String,
    /// Collections trained on fewer vectors than this use exact search.
    pub exact_threshold: usize,
    pub nprobe: usize,
    pub kmeans_iterations: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self { data_dir: "data/indexes".into(), exact_threshold: 1000, nprobe: 8, kmeans_iterations: 20 }
    }
}

impl IndexConfig {
    pub fn data_dir(&self) -> Option<PathBuf> {
        (!self.data_dir.trim().is_empty()).then(|| expand_path(&self.data_dir))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Entries per collection partition.
    pub capacity: usize,
    /// Zero disables expiry.
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 1024, ttl_secs: 3600 }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_secs > 0).then(|| Duration::from_secs(self.ttl_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueryConfig {
    pub default_k: usize,
    pub max_context_chars: usize,
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub timeout_ms: u64,
    pub default_model: String,
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_k: 3,
            max_context_chars: 4000,
            max_retries: 2,
            backoff_ms: 250,
            timeout_ms: 30_000,
            default_model: "llama3.1:8b-instruct-q5_K_M".into(),
            temperature: 0.7,
            top_p: 0.9,
        }
    }
}

impl QueryConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries + 1, Duration::from_millis(self.backoff_ms))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

fn default_health_path() -> String {
    "/heartbeat".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_secs: u64,
    pub probe_timeout_secs: u64,
    /// Consecutive failures before a backend is UNHEALTHY.
    pub unhealthy_after: u32,
    pub max_restarts: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { interval_secs: 60, probe_timeout_secs: 10, unhealthy_after: 3, max_restarts: 3 }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Samples kept per backend.
    pub window: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { window: 1000 }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.chunking.validate()?;
        let positive = [
            ("embedding.batch_size", self.embedding.batch_size),
            ("embedding.concurrency", self.embedding.concurrency),
            ("cache.capacity", self.cache.capacity),
            ("index.nprobe", self.index.nprobe),
            ("query.default_k", self.query.default_k),
            ("metrics.window", self.metrics.window),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::InvalidConfig(format!("{} must be greater than zero", name)));
            }
        }
        if self.health.unhealthy_after == 0 {
            return Err(Error::InvalidConfig("health.unhealthy_after must be greater than zero".into()));
        }
        if self.embedding.use_fake && self.embedding.fake_dim == 0 {
            return Err(Error::InvalidConfig("embedding.fake_dim must be greater than zero".into()));
        }
        let mut seen = HashSet::new();
        for b in &self.backends {
            if !seen.insert(b.id.as_str()) {
                return Err(Error::InvalidConfig(format!("duplicate backend id '{}'", b.id)));
            }
        }
        Ok(())
    }
}

/// Expand a user-provided path string:
/// - Expands leading '~' to the user's home directory
/// - Expands ${VAR} and $VAR environment variables
/// - Returns a PathBuf without attempting to canonicalize
pub fn expand_path<S: AsRef<str>>(input: S) -> PathBuf {
    let s = input.as_ref();
    let expanded_env = shellexpand::env(s).unwrap_or(std::borrow::Cow::Borrowed(s));
    let expanded = shellexpand::tilde(&expanded_env);
    PathBuf::from(expanded.as_ref())
}

