//! Backend health tracking and the periodic probe loop.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use ragdb_core::config::{BackendConfig, HealthConfig};
use ragdb_core::Result;
use ragdb_embed::http::{build_client, classify_send_error, classify_status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "phase")]
pub enum RestartPhase {
    Monitoring,
    Restarting { attempt: u32 },
    GaveUp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendHealth {
    pub backend_id: String,
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub last_probe_time: Option<DateTime<Utc>>,
    pub restart_phase: RestartPhase,
    pub restarts: u32,
}

impl BackendHealth {
    fn new(backend_id: &str) -> Self {
        Self {
            backend_id: backend_id.to_string(),
            state: HealthState::Healthy,
            consecutive_failures: 0,
            last_probe_time: None,
            restart_phase: RestartPhase::Monitoring,
            restarts: 0,
        }
    }

    pub fn is_selectable(&self) -> bool {
        self.state != HealthState::Unhealthy && self.restart_phase != RestartPhase::GaveUp
    }
}

/// Shared health table. Probes and the query path both report into it.
pub struct HealthRegistry {
    unhealthy_after: u32,
    max_restarts: u32,
    backends: DashMap<String, BackendHealth>,
}

impl HealthRegistry {
    pub fn new(unhealthy_after: u32, max_restarts: u32) -> Self {
        Self { unhealthy_after: unhealthy_after.max(1), max_restarts, backends: DashMap::new() }
    }

    pub fn from_config(config: &HealthConfig) -> Self {
        Self::new(config.unhealthy_after, config.max_restarts)
    }

    pub fn register(&self, backend_id: &str) {
        self.backends.entry(backend_id.to_string()).or_insert_with(|| BackendHealth::new(backend_id));
    }

    pub fn get(&self, backend_id: &str) -> Option<BackendHealth> {
        self.backends.get(backend_id).map(|b| b.clone())
    }

    pub fn snapshot(&self) -> Vec<BackendHealth> {
        let mut all: Vec<BackendHealth> = self.backends.iter().map(|b| b.clone()).collect();
        all.sort_by(|a, b| a.backend_id.cmp(&b.backend_id));
        all
    }

    /// Unknown backends are selectable until something is reported about them.
    pub fn is_selectable(&self, backend_id: &str) -> bool {
        self.backends.get(backend_id).map_or(true, |b| b.is_selectable())
    }

    pub fn record_success(&self, backend_id: &str) {
        let mut entry = self.backends.entry(backend_id.to_string()).or_insert_with(|| BackendHealth::new(backend_id));
        if entry.state != HealthState::Healthy {
            tracing::info!(backend = backend_id, "backend recovered");
        }
        entry.state = HealthState::Healthy;
        entry.consecutive_failures = 0;
        entry.last_probe_time = Some(Utc::now());
        entry.restart_phase = RestartPhase::Monitoring;
        entry.restarts = 0;
    }

    /// Count one failure and return the resulting state.
    pub fn record_failure(&self, backend_id: &str) -> HealthState {
        let mut entry = self.backends.entry(backend_id.to_string()).or_insert_with(|| BackendHealth::new(backend_id));
        entry.consecutive_failures += 1;
        entry.last_probe_time = Some(Utc::now());
        let next = if entry.consecutive_failures >= self.unhealthy_after {
            HealthState::Unhealthy
        } else {
            HealthState::Degraded
        };
        if next == HealthState::Unhealthy && entry.state != HealthState::Unhealthy {
            tracing::warn!(backend = backend_id, failures = entry.consecutive_failures, "backend marked unhealthy");
        }
        entry.state = next;
        next
    }

    /// Claim the next restart attempt for an unhealthy backend, or give up
    /// once `max_restarts` have been spent.
    pub fn begin_restart(&self, backend_id: &str) -> Option<u32> {
        let mut entry = self.backends.get_mut(backend_id)?;
        if entry.state != HealthState::Unhealthy || entry.restart_phase == RestartPhase::GaveUp {
            return None;
        }
        if entry.restarts >= self.max_restarts {
            entry.restart_phase = RestartPhase::GaveUp;
            tracing::error!(backend = backend_id, restarts = entry.restarts, "giving up on backend");
            return None;
        }
        entry.restarts += 1;
        entry.restart_phase = RestartPhase::Restarting { attempt: entry.restarts };
        Some(entry.restarts)
    }

    pub fn finish_restart(&self, backend_id: &str, ok: bool) {
        if let Some(mut entry) = self.backends.get_mut(backend_id) {
            entry.restart_phase = if !ok && entry.restarts >= self.max_restarts {
                RestartPhase::GaveUp
            } else {
                RestartPhase::Monitoring
            };
        }
    }
}

/// Operator-supplied action run when a backend goes unhealthy.
#[async_trait]
pub trait RestartHook: Send + Sync {
    async fn restart(&self, backend_id: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub backend_id: String,
    pub url: String,
}

impl From<&BackendConfig> for ProbeTarget {
    fn from(b: &BackendConfig) -> Self {
        Self {
            backend_id: b.id.clone(),
            url: format!("{}{}", b.url.trim_end_matches('/'), b.health_path),
        }
    }
}

pub struct HealthMonitor {
    registry: Arc<HealthRegistry>,
    client: Client,
    targets: Vec<ProbeTarget>,
    interval: Duration,
    hook: Option<Arc<dyn RestartHook>>,
}

impl HealthMonitor {
    pub fn new(registry: Arc<HealthRegistry>, targets: Vec<ProbeTarget>, config: &HealthConfig) -> Result<Self> {
        for t in &targets {
            registry.register(&t.backend_id);
        }
        Ok(Self {
            registry,
            client: build_client(config.probe_timeout())?,
            targets,
            interval: config.interval(),
            hook: None,
        })
    }

    pub fn with_restart_hook(mut self, hook: Arc<dyn RestartHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn registry(&self) -> &Arc<HealthRegistry> {
        &self.registry
    }

    async fn probe(&self, target: &ProbeTarget) -> Result<()> {
        let response = self.client.get(&target.url).send().await.map_err(|e| classify_send_error(&e))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(classify_status(status, &body))
        }
    }

    async fn maybe_restart(&self, backend_id: &str) {
        let Some(hook) = &self.hook else { return };
        let Some(attempt) = self.registry.begin_restart(backend_id) else { return };
        tracing::info!(backend = backend_id, attempt, "restarting backend");
        let ok = match hook.restart(backend_id).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(backend = backend_id, attempt, error = %e, "restart failed");
                false
            }
        };
        self.registry.finish_restart(backend_id, ok);
    }

    /// Probe every backend concurrently and update the registry.
    pub async fn probe_once(&self) -> Vec<(String, HealthState)> {
        let probes = self.targets.iter().map(|t| async move { (t, self.probe(t).await) });
        let results = futures::future::join_all(probes).await;
        let mut states = Vec::with_capacity(results.len());
        for (target, result) in results {
            let id = target.backend_id.as_str();
            let state = match result {
                Ok(()) => {
                    self.registry.record_success(id);
                    HealthState::Healthy
                }
                Err(e) => {
                    tracing::debug!(backend = id, error = %e, "health probe failed");
                    let state = self.registry.record_failure(id);
                    if state == HealthState::Unhealthy {
                        self.maybe_restart(id).await;
                    }
                    state
                }
            };
            states.push((id.to_string(), state));
        }
        states
    }

    /// Run `probe_once` every interval until the handle is aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.probe_once().await;
            }
        })
    }
}
