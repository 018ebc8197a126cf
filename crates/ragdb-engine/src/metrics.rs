//! Per-backend latency and outcome tracking.
//!
//! Each backend gets a fixed-size ring buffer of samples behind its own lock.
//! Statistics are computed on demand from a copy of the buffer.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub backend_id: String,
    pub latency: Duration,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendStats {
    pub count: usize,
    pub success_rate_percent: f64,
    pub latency_mean_ms: f64,
    pub latency_median_ms: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub latency_min_ms: f64,
    pub latency_max_ms: f64,
}

/// Nearest-rank percentile: `sorted[min(len - 1, floor(len * q))]`.
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 * q).floor() as usize).min(sorted.len() - 1);
    sorted[idx]
}

fn median(sorted: &[f64]) -> f64 {
    match sorted.len() {
        0 => 0.0,
        n if n % 2 == 1 => sorted[n / 2],
        n => (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0,
    }
}

impl BackendStats {
    pub fn from_samples(samples: &[MetricSample]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut latencies: Vec<f64> = samples.iter().map(|s| s.latency.as_secs_f64() * 1000.0).collect();
        latencies.sort_by(f64::total_cmp);
        let count = samples.len();
        let successes = samples.iter().filter(|s| s.success).count();
        Some(Self {
            count,
            success_rate_percent: successes as f64 * 100.0 / count as f64,
            latency_mean_ms: latencies.iter().sum::<f64>() / count as f64,
            latency_median_ms: median(&latencies),
            latency_p50_ms: percentile(&latencies, 0.50),
            latency_p95_ms: percentile(&latencies, 0.95),
            latency_p99_ms: percentile(&latencies, 0.99),
            latency_min_ms: latencies[0],
            latency_max_ms: latencies[count - 1],
        })
    }
}

type Ring = Arc<Mutex<VecDeque<MetricSample>>>;

pub struct MetricsAggregator {
    window: usize,
    buffers: DashMap<String, Ring>,
}

impl MetricsAggregator {
    pub fn new(window: usize) -> Self {
        Self { window: window.max(1), buffers: DashMap::new() }
    }

    fn ring(&self, backend_id: &str) -> Ring {
        if let Some(r) = self.buffers.get(backend_id) {
            return r.clone();
        }
        self.buffers
            .entry(backend_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::with_capacity(self.window))))
            .clone()
    }

    pub fn record(&self, backend_id: &str, latency: Duration, success: bool) {
        let sample = MetricSample { backend_id: backend_id.to_string(), latency, success, timestamp: Utc::now() };
        let ring = self.ring(backend_id);
        let mut buf = ring.lock();
        if buf.len() == self.window {
            buf.pop_front();
        }
        buf.push_back(sample);
    }

    /// Copy of the samples currently held for `backend_id`, oldest first.
    pub fn snapshot(&self, backend_id: &str) -> Vec<MetricSample> {
        self.buffers
            .get(backend_id)
            .map(|r| r.value().clone())
            .map(|ring| ring.lock().iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self, backend_id: &str) -> Option<BackendStats> {
        BackendStats::from_samples(&self.snapshot(backend_id))
    }

    pub fn backends(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.buffers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Statistics for every backend that has samples.
    pub fn report(&self) -> BTreeMap<String, BackendStats> {
        self.backends()
            .into_iter()
            .filter_map(|id| self.stats(&id).map(|s| (id, s)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_rank_percentiles() {
        let v: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(percentile(&v, 0.50), 51.0);
        assert_eq!(percentile(&v, 0.95), 96.0);
        assert_eq!(percentile(&v, 0.99), 100.0);
        assert_eq!(percentile(&[4.0], 0.99), 4.0);
    }

    #[test]
    fn window_drops_oldest() {
        let m = MetricsAggregator::new(3);
        for ms in [10, 20, 30, 40] {
            m.record("a", Duration::from_millis(ms), true);
        }
        let snap = m.snapshot("a");
        assert_eq!(snap.len(), 3);
        assert_eq!(snap[0].latency, Duration::from_millis(20));
    }
}
