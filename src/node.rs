//! Node (component A): one Ollama-compatible HTTP endpoint.
//!
//! Identity is by resolved IP, not by the textual URL a caller typed in — see `registry.rs` for
//! the dedup logic that relies on this. `Node` itself only tracks capabilities and mutable metrics
//! for one already-resolved endpoint.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Smoothing factor for the exponential moving average of latency.
const EMA_ALPHA: f64 = 0.3;

/// Static capabilities of a node, refreshed best-effort by `probe_capabilities`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeCapabilities {
    pub has_gpu: bool,
    pub gpu_count: u32,
    pub gpu_memory_mb: u64,
    pub cpu_count: u32,
    pub total_memory_mb: u64,
    pub loaded_models: Vec<String>,
}

/// A snapshot of a node's mutable metrics, cheap to clone and pass to the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub avg_latency_ms: f64,
    pub last_latency_ms: f64,
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub is_healthy: bool,
    pub last_error: Option<String>,
}

impl NodeMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            let successful = self.total_requests.saturating_sub(self.failed_requests);
            successful as f64 / self.total_requests as f64
        }
    }

    pub fn failure_rate(&self) -> f64 {
        1.0 - self.success_rate()
    }
}

/// One Ollama-API-compatible HTTP endpoint and everything the orchestrator has learned about it.
pub struct Node {
    pub url: String,
    pub name: String,
    pub priority: i32,
    capabilities: RwLock<NodeCapabilities>,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    // avg_latency_ms and last_latency_ms stored as bits of an f64 behind an atomic for lock-free
    // reads on the hot scoring path; writes go through `record_outcome`, which is the only mutator.
    avg_latency_bits: AtomicU64,
    last_latency_bits: AtomicU64,
    is_healthy: AtomicBool,
    last_health_check_at: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
}

impl Node {
    pub fn new(url: impl Into<String>, name: impl Into<String>, priority: i32) -> Self {
        Self {
            url: url.into(),
            name: name.into(),
            priority,
            capabilities: RwLock::new(NodeCapabilities::default()),
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            avg_latency_bits: AtomicU64::new(0f64.to_bits()),
            last_latency_bits: AtomicU64::new(0f64.to_bits()),
            is_healthy: AtomicBool::new(false),
            last_health_check_at: RwLock::new(None),
            last_error: RwLock::new(None),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.is_healthy.load(Ordering::Acquire)
    }

    pub fn avg_latency_ms(&self) -> f64 {
        f64::from_bits(self.avg_latency_bits.load(Ordering::Acquire))
    }

    fn set_avg_latency_ms(&self, value: f64) {
        self.avg_latency_bits.store(value.to_bits(), Ordering::Release);
    }

    pub fn last_latency_ms(&self) -> f64 {
        f64::from_bits(self.last_latency_bits.load(Ordering::Acquire))
    }

    pub async fn metrics_snapshot(&self) -> NodeMetrics {
        NodeMetrics {
            total_requests: self.total_requests.load(Ordering::Acquire),
            failed_requests: self.failed_requests.load(Ordering::Acquire),
            avg_latency_ms: self.avg_latency_ms(),
            last_latency_ms: self.last_latency_ms(),
            last_health_check_at: *self.last_health_check_at.read().await,
            is_healthy: self.is_healthy(),
            last_error: self.last_error.read().await.clone(),
        }
    }

    pub async fn capabilities_snapshot(&self) -> NodeCapabilities {
        self.capabilities.read().await.clone()
    }

    /// Hit `/api/tags` with `timeout`. Non-fatal on failure: flips `is_healthy` and caches the
    /// error string instead of propagating.
    pub async fn probe_health(&self, client: &reqwest::Client, timeout: Duration) -> bool {
        let start = std::time::Instant::now();
        let url = format!("{}/api/tags", self.url.trim_end_matches('/'));

        match client.get(&url).timeout(timeout).send().await {
            Ok(resp) if resp.status().is_success() => {
                let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
                self.last_latency_bits.store(latency_ms.to_bits(), Ordering::Release);
                *self.last_health_check_at.write().await = Some(Utc::now());
                self.is_healthy.store(true, Ordering::Release);
                *self.last_error.write().await = None;

                if let Ok(body) = resp.json::<serde_json::Value>().await {
                    if let Some(models) = body.get("models").and_then(|v| v.as_array()) {
                        let tags: Vec<String> = models
                            .iter()
                            .filter_map(|m| m.get("name").and_then(|n| n.as_str()))
                            .map(str::to_string)
                            .collect();
                        self.capabilities.write().await.loaded_models = tags;
                    }
                }
                debug!(node = %self.url, latency_ms, "health probe succeeded");
                true
            }
            Ok(resp) => {
                self.mark_unhealthy(format!("non-2xx status {}", resp.status())).await;
                false
            }
            Err(err) => {
                self.mark_unhealthy(err.to_string()).await;
                false
            }
        }
    }

    async fn mark_unhealthy(&self, error: String) {
        *self.last_health_check_at.write().await = Some(Utc::now());
        self.is_healthy.store(false, Ordering::Release);
        warn!(node = %self.url, %error, "health probe failed");
        *self.last_error.write().await = Some(error);
    }

    /// Best-effort fill of GPU/CPU capability fields. Any field that can't be determined keeps
    /// its default; this never fails the caller.
    pub async fn probe_capabilities(&self, client: &reqwest::Client, timeout: Duration) {
        let url = format!("{}/api/ps", self.url.trim_end_matches('/'));
        let Ok(resp) = client.get(&url).timeout(timeout).send().await else {
            return;
        };
        let Ok(body) = resp.json::<serde_json::Value>().await else {
            return;
        };

        let mut caps = self.capabilities.write().await;
        if let Some(models) = body.get("models").and_then(|v| v.as_array()) {
            for model in models {
                if model
                    .get("size_vram")
                    .and_then(|v| v.as_u64())
                    .is_some_and(|v| v > 0)
                {
                    caps.has_gpu = true;
                }
            }
        }
    }

    /// Record the outcome of one completed inference call. Updates the EMA latency and the
    /// request/failure counters. This is the only place node metrics are mutated outside of
    /// health probing.
    pub fn record_outcome(&self, duration_ms: f64, success: bool) {
        self.total_requests.fetch_add(1, Ordering::AcqRel);
        if !success {
            self.failed_requests.fetch_add(1, Ordering::AcqRel);
        }

        self.last_latency_bits.store(duration_ms.to_bits(), Ordering::Release);

        let previous = self.avg_latency_ms();
        let updated = if previous == 0.0 {
            duration_ms
        } else {
            EMA_ALPHA * duration_ms + (1.0 - EMA_ALPHA) * previous
        };
        self.set_avg_latency_ms(updated);
    }

    /// `load_score ∈ [0,1]`; unhealthy nodes always score 1.0 (maximally loaded).
    pub fn compute_load_score(&self) -> f64 {
        if !self.is_healthy() {
            return 1.0;
        }
        let total = self.total_requests.load(Ordering::Acquire);
        let failed = self.failed_requests.load(Ordering::Acquire);
        let failure_rate = if total == 0 { 0.0 } else { failed as f64 / total as f64 };
        let latency_component = (self.avg_latency_ms() / 10_000.0).min(1.0);
        0.5 * failure_rate + 0.5 * latency_component
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_node_is_unhealthy_until_probed() {
        let node = Node::new("http://localhost:11434", "local", 0);
        assert!(!node.is_healthy());
        assert_eq!(node.compute_load_score(), 1.0);
    }

    #[test]
    fn record_outcome_updates_ema_within_bounds() {
        let node = Node::new("http://localhost:11434", "local", 0);
        node.is_healthy.store(true, Ordering::Release);

        node.record_outcome(100.0, true);
        assert_eq!(node.avg_latency_ms(), 100.0);

        let previous = node.avg_latency_ms();
        node.record_outcome(300.0, true);
        let updated = node.avg_latency_ms();

        // EMA bounds invariant: updated value lies between previous and the new sample.
        assert!(updated >= previous.min(300.0));
        assert!(updated <= previous.max(300.0));
    }

    #[test]
    fn failed_requests_never_exceed_total() {
        let node = Node::new("http://localhost:11434", "local", 0);
        node.record_outcome(50.0, false);
        node.record_outcome(50.0, true);

        assert_eq!(node.total_requests.load(Ordering::Acquire), 2);
        assert_eq!(node.failed_requests.load(Ordering::Acquire), 1);
    }

    #[test]
    fn load_score_reflects_failure_rate_when_healthy() {
        let node = Node::new("http://localhost:11434", "local", 0);
        node.is_healthy.store(true, Ordering::Release);
        node.record_outcome(0.0, false);
        node.record_outcome(0.0, false);

        let score = node.compute_load_score();
        assert!((score - 0.5).abs() < 1e-9);
    }
}
