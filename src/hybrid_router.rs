//! HybridRouter (component H): decides between the Ollama pool and the llama.cpp RPC cluster
//! path per model, and manages the RPC coordinator subprocess lifecycle.
//!
//! Model table grounded on `examples/original_source/sollol/hybrid_router.py`'s `MODEL_PROFILES`
//! and `_estimate_model_profile` regex fallback (SPEC_FULL §4.8a). Coordinator lifecycle grounded
//! on `coordinator.rs`'s `CircuitBreaker`/`CircuitState` transition-on-elapsed pattern; subprocess
//! management grounded on `worker_pool.rs::Worker::execute()`'s `tokio::process::Command` +
//! timeout + kill-on-timeout shape.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{OrchestratorError, Result};
use crate::events::{Event, EventBus};

/// Explicit model-parameter table, SPEC_FULL §4.8a -- kept as data, separate from routing code,
/// per the Design Note "model-parameter table".
static MODEL_TABLE: Lazy<HashMap<&'static str, (u32, u64)>> = Lazy::new(|| {
    HashMap::from([
        ("llama3.2", (3, 2048)),
        ("phi", (3, 2048)),
        ("gemma:7b", (7, 5120)),
        ("mistral:7b", (7, 5120)),
        ("llama2:7b", (7, 5120)),
        ("llama3:8b", (8, 6144)),
        ("llama2:13b", (13, 8192)),
        ("llama2:70b", (70, 40960)),
        ("llama3:70b", (70, 40960)),
        ("llama3.1:70b", (70, 40960)),
        ("mixtral:8x7b", (47, 28672)),
        ("mixtral:8x22b", (141, 90112)),
        ("qwen2.5:72b", (72, 42000)),
        ("llama3.1:405b", (405, 230000)),
    ])
});

static SUFFIX_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(\d+)b\b").unwrap());

/// Resolves a model tag to its parameter count in billions, used by both the analyzer (GPU-need
/// inference) and the hybrid routing rule. Unknown tags fall through to a suffix regex; default
/// 8B if unparseable.
pub fn model_param_billions(tag: &str) -> u32 {
    let normalized = tag.to_lowercase();
    for (prefix, (params, _)) in MODEL_TABLE.iter() {
        if normalized.starts_with(prefix) || normalized == *prefix {
            return *params;
        }
    }
    SUFFIX_PATTERN
        .captures(&normalized)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(8)
}

fn model_memory_estimate_mb(tag: &str) -> u64 {
    let normalized = tag.to_lowercase();
    MODEL_TABLE
        .iter()
        .find(|(prefix, _)| normalized.starts_with(**prefix) || normalized == **prefix)
        .map(|(_, (_, mem))| *mem)
        .unwrap_or(6144)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendPath {
    Ollama,
    RpcCluster,
}

/// Routing rule by inferred model parameter count, SPEC_FULL §4.8. `free_gpu_memory_mb` is the
/// single best Ollama node's free GPU memory, used for the 14-70B tier's split decision.
pub fn choose_backend_path(
    model_tag: &str,
    free_gpu_memory_mb: Option<u64>,
    rpc_cluster_available: bool,
) -> Result<BackendPath> {
    let params_b = model_param_billions(model_tag);

    if params_b <= 13 {
        return Ok(BackendPath::Ollama);
    }

    if params_b <= 70 {
        let required = model_memory_estimate_mb(model_tag);
        if free_gpu_memory_mb.is_some_and(|free| free >= required) {
            return Ok(BackendPath::Ollama);
        }
        if rpc_cluster_available {
            return Ok(BackendPath::RpcCluster);
        }
        return Err(OrchestratorError::NoCapacity {
            model: model_tag.to_string(),
        });
    }

    if rpc_cluster_available {
        Ok(BackendPath::RpcCluster)
    } else {
        Err(OrchestratorError::NoCapacity {
            model: model_tag.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Starting,
    Ready,
    Serving,
    Stopping,
    Stopped,
    Failed,
}

/// Manages the subprocess that fronts one RPC-sharded cluster. One instance per cluster; reused
/// across requests until idle for `idle_timeout`, per SPEC_FULL §4.8/§6a.
pub struct Coordinator {
    cluster_name: String,
    idle_timeout: Duration,
    state: RwLock<CoordinatorState>,
    last_activity: RwLock<Instant>,
    child: RwLock<Option<Child>>,
    events: Arc<EventBus>,
}

impl Coordinator {
    pub fn new(cluster_name: impl Into<String>, idle_timeout: Duration, events: Arc<EventBus>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            idle_timeout,
            state: RwLock::new(CoordinatorState::Idle),
            last_activity: RwLock::new(Instant::now()),
            child: RwLock::new(None),
            events,
        }
    }

    pub async fn state(&self) -> CoordinatorState {
        *self.state.read().await
    }

    async fn transition(&self, new_state: CoordinatorState) {
        *self.state.write().await = new_state;
        info!(cluster = %self.cluster_name, ?new_state, "coordinator state transition");
        self.events.publish(Event::info(
            "hybrid_router",
            "coordinator.start",
            format!("{} -> {:?}", self.cluster_name, new_state),
        ));
    }

    /// Ensures the coordinator is `Ready`, starting it if it's `Idle`/`Stopped`/`Failed`. Spawns
    /// the subprocess with `backend_args` (host:port pairs) and `model_path` (resolved GGUF blob),
    /// then polls `health_url` until it answers or `startup_timeout` elapses.
    pub async fn ensure_ready(
        &self,
        coordinator_binary: &str,
        backend_args: &[String],
        model_path: &str,
        health_url: &str,
        startup_timeout: Duration,
    ) -> Result<()> {
        let current = self.state().await;
        if matches!(current, CoordinatorState::Ready | CoordinatorState::Serving) {
            *self.last_activity.write().await = Instant::now();
            return Ok(());
        }

        self.transition(CoordinatorState::Starting).await;

        let spawn_result = Command::new(coordinator_binary)
            .args(backend_args)
            .arg("--model")
            .arg(model_path)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match spawn_result {
            Ok(child) => child,
            Err(err) => {
                self.transition(CoordinatorState::Failed).await;
                return Err(OrchestratorError::CoordinatorStartFailed {
                    cluster: self.cluster_name.clone(),
                    source: err.into(),
                });
            }
        };
        *self.child.write().await = Some(child);

        let client = reqwest::Client::new();
        let deadline = Instant::now() + startup_timeout;
        loop {
            if client.get(health_url).timeout(Duration::from_secs(2)).send().await.is_ok() {
                self.transition(CoordinatorState::Ready).await;
                *self.last_activity.write().await = Instant::now();
                return Ok(());
            }
            if Instant::now() >= deadline {
                self.transition(CoordinatorState::Failed).await;
                return Err(OrchestratorError::CoordinatorStartFailed {
                    cluster: self.cluster_name.clone(),
                    source: anyhow::anyhow!("health check did not become ready within timeout"),
                });
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    pub async fn mark_serving(&self) {
        self.transition(CoordinatorState::Serving).await;
        *self.last_activity.write().await = Instant::now();
    }

    /// Called by a periodic sweep; transitions to `Stopping`/kills the subprocess once idle past
    /// `idle_timeout`. No-op if not currently `Ready`/`Serving`.
    pub async fn sweep_idle(&self) {
        let current = self.state().await;
        if !matches!(current, CoordinatorState::Ready | CoordinatorState::Serving) {
            return;
        }
        let idle_for = self.last_activity.read().await.elapsed();
        if idle_for < self.idle_timeout {
            return;
        }

        self.transition(CoordinatorState::Stopping).await;
        if let Some(mut child) = self.child.write().await.take() {
            if let Err(err) = child.kill().await {
                warn!(cluster = %self.cluster_name, %err, "failed to kill idle coordinator process");
            }
        }
        self.transition(CoordinatorState::Stopped).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_model_routes_to_ollama() {
        let path = choose_backend_path("llama3.2:3b", None, false).unwrap();
        assert_eq!(path, BackendPath::Ollama);
    }

    #[test]
    fn mid_model_routes_to_ollama_when_gpu_memory_covers_it() {
        let path = choose_backend_path("llama2:70b", Some(50000), false).unwrap();
        assert_eq!(path, BackendPath::Ollama);
    }

    #[test]
    fn mid_model_routes_to_rpc_when_gpu_memory_insufficient() {
        let path = choose_backend_path("llama2:70b", Some(1000), true).unwrap();
        assert_eq!(path, BackendPath::RpcCluster);
    }

    #[test]
    fn huge_model_requires_rpc_cluster_or_no_capacity() {
        assert!(choose_backend_path("llama3.1:405b", None, false).is_err());
        assert_eq!(
            choose_backend_path("llama3.1:405b", None, true).unwrap(),
            BackendPath::RpcCluster
        );
    }

    #[test]
    fn unknown_tag_falls_back_to_suffix_regex() {
        assert_eq!(model_param_billions("some-custom-model:34b"), 34);
        assert_eq!(model_param_billions("totally-unparseable"), 8);
    }

    #[tokio::test]
    async fn new_coordinator_starts_idle() {
        let events = Arc::new(EventBus::new_disconnected());
        let coordinator = Coordinator::new("shard-a", Duration::from_secs(600), events);
        assert_eq!(coordinator.state().await, CoordinatorState::Idle);
    }

    #[tokio::test]
    async fn sweep_idle_is_noop_when_not_ready_or_serving() {
        let events = Arc::new(EventBus::new_disconnected());
        let coordinator = Coordinator::new("shard-a", Duration::from_millis(1), events);
        coordinator.sweep_idle().await;
        assert_eq!(coordinator.state().await, CoordinatorState::Idle);
    }
}
