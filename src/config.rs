//! Configuration management
//!
//! Extended per SPEC_FULL §6a with the orchestrator's own env-var surface, following the
//! teacher's existing parse-with-default discipline (`env::var(...).ok().and_then(...).unwrap_or`)
//! rather than scattering ad hoc `env::var` calls at each call site.

use anyhow::Result;
use std::path::PathBuf;

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Ollama URL for local Llama routing (optional)
    pub ollama_url: Option<String>,

    /// Redis URL for task coordination (optional); also the EventBus external pub/sub sink (§4.13a).
    pub redis_url: Option<String>,

    /// Enable response caching
    pub cache_enabled: bool,

    /// Cache TTL in seconds
    pub cache_ttl_secs: u64,

    /// Default model used for agent calls
    pub default_model: String,

    /// Default Ollama port probed during CIDR discovery.
    pub discovery_port: u16,
    /// Per-host TCP probe timeout during discovery, in milliseconds.
    pub discovery_timeout_ms: u64,
    /// Bounded concurrency for discovery's host sweep.
    pub discovery_max_workers: usize,
    /// Default bounded worker pool size for ParallelExecutor and health sweeps (§5).
    pub pool_size: usize,
    /// Persisted node list path (§6).
    pub node_list_path: PathBuf,
    /// Coordinator idle-to-Stopping timeout, in seconds (§4.8).
    pub coordinator_idle_timeout_secs: u64,
    /// Default per-task deadline, in seconds (§5).
    pub agent_timeout_secs: u64,
    /// Editor-phase deadline override, in seconds (§5, §4.11).
    pub editor_timeout_secs: u64,
    /// Iterative JSON-Patch repair cap (§4.9).
    pub max_repair_attempts: u32,
    /// AST quality voting pass threshold (§4.11a).
    pub quality_threshold: f64,
    /// AST quality voting retry cap (§4.11a).
    pub quality_max_retries: u32,
    /// Optional document-RAG collaborator endpoint (§4.12 step 2).
    pub rag_url: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let ollama_url = std::env::var("OLLAMA_URL").ok();
        let redis_url = std::env::var("REDIS_URL").ok();

        let cache_enabled = std::env::var("ORCHESTRATOR_CACHE_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);

        let cache_ttl_secs = std::env::var("ORCHESTRATOR_CACHE_TTL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3600);

        let default_model = std::env::var("ORCHESTRATOR_DEFAULT_MODEL")
            .unwrap_or_else(|_| "llama3.2".to_string());

        let node_list_path = std::env::var("ORCHESTRATOR_NODE_LIST_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_local_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("orchestrator")
                    .join("nodes.json")
            });

        let rag_url = std::env::var("ORCHESTRATOR_RAG_URL").ok();

        Ok(Self {
            ollama_url,
            redis_url,
            cache_enabled,
            cache_ttl_secs,
            default_model,
            discovery_port: env_parsed("ORCHESTRATOR_DISCOVERY_PORT", 11434),
            discovery_timeout_ms: env_parsed("ORCHESTRATOR_DISCOVERY_TIMEOUT_MS", 500),
            discovery_max_workers: env_parsed("ORCHESTRATOR_DISCOVERY_MAX_WORKERS", 32),
            pool_size: env_parsed("ORCHESTRATOR_POOL_SIZE", 10),
            node_list_path,
            coordinator_idle_timeout_secs: env_parsed("ORCHESTRATOR_COORDINATOR_IDLE_TIMEOUT_SECS", 600),
            agent_timeout_secs: env_parsed("ORCHESTRATOR_AGENT_TIMEOUT_SECS", 300),
            editor_timeout_secs: env_parsed("ORCHESTRATOR_EDITOR_TIMEOUT_SECS", 600),
            max_repair_attempts: env_parsed("ORCHESTRATOR_MAX_REPAIR_ATTEMPTS", 3),
            quality_threshold: env_parsed("ORCHESTRATOR_QUALITY_THRESHOLD", 0.7),
            quality_max_retries: env_parsed("ORCHESTRATOR_QUALITY_MAX_RETRIES", 2),
            rag_url,
        })
    }
}
