//! Distributed inference orchestrator for a fleet of local LLM inference servers.
//!
//! Routes agent-role inference calls (Researcher, Critic, Editor, Storyteller) across a pool of
//! Ollama-compatible HTTP workers and llama.cpp RPC-sharding clusters, picking the best backend
//! per call via multi-factor scoring that adapts from observed latency and success history, then
//! fans out or sequences those calls into collaborative and long-form document workflows.
//!
//! # Architecture
//!
//! ```text
//! caller ──► AgentRuntime ──► IntelligentRouter ──► Registry ──► Node (Ollama) / Cluster (RPC)
//!                │                                      │
//!                ├── json_repair (extract/validate/patch)│
//!                ├── PerformanceMemory (adaptive scoring)│
//!                └── EventBus (dashboard / Redis)        └── HybridRouter (single vs sharded)
//!
//! ParallelExecutor ──► N x AgentRuntime::call, bounded concurrency, merge strategies
//! CollaborativeWorkflow ──► Research -> Critic -> Editor (+ refinement, AST quality voting)
//! LongformEngine ──► chunk 1 -> parallel focus-area chunks -> synthesis
//! ```

pub mod agent;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod executor;
pub mod hedging;
pub mod hybrid_router;
pub mod intelligent_router;
pub mod longform;
pub mod node;
pub mod performance_memory;
pub mod quality;
pub mod registry;
pub mod snapshot;
pub mod task_context;
pub mod workflow;

pub use cache::ResponseCache;
pub use cluster::{Cluster, ClusterBackend, PartitioningStrategy};
pub use config::Config;
pub use error::{OrchestratorError, Result};
pub use events::{Event, EventBus};
pub use executor::{AgentTask, BatchResult, MergeStrategy, ParallelExecutor, TaskOutcome};
pub use hybrid_router::{choose_backend_path, BackendPath, Coordinator, CoordinatorState};
pub use intelligent_router::{host_snapshot_from_node, HostSnapshot, IntelligentRouter, RoutingDecision};
pub use longform::{ContentType, LongformEngine, LongformResult};
pub use node::{Node, NodeCapabilities, NodeMetrics};
pub use performance_memory::PerformanceMemory;
pub use quality::{FormattingRelevance, OutputQualityReport};
pub use registry::Registry;
pub use snapshot::DashboardSnapshot;
pub use task_context::{TaskContext, TaskType};
pub use workflow::{CollaborativeWorkflow, WorkflowConfig, WorkflowResult};
