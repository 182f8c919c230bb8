//! Typed error taxonomy for the orchestrator core.
//!
//! Components recover locally where they can (retry, patch-repair, fallback); only the
//! unrecovered case escapes as one of these variants, attaching the component's own context.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("unreachable backend {node_url}: {source}")]
    Unreachable {
        node_url: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("backend {node_url} rejected request with status {status}")]
    BackendRejected { node_url: String, status: u16 },

    #[error("task {task_id} produced invalid JSON: {issues:?}")]
    InvalidJson {
        task_id: String,
        issues: Vec<String>,
    },

    #[error("no capacity for model {model}")]
    NoCapacity { model: String },

    #[error("coordinator for cluster {cluster} failed to start: {source}")]
    CoordinatorStartFailed {
        cluster: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("task {task_id} exceeded its deadline")]
    DeadlineExceeded { task_id: String },

    #[error("internal invariant violated: {detail}")]
    InvariantViolation { detail: String },
}

impl OrchestratorError {
    /// Whether this error kind is fatal to the whole request (taxonomy kinds 4-5), as opposed
    /// to the kinds a component is expected to recover from locally.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OrchestratorError::NoCapacity { .. } | OrchestratorError::CoordinatorStartFailed { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
