//! Single agent call (component I, SPEC_FULL §4.9): build the Ollama payload for one `AgentRole`,
//! route it, call it, extract/validate/repair its JSON, and record the outcome.
//!
//! Grounded on `examples/original_source/agents/base_agent.py` (`_call_ollama`'s payload shape and
//! its format-retry-without-format fallback on HTTP error) and `llama_worker.rs::LlamaWorker`'s
//! reqwest-client-with-timeout construction.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::agent::json_repair::{self, RepairOutcome};
use crate::agent::role::AgentRole;
use crate::error::{OrchestratorError, Result};
use crate::intelligent_router::{host_snapshot_from_node, HostSnapshot, IntelligentRouter};
use crate::node::Node;
use crate::performance_memory::PerformanceMemory;
use crate::registry::Registry;
use crate::task_context::{RequestPayload, TaskContext};

#[derive(Debug, Clone, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    system: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'static str>,
}

#[derive(Debug, serde::Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Outcome of one completed agent call: the validated JSON (or best-effort text if repair was
/// exhausted), which node served it, and how long it took.
pub struct AgentCallOutcome {
    pub value: Option<Value>,
    pub raw_text: String,
    pub node_url: String,
    pub duration_ms: f64,
    pub degraded_to_text: bool,
}

/// Drives the whole agent lifecycle for one role + prompt: analyze -> route -> call ->
/// extract/repair -> record. Holds the shared orchestrator state needed to do all of that, so one
/// instance can serve every role/call in a collaborative workflow.
pub struct AgentRuntime {
    registry: Arc<Registry>,
    router: Arc<IntelligentRouter>,
    memory: Arc<PerformanceMemory>,
    client: reqwest::Client,
    model: String,
}

impl AgentRuntime {
    pub fn new(
        registry: Arc<Registry>,
        router: Arc<IntelligentRouter>,
        memory: Arc<PerformanceMemory>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            router,
            memory,
            client: reqwest::Client::new(),
            model: model.into(),
        }
    }

    /// Runs `role` against `prompt`, repairing malformed JSON up to
    /// `json_repair::MAX_REPAIR_ATTEMPTS` times via a second LLM call on the same node.
    pub async fn call(&self, role: &AgentRole, prompt: &str, priority: u8) -> Result<AgentCallOutcome> {
        self.call_excluding(role, prompt, priority, &[]).await
    }

    /// Same as `call`, but routes away from any node in `exclude` when an alternative healthy node
    /// exists -- used by `CollaborativeWorkflow`'s refinement loop (SPEC_FULL §4.11) to keep each
    /// refinement round off a node a prior phase already used, avoiding cache contamination. If
    /// honoring `exclude` would leave no candidate node, it's ignored so routing safety still holds.
    pub async fn call_excluding(
        &self,
        role: &AgentRole,
        prompt: &str,
        priority: u8,
        exclude: &[String],
    ) -> Result<AgentCallOutcome> {
        let payload = RequestPayload {
            model: &self.model,
            prompt: Some(prompt),
            system: Some(role.system_prompt()),
            has_messages: false,
        };
        let context = crate::task_context::analyze(&payload, priority, None);

        let decision = self.route(&context, exclude).await?;
        let node = self
            .registry
            .get_node_by_url(&decision.chosen_url)
            .await
            .ok_or_else(|| OrchestratorError::InvariantViolation {
                detail: format!("router chose unknown node {}", decision.chosen_url),
            })?;

        let call_start = Instant::now();
        let (raw_text, duration_ms) = match self.generate(&node, role, prompt, true).await {
            Ok(pair) => pair,
            Err(err) => {
                let elapsed_ms = call_start.elapsed().as_secs_f64() * 1000.0;
                node.record_outcome(elapsed_ms, false);
                self.memory.record(&node.url, context.task_type, &self.model, elapsed_ms, false);
                return Err(err);
            }
        };

        let schema = role.schema();

        let node_clone = node.clone();
        let client = self.client.clone();
        let model = self.model.clone();
        let role_prompt = role.system_prompt().to_string();

        let outcome = json_repair::repair_loop(&raw_text, &schema, move |value, issues| {
            let node = node_clone.clone();
            let client = client.clone();
            let model = model.clone();
            let role_prompt = role_prompt.clone();
            let value = value.clone();
            let issues = issues.to_vec();
            async move {
                let patch_prompt = format!(
                    "The following JSON has these problems: {}.\nCurrent JSON: {}\n\
                     Respond with ONLY a JSON array of RFC 6902 patch operations that fix it.",
                    issues.join("; "),
                    value
                );
                let request = GenerateRequest {
                    model: &model,
                    prompt: patch_prompt,
                    system: &role_prompt,
                    stream: false,
                    format: None,
                };
                let url = format!("{}/api/generate", node.url.trim_end_matches('/'));
                let resp: GenerateResponse = client.post(&url).json(&request).send().await?.json().await?;
                let patch_value = json_repair::extract_json(&resp.response).unwrap_or(Value::Array(vec![]));
                let ops: Vec<json_repair::PatchOp> = serde_json::from_value(patch_value).unwrap_or_default();
                Ok(ops)
            }
        })
        .await;

        let (value, degraded) = match outcome {
            RepairOutcome::Valid(v) => (Some(v), false),
            RepairOutcome::ExhaustedAttempts { last_issues } => {
                warn!(issues = ?last_issues, role = role.name(), "json repair exhausted, degrading to text");
                (None, true)
            }
        };

        // The HTTP round trip itself succeeded either way; `degraded` only means the repair loop
        // gave up on well-formed JSON, not that the node failed to answer.
        let node_call_succeeded = true;
        node.record_outcome(duration_ms, node_call_succeeded);
        self.memory
            .record(&node.url, context.task_type, &self.model, duration_ms, node_call_succeeded);

        Ok(AgentCallOutcome {
            value,
            raw_text,
            node_url: node.url.clone(),
            duration_ms,
            degraded_to_text: degraded,
        })
    }

    async fn route(&self, context: &TaskContext, exclude: &[String]) -> Result<crate::intelligent_router::RoutingDecision> {
        let healthy = self.registry.get_healthy_nodes().await;
        // Excluding nodes is best-effort: if it would leave nothing to route to, fall back to the
        // full healthy set rather than manufacture a `NoCapacity` error out of a caller preference.
        let candidates: Vec<Arc<Node>> = if exclude.is_empty() {
            healthy
        } else {
            let filtered: Vec<Arc<Node>> = healthy
                .iter()
                .filter(|n| !exclude.iter().any(|url| url == &n.url))
                .cloned()
                .collect();
            if filtered.is_empty() {
                healthy
            } else {
                filtered
            }
        };

        let mut hosts: Vec<HostSnapshot> = Vec::with_capacity(candidates.len());
        for node in &candidates {
            let metrics = node.metrics_snapshot().await;
            let caps = node.capabilities_snapshot().await;
            hosts.push(host_snapshot_from_node(node, &metrics, caps.has_gpu));
        }
        self.router.select(context, &hosts)
    }

    /// One HTTP call to `/api/generate`. On non-success status, retries once without `format:
    /// "json"` in case the backend's grammar constraint rejected the request, per
    /// `base_agent.py`'s retry shape.
    async fn generate(
        &self,
        node: &Node,
        role: &AgentRole,
        prompt: &str,
        use_format: bool,
    ) -> Result<(String, f64)> {
        let start = Instant::now();
        let url = format!("{}/api/generate", node.url.trim_end_matches('/'));
        let request = GenerateRequest {
            model: &self.model,
            prompt: prompt.to_string(),
            system: role.system_prompt(),
            stream: false,
            format: use_format.then_some("json"),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .timeout(role.default_timeout())
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                let body: GenerateResponse = resp.json().await.map_err(|err| OrchestratorError::Unreachable {
                    node_url: node.url.clone(),
                    source: err.into(),
                })?;
                info!(node = %node.url, role = role.name(), "agent call succeeded");
                Ok((body.response, start.elapsed().as_secs_f64() * 1000.0))
            }
            Ok(resp) if use_format => {
                warn!(node = %node.url, status = %resp.status(), "format-constrained call rejected, retrying without format");
                Box::pin(self.generate(node, role, prompt, false)).await
            }
            Ok(resp) => Err(OrchestratorError::BackendRejected {
                node_url: node.url.clone(),
                status: resp.status().as_u16(),
            }),
            Err(err) => Err(OrchestratorError::Unreachable {
                node_url: node.url.clone(),
                source: err.into(),
            }),
        }
    }
}

/// Convenience constant mirroring `base_agent.py`'s default per-call budget when no role-specific
/// timeout applies.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(300);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_call_timeout_matches_researcher_default() {
        assert_eq!(DEFAULT_CALL_TIMEOUT, AgentRole::Researcher.default_timeout());
    }
}
