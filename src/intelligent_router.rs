//! IntelligentRouter (component E): scores candidate nodes for a TaskContext and selects a
//! primary plus ordered fallbacks.
//!
//! Scoring weights are SPEC_FULL §4.5's formula, taken verbatim as named constants -- this
//! resolves Design Note Open Question #1 (no competing source variant is retrievable in this
//! pack; `sollol.intelligence`, the module that would define one, is absent).

use std::sync::Arc;

use crate::error::{OrchestratorError, Result};
use crate::node::Node;
use crate::performance_memory::PerformanceMemory;
use crate::task_context::TaskContext;

pub const BASE_SCORE: f64 = 50.0;
pub const GPU_MATCH_BONUS: f64 = 25.0;
pub const SUCCESS_RATE_WEIGHT: f64 = 20.0;
pub const SUCCESS_RATE_CLAMP: f64 = 10.0;
pub const LATENCY_PENALTY_DIVISOR: f64 = 50.0;
pub const LATENCY_PENALTY_CAP: f64 = 20.0;
pub const CPU_LOAD_WEIGHT: f64 = 20.0;
pub const PRIORITY_BONUS_WEIGHT: f64 = 2.0;
pub const HISTORICAL_MIN_SAMPLES: usize = 5;

#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub chosen_url: String,
    pub score: f64,
    pub reasoning: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub fallback_nodes: Vec<String>,
}

/// Live metadata snapshot for one candidate node, assembled by the caller (capabilities + live
/// metrics) so the router itself stays free of I/O.
pub struct HostSnapshot {
    pub url: String,
    pub has_gpu: bool,
    pub priority: i32,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub load_score: f64,
}

pub struct IntelligentRouter {
    memory: Arc<PerformanceMemory>,
}

impl IntelligentRouter {
    pub fn new(memory: Arc<PerformanceMemory>) -> Self {
        Self { memory }
    }

    /// Scores every host in `hosts` for `context`; `hosts` must already be filtered to available
    /// (healthy) nodes by the caller -- routing safety (SPEC_FULL §8) requires `select` to never
    /// return an unavailable host, so an empty `hosts` list is an error, not a silent default.
    pub fn select(&self, context: &TaskContext, hosts: &[HostSnapshot]) -> Result<RoutingDecision> {
        if hosts.is_empty() {
            return Err(OrchestratorError::NoCapacity {
                model: context.model_preference.clone().unwrap_or_default(),
            });
        }

        let average_priority =
            hosts.iter().map(|h| h.priority as f64).sum::<f64>() / hosts.len() as f64;

        let mut scored: Vec<(f64, &HostSnapshot)> = hosts
            .iter()
            .map(|host| (self.score_host(context, host, average_priority), host))
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.1.priority.cmp(&a.1.priority))
                .then_with(|| a.1.url.cmp(&b.1.url))
        });

        let (winning_score, winner) = scored[0];
        let fallback_nodes = scored[1..].iter().map(|(_, h)| h.url.clone()).collect();

        Ok(RoutingDecision {
            chosen_url: winner.url.clone(),
            score: winning_score,
            reasoning: self.explain(context, winner),
            timestamp: chrono::Utc::now(),
            fallback_nodes,
        })
    }

    fn score_host(&self, context: &TaskContext, host: &HostSnapshot, average_priority: f64) -> f64 {
        let mut score = BASE_SCORE;

        if context.requires_gpu {
            score += if host.has_gpu { GPU_MATCH_BONUS } else { -GPU_MATCH_BONUS };
        }

        score += (SUCCESS_RATE_WEIGHT * (host.success_rate - 0.5)).clamp(-SUCCESS_RATE_CLAMP, SUCCESS_RATE_CLAMP);

        let model = context.model_preference.as_deref().unwrap_or("");
        let historical = self.memory.query(&host.url, context.task_type, model);
        let latency_penalty = match historical {
            Some(stats) if stats.count >= HISTORICAL_MIN_SAMPLES => {
                (stats.p50_ms / LATENCY_PENALTY_DIVISOR).min(LATENCY_PENALTY_CAP)
            }
            _ => (host.avg_latency_ms / LATENCY_PENALTY_DIVISOR).min(LATENCY_PENALTY_CAP),
        };
        score -= latency_penalty;

        score -= CPU_LOAD_WEIGHT * host.load_score;
        score += PRIORITY_BONUS_WEIGHT * (host.priority as f64 - average_priority);

        score
    }

    fn explain(&self, context: &TaskContext, host: &HostSnapshot) -> String {
        format!(
            "selected {} for {:?} (gpu_required={}, has_gpu={}, success_rate={:.2}, load={:.2})",
            host.url, context.task_type, context.requires_gpu, host.has_gpu, host.success_rate, host.load_score
        )
    }
}

pub fn host_snapshot_from_node(node: &Node, metrics: &crate::node::NodeMetrics, has_gpu: bool) -> HostSnapshot {
    HostSnapshot {
        url: node.url.clone(),
        has_gpu,
        priority: node.priority,
        success_rate: metrics.success_rate(),
        avg_latency_ms: metrics.avg_latency_ms,
        load_score: node.compute_load_score(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_context::{Complexity, RequestPayload, TaskType};

    fn ctx(requires_gpu: bool) -> TaskContext {
        TaskContext {
            task_type: TaskType::Generation,
            complexity: Complexity::Medium,
            estimated_input_tokens: 100,
            estimated_output_tokens: 200,
            estimated_duration_ms: 1000,
            requires_gpu,
            model_preference: Some("llama3.2:3b".to_string()),
            priority: 5,
        }
    }

    fn host(url: &str, has_gpu: bool, avg_latency_ms: f64) -> HostSnapshot {
        HostSnapshot {
            url: url.to_string(),
            has_gpu,
            priority: 0,
            success_rate: 1.0,
            avg_latency_ms,
            load_score: 0.0,
        }
    }

    #[test]
    fn empty_hosts_is_an_error_not_a_silent_default() {
        let router = IntelligentRouter::new(Arc::new(PerformanceMemory::new()));
        let result = router.select(&ctx(false), &[]);
        assert!(result.is_err());
    }

    #[test]
    fn prefers_gpu_node_when_required() {
        let router = IntelligentRouter::new(Arc::new(PerformanceMemory::new()));
        let hosts = vec![host("http://gpu", true, 300.0), host("http://cpu", false, 50.0)];
        let decision = router.select(&ctx(true), &hosts).unwrap();
        assert_eq!(decision.chosen_url, "http://gpu");
    }

    #[test]
    fn prefers_low_latency_node_when_gpu_not_required() {
        let router = IntelligentRouter::new(Arc::new(PerformanceMemory::new()));
        let hosts = vec![host("http://gpu", true, 300.0), host("http://cpu", false, 50.0)];
        let decision = router.select(&ctx(false), &hosts).unwrap();
        assert_eq!(decision.chosen_url, "http://cpu");
    }

    #[test]
    fn fallback_coverage_matches_healthy_minus_one() {
        let router = IntelligentRouter::new(Arc::new(PerformanceMemory::new()));
        let hosts = vec![host("http://a", false, 10.0), host("http://b", false, 20.0), host("http://c", false, 30.0)];
        let decision = router.select(&ctx(false), &hosts).unwrap();
        assert_eq!(decision.fallback_nodes.len(), hosts.len() - 1);
    }

    #[test]
    fn ties_break_by_priority_then_url() {
        let router = IntelligentRouter::new(Arc::new(PerformanceMemory::new()));
        let mut a = host("http://b.example", false, 10.0);
        a.priority = 5;
        let mut b = host("http://a.example", false, 10.0);
        b.priority = 5;
        let decision = router.select(&ctx(false), &[a, b]).unwrap();
        assert_eq!(decision.chosen_url, "http://a.example");
    }
}
