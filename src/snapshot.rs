//! Dashboard snapshot (SPEC_FULL §6 "Dashboard contract"): pull-based status object assembled on
//! demand from `Registry` + `PerformanceMemory`. No internal timer -- a caller (CLI `dashboard`
//! command, or an HTTP handler) decides when to pull one.
//!
//! No teacher file models this snapshot directly; shape and degraded-threshold rule are original
//! to this crate, built on top of its `Node`/`Registry`/`PerformanceMemory` accessors.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::performance_memory::PerformanceMemory;
use crate::registry::Registry;

/// Latency above which a healthy host is reported `degraded` rather than `healthy`.
const DEGRADED_LATENCY_MS: f64 = 1000.0;
/// Success rate below which a healthy host is reported `degraded` rather than `healthy`.
const DEGRADED_SUCCESS_RATE: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Healthy,
    Degraded,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostSnapshot {
    pub host: String,
    pub status: HostStatus,
    pub latency_ms: f64,
    pub success_rate: f64,
    pub load: f64,
    pub gpu_mb: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcHostSnapshot {
    pub cluster: String,
    pub address: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub healthy: usize,
    pub available_hosts: usize,
    pub total_hosts: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSummary {
    pub avg_latency_ms: f64,
    pub avg_success_rate: f64,
    pub total_gpu_memory_mb: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutingSummary {
    pub patterns_available: usize,
    pub task_types_learned: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardSnapshot {
    pub status: StatusSummary,
    pub performance: PerformanceSummary,
    pub hosts: Vec<HostSnapshot>,
    pub rpc_hosts: Vec<RpcHostSnapshot>,
    pub alerts: Vec<Alert>,
    pub routing: RoutingSummary,
}

/// Classifies a host as `Offline` if unhealthy, else `Degraded` if its rolling latency or success
/// rate crosses the SPEC_FULL §6 thresholds, else `Healthy`.
fn classify_host(is_healthy: bool, latency_ms: f64, success_rate: f64) -> HostStatus {
    if !is_healthy {
        HostStatus::Offline
    } else if latency_ms > DEGRADED_LATENCY_MS || success_rate < DEGRADED_SUCCESS_RATE {
        HostStatus::Degraded
    } else {
        HostStatus::Healthy
    }
}

pub async fn build(registry: &Registry, memory: &PerformanceMemory) -> DashboardSnapshot {
    let all_nodes = registry.all_nodes().await;
    let total_hosts = all_nodes.len();

    let mut hosts = Vec::with_capacity(total_hosts);
    let mut alerts = Vec::new();
    let mut healthy_count = 0usize;
    let mut total_gpu_memory_mb = 0u64;
    let mut latency_sum = 0.0;
    let mut success_rate_sum = 0.0;

    for node in &all_nodes {
        let metrics = node.metrics_snapshot().await;
        let caps = node.capabilities_snapshot().await;
        let success_rate = metrics.success_rate();
        let status = classify_host(metrics.is_healthy, metrics.avg_latency_ms, success_rate);

        if status == HostStatus::Healthy {
            healthy_count += 1;
        }
        if status == HostStatus::Degraded {
            alerts.push(Alert {
                severity: AlertSeverity::Warning,
                message: format!(
                    "{} degraded: latency {:.0}ms, success rate {:.0}%",
                    node.url,
                    metrics.avg_latency_ms,
                    success_rate * 100.0
                ),
                timestamp: Utc::now(),
            });
        }
        if status == HostStatus::Offline {
            alerts.push(Alert {
                severity: AlertSeverity::Critical,
                message: format!("{} unreachable", node.url),
                timestamp: Utc::now(),
            });
        }

        total_gpu_memory_mb += caps.gpu_memory_mb;
        latency_sum += metrics.avg_latency_ms;
        success_rate_sum += success_rate;

        hosts.push(HostSnapshot {
            host: node.url.clone(),
            status,
            latency_ms: metrics.avg_latency_ms,
            success_rate,
            load: node.compute_load_score(),
            gpu_mb: caps.gpu_memory_mb,
        });
    }

    let available_hosts = all_nodes.iter().filter(|n| n.is_healthy()).count();
    let (avg_latency_ms, avg_success_rate) = if total_hosts > 0 {
        (latency_sum / total_hosts as f64, success_rate_sum / total_hosts as f64)
    } else {
        (0.0, 1.0)
    };

    let clusters = registry.all_clusters().await;
    let rpc_hosts = clusters
        .iter()
        .flat_map(|cluster| {
            cluster.backends.iter().map(|backend| RpcHostSnapshot {
                cluster: cluster.name.clone(),
                address: backend.address(),
                model: cluster.model.clone(),
            })
        })
        .collect();

    let summary = memory.summary();
    let patterns_available = summary.len();
    let task_types_learned: HashSet<_> = summary.iter().map(|entry| entry.task_type).collect();

    DashboardSnapshot {
        status: StatusSummary {
            healthy: healthy_count,
            available_hosts,
            total_hosts,
        },
        performance: PerformanceSummary {
            avg_latency_ms,
            avg_success_rate,
            total_gpu_memory_mb,
        },
        hosts,
        rpc_hosts,
        alerts,
        routing: RoutingSummary {
            patterns_available,
            task_types_learned: task_types_learned.len(),
        },
    }
}

/// Convenience wrapper so callers holding `Arc`s don't need to deref manually.
pub async fn build_from_arcs(registry: &Arc<Registry>, memory: &Arc<PerformanceMemory>) -> DashboardSnapshot {
    build(registry, memory).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_host_under_thresholds_is_healthy() {
        assert_eq!(classify_host(true, 100.0, 0.99), HostStatus::Healthy);
    }

    #[test]
    fn high_latency_marks_degraded() {
        assert_eq!(classify_host(true, 1500.0, 0.99), HostStatus::Degraded);
    }

    #[test]
    fn low_success_rate_marks_degraded() {
        assert_eq!(classify_host(true, 100.0, 0.5), HostStatus::Degraded);
    }

    #[test]
    fn unhealthy_node_is_offline_regardless_of_metrics() {
        assert_eq!(classify_host(false, 10.0, 1.0), HostStatus::Offline);
    }

    #[tokio::test]
    async fn empty_registry_yields_zeroed_snapshot() {
        let events = Arc::new(crate::events::EventBus::new_disconnected());
        let registry = Registry::new(events);
        let memory = PerformanceMemory::new();
        let snapshot = build(&registry, &memory).await;
        assert_eq!(snapshot.status.total_hosts, 0);
        assert_eq!(snapshot.performance.avg_success_rate, 1.0);
        assert!(snapshot.hosts.is_empty());
    }
}
