//! Cluster (component B): a named set of RPC backends jointly serving one sharded model.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::node::Node;

/// How a model's layers are split across a cluster's backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PartitioningStrategy {
    Even,
    Explicit(Vec<LayerRange>),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LayerRange {
    pub start: u32,
    pub end: u32,
}

/// One backend participating in an RPC-sharded cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterBackend {
    pub host: String,
    pub port: u16,
    pub layer_range: Option<LayerRange>,
}

impl ClusterBackend {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub struct Cluster {
    pub name: String,
    pub backends: Vec<ClusterBackend>,
    pub model: String,
    pub strategy: PartitioningStrategy,
}

impl Cluster {
    /// Constructs a cluster. The caller (Registry::create_cluster) is responsible for enforcing
    /// the `>= 2 backends` invariant before construction; this constructor just stores the data.
    pub fn new(
        name: impl Into<String>,
        backends: Vec<ClusterBackend>,
        model: impl Into<String>,
        strategy: PartitioningStrategy,
    ) -> Self {
        Self {
            name: name.into(),
            backends,
            model: model.into(),
            strategy,
        }
    }

    pub fn is_suitable_for(&self, model: &str) -> bool {
        self.model == model
    }

    /// Probes every backend's Ollama-shaped `/api/tags` in parallel; healthy iff all backends
    /// are reachable.
    pub async fn health_check(&self, client: &reqwest::Client, timeout: Duration) -> bool {
        let probes = self.backends.iter().map(|backend| {
            let url = format!("http://{}/api/tags", backend.address());
            let client = client.clone();
            async move {
                client
                    .get(&url)
                    .timeout(timeout)
                    .send()
                    .await
                    .map(|r| r.status().is_success())
                    .unwrap_or(false)
            }
        });

        futures_util::future::join_all(probes)
            .await
            .into_iter()
            .all(|healthy| healthy)
    }

    /// Splits `total_layers` across the cluster's backends per its partitioning strategy.
    pub fn assign_layers(&self, total_layers: u32) -> Vec<LayerRange> {
        match &self.strategy {
            PartitioningStrategy::Explicit(ranges) => ranges.clone(),
            PartitioningStrategy::Even => {
                let n = self.backends.len() as u32;
                if n == 0 {
                    return Vec::new();
                }
                let base = total_layers / n;
                let remainder = total_layers % n;
                let mut start = 0;
                (0..n)
                    .map(|i| {
                        let size = base + if i < remainder { 1 } else { 0 };
                        let range = LayerRange {
                            start,
                            end: start + size,
                        };
                        start += size;
                        range
                    })
                    .collect()
            }
        }
    }
}

/// Whether a node's capabilities make it a candidate host for a sharded backend slot; exposed so
/// callers assembling a cluster from live `Node`s can filter before `Cluster::new`.
pub fn node_can_host_backend(node: &Node) -> bool {
    node.is_healthy()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(host: &str) -> ClusterBackend {
        ClusterBackend {
            host: host.to_string(),
            port: 50052,
            layer_range: None,
        }
    }

    #[test]
    fn even_split_distributes_remainder_to_earliest_backends() {
        let cluster = Cluster::new(
            "shard-a",
            vec![backend("a"), backend("b"), backend("c")],
            "llama3.1:405b",
            PartitioningStrategy::Even,
        );

        let ranges = cluster.assign_layers(10);
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0].end - ranges[0].start, 4);
        assert_eq!(ranges[1].end - ranges[1].start, 3);
        assert_eq!(ranges[2].end - ranges[2].start, 3);
        assert_eq!(ranges[2].end, 10);
    }

    #[test]
    fn is_suitable_for_matches_model_tag_exactly() {
        let cluster = Cluster::new(
            "shard-a",
            vec![backend("a"), backend("b")],
            "llama3.1:405b",
            PartitioningStrategy::Even,
        );
        assert!(cluster.is_suitable_for("llama3.1:405b"));
        assert!(!cluster.is_suitable_for("llama3.1:70b"));
    }
}
