//! PerformanceMemory (component F): rolling per-(node, task_type, model) latency and success
//! history, feeding the router's adaptive scoring.
//!
//! Grounded on `metrics.rs::MetricsCollector`'s rolling-window + `sort_unstable`/index-math
//! percentile pattern, narrowed to the bucket key SPEC_FULL §4.6 names. In-memory only by
//! design -- a restart discards history.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::task_context::TaskType;

/// Samples kept per bucket before the oldest is evicted (SPEC_FULL §5 back-pressure bound).
const RING_SIZE: usize = 200;

/// Minimum sample count before `query` returns statistics instead of "insufficient data".
const MIN_SAMPLES_FOR_QUERY: usize = 5;

#[derive(Debug, Clone, Copy)]
struct Sample {
    duration_ms: f64,
    success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    node_url: String,
    task_type: TaskType,
    model: String,
}

#[derive(Debug, Clone, Copy)]
pub struct QueryResult {
    pub count: usize,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub success_rate: f64,
}

#[derive(Default)]
struct Bucket {
    samples: std::collections::VecDeque<Sample>,
}

impl Bucket {
    fn push(&mut self, sample: Sample) {
        if self.samples.len() >= RING_SIZE {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    fn query(&self) -> Option<QueryResult> {
        if self.samples.len() < MIN_SAMPLES_FOR_QUERY {
            return None;
        }
        let mut durations: Vec<f64> = self.samples.iter().map(|s| s.duration_ms).collect();
        durations.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap());

        let p50 = percentile(&durations, 50);
        let p95 = percentile(&durations, 95);
        let successes = self.samples.iter().filter(|s| s.success).count();

        Some(QueryResult {
            count: self.samples.len(),
            p50_ms: p50,
            p95_ms: p95,
            success_rate: successes as f64 / self.samples.len() as f64,
        })
    }
}

fn percentile(sorted: &[f64], pct: usize) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = (sorted.len() * pct / 100).min(sorted.len() - 1);
    sorted[idx]
}

pub struct SummaryEntry {
    pub task_type: TaskType,
    pub model: String,
    pub count: usize,
}

/// Process-wide rolling performance history, guarded by one lock (append is O(1) under it, per
/// SPEC_FULL §5). Inject this -- don't reach for a global -- so tests can instantiate isolated
/// copies, per the Design Note on global state.
pub struct PerformanceMemory {
    buckets: Mutex<HashMap<BucketKey, Bucket>>,
}

impl PerformanceMemory {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, node_url: &str, task_type: TaskType, model: &str, duration_ms: f64, success: bool) {
        let key = BucketKey {
            node_url: node_url.to_string(),
            task_type,
            model: model.to_string(),
        };
        let mut buckets = self.buckets.lock();
        buckets
            .entry(key)
            .or_default()
            .push(Sample { duration_ms, success });
    }

    pub fn query(&self, node_url: &str, task_type: TaskType, model: &str) -> Option<QueryResult> {
        let key = BucketKey {
            node_url: node_url.to_string(),
            task_type,
            model: model.to_string(),
        };
        self.buckets.lock().get(&key)?.query()
    }

    pub fn summary(&self) -> Vec<SummaryEntry> {
        self.buckets
            .lock()
            .iter()
            .map(|(key, bucket)| SummaryEntry {
                task_type: key.task_type,
                model: key.model.clone(),
                count: bucket.samples.len(),
            })
            .collect()
    }
}

impl Default for PerformanceMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_returns_none_below_minimum_sample_count() {
        let memory = PerformanceMemory::new();
        for _ in 0..4 {
            memory.record("http://a", TaskType::Generation, "llama3.2:3b", 100.0, true);
        }
        assert!(memory.query("http://a", TaskType::Generation, "llama3.2:3b").is_none());
    }

    #[test]
    fn query_returns_stats_at_minimum_sample_count() {
        let memory = PerformanceMemory::new();
        for _ in 0..5 {
            memory.record("http://a", TaskType::Generation, "llama3.2:3b", 100.0, true);
        }
        let stats = memory.query("http://a", TaskType::Generation, "llama3.2:3b").unwrap();
        assert_eq!(stats.count, 5);
        assert_eq!(stats.success_rate, 1.0);
    }

    #[test]
    fn ring_buffer_evicts_oldest_past_capacity() {
        let memory = PerformanceMemory::new();
        for i in 0..(RING_SIZE + 10) {
            memory.record("http://a", TaskType::Generation, "llama3.2:3b", i as f64, true);
        }
        let stats = memory.query("http://a", TaskType::Generation, "llama3.2:3b").unwrap();
        assert_eq!(stats.count, RING_SIZE);
    }

    #[test]
    fn buckets_are_independent_per_node_task_model() {
        let memory = PerformanceMemory::new();
        for _ in 0..5 {
            memory.record("http://a", TaskType::Generation, "llama3.2:3b", 50.0, true);
        }
        assert!(memory.query("http://b", TaskType::Generation, "llama3.2:3b").is_none());
        assert!(memory.query("http://a", TaskType::Chat, "llama3.2:3b").is_none());
    }

    #[test]
    fn success_rate_reflects_failures() {
        let memory = PerformanceMemory::new();
        memory.record("http://a", TaskType::Generation, "m", 50.0, true);
        memory.record("http://a", TaskType::Generation, "m", 50.0, false);
        memory.record("http://a", TaskType::Generation, "m", 50.0, true);
        memory.record("http://a", TaskType::Generation, "m", 50.0, true);
        memory.record("http://a", TaskType::Generation, "m", 50.0, true);
        let stats = memory.query("http://a", TaskType::Generation, "m").unwrap();
        assert!((stats.success_rate - 0.8).abs() < 1e-9);
    }
}
