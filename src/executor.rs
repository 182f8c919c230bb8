//! ParallelExecutor (component J, SPEC_FULL §4.10): runs a batch of agent calls with genuine
//! bounded concurrency and merges their results.
//!
//! `agent/orchestrator.rs::execute_parallel` claims to parallelize but loops sequentially (see its
//! own comment: "Execute tasks sequentially (parallel execution would require futures crate)").
//! This module is that fix: real concurrency via `futures_util::stream::buffered`, bounded by
//! `max_concurrency` per SPEC_FULL §5's backpressure requirement. `buffered` (not
//! `buffer_unordered`) is load-bearing: SPEC_FULL §4.10's `collect` strategy requires an "ordered
//! list preserving task order," and callers such as `longform.rs` label chunks positionally by
//! their index in `outcomes`.

use std::sync::Arc;
use std::time::Instant;

use futures_util::stream::{self, StreamExt};
use serde_json::Value;
use tracing::warn;

use crate::agent::role::AgentRole;
use crate::agent::runtime::AgentRuntime;
use crate::quality::{self, FormattingRelevance};

/// How the executor folds N individual results into the batch's final output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Return every result untouched, in submission order.
    Collect,
    /// Deep-merge each result's JSON object into one: arrays concatenate and dedup, conflicting
    /// scalars keep the highest-priority agent's value.
    Merge,
    /// Majority-vote on `field` across results; ties broken by the highest-priority voter.
    Vote { field: &'static str },
    /// Return the single result with the highest internal quality score (SPEC_FULL §4.12's
    /// rule-based pre-filter, `quality::validate_output`).
    Best,
}

pub struct AgentTask {
    pub role: AgentRole,
    pub prompt: String,
    pub priority: u8,
}

#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub value: Option<Value>,
    pub raw_text: String,
    pub node_url: String,
    pub priority: u8,
    pub succeeded: bool,
}

pub struct BatchResult {
    pub outcomes: Vec<TaskOutcome>,
    pub merged: Value,
    pub wall_clock_ms: f64,
    /// `sum(per-task duration) / wall_clock`, SPEC_FULL §4.10's fan-out efficiency metric.
    pub speedup_factor: f64,
}

pub struct ParallelExecutor {
    runtime: Arc<AgentRuntime>,
    max_concurrency: usize,
}

impl ParallelExecutor {
    pub fn new(runtime: Arc<AgentRuntime>, max_concurrency: usize) -> Self {
        Self {
            runtime,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Runs every task in `tasks` concurrently (bounded by `max_concurrency`), then folds the
    /// results per `strategy`. A task that errors is recorded as a failed `TaskOutcome` rather
    /// than aborting the whole batch -- one bad node shouldn't sink an otherwise-healthy fan-out.
    /// `outcomes` preserves `tasks`' input order regardless of which finishes first.
    pub async fn execute(&self, tasks: Vec<AgentTask>, strategy: MergeStrategy) -> BatchResult {
        let batch_start = Instant::now();
        let task_count = tasks.len();

        let runtime = self.runtime.clone();
        let per_task_durations = Arc::new(std::sync::Mutex::new(Vec::with_capacity(task_count)));

        let outcomes: Vec<TaskOutcome> = stream::iter(tasks)
            .map(|task| {
                let runtime = runtime.clone();
                let durations = per_task_durations.clone();
                async move {
                    let task_start = Instant::now();
                    let priority = task.priority;
                    let outcome = match runtime.call(&task.role, &task.prompt, task.priority).await {
                        Ok(result) => TaskOutcome {
                            value: result.value,
                            raw_text: result.raw_text,
                            node_url: result.node_url,
                            priority,
                            succeeded: true,
                        },
                        Err(err) => {
                            warn!(%err, "agent task failed in parallel batch");
                            TaskOutcome {
                                value: None,
                                raw_text: String::new(),
                                node_url: String::new(),
                                priority,
                                succeeded: false,
                            }
                        }
                    };
                    durations.lock().unwrap().push(task_start.elapsed().as_secs_f64() * 1000.0);
                    outcome
                }
            })
            .buffered(self.max_concurrency)
            .collect()
            .await;

        let wall_clock_ms = batch_start.elapsed().as_secs_f64() * 1000.0;
        let sum_individual_ms: f64 = per_task_durations.lock().unwrap().iter().sum();
        let speedup_factor = if wall_clock_ms > 0.0 {
            sum_individual_ms / wall_clock_ms
        } else {
            1.0
        };

        let merged = merge(&outcomes, strategy);

        BatchResult {
            outcomes,
            merged,
            wall_clock_ms,
            speedup_factor,
        }
    }
}

fn merge(outcomes: &[TaskOutcome], strategy: MergeStrategy) -> Value {
    let succeeded: Vec<&TaskOutcome> = outcomes.iter().filter(|o| o.succeeded).collect();

    match strategy {
        MergeStrategy::Collect => Value::Array(
            outcomes
                .iter()
                .map(|o| o.value.clone().unwrap_or(Value::String(o.raw_text.clone())))
                .collect(),
        ),
        MergeStrategy::Merge => deep_merge_all(&succeeded),
        MergeStrategy::Vote { field } => vote(&succeeded, field),
        MergeStrategy::Best => best(&succeeded),
    }
}

/// Folds every succeeded result's JSON value into one object, highest-priority agent first so
/// conflicting scalars resolve in its favor; arrays concatenate across all agents and dedup.
fn deep_merge_all(outcomes: &[&TaskOutcome]) -> Value {
    let mut ranked: Vec<&&TaskOutcome> = outcomes.iter().collect();
    ranked.sort_by(|a, b| b.priority.cmp(&a.priority));

    let mut iter = ranked.into_iter();
    let Some(first) = iter.next() else { return Value::Null };
    let mut acc = first.value.clone().unwrap_or_else(|| Value::String(first.raw_text.clone()));

    for outcome in iter {
        let next = outcome.value.clone().unwrap_or_else(|| Value::String(outcome.raw_text.clone()));
        acc = deep_merge(acc, next);
    }
    acc
}

/// Merges `b` into `a`. Objects merge key-wise (recursively); arrays concatenate with duplicates
/// dropped; on any other type conflict `a` wins -- callers are expected to pass the
/// higher-priority value as `a`.
fn deep_merge(a: Value, b: Value) -> Value {
    match (a, b) {
        (Value::Object(mut a_map), Value::Object(b_map)) => {
            for (key, b_val) in b_map {
                match a_map.remove(&key) {
                    Some(a_val) => {
                        a_map.insert(key, deep_merge(a_val, b_val));
                    }
                    None => {
                        a_map.insert(key, b_val);
                    }
                }
            }
            Value::Object(a_map)
        }
        (Value::Array(mut a_arr), Value::Array(b_arr)) => {
            for item in b_arr {
                if !a_arr.contains(&item) {
                    a_arr.push(item);
                }
            }
            Value::Array(a_arr)
        }
        (a, _) => a,
    }
}

/// Majority vote on `field`, extracted from each result's JSON object (missing/non-object values
/// count as `null`). Ties are broken by the highest `priority` among the tied group's voters.
fn vote(outcomes: &[&TaskOutcome], field: &str) -> Value {
    use std::collections::HashMap;

    struct Group {
        count: usize,
        best_priority: u8,
        value: Value,
    }

    let mut groups: HashMap<String, Group> = HashMap::new();
    for outcome in outcomes {
        let Some(value) = &outcome.value else { continue };
        let field_value = value.get(field).cloned().unwrap_or(Value::Null);
        let key = field_value.to_string();
        let group = groups.entry(key).or_insert_with(|| Group {
            count: 0,
            best_priority: 0,
            value: value.clone(),
        });
        group.count += 1;
        if outcome.priority >= group.best_priority {
            group.best_priority = outcome.priority;
            group.value = value.clone();
        }
    }

    groups
        .into_values()
        .max_by(|a, b| a.count.cmp(&b.count).then(a.best_priority.cmp(&b.best_priority)))
        .map(|g| g.value)
        .unwrap_or(Value::Null)
}

/// Scores each succeeded result with the same rule-based pre-filter the quality-voting workflow
/// uses (`quality::validate_output`) and returns the highest-scoring one; ties broken by priority.
fn best(outcomes: &[&TaskOutcome]) -> Value {
    outcomes
        .iter()
        .map(|o| {
            let text = o.value.as_ref().map(|v| v.to_string()).unwrap_or_else(|| o.raw_text.clone());
            let report = quality::validate_output(&text, 0, usize::MAX, FormattingRelevance::Skip);
            (report.score, o.priority, o)
        })
        .max_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
        })
        .and_then(|(_, _, o)| o.value.clone())
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(value: Option<Value>, priority: u8, succeeded: bool) -> TaskOutcome {
        TaskOutcome {
            value,
            raw_text: String::new(),
            node_url: "http://test".to_string(),
            priority,
            succeeded,
        }
    }

    #[test]
    fn collect_returns_one_entry_per_outcome() {
        let outcomes = vec![
            outcome(Some(serde_json::json!({"a": 1})), 0, true),
            outcome(Some(serde_json::json!({"a": 2})), 0, true),
        ];
        let merged = merge(&outcomes, MergeStrategy::Collect);
        assert_eq!(merged.as_array().unwrap().len(), 2);
    }

    #[test]
    fn merge_deep_merges_objects_keeping_higher_priority_scalar() {
        let outcomes = vec![
            outcome(Some(serde_json::json!({"title": "low", "tags": ["a", "b"]})), 1, true),
            outcome(Some(serde_json::json!({"title": "high", "tags": ["b", "c"]})), 5, true),
        ];
        let merged = merge(&outcomes, MergeStrategy::Merge);
        assert_eq!(merged["title"], serde_json::json!("high"));
        let tags = merged["tags"].as_array().unwrap();
        assert_eq!(tags.len(), 3);
        assert!(tags.contains(&serde_json::json!("a")));
        assert!(tags.contains(&serde_json::json!("b")));
        assert!(tags.contains(&serde_json::json!("c")));
    }

    #[test]
    fn merge_recurses_into_nested_objects() {
        let outcomes = vec![
            outcome(Some(serde_json::json!({"meta": {"x": 1, "y": 1}})), 1, true),
            outcome(Some(serde_json::json!({"meta": {"y": 2, "z": 3}})), 2, true),
        ];
        let merged = merge(&outcomes, MergeStrategy::Merge);
        assert_eq!(merged["meta"]["x"], serde_json::json!(1));
        assert_eq!(merged["meta"]["y"], serde_json::json!(2));
        assert_eq!(merged["meta"]["z"], serde_json::json!(3));
    }

    #[test]
    fn vote_picks_majority_value_on_nominated_field() {
        let outcomes = vec![
            outcome(Some(serde_json::json!({"verdict": "x"})), 5, true),
            outcome(Some(serde_json::json!({"verdict": "x"})), 5, true),
            outcome(Some(serde_json::json!({"verdict": "y"})), 5, true),
        ];
        let refs: Vec<&TaskOutcome> = outcomes.iter().collect();
        assert_eq!(vote(&refs, "verdict")["verdict"], serde_json::json!("x"));
    }

    #[test]
    fn vote_breaks_ties_by_highest_priority() {
        let outcomes = vec![
            outcome(Some(serde_json::json!({"verdict": "low_priority_value"})), 2, true),
            outcome(Some(serde_json::json!({"verdict": "high_priority_value"})), 9, true),
        ];
        let refs: Vec<&TaskOutcome> = outcomes.iter().collect();
        assert_eq!(vote(&refs, "verdict")["verdict"], serde_json::json!("high_priority_value"));
    }

    #[test]
    fn vote_ignores_failed_outcomes_without_a_value() {
        let outcomes = vec![
            outcome(Some(serde_json::json!({"verdict": "x"})), 5, true),
            outcome(None, 5, false),
        ];
        let refs: Vec<&TaskOutcome> = outcomes.iter().collect();
        assert_eq!(vote(&refs, "verdict")["verdict"], serde_json::json!("x"));
    }

    #[test]
    fn best_picks_highest_quality_score() {
        // A short, two-sentence-repeated blob scores worse under the rule-based pre-filter than a
        // clean, varied one, regardless of which one happens to be longer in raw bytes.
        let repetitive = outcome(
            Some(serde_json::json!(
                "This is a test. This is a test. This is a test. Something else entirely here."
            )),
            1,
            true,
        );
        let clean = outcome(Some(serde_json::json!("A clean, varied response with no repeated sentences.")), 1, true);
        let merged = merge(&[repetitive, clean.clone()], MergeStrategy::Best);
        assert_eq!(merged, clean.value.unwrap());
    }
}
