//! HedgingExecutor (component G): optional race-to-first across k nodes with cancellation of
//! losers.
//!
//! k-selection thresholds grounded on `examples/original_source/demo_hedging.py`'s adaptive
//! decision shape; cancellation grounded on `worker_pool.rs`'s `tokio::select!` idiom.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::{OrchestratorError, Result};

const NO_HEDGE_LOAD_THRESHOLD: f64 = 0.7;
const NO_HEDGE_PRIORITY_THRESHOLD: u8 = 5;
const HEDGE_PRIORITY_THRESHOLD: u8 = 7;
const HEDGE_LOAD_THRESHOLD: f64 = 0.5;

/// Chooses how many nodes to race, per SPEC_FULL §4.7: default 1 (no hedge) at high load or low
/// priority; 2 when priority is high and load is low; `force_hedge` always wins.
pub fn choose_k(priority: u8, cluster_load: f64, force_hedge: bool) -> usize {
    if force_hedge {
        return 2;
    }
    if cluster_load > NO_HEDGE_LOAD_THRESHOLD || priority < NO_HEDGE_PRIORITY_THRESHOLD {
        return 1;
    }
    if priority >= HEDGE_PRIORITY_THRESHOLD && cluster_load < HEDGE_LOAD_THRESHOLD {
        return 2;
    }
    1
}

/// One branch's outcome, used by the caller to build `PerformanceRecord`s: a cancelled loser is
/// tagged so it's excluded from failure-rate accounting (SPEC_FULL §4.7).
pub struct RaceOutcome<T> {
    pub node_url: String,
    pub value: Option<T>,
    pub cancelled: bool,
}

/// Launches `branches` (already restricted to the top-k candidate nodes by the caller) concurrently
/// and returns the first success. All other in-flight branches are implicitly dropped (and thus
/// cancelled, since they are `tokio::spawn`ed tasks) the moment a winner is found.
///
/// `branches` is `(node_url, future)` pairs; the future must resolve to `Ok(T)` on success.
pub async fn race<T, F>(branches: Vec<(String, F)>, total_timeout: Duration) -> Result<(String, T)>
where
    T: Send + 'static,
    F: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    if branches.is_empty() {
        return Err(OrchestratorError::NoCapacity {
            model: String::new(),
        });
    }

    let (tx, mut rx) = tokio::sync::mpsc::channel(branches.len());
    let mut handles = Vec::with_capacity(branches.len());

    for (node_url, fut) in branches {
        let tx = tx.clone();
        let handle = tokio::spawn(async move {
            let result = fut.await;
            let _ = tx.send((node_url, result)).await;
        });
        handles.push(handle);
    }
    drop(tx);

    let outcome = tokio::time::timeout(total_timeout, async {
        while let Some((node_url, result)) = rx.recv().await {
            if let Ok(value) = result {
                return Some((node_url, value));
            }
            debug!(node_url, "hedged branch failed, awaiting remaining branches");
        }
        None
    })
    .await;

    for handle in handles {
        handle.abort();
    }

    match outcome {
        Ok(Some((node_url, value))) => Ok((node_url, value)),
        Ok(None) => Err(OrchestratorError::Unreachable {
            node_url: "all hedged branches".to_string(),
            source: anyhow::anyhow!("every branch failed"),
        }),
        Err(_) => Err(OrchestratorError::DeadlineExceeded {
            task_id: "hedged race".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_no_hedge_under_high_load() {
        assert_eq!(choose_k(8, 0.8, false), 1);
    }

    #[test]
    fn default_is_no_hedge_for_low_priority() {
        assert_eq!(choose_k(2, 0.1, false), 1);
    }

    #[test]
    fn hedges_for_high_priority_low_load() {
        assert_eq!(choose_k(8, 0.2, false), 2);
    }

    #[test]
    fn force_hedge_always_wins() {
        assert_eq!(choose_k(1, 0.99, true), 2);
    }

    #[tokio::test]
    async fn race_returns_first_success_and_cancels_losers() {
        let branches: Vec<(String, _)> = vec![
            ("http://slow".to_string(), async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, anyhow::Error>("slow")
            }),
            ("http://fast".to_string(), async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, anyhow::Error>("fast")
            }),
        ];

        let (winner_url, value) = race(branches, Duration::from_secs(1)).await.unwrap();
        assert_eq!(winner_url, "http://fast");
        assert_eq!(value, "fast");
    }

    #[tokio::test]
    async fn race_fails_when_all_branches_fail() {
        let branches: Vec<(String, _)> = vec![(
            "http://a".to_string(),
            async { Err::<&str, _>(anyhow::anyhow!("boom")) },
        )];
        let result = race(branches, Duration::from_secs(1)).await;
        assert!(result.is_err());
    }
}
