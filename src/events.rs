//! EventBus (component M): best-effort structured pub/sub for routing, health, and lifecycle
//! events.
//!
//! Grounded on `prom_metrics.rs`'s ambient-observability shape and
//! `examples/original_source/redis_log_publisher.py`'s exact channel name constants and
//! per-event-type dual-publish routing (SPEC_FULL §4.13a). Passed as a constructor argument to
//! every component that needs to publish, per the Design Note on cyclic references — the bus
//! never owns its producers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

/// Bound on the internal subscriber queue; back-pressure drops the oldest event (SPEC_FULL §5).
const QUEUE_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub component: String,
    pub level: Level,
    pub event_type: String,
    pub message: String,
    pub details: Value,
}

impl Event {
    pub fn new(component: &str, level: Level, event_type: &str, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            component: component.to_string(),
            level,
            event_type: event_type.to_string(),
            message: message.into(),
            details: Value::Null,
        }
    }

    pub fn info(component: &str, event_type: &str, message: impl Into<String>) -> Self {
        Self::new(component, Level::Info, event_type, message)
    }

    pub fn warn(component: &str, event_type: &str, message: impl Into<String>) -> Self {
        Self::new(component, Level::Warn, event_type, message)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Redis channel names (SPEC_FULL §4.13a), keyed by logical channel.
    fn redis_channels(&self) -> Vec<&'static str> {
        let mut channels = vec![CHANNEL_ALL_LOGS];
        match self.event_type.as_str() {
            t if t.starts_with("coordinator.") => channels.push(CHANNEL_COORDINATOR),
            t if t.starts_with("rpc.") => channels.push(CHANNEL_RPC_BACKENDS),
            "metric.snapshot" => channels.push(CHANNEL_METRICS),
            _ => {}
        }
        channels
    }
}

const CHANNEL_ALL_LOGS: &str = "synapticllamas:llama_cpp:logs";
const CHANNEL_COORDINATOR: &str = "synapticllamas:llama_cpp:coordinator";
const CHANNEL_RPC_BACKENDS: &str = "synapticllamas:llama_cpp:rpc_backends";
const CHANNEL_METRICS: &str = "synapticllamas:llama_cpp:metrics";
#[allow(dead_code)]
const CHANNEL_RAW: &str = "synapticllamas:llama_cpp:raw";

/// Structured pub/sub channel. `publish` is best-effort and never blocks the producer: the
/// in-process broadcast uses a bounded ring (oldest dropped under back-pressure, matching
/// `tokio::sync::broadcast`'s own lagging-receiver semantics), and the optional Redis sink is
/// fire-and-forget.
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    redis: Mutex<Option<redis::aio::ConnectionManager>>,
}

impl EventBus {
    pub fn new_disconnected() -> Self {
        let (sender, _) = broadcast::channel(QUEUE_CAPACITY);
        Self {
            sender,
            redis: Mutex::new(None),
        }
    }

    /// Connects the optional external Redis sink. Failure to connect is logged and swallowed --
    /// the bus degrades silently to in-process-only, per SPEC_FULL §4.13.
    pub async fn connect_redis(self: &Arc<Self>, redis_url: &str) {
        match redis::Client::open(redis_url) {
            Ok(client) => match client.get_connection_manager().await {
                Ok(manager) => {
                    *self.redis.lock().await = Some(manager);
                    debug!("event bus connected to redis");
                }
                Err(err) => warn!(%err, "event bus could not connect to redis, continuing without it"),
            },
            Err(err) => warn!(%err, "invalid redis url for event bus"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Never blocks and never fails: a `SendError` just means there are no subscribers right now.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event.clone());

        if let Ok(guard) = self.redis.try_lock() {
            if let Some(manager) = guard.as_ref() {
                let mut manager = manager.clone();
                tokio::spawn(async move {
                    let payload = match serde_json::to_string(&event) {
                        Ok(p) => p,
                        Err(_) => return,
                    };
                    for channel in event.redis_channels() {
                        let _: redis::RedisResult<()> =
                            redis::cmd("PUBLISH")
                                .arg(channel)
                                .arg(&payload)
                                .query_async(&mut manager)
                                .await;
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_never_blocks_with_no_subscribers() {
        let bus = EventBus::new_disconnected();
        bus.publish(Event::info("registry", "node_healthy", "ok"));
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new_disconnected();
        let mut rx = bus.subscribe();
        bus.publish(Event::warn("registry", "node_unhealthy", "down"));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, "node_unhealthy");
    }

    #[test]
    fn coordinator_events_route_to_coordinator_channel() {
        let event = Event::info("hybrid_router", "coordinator.start", "starting");
        assert!(event.redis_channels().contains(&CHANNEL_COORDINATOR));
        assert!(event.redis_channels().contains(&CHANNEL_ALL_LOGS));
    }

    #[test]
    fn metric_snapshot_routes_to_metrics_channel() {
        let event = Event::info("performance_memory", "metric.snapshot", "snapshot");
        assert!(event.redis_channels().contains(&CHANNEL_METRICS));
    }
}
