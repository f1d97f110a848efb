//! Publish/subscribe boundary.
//!
//! Raw readings and alerts fan out to downstream consumers through this
//! interface. Delivery is at-least-once; consumers must tolerate duplicates.
//! The default implementation is an in-process broadcast channel per topic,
//! which keeps the ingest path non-blocking and lets tests subscribe
//! directly.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

/// Topic carrying every accepted reading.
pub const TOPIC_SENSOR_DATA: &str = "sensor-data";
/// Topic carrying emitted alerts.
pub const TOPIC_ANOMALY_ALERTS: &str = "anomaly-alerts";

#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to serialize payload for topic {topic}: {source}")]
    Serialize {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Abstract publish boundary.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), BusError>;
}

/// In-process broadcast bus, one channel per topic.
pub struct BroadcastBus {
    channels: DashMap<String, broadcast::Sender<String>>,
    capacity: usize,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity,
        }
    }

    /// Subscribe to a topic. Messages published before the subscription are
    /// not replayed.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<String> {
        self.sender(topic).subscribe()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for BroadcastBus {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), BusError> {
        let message = serde_json::to_string(&payload).map_err(|source| BusError::Serialize {
            topic: topic.to_string(),
            source,
        })?;

        // A send error only means nobody is subscribed right now; the bus is
        // fire-and-forget, so that is not a failure.
        let receivers = self.sender(topic).send(message).unwrap_or(0);
        debug!(%topic, receivers, "published event");
        Ok(())
    }
}
