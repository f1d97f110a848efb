//! Ingest boundary: accept a reading, persist it, fan it out, and schedule
//! asynchronous scoring.
//!
//! Ingestion and detection are decoupled stages: a reading is accepted as
//! soon as the window cache has it, and whatever the detection task runs
//! into afterwards (no model, store hiccups, too little history) is its own
//! problem and never fails the ingest call.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::bus::{EventBus, TOPIC_SENSOR_DATA};
use crate::detect::engine::DetectionEngine;
use crate::detect::DetectError;
use crate::storage::Reading;
use crate::window::WindowCache;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid reading: {0}")]
    Invalid(String),
}

/// What the caller gets back synchronously. Scoring continues in the
/// background after this is returned.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReceipt {
    /// Store row id; None when the write-through store was unavailable and
    /// the reading is held in memory only.
    pub reading_id: Option<i64>,
    pub sensor_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

pub struct IngestService {
    windows: Arc<WindowCache>,
    engine: Arc<DetectionEngine>,
    bus: Arc<dyn EventBus>,
}

impl IngestService {
    pub fn new(
        windows: Arc<WindowCache>,
        engine: Arc<DetectionEngine>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            windows,
            engine,
            bus,
        }
    }

    /// Accept one reading. Returns as soon as the reading is in the window
    /// cache; the anomaly decision runs on a spawned task.
    pub async fn ingest(&self, reading: Reading) -> Result<IngestReceipt, IngestError> {
        validate(&reading)?;

        let reading_id = match self.windows.append(reading.clone()).await {
            Ok(id) => id,
            Err(e) => {
                // The window cache itself failing is unexpected; the
                // reading is still not lost to the caller's knowledge.
                warn!(
                    sensor_id = %reading.sensor_id,
                    timestamp = %reading.timestamp,
                    error = %e,
                    "window append failed"
                );
                None
            }
        };

        if let Ok(payload) = serde_json::to_value(&reading) {
            if let Err(e) = self.bus.publish(TOPIC_SENSOR_DATA, payload).await {
                warn!(sensor_id = %reading.sensor_id, error = %e, "reading publication failed");
            }
        }

        let engine = self.engine.clone();
        let task_reading = reading.clone();
        tokio::spawn(async move {
            match engine.process_reading(reading_id, &task_reading).await {
                Ok(verdict) => {
                    debug!(sensor_id = %task_reading.sensor_id, ?verdict, "scoring complete");
                }
                Err(DetectError::ModelUnavailable) => {
                    warn!(
                        sensor_id = %task_reading.sensor_id,
                        timestamp = %task_reading.timestamp,
                        "scoring skipped: no trained model loaded (health degraded)"
                    );
                }
            }
        });

        Ok(IngestReceipt {
            reading_id,
            sensor_id: reading.sensor_id,
            timestamp: reading.timestamp,
        })
    }
}

fn validate(reading: &Reading) -> Result<(), IngestError> {
    if reading.sensor_id.trim().is_empty() {
        return Err(IngestError::Invalid("sensor_id must not be empty".into()));
    }
    if reading.sensor_type.trim().is_empty() {
        return Err(IngestError::Invalid("sensor_type must not be empty".into()));
    }
    if reading.unit.trim().is_empty() {
        return Err(IngestError::Invalid("unit must not be empty".into()));
    }
    if !reading.value.is_finite() {
        return Err(IngestError::Invalid(format!(
            "value must be finite, got {}",
            reading.value
        )));
    }
    Ok(())
}
