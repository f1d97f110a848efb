//! Detection engine: window -> features -> sequence -> score -> alert.
//!
//! Scoring is decoupled from ingestion: every failure here is logged and
//! degrades to "no verdict", it never propagates back to the ingest caller.
//! The one exception is a missing model, which refuses to guess and is
//! surfaced to the caller as `DetectError::ModelUnavailable` so the health
//! surface can report degradation.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, TOPIC_ANOMALY_ALERTS};
use crate::config::{Config, ModelConfig};
use crate::detect::alert::{Alert, AlertFactory};
use crate::detect::{AnomalyScore, DetectError, Verdict};
use crate::features::engineer_features;
use crate::model::sequence::{self, SequenceError};
use crate::model::trainer::{TrainingPipeline, TrainingReport};
use crate::model::ModelHandle;
use crate::storage::{self, LabeledReading, Pool, Reading};
use crate::window::WindowCache;

pub struct DetectionEngine {
    pool: Pool,
    windows: Arc<WindowCache>,
    models: Arc<ModelHandle>,
    alerts: AlertFactory,
    bus: Arc<dyn EventBus>,
    model_config: ModelConfig,
    store_timeout: std::time::Duration,
}

impl DetectionEngine {
    pub fn new(
        pool: Pool,
        windows: Arc<WindowCache>,
        models: Arc<ModelHandle>,
        bus: Arc<dyn EventBus>,
        config: &Config,
    ) -> Self {
        let alerts = AlertFactory::new(pool.clone(), &config.detection);
        Self {
            pool,
            windows,
            models,
            alerts,
            bus,
            model_config: config.model.clone(),
            store_timeout: config.store_timeout(),
        }
    }

    pub fn alerts(&self) -> &AlertFactory {
        &self.alerts
    }

    pub fn models(&self) -> &ModelHandle {
        &self.models
    }

    /// Score a freshly appended reading and emit an alert if it qualifies.
    ///
    /// `reading_id` is the store row when the write-through succeeded; the
    /// verdict is written back onto that row. Called from the async scoring
    /// task the ingest boundary spawns.
    pub async fn process_reading(
        &self,
        reading_id: Option<i64>,
        reading: &Reading,
    ) -> Result<Verdict, DetectError> {
        let verdict = self.score_window(&reading.sensor_id).await?;

        match &verdict {
            Verdict::NoVerdict { reason, .. } => {
                debug!(
                    sensor_id = %reading.sensor_id,
                    timestamp = %reading.timestamp,
                    %reason,
                    "no verdict for reading"
                );
            }
            Verdict::Scored(score) => {
                self.annotate_reading(reading_id, reading, score).await;

                if let Some(alert) = self.alerts.maybe_alert(reading, score.probability) {
                    match self.persist_and_publish(alert).await {
                        Ok(alert) => {
                            info!(
                                sensor_id = %alert.sensor_id,
                                severity = %alert.severity,
                                probability = alert.probability,
                                "alert emitted"
                            );
                        }
                        Err(e) => {
                            warn!(
                                sensor_id = %reading.sensor_id,
                                timestamp = %reading.timestamp,
                                error = %e,
                                "alert persistence failed"
                            );
                        }
                    }
                }
            }
        }

        Ok(verdict)
    }

    /// On-demand scoring for one sensor's current window. Query-only: no
    /// store annotation, no alert emission.
    pub async fn score_now(&self, sensor_id: &str) -> Result<Verdict, DetectError> {
        self.score_window(sensor_id).await
    }

    /// Run the training pipeline and, only on full success, persist the
    /// artifacts and swap the serving model. A corpus of None trains from
    /// the labeled rows in the store.
    pub async fn train(&self, corpus: Option<Vec<LabeledReading>>) -> anyhow::Result<TrainingReport> {
        let corpus = match corpus {
            Some(rows) => rows,
            None => {
                let pool = self.pool.clone();
                tokio::task::spawn_blocking(move || storage::load_labeled_corpus(&pool))
                    .await
                    .context("corpus load task failed")??
            }
        };
        anyhow::ensure!(!corpus.is_empty(), "labeled corpus is empty");

        let config = self.model_config.clone();
        let (model, report) =
            tokio::task::spawn_blocking(move || TrainingPipeline::new(config).run(&corpus))
                .await
                .context("training task failed")??;

        let dir = PathBuf::from(&self.model_config.model_dir);
        if let Err(e) = model.save_artifacts(&dir) {
            // The run produced valid metrics; report them before bailing so
            // the failure is diagnosable, but never install an unpersisted
            // model.
            warn!(
                accuracy = report.metrics.accuracy,
                f1 = report.metrics.f1,
                error = %e,
                "artifact persistence failed; serving model unchanged"
            );
            return Err(e).context("failed to persist model artifacts");
        }

        self.models.install(Arc::new(model));
        Ok(report)
    }

    async fn score_window(&self, sensor_id: &str) -> Result<Verdict, DetectError> {
        // Refusing to guess beats guessing: without a model there is no
        // verdict at all, and the caller decides how loudly to complain.
        let model = self.models.snapshot().ok_or(DetectError::ModelUnavailable)?;

        let window = self.windows.get_window(sensor_id).await;
        let features = engineer_features(&window);

        let sequence = match sequence::assemble(
            &features,
            &model.normalizer,
            self.model_config.sequence_length,
        ) {
            Ok(seq) => seq,
            Err(SequenceError::InsufficientHistory { needed, have }) => {
                return Ok(Verdict::NoVerdict {
                    sensor_id: sensor_id.to_string(),
                    reason: format!("insufficient history: need {needed}, have {have}"),
                });
            }
        };

        let probability = model.classifier.score(&sequence);
        let timestamp = features
            .last()
            .map(|f| f.timestamp)
            .unwrap_or_else(chrono::Utc::now);

        Ok(Verdict::Scored(AnomalyScore {
            sensor_id: sensor_id.to_string(),
            timestamp,
            probability,
            is_anomaly: probability > 0.5,
        }))
    }

    /// Write the verdict back onto the stored reading row. Best-effort: a
    /// reading that never reached the store (write-through timeout) has no
    /// row to annotate.
    async fn annotate_reading(
        &self,
        reading_id: Option<i64>,
        reading: &Reading,
        score: &AnomalyScore,
    ) {
        let Some(id) = reading_id else {
            debug!(
                sensor_id = %reading.sensor_id,
                timestamp = %reading.timestamp,
                "reading has no store id; verdict not annotated"
            );
            return;
        };

        let pool = self.pool.clone();
        let is_anomaly = score.is_anomaly;
        let probability = score.probability;
        let result = tokio::task::spawn_blocking(move || {
            storage::update_reading_anomaly(&pool, id, is_anomaly, probability)
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(
                    sensor_id = %reading.sensor_id,
                    timestamp = %reading.timestamp,
                    error = %e,
                    "failed to annotate reading with verdict"
                );
            }
            Err(join_err) => {
                warn!(error = %join_err, "annotation task failed");
            }
        }
    }

    async fn persist_and_publish(&self, alert: Alert) -> anyhow::Result<Alert> {
        let alert = {
            // AlertFactory::persist is synchronous SQLite work, bounded so a
            // wedged store cannot stall the scoring task indefinitely.
            let alerts = self.alerts.clone();
            let save = tokio::task::spawn_blocking(move || alerts.persist(alert));
            match tokio::time::timeout(self.store_timeout, save).await {
                Ok(join) => join??,
                Err(_) => anyhow::bail!("alert persistence timed out after {:?}", self.store_timeout),
            }
        };

        let payload = serde_json::to_value(&alert)?;
        if let Err(e) = self.bus.publish(TOPIC_ANOMALY_ALERTS, payload).await {
            warn!(error = %e, "alert publication failed; alert is persisted");
        }

        Ok(alert)
    }
}
