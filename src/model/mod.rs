//! Trained model bundle, artifact persistence, and the serving handle.
//!
//! A trained model is serialized as two co-versioned artifacts
//! (`normalizer.json`, `classifier.json`) plus a `metrics.json` record.
//! Both artifacts carry the same `model_version`; the loader refuses a
//! classifier whose paired normalizer is missing or from a different run.
//! The serving side holds at most one active model behind `ModelHandle`,
//! swapped atomically so in-flight scoring never observes a half-updated
//! model.

pub mod classifier;
pub mod normalizer;
pub mod sequence;
pub mod trainer;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use self::classifier::SequenceClassifier;
use self::normalizer::Normalizer;

pub const NORMALIZER_FILE: &str = "normalizer.json";
pub const CLASSIFIER_FILE: &str = "classifier.json";
pub const METRICS_FILE: &str = "metrics.json";

/// Held-out evaluation metrics from the training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

/// The complete inference bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainedModel {
    pub model_version: Uuid,
    pub trained_at: DateTime<Utc>,
    pub normalizer: Normalizer,
    pub classifier: SequenceClassifier,
    pub metrics: TrainingMetrics,
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model artifact missing: {0}")]
    ArtifactMissing(PathBuf),
    #[error("model artifact unreadable or corrupt: {path}: {reason}")]
    ArtifactCorrupt { path: PathBuf, reason: String },
    #[error("artifact version mismatch: classifier {classifier} vs normalizer {normalizer}")]
    VersionMismatch { classifier: Uuid, normalizer: Uuid },
}

#[derive(Serialize, Deserialize)]
struct NormalizerArtifact {
    model_version: Uuid,
    trained_at: DateTime<Utc>,
    params: Normalizer,
}

#[derive(Serialize, Deserialize)]
struct ClassifierArtifact {
    model_version: Uuid,
    trained_at: DateTime<Utc>,
    params: SequenceClassifier,
}

#[derive(Serialize, Deserialize)]
struct MetricsArtifact {
    model_version: Uuid,
    trained_at: DateTime<Utc>,
    metrics: TrainingMetrics,
}

impl TrainedModel {
    /// Persist all three artifacts under `dir`. Each file is written to a
    /// temp path and renamed into place, so a crash mid-save never leaves a
    /// torn artifact behind.
    pub fn save_artifacts(&self, dir: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(dir)?;

        write_artifact(
            &dir.join(NORMALIZER_FILE),
            &NormalizerArtifact {
                model_version: self.model_version,
                trained_at: self.trained_at,
                params: self.normalizer.clone(),
            },
        )?;
        write_artifact(
            &dir.join(CLASSIFIER_FILE),
            &ClassifierArtifact {
                model_version: self.model_version,
                trained_at: self.trained_at,
                params: self.classifier.clone(),
            },
        )?;
        write_artifact(
            &dir.join(METRICS_FILE),
            &MetricsArtifact {
                model_version: self.model_version,
                trained_at: self.trained_at,
                metrics: self.metrics.clone(),
            },
        )?;

        info!(dir = %dir.display(), version = %self.model_version, "model artifacts saved");
        Ok(())
    }

    /// Load and version-check the artifact pair from `dir`.
    pub fn load_artifacts(dir: &Path) -> Result<Self, ModelError> {
        let classifier: ClassifierArtifact = read_artifact(&dir.join(CLASSIFIER_FILE))?;
        let normalizer: NormalizerArtifact = read_artifact(&dir.join(NORMALIZER_FILE))?;

        if classifier.model_version != normalizer.model_version {
            return Err(ModelError::VersionMismatch {
                classifier: classifier.model_version,
                normalizer: normalizer.model_version,
            });
        }

        let metrics: MetricsArtifact = read_artifact(&dir.join(METRICS_FILE))?;

        Ok(Self {
            model_version: classifier.model_version,
            trained_at: classifier.trained_at,
            normalizer: normalizer.params,
            classifier: classifier.params,
            metrics: metrics.metrics,
        })
    }
}

fn write_artifact<T: Serialize>(path: &Path, artifact: &T) -> anyhow::Result<()> {
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(artifact)?;
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn read_artifact<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ModelError> {
    let content = std::fs::read_to_string(path)
        .map_err(|_| ModelError::ArtifactMissing(path.to_path_buf()))?;
    serde_json::from_str(&content).map_err(|e| ModelError::ArtifactCorrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Shared, read-mostly handle to the active model.
///
/// Readers clone the inner Arc and score against an immutable snapshot;
/// `install` swaps the Arc under a short write lock, so a completed training
/// run replaces the serving model atomically and in-flight inference is
/// never disturbed.
#[derive(Default)]
pub struct ModelHandle {
    slot: RwLock<Option<Arc<TrainedModel>>>,
}

impl ModelHandle {
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(None),
        }
    }

    /// Current snapshot, if a model is loaded.
    pub fn snapshot(&self) -> Option<Arc<TrainedModel>> {
        self.slot.read().clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.slot.read().is_some()
    }

    /// Atomically replace the serving model.
    pub fn install(&self, model: Arc<TrainedModel>) {
        let version = model.model_version;
        *self.slot.write() = Some(model);
        info!(%version, "model installed");
    }

    /// Load from disk and install. Refuses mismatched or missing artifacts
    /// without touching the currently serving model.
    pub fn reload_from(&self, dir: &Path) -> Result<(), ModelError> {
        let model = TrainedModel::load_artifacts(dir)?;
        self.install(Arc::new(model));
        Ok(())
    }
}
