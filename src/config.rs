//! TOML configuration for the SensorWarden daemon.
//!
//! Layered model: compiled-in defaults, overridden by a TOML file found via
//! the `SENSORWARDEN_CONFIG` environment variable or the standard system
//! location. Every threshold the detection pipeline uses lives here --
//! nothing policy-relevant is hard-coded.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Root configuration for the daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP API.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path.
    pub db_path: String,
    /// Upper bound on any single store round-trip (window fallback,
    /// alert persistence). On timeout the caller degrades, it does not block.
    pub store_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "data/sensorwarden.db".to_string(),
            store_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Trailing history retained per sensor, in hours.
    pub horizon_hours: i64,
    /// TTL for cached window snapshots.
    pub cache_ttl_secs: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            horizon_hours: 24,
            cache_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Directory holding the co-versioned model artifacts
    /// (normalizer.json, classifier.json, metrics.json).
    pub model_dir: String,
    /// Sequence length fed to the classifier.
    pub sequence_length: usize,
    /// Training gate: warn when held-out accuracy lands below this.
    pub target_accuracy: f64,
    /// RNG seed for the split/batch shuffles. Fixed seed = reproducible runs.
    pub train_seed: u64,
    /// Held-out fraction for evaluation.
    pub test_fraction: f64,
    /// Gradient-descent settings.
    pub learning_rate: f64,
    pub max_epochs: usize,
    pub batch_size: usize,
    /// Early stopping: epochs without validation-loss improvement.
    pub patience: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_dir: "models".to_string(),
            sequence_length: 24,
            target_accuracy: 0.95,
            train_seed: 42,
            test_fraction: 0.2,
            learning_rate: 0.05,
            max_epochs: 100,
            batch_size: 32,
            patience: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// The classifier's own boolean decision boundary.
    pub decision_boundary: f64,
    /// Minimum probability before an alert is emitted. Deliberately a
    /// separate knob from `model.target_accuracy`: how accurate a model must
    /// be to ship has nothing to do with how confident a single prediction
    /// must be to page someone.
    pub min_alert_probability: f64,
    /// Severity tier thresholds. Must be monotonic:
    /// medium <= high <= critical.
    pub severity_medium: f64,
    pub severity_high: f64,
    pub severity_critical: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            decision_boundary: 0.5,
            min_alert_probability: 0.6,
            severity_medium: 0.6,
            severity_high: 0.8,
            severity_critical: 0.9,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.validate()?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path in the `SENSORWARDEN_CONFIG` environment variable.
    /// 2. `/etc/sensorwarden/sensorwarden.toml`.
    /// 3. Compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var("SENSORWARDEN_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "SENSORWARDEN_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new("/etc/sensorwarden/sensorwarden.toml");
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(error = %e, "system config unreadable, using defaults");
                }
            }
        }

        Self::default()
    }

    /// Reject configurations the pipeline cannot honor.
    pub fn validate(&self) -> Result<()> {
        let d = &self.detection;
        if !(d.severity_medium <= d.severity_high && d.severity_high <= d.severity_critical) {
            bail!(
                "severity thresholds must be monotonic: medium={} high={} critical={}",
                d.severity_medium,
                d.severity_high,
                d.severity_critical
            );
        }
        for (name, v) in [
            ("decision_boundary", d.decision_boundary),
            ("min_alert_probability", d.min_alert_probability),
            ("severity_medium", d.severity_medium),
            ("severity_high", d.severity_high),
            ("severity_critical", d.severity_critical),
        ] {
            if !(0.0..=1.0).contains(&v) {
                bail!("detection.{} must be within [0, 1], got {}", name, v);
            }
        }
        if self.model.sequence_length == 0 {
            bail!("model.sequence_length must be at least 1");
        }
        if !(0.0..1.0).contains(&self.model.test_fraction) || self.model.test_fraction == 0.0 {
            bail!(
                "model.test_fraction must be in (0, 1), got {}",
                self.model.test_fraction
            );
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.storage.store_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.window.cache_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_non_monotonic_severity_rejected() {
        let mut cfg = Config::default();
        cfg.detection.severity_high = 0.5; // below medium
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_out_of_range_threshold_rejected() {
        let mut cfg = Config::default();
        cfg.detection.min_alert_probability = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let cfg = Config::default();
        let text = toml::to_string(&cfg).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.model.sequence_length, cfg.model.sequence_length);
        assert_eq!(back.detection.severity_critical, cfg.detection.severity_critical);
    }
}
