//! Anomaly detection: severity policy, alert factory, per-reading engine.

pub mod alert;
pub mod engine;
pub mod severity;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("no trained model is loaded; scoring refused")]
    ModelUnavailable,
}

/// Severity tiers for emitted alerts, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Ordinal rank; higher is more severe.
    pub fn rank(self) -> u8 {
        match self {
            Severity::Low => 0,
            Severity::Medium => 1,
            Severity::High => 2,
            Severity::Critical => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// Outcome of scoring a single reading.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AnomalyScore {
    pub sensor_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub probability: f64,
    pub is_anomaly: bool,
}

/// What the engine decided about one reading. `NoVerdict` covers the
/// insufficient-history case: not an error, just nothing to say yet.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Scored(AnomalyScore),
    NoVerdict { sensor_id: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
        assert_eq!(Severity::Critical.rank(), 3);
    }

    #[test]
    fn test_severity_string_roundtrip() {
        for sev in [Severity::Low, Severity::Medium, Severity::High, Severity::Critical] {
            assert_eq!(Severity::from_str(sev.as_str()).unwrap(), sev);
        }
        assert!(Severity::from_str("normal").is_err());
    }
}
