//! Severity policy: anomaly probability -> severity tier.

use crate::config::DetectionConfig;
use crate::detect::Severity;

/// Stateless threshold mapping. Thresholds come from configuration and are
/// validated monotonic at load time, so classification can never invert:
/// a higher probability always maps to an equal-or-higher tier.
#[derive(Debug, Clone)]
pub struct SeverityPolicy {
    medium: f64,
    high: f64,
    critical: f64,
}

impl SeverityPolicy {
    pub fn new(config: &DetectionConfig) -> Self {
        Self {
            medium: config.severity_medium,
            high: config.severity_high,
            critical: config.severity_critical,
        }
    }

    pub fn classify(&self, probability: f64) -> Severity {
        if probability >= self.critical {
            Severity::Critical
        } else if probability >= self.high {
            Severity::High
        } else if probability >= self.medium {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

impl Default for SeverityPolicy {
    fn default() -> Self {
        Self::new(&DetectionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_thresholds() {
        let policy = SeverityPolicy::default();
        assert_eq!(policy.classify(0.95), Severity::Critical);
        assert_eq!(policy.classify(0.9), Severity::Critical);
        assert_eq!(policy.classify(0.85), Severity::High);
        assert_eq!(policy.classify(0.8), Severity::High);
        assert_eq!(policy.classify(0.7), Severity::Medium);
        assert_eq!(policy.classify(0.6), Severity::Medium);
        assert_eq!(policy.classify(0.59), Severity::Low);
        assert_eq!(policy.classify(0.0), Severity::Low);
    }

    #[test]
    fn test_monotonic_over_probability_sweep() {
        let policy = SeverityPolicy::default();
        let mut last = Severity::Low;
        for i in 0..=1000 {
            let p = i as f64 / 1000.0;
            let sev = policy.classify(p);
            assert!(
                sev.rank() >= last.rank(),
                "severity regressed at p={p}: {last:?} -> {sev:?}"
            );
            last = sev;
        }
    }

    #[test]
    fn test_custom_thresholds() {
        let policy = SeverityPolicy::new(&DetectionConfig {
            severity_medium: 0.3,
            severity_high: 0.5,
            severity_critical: 0.7,
            ..DetectionConfig::default()
        });
        assert_eq!(policy.classify(0.4), Severity::Medium);
        assert_eq!(policy.classify(0.69), Severity::High);
        assert_eq!(policy.classify(0.71), Severity::Critical);
    }
}
