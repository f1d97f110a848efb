//! Feature engine: ordered readings in, ordered feature vectors out.
//!
//! Pure and stateless given a window. Rolling statistics run over the
//! trailing 24 points through an incremental sum/sum-of-squares ring, so a
//! window of length n costs O(n) total rather than O(n * 24) rescans. With
//! fewer than 24 prior points the statistics narrow to the points available
//! (minimum one, the current point). Any undefined quantity -- delta at the
//! series head, percent change over a zero predecessor, std of a single
//! point -- is fixed to 0.0.

use chrono::{Datelike, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::storage::Reading;

/// Trailing points in the rolling mean/std window.
pub const ROLLING_WINDOW: usize = 24;

/// Number of model input features per point.
pub const NUM_FEATURES: usize = 7;

/// Derived features for one reading. Keyed by (sensor_id, timestamp);
/// derivable from the window, so never persisted on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub sensor_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub raw_value: f64,
    pub hour_of_day: u32,
    pub day_of_week: u32,
    pub rolling_mean_24: f64,
    pub rolling_std_24: f64,
    pub value_delta: f64,
    pub value_pct_change: f64,
}

impl FeatureVector {
    /// Matrix layout used by the normalizer and classifier. Order matters
    /// and must stay in sync with the training pipeline.
    pub fn to_array(&self) -> [f64; NUM_FEATURES] {
        [
            self.raw_value,
            self.hour_of_day as f64,
            self.day_of_week as f64,
            self.rolling_mean_24,
            self.rolling_std_24,
            self.value_delta,
            self.value_pct_change,
        ]
    }
}

/// Incremental accumulator over the trailing `ROLLING_WINDOW` values.
struct RollingStats {
    values: VecDeque<f64>,
    sum: f64,
    sum_sq: f64,
}

impl RollingStats {
    fn new() -> Self {
        Self {
            values: VecDeque::with_capacity(ROLLING_WINDOW),
            sum: 0.0,
            sum_sq: 0.0,
        }
    }

    fn push(&mut self, value: f64) {
        if self.values.len() == ROLLING_WINDOW {
            if let Some(old) = self.values.pop_front() {
                self.sum -= old;
                self.sum_sq -= old * old;
            }
        }
        self.values.push_back(value);
        self.sum += value;
        self.sum_sq += value * value;
    }

    fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.sum / self.values.len() as f64
    }

    /// Sample standard deviation over the held values; 0.0 for a single
    /// point. Floating-point cancellation can push the variance a hair below
    /// zero, so it is clamped.
    fn std_dev(&self) -> f64 {
        let n = self.values.len();
        if n < 2 {
            return 0.0;
        }
        let mean = self.sum / n as f64;
        let variance = ((self.sum_sq - self.sum * mean) / (n as f64 - 1.0)).max(0.0);
        variance.sqrt()
    }
}

/// Compute one feature vector per reading, in chronological order.
/// Sorts defensively; callers are not trusted to pre-sort.
pub fn engineer_features(readings: &[Reading]) -> Vec<FeatureVector> {
    let mut sorted: Vec<&Reading> = readings.iter().collect();
    sorted.sort_by_key(|r| r.timestamp);

    let mut rolling = RollingStats::new();
    let mut prev_value: Option<f64> = None;
    let mut features = Vec::with_capacity(sorted.len());

    for reading in sorted {
        rolling.push(reading.value);

        let value_delta = match prev_value {
            Some(prev) => reading.value - prev,
            None => 0.0,
        };
        let value_pct_change = match prev_value {
            Some(prev) if prev != 0.0 => (reading.value - prev) / prev,
            _ => 0.0,
        };

        features.push(FeatureVector {
            sensor_id: reading.sensor_id.clone(),
            timestamp: reading.timestamp,
            raw_value: sanitize(reading.value),
            hour_of_day: reading.timestamp.hour(),
            day_of_week: reading.timestamp.weekday().num_days_from_monday(),
            rolling_mean_24: sanitize(rolling.mean()),
            rolling_std_24: sanitize(rolling.std_dev()),
            value_delta: sanitize(value_delta),
            value_pct_change: sanitize(value_pct_change),
        });

        prev_value = Some(reading.value);
    }

    features
}

fn sanitize(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn reading(hour_offset: i64, value: f64) -> Reading {
        Reading {
            sensor_id: "s1".to_string(),
            sensor_type: "temperature".to_string(),
            timestamp: Utc.with_ymd_and_hms(2026, 1, 5, 0, 0, 0).unwrap()
                + chrono::Duration::hours(hour_offset),
            value,
            unit: "C".to_string(),
            location: None,
        }
    }

    #[test]
    fn test_first_point_has_zero_delta_and_pct_change() {
        let features = engineer_features(&[reading(0, 42.0)]);
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].value_delta, 0.0);
        assert_eq!(features[0].value_pct_change, 0.0);
        assert_eq!(features[0].rolling_std_24, 0.0);
        assert_eq!(features[0].rolling_mean_24, 42.0);
    }

    #[test]
    fn test_pct_change_over_zero_predecessor_is_zero() {
        let features = engineer_features(&[reading(0, 0.0), reading(1, 5.0)]);
        assert_eq!(features[1].value_delta, 5.0);
        assert_eq!(features[1].value_pct_change, 0.0);
    }

    #[test]
    fn test_rolling_narrows_to_k_plus_one_points() {
        // 1.0, 2.0, 3.0: at index k the stats must cover exactly k+1 points.
        let readings: Vec<Reading> = (0..3).map(|i| reading(i, (i + 1) as f64)).collect();
        let features = engineer_features(&readings);

        assert_eq!(features[0].rolling_mean_24, 1.0);
        assert_eq!(features[1].rolling_mean_24, 1.5);
        assert_eq!(features[2].rolling_mean_24, 2.0);
        // Sample std of [1, 2] is sqrt(0.5), of [1, 2, 3] is 1.0.
        assert!((features[1].rolling_std_24 - 0.5_f64.sqrt()).abs() < 1e-12);
        assert!((features[2].rolling_std_24 - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_rolling_window_caps_at_24() {
        // 30 readings of ramp 0..30: the final mean must cover only the last 24.
        let readings: Vec<Reading> = (0..30).map(|i| reading(i, i as f64)).collect();
        let features = engineer_features(&readings);

        let expected: f64 = (6..30).sum::<i64>() as f64 / 24.0;
        assert!((features[29].rolling_mean_24 - expected).abs() < 1e-9);
    }

    #[test]
    fn test_unsorted_input_is_sorted_by_timestamp() {
        let features = engineer_features(&[reading(2, 3.0), reading(0, 1.0), reading(1, 2.0)]);
        assert_eq!(features[0].raw_value, 1.0);
        assert_eq!(features[1].raw_value, 2.0);
        assert_eq!(features[2].raw_value, 3.0);
        assert_eq!(features[1].value_delta, 1.0);
    }

    #[test]
    fn test_time_features() {
        // 2026-01-05 is a Monday.
        let features = engineer_features(&[reading(14, 1.0)]);
        assert_eq!(features[0].hour_of_day, 14);
        assert_eq!(features[0].day_of_week, 0);
    }

    #[test]
    fn test_determinism() {
        let readings: Vec<Reading> = (0..40).map(|i| reading(i, (i * 7 % 13) as f64)).collect();
        let a = engineer_features(&readings);
        let b = engineer_features(&readings);
        assert_eq!(a, b);
    }
}
