//! Sequence assembly: feature vectors -> fixed-length normalized sequence.

use thiserror::Error;

use crate::features::{FeatureVector, NUM_FEATURES};
use crate::model::normalizer::Normalizer;

/// Fixed-length, time-ordered, normalized feature series fed to the
/// classifier. Length is always exactly the configured sequence length.
pub type Sequence = Vec<[f64; NUM_FEATURES]>;

#[derive(Debug, Error)]
pub enum SequenceError {
    #[error("insufficient history: need {needed} feature points, have {have}")]
    InsufficientHistory { needed: usize, have: usize },
}

/// Normalize the series and take exactly the trailing `n` vectors.
///
/// Fewer than `n` points is an `InsufficientHistory` condition, never a
/// padded sequence: callers treat it as "no verdict yet", not as a failure.
pub fn assemble(
    features: &[FeatureVector],
    normalizer: &Normalizer,
    n: usize,
) -> Result<Sequence, SequenceError> {
    if features.len() < n {
        return Err(SequenceError::InsufficientHistory {
            needed: n,
            have: features.len(),
        });
    }

    Ok(features[features.len() - n..]
        .iter()
        .map(|f| normalizer.transform(&f.to_array()))
        .collect())
}
