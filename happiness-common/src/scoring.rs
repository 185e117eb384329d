use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::record::{FeatureVector, FEATURE_COLUMNS};

#[derive(Error, Debug)]
pub enum ScoringError {
    #[error("failed to read model file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("failed to parse model: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("model has no coefficient for feature {0}")]
    MissingCoefficient(&'static str),
    #[error("model has a coefficient for unknown feature {0}")]
    UnknownFeature(String),
    #[error("model parameter {0} is not a finite number")]
    NonFiniteParameter(String),
    #[error("model returned {returned} predictions for {expected} rows")]
    PredictionCountMismatch { expected: usize, returned: usize },
}

/// A predictive model over the six happiness features.
///
/// Implementations must be pure: the same rows always yield the same
/// predictions. The model is built once at startup and shared read-only.
pub trait Scorer: Send + Sync {
    /// Predict one score per row. Every row holds the features in the order of
    /// [`FEATURE_COLUMNS`].
    fn predict(&self, rows: &[FeatureVector]) -> Vec<f64>;

    /// Score a single row.
    fn score(&self, features: &FeatureVector) -> Result<f64, ScoringError> {
        let predictions = self.predict(std::slice::from_ref(features));

        match predictions.as_slice() {
            [prediction] => Ok(*prediction),
            _ => Err(ScoringError::PredictionCountMismatch {
                expected: 1,
                returned: predictions.len(),
            }),
        }
    }
}

/// A linear regression exported as JSON:
///
/// ```json
/// {"intercept": 2.1, "coefficients": {"GDP_per_capita": 1.1, "life_expectancy": 0.9, ...}}
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct LinearModel {
    intercept: f64,
    coefficients: [f64; 6],
}

#[derive(Deserialize)]
struct LinearModelFile {
    intercept: f64,
    coefficients: HashMap<String, f64>,
}

impl LinearModel {
    pub fn new(intercept: f64, coefficients: [f64; 6]) -> Result<Self, ScoringError> {
        if !intercept.is_finite() {
            return Err(ScoringError::NonFiniteParameter("intercept".to_owned()));
        }
        if let Some((name, _)) = FEATURE_COLUMNS
            .iter()
            .zip(coefficients.iter())
            .find(|(_, coefficient)| !coefficient.is_finite())
        {
            return Err(ScoringError::NonFiniteParameter((*name).to_owned()));
        }

        Ok(Self {
            intercept,
            coefficients,
        })
    }

    pub fn from_json(json: &str) -> Result<Self, ScoringError> {
        let file: LinearModelFile = serde_json::from_str(json)?;

        if let Some(unknown) = file
            .coefficients
            .keys()
            .find(|name| !FEATURE_COLUMNS.contains(&name.as_str()))
        {
            return Err(ScoringError::UnknownFeature(unknown.to_owned()));
        }

        let mut coefficients = [0.0; 6];
        for (slot, feature) in coefficients.iter_mut().zip(FEATURE_COLUMNS) {
            *slot = *file
                .coefficients
                .get(feature)
                .ok_or(ScoringError::MissingCoefficient(feature))?;
        }

        LinearModel::new(file.intercept, coefficients)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ScoringError> {
        let json = std::fs::read_to_string(path)?;
        LinearModel::from_json(&json)
    }
}

impl Scorer for LinearModel {
    fn predict(&self, rows: &[FeatureVector]) -> Vec<f64> {
        rows.iter()
            .map(|row| {
                row.values()
                    .iter()
                    .zip(self.coefficients.iter())
                    .fold(self.intercept, |acc, (value, coefficient)| {
                        acc + value * coefficient
                    })
            })
            .collect()
    }
}
