use std::fmt;

use happiness_common::channel::ChannelError;
use happiness_common::record::{InvalidPrediction, RecordError};
use happiness_common::scoring::ScoringError;
use happiness_common::storage::StorageError;
use serde::Serialize;
use thiserror::Error;

/// Where in the pipeline a message stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Deserialize,
    Extract,
    Score,
    Persist,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Deserialize => "deserialize",
            Stage::Extract => "extract",
            Stage::Score => "score",
            Stage::Persist => "persist",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enumeration of errors that end the processing of a single message.
/// None of them stop the consumer.
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("malformed message: {0}")]
    Malformed(RecordError),
    #[error("feature extraction failed: {0}")]
    FeatureExtraction(RecordError),
    #[error("scoring failed: {0}")]
    Scoring(#[from] ScoringError),
    #[error(transparent)]
    InvalidPrediction(#[from] InvalidPrediction),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ProcessingError {
    pub fn stage(&self) -> Stage {
        match self {
            ProcessingError::Malformed(_) => Stage::Deserialize,
            ProcessingError::FeatureExtraction(_) => Stage::Extract,
            ProcessingError::Scoring(_) | ProcessingError::InvalidPrediction(_) => Stage::Score,
            ProcessingError::Storage(_) => Stage::Persist,
        }
    }
}

impl From<RecordError> for ProcessingError {
    fn from(error: RecordError) -> Self {
        if error.is_malformed() {
            ProcessingError::Malformed(error)
        } else {
            ProcessingError::FeatureExtraction(error)
        }
    }
}

/// Enumeration of errors that stop the consumer.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("channel error: {0}")]
    ChannelError(#[from] ChannelError),
    #[error("storage error: {0}")]
    StorageError(#[from] StorageError),
    #[error("failed to load scoring model: {0}")]
    ModelError(#[from] ScoringError),
}
