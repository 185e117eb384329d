use happiness_common::channel::ChannelError;
use thiserror::Error;

/// Enumeration of errors that stop the producer before it sends anything.
/// Failures of individual records are logged and counted instead.
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("failed to open source file {path}: {error}")]
    OpenSourceError {
        path: String,
        error: std::io::Error,
    },
    #[error("failed to read source rows: {0}")]
    ReadSourceError(#[from] csv::Error),
    #[error("source has no {0} column")]
    MissingColumn(&'static str),
    #[error("channel error: {0}")]
    ChannelError(#[from] ChannelError),
}
