// Error handling module
// Defines the error taxonomy shared by the pipeline components

use thiserror::Error;

/// Errors that can cross a component boundary
///
/// Transport failures never show up here: a worker turns them into a failed
/// result record instead.
#[derive(Error, Debug)]
pub enum LoadtestError {
    /// A tagged record that does not decode (codec bug, fatal to the decoder)
    #[error("Malformed result record: {0}")]
    MalformedRecord(String),

    /// Configuration rejected at startup
    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    /// A pending request could not be constructed
    #[error("Request construction failed: {0}")]
    RequestBuild(String),

    /// Deployment controller failure
    #[error("Deployment error: {0}")]
    Deployment(String),

    /// Log destination write failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, LoadtestError>;
