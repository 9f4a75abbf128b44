//! Error type shared by the estimator and the denoising engine.

use thiserror::Error;

/// Failures raised by noise estimation and NLM denoising.
///
/// All of them are raised synchronously before or during a run; none is
/// transient, so callers should not retry.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NlmError {
    /// The data handed in cannot be processed (too short, too small, non-finite).
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    /// A configuration value is out of its domain.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    /// Predicted working memory is above the configured limit.
    #[error("Estimated working memory of {required} bytes exceeds the limit of {limit} bytes")]
    MemoryLimitExceeded { required: usize, limit: usize },
    /// The cancel flag was raised while the run was in progress.
    #[error("Denoising was cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, NlmError>;
