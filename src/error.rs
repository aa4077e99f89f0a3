//! Error taxonomy for the delivery pipeline
//!
//! Classification operates on codes, not source types: anything that reaches
//! the retry loop has already been folded into a [`WorkerError`] variant.

use thiserror::Error;

/// Unified error for message handling, classified for the retry policy.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Payload failed validation (bad JSON, bad address, bad URL) or was
    /// rejected by the rate limiter. Never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The outbound provider call failed. Treated as transient unless the
    /// provider classified it permanent.
    #[error("email provider error: {0}")]
    Provider(String),

    /// Rendering or other unclassified internal failure. Retried, bounded by
    /// the retry budget.
    #[error("internal error: {0}")]
    Internal(String),

    /// Explicitly tagged transient failure.
    #[error("retryable error: {0}")]
    Retryable(String),

    /// Explicitly tagged permanent failure. Known poison: acknowledged
    /// without a dead-letter copy.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl WorkerError {
    /// Stable code used for metric labels and DLQ annotations.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::Provider(_) => "email_provider_error",
            Self::Internal(_) => "internal",
            Self::Retryable(_) => "retryable",
            Self::Permanent(_) => "permanent_failure",
        }
    }

    /// Whether the retry loop may attempt this operation again.
    ///
    /// Unclassified failures default to retryable: availability over
    /// strictness, bounded by `max_retries`.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::InvalidInput(_) | Self::Permanent(_) => false,
            Self::Provider(_) | Self::Internal(_) | Self::Retryable(_) => true,
        }
    }

    pub fn is_permanent(&self) -> bool {
        !self.is_retryable()
    }
}
