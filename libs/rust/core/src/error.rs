//! Error taxonomy shared by every coordinator component.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FlError {
    /// Caller error (bad epsilon, sensitivity, rate, weight...). Never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A round aborted before commit; global model and ledger are untouched.
    #[error("round {round} failed: {reason}")]
    RoundFailed { round: u64, reason: String },
    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),
    #[error("node not found: {0}")]
    NotFound(String),
}

impl FlError {
    pub fn invalid(msg: impl Into<String>) -> Self { Self::InvalidArgument(msg.into()) }

    /// Short machine-readable kind, used at the HTTP boundary.
    pub fn kind(&self) -> &'static str {
        match self {
            FlError::InvalidArgument(_) => "invalid_argument",
            FlError::RoundFailed { .. } => "round_failed",
            FlError::PersistenceUnavailable(_) => "persistence_unavailable",
            FlError::NotFound(_) => "not_found",
        }
    }
}

pub type FlResult<T> = Result<T, FlError>;
