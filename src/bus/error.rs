use thiserror::Error;

/// Errors reported by a broker client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("destination does not exist: {0}")]
    DestinationNotFound(String),
    #[error("broker connection failed: {0}")]
    ConnectionFailed(String),
    /// The broker refused the message (missing group id, oversized body).
    #[error("message rejected: {0}")]
    Rejected(String),
    #[error("unknown or expired receipt handle: {0}")]
    InvalidReceipt(String),
    #[error("broker state poisoned: {0}")]
    Poisoned(String),
}

impl BrokerError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::ConnectionFailed(_) | BrokerError::Poisoned(_))
    }
}
