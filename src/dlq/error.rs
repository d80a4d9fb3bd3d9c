use std::time::Duration;

use thiserror::Error;

use crate::breaker::BreakerError;
use crate::bus::BrokerError;
use crate::idempotency::IdempotencyError;

#[derive(Debug, Error)]
pub enum DlqError {
    #[error("unknown destination: {0}")]
    UnknownDestination(String),
    #[error("dead-letter operation on `{address}` failed: {source}")]
    Broker {
        address: String,
        #[source]
        source: BrokerError,
    },
    /// The breaker for the main queue rejected the resend.
    #[error("circuit for `{0}` is open; replay not attempted")]
    CircuitOpen(String),
    #[error("replay to `{address}` timed out after {timeout:?}")]
    Timeout { address: String, timeout: Duration },
    #[error("replay tracking failed: {0}")]
    Tracking(#[from] IdempotencyError),
    #[error("dead-letter message {0} has no body")]
    EmptyMessage(String),
}

impl DlqError {
    pub(crate) fn broker(address: &str, source: BrokerError) -> Self {
        DlqError::Broker {
            address: address.to_string(),
            source,
        }
    }

    pub(crate) fn from_breaker(address: &str, err: BreakerError<BrokerError>) -> Self {
        match err {
            BreakerError::Open { .. } => DlqError::CircuitOpen(address.to_string()),
            BreakerError::Timeout { timeout, .. } => DlqError::Timeout {
                address: address.to_string(),
                timeout,
            },
            BreakerError::Inner(source) => DlqError::broker(address, source),
        }
    }
}
