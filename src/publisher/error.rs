use std::time::Duration;

use thiserror::Error;

use crate::breaker::BreakerError;
use crate::bus::BrokerError;
use crate::envelope::EnvelopeError;

#[derive(Debug, Error)]
pub enum PublishError {
    /// The logical name is not configured. Never retried.
    #[error("unknown destination `{0}`")]
    UnknownDestination(String),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error("circuit open for `{0}`")]
    CircuitOpen(String),
    #[error("send to `{destination}` timed out after {timeout:?}")]
    Timeout {
        destination: String,
        timeout: Duration,
    },
    #[error("broker error for `{destination}`: {source}")]
    Broker {
        destination: String,
        #[source]
        source: BrokerError,
    },
}

impl PublishError {
    pub(crate) fn from_breaker(destination: &str, err: BreakerError<BrokerError>) -> Self {
        match err {
            BreakerError::Open { .. } => PublishError::CircuitOpen(destination.to_string()),
            BreakerError::Timeout { timeout, .. } => PublishError::Timeout {
                destination: destination.to_string(),
                timeout,
            },
            BreakerError::Inner(source) => PublishError::Broker {
                destination: destination.to_string(),
                source,
            },
        }
    }

    /// Short label used for the failure metric.
    pub fn reason(&self) -> &'static str {
        match self {
            PublishError::UnknownDestination(_) => "unknown_destination",
            PublishError::Envelope(_) => "envelope",
            PublishError::CircuitOpen(_) => "circuit_open",
            PublishError::Timeout { .. } => "timeout",
            PublishError::Broker { .. } => "broker",
        }
    }

    /// Misconfiguration or an unbuildable message; retrying cannot help.
    pub fn is_permanent(&self) -> bool {
        match self {
            PublishError::UnknownDestination(_) | PublishError::Envelope(_) => true,
            PublishError::Broker { source, .. } => matches!(
                source,
                BrokerError::DestinationNotFound(_) | BrokerError::Rejected(_)
            ),
            PublishError::CircuitOpen(_) | PublishError::Timeout { .. } => false,
        }
    }
}
