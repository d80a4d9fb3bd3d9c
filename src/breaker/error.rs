use std::time::Duration;

use thiserror::Error;

/// Failure of a call made through a circuit breaker.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The circuit is open (or a half-open trial is already running); the
    /// wrapped call was not attempted.
    #[error("circuit for `{key}` is open; call rejected")]
    Open { key: String },
    /// The wrapped call did not finish within the breaker timeout.
    #[error("call through circuit `{key}` timed out after {timeout:?}")]
    Timeout { key: String, timeout: Duration },
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    pub fn map_inner<F>(self, f: impl FnOnce(E) -> F) -> BreakerError<F> {
        match self {
            BreakerError::Open { key } => BreakerError::Open { key },
            BreakerError::Timeout { key, timeout } => BreakerError::Timeout { key, timeout },
            BreakerError::Inner(err) => BreakerError::Inner(f(err)),
        }
    }
}
