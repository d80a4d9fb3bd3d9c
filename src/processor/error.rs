use thiserror::Error;

use crate::envelope::EnvelopeError;
use crate::idempotency::IdempotencyError;

/// A handler's own failure. The message stays on the queue for redelivery.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("message {0} has no body")]
    EmptyBody(String),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error("handler failed: {0}")]
    Handler(#[source] HandlerError),
    /// Another consumer is processing the same key.
    #[error("lock contention on `{key}`")]
    LockContention { key: String },
    #[error(transparent)]
    Idempotency(IdempotencyError),
}
