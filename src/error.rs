use std::fmt;

use thiserror::Error;

use crate::breaker::BreakerError;
use crate::bus::BrokerError;
use crate::cache::CacheError;
use crate::config::ConfigError;
use crate::dlq::DlqError;
use crate::envelope::EnvelopeError;
use crate::idempotency::IdempotencyError;
use crate::outbox::{SideEffectError, StoreError};
use crate::outbox_worker::{DispatchError, JobError, SchedulerError};
use crate::processor::ProcessError;
use crate::publisher::PublishError;

/// How a failure should be handled, independent of where it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Unknown destination or missing setup. Fail fast.
    Configuration,
    /// Network or broker trouble; retry with backoff.
    TransientDelivery,
    /// Retrying the same input cannot succeed.
    PermanentDelivery,
    /// Malformed message body; let it reach the dead-letter queue.
    EnvelopeParse,
    /// Another caller holds the idempotency lock.
    LockContention,
    /// The breaker rejected the call without attempting it.
    CircuitOpen,
    /// Cache or store unavailable.
    Infrastructure,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::TransientDelivery | ErrorKind::Infrastructure)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::TransientDelivery => "transient_delivery",
            ErrorKind::PermanentDelivery => "permanent_delivery",
            ErrorKind::EnvelopeParse => "envelope_parse",
            ErrorKind::LockContention => "lock_contention",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Infrastructure => "infrastructure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Any error raised by this crate.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Breaker(#[from] BreakerError<BrokerError>),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    SideEffect(#[from] SideEffectError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Dlq(#[from] DlqError),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl DeliveryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeliveryError::Config(_) => ErrorKind::Configuration,
            DeliveryError::Cache(_) => ErrorKind::Infrastructure,
            DeliveryError::Idempotency(err) => idempotency_kind(err),
            DeliveryError::Envelope(err) => envelope_kind(err),
            DeliveryError::Broker(err) => broker_kind(err),
            DeliveryError::Breaker(err) => match err {
                BreakerError::Open { .. } => ErrorKind::CircuitOpen,
                BreakerError::Timeout { .. } => ErrorKind::TransientDelivery,
                BreakerError::Inner(err) => broker_kind(err),
            },
            DeliveryError::Publish(err) => publish_kind(err),
            DeliveryError::Store(err) => store_kind(err),
            DeliveryError::SideEffect(err) => match err {
                SideEffectError::MissingTenant => ErrorKind::Configuration,
                SideEffectError::Publish(err) => publish_kind(err),
                SideEffectError::Store(err) => store_kind(err),
            },
            DeliveryError::Dispatch(err) => match err {
                DispatchError::MissingDestination(_) => ErrorKind::Configuration,
                DispatchError::Publish(err) => publish_kind(err),
                DispatchError::Sink { source, .. } if source.permanent => ErrorKind::PermanentDelivery,
                DispatchError::Sink { .. } => ErrorKind::TransientDelivery,
            },
            DeliveryError::Job(JobError::Retryable(_)) => ErrorKind::TransientDelivery,
            DeliveryError::Job(JobError::Permanent(_)) => ErrorKind::PermanentDelivery,
            DeliveryError::Scheduler(_) => ErrorKind::Infrastructure,
            DeliveryError::Dlq(err) => match err {
                DlqError::UnknownDestination(_) => ErrorKind::Configuration,
                DlqError::Broker { source, .. } => broker_kind(source),
                DlqError::CircuitOpen(_) => ErrorKind::CircuitOpen,
                DlqError::Timeout { .. } => ErrorKind::TransientDelivery,
                DlqError::Tracking(err) => idempotency_kind(err),
                DlqError::EmptyMessage(_) => ErrorKind::EnvelopeParse,
            },
            DeliveryError::Process(err) => match err {
                ProcessError::EmptyBody(_) => ErrorKind::EnvelopeParse,
                ProcessError::Envelope(err) => envelope_kind(err),
                ProcessError::Handler(_) => ErrorKind::TransientDelivery,
                ProcessError::LockContention { .. } => ErrorKind::LockContention,
                ProcessError::Idempotency(err) => idempotency_kind(err),
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

fn idempotency_kind(err: &IdempotencyError) -> ErrorKind {
    match err {
        IdempotencyError::LockContention { .. } => ErrorKind::LockContention,
        IdempotencyError::Cache(_) | IdempotencyError::Encode { .. } => ErrorKind::Infrastructure,
    }
}

fn envelope_kind(err: &EnvelopeError) -> ErrorKind {
    match err {
        EnvelopeError::MissingTenant => ErrorKind::Configuration,
        EnvelopeError::MissingField(_) | EnvelopeError::Malformed(_) => ErrorKind::EnvelopeParse,
        EnvelopeError::Serialize(_) => ErrorKind::PermanentDelivery,
    }
}

fn broker_kind(err: &BrokerError) -> ErrorKind {
    match err {
        BrokerError::DestinationNotFound(_) => ErrorKind::Configuration,
        BrokerError::ConnectionFailed(_) | BrokerError::Poisoned(_) => ErrorKind::TransientDelivery,
        BrokerError::Rejected(_) | BrokerError::InvalidReceipt(_) => ErrorKind::PermanentDelivery,
    }
}

fn publish_kind(err: &PublishError) -> ErrorKind {
    match err {
        PublishError::UnknownDestination(_) => ErrorKind::Configuration,
        PublishError::Envelope(err) => envelope_kind(err),
        PublishError::CircuitOpen(_) => ErrorKind::CircuitOpen,
        PublishError::Timeout { .. } => ErrorKind::TransientDelivery,
        PublishError::Broker { source, .. } => broker_kind(source),
    }
}

fn store_kind(err: &StoreError) -> ErrorKind {
    match err {
        StoreError::LockPoisoned(_) | StoreError::Unavailable(_) => ErrorKind::Infrastructure,
        StoreError::Conflict { .. } => ErrorKind::TransientDelivery,
        StoreError::NotFound(_) | StoreError::Duplicate(_) | StoreError::Transition(_) => {
            ErrorKind::PermanentDelivery
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox_worker::SinkError;
    use crate::outbox::SideEffectType;

    #[test]
    fn taxonomy() {
        let unknown: DeliveryError = PublishError::UnknownDestination("orders".into()).into();
        assert_eq!(unknown.kind(), ErrorKind::Configuration);
        assert!(!unknown.is_retryable());

        let open: DeliveryError = PublishError::CircuitOpen("orders".into()).into();
        assert_eq!(open.kind(), ErrorKind::CircuitOpen);

        let down: DeliveryError = BrokerError::ConnectionFailed("orders".into()).into();
        assert_eq!(down.kind(), ErrorKind::TransientDelivery);
        assert!(down.is_retryable());

        let parse: DeliveryError = ProcessError::Envelope(EnvelopeError::Malformed("eof".into())).into();
        assert_eq!(parse.kind(), ErrorKind::EnvelopeParse);

        let contention: DeliveryError = IdempotencyError::LockContention { key: "k".into() }.into();
        assert_eq!(contention.kind(), ErrorKind::LockContention);

        let cache: DeliveryError = CacheError::Unavailable("redis".into()).into();
        assert_eq!(cache.kind(), ErrorKind::Infrastructure);
        assert!(cache.is_retryable());

        let sink: DeliveryError = DispatchError::Sink {
            effect: SideEffectType::Email,
            source: SinkError::transient("smtp timeout"),
        }
        .into();
        assert_eq!(sink.kind(), ErrorKind::TransientDelivery);
    }
}
