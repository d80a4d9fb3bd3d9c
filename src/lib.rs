pub mod breaker;
pub mod bus;
pub mod cache;
pub mod config;
pub mod context;
pub mod dlq;
pub mod envelope;
mod error;
pub mod idempotency;
pub mod metrics;
pub mod outbox;
pub mod outbox_worker;
pub mod processor;
pub mod publisher;
pub mod telemetry;

pub use breaker::{BreakerError, CircuitBreakerGateway, CircuitState};
pub use bus::{BrokerClient, BrokerError, InMemoryBroker, OutgoingMessage, ReceivedMessage};
pub use cache::{CacheError, InMemoryCache, KeyValueCache};
pub use config::{ConfigError, DeliveryConfig};
pub use context::RequestContext;
pub use dlq::{DlqConsumer, DlqError, ReplayReport};
pub use envelope::{Envelope, EnvelopeBuilder, EnvelopeError};
pub use error::{DeliveryError, ErrorKind};
pub use idempotency::{Executed, IdempotencyError, IdempotencyStore};
pub use metrics::DeliveryMetrics;
pub use outbox::{
    EntityWrite, InMemoryOutboxStore, OutboxStore, SideEffectOptions, SideEffectOutcome, SideEffectRecord,
    SideEffectService, SideEffectStatus, SideEffectType, StoreError, UnitOfWork,
};
pub use outbox_worker::{InMemoryJobScheduler, JobScheduler, OutboxSweeper, OutboxWorker};
pub use processor::{MessageHandler, MessageProcessor, ProcessError, ProcessOptions, QueueConsumer};
pub use publisher::{DestinationRegistry, PublishError, Publisher, SendOptions};
