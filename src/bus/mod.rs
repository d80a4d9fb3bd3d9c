//! Broker abstraction: queues and topics with provider-assigned message ids.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │        Publisher / DlqConsumer / QueueConsumer               │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   BrokerClient trait                         │
//! │  send / send_batch / receive / delete / approximate_count    │
//! └─────────────────────────────────────────────────────────────┘
//!          │                  │                     │
//!          ▼                  ▼                     ▼
//! ┌──────────────┐    ┌─────────────┐    ┌─────────────────────┐
//! │InMemoryBroker│    │ SQS adapter │    │ other broker adapter│
//! │  (included)  │    │ (external)  │    │     (external)      │
//! └──────────────┘    └─────────────┘    └─────────────────────┘
//! ```
//!
//! A destination is addressed by its provider address. Sending to a topic
//! address fans out to every queue subscribed to it.

mod broker;
mod error;
mod in_memory_broker;

pub use broker::{
    BatchEntryFailure, BatchEntrySuccess, BatchSendOutcome, BrokerClient, OutgoingMessage,
    ReceivedMessage, MAX_BATCH_SIZE,
};
pub use error::BrokerError;
pub use in_memory_broker::{InMemoryBroker, QueueSettings, RedrivePolicy, DEFAULT_DEDUP_WINDOW};
