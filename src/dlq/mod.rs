//! Dead-letter queues: inspection, replay and purge.
//!
//! Every registered queue pairs with a dead-letter queue whose address is
//! derived by convention (`orders` -> `orders-dlq`, `orders.fifo` ->
//! `orders-dlq.fifo`) unless `DlqConfig::overrides` names one.

mod consumer;
mod error;
mod mapping;

pub use consumer::{DeadLetter, DlqConsumer, DlqCount, ReplayReport};
pub use error::DlqError;
pub use mapping::{dead_letter_address, DeadLetterResolver};
