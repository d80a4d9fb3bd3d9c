//! Consumer side: parse incoming envelopes and run handlers at most once.
//!
//! ```text
//! receive ─▶ MessageProcessor::process ─▶ IdempotencyStore::execute_once ─▶ handler
//!               │ empty / malformed body         │ duplicate
//!               ▼                                ▼
//!         error (redelivery, DLQ)         stored response, no call
//! ```

mod consumer;
mod error;
#[allow(clippy::module_inception)]
mod processor;
mod registry;

pub use consumer::{ConsumeReport, QueueConsumer};
pub use error::{HandlerError, ProcessError};
pub use processor::{MessageHandler, MessageProcessor, ProcessOptions};
pub use registry::{DispatchReport, EventHandler, HandlerRegistry};
