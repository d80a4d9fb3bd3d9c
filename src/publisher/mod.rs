//! Queue/topic publisher.
//!
//! Resolves logical destination names, wraps payloads in envelopes, derives
//! the provider deduplication and ordering tokens, and sends through the
//! circuit breaker gateway.

mod destinations;
mod error;
mod options;
mod publisher;

pub use destinations::{Destination, DestinationKind, DestinationRegistry};
pub use error::PublishError;
pub use options::{BatchFailure, BatchItem, BatchResult, BatchSent, SendOptions};
pub use publisher::Publisher;
