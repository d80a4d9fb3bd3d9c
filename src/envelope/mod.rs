//! The message envelope: a payload wrapped with delivery metadata.
//!
//! The envelope's JSON shape (camelCase fields) is the only wire contract
//! between producers and consumers.

mod builder;
mod envelope;
mod error;

pub use builder::EnvelopeBuilder;
pub use envelope::{Envelope, EnvelopeMetadata, DEFAULT_VERSION};
pub use error::EnvelopeError;
