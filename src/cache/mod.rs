//! Key-value cache abstraction with TTLs.
//!
//! The idempotency store and the DLQ replay tracker are written against
//! [`KeyValueCache`]; [`InMemoryCache`] backs tests and single-process
//! deployments.

mod error;
mod in_memory;
mod kv;

pub use error::CacheError;
pub use in_memory::InMemoryCache;
pub use kv::KeyValueCache;
