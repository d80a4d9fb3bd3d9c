//! Request context threaded explicitly through every call.
//!
//! Tenant, user and trace identifiers travel as a value instead of
//! thread-local state, so concurrent requests never observe each other's
//! context.

mod request;

pub use request::{RequestContext, SYSTEM_TENANT};
