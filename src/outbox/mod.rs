//! Transactional outbox: side effects persisted with the business change.
//!
//! ```text
//!              claim (CAS)            dispatch ok
//!  pending ─────────────────▶ processing ─────────▶ completed
//!     ▲                          │
//!     │   retry_count < max      │ dispatch failed / sweep timeout
//!     └──────────────────────────┤
//!                                │ retry_count >= max, or permanent error
//!                                ▼
//!                              failed
//! ```
//!
//! Rows are staged in a [`UnitOfWork`] next to the business rows they belong
//! to, and both are written in one store commit. The
//! worker in `outbox_worker` owns every transition after creation.

mod in_memory;
mod record;
mod service;
mod store;
mod unit_of_work;

pub use in_memory::InMemoryOutboxStore;
pub use record::{
    SideEffectMetadata, SideEffectRecord, SideEffectStatus, SideEffectType, TransitionError,
    DEFAULT_MAX_RETRIES,
};
pub use service::{SideEffectError, SideEffectOptions, SideEffectOutcome, SideEffectService};
pub use store::{EntityWrite, OutboxStore, StoreError, WriteMode};
pub use unit_of_work::UnitOfWork;
