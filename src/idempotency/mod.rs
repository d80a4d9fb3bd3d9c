//! Check / lock / mark-processed primitives over a [`KeyValueCache`].
//!
//! ```text
//! execute_once(key, op)
//!   ├─ record present? ──────────────► Duplicate(cached response)
//!   ├─ lock:<key> set-if-absent
//!   │    └─ lost the race: wait, re-check once, else LockContention
//!   ├─ re-check record under the lock
//!   ├─ run op ─► store record (on success)
//!   └─ release lock (owner token must match)
//! ```
//!
//! [`KeyValueCache`]: crate::cache::KeyValueCache

mod error;
mod record;
mod store;

pub use error::{ExecuteOnceError, IdempotencyError};
pub use record::{CheckResult, IdempotencyRecord};
pub use store::{Executed, IdempotencyStore, LockToken};
