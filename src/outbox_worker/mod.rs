//! Outbox worker: drains side-effect rows and dispatches them.
//!
//! - `JobScheduler` / `JobHandler` - the job runtime seam (`InMemoryJobScheduler`
//!   ships here: bounded concurrency, rate limiting, exponential backoff)
//! - `OutboxWorker` - claims a row by id, dispatches it, records the outcome
//! - `SideEffectDispatcher` - routes by effect type to the publisher or to
//!   the email and audit sinks
//! - `OutboxSweeper` - rescues rows stuck in `processing` and re-enqueues
//!   orphaned `pending` rows
//!
//! ## Separation of Concerns
//!
//! The outbox has two phases:
//! 1. **Commit phase** (see `outbox` module) - rows written with the business change
//! 2. **Worker phase** (this module) - rows claimed, dispatched and settled
//!
//! ## Example
//!
//! ```ignore
//! let worker = Arc::new(OutboxWorker::new(store.clone(), dispatcher, metrics));
//! let scheduler = InMemoryJobScheduler::new(&config.worker, worker);
//! scheduler.enqueue(JobRequest::for_record(&record, &config.worker)).await?;
//! ```

mod dispatcher;
mod in_memory;
mod rate_limiter;
mod scheduler;
mod sweeper;
mod worker;

pub use dispatcher::{AuditSink, DispatchError, EmailSender, LogSink, SideEffectDispatcher, SinkError};
pub use in_memory::{InMemoryJobScheduler, SchedulerStats};
pub use rate_limiter::TokenBucket;
pub use scheduler::{
    BackoffPolicy, Job, JobError, JobHandler, JobOptions, JobRequest, JobScheduler, SchedulerError,
};
pub use sweeper::{OutboxSweeper, SweepReport};
pub use worker::{DrainResult, OutboxWorker, ProcessOutcome};
