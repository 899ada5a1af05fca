//! Background job queue with retry, backoff, and dead-letter handling.
//!
//! ## Components
//!
//! - `Job`: a unit of work with payload, priority and attempt budget
//! - `JobStore`: atomic persistence (in-memory or Postgres)
//! - `QueueManager`: producer/consumer/operator facade over a store
//! - `HandlerRegistry`: job type → handler mapping
//! - `Worker`: claim/execute/report loop with cooperative shutdown
//!
//! A job moves `pending → processing → completed | pending (retry) | failed`,
//! or `pending → cancelled`. `failed` jobs are the dead letters; an operator
//! can re-queue them with `QueueManager::retry_failed`.

pub mod manager;
pub mod postgres;
pub mod registry;
pub mod store;
pub mod types;
pub mod worker;

pub use manager::QueueManager;
pub use postgres::PostgresJobStore;
pub use registry::{HandlerError, HandlerRegistry, JobHandler};
pub use store::{InMemoryJobStore, JobStore, LEASE_EXPIRED_ERROR};
pub use types::{
    BackoffStrategy, ClaimFilter, EnqueueOptions, FailDisposition, FailureKind, Job,
    JobAttemptRecord, JobListFilter, JobStatus, NewJob, QueueStats, ReportOutcome, RetryBackoff,
    DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY, DEFAULT_QUEUE, MAX_PRIORITY, MIN_PRIORITY,
};
pub use worker::{Worker, WorkerConfig, WorkerState, WorkerSummary};
