//! Durable job queue with collision-free claiming.
//!
//! ## Design
//!
//! - At-least-once delivery; executors make their side effects idempotent
//! - One active job per `(job_type, subject_ref, actor_ref)`
//! - A claim is an attempt; the retry policy decides what a failure costs
//! - Finalisation is fenced on the claim's lock token
//! - A reaper returns abandoned PROCESSING rows to the queue
//!
//! ## Components
//!
//! - `JobStore`: persistence (in-memory for tests/dev, Postgres in production)
//! - `RetryPolicy`: pure backoff/ceiling decision
//! - `JobDispatcher`: claims one job per drain and runs its executor
//! - `StaleJobReaper`, `QueueDepthReporter`: maintenance tick tasks

pub mod dispatcher;
pub mod maintenance;
pub mod policy;
pub mod postgres;
pub mod store;
pub mod types;

pub use dispatcher::{Disposition, JobDispatcher, Processed};
pub use maintenance::{QueueDepthReporter, StaleJobReaper};
pub use policy::{RetryPolicy, Schedule};
pub use postgres::PgJobStore;
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{
    ClaimedJob, EnqueueOutcome, Job, JobId, JobStatus, JobType, NewJob, Outcome, QueueDepth,
    ReapReport,
};
