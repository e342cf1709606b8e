//! Infrastructure layer: job queue, stores, executors and the control loop.
//!
//! Every store has an in-memory implementation (tests/dev) and a Postgres
//! one. Only the job store and the quota ledger are shared mutable state
//! between worker processes; they coordinate through row locks alone.

pub mod config;
pub mod content;
pub mod digest;
pub mod error;
pub mod executors;
pub mod health;
pub mod jobs;
pub mod notify;
pub mod quota;
pub mod scheduler;
pub mod schema;

pub use error::StoreError;

#[cfg(test)]
mod integration_tests;
