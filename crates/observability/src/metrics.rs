//! Operational signals.
//!
//! Each signal is one structured `tracing` event on the [`SIGNAL_TARGET`]
//! target with a `signal` field naming it. The metrics collector (log
//! shipper or a `tracing` layer) turns them into counters and gauges; this
//! crate does not own an exporter.

use std::time::Duration;

/// `tracing` target shared by every signal.
pub const SIGNAL_TARGET: &str = "chorus::signals";

/// A job reached the end of one execution attempt.
///
/// `status` is the stored status afterwards (`done`, `failed`, `pending`).
pub fn job_processed(job_type: &str, status: &str, duration: Duration) {
    ::tracing::info!(
        target: SIGNAL_TARGET,
        signal = "job_processed",
        job_type,
        status,
        duration_ms = duration.as_millis() as u64,
    );
}

/// A transient failure was rescheduled.
pub fn retry_scheduled(job_type: &str, attempt: u32, delay: Duration) {
    ::tracing::info!(
        target: SIGNAL_TARGET,
        signal = "retry_scheduled",
        job_type,
        attempt,
        delay_ms = delay.as_millis() as u64,
    );
}

/// Point-in-time queue depth for one job type.
///
/// `retrying` is the subset of `pending` that has failed at least once.
pub fn queue_depth(job_type: &str, pending: u64, processing: u64, retrying: u64, failed: u64) {
    ::tracing::info!(
        target: SIGNAL_TARGET,
        signal = "queue_depth",
        job_type,
        pending,
        processing,
        retrying,
        failed,
    );
}

/// Stale PROCESSING rows returned to the queue (or failed) by the reaper.
pub fn jobs_reclaimed(requeued: u64, failed: u64) {
    ::tracing::info!(
        target: SIGNAL_TARGET,
        signal = "jobs_reclaimed",
        requeued,
        failed,
    );
}

/// A digest row was written.
pub fn digest_refreshed(kind: &str, source: &str, duration: Duration) {
    ::tracing::info!(
        target: SIGNAL_TARGET,
        signal = "digest_refreshed",
        kind,
        source,
        duration_ms = duration.as_millis() as u64,
    );
}
