//! Queue maintenance tasks run by the scheduler.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use chorus_observability::metrics;

use crate::scheduler::{TaskError, TaskOutcome, TickTask};

use super::store::JobStore;
use super::types::ReapReport;

/// Returns PROCESSING rows whose lock is older than `stale_after` to the queue.
pub struct StaleJobReaper {
    store: Arc<dyn JobStore>,
    stale_after: Duration,
    max_attempts: u32,
}

impl StaleJobReaper {
    pub fn new(store: Arc<dyn JobStore>, stale_after: Duration, max_attempts: u32) -> Self {
        Self {
            store,
            stale_after,
            max_attempts,
        }
    }

    pub async fn reap_at(&self, now: DateTime<Utc>) -> Result<ReapReport, TaskError> {
        let stale_after = chrono::Duration::from_std(self.stale_after)
            .map_err(|e| TaskError::Other(format!("stale lock age out of range: {e}")))?;
        let report = self
            .store
            .reap_stale(now - stale_after, self.max_attempts, now)
            .await?;

        if report.requeued + report.failed > 0 {
            warn!(
                requeued = report.requeued,
                failed = report.failed,
                "reclaimed stale jobs"
            );
            metrics::jobs_reclaimed(report.requeued, report.failed);
        }
        Ok(report)
    }
}

#[async_trait]
impl TickTask for StaleJobReaper {
    fn name(&self) -> &'static str {
        "stale_job_reaper"
    }

    async fn run_once(&self) -> Result<TaskOutcome, TaskError> {
        let report = self.reap_at(Utc::now()).await?;
        Ok(if report == ReapReport::default() {
            TaskOutcome::Idle
        } else {
            TaskOutcome::Progressed
        })
    }
}

/// Emits the queue depth signal at most once per interval.
pub struct QueueDepthReporter {
    store: Arc<dyn JobStore>,
    interval: Duration,
    last_report: Mutex<Option<DateTime<Utc>>>,
}

impl QueueDepthReporter {
    pub fn new(store: Arc<dyn JobStore>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            last_report: Mutex::new(None),
        }
    }

    /// Report if the interval has elapsed; returns whether a snapshot was emitted.
    pub async fn report_at(&self, now: DateTime<Utc>) -> Result<bool, TaskError> {
        let due = {
            let last = self.last_report.lock().unwrap();
            match *last {
                None => true,
                Some(at) => (now - at).to_std().unwrap_or_default() >= self.interval,
            }
        };
        if !due {
            return Ok(false);
        }

        let depths = self.store.depth().await?;
        for (job_type, depth) in &depths {
            metrics::queue_depth(
                job_type.as_str(),
                depth.pending,
                depth.processing,
                depth.retrying,
                depth.failed,
            );
        }
        debug!(types = depths.len(), "queue depth reported");

        *self.last_report.lock().unwrap() = Some(now);
        Ok(true)
    }
}

#[async_trait]
impl TickTask for QueueDepthReporter {
    fn name(&self) -> &'static str {
        "queue_depth_reporter"
    }

    async fn run_once(&self) -> Result<TaskOutcome, TaskError> {
        Ok(if self.report_at(Utc::now()).await? {
            TaskOutcome::Progressed
        } else {
            TaskOutcome::Idle
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{InMemoryJobStore, JobStatus, JobType, NewJob};
    use uuid::Uuid;

    #[tokio::test]
    async fn reaper_requeues_only_stale_locks() {
        let store = InMemoryJobStore::arc();
        let t0 = Utc::now();
        for _ in 0..2 {
            store
                .enqueue(NewJob::new(JobType::GenerateReply, Uuid::now_v7()), t0)
                .await
                .unwrap();
        }
        let old = store.claim(&JobType::ALL, t0).await.unwrap().unwrap();
        let fresh = store
            .claim(&JobType::ALL, t0 + chrono::Duration::seconds(50))
            .await
            .unwrap()
            .unwrap();

        let reaper = StaleJobReaper::new(store.clone(), Duration::from_secs(60), 5);
        let report = reaper
            .reap_at(t0 + chrono::Duration::seconds(61))
            .await
            .unwrap();

        assert_eq!(report, ReapReport { requeued: 1, failed: 0 });
        assert_eq!(
            store.get(old.id()).await.unwrap().unwrap().status,
            JobStatus::Pending
        );
        assert_eq!(
            store.get(fresh.id()).await.unwrap().unwrap().status,
            JobStatus::Processing
        );
    }

    #[tokio::test]
    async fn depth_reporter_respects_its_interval() {
        let store = InMemoryJobStore::arc();
        let reporter = QueueDepthReporter::new(store, Duration::from_secs(60));
        let t0 = Utc::now();

        assert!(reporter.report_at(t0).await.unwrap());
        assert!(!reporter.report_at(t0 + chrono::Duration::seconds(30)).await.unwrap());
        assert!(reporter.report_at(t0 + chrono::Duration::seconds(60)).await.unwrap());
    }
}
