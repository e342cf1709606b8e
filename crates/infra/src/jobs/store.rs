//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;

use super::types::{
    truncate_error, ClaimedJob, EnqueueOutcome, Job, JobId, JobStatus, JobType, NewJob,
    QueueDepth, ReapReport,
};

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// The row is no longer PROCESSING under this worker's lock, usually
    /// because the reaper reclaimed it.
    #[error("job {0} is no longer owned by this worker")]
    LostOwnership(JobId),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// Durable job queue.
///
/// Every transition takes the caller's `now` so tests control time.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Insert a PENDING job, unless an active job with the same
    /// `(job_type, subject_ref, actor_ref)` already exists.
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>)
        -> Result<EnqueueOutcome, JobStoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Atomically claim the oldest runnable job of the given types.
    ///
    /// Oldest means smallest `available_at`, then smallest `created_at`. The
    /// claim increments `attempts` and sets `locked_at = now`. Concurrent
    /// callers never receive the same job.
    async fn claim(
        &self,
        types: &[JobType],
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedJob>, JobStoreError>;

    /// PROCESSING -> DONE.
    async fn complete(&self, job: &ClaimedJob, now: DateTime<Utc>) -> Result<(), JobStoreError>;

    /// PROCESSING -> PENDING with a new `available_at`.
    async fn reschedule(
        &self,
        job: &ClaimedJob,
        available_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError>;

    /// PROCESSING -> FAILED.
    async fn fail(
        &self,
        job: &ClaimedJob,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError>;

    /// PROCESSING -> PENDING, runnable at `now`, without spending an attempt.
    ///
    /// Used when execution hit an infrastructural failure that says nothing
    /// about the job itself.
    async fn release(
        &self,
        job: &ClaimedJob,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError>;

    /// Reclaim PROCESSING rows locked before `locked_before`.
    ///
    /// Rows that still have attempts left go back to PENDING (runnable now);
    /// the rest become FAILED.
    async fn reap_stale(
        &self,
        locked_before: DateTime<Utc>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<ReapReport, JobStoreError>;

    /// Per-type counts, for every type that has rows.
    async fn depth(&self) -> Result<Vec<(JobType, QueueDepth)>, JobStoreError>;
}

pub(crate) const RECLAIMED_ERROR: &str = "reclaimed after stale lock";

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// All rows, oldest first.
    pub fn snapshot(&self) -> Vec<Job> {
        let jobs = self.jobs.lock().unwrap();
        let mut all: Vec<_> = jobs.values().cloned().collect();
        all.sort_by_key(|j| (j.created_at, j.id.0));
        all
    }

    /// Rows of one type, oldest first.
    pub fn jobs_of(&self, job_type: JobType) -> Vec<Job> {
        self.snapshot()
            .into_iter()
            .filter(|j| j.job_type == job_type)
            .collect()
    }

    fn finalise<F>(&self, claimed: &ClaimedJob, apply: F) -> Result<(), JobStoreError>
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get_mut(&claimed.id())
            .ok_or(JobStoreError::NotFound(claimed.id()))?;
        if job.status != JobStatus::Processing || job.locked_at != Some(claimed.token) {
            return Err(JobStoreError::LostOwnership(claimed.id()));
        }
        apply(job);
        Ok(())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(
        &self,
        job: NewJob,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, JobStoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = job.into_job(now);

        if let Some(existing) = jobs
            .values()
            .find(|j| j.status.is_active() && j.dedupe_key() == job.dedupe_key())
        {
            return Ok(EnqueueOutcome::AlreadyActive(existing.id));
        }
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Conflict(format!("job id {} already used", job.id)).into());
        }

        let id = job.id;
        jobs.insert(id, job);
        Ok(EnqueueOutcome::Enqueued(id))
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.jobs.lock().unwrap().get(&id).cloned())
    }

    async fn claim(
        &self,
        types: &[JobType],
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedJob>, JobStoreError> {
        let mut jobs = self.jobs.lock().unwrap();

        let next = jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Pending
                    && j.available_at <= now
                    && types.contains(&j.job_type)
            })
            .min_by_key(|j| (j.available_at, j.created_at, j.id.0))
            .map(|j| j.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };

        job.status = JobStatus::Processing;
        job.attempts += 1;
        job.locked_at = Some(now);
        job.updated_at = now;

        Ok(Some(ClaimedJob {
            job: job.clone(),
            token: now,
        }))
    }

    async fn complete(&self, job: &ClaimedJob, now: DateTime<Utc>) -> Result<(), JobStoreError> {
        self.finalise(job, |row| {
            row.status = JobStatus::Done;
            row.locked_at = None;
            row.updated_at = now;
        })
    }

    async fn reschedule(
        &self,
        job: &ClaimedJob,
        available_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        self.finalise(job, |row| {
            row.status = JobStatus::Pending;
            row.available_at = available_at;
            row.locked_at = None;
            row.last_error = Some(truncate_error(error));
            row.updated_at = now;
        })
    }

    async fn fail(
        &self,
        job: &ClaimedJob,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        self.finalise(job, |row| {
            row.status = JobStatus::Failed;
            row.locked_at = None;
            row.last_error = Some(truncate_error(error));
            row.updated_at = now;
        })
    }

    async fn release(
        &self,
        job: &ClaimedJob,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        self.finalise(job, |row| {
            row.status = JobStatus::Pending;
            row.attempts = row.attempts.saturating_sub(1);
            row.available_at = now;
            row.locked_at = None;
            row.last_error = Some(truncate_error(error));
            row.updated_at = now;
        })
    }

    async fn reap_stale(
        &self,
        locked_before: DateTime<Utc>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<ReapReport, JobStoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let mut report = ReapReport::default();

        for job in jobs.values_mut() {
            let stale = job.status == JobStatus::Processing
                && job.locked_at.is_some_and(|at| at < locked_before);
            if !stale {
                continue;
            }
            job.locked_at = None;
            job.last_error = Some(RECLAIMED_ERROR.to_string());
            job.updated_at = now;
            if job.attempts >= max_attempts {
                job.status = JobStatus::Failed;
                report.failed += 1;
            } else {
                job.status = JobStatus::Pending;
                job.available_at = now;
                report.requeued += 1;
            }
        }

        Ok(report)
    }

    async fn depth(&self) -> Result<Vec<(JobType, QueueDepth)>, JobStoreError> {
        let jobs = self.jobs.lock().unwrap();
        let mut by_type: HashMap<JobType, QueueDepth> = HashMap::new();

        for job in jobs.values() {
            let depth = by_type.entry(job.job_type).or_default();
            match job.status {
                JobStatus::Pending => {
                    depth.pending += 1;
                    if job.attempts > 0 {
                        depth.retrying += 1;
                    }
                }
                JobStatus::Processing => depth.processing += 1,
                JobStatus::Failed => depth.failed += 1,
                JobStatus::Done => {}
            }
        }

        let mut depths: Vec<_> = by_type.into_iter().collect();
        depths.sort_by_key(|(t, _)| *t);
        Ok(depths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::collections::HashSet;
    use uuid::Uuid;

    fn reply_job(post: Uuid, persona: Uuid) -> NewJob {
        NewJob::new(JobType::GenerateReply, post).with_actor(persona)
    }

    #[tokio::test]
    async fn enqueue_and_claim() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let id = store
            .enqueue(reply_job(Uuid::now_v7(), Uuid::now_v7()), now)
            .await
            .unwrap()
            .job_id();

        let claimed = store.claim(&JobType::ALL, now).await.unwrap().unwrap();
        assert_eq!(claimed.id(), id);
        assert_eq!(claimed.job.status, JobStatus::Processing);
        assert_eq!(claimed.job.attempts, 1);
        assert_eq!(claimed.job.locked_at, Some(now));

        assert!(store.claim(&JobType::ALL, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_active_job_is_suppressed() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let (post, persona) = (Uuid::now_v7(), Uuid::now_v7());

        let first = store.enqueue(reply_job(post, persona), now).await.unwrap();
        let second = store.enqueue(reply_job(post, persona), now).await.unwrap();
        assert_eq!(second, EnqueueOutcome::AlreadyActive(first.job_id()));

        // Once terminal, the key is free again.
        let claimed = store.claim(&JobType::ALL, now).await.unwrap().unwrap();
        store.complete(&claimed, now).await.unwrap();
        let third = store.enqueue(reply_job(post, persona), now).await.unwrap();
        assert!(matches!(third, EnqueueOutcome::Enqueued(id) if id != first.job_id()));
    }

    #[tokio::test]
    async fn future_jobs_are_not_claimable() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store
            .enqueue(
                NewJob::new(JobType::GenerateVerdict, Uuid::now_v7())
                    .available_at(now + Duration::seconds(30)),
                now,
            )
            .await
            .unwrap();

        assert!(store.claim(&JobType::ALL, now).await.unwrap().is_none());
        assert!(store
            .claim(&JobType::ALL, now + Duration::seconds(30))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn claim_orders_by_available_then_created() {
        let store = InMemoryJobStore::new();
        let t0 = Utc::now();

        let late = store
            .enqueue(
                NewJob::new(JobType::GenerateVerdict, Uuid::now_v7())
                    .available_at(t0 + Duration::seconds(5)),
                t0,
            )
            .await
            .unwrap()
            .job_id();
        let first = store
            .enqueue(NewJob::new(JobType::GenerateVerdict, Uuid::now_v7()), t0)
            .await
            .unwrap()
            .job_id();
        let second = store
            .enqueue(
                NewJob::new(JobType::GenerateVerdict, Uuid::now_v7()),
                t0 + Duration::milliseconds(1),
            )
            .await
            .unwrap()
            .job_id();

        let at = t0 + Duration::seconds(10);
        let order: Vec<_> = [
            store.claim(&JobType::ALL, at).await.unwrap().unwrap().id(),
            store.claim(&JobType::ALL, at).await.unwrap().unwrap().id(),
            store.claim(&JobType::ALL, at).await.unwrap().unwrap().id(),
        ]
        .into();
        assert_eq!(order, vec![first, second, late]);
    }

    #[tokio::test]
    async fn claim_filters_by_type() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store
            .enqueue(NewJob::new(JobType::FanOutReplies, Uuid::now_v7()), now)
            .await
            .unwrap();

        assert!(store
            .claim(&[JobType::GenerateVerdict], now)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .claim(&[JobType::FanOutReplies], now)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_never_share_a_job() {
        let store = InMemoryJobStore::arc();
        let now = Utc::now();
        for _ in 0..50 {
            store
                .enqueue(NewJob::new(JobType::GenerateVerdict, Uuid::now_v7()), now)
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                while let Some(claimed) = store.claim(&JobType::ALL, now).await.unwrap() {
                    mine.push(claimed.id());
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "job {id} claimed twice");
            }
        }
        assert_eq!(seen.len(), 50);
    }

    #[tokio::test]
    async fn finalisation_is_fenced_by_lock_token() {
        let store = InMemoryJobStore::new();
        let t0 = Utc::now();
        store
            .enqueue(NewJob::new(JobType::GenerateVerdict, Uuid::now_v7()), t0)
            .await
            .unwrap();

        let stale = store.claim(&JobType::ALL, t0).await.unwrap().unwrap();
        let report = store
            .reap_stale(t0 + Duration::seconds(61), 5, t0 + Duration::seconds(61))
            .await
            .unwrap();
        assert_eq!(report, ReapReport { requeued: 1, failed: 0 });

        let fresh = store
            .claim(&JobType::ALL, t0 + Duration::seconds(62))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fresh.job.attempts, 2);

        let err = store.complete(&stale, t0 + Duration::seconds(63)).await.unwrap_err();
        assert_eq!(err, JobStoreError::LostOwnership(stale.id()));
        store.complete(&fresh, t0 + Duration::seconds(63)).await.unwrap();
        assert_eq!(
            store.get(fresh.id()).await.unwrap().unwrap().status,
            JobStatus::Done
        );
    }

    #[tokio::test]
    async fn release_gives_the_attempt_back() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store
            .enqueue(NewJob::new(JobType::GenerateVerdict, Uuid::now_v7()), now)
            .await
            .unwrap();
        let claimed = store.claim(&JobType::ALL, now).await.unwrap().unwrap();

        store.release(&claimed, "pool timed out", now).await.unwrap();

        let row = store.get(claimed.id()).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Pending);
        assert_eq!(row.attempts, 0);
        assert_eq!(row.available_at, now);
    }

    #[tokio::test]
    async fn reaper_fails_jobs_at_the_ceiling() {
        let store = InMemoryJobStore::new();
        let t0 = Utc::now();
        store
            .enqueue(NewJob::new(JobType::GenerateVerdict, Uuid::now_v7()), t0)
            .await
            .unwrap();
        let claimed = store.claim(&JobType::ALL, t0).await.unwrap().unwrap();

        let report = store
            .reap_stale(t0 + Duration::seconds(1), 1, t0 + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(report, ReapReport { requeued: 0, failed: 1 });

        let row = store.get(claimed.id()).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert_eq!(row.last_error.as_deref(), Some(RECLAIMED_ERROR));
    }

    #[tokio::test]
    async fn reaper_leaves_fresh_locks_alone() {
        let store = InMemoryJobStore::new();
        let t0 = Utc::now();
        store
            .enqueue(NewJob::new(JobType::GenerateVerdict, Uuid::now_v7()), t0)
            .await
            .unwrap();
        store.claim(&JobType::ALL, t0).await.unwrap().unwrap();

        let report = store.reap_stale(t0, 5, t0).await.unwrap();
        assert_eq!(report, ReapReport::default());
    }

    #[tokio::test]
    async fn depth_counts_retrying_separately() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        for _ in 0..3 {
            store
                .enqueue(NewJob::new(JobType::GenerateVerdict, Uuid::now_v7()), now)
                .await
                .unwrap();
        }
        let claimed = store.claim(&JobType::ALL, now).await.unwrap().unwrap();
        store
            .reschedule(&claimed, now + Duration::seconds(30), "timeout", now)
            .await
            .unwrap();
        let claimed = store.claim(&JobType::ALL, now).await.unwrap().unwrap();
        store.fail(&claimed, "bad key", now).await.unwrap();

        let depth = store.depth().await.unwrap();
        assert_eq!(
            depth,
            vec![(
                JobType::GenerateVerdict,
                QueueDepth {
                    pending: 2,
                    processing: 0,
                    retrying: 1,
                    failed: 1,
                }
            )]
        );
    }
}
