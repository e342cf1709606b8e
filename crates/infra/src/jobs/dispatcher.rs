//! Queue drain: claim one job, run its executor, finalise through the policy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use chorus_core::FailureKind;
use chorus_observability::metrics;

use crate::executors::{ExecutionContext, TaskExecutor};
use crate::scheduler::{TaskError, TaskOutcome, TickTask};

use super::policy::{RetryPolicy, Schedule};
use super::store::{JobStore, JobStoreError};
use super::types::{ClaimedJob, JobId, JobStatus, JobType, Outcome};

/// What happened to the job a drain pass claimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Done,
    /// Back to PENDING until `at`.
    Retrying { at: DateTime<Utc> },
    Failed { reason: String },
    /// Infrastructural failure; returned to the queue without spending an attempt.
    Released { reason: String },
}

impl Disposition {
    /// Stored status after finalisation.
    pub fn status(&self) -> JobStatus {
        match self {
            Disposition::Done => JobStatus::Done,
            Disposition::Retrying { .. } | Disposition::Released { .. } => JobStatus::Pending,
            Disposition::Failed { .. } => JobStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Processed {
    pub job_id: JobId,
    pub job_type: JobType,
    pub attempt: u32,
    pub disposition: Disposition,
}

/// Routes claimed jobs to their executors.
///
/// The registered job types are this worker's capabilities: only those types
/// are claimed.
pub struct JobDispatcher {
    store: Arc<dyn JobStore>,
    executors: HashMap<JobType, Arc<dyn TaskExecutor>>,
    policy: RetryPolicy,
    execution_timeout: Duration,
}

impl JobDispatcher {
    pub fn new(store: Arc<dyn JobStore>, policy: RetryPolicy) -> Self {
        Self {
            store,
            executors: HashMap::new(),
            policy,
            execution_timeout: Duration::from_secs(12),
        }
    }

    /// Deadline for one execution; must leave room for finalisation inside
    /// the scheduler's task timeout.
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    /// Register the executor for its job type, replacing any previous one.
    pub fn register(&mut self, executor: Arc<dyn TaskExecutor>) {
        self.executors.insert(executor.job_type(), executor);
    }

    pub fn with_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.register(executor);
        self
    }

    pub fn capabilities(&self) -> Vec<JobType> {
        let mut types: Vec<_> = self.executors.keys().copied().collect();
        types.sort();
        types
    }

    /// Claim and process at most one job, using the wall clock.
    pub async fn drain_once(&self) -> Result<Option<Processed>, JobStoreError> {
        self.drain_at(Utc::now()).await
    }

    /// Claim and process at most one job as of `now`.
    ///
    /// `Err` means the store failed before or after execution; no job state
    /// was changed by this call beyond what the store reports.
    pub async fn drain_at(&self, now: DateTime<Utc>) -> Result<Option<Processed>, JobStoreError> {
        let capabilities = self.capabilities();
        if capabilities.is_empty() {
            return Ok(None);
        }

        let Some(claimed) = self.store.claim(&capabilities, now).await? else {
            return Ok(None);
        };
        debug!(
            job_id = %claimed.id(),
            job_type = %claimed.job.job_type,
            attempt = claimed.job.attempts,
            "claimed job"
        );

        let started = Instant::now();
        let outcome = self.execute(&claimed, now).await;
        let elapsed = started.elapsed();
        let finished_at = now + chrono::Duration::from_std(elapsed).unwrap_or_default();

        let disposition = self.finalise(&claimed, outcome, finished_at).await?;

        let job_type = claimed.job.job_type;
        if let Disposition::Retrying { at } = &disposition {
            let delay = (*at - finished_at).to_std().unwrap_or_default();
            metrics::retry_scheduled(job_type.as_str(), claimed.job.attempts, delay);
        }
        metrics::job_processed(job_type.as_str(), disposition.status().as_str(), elapsed);

        Ok(Some(Processed {
            job_id: claimed.id(),
            job_type,
            attempt: claimed.job.attempts,
            disposition,
        }))
    }

    async fn execute(&self, claimed: &ClaimedJob, now: DateTime<Utc>) -> Execution {
        let job = &claimed.job;
        let Some(executor) = self.executors.get(&job.job_type) else {
            return Execution::Finished(Outcome::permanent(format!(
                "no executor registered for {}",
                job.job_type
            )));
        };

        let ctx = ExecutionContext::new(now, self.execution_timeout);
        match tokio::time::timeout(self.execution_timeout, executor.execute(job, &ctx)).await {
            Ok(Ok(outcome)) => Execution::Finished(outcome),
            Ok(Err(e)) if e.is_transient() => Execution::Infrastructural(e.to_string()),
            Ok(Err(e)) => Execution::Finished(Outcome::retry(e.to_string())),
            Err(_) => Execution::Finished(Outcome::retry(format!(
                "execution timed out after {:?}",
                self.execution_timeout
            ))),
        }
    }

    async fn finalise(
        &self,
        claimed: &ClaimedJob,
        execution: Execution,
        now: DateTime<Utc>,
    ) -> Result<Disposition, JobStoreError> {
        let job = &claimed.job;

        let outcome = match execution {
            Execution::Infrastructural(reason) => {
                error!(job_id = %job.id, error = %reason, "store failure during execution");
                self.store.release(claimed, &reason, now).await?;
                return Ok(Disposition::Released { reason });
            }
            Execution::Finished(outcome) => outcome,
        };

        match outcome {
            Outcome::Done => {
                self.store.complete(claimed, now).await?;
                info!(job_id = %job.id, job_type = %job.job_type, "job done");
                Ok(Disposition::Done)
            }
            Outcome::Permanent(reason) => {
                self.store.fail(claimed, &reason, now).await?;
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    error = %reason,
                    "job failed permanently"
                );
                Ok(Disposition::Failed { reason })
            }
            Outcome::Retry {
                reason,
                retry_after,
            } => match self
                .policy
                .next_schedule(job.attempts, FailureKind::Transient, now)
            {
                Schedule::Fail => {
                    let reason = format!("{reason} (gave up after {} attempts)", job.attempts);
                    self.store.fail(claimed, &reason, now).await?;
                    warn!(
                        job_id = %job.id,
                        job_type = %job.job_type,
                        error = %reason,
                        "job exhausted its attempts"
                    );
                    Ok(Disposition::Failed { reason })
                }
                Schedule::Retry(at) => {
                    let hinted = retry_after
                        .and_then(|d| chrono::Duration::from_std(d).ok())
                        .map(|d| now + d);
                    let at = hinted.map_or(at, |h| h.max(at));
                    self.store.reschedule(claimed, at, &reason, now).await?;
                    warn!(
                        job_id = %job.id,
                        job_type = %job.job_type,
                        attempt = job.attempts,
                        retry_at = %at,
                        error = %reason,
                        "job will be retried"
                    );
                    Ok(Disposition::Retrying { at })
                }
            },
        }
    }
}

enum Execution {
    Finished(Outcome),
    Infrastructural(String),
}

#[async_trait]
impl TickTask for JobDispatcher {
    fn name(&self) -> &'static str {
        "queue_drain"
    }

    async fn run_once(&self) -> Result<TaskOutcome, TaskError> {
        match self.drain_once().await {
            Ok(Some(_)) => Ok(TaskOutcome::Progressed),
            Ok(None) => Ok(TaskOutcome::Idle),
            Err(JobStoreError::LostOwnership(id)) => {
                // The reaper handed the job to someone else; their result wins.
                warn!(job_id = %id, "lost ownership before finalisation");
                Ok(TaskOutcome::Progressed)
            }
            Err(e) => Err(e.into()),
        }
    }
}
