//! Postgres-backed job queue.
//!
//! ## Claim protocol
//!
//! A claim is a single `UPDATE ... WHERE id = (SELECT ... FOR UPDATE SKIP LOCKED LIMIT 1)`
//! inside a transaction. Concurrent workers skip rows another transaction has
//! locked instead of blocking on them, so two workers never receive the same
//! row and neither waits for the other.
//!
//! ## Fencing
//!
//! `complete`, `reschedule` and `fail` only touch a row that is still
//! `processing` with the `locked_at` written by the claim. Zero affected rows
//! means the reaper reclaimed the job and someone else may own it now.
//!
//! ## Deduplication
//!
//! The partial unique index `jobs_active_dedupe` covers
//! `(job_type, subject_ref, COALESCE(actor_ref, nil))` for pending and
//! processing rows. A unique violation on enqueue resolves to the id of the
//! active row.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{is_unique_violation, map_sqlx_error, StoreError};

use super::store::{JobStore, JobStoreError, RECLAIMED_ERROR};
use super::types::{
    truncate_error, ClaimedJob, EnqueueOutcome, Job, JobId, JobType, NewJob, QueueDepth,
    ReapReport,
};

const JOB_COLUMNS: &str = "id, job_type, subject_ref, actor_ref, payload, status, attempts, \
     available_at, locked_at, last_error, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: Arc<PgPool>,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn find_active(
        &self,
        job_type: JobType,
        subject_ref: Uuid,
        actor_ref: Option<Uuid>,
    ) -> Result<Option<JobId>, JobStoreError> {
        let id: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM jobs
            WHERE job_type = $1
              AND subject_ref = $2
              AND actor_ref IS NOT DISTINCT FROM $3
              AND status IN ('pending', 'processing')
            LIMIT 1
            "#,
        )
        .bind(job_type.as_str())
        .bind(subject_ref)
        .bind(actor_ref)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_active", e))?;

        Ok(id.map(JobId::from_uuid))
    }

    async fn finalise(
        &self,
        operation: &str,
        claimed: &ClaimedJob,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<(), JobStoreError> {
        let result = query
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        if result.rows_affected() == 0 {
            debug!(job_id = %claimed.id(), operation, "finalisation fenced out");
            return Err(JobStoreError::LostOwnership(claimed.id()));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    #[instrument(
        skip(self, job),
        fields(job_type = %job.job_type, subject = %job.subject_ref),
        err
    )]
    async fn enqueue(
        &self,
        job: NewJob,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, JobStoreError> {
        let job = job.into_job(now);

        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs
                (id, job_type, subject_ref, actor_ref, payload, status, attempts,
                 available_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6, $7, $7)
            "#,
        )
        .bind(job.id.0)
        .bind(job.job_type.as_str())
        .bind(job.subject_ref)
        .bind(job.actor_ref)
        .bind(&job.payload)
        .bind(job.available_at)
        .bind(now)
        .execute(&*self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(EnqueueOutcome::Enqueued(job.id)),
            Err(e) if is_unique_violation(&e) => {
                match self
                    .find_active(job.job_type, job.subject_ref, job.actor_ref)
                    .await?
                {
                    Some(existing) => Ok(EnqueueOutcome::AlreadyActive(existing)),
                    // The active row finished between the insert and the lookup.
                    None => Err(StoreError::Unavailable(format!(
                        "active {} job for {} vanished during enqueue",
                        job.job_type, job.subject_ref
                    ))
                    .into()),
                }
            }
            Err(e) => Err(map_sqlx_error("enqueue", e).into()),
        }
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id.0)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| job_from_row(&r)).transpose().map_err(Into::into)
    }

    #[instrument(skip(self, types), err)]
    async fn claim(
        &self,
        types: &[JobType],
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedJob>, JobStoreError> {
        let type_names: Vec<String> = types.iter().map(|t| t.as_str().to_string()).collect();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("claim", e))?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = 'processing',
                locked_at = $2,
                attempts = attempts + 1,
                updated_at = $2
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'pending'
                  AND available_at <= $2
                  AND job_type = ANY($1)
                ORDER BY available_at, created_at, id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(type_names)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("claim", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let job = job_from_row(&row)?;
        // The stored timestamp has microsecond precision; fence on what was written.
        let token = job
            .locked_at
            .ok_or_else(|| StoreError::Corrupt(format!("claimed job {} has no lock", job.id)))?;

        Ok(Some(ClaimedJob { job, token }))
    }

    #[instrument(skip(self, job), fields(job_id = %job.id()), err)]
    async fn complete(&self, job: &ClaimedJob, now: DateTime<Utc>) -> Result<(), JobStoreError> {
        let query = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'done', locked_at = NULL, updated_at = $3
            WHERE id = $1 AND status = 'processing' AND locked_at = $2
            "#,
        )
        .bind(job.id().0)
        .bind(job.token)
        .bind(now);

        self.finalise("complete", job, query).await
    }

    #[instrument(skip(self, job, error), fields(job_id = %job.id()), err)]
    async fn reschedule(
        &self,
        job: &ClaimedJob,
        available_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let query = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                available_at = $3,
                locked_at = NULL,
                last_error = $4,
                updated_at = $5
            WHERE id = $1 AND status = 'processing' AND locked_at = $2
            "#,
        )
        .bind(job.id().0)
        .bind(job.token)
        .bind(available_at)
        .bind(truncate_error(error))
        .bind(now);

        self.finalise("reschedule", job, query).await
    }

    #[instrument(skip(self, job, error), fields(job_id = %job.id()), err)]
    async fn fail(
        &self,
        job: &ClaimedJob,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let query = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', locked_at = NULL, last_error = $3, updated_at = $4
            WHERE id = $1 AND status = 'processing' AND locked_at = $2
            "#,
        )
        .bind(job.id().0)
        .bind(job.token)
        .bind(truncate_error(error))
        .bind(now);

        self.finalise("fail", job, query).await
    }

    #[instrument(skip(self, job, error), fields(job_id = %job.id()), err)]
    async fn release(
        &self,
        job: &ClaimedJob,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let query = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                attempts = GREATEST(attempts - 1, 0),
                available_at = $3,
                locked_at = NULL,
                last_error = $4,
                updated_at = $3
            WHERE id = $1 AND status = 'processing' AND locked_at = $2
            "#,
        )
        .bind(job.id().0)
        .bind(job.token)
        .bind(now)
        .bind(truncate_error(error));

        self.finalise("release", job, query).await
    }

    #[instrument(skip(self), err)]
    async fn reap_stale(
        &self,
        locked_before: DateTime<Utc>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<ReapReport, JobStoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE jobs
            SET status = CASE WHEN attempts >= $2 THEN 'failed' ELSE 'pending' END,
                available_at = CASE WHEN attempts >= $2 THEN available_at ELSE $3 END,
                locked_at = NULL,
                last_error = $4,
                updated_at = $3
            WHERE id IN (
                SELECT id FROM jobs
                WHERE status = 'processing' AND locked_at < $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING status
            "#,
        )
        .bind(locked_before)
        .bind(max_attempts as i32)
        .bind(now)
        .bind(RECLAIMED_ERROR)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reap_stale", e))?;

        let mut report = ReapReport::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("reap_stale", e))?;
            if status == "failed" {
                report.failed += 1;
            } else {
                report.requeued += 1;
            }
        }
        Ok(report)
    }

    #[instrument(skip(self), err)]
    async fn depth(&self) -> Result<Vec<(JobType, QueueDepth)>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT job_type,
                   COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                   COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                   COUNT(*) FILTER (WHERE status = 'pending' AND attempts > 0) AS retrying,
                   COUNT(*) FILTER (WHERE status = 'failed') AS failed
            FROM jobs
            GROUP BY job_type
            ORDER BY job_type
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("depth", e))?;

        let mut depths = Vec::with_capacity(rows.len());
        for row in rows {
            let job_type: String = row
                .try_get("job_type")
                .map_err(|e| map_sqlx_error("depth", e))?;
            let job_type = job_type
                .parse::<JobType>()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            let count = |column: &str| -> Result<u64, StoreError> {
                row.try_get::<i64, _>(column)
                    .map(|n| n.max(0) as u64)
                    .map_err(|e| map_sqlx_error("depth", e))
            };
            depths.push((
                job_type,
                QueueDepth {
                    pending: count("pending")?,
                    processing: count("processing")?,
                    retrying: count("retrying")?,
                    failed: count("failed")?,
                },
            ));
        }
        Ok(depths)
    }
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, StoreError> {
    let get_err = |e| map_sqlx_error("decode_job", e);

    let job_type: String = row.try_get("job_type").map_err(get_err)?;
    let status: String = row.try_get("status").map_err(get_err)?;
    let attempts: i32 = row.try_get("attempts").map_err(get_err)?;

    Ok(Job {
        id: JobId::from_uuid(row.try_get("id").map_err(get_err)?),
        job_type: job_type
            .parse()
            .map_err(|e: chorus_core::DomainError| StoreError::Corrupt(e.to_string()))?,
        subject_ref: row.try_get("subject_ref").map_err(get_err)?,
        actor_ref: row.try_get("actor_ref").map_err(get_err)?,
        payload: row.try_get("payload").map_err(get_err)?,
        status: status
            .parse()
            .map_err(|e: chorus_core::DomainError| StoreError::Corrupt(e.to_string()))?,
        attempts: u32::try_from(attempts)
            .map_err(|_| StoreError::Corrupt(format!("negative attempts: {attempts}")))?,
        available_at: row.try_get("available_at").map_err(get_err)?,
        locked_at: row.try_get("locked_at").map_err(get_err)?,
        last_error: row.try_get("last_error").map_err(get_err)?,
        created_at: row.try_get("created_at").map_err(get_err)?,
        updated_at: row.try_get("updated_at").map_err(get_err)?,
    })
}
