//! Core job types.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use chorus_core::DomainError;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job type, used to route a claimed job to its executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// subject = post; enqueues one `GenerateReply` per eligible persona.
    FanOutReplies,
    /// subject = post, actor = persona.
    GenerateReply,
    /// subject = battle, actor = persona whose turn it is.
    GenerateBattleTurn,
    /// subject = battle.
    GenerateVerdict,
}

impl JobType {
    pub const ALL: [JobType; 4] = [
        JobType::FanOutReplies,
        JobType::GenerateReply,
        JobType::GenerateBattleTurn,
        JobType::GenerateVerdict,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::FanOutReplies => "fan_out_replies",
            JobType::GenerateReply => "generate_reply",
            JobType::GenerateBattleTurn => "generate_battle_turn",
            JobType::GenerateVerdict => "generate_verdict",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job type: {s}")))
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `available_at`, then claimable.
    Pending,
    /// Owned by exactly one worker.
    Processing,
    Done,
    /// Terminal; never retried automatically.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    /// Statuses covered by the one-active-job-per-key constraint.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Processing)
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// A persisted job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub subject_ref: Uuid,
    pub actor_ref: Option<Uuid>,
    /// Job-type specific payload.
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Number of claims so far (a claim is an attempt).
    pub attempts: u32,
    pub available_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Deduplication key of the active-job constraint.
    pub fn dedupe_key(&self) -> (JobType, Uuid, Option<Uuid>) {
        (self.job_type, self.subject_ref, self.actor_ref)
    }
}

/// A job owned by the current worker.
///
/// `token` is the `locked_at` value written by the claim; finalisation is
/// fenced on it so a worker whose lock was reaped cannot overwrite the next
/// owner's result.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub job: Job,
    pub token: DateTime<Utc>,
}

impl ClaimedJob {
    pub fn id(&self) -> JobId {
        self.job.id
    }
}

/// A job to be enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub id: JobId,
    pub job_type: JobType,
    pub subject_ref: Uuid,
    pub actor_ref: Option<Uuid>,
    pub payload: serde_json::Value,
    /// `None` means "as soon as it is enqueued".
    pub available_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(job_type: JobType, subject_ref: impl Into<Uuid>) -> Self {
        Self {
            id: JobId::new(),
            job_type,
            subject_ref: subject_ref.into(),
            actor_ref: None,
            payload: serde_json::Value::Object(Default::default()),
            available_at: None,
        }
    }

    pub fn with_actor(mut self, actor_ref: impl Into<Uuid>) -> Self {
        self.actor_ref = Some(actor_ref.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Schedule the job for later execution.
    pub fn available_at(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = Some(at);
        self
    }

    pub(crate) fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            id: self.id,
            job_type: self.job_type,
            subject_ref: self.subject_ref,
            actor_ref: self.actor_ref,
            payload: self.payload,
            status: JobStatus::Pending,
            attempts: 0,
            available_at: self.available_at.unwrap_or(now),
            locked_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Result of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued(JobId),
    /// An active job with the same `(job_type, subject_ref, actor_ref)` exists.
    AlreadyActive(JobId),
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> JobId {
        match self {
            EnqueueOutcome::Enqueued(id) | EnqueueOutcome::AlreadyActive(id) => *id,
        }
    }
}

/// Result of one execution, returned explicitly by every executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The artifact exists (created now or by an earlier attempt).
    Done,
    /// Worth repeating; the retry policy decides when, or whether.
    Retry {
        reason: String,
        /// Earliest sensible retry (e.g. a provider `Retry-After`).
        retry_after: Option<Duration>,
    },
    /// Never worth repeating.
    Permanent(String),
}

impl Outcome {
    pub fn retry(reason: impl Into<String>) -> Self {
        Outcome::Retry {
            reason: reason.into(),
            retry_after: None,
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Outcome::Permanent(reason.into())
    }
}

/// Per-type queue depth snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub pending: u64,
    pub processing: u64,
    /// Pending rows that already failed at least once.
    pub retrying: u64,
    pub failed: u64,
}

/// What a reaper pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    pub requeued: u64,
    pub failed: u64,
}

pub(crate) const MAX_ERROR_CHARS: usize = 1000;

/// Truncate error text kept on the row, on a char boundary.
pub(crate) fn truncate_error(error: &str) -> String {
    match error.char_indices().nth(MAX_ERROR_CHARS) {
        Some((idx, _)) => error[..idx].to_string(),
        None => error.to_string(),
    }
}
