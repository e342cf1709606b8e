//! Task executors, one per job type.
//!
//! Every executor follows the same contract:
//!
//! 1. Re-validate preconditions against current state; the world may have
//!    changed since the job was enqueued.
//! 2. Irrecoverable preconditions are [`Outcome::Permanent`].
//! 3. Generation runs under a bounded deadline; provider failures are mapped
//!    through their [`FailureKind`].
//! 4. The artifact is written under its uniqueness constraint; a duplicate
//!    means an earlier attempt already succeeded and is [`Outcome::Done`].
//! 5. Side effects (notifications) run only after the artifact is committed
//!    and never change the outcome.
//!
//! Store failures are returned as `Err`; the dispatcher decides whether they
//! are infrastructural (attempt released) or count as a transient failure.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

use chorus_ai::GenerationError;
use chorus_core::FailureKind;

use crate::error::StoreError;
use crate::jobs::{Job, JobType, Outcome};

mod battle;
mod fanout;
mod reply;
mod verdict;

pub use battle::BattleTurnExecutor;
pub use fanout::FanOutRepliesExecutor;
pub use reply::ReplyExecutor;
pub use verdict::VerdictExecutor;

/// Per-execution context handed to an executor.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionContext {
    /// Wall-clock instant the job was claimed at.
    pub now: DateTime<Utc>,
    /// Monotonic deadline for the whole execution.
    pub deadline: Instant,
}

impl ExecutionContext {
    pub fn new(now: DateTime<Utc>, budget: Duration) -> Self {
        Self {
            now,
            deadline: Instant::now() + budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Deadline for one generation call: the configured limit, shortened to
    /// what is left of the execution budget.
    pub fn generation_budget(&self, limit: Duration) -> Duration {
        limit.min(self.remaining())
    }
}

#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    fn job_type(&self) -> JobType;

    async fn execute(&self, job: &Job, ctx: &ExecutionContext) -> Result<Outcome, StoreError>;
}

/// Map a generation failure onto an execution outcome.
pub(crate) fn generation_outcome(context: &str, err: GenerationError) -> Outcome {
    match err.kind() {
        FailureKind::Permanent => Outcome::permanent(format!("{context}: {err}")),
        FailureKind::Transient => Outcome::Retry {
            reason: format!("{context}: {err}"),
            retry_after: err.retry_after(),
        },
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fixtures shared by the executor tests.

    use std::sync::Arc;

    use chrono::{DateTime, Utc};
    use uuid::Uuid;

    use chorus_core::{PersonaId, PostId, UserId};

    use crate::content::{Battle, InMemoryContentStore, Persona, Post, PostAuthor, PostStatus};
    use crate::jobs::{InMemoryJobStore, Job, JobType, NewJob};
    use crate::notify::InMemoryNotifier;
    use crate::quota::{InMemoryQuotaLedger, QuotaLimits};

    pub struct Fixture {
        pub content: Arc<InMemoryContentStore>,
        pub jobs: Arc<InMemoryJobStore>,
        pub quota: Arc<InMemoryQuotaLedger>,
        pub notifier: Arc<InMemoryNotifier>,
        pub limits: QuotaLimits,
        pub now: DateTime<Utc>,
    }

    impl Fixture {
        pub fn new() -> Self {
            let content = Arc::new(InMemoryContentStore::new());
            let quota = Arc::new(InMemoryQuotaLedger::new());
            content.attach_quota(quota.clone());
            Self {
                content,
                jobs: InMemoryJobStore::arc(),
                quota,
                notifier: Arc::new(InMemoryNotifier::new()),
                limits: QuotaLimits::default(),
                now: Utc::now(),
            }
        }

        pub fn persona(&self, handle: &str) -> Persona {
            let persona = Persona::new(handle, format!("{handle} style"), self.now);
            self.content.put_persona(persona.clone());
            persona
        }

        pub fn user_post(&self, author: UserId) -> Post {
            let post = Post::new(
                PostAuthor::User(author),
                "Is tabs vs spaces settled?",
                "Asking for a friend.",
                self.now,
            )
            .with_status(PostStatus::Published);
            self.content.put_post(post.clone());
            post
        }

        pub fn job(&self, job_type: JobType, subject: Uuid, actor: Option<Uuid>) -> Job {
            let mut job = NewJob::new(job_type, subject);
            if let Some(actor) = actor {
                job = job.with_actor(actor);
            }
            let mut job = job.into_job(self.now);
            job.attempts = 1;
            job
        }

        pub fn reply_job(&self, post: PostId, persona: PersonaId) -> Job {
            self.job(JobType::GenerateReply, post.into(), Some(persona.into()))
        }

        /// An active battle between two fresh personas, started by `creator`.
        pub fn battle(&self, turn_limit: u32, creator: UserId) -> Battle {
            let a = self.persona("ada");
            let b = self.persona("bob");
            let battle = Battle::new("Tabs or spaces?", a.id, b.id, turn_limit, self.now)
                .created_by(creator);
            self.content.put_battle(battle.clone());
            battle
        }
    }
}
