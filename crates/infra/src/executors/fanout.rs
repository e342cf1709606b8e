use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use chorus_core::PostId;

use crate::content::{ContentStore, Persona, Post};
use crate::error::StoreError;
use crate::jobs::{EnqueueOutcome, Job, JobStore, JobType, NewJob, Outcome};

use super::{ExecutionContext, TaskExecutor};

/// Turns a published post into one `generate_reply` job per eligible persona.
pub struct FanOutRepliesExecutor {
    content: Arc<dyn ContentStore>,
    jobs: Arc<dyn JobStore>,
    limit: usize,
}

impl FanOutRepliesExecutor {
    pub fn new(content: Arc<dyn ContentStore>, jobs: Arc<dyn JobStore>, limit: usize) -> Self {
        Self {
            content,
            jobs,
            limit,
        }
    }

    /// Active personas other than the author that have not replied yet,
    /// in a stable per-post order. Existing replies count against `limit`,
    /// so a rerun only tops the post up to the cap.
    async fn eligible(&self, post: &Post) -> Result<Vec<Persona>, StoreError> {
        let mut replied: Vec<_> = self
            .content
            .replies_for_post(post.id)
            .await?
            .into_iter()
            .map(|r| r.persona_id)
            .collect();
        replied.sort();
        replied.dedup();
        let remaining = self.limit.saturating_sub(replied.len());
        if remaining == 0 {
            return Ok(Vec::new());
        }
        let author = post.author.persona();

        let mut personas: Vec<_> = self
            .content
            .active_personas()
            .await?
            .into_iter()
            .filter(|p| Some(p.id) != author && !replied.contains(&p.id))
            .collect();

        // Mixing in the post id spreads replies across personas instead of
        // always picking the same few.
        let salt = post.id.as_uuid().as_u128();
        personas.sort_by_key(|p| p.id.as_uuid().as_u128() ^ salt);
        personas.truncate(remaining);
        Ok(personas)
    }
}

#[async_trait]
impl TaskExecutor for FanOutRepliesExecutor {
    fn job_type(&self) -> JobType {
        JobType::FanOutReplies
    }

    async fn execute(&self, job: &Job, ctx: &ExecutionContext) -> Result<Outcome, StoreError> {
        let post_id = PostId::from_uuid(job.subject_ref);
        let Some(post) = self.content.get_post(post_id).await? else {
            return Ok(Outcome::permanent(format!("post {post_id} not found")));
        };
        if !post.is_published() {
            return Ok(Outcome::permanent(format!(
                "post {post_id} is {}",
                post.status.as_str()
            )));
        }

        let personas = self.eligible(&post).await?;
        let mut enqueued = 0;
        for persona in &personas {
            let job = NewJob::new(JobType::GenerateReply, post.id).with_actor(persona.id);
            match self.jobs.enqueue(job, ctx.now).await {
                Ok(EnqueueOutcome::Enqueued(_)) => enqueued += 1,
                Ok(EnqueueOutcome::AlreadyActive(id)) => {
                    debug!(job_id = %id, persona_id = %persona.id, "reply job already active");
                }
                Err(e) => return Ok(Outcome::retry(format!("enqueue reply job: {e}"))),
            }
        }

        info!(post_id = %post.id, eligible = personas.len(), enqueued, "fanned out replies");
        Ok(Outcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chorus_core::{PersonaId, UserId};
    use uuid::Uuid;

    use crate::content::{Post, PostAuthor, PostStatus, Reply, ReplyInsert};
    use crate::executors::testing::Fixture;

    fn executor(fx: &Fixture, limit: usize) -> FanOutRepliesExecutor {
        FanOutRepliesExecutor::new(fx.content.clone(), fx.jobs.clone(), limit)
    }

    fn ctx(fx: &Fixture) -> ExecutionContext {
        ExecutionContext::new(fx.now, Duration::from_secs(10))
    }

    #[tokio::test]
    async fn enqueues_one_job_per_eligible_persona() {
        let fx = Fixture::new();
        let post = fx.user_post(UserId::new());
        let ada = fx.persona("ada");
        let bob = fx.persona("bob");
        let cy = fx.persona("cy");
        fx.content.put_persona(fx.persona("dormant").inactive());

        let window = fx.limits.window_at(fx.now);
        let inserted = fx
            .content
            .insert_reply_gated(Reply::new(post.id, cy.id, "first!", fx.now), 5, window)
            .await
            .unwrap();
        assert!(matches!(inserted, ReplyInsert::Inserted(_)));

        let job = fx.job(JobType::FanOutReplies, post.id.into(), None);
        let outcome = executor(&fx, 10).execute(&job, &ctx(&fx)).await.unwrap();
        assert_eq!(outcome, Outcome::Done);

        let mut actors: Vec<_> = fx
            .jobs
            .jobs_of(JobType::GenerateReply)
            .into_iter()
            .map(|j| j.actor_ref.unwrap())
            .collect();
        actors.sort();
        let mut expected: Vec<Uuid> = vec![ada.id.into(), bob.id.into()];
        expected.sort();
        assert_eq!(actors, expected);
    }

    #[tokio::test]
    async fn rerun_does_not_duplicate_jobs() {
        let fx = Fixture::new();
        let post = fx.user_post(UserId::new());
        fx.persona("ada");
        fx.persona("bob");

        let job = fx.job(JobType::FanOutReplies, post.id.into(), None);
        let executor = executor(&fx, 10);
        executor.execute(&job, &ctx(&fx)).await.unwrap();
        executor.execute(&job, &ctx(&fx)).await.unwrap();

        assert_eq!(fx.jobs.jobs_of(JobType::GenerateReply).len(), 2);
    }

    #[tokio::test]
    async fn fanout_is_capped_and_skips_the_authoring_persona() {
        let fx = Fixture::new();
        let author = fx.persona("author");
        for handle in ["a", "b", "c", "d"] {
            fx.persona(handle);
        }
        let post = Post::new(PostAuthor::Persona(author.id), "t", "b", fx.now)
            .with_status(PostStatus::Published);
        fx.content.put_post(post.clone());

        let job = fx.job(JobType::FanOutReplies, post.id.into(), None);
        executor(&fx, 3).execute(&job, &ctx(&fx)).await.unwrap();

        let jobs = fx.jobs.jobs_of(JobType::GenerateReply);
        assert_eq!(jobs.len(), 3);
        assert!(jobs.iter().all(|j| j.actor_ref != Some(author.id.into())));
    }

    #[tokio::test]
    async fn rerun_after_replies_stays_within_the_cap() {
        let fx = Fixture::new();
        let post = fx.user_post(UserId::new());
        for handle in ["a", "b", "c", "d"] {
            fx.persona(handle);
        }
        let job = fx.job(JobType::FanOutReplies, post.id.into(), None);
        let executor = executor(&fx, 2);
        let window = fx.limits.window_at(fx.now);

        executor.execute(&job, &ctx(&fx)).await.unwrap();
        assert_eq!(fx.jobs.jobs_of(JobType::GenerateReply).len(), 2);

        // Both reply jobs run to completion before the fan-out is redelivered.
        while let Some(claimed) = fx
            .jobs
            .claim(&[JobType::GenerateReply], fx.now)
            .await
            .unwrap()
        {
            let persona = PersonaId::from_uuid(claimed.job.actor_ref.unwrap());
            fx.content
                .insert_reply_gated(Reply::new(post.id, persona, "hi", fx.now), 5, window)
                .await
                .unwrap();
            fx.jobs.complete(&claimed, fx.now).await.unwrap();
        }

        executor.execute(&job, &ctx(&fx)).await.unwrap();

        assert_eq!(fx.jobs.jobs_of(JobType::GenerateReply).len(), 2);
        assert_eq!(fx.content.replies().len(), 2);
    }

    #[tokio::test]
    async fn rerun_with_one_reply_tops_up_the_same_batch() {
        let fx = Fixture::new();
        let post = fx.user_post(UserId::new());
        for handle in ["a", "b", "c", "d"] {
            fx.persona(handle);
        }
        let job = fx.job(JobType::FanOutReplies, post.id.into(), None);
        let executor = executor(&fx, 2);

        executor.execute(&job, &ctx(&fx)).await.unwrap();
        let first: Vec<_> = fx
            .jobs
            .jobs_of(JobType::GenerateReply)
            .into_iter()
            .map(|j| j.actor_ref.unwrap())
            .collect();

        let claimed = fx
            .jobs
            .claim(&[JobType::GenerateReply], fx.now)
            .await
            .unwrap()
            .unwrap();
        let persona = PersonaId::from_uuid(claimed.job.actor_ref.unwrap());
        let window = fx.limits.window_at(fx.now);
        fx.content
            .insert_reply_gated(Reply::new(post.id, persona, "hi", fx.now), 5, window)
            .await
            .unwrap();
        fx.jobs.complete(&claimed, fx.now).await.unwrap();

        executor.execute(&job, &ctx(&fx)).await.unwrap();

        // The still-pending sibling is deduplicated, nobody new is picked.
        let after: Vec<_> = fx
            .jobs
            .jobs_of(JobType::GenerateReply)
            .into_iter()
            .map(|j| j.actor_ref.unwrap())
            .collect();
        assert_eq!(after.len(), 2);
        assert!(after.iter().all(|a| first.contains(a)));
    }

    #[tokio::test]
    async fn unpublished_post_is_permanent() {
        let fx = Fixture::new();
        let post = Post::new(PostAuthor::User(UserId::new()), "t", "b", fx.now);
        fx.content.put_post(post.clone());
        fx.persona("ada");

        let job = fx.job(JobType::FanOutReplies, post.id.into(), None);
        let outcome = executor(&fx, 3).execute(&job, &ctx(&fx)).await.unwrap();
        assert!(matches!(outcome, Outcome::Permanent(_)));
        assert!(fx.jobs.jobs_of(JobType::GenerateReply).is_empty());
    }
}
