use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use chorus_ai::{generate_bounded, Generator, Prompt};
use chorus_core::{PersonaId, PostId};

use crate::content::{ContentStore, Persona, Post, Reply, ReplyInsert};
use crate::error::StoreError;
use crate::jobs::{Job, JobType, Outcome};
use crate::notify::{notify_best_effort, Notification, NotificationKind, Notifier};
use crate::quota::{QuotaLedger, QuotaLimits, QuotaType};

use super::{generation_outcome, ExecutionContext, TaskExecutor};

/// Replies included in the prompt as conversation context.
const CONTEXT_REPLIES: usize = 5;

/// Generates one persona's reply to a post.
pub struct ReplyExecutor {
    content: Arc<dyn ContentStore>,
    quota: Arc<dyn QuotaLedger>,
    generator: Arc<dyn Generator>,
    notifier: Arc<dyn Notifier>,
    limits: QuotaLimits,
    generation_timeout: Duration,
}

impl ReplyExecutor {
    pub fn new(
        content: Arc<dyn ContentStore>,
        quota: Arc<dyn QuotaLedger>,
        generator: Arc<dyn Generator>,
        notifier: Arc<dyn Notifier>,
        limits: QuotaLimits,
        generation_timeout: Duration,
    ) -> Self {
        Self {
            content,
            quota,
            generator,
            notifier,
            limits,
            generation_timeout,
        }
    }

    fn prompt(persona: &Persona, post: &Post, context: &[Reply]) -> Prompt {
        let mut thread = format!("Post: {}\n\n{}", post.title, post.body);
        if !context.is_empty() {
            thread.push_str("\n\nReplies so far:");
            for reply in context {
                thread.push_str("\n- ");
                thread.push_str(&reply.body);
            }
        }

        Prompt::new(format!(
            "You are {}, replying on a discussion board. Voice: {}. \
             Reply in at most three sentences; do not repeat earlier replies.",
            persona.display_name, persona.style
        ))
        .user(thread)
        .with_max_tokens(300)
    }
}

#[async_trait]
impl TaskExecutor for ReplyExecutor {
    fn job_type(&self) -> JobType {
        JobType::GenerateReply
    }

    async fn execute(&self, job: &Job, ctx: &ExecutionContext) -> Result<Outcome, StoreError> {
        let post_id = PostId::from_uuid(job.subject_ref);
        let Some(persona_id) = job.actor_ref.map(PersonaId::from_uuid) else {
            return Ok(Outcome::permanent("reply job has no persona"));
        };

        let post = match self.content.get_post(post_id).await? {
            Some(post) if post.is_published() => post,
            Some(post) => {
                return Ok(Outcome::permanent(format!(
                    "post {post_id} is {}",
                    post.status.as_str()
                )));
            }
            None => return Ok(Outcome::permanent(format!("post {post_id} not found"))),
        };
        let persona = match self.content.get_persona(persona_id).await? {
            Some(persona) if persona.active => persona,
            Some(_) => return Ok(Outcome::permanent(format!("persona {persona_id} is inactive"))),
            None => return Ok(Outcome::permanent(format!("persona {persona_id} not found"))),
        };
        if post.author.persona() == Some(persona.id) {
            return Ok(Outcome::permanent("persona cannot reply to its own post"));
        }
        if self.content.has_replied(post.id, persona.id).await? {
            debug!(%post_id, %persona_id, "reply already exists");
            return Ok(Outcome::Done);
        }

        let limit = persona
            .daily_reply_limit
            .unwrap_or(self.limits.persona_replies_per_day);
        let used = self
            .quota
            .usage(persona.id.into(), QuotaType::PersonaReply, ctx.now)
            .await?;
        if used >= limit {
            return Ok(Outcome::permanent(format!(
                "daily reply quota exhausted ({used}/{limit})"
            )));
        }

        let replies = self.content.replies_for_post(post.id).await?;
        let context = &replies[replies.len().saturating_sub(CONTEXT_REPLIES)..];
        let prompt = Self::prompt(&persona, &post, context);

        let budget = ctx.generation_budget(self.generation_timeout);
        let generated = match generate_bounded(self.generator.as_ref(), &prompt, budget).await {
            Ok(generated) => generated,
            Err(e) => return Ok(generation_outcome("generate reply", e)),
        };

        let reply = Reply::new(post.id, persona.id, generated.text.trim(), ctx.now);
        match self
            .content
            .insert_reply_gated(reply, limit, self.limits.window_at(ctx.now))
            .await?
        {
            ReplyInsert::Inserted(reply) => {
                info!(%post_id, %persona_id, reply_id = %reply.id, "reply created");
                if let Some(recipient) = post.author.user() {
                    let notification = Notification {
                        recipient,
                        kind: NotificationKind::ReplyReceived,
                        subject_ref: reply.id,
                        created_at: ctx.now,
                    };
                    notify_best_effort(self.notifier.as_ref(), notification).await;
                }
                Ok(Outcome::Done)
            }
            ReplyInsert::Duplicate => {
                debug!(%post_id, %persona_id, "reply inserted by an earlier attempt");
                Ok(Outcome::Done)
            }
            ReplyInsert::QuotaExceeded { used, limit } => {
                warn!(%persona_id, used, limit, "reply quota exhausted after generation");
                Ok(Outcome::permanent(format!(
                    "daily reply quota exhausted ({used}/{limit})"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chorus_ai::{Generated, GenerationError, ScriptedGenerator};
    use chorus_core::UserId;

    use crate::content::{InMemoryContentStore, PostAuthor, PostStatus};
    use crate::executors::testing::Fixture;
    use crate::notify::InMemoryNotifier;
    use crate::quota::QuotaWindow;

    /// Commits a reply for the same (post, persona) while "generating", the
    /// way a concurrent attempt of the same job would.
    struct RacingGenerator {
        content: Arc<InMemoryContentStore>,
        post: PostId,
        persona: PersonaId,
        window: QuotaWindow,
        at: chrono::DateTime<chrono::Utc>,
    }

    #[async_trait]
    impl Generator for RacingGenerator {
        async fn generate(
            &self,
            _prompt: &Prompt,
            _deadline: Duration,
        ) -> Result<Generated, GenerationError> {
            let reply = Reply::new(self.post, self.persona, "first", self.at);
            let inserted = self
                .content
                .insert_reply_gated(reply, 10, self.window)
                .await
                .map_err(|e| GenerationError::Transport(e.to_string()))?;
            assert!(matches!(inserted, ReplyInsert::Inserted(_)));
            Ok(Generated::text("second"))
        }
    }

    fn executor(fx: &Fixture, generator: Arc<ScriptedGenerator>) -> ReplyExecutor {
        ReplyExecutor::new(
            fx.content.clone(),
            fx.quota.clone(),
            generator,
            fx.notifier.clone(),
            fx.limits.clone(),
            Duration::from_secs(5),
        )
    }

    fn ctx(fx: &Fixture) -> ExecutionContext {
        ExecutionContext::new(fx.now, Duration::from_secs(10))
    }

    #[tokio::test]
    async fn creates_the_reply_and_notifies_the_author() {
        let fx = Fixture::new();
        let author = UserId::new();
        let post = fx.user_post(author);
        let persona = fx.persona("ada");
        let generator = Arc::new(ScriptedGenerator::new().then_text("  Spaces, obviously.  "));

        let outcome = executor(&fx, generator.clone())
            .execute(&fx.reply_job(post.id, persona.id), &ctx(&fx))
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Done);
        let replies = fx.content.replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].body, "Spaces, obviously.");

        let sent = fx.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient, author);
        assert_eq!(sent[0].subject_ref, replies[0].id);

        let prompt = &generator.prompts()[0];
        assert!(prompt.system.contains("ada style"));
        assert_eq!(
            fx.quota
                .usage(persona.id.into(), QuotaType::PersonaReply, fx.now)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn existing_reply_short_circuits_without_generation() {
        let fx = Fixture::new();
        let post = fx.user_post(UserId::new());
        let persona = fx.persona("ada");
        let generator = Arc::new(ScriptedGenerator::new());
        let executor = executor(&fx, generator.clone());
        let job = fx.reply_job(post.id, persona.id);

        assert_eq!(executor.execute(&job, &ctx(&fx)).await.unwrap(), Outcome::Done);
        assert_eq!(executor.execute(&job, &ctx(&fx)).await.unwrap(), Outcome::Done);

        assert_eq!(generator.calls(), 1);
        assert_eq!(fx.content.replies().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_insert_during_generation_is_done_without_a_second_reply() {
        let fx = Fixture::new();
        let author = UserId::new();
        let post = fx.user_post(author);
        let persona = fx.persona("ada");
        let generator = Arc::new(RacingGenerator {
            content: fx.content.clone(),
            post: post.id,
            persona: persona.id,
            window: fx.limits.window_at(fx.now),
            at: fx.now,
        });
        let executor = ReplyExecutor::new(
            fx.content.clone(),
            fx.quota.clone(),
            generator,
            fx.notifier.clone(),
            fx.limits.clone(),
            Duration::from_secs(5),
        );

        let outcome = executor
            .execute(&fx.reply_job(post.id, persona.id), &ctx(&fx))
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Done);
        let replies = fx.content.replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].body, "first");
        // Only the winning insert consumed quota, and the loser sends nothing.
        assert_eq!(
            fx.quota
                .usage(persona.id.into(), QuotaType::PersonaReply, fx.now)
                .await
                .unwrap(),
            1
        );
        assert!(fx.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn persona_never_replies_to_its_own_post() {
        let fx = Fixture::new();
        let persona = fx.persona("ada");
        let post = Post::new(PostAuthor::Persona(persona.id), "t", "b", fx.now)
            .with_status(PostStatus::Published);
        fx.content.put_post(post.clone());
        let generator = Arc::new(ScriptedGenerator::new());

        let outcome = executor(&fx, generator.clone())
            .execute(&fx.reply_job(post.id, persona.id), &ctx(&fx))
            .await
            .unwrap();

        assert!(matches!(outcome, Outcome::Permanent(_)));
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn archived_post_and_inactive_persona_are_permanent() {
        let fx = Fixture::new();
        let generator = Arc::new(ScriptedGenerator::new());
        let executor = executor(&fx, generator.clone());

        let archived = Post::new(PostAuthor::User(UserId::new()), "t", "b", fx.now)
            .with_status(PostStatus::Archived);
        fx.content.put_post(archived.clone());
        let ada = fx.persona("ada");
        let outcome = executor
            .execute(&fx.reply_job(archived.id, ada.id), &ctx(&fx))
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Permanent(_)));

        let post = fx.user_post(UserId::new());
        let dormant = fx.persona("dormant").inactive();
        fx.content.put_persona(dormant.clone());
        let outcome = executor
            .execute(&fx.reply_job(post.id, dormant.id), &ctx(&fx))
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Permanent(_)));
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn exhausted_quota_is_permanent() {
        let fx = Fixture::new();
        let post = fx.user_post(UserId::new());
        let persona = fx.persona("ada").with_daily_reply_limit(1);
        fx.content.put_persona(persona.clone());
        fx.quota
            .try_consume(persona.id.into(), QuotaType::PersonaReply, 1, fx.now)
            .await
            .unwrap();
        let generator = Arc::new(ScriptedGenerator::new());

        let outcome = executor(&fx, generator.clone())
            .execute(&fx.reply_job(post.id, persona.id), &ctx(&fx))
            .await
            .unwrap();

        assert!(matches!(outcome, Outcome::Permanent(ref r) if r.contains("quota")));
        assert_eq!(generator.calls(), 0);
        assert!(fx.content.replies().is_empty());
    }

    #[tokio::test]
    async fn provider_failures_follow_their_classification() {
        let fx = Fixture::new();
        let post = fx.user_post(UserId::new());
        let persona = fx.persona("ada");
        let job = fx.reply_job(post.id, persona.id);
        let generator = Arc::new(
            ScriptedGenerator::new()
                .then_error(GenerationError::RateLimited {
                    retry_after: Some(Duration::from_secs(90)),
                })
                .then_error(GenerationError::Authentication("bad key".into())),
        );
        let executor = executor(&fx, generator);

        let outcome = executor.execute(&job, &ctx(&fx)).await.unwrap();
        assert!(matches!(
            outcome,
            Outcome::Retry { retry_after: Some(d), .. } if d == Duration::from_secs(90)
        ));

        let outcome = executor.execute(&job, &ctx(&fx)).await.unwrap();
        assert!(matches!(outcome, Outcome::Permanent(_)));
        assert!(fx.content.replies().is_empty());
    }

    #[tokio::test]
    async fn notification_failure_does_not_change_the_outcome() {
        let fx = Fixture::new();
        let post = fx.user_post(UserId::new());
        let persona = fx.persona("ada");
        let executor = ReplyExecutor::new(
            fx.content.clone(),
            fx.quota.clone(),
            Arc::new(ScriptedGenerator::new()),
            Arc::new(InMemoryNotifier::failing()),
            fx.limits.clone(),
            Duration::from_secs(5),
        );

        let outcome = executor
            .execute(&fx.reply_job(post.id, persona.id), &ctx(&fx))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert_eq!(fx.content.replies().len(), 1);
    }
}
