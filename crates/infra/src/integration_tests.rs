//! End-to-end tests for the queue pipeline.
//!
//! Tests: enqueue → claim → executor → finalise, with in-memory stores and a
//! scripted generator.
//!
//! Verifies:
//! - A fanned-out post gets exactly one reply per eligible persona
//! - Re-delivery after a crash never duplicates an artifact
//! - Transient failures become terminal at the attempt ceiling
//! - Permanent failures short-circuit on the first attempt
//! - Jobs are invisible until `available_at`
//! - A battle alternates speakers up to its limit and ends with a verdict

use std::sync::Arc;
use std::time::Duration;

use chorus_ai::{GenerationError, ScriptedGenerator};
use chorus_core::UserId;

use crate::content::{ContentStore, Post, PostAuthor, PostStatus};
use crate::executors::testing::Fixture;
use crate::executors::{
    BattleTurnExecutor, ExecutionContext, FanOutRepliesExecutor, ReplyExecutor, TaskExecutor,
    VerdictExecutor,
};
use crate::jobs::{
    Disposition, JobDispatcher, JobStatus, JobStore, JobType, NewJob, RetryPolicy, StaleJobReaper,
};

fn policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        ..RetryPolicy::default()
    }
}

fn reply_executor(fx: &Fixture, generator: Arc<ScriptedGenerator>) -> Arc<ReplyExecutor> {
    Arc::new(ReplyExecutor::new(
        fx.content.clone(),
        fx.quota.clone(),
        generator,
        fx.notifier.clone(),
        fx.limits.clone(),
        Duration::from_secs(5),
    ))
}

fn dispatcher(fx: &Fixture, generator: Arc<ScriptedGenerator>) -> JobDispatcher {
    JobDispatcher::new(fx.jobs.clone(), policy())
        .with_executor(Arc::new(FanOutRepliesExecutor::new(
            fx.content.clone(),
            fx.jobs.clone(),
            3,
        )))
        .with_executor(reply_executor(fx, generator.clone()))
        .with_executor(Arc::new(BattleTurnExecutor::new(
            fx.content.clone(),
            fx.jobs.clone(),
            generator.clone(),
            Duration::from_secs(5),
        )))
        .with_executor(Arc::new(VerdictExecutor::new(
            fx.content.clone(),
            generator,
            fx.notifier.clone(),
            Duration::from_secs(5),
        )))
}

#[tokio::test]
async fn fanned_out_post_gets_one_reply_per_persona() {
    let fx = Fixture::new();
    let author = UserId::new();
    let post = fx.user_post(author);
    fx.persona("ada");
    fx.persona("bob");
    let generator = Arc::new(ScriptedGenerator::new());
    let dispatcher = dispatcher(&fx, generator.clone());

    fx.jobs
        .enqueue(NewJob::new(JobType::FanOutReplies, post.id), fx.now)
        .await
        .unwrap();

    let mut processed = Vec::new();
    while let Some(p) = dispatcher.drain_at(fx.now).await.unwrap() {
        processed.push(p);
    }

    assert_eq!(processed.len(), 3);
    assert!(processed.iter().all(|p| p.disposition == Disposition::Done));
    assert_eq!(fx.content.replies().len(), 2);
    assert_eq!(generator.calls(), 2);
    assert_eq!(fx.notifier.sent().len(), 2);
    assert!(fx.jobs.snapshot().iter().all(|j| j.status == JobStatus::Done));
    assert!(dispatcher.drain_at(fx.now).await.unwrap().is_none());
}

#[tokio::test]
async fn crash_after_commit_is_recovered_without_duplicates() {
    let fx = Fixture::new();
    let post = fx.user_post(UserId::new());
    let persona = fx.persona("ada");
    let generator = Arc::new(ScriptedGenerator::new());
    let t0 = fx.now;

    fx.jobs
        .enqueue(
            NewJob::new(JobType::GenerateReply, post.id).with_actor(persona.id),
            t0,
        )
        .await
        .unwrap();

    // A worker claims the job, commits the reply, then dies before finalising.
    let claimed = fx.jobs.claim(&[JobType::GenerateReply], t0).await.unwrap().unwrap();
    let ctx = ExecutionContext::new(t0, Duration::from_secs(10));
    reply_executor(&fx, generator.clone())
        .execute(&claimed.job, &ctx)
        .await
        .unwrap();
    assert_eq!(fx.content.replies().len(), 1);

    let reaper = StaleJobReaper::new(fx.jobs.clone(), Duration::from_secs(60), 3);
    let report = reaper.reap_at(t0 + chrono::Duration::seconds(61)).await.unwrap();
    assert_eq!(report.requeued, 1);

    let later = t0 + chrono::Duration::seconds(62);
    let processed = dispatcher(&fx, generator.clone())
        .drain_at(later)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(processed.disposition, Disposition::Done);
    assert_eq!(processed.attempt, 2);
    assert_eq!(fx.content.replies().len(), 1);
    assert_eq!(generator.calls(), 1);

    // The dead worker's late finalisation is fenced out.
    assert!(fx.jobs.complete(&claimed, later).await.is_err());
}

#[tokio::test]
async fn transient_failures_become_terminal_at_the_ceiling() {
    let fx = Fixture::new();
    let post = fx.user_post(UserId::new());
    let persona = fx.persona("ada");
    let mut generator = ScriptedGenerator::new();
    for _ in 0..3 {
        generator = generator.then_error(GenerationError::Server {
            status: 502,
            message: "bad gateway".into(),
        });
    }
    let dispatcher = dispatcher(&fx, Arc::new(generator));

    let id = fx
        .jobs
        .enqueue(
            NewJob::new(JobType::GenerateReply, post.id).with_actor(persona.id),
            fx.now,
        )
        .await
        .unwrap()
        .job_id();

    let mut at = fx.now;
    let mut dispositions = Vec::new();
    while let Some(p) = dispatcher.drain_at(at).await.unwrap() {
        dispositions.push(p.disposition);
        at += chrono::Duration::hours(1);
    }

    assert_eq!(dispositions.len(), 3);
    assert!(matches!(dispositions[0], Disposition::Retrying { .. }));
    assert!(matches!(dispositions[1], Disposition::Retrying { .. }));
    assert!(matches!(dispositions[2], Disposition::Failed { .. }));

    let job = fx.jobs.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 3);
    assert!(job.last_error.unwrap().contains("gave up after 3 attempts"));
    assert!(fx.content.replies().is_empty());
}

#[tokio::test]
async fn permanent_failure_stops_after_one_attempt() {
    let fx = Fixture::new();
    let persona = fx.persona("ada");
    let own_post = Post::new(PostAuthor::Persona(persona.id), "t", "b", fx.now)
        .with_status(PostStatus::Published);
    fx.content.put_post(own_post.clone());
    let generator = Arc::new(ScriptedGenerator::new());
    let dispatcher = dispatcher(&fx, generator.clone());

    let id = fx
        .jobs
        .enqueue(
            NewJob::new(JobType::GenerateReply, own_post.id).with_actor(persona.id),
            fx.now,
        )
        .await
        .unwrap()
        .job_id();

    let processed = dispatcher.drain_at(fx.now).await.unwrap().unwrap();
    assert!(matches!(processed.disposition, Disposition::Failed { .. }));

    let job = fx.jobs.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert_eq!(generator.calls(), 0);
    assert!(
        dispatcher
            .drain_at(fx.now + chrono::Duration::days(1))
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn future_job_waits_for_its_available_at() {
    let fx = Fixture::new();
    let post = fx.user_post(UserId::new());
    fx.persona("ada");
    let dispatcher = dispatcher(&fx, Arc::new(ScriptedGenerator::new()));
    let ready_at = fx.now + chrono::Duration::minutes(10);

    fx.jobs
        .enqueue(
            NewJob::new(JobType::FanOutReplies, post.id).available_at(ready_at),
            fx.now,
        )
        .await
        .unwrap();

    assert!(dispatcher.drain_at(fx.now).await.unwrap().is_none());
    assert!(
        dispatcher
            .drain_at(ready_at - chrono::Duration::seconds(1))
            .await
            .unwrap()
            .is_none()
    );
    let processed = dispatcher.drain_at(ready_at).await.unwrap().unwrap();
    assert_eq!(processed.job_type, JobType::FanOutReplies);
}

#[tokio::test]
async fn battle_runs_to_a_verdict() {
    let fx = Fixture::new();
    let creator = UserId::new();
    let battle = fx.battle(4, creator);
    let generator = Arc::new(
        ScriptedGenerator::new()
            .then_text("opening")
            .then_text("rebuttal")
            .then_text("counter")
            .then_text("closing")
            .then_text(r#"{"winner": "a", "reasoning": "kept the thread"}"#),
    );
    let dispatcher = dispatcher(&fx, generator.clone());

    fx.jobs
        .enqueue(
            NewJob::new(JobType::GenerateBattleTurn, battle.id).with_actor(battle.persona_a),
            fx.now,
        )
        .await
        .unwrap();

    let mut processed = 0;
    while dispatcher.drain_at(fx.now).await.unwrap().is_some() {
        processed += 1;
        assert!(processed <= 5, "battle did not terminate");
    }

    assert_eq!(processed, 5);
    let bodies: Vec<_> = fx.content.turns(battle.id).into_iter().map(|t| t.body).collect();
    assert_eq!(bodies, vec!["opening", "rebuttal", "counter", "closing"]);

    let verdict = fx.content.get_verdict(battle.id).await.unwrap().unwrap();
    assert_eq!(verdict.winner, Some(battle.persona_a));
    assert_eq!(fx.notifier.sent()[0].recipient, creator);
}
