use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use chorus_ai::{generate_bounded, Generator, Prompt};
use chorus_core::{BattleId, PersonaId};

use crate::content::{Battle, BattleStatus, BattleTurn, ContentStore, Insert, Persona};
use crate::error::StoreError;
use crate::jobs::{Job, JobStore, JobType, NewJob, Outcome};

use super::{generation_outcome, ExecutionContext, TaskExecutor};

/// Generates the next turn of a battle, then schedules what comes after it.
///
/// Turns are strictly sequential: the next index is the number of stored
/// turns and its speaker alternates starting with `persona_a`. A job whose
/// persona is not the current speaker belongs to a turn that already exists.
pub struct BattleTurnExecutor {
    content: Arc<dyn ContentStore>,
    jobs: Arc<dyn JobStore>,
    generator: Arc<dyn Generator>,
    generation_timeout: Duration,
}

impl BattleTurnExecutor {
    pub fn new(
        content: Arc<dyn ContentStore>,
        jobs: Arc<dyn JobStore>,
        generator: Arc<dyn Generator>,
        generation_timeout: Duration,
    ) -> Self {
        Self {
            content,
            jobs,
            generator,
            generation_timeout,
        }
    }

    fn prompt(battle: &Battle, speaker: &Persona, history: &[BattleTurn]) -> Prompt {
        let mut prompt = Prompt::new(format!(
            "You are {} in a debate about \"{}\". Voice: {}. \
             Answer your opponent's last point in at most four sentences.",
            speaker.display_name, battle.topic, speaker.style
        ));
        if history.is_empty() {
            prompt = prompt.user(format!("Open the debate on: {}", battle.topic));
        }
        for turn in history {
            prompt = if turn.persona_id == speaker.id {
                prompt.assistant(turn.body.clone())
            } else {
                prompt.user(turn.body.clone())
            };
        }
        prompt.with_max_tokens(350)
    }

    /// Enqueue the job that follows `stored` turns: the next turn, or the
    /// verdict once the limit is reached.
    async fn ensure_follow_up(
        &self,
        battle: &Battle,
        stored: u32,
        now: DateTime<Utc>,
    ) -> Result<Outcome, StoreError> {
        if battle.status == BattleStatus::Closed {
            return Ok(Outcome::Done);
        }

        let next = if stored < battle.turn_limit {
            NewJob::new(JobType::GenerateBattleTurn, battle.id).with_actor(battle.speaker(stored))
        } else {
            if battle.status == BattleStatus::Active {
                self.content
                    .set_battle_status(battle.id, BattleStatus::Judging)
                    .await?;
                info!(battle_id = %battle.id, turns = stored, "battle moved to judging");
            }
            NewJob::new(JobType::GenerateVerdict, battle.id)
        };

        match self.jobs.enqueue(next, now).await {
            Ok(outcome) => {
                debug!(battle_id = %battle.id, job_id = %outcome.job_id(), "follow-up ensured");
                Ok(Outcome::Done)
            }
            Err(e) => Ok(Outcome::retry(format!("enqueue battle follow-up: {e}"))),
        }
    }
}

#[async_trait]
impl TaskExecutor for BattleTurnExecutor {
    fn job_type(&self) -> JobType {
        JobType::GenerateBattleTurn
    }

    async fn execute(&self, job: &Job, ctx: &ExecutionContext) -> Result<Outcome, StoreError> {
        let battle_id = BattleId::from_uuid(job.subject_ref);
        let Some(persona_id) = job.actor_ref.map(PersonaId::from_uuid) else {
            return Ok(Outcome::permanent("battle turn job has no persona"));
        };
        let Some(battle) = self.content.get_battle(battle_id).await? else {
            return Ok(Outcome::permanent(format!("battle {battle_id} not found")));
        };
        if !battle.is_participant(persona_id) {
            return Ok(Outcome::permanent(format!(
                "persona {persona_id} is not in battle {battle_id}"
            )));
        }

        let history = self.content.battle_turns(battle.id).await?;
        let next_index = u32::try_from(history.len()).unwrap_or(u32::MAX);
        if battle.status != BattleStatus::Active || next_index >= battle.turn_limit {
            return self.ensure_follow_up(&battle, next_index, ctx.now).await;
        }
        if battle.speaker(next_index) != persona_id {
            debug!(%battle_id, %persona_id, next_index, "turn already taken");
            return self.ensure_follow_up(&battle, next_index, ctx.now).await;
        }

        let Some(speaker) = self.content.get_persona(persona_id).await? else {
            return Ok(Outcome::permanent(format!("persona {persona_id} not found")));
        };

        let prompt = Self::prompt(&battle, &speaker, &history);
        let budget = ctx.generation_budget(self.generation_timeout);
        let generated = match generate_bounded(self.generator.as_ref(), &prompt, budget).await {
            Ok(generated) => generated,
            Err(e) => return Ok(generation_outcome("generate battle turn", e)),
        };

        let turn = BattleTurn {
            battle_id: battle.id,
            turn_index: next_index,
            persona_id,
            body: generated.text.trim().to_string(),
            created_at: ctx.now,
        };
        match self.content.insert_turn(turn).await? {
            Insert::Inserted(turn) => {
                info!(%battle_id, turn_index = turn.turn_index, "battle turn created");
            }
            Insert::Duplicate => {
                debug!(%battle_id, next_index, "turn inserted by an earlier attempt");
            }
        }

        self.ensure_follow_up(&battle, next_index + 1, ctx.now).await
    }
}
