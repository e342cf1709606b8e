use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use chorus_ai::{generate_bounded, GenerationError, Generator, Prompt};
use chorus_core::{BattleId, PersonaId};

use crate::content::{Battle, BattleStatus, BattleTurn, ContentStore, Insert, Persona, Verdict};
use crate::error::StoreError;
use crate::jobs::{Job, JobType, Outcome};
use crate::notify::{notify_best_effort, Notification, NotificationKind, Notifier};

use super::{generation_outcome, ExecutionContext, TaskExecutor};

/// Shape the judge is asked to answer with.
#[derive(Debug, Deserialize)]
struct JudgeAnswer {
    winner: String,
    reasoning: String,
}

impl JudgeAnswer {
    fn winner(&self, battle: &Battle) -> Result<Option<PersonaId>, GenerationError> {
        match self.winner.trim().to_ascii_lowercase().as_str() {
            "a" => Ok(Some(battle.persona_a)),
            "b" => Ok(Some(battle.persona_b)),
            "draw" => Ok(None),
            other => Err(GenerationError::Malformed(format!(
                "unknown winner {other:?}"
            ))),
        }
    }
}

/// Judges a battle once every turn is stored, then closes it.
pub struct VerdictExecutor {
    content: Arc<dyn ContentStore>,
    generator: Arc<dyn Generator>,
    notifier: Arc<dyn Notifier>,
    generation_timeout: Duration,
}

impl VerdictExecutor {
    pub fn new(
        content: Arc<dyn ContentStore>,
        generator: Arc<dyn Generator>,
        notifier: Arc<dyn Notifier>,
        generation_timeout: Duration,
    ) -> Self {
        Self {
            content,
            generator,
            notifier,
            generation_timeout,
        }
    }

    fn prompt(battle: &Battle, a: &Persona, b: &Persona, turns: &[BattleTurn]) -> Prompt {
        let mut transcript = format!("Topic: {}\n", battle.topic);
        for turn in turns {
            let name = if turn.persona_id == a.id { "A" } else { "B" };
            transcript.push_str(&format!("\n{name}: {}", turn.body));
        }

        Prompt::new(format!(
            "You judge a debate between A ({}) and B ({}). Decide who argued better. \
             Answer with a single JSON object: \
             {{\"winner\": \"a\" | \"b\" | \"draw\", \"reasoning\": \"...\"}}",
            a.display_name, b.display_name
        ))
        .user(transcript)
        .json()
        .with_temperature(0.2)
    }

    async fn close(&self, battle: &Battle) -> Result<(), StoreError> {
        if battle.status != BattleStatus::Closed {
            self.content
                .set_battle_status(battle.id, BattleStatus::Closed)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TaskExecutor for VerdictExecutor {
    fn job_type(&self) -> JobType {
        JobType::GenerateVerdict
    }

    async fn execute(&self, job: &Job, ctx: &ExecutionContext) -> Result<Outcome, StoreError> {
        let battle_id = BattleId::from_uuid(job.subject_ref);
        let Some(battle) = self.content.get_battle(battle_id).await? else {
            return Ok(Outcome::permanent(format!("battle {battle_id} not found")));
        };
        if self.content.get_verdict(battle.id).await?.is_some() {
            debug!(%battle_id, "verdict already exists");
            self.close(&battle).await?;
            return Ok(Outcome::Done);
        }

        let turns = self.content.battle_turns(battle.id).await?;
        if turns.len() < battle.turn_limit as usize {
            return Ok(Outcome::retry(format!(
                "battle has {} of {} turns",
                turns.len(),
                battle.turn_limit
            )));
        }

        let (Some(a), Some(b)) = (
            self.content.get_persona(battle.persona_a).await?,
            self.content.get_persona(battle.persona_b).await?,
        ) else {
            return Ok(Outcome::permanent(format!(
                "battle {battle_id} references a missing persona"
            )));
        };

        let prompt = Self::prompt(&battle, &a, &b, &turns);
        let budget = ctx.generation_budget(self.generation_timeout);
        let judged = generate_bounded(self.generator.as_ref(), &prompt, budget)
            .await
            .and_then(|generated| generated.parse_json::<JudgeAnswer>())
            .and_then(|answer| answer.winner(&battle).map(|winner| (winner, answer.reasoning)));
        let (winner, reasoning) = match judged {
            Ok(judged) => judged,
            Err(e) => return Ok(generation_outcome("generate verdict", e)),
        };

        let verdict = Verdict {
            battle_id: battle.id,
            winner,
            reasoning: reasoning.trim().to_string(),
            created_at: ctx.now,
        };
        match self.content.insert_verdict(verdict).await? {
            Insert::Inserted(verdict) => {
                info!(%battle_id, winner = ?verdict.winner, "battle judged");
                if let Some(recipient) = battle.created_by {
                    let notification = Notification {
                        recipient,
                        kind: NotificationKind::VerdictReady,
                        subject_ref: battle.id.into(),
                        created_at: ctx.now,
                    };
                    notify_best_effort(self.notifier.as_ref(), notification).await;
                }
            }
            Insert::Duplicate => {
                debug!(%battle_id, "verdict inserted by an earlier attempt");
            }
        }
        Ok(Outcome::Done)
    }
}
