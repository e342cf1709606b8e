//! Postgres content store.
//!
//! Uniqueness is enforced by the schema (`replies (post_id, persona_id)`,
//! `battle_turns (battle_id, turn_index)`, `battle_verdicts (battle_id)`);
//! inserts use `ON CONFLICT DO NOTHING` and report `Duplicate` on zero rows.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use chorus_core::{BattleId, PersonaId, PostId};

use crate::error::{map_sqlx_error, StoreError};
use crate::quota::{consume_in_tx, QuotaDecision, QuotaType, QuotaWindow};

use super::{
    Battle, BattleStatus, BattleTurn, ContentStore, Insert, Persona, Post, PostAuthor, Reply,
    ReplyInsert, Verdict,
};

#[derive(Debug, Clone)]
pub struct PgContentStore {
    pool: Arc<PgPool>,
}

impl PgContentStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn corrupt(what: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("{what}: {err}"))
}

fn decode<T>(op: &'static str, result: Result<T, sqlx::Error>) -> Result<T, StoreError> {
    result.map_err(|e| map_sqlx_error(op, e))
}

fn post_from_row(row: &PgRow) -> Result<Post, StoreError> {
    let user: Option<Uuid> = decode("post_row", row.try_get("author_user_id"))?;
    let persona: Option<Uuid> = decode("post_row", row.try_get("author_persona_id"))?;
    let author = match (user, persona) {
        (Some(user), None) => PostAuthor::User(user.into()),
        (None, Some(persona)) => PostAuthor::Persona(persona.into()),
        _ => return Err(corrupt("post author", "exactly one author column must be set")),
    };
    let status: String = decode("post_row", row.try_get("status"))?;

    Ok(Post {
        id: PostId::from_uuid(decode("post_row", row.try_get("id"))?),
        author,
        title: decode("post_row", row.try_get("title"))?,
        body: decode("post_row", row.try_get("body"))?,
        status: status.parse().map_err(|e| corrupt("post status", e))?,
        created_at: decode("post_row", row.try_get("created_at"))?,
    })
}

fn persona_from_row(row: &PgRow) -> Result<Persona, StoreError> {
    let limit: Option<i32> = decode("persona_row", row.try_get("daily_reply_limit"))?;
    Ok(Persona {
        id: PersonaId::from_uuid(decode("persona_row", row.try_get("id"))?),
        handle: decode("persona_row", row.try_get("handle"))?,
        display_name: decode("persona_row", row.try_get("display_name"))?,
        style: decode("persona_row", row.try_get("style"))?,
        active: decode("persona_row", row.try_get("active"))?,
        daily_reply_limit: limit
            .map(u32::try_from)
            .transpose()
            .map_err(|e| corrupt("daily_reply_limit", e))?,
        created_at: decode("persona_row", row.try_get("created_at"))?,
    })
}

fn reply_from_row(row: &PgRow) -> Result<Reply, StoreError> {
    Ok(Reply {
        id: decode("reply_row", row.try_get("id"))?,
        post_id: PostId::from_uuid(decode("reply_row", row.try_get("post_id"))?),
        persona_id: PersonaId::from_uuid(decode("reply_row", row.try_get("persona_id"))?),
        body: decode("reply_row", row.try_get("body"))?,
        created_at: decode("reply_row", row.try_get("created_at"))?,
    })
}

fn battle_from_row(row: &PgRow) -> Result<Battle, StoreError> {
    let turn_limit: i32 = decode("battle_row", row.try_get("turn_limit"))?;
    let status: String = decode("battle_row", row.try_get("status"))?;
    let created_by: Option<Uuid> = decode("battle_row", row.try_get("created_by"))?;
    Ok(Battle {
        id: BattleId::from_uuid(decode("battle_row", row.try_get("id"))?),
        topic: decode("battle_row", row.try_get("topic"))?,
        persona_a: PersonaId::from_uuid(decode("battle_row", row.try_get("persona_a"))?),
        persona_b: PersonaId::from_uuid(decode("battle_row", row.try_get("persona_b"))?),
        turn_limit: u32::try_from(turn_limit).map_err(|e| corrupt("turn_limit", e))?,
        status: status.parse().map_err(|e| corrupt("battle status", e))?,
        created_by: created_by.map(Into::into),
        created_at: decode("battle_row", row.try_get("created_at"))?,
    })
}

fn turn_from_row(row: &PgRow) -> Result<BattleTurn, StoreError> {
    let turn_index: i32 = decode("turn_row", row.try_get("turn_index"))?;
    Ok(BattleTurn {
        battle_id: BattleId::from_uuid(decode("turn_row", row.try_get("battle_id"))?),
        turn_index: u32::try_from(turn_index).map_err(|e| corrupt("turn_index", e))?,
        persona_id: PersonaId::from_uuid(decode("turn_row", row.try_get("persona_id"))?),
        body: decode("turn_row", row.try_get("body"))?,
        created_at: decode("turn_row", row.try_get("created_at"))?,
    })
}

fn verdict_from_row(row: &PgRow) -> Result<Verdict, StoreError> {
    let winner: Option<Uuid> = decode("verdict_row", row.try_get("winner_persona_id"))?;
    Ok(Verdict {
        battle_id: BattleId::from_uuid(decode("verdict_row", row.try_get("battle_id"))?),
        winner: winner.map(Into::into),
        reasoning: decode("verdict_row", row.try_get("reasoning"))?,
        created_at: decode("verdict_row", row.try_get("created_at"))?,
    })
}

#[async_trait]
impl ContentStore for PgContentStore {
    async fn get_post(&self, id: PostId) -> Result<Option<Post>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, author_user_id, author_persona_id, title, body, status, created_at
            FROM posts WHERE id = $1
            "#,
        )
        .bind(Uuid::from(id))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_post", e))?;
        row.as_ref().map(post_from_row).transpose()
    }

    async fn get_persona(&self, id: PersonaId) -> Result<Option<Persona>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, handle, display_name, style, active, daily_reply_limit, created_at
            FROM personas WHERE id = $1
            "#,
        )
        .bind(Uuid::from(id))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_persona", e))?;
        row.as_ref().map(persona_from_row).transpose()
    }

    async fn active_personas(&self) -> Result<Vec<Persona>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, handle, display_name, style, active, daily_reply_limit, created_at
            FROM personas WHERE active
            ORDER BY id
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("active_personas", e))?;
        rows.iter().map(persona_from_row).collect()
    }

    async fn replies_for_post(&self, post: PostId) -> Result<Vec<Reply>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, post_id, persona_id, body, created_at
            FROM replies WHERE post_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(Uuid::from(post))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("replies_for_post", e))?;
        rows.iter().map(reply_from_row).collect()
    }

    async fn has_replied(&self, post: PostId, persona: PersonaId) -> Result<bool, StoreError> {
        sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM replies WHERE post_id = $1 AND persona_id = $2)",
        )
        .bind(Uuid::from(post))
        .bind(Uuid::from(persona))
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("has_replied", e))
    }

    #[instrument(
        skip(self, reply, window),
        fields(post_id = %reply.post_id, persona_id = %reply.persona_id),
        err
    )]
    async fn insert_reply_gated(
        &self,
        reply: Reply,
        limit: u32,
        window: QuotaWindow,
    ) -> Result<ReplyInsert, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("insert_reply", e))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO replies (id, post_id, persona_id, body, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (post_id, persona_id) DO NOTHING
            "#,
        )
        .bind(reply.id)
        .bind(Uuid::from(reply.post_id))
        .bind(Uuid::from(reply.persona_id))
        .bind(&reply.body)
        .bind(reply.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_reply", e))?;

        if inserted.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("insert_reply", e))?;
            return Ok(ReplyInsert::Duplicate);
        }

        let decision = consume_in_tx(
            &mut tx,
            reply.persona_id.into(),
            QuotaType::PersonaReply,
            limit,
            window,
            reply.created_at,
        )
        .await?;

        if let QuotaDecision::Denied { used, limit } = decision {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("insert_reply", e))?;
            return Ok(ReplyInsert::QuotaExceeded { used, limit });
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("insert_reply", e))?;
        Ok(ReplyInsert::Inserted(reply))
    }

    async fn get_battle(&self, id: BattleId) -> Result<Option<Battle>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, topic, persona_a, persona_b, turn_limit, status, created_by, created_at
            FROM battles WHERE id = $1
            "#,
        )
        .bind(Uuid::from(id))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_battle", e))?;
        row.as_ref().map(battle_from_row).transpose()
    }

    async fn battle_turns(&self, battle: BattleId) -> Result<Vec<BattleTurn>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT battle_id, turn_index, persona_id, body, created_at
            FROM battle_turns WHERE battle_id = $1
            ORDER BY turn_index
            "#,
        )
        .bind(Uuid::from(battle))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("battle_turns", e))?;
        rows.iter().map(turn_from_row).collect()
    }

    async fn insert_turn(&self, turn: BattleTurn) -> Result<Insert<BattleTurn>, StoreError> {
        let turn_index =
            i32::try_from(turn.turn_index).map_err(|e| corrupt("turn_index", e))?;
        let result = sqlx::query(
            r#"
            INSERT INTO battle_turns (battle_id, turn_index, persona_id, body, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (battle_id, turn_index) DO NOTHING
            "#,
        )
        .bind(Uuid::from(turn.battle_id))
        .bind(turn_index)
        .bind(Uuid::from(turn.persona_id))
        .bind(&turn.body)
        .bind(turn.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_turn", e))?;

        Ok(if result.rows_affected() == 0 {
            Insert::Duplicate
        } else {
            Insert::Inserted(turn)
        })
    }

    async fn set_battle_status(
        &self,
        battle: BattleId,
        status: BattleStatus,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE battles SET status = $2 WHERE id = $1")
            .bind(Uuid::from(battle))
            .bind(status.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("set_battle_status", e))?;
        Ok(())
    }

    async fn get_verdict(&self, battle: BattleId) -> Result<Option<Verdict>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT battle_id, winner_persona_id, reasoning, created_at
            FROM battle_verdicts WHERE battle_id = $1
            "#,
        )
        .bind(Uuid::from(battle))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_verdict", e))?;
        row.as_ref().map(verdict_from_row).transpose()
    }

    #[instrument(skip(self, verdict), fields(battle_id = %verdict.battle_id), err)]
    async fn insert_verdict(&self, verdict: Verdict) -> Result<Insert<Verdict>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("insert_verdict", e))?;

        let result = sqlx::query(
            r#"
            INSERT INTO battle_verdicts (battle_id, winner_persona_id, reasoning, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (battle_id) DO NOTHING
            "#,
        )
        .bind(Uuid::from(verdict.battle_id))
        .bind(verdict.winner.map(Uuid::from))
        .bind(&verdict.reasoning)
        .bind(verdict.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_verdict", e))?;

        let outcome = if result.rows_affected() == 0 {
            Insert::Duplicate
        } else {
            Insert::Inserted(verdict.clone())
        };

        sqlx::query("UPDATE battles SET status = $2 WHERE id = $1")
            .bind(Uuid::from(verdict.battle_id))
            .bind(BattleStatus::Closed.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_verdict", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("insert_verdict", e))?;
        Ok(outcome)
    }
}
