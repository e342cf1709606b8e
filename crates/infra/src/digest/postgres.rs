//! Postgres activity store.
//!
//! Activity is derived from the content tables:
//!
//! | Kind | Subjects | Activity |
//! |------|----------|----------|
//! | `persona_daily` | active personas | replies written, battle turns spoken |
//! | `user_weekly` | users | replies received on the user's posts |
//!
//! An item's score is the size of the conversation it belongs to (replies on
//! the same post, turns in the same battle).
//!
//! Stale subjects are ordered by their last attempt, the later of the digest's
//! `updated_at` and the `digest_deferrals` row left by a transient failure.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use crate::error::{map_sqlx_error, StoreError};

use super::{ActivityItem, ActivityStore, Digest, DigestKind, DigestPeriod};

/// Characters of an artifact body kept as the activity excerpt.
const EXCERPT_CHARS: i32 = 280;

const PERSONA_STALE: &str = r#"
    WITH latest AS (
        SELECT persona_id AS subject_id, MAX(created_at) AS latest, COUNT(*) AS total
        FROM (
            SELECT persona_id, created_at FROM replies
            WHERE created_at >= $3 AND created_at < $4
            UNION ALL
            SELECT persona_id, created_at FROM battle_turns
            WHERE created_at >= $3 AND created_at < $4
        ) activity
        GROUP BY persona_id
    )
    SELECT s.id
    FROM personas s
    LEFT JOIN latest l ON l.subject_id = s.id
    LEFT JOIN digests d
        ON d.kind = $1 AND d.subject_id = s.id AND d.period_key = $2
    LEFT JOIN digest_deferrals f
        ON f.kind = $1 AND f.subject_id = s.id AND f.period_key = $2
    WHERE s.active
      AND (d.subject_id IS NULL
           OR COALESCE(l.total, 0) <> d.activity_count
           OR (l.latest IS NOT NULL
               AND (d.last_activity_at IS NULL OR l.latest > d.last_activity_at)))
    ORDER BY GREATEST(d.updated_at, f.deferred_at) ASC NULLS FIRST, s.id
    LIMIT 1
"#;

const USER_STALE: &str = r#"
    WITH latest AS (
        SELECT p.author_user_id AS subject_id, MAX(r.created_at) AS latest,
               COUNT(*) AS total
        FROM replies r
        JOIN posts p ON p.id = r.post_id
        WHERE p.author_user_id IS NOT NULL
          AND r.created_at >= $3 AND r.created_at < $4
        GROUP BY p.author_user_id
    )
    SELECT s.id
    FROM users s
    LEFT JOIN latest l ON l.subject_id = s.id
    LEFT JOIN digests d
        ON d.kind = $1 AND d.subject_id = s.id AND d.period_key = $2
    LEFT JOIN digest_deferrals f
        ON f.kind = $1 AND f.subject_id = s.id AND f.period_key = $2
    WHERE d.subject_id IS NULL
       OR COALESCE(l.total, 0) <> d.activity_count
       OR (l.latest IS NOT NULL
           AND (d.last_activity_at IS NULL OR l.latest > d.last_activity_at))
    ORDER BY GREATEST(d.updated_at, f.deferred_at) ASC NULLS FIRST, s.id
    LIMIT 1
"#;

const PERSONA_COUNT: &str = r#"
    SELECT (SELECT COUNT(*) FROM replies
            WHERE persona_id = $1 AND created_at >= $2 AND created_at < $3)
         + (SELECT COUNT(*) FROM battle_turns
            WHERE persona_id = $1 AND created_at >= $2 AND created_at < $3)
"#;

const USER_COUNT: &str = r#"
    SELECT COUNT(*)
    FROM replies r
    JOIN posts p ON p.id = r.post_id
    WHERE p.author_user_id = $1 AND r.created_at >= $2 AND r.created_at < $3
"#;

const PERSONA_ACTIVITY: &str = r#"
    SELECT ref_id, kind, excerpt, score, occurred_at
    FROM (
        SELECT r.id AS ref_id, 'reply' AS kind, left(r.body, $5) AS excerpt,
               (SELECT COUNT(*) FROM replies s WHERE s.post_id = r.post_id) AS score,
               r.created_at AS occurred_at
        FROM replies r
        WHERE r.persona_id = $1 AND r.created_at >= $2 AND r.created_at < $3
        UNION ALL
        SELECT t.battle_id, 'battle_turn', left(t.body, $5),
               (SELECT COUNT(*) FROM battle_turns s WHERE s.battle_id = t.battle_id),
               t.created_at
        FROM battle_turns t
        WHERE t.persona_id = $1 AND t.created_at >= $2 AND t.created_at < $3
    ) activity
    ORDER BY occurred_at DESC
    LIMIT $4
"#;

const USER_ACTIVITY: &str = r#"
    SELECT r.id AS ref_id, 'reply_received' AS kind, left(r.body, $5) AS excerpt,
           (SELECT COUNT(*) FROM replies s WHERE s.post_id = r.post_id) AS score,
           r.created_at AS occurred_at
    FROM replies r
    JOIN posts p ON p.id = r.post_id
    WHERE p.author_user_id = $1 AND r.created_at >= $2 AND r.created_at < $3
    ORDER BY r.created_at DESC
    LIMIT $4
"#;

#[derive(Debug, Clone)]
pub struct PgActivityStore {
    pool: Arc<PgPool>,
}

impl PgActivityStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn corrupt(what: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("{what}: {err}"))
}

fn item_from_row(row: &PgRow) -> Result<ActivityItem, StoreError> {
    let get = |e| map_sqlx_error("activity_row", e);
    let kind: String = row.try_get("kind").map_err(get)?;
    Ok(ActivityItem {
        ref_id: row.try_get("ref_id").map_err(get)?,
        kind: kind.parse().map_err(|e| corrupt("activity kind", e))?,
        excerpt: row.try_get("excerpt").map_err(get)?,
        score: row.try_get("score").map_err(get)?,
        occurred_at: row.try_get("occurred_at").map_err(get)?,
    })
}

fn digest_from_row(row: &PgRow) -> Result<Digest, StoreError> {
    let get = |e| map_sqlx_error("digest_row", e);
    let kind: String = row.try_get("kind").map_err(get)?;
    let source: String = row.try_get("source").map_err(get)?;
    let stats: serde_json::Value = row.try_get("stats").map_err(get)?;
    let highlights: serde_json::Value = row.try_get("highlights").map_err(get)?;
    Ok(Digest {
        kind: kind.parse().map_err(|e| corrupt("digest kind", e))?,
        subject_id: row.try_get("subject_id").map_err(get)?,
        period_key: row.try_get("period_key").map_err(get)?,
        stats: serde_json::from_value(stats).map_err(|e| corrupt("digest stats", e))?,
        highlights: serde_json::from_value(highlights)
            .map_err(|e| corrupt("digest highlights", e))?,
        summary: row.try_get("summary").map_err(get)?,
        source: source.parse().map_err(|e| corrupt("digest source", e))?,
        last_activity_at: row.try_get("last_activity_at").map_err(get)?,
        activity_count: row.try_get("activity_count").map_err(get)?,
        updated_at: row.try_get("updated_at").map_err(get)?,
    })
}

#[async_trait]
impl ActivityStore for PgActivityStore {
    #[instrument(skip(self, period), fields(kind = kind.as_str(), period = %period.key), err)]
    async fn next_stale_subject(
        &self,
        kind: DigestKind,
        period: &DigestPeriod,
    ) -> Result<Option<Uuid>, StoreError> {
        let sql = match kind {
            DigestKind::PersonaDaily => PERSONA_STALE,
            DigestKind::UserWeekly => USER_STALE,
        };
        sqlx::query_scalar(sql)
            .bind(kind.as_str())
            .bind(period.key)
            .bind(period.start)
            .bind(period.end)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("next_stale_subject", e))
    }

    async fn count_activity(
        &self,
        kind: DigestKind,
        subject: Uuid,
        period: &DigestPeriod,
    ) -> Result<i64, StoreError> {
        let sql = match kind {
            DigestKind::PersonaDaily => PERSONA_COUNT,
            DigestKind::UserWeekly => USER_COUNT,
        };
        sqlx::query_scalar(sql)
            .bind(subject)
            .bind(period.start)
            .bind(period.end)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_activity", e))
    }

    async fn load_activity(
        &self,
        kind: DigestKind,
        subject: Uuid,
        period: &DigestPeriod,
        limit: usize,
    ) -> Result<Vec<ActivityItem>, StoreError> {
        let sql = match kind {
            DigestKind::PersonaDaily => PERSONA_ACTIVITY,
            DigestKind::UserWeekly => USER_ACTIVITY,
        };
        let rows = sqlx::query(sql)
            .bind(subject)
            .bind(period.start)
            .bind(period.end)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .bind(EXCERPT_CHARS)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_activity", e))?;
        rows.iter().map(item_from_row).collect()
    }

    async fn get_digest(
        &self,
        kind: DigestKind,
        subject: Uuid,
        period_key: NaiveDate,
    ) -> Result<Option<Digest>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT kind, subject_id, period_key, stats, highlights, summary, source,
                   last_activity_at, activity_count, updated_at
            FROM digests
            WHERE kind = $1 AND subject_id = $2 AND period_key = $3
            "#,
        )
        .bind(kind.as_str())
        .bind(subject)
        .bind(period_key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_digest", e))?;
        row.as_ref().map(digest_from_row).transpose()
    }

    #[instrument(
        skip(self, digest),
        fields(kind = digest.kind.as_str(), subject_id = %digest.subject_id),
        err
    )]
    async fn upsert_digest(&self, digest: &Digest) -> Result<(), StoreError> {
        let stats = serde_json::to_value(&digest.stats).map_err(|e| corrupt("digest stats", e))?;
        let highlights = serde_json::to_value(&digest.highlights)
            .map_err(|e| corrupt("digest highlights", e))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("upsert_digest", e))?;

        sqlx::query(
            r#"
            INSERT INTO digests (kind, subject_id, period_key, stats, highlights, summary,
                                 source, last_activity_at, activity_count, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (kind, subject_id, period_key) DO UPDATE
            SET stats = EXCLUDED.stats,
                highlights = EXCLUDED.highlights,
                summary = EXCLUDED.summary,
                source = EXCLUDED.source,
                last_activity_at = EXCLUDED.last_activity_at,
                activity_count = EXCLUDED.activity_count,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(digest.kind.as_str())
        .bind(digest.subject_id)
        .bind(digest.period_key)
        .bind(stats)
        .bind(highlights)
        .bind(&digest.summary)
        .bind(digest.source.as_str())
        .bind(digest.last_activity_at)
        .bind(digest.activity_count)
        .bind(digest.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("upsert_digest", e))?;

        sqlx::query(
            "DELETE FROM digest_deferrals WHERE kind = $1 AND subject_id = $2 AND period_key = $3",
        )
        .bind(digest.kind.as_str())
        .bind(digest.subject_id)
        .bind(digest.period_key)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("upsert_digest", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("upsert_digest", e))?;
        Ok(())
    }

    async fn record_deferral(
        &self,
        kind: DigestKind,
        subject: Uuid,
        period_key: NaiveDate,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO digest_deferrals (kind, subject_id, period_key, deferred_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (kind, subject_id, period_key) DO UPDATE
            SET deferred_at = EXCLUDED.deferred_at
            "#,
        )
        .bind(kind.as_str())
        .bind(subject)
        .bind(period_key)
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_deferral", e))?;
        Ok(())
    }
}
