//! Postgres quota ledger.
//!
//! Consumers of the same `(actor, quota_type)` are serialised with a
//! transaction-scoped advisory lock taken before the count, so the
//! count-compare-insert sequence cannot interleave. Different actors never
//! contend.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use sqlx::{PgConnection, PgPool};
use tracing::instrument;
use uuid::Uuid;

use crate::error::{map_sqlx_error, StoreError};

use super::{QuotaDecision, QuotaLedger, QuotaType, QuotaWindow};

#[derive(Debug, Clone)]
pub struct PgQuotaLedger {
    pool: Arc<PgPool>,
    utc_offset: FixedOffset,
}

impl PgQuotaLedger {
    pub fn new(pool: PgPool, utc_offset: FixedOffset) -> Self {
        Self {
            pool: Arc::new(pool),
            utc_offset,
        }
    }
}

/// Lock, count and (if allowed) append inside the caller's transaction.
///
/// The gated action must run in the same transaction; rolling it back also
/// rolls back the consumption.
pub(crate) async fn consume_in_tx(
    conn: &mut PgConnection,
    actor: Uuid,
    quota: QuotaType,
    limit: u32,
    window: QuotaWindow,
    now: DateTime<Utc>,
) -> Result<QuotaDecision, StoreError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(format!("quota:{}:{}", quota.as_str(), actor))
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("quota_lock", e))?;

    let used = count_in(&mut *conn, actor, quota, window).await?;
    let decision = QuotaDecision::evaluate(used, limit);

    if decision.is_allowed() {
        sqlx::query(
            r#"
            INSERT INTO quota_events (id, actor_ref, quota_type, occurred_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(actor)
        .bind(quota.as_str())
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("quota_insert", e))?;
    }

    Ok(decision)
}

async fn count_in(
    conn: &mut PgConnection,
    actor: Uuid,
    quota: QuotaType,
    window: QuotaWindow,
) -> Result<u32, StoreError> {
    let used: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM quota_events
        WHERE actor_ref = $1
          AND quota_type = $2
          AND occurred_at >= $3
          AND occurred_at < $4
        "#,
    )
    .bind(actor)
    .bind(quota.as_str())
    .bind(window.start)
    .bind(window.end)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("quota_count", e))?;

    Ok(u32::try_from(used.max(0)).unwrap_or(u32::MAX))
}

#[async_trait]
impl QuotaLedger for PgQuotaLedger {
    #[instrument(skip(self), fields(quota = quota.as_str()), err)]
    async fn try_consume(
        &self,
        actor: Uuid,
        quota: QuotaType,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision, StoreError> {
        let window = QuotaWindow::day_containing(now, self.utc_offset);
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("try_consume", e))?;

        let decision = consume_in_tx(&mut tx, actor, quota, limit, window, now).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("try_consume", e))?;
        Ok(decision)
    }

    #[instrument(skip(self), fields(quota = quota.as_str()), err)]
    async fn usage(
        &self,
        actor: Uuid,
        quota: QuotaType,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let window = QuotaWindow::day_containing(now, self.utc_offset);
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("usage", e))?;
        count_in(&mut conn, actor, quota, window).await
    }
}
