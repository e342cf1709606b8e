//! Bundled schema.

use sqlx::PgPool;
use tracing::info;

use crate::error::{map_sqlx_error, StoreError};

/// Schema statements; every statement is `IF NOT EXISTS`.
pub const INIT_SQL: &str = include_str!("../migrations/0001_init.sql");

/// Apply the bundled schema. Safe to run on every start.
pub async fn apply(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::raw_sql(INIT_SQL)
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("apply_schema", e))?;
    info!("schema applied");
    Ok(())
}
