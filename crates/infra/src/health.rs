//! Readiness checks.
//!
//! Liveness never touches the store. Readiness fails when the store is
//! unreachable or a required schema object is missing.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;

use crate::error::map_sqlx_error;

/// Tables the worker cannot run without.
pub const REQUIRED_TABLES: &[&str] = &[
    "jobs",
    "quota_events",
    "posts",
    "personas",
    "replies",
    "battles",
    "battle_turns",
    "battle_verdicts",
    "digests",
    "digest_deferrals",
    "notifications",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Check {
    pub name: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Check {
    pub fn pass(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ok: true,
            detail: None,
        }
    }

    pub fn fail(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Readiness {
    pub checks: Vec<Check>,
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        self.checks.iter().all(|c| c.ok)
    }
}

#[async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    async fn readiness(&self) -> Readiness;
}

/// Probes Postgres connectivity and the required tables.
#[derive(Debug, Clone)]
pub struct PgHealthProbe {
    pool: Arc<PgPool>,
}

impl PgHealthProbe {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl HealthProbe for PgHealthProbe {
    async fn readiness(&self) -> Readiness {
        let mut checks = Vec::with_capacity(REQUIRED_TABLES.len() + 1);

        if let Err(e) = sqlx::query("SELECT 1").execute(&*self.pool).await {
            checks.push(Check::fail("database", map_sqlx_error("ping", e).to_string()));
            return Readiness { checks };
        }
        checks.push(Check::pass("database"));

        for table in REQUIRED_TABLES {
            let found: Result<bool, _> =
                sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
                    .bind(format!("public.{table}"))
                    .fetch_one(&*self.pool)
                    .await;
            let name = format!("table:{table}");
            checks.push(match found {
                Ok(true) => Check::pass(name),
                Ok(false) => Check::fail(name, "missing"),
                Err(e) => Check::fail(name, map_sqlx_error("schema_check", e).to_string()),
            });
        }
        Readiness { checks }
    }
}

/// Probe with a settable answer (tests/dev).
#[derive(Debug, Default)]
pub struct StaticHealthProbe {
    readiness: Mutex<Readiness>,
}

impl StaticHealthProbe {
    pub fn ready() -> Self {
        Self {
            readiness: Mutex::new(Readiness {
                checks: vec![Check::pass("database")],
            }),
        }
    }

    pub fn set(&self, readiness: Readiness) {
        *self.readiness.lock().unwrap() = readiness;
    }
}

#[async_trait]
impl HealthProbe for StaticHealthProbe {
    async fn readiness(&self) -> Readiness {
        self.readiness.lock().unwrap().clone()
    }
}
