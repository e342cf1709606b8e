//! Quota guard over an append-only consumption ledger.
//!
//! `try_consume` counts the actor's events inside the current window and
//! appends a new one only if the count is below the limit, atomically with
//! respect to concurrent calls for the same actor and quota type.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

mod postgres;

pub use postgres::PgQuotaLedger;
pub(crate) use postgres::consume_in_tx;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaType {
    /// Replies generated by one persona.
    PersonaReply,
    /// Posts created by one user (consumed by the request layer).
    UserPost,
}

impl QuotaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaType::PersonaReply => "persona_reply",
            QuotaType::UserPost => "user_post",
        }
    }
}

/// Configured daily limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaLimits {
    /// Offset of the timezone whose calendar day is the quota window.
    pub utc_offset: FixedOffset,
    pub persona_replies_per_day: u32,
    pub user_posts_per_day: u32,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            utc_offset: Utc.fix(),
            persona_replies_per_day: 20,
            user_posts_per_day: 10,
        }
    }
}

impl QuotaLimits {
    pub fn limit_for(&self, quota: QuotaType) -> u32 {
        match quota {
            QuotaType::PersonaReply => self.persona_replies_per_day,
            QuotaType::UserPost => self.user_posts_per_day,
        }
    }

    pub fn window_at(&self, now: DateTime<Utc>) -> QuotaWindow {
        QuotaWindow::day_containing(now, self.utc_offset)
    }
}

/// Half-open `[start, end)` interval the ledger counts over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl QuotaWindow {
    /// The calendar day containing `now` in the given fixed offset.
    pub fn day_containing(now: DateTime<Utc>, offset: FixedOffset) -> Self {
        let local_midnight = now
            .with_timezone(&offset)
            .date_naive()
            .and_time(NaiveTime::MIN);
        let start = offset
            .from_local_datetime(&local_midnight)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
            // A fixed offset has no gaps or folds.
            .unwrap_or(now);
        Self {
            start,
            end: start + Duration::days(1),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Allowed { used: u32, limit: u32 },
    Denied { used: u32, limit: u32 },
}

impl QuotaDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, QuotaDecision::Allowed { .. })
    }

    fn evaluate(used: u32, limit: u32) -> Self {
        if used < limit {
            QuotaDecision::Allowed {
                used: used + 1,
                limit,
            }
        } else {
            QuotaDecision::Denied { used, limit }
        }
    }
}

/// Append-only ledger of rate-limited actions.
#[async_trait]
pub trait QuotaLedger: Send + Sync + 'static {
    /// Atomically check the limit and record one consumption.
    async fn try_consume(
        &self,
        actor: Uuid,
        quota: QuotaType,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision, StoreError>;

    /// Consumptions in the window containing `now` (read-only).
    async fn usage(
        &self,
        actor: Uuid,
        quota: QuotaType,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct QuotaEvent {
    actor: Uuid,
    quota: QuotaType,
    at: DateTime<Utc>,
}

/// In-memory ledger for tests/dev; one mutex serialises every consumer.
#[derive(Debug)]
pub struct InMemoryQuotaLedger {
    utc_offset: FixedOffset,
    events: Mutex<Vec<QuotaEvent>>,
}

impl Default for InMemoryQuotaLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQuotaLedger {
    pub fn new() -> Self {
        Self {
            utc_offset: QuotaLimits::default().utc_offset,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn with_utc_offset(mut self, offset: FixedOffset) -> Self {
        self.utc_offset = offset;
        self
    }

    fn count(events: &[QuotaEvent], actor: Uuid, quota: QuotaType, window: QuotaWindow) -> u32 {
        events
            .iter()
            .filter(|e| e.actor == actor && e.quota == quota && window.contains(e.at))
            .count() as u32
    }

    /// Synchronous check-and-append, for callers that already hold their own
    /// lock around the gated action.
    pub(crate) fn consume_in(
        &self,
        actor: Uuid,
        quota: QuotaType,
        limit: u32,
        window: QuotaWindow,
        now: DateTime<Utc>,
    ) -> QuotaDecision {
        let mut events = self.events.lock().unwrap();
        let decision = QuotaDecision::evaluate(Self::count(&events, actor, quota, window), limit);
        if decision.is_allowed() {
            events.push(QuotaEvent {
                actor,
                quota,
                at: now,
            });
        }
        decision
    }
}

#[async_trait]
impl QuotaLedger for InMemoryQuotaLedger {
    async fn try_consume(
        &self,
        actor: Uuid,
        quota: QuotaType,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision, StoreError> {
        let window = QuotaWindow::day_containing(now, self.utc_offset);
        Ok(self.consume_in(actor, quota, limit, window, now))
    }

    async fn usage(
        &self,
        actor: Uuid,
        quota: QuotaType,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let window = QuotaWindow::day_containing(now, self.utc_offset);
        let events = self.events.lock().unwrap();
        Ok(Self::count(&events, actor, quota, window))
    }
}
