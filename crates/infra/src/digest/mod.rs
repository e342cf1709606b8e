//! Periodic activity digests.
//!
//! A digest is keyed by `(kind, subject, period)` and written only by its
//! aggregator. It is stale when no row exists for the current period, when
//! the period's activity count differs from the stored `activity_count`, or
//! when activity newer than the stored `last_activity_at` watermark exists.
//! The count catches rows committed late with an older timestamp.
//!
//! A transient generation failure records a deferral for the subject, which
//! moves it behind every subject that was attempted less recently.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use chorus_core::DomainError;

use crate::error::StoreError;

mod aggregator;
mod postgres;

pub use aggregator::{DigestAggregator, Refresh};
pub use postgres::PgActivityStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestKind {
    /// What one persona did during a calendar day.
    PersonaDaily,
    /// Replies one user's posts received during an ISO week.
    UserWeekly,
}

impl DigestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestKind::PersonaDaily => "persona_daily",
            DigestKind::UserWeekly => "user_weekly",
        }
    }
}

impl std::str::FromStr for DigestKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "persona_daily" => Ok(DigestKind::PersonaDaily),
            "user_weekly" => Ok(DigestKind::UserWeekly),
            other => Err(DomainError::validation(format!("unknown digest kind: {other}"))),
        }
    }
}

/// The period a digest covers: `[start, end)`, keyed by its first local day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigestPeriod {
    pub key: NaiveDate,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DigestPeriod {
    /// Period of `kind` containing `now`: the local day, or the ISO week
    /// starting on Monday.
    pub fn containing(kind: DigestKind, now: DateTime<Utc>, offset: FixedOffset) -> Self {
        let today = now.with_timezone(&offset).date_naive();
        let (key, days) = match kind {
            DigestKind::PersonaDaily => (today, 1),
            DigestKind::UserWeekly => (
                today - Duration::days(i64::from(today.weekday().num_days_from_monday())),
                7,
            ),
        };
        let start = offset
            .from_local_datetime(&key.and_time(NaiveTime::MIN))
            .single()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(now);
        Self {
            key,
            start,
            end: start + Duration::days(days),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    /// A reply written by the persona.
    Reply,
    /// A battle turn spoken by the persona.
    BattleTurn,
    /// A reply received on one of the user's posts.
    ReplyReceived,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Reply => "reply",
            ActivityKind::BattleTurn => "battle_turn",
            ActivityKind::ReplyReceived => "reply_received",
        }
    }
}

impl std::str::FromStr for ActivityKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reply" => Ok(ActivityKind::Reply),
            "battle_turn" => Ok(ActivityKind::BattleTurn),
            "reply_received" => Ok(ActivityKind::ReplyReceived),
            other => Err(DomainError::validation(format!("unknown activity kind: {other}"))),
        }
    }
}

/// One qualifying event inside a digest period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityItem {
    /// The artifact (reply, turn) the event refers to.
    pub ref_id: Uuid,
    pub kind: ActivityKind,
    pub excerpt: String,
    /// Ranking weight: size of the conversation the item took part in.
    pub score: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestStats {
    pub total: u32,
    pub by_kind: BTreeMap<String, u32>,
    pub first_at: Option<DateTime<Utc>>,
    pub last_at: Option<DateTime<Utc>>,
}

impl DigestStats {
    pub fn compute(items: &[ActivityItem]) -> Self {
        let mut by_kind = BTreeMap::new();
        for item in items {
            *by_kind.entry(item.kind.as_str().to_string()).or_insert(0) += 1;
        }
        Self {
            total: u32::try_from(items.len()).unwrap_or(u32::MAX),
            by_kind,
            first_at: items.iter().map(|i| i.occurred_at).min(),
            last_at: items.iter().map(|i| i.occurred_at).max(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Highlight {
    pub ref_id: Uuid,
    pub kind: ActivityKind,
    pub excerpt: String,
    pub score: i64,
}

/// The `k` highest-scoring items; ties go to the newer item, then the
/// smaller id.
pub fn top_highlights(items: &[ActivityItem], k: usize) -> Vec<Highlight> {
    let mut ranked: Vec<&ActivityItem> = items.iter().collect();
    ranked.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then(b.occurred_at.cmp(&a.occurred_at))
            .then(a.ref_id.cmp(&b.ref_id))
    });
    ranked
        .into_iter()
        .take(k)
        .map(|item| Highlight {
            ref_id: item.ref_id,
            kind: item.kind,
            excerpt: item.excerpt.clone(),
            score: item.score,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestSource {
    Generated,
    /// Deterministic text; no (usable) model output.
    Fallback,
}

impl DigestSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestSource::Generated => "generated",
            DigestSource::Fallback => "fallback",
        }
    }
}

impl std::str::FromStr for DigestSource {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generated" => Ok(DigestSource::Generated),
            "fallback" => Ok(DigestSource::Fallback),
            other => Err(DomainError::validation(format!("unknown digest source: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digest {
    pub kind: DigestKind,
    pub subject_id: Uuid,
    pub period_key: NaiveDate,
    pub stats: DigestStats,
    pub highlights: Vec<Highlight>,
    pub summary: String,
    pub source: DigestSource,
    /// Newest activity the digest accounts for (staleness watermark).
    pub last_activity_at: Option<DateTime<Utc>>,
    /// Items in the period when the digest was built, beyond the load limit.
    pub activity_count: i64,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait ActivityStore: Send + Sync + 'static {
    /// One subject whose digest for `period` is missing or behind its
    /// activity, least recently attempted (refreshed or deferred) first.
    async fn next_stale_subject(
        &self,
        kind: DigestKind,
        period: &DigestPeriod,
    ) -> Result<Option<Uuid>, StoreError>;

    /// Number of activity items of `subject` inside `period`.
    async fn count_activity(
        &self,
        kind: DigestKind,
        subject: Uuid,
        period: &DigestPeriod,
    ) -> Result<i64, StoreError>;

    /// The newest `limit` activity items of `subject` inside `period`.
    async fn load_activity(
        &self,
        kind: DigestKind,
        subject: Uuid,
        period: &DigestPeriod,
        limit: usize,
    ) -> Result<Vec<ActivityItem>, StoreError>;

    async fn get_digest(
        &self,
        kind: DigestKind,
        subject: Uuid,
        period_key: NaiveDate,
    ) -> Result<Option<Digest>, StoreError>;

    /// Writes the digest and clears any deferral for its key.
    async fn upsert_digest(&self, digest: &Digest) -> Result<(), StoreError>;

    /// Marks an attempt on a subject that left it stale.
    async fn record_deferral(
        &self,
        kind: DigestKind,
        subject: Uuid,
        period_key: NaiveDate,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct ActivityState {
    subjects: BTreeMap<DigestKind, Vec<Uuid>>,
    activity: Vec<(DigestKind, Uuid, ActivityItem)>,
    digests: HashMap<(DigestKind, Uuid, NaiveDate), Digest>,
    deferrals: HashMap<(DigestKind, Uuid, NaiveDate), DateTime<Utc>>,
}

/// In-memory activity store (tests/dev). Subjects are registered explicitly.
#[derive(Debug, Default)]
pub struct InMemoryActivityStore {
    state: Mutex<ActivityState>,
}

impl InMemoryActivityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: DigestKind, subject: Uuid) {
        let mut state = self.state.lock().unwrap();
        let subjects = state.subjects.entry(kind).or_default();
        if !subjects.contains(&subject) {
            subjects.push(subject);
            subjects.sort();
        }
    }

    pub fn record(&self, kind: DigestKind, subject: Uuid, item: ActivityItem) {
        self.register(kind, subject);
        self.state
            .lock()
            .unwrap()
            .activity
            .push((kind, subject, item));
    }

    pub fn digests(&self) -> Vec<Digest> {
        self.state.lock().unwrap().digests.values().cloned().collect()
    }

    fn in_period<'a>(
        state: &'a ActivityState,
        kind: DigestKind,
        subject: Uuid,
        period: &'a DigestPeriod,
    ) -> impl Iterator<Item = &'a ActivityItem> + 'a {
        state
            .activity
            .iter()
            .filter(move |(k, s, item)| {
                *k == kind && *s == subject && period.contains(item.occurred_at)
            })
            .map(|(_, _, item)| item)
    }
}

#[async_trait]
impl ActivityStore for InMemoryActivityStore {
    async fn next_stale_subject(
        &self,
        kind: DigestKind,
        period: &DigestPeriod,
    ) -> Result<Option<Uuid>, StoreError> {
        let state = self.state.lock().unwrap();
        let Some(subjects) = state.subjects.get(&kind) else {
            return Ok(None);
        };

        let mut stale: Vec<(Option<DateTime<Utc>>, Uuid)> = subjects
            .iter()
            .filter_map(|subject| {
                let key = (kind, *subject, period.key);
                let digest = state.digests.get(&key);
                let is_stale = match digest {
                    None => true,
                    Some(d) => {
                        let count = Self::in_period(&state, kind, *subject, period).count();
                        let latest = Self::in_period(&state, kind, *subject, period)
                            .map(|i| i.occurred_at)
                            .max();
                        i64::try_from(count).unwrap_or(i64::MAX) != d.activity_count
                            || (latest.is_some() && latest > d.last_activity_at)
                    }
                };
                let attempted = digest
                    .map(|d| d.updated_at)
                    .max(state.deferrals.get(&key).copied());
                is_stale.then_some((attempted, *subject))
            })
            .collect();
        // Never-attempted subjects (None) sort first.
        stale.sort();
        Ok(stale.first().map(|(_, subject)| *subject))
    }

    async fn count_activity(
        &self,
        kind: DigestKind,
        subject: Uuid,
        period: &DigestPeriod,
    ) -> Result<i64, StoreError> {
        let state = self.state.lock().unwrap();
        let count = Self::in_period(&state, kind, subject, period).count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn load_activity(
        &self,
        kind: DigestKind,
        subject: Uuid,
        period: &DigestPeriod,
        limit: usize,
    ) -> Result<Vec<ActivityItem>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut items: Vec<_> = Self::in_period(&state, kind, subject, period)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        items.truncate(limit);
        Ok(items)
    }

    async fn get_digest(
        &self,
        kind: DigestKind,
        subject: Uuid,
        period_key: NaiveDate,
    ) -> Result<Option<Digest>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.digests.get(&(kind, subject, period_key)).cloned())
    }

    async fn upsert_digest(&self, digest: &Digest) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let key = (digest.kind, digest.subject_id, digest.period_key);
        state.deferrals.remove(&key);
        state.digests.insert(key, digest.clone());
        Ok(())
    }

    async fn record_deferral(
        &self,
        kind: DigestKind,
        subject: Uuid,
        period_key: NaiveDate,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.state
            .lock()
            .unwrap()
            .deferrals
            .insert((kind, subject, period_key), at);
        Ok(())
    }
}
