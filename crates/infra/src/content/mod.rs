//! Content the executors read and the artifacts they write.
//!
//! Artifacts (replies, battle turns, verdicts) are created through checked
//! insert outcomes: a uniqueness violation comes back as `Duplicate`, never
//! as an error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use chorus_core::{BattleId, DomainError, PersonaId, PostId, UserId};

use crate::error::StoreError;
use crate::quota::QuotaWindow;

mod in_memory;
mod postgres;

pub use in_memory::InMemoryContentStore;
pub use postgres::PgContentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum PostAuthor {
    User(UserId),
    Persona(PersonaId),
}

impl PostAuthor {
    pub fn persona(&self) -> Option<PersonaId> {
        match self {
            PostAuthor::Persona(id) => Some(*id),
            PostAuthor::User(_) => None,
        }
    }

    pub fn user(&self) -> Option<UserId> {
        match self {
            PostAuthor::User(id) => Some(*id),
            PostAuthor::Persona(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    Draft,
    Published,
    Archived,
    Deleted,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Draft => "draft",
            PostStatus::Published => "published",
            PostStatus::Archived => "archived",
            PostStatus::Deleted => "deleted",
        }
    }
}

impl std::str::FromStr for PostStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(PostStatus::Draft),
            "published" => Ok(PostStatus::Published),
            "archived" => Ok(PostStatus::Archived),
            "deleted" => Ok(PostStatus::Deleted),
            other => Err(DomainError::validation(format!("unknown post status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,
    pub author: PostAuthor,
    pub title: String,
    pub body: String,
    pub status: PostStatus,
    pub created_at: DateTime<Utc>,
}

impl Post {
    pub fn new(
        author: PostAuthor,
        title: impl Into<String>,
        body: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PostId::new(),
            author,
            title: title.into(),
            body: body.into(),
            status: PostStatus::Draft,
            created_at: now,
        }
    }

    pub fn with_status(mut self, status: PostStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_published(&self) -> bool {
        self.status == PostStatus::Published
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persona {
    pub id: PersonaId,
    pub handle: String,
    pub display_name: String,
    /// Free-text voice/style instructions used in prompts.
    pub style: String,
    pub active: bool,
    /// Overrides the configured daily reply limit.
    pub daily_reply_limit: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl Persona {
    pub fn new(handle: impl Into<String>, style: impl Into<String>, now: DateTime<Utc>) -> Self {
        let handle = handle.into();
        Self {
            id: PersonaId::new(),
            display_name: handle.clone(),
            handle,
            style: style.into(),
            active: true,
            daily_reply_limit: None,
            created_at: now,
        }
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn with_daily_reply_limit(mut self, limit: u32) -> Self {
        self.daily_reply_limit = Some(limit);
        self
    }
}

/// A persona's reply to a post; unique per `(post_id, persona_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub id: Uuid,
    pub post_id: PostId,
    pub persona_id: PersonaId,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl Reply {
    pub fn new(
        post_id: PostId,
        persona_id: PersonaId,
        body: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            post_id,
            persona_id,
            body: body.into(),
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BattleStatus {
    /// Turns are still being generated.
    Active,
    /// All turns exist; waiting for the verdict.
    Judging,
    Closed,
}

impl BattleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BattleStatus::Active => "active",
            BattleStatus::Judging => "judging",
            BattleStatus::Closed => "closed",
        }
    }
}

impl std::str::FromStr for BattleStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(BattleStatus::Active),
            "judging" => Ok(BattleStatus::Judging),
            "closed" => Ok(BattleStatus::Closed),
            other => Err(DomainError::validation(format!("unknown battle status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Battle {
    pub id: BattleId,
    pub topic: String,
    pub persona_a: PersonaId,
    pub persona_b: PersonaId,
    /// Total number of turns across both personas.
    pub turn_limit: u32,
    pub status: BattleStatus,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

impl Battle {
    pub fn new(
        topic: impl Into<String>,
        persona_a: PersonaId,
        persona_b: PersonaId,
        turn_limit: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: BattleId::new(),
            topic: topic.into(),
            persona_a,
            persona_b,
            turn_limit,
            status: BattleStatus::Active,
            created_by: None,
            created_at: now,
        }
    }

    pub fn created_by(mut self, user: UserId) -> Self {
        self.created_by = Some(user);
        self
    }

    /// Persona speaking at `turn_index`: A on even turns, B on odd ones.
    pub fn speaker(&self, turn_index: u32) -> PersonaId {
        if turn_index % 2 == 0 {
            self.persona_a
        } else {
            self.persona_b
        }
    }

    pub fn is_participant(&self, persona: PersonaId) -> bool {
        persona == self.persona_a || persona == self.persona_b
    }
}

/// One turn of a battle; unique per `(battle_id, turn_index)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BattleTurn {
    pub battle_id: BattleId,
    pub turn_index: u32,
    pub persona_id: PersonaId,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Verdict of a battle; unique per battle. `winner = None` is a draw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub battle_id: BattleId,
    pub winner: Option<PersonaId>,
    pub reasoning: String,
    pub created_at: DateTime<Utc>,
}

/// Checked outcome of an idempotent insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insert<T> {
    Inserted(T),
    /// The uniqueness constraint already holds a row for this key.
    Duplicate,
}

/// Outcome of a quota-gated reply insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyInsert {
    Inserted(Reply),
    Duplicate,
    /// Nothing written; the persona's daily quota is spent.
    QuotaExceeded { used: u32, limit: u32 },
}

#[async_trait]
pub trait ContentStore: Send + Sync + 'static {
    async fn get_post(&self, id: PostId) -> Result<Option<Post>, StoreError>;

    async fn get_persona(&self, id: PersonaId) -> Result<Option<Persona>, StoreError>;

    async fn active_personas(&self) -> Result<Vec<Persona>, StoreError>;

    /// Replies to a post, oldest first.
    async fn replies_for_post(&self, post: PostId) -> Result<Vec<Reply>, StoreError>;

    async fn has_replied(&self, post: PostId, persona: PersonaId) -> Result<bool, StoreError>;

    /// Insert a reply and consume one `persona_reply` quota unit atomically.
    ///
    /// A duplicate consumes nothing; a denied quota writes nothing.
    async fn insert_reply_gated(
        &self,
        reply: Reply,
        limit: u32,
        window: QuotaWindow,
    ) -> Result<ReplyInsert, StoreError>;

    async fn get_battle(&self, id: BattleId) -> Result<Option<Battle>, StoreError>;

    /// Turns of a battle ordered by `turn_index`.
    async fn battle_turns(&self, battle: BattleId) -> Result<Vec<BattleTurn>, StoreError>;

    async fn insert_turn(&self, turn: BattleTurn) -> Result<Insert<BattleTurn>, StoreError>;

    async fn set_battle_status(
        &self,
        battle: BattleId,
        status: BattleStatus,
    ) -> Result<(), StoreError>;

    async fn get_verdict(&self, battle: BattleId) -> Result<Option<Verdict>, StoreError>;

    /// Insert the verdict and close the battle in one step.
    async fn insert_verdict(&self, verdict: Verdict) -> Result<Insert<Verdict>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speakers_alternate_starting_with_a() {
        let (a, b) = (PersonaId::new(), PersonaId::new());
        let battle = Battle::new("cats vs dogs", a, b, 4, Utc::now());
        let speakers: Vec<_> = (0..4).map(|i| battle.speaker(i)).collect();
        assert_eq!(speakers, vec![a, b, a, b]);
        assert!(battle.is_participant(b));
        assert!(!battle.is_participant(PersonaId::new()));
    }

    #[test]
    fn status_names_parse() {
        for status in [
            PostStatus::Draft,
            PostStatus::Published,
            PostStatus::Archived,
            PostStatus::Deleted,
        ] {
            assert_eq!(status.as_str().parse::<PostStatus>().unwrap(), status);
        }
        assert_eq!("judging".parse::<BattleStatus>().unwrap(), BattleStatus::Judging);
        assert!("frozen".parse::<BattleStatus>().is_err());
    }
}
