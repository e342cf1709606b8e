use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use chorus_core::{BattleId, PersonaId, PostId};

use crate::error::StoreError;
use crate::quota::{InMemoryQuotaLedger, QuotaDecision, QuotaType, QuotaWindow};

use super::{
    Battle, BattleStatus, BattleTurn, ContentStore, Insert, Persona, Post, Reply, ReplyInsert,
    Verdict,
};

#[derive(Debug, Default)]
struct State {
    posts: HashMap<PostId, Post>,
    personas: HashMap<PersonaId, Persona>,
    replies: Vec<Reply>,
    battles: HashMap<BattleId, Battle>,
    turns: Vec<BattleTurn>,
    verdicts: HashMap<BattleId, Verdict>,
}

/// In-memory content store (tests/dev).
///
/// Gated reply inserts consume from the attached quota ledger while holding
/// the store lock, which gives the same all-or-nothing behaviour as the
/// Postgres transaction.
#[derive(Debug)]
pub struct InMemoryContentStore {
    state: Mutex<State>,
    quota: Mutex<Arc<InMemoryQuotaLedger>>,
}

impl Default for InMemoryContentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryContentStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            quota: Mutex::new(Arc::new(InMemoryQuotaLedger::new())),
        }
    }

    /// Share a quota ledger with other consumers.
    pub fn attach_quota(&self, ledger: Arc<InMemoryQuotaLedger>) {
        *self.quota.lock().unwrap() = ledger;
    }

    pub fn put_post(&self, post: Post) {
        self.state.lock().unwrap().posts.insert(post.id, post);
    }

    pub fn put_persona(&self, persona: Persona) {
        self.state
            .lock()
            .unwrap()
            .personas
            .insert(persona.id, persona);
    }

    pub fn put_battle(&self, battle: Battle) {
        self.state.lock().unwrap().battles.insert(battle.id, battle);
    }

    pub fn replies(&self) -> Vec<Reply> {
        self.state.lock().unwrap().replies.clone()
    }

    pub fn turns(&self, battle: BattleId) -> Vec<BattleTurn> {
        let state = self.state.lock().unwrap();
        let mut turns: Vec<_> = state
            .turns
            .iter()
            .filter(|t| t.battle_id == battle)
            .cloned()
            .collect();
        turns.sort_by_key(|t| t.turn_index);
        turns
    }
}

#[async_trait]
impl ContentStore for InMemoryContentStore {
    async fn get_post(&self, id: PostId) -> Result<Option<Post>, StoreError> {
        Ok(self.state.lock().unwrap().posts.get(&id).cloned())
    }

    async fn get_persona(&self, id: PersonaId) -> Result<Option<Persona>, StoreError> {
        Ok(self.state.lock().unwrap().personas.get(&id).cloned())
    }

    async fn active_personas(&self) -> Result<Vec<Persona>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut personas: Vec<_> = state.personas.values().filter(|p| p.active).cloned().collect();
        personas.sort_by_key(|p| p.id);
        Ok(personas)
    }

    async fn replies_for_post(&self, post: PostId) -> Result<Vec<Reply>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut replies: Vec<_> = state
            .replies
            .iter()
            .filter(|r| r.post_id == post)
            .cloned()
            .collect();
        replies.sort_by_key(|r| (r.created_at, r.id));
        Ok(replies)
    }

    async fn has_replied(&self, post: PostId, persona: PersonaId) -> Result<bool, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .replies
            .iter()
            .any(|r| r.post_id == post && r.persona_id == persona))
    }

    async fn insert_reply_gated(
        &self,
        reply: Reply,
        limit: u32,
        window: QuotaWindow,
    ) -> Result<ReplyInsert, StoreError> {
        let mut state = self.state.lock().unwrap();
        if state
            .replies
            .iter()
            .any(|r| r.post_id == reply.post_id && r.persona_id == reply.persona_id)
        {
            return Ok(ReplyInsert::Duplicate);
        }

        let ledger = self.quota.lock().unwrap().clone();
        let decision = ledger.consume_in(
            reply.persona_id.into(),
            QuotaType::PersonaReply,
            limit,
            window,
            reply.created_at,
        );
        if let QuotaDecision::Denied { used, limit } = decision {
            return Ok(ReplyInsert::QuotaExceeded { used, limit });
        }

        state.replies.push(reply.clone());
        Ok(ReplyInsert::Inserted(reply))
    }

    async fn get_battle(&self, id: BattleId) -> Result<Option<Battle>, StoreError> {
        Ok(self.state.lock().unwrap().battles.get(&id).cloned())
    }

    async fn battle_turns(&self, battle: BattleId) -> Result<Vec<BattleTurn>, StoreError> {
        Ok(self.turns(battle))
    }

    async fn insert_turn(&self, turn: BattleTurn) -> Result<Insert<BattleTurn>, StoreError> {
        let mut state = self.state.lock().unwrap();
        if state
            .turns
            .iter()
            .any(|t| t.battle_id == turn.battle_id && t.turn_index == turn.turn_index)
        {
            return Ok(Insert::Duplicate);
        }
        state.turns.push(turn.clone());
        Ok(Insert::Inserted(turn))
    }

    async fn set_battle_status(
        &self,
        battle: BattleId,
        status: BattleStatus,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(battle) = state.battles.get_mut(&battle) {
            battle.status = status;
        }
        Ok(())
    }

    async fn get_verdict(&self, battle: BattleId) -> Result<Option<Verdict>, StoreError> {
        Ok(self.state.lock().unwrap().verdicts.get(&battle).cloned())
    }

    async fn insert_verdict(&self, verdict: Verdict) -> Result<Insert<Verdict>, StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.verdicts.contains_key(&verdict.battle_id) {
            return Ok(Insert::Duplicate);
        }
        if let Some(battle) = state.battles.get_mut(&verdict.battle_id) {
            battle.status = BattleStatus::Closed;
        }
        state.verdicts.insert(verdict.battle_id, verdict.clone());
        Ok(Insert::Inserted(verdict))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use chorus_core::UserId;

    use crate::content::{PostAuthor, PostStatus};
    use crate::quota::{QuotaLedger, QuotaLimits};

    fn fixture() -> (InMemoryContentStore, Post, Persona) {
        let store = InMemoryContentStore::new();
        let now = Utc::now();
        let post = Post::new(PostAuthor::User(UserId::new()), "t", "b", now)
            .with_status(PostStatus::Published);
        let persona = Persona::new("ada", "dry wit", now);
        store.put_post(post.clone());
        store.put_persona(persona.clone());
        (store, post, persona)
    }

    #[tokio::test]
    async fn duplicate_reply_consumes_no_quota() {
        let (store, post, persona) = fixture();
        let ledger = Arc::new(InMemoryQuotaLedger::new());
        store.attach_quota(ledger.clone());
        let now = Utc::now();
        let window = QuotaLimits::default().window_at(now);

        let first = store
            .insert_reply_gated(Reply::new(post.id, persona.id, "one", now), 5, window)
            .await
            .unwrap();
        assert!(matches!(first, ReplyInsert::Inserted(_)));

        let second = store
            .insert_reply_gated(Reply::new(post.id, persona.id, "two", now), 5, window)
            .await
            .unwrap();
        assert_eq!(second, ReplyInsert::Duplicate);

        let used = ledger
            .usage(persona.id.into(), QuotaType::PersonaReply, now)
            .await
            .unwrap();
        assert_eq!(used, 1);
        assert_eq!(store.replies().len(), 1);
    }

    #[tokio::test]
    async fn denied_quota_writes_nothing() {
        let (store, post, persona) = fixture();
        let now = Utc::now();
        let window = QuotaLimits::default().window_at(now);

        let outcome = store
            .insert_reply_gated(Reply::new(post.id, persona.id, "hi", now), 0, window)
            .await
            .unwrap();
        assert_eq!(outcome, ReplyInsert::QuotaExceeded { used: 0, limit: 0 });
        assert!(!store.has_replied(post.id, persona.id).await.unwrap());
    }

    #[tokio::test]
    async fn verdict_closes_the_battle_once() {
        let store = InMemoryContentStore::new();
        let now = Utc::now();
        let battle = Battle::new("topic", PersonaId::new(), PersonaId::new(), 2, now);
        store.put_battle(battle.clone());

        let verdict = Verdict {
            battle_id: battle.id,
            winner: Some(battle.persona_a),
            reasoning: "sharper".into(),
            created_at: now,
        };
        assert!(matches!(
            store.insert_verdict(verdict.clone()).await.unwrap(),
            Insert::Inserted(_)
        ));
        assert_eq!(store.insert_verdict(verdict).await.unwrap(), Insert::Duplicate);
        assert_eq!(
            store.get_battle(battle.id).await.unwrap().unwrap().status,
            BattleStatus::Closed
        );
    }
}
