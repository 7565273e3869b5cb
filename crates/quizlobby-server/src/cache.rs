use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use quizlobby_core::ids::{SessionId, UserId};
use quizlobby_core::member::{LivePlayer, MemberProgress, MemberStatus};
use quizlobby_core::session::{GameSettings, LifecycleStatus};

/// A running game. `content` is the question payload and never leaves the
/// server.
#[derive(Debug, Clone, PartialEq)]
pub struct GameState {
    /// Unix epoch milliseconds.
    pub start_time: u64,
    pub settings: GameSettings,
    pub content: serde_json::Value,
}

/// In-memory state of one active lobby.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedSession {
    pub host_id: UserId,
    pub name: String,
    pub settings: GameSettings,
    pub status: LifecycleStatus,
    /// Live players in join order.
    pub players: Vec<LivePlayer>,
    /// Players evicted while absent, keyed by user. The entry keeps the status
    /// the player held before disconnecting, plus its counters.
    pub parked: HashMap<UserId, LivePlayer>,
    pub game: Option<GameState>,
}

impl CachedSession {
    pub fn player(&self, user: &UserId) -> Option<&LivePlayer> {
        self.players.iter().find(|p| &p.id == user)
    }

    fn player_mut(&mut self, user: &UserId) -> Option<&mut LivePlayer> {
        self.players.iter_mut().find(|p| &p.id == user)
    }

    pub fn total_questions(&self) -> u32 {
        self.game
            .as_ref()
            .map_or(&self.settings, |g| &g.settings)
            .total_questions()
    }
}

/// Volatile, authoritative store for fast-changing gameplay fields.
///
/// This is a cache, not the system of record: when a session is absent the
/// caller reloads it from the roster store and calls [`SessionCache::put`].
/// Only the coordinator, while holding the session's lock, mutates an entry.
/// Every method takes the inner lock briefly and never across an `.await`.
#[derive(Default)]
pub struct SessionCache {
    sessions: RwLock<HashMap<SessionId, CachedSession>>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SessionId, CachedSession>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SessionId, CachedSession>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_session<R>(
        &self,
        id: &SessionId,
        f: impl FnOnce(&mut CachedSession) -> R,
    ) -> Option<R> {
        self.write().get_mut(id).map(f)
    }

    /// Snapshot of a session.
    pub fn get(&self, id: &SessionId) -> Option<CachedSession> {
        self.read().get(id).cloned()
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.read().contains_key(id)
    }

    pub fn put(&self, id: SessionId, session: CachedSession) {
        self.write().insert(id, session);
    }

    pub fn remove_session(&self, id: &SessionId) -> Option<CachedSession> {
        self.write().remove(id)
    }

    /// Drop a member entirely, live or parked.
    pub fn remove_member(&self, id: &SessionId, user: &UserId) -> Option<LivePlayer> {
        self.with_session(id, |s| {
            let live = s
                .players
                .iter()
                .position(|p| &p.id == user)
                .map(|idx| s.players.remove(idx));
            let parked = s.parked.remove(user);
            live.or(parked)
        })
        .flatten()
    }

    /// Set a live player's status. Returns false if the player has no live
    /// entry.
    pub fn update_member_status(&self, id: &SessionId, user: &UserId, status: MemberStatus) -> bool {
        self.with_session(id, |s| match s.player_mut(user) {
            Some(p) => {
                p.status = status;
                true
            },
            None => false,
        })
        .unwrap_or(false)
    }

    /// Make `user` live with `status`. A live entry only changes status and a
    /// parked entry comes back with its counters. Otherwise `fallback` is
    /// inserted. Returns false if the session is not cached.
    pub fn revive_member(
        &self,
        id: &SessionId,
        user: &UserId,
        status: MemberStatus,
        fallback: impl FnOnce() -> LivePlayer,
    ) -> bool {
        self.with_session(id, |s| {
            if let Some(p) = s.player_mut(user) {
                p.status = status;
                return;
            }
            let mut player = s.parked.remove(user).unwrap_or_else(fallback);
            player.status = status;
            s.players.push(player);
        })
        .is_some()
    }

    /// Move a live player into the parked map. Returns the status it held.
    pub fn park_member(&self, id: &SessionId, user: &UserId) -> Option<MemberStatus> {
        self.with_session(id, |s| {
            let idx = s.players.iter().position(|p| &p.id == user)?;
            let player = s.players.remove(idx);
            let prior = player.status;
            s.parked.insert(user.clone(), player);
            Some(prior)
        })
        .flatten()
    }

    /// Status a parked player held before it went absent.
    pub fn parked_status(&self, id: &SessionId, user: &UserId) -> Option<MemberStatus> {
        self.read()
            .get(id)
            .and_then(|s| s.parked.get(user))
            .map(|p| p.status)
    }

    pub fn set_host(&self, id: &SessionId, user: &UserId) -> bool {
        self.with_session(id, |s| s.host_id = user.clone()).is_some()
    }

    pub fn set_lifecycle(&self, id: &SessionId, status: LifecycleStatus) -> bool {
        self.with_session(id, |s| s.status = status).is_some()
    }

    /// Store the running game, zero every counter and mark the session as
    /// playing.
    pub fn begin_game(&self, id: &SessionId, game: GameState) -> bool {
        self.with_session(id, |s| {
            for p in s.players.iter_mut().chain(s.parked.values_mut()) {
                p.progress = MemberProgress::default();
            }
            s.game = Some(game);
            s.status = LifecycleStatus::Playing;
        })
        .is_some()
    }

    /// Apply one answer to a live player. Progress only moves forward and is
    /// capped at the session's question count. Returns the updated player.
    pub fn record_answer(
        &self,
        id: &SessionId,
        user: &UserId,
        item: &str,
        correct: bool,
        points: u32,
    ) -> Option<LivePlayer> {
        self.with_session(id, |s| {
            let total = s.total_questions();
            let player = s.player_mut(user)?;
            let progress = &mut player.progress;
            if correct {
                progress.score = progress.score.saturating_add(points);
                progress.validated_items.push(item.to_string());
            } else {
                progress.incorrect_items.push(item.to_string());
            }
            let next = progress.progress.saturating_add(1).min(total);
            progress.progress = progress.progress.max(next);
            Some(player.clone())
        })
        .flatten()
    }

    /// (active sessions, live players)
    pub fn stats(&self) -> (usize, usize) {
        let sessions = self.read();
        let players = sessions.values().map(|s| s.players.len()).sum();
        (sessions.len(), players)
    }
}
