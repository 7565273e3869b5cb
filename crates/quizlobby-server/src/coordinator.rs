//! Lobby membership and game lifecycle.
//!
//! Every operation takes the session's lock and then follows the same order:
//! validate, write the roster store, mirror the change into the session
//! cache, broadcast. A failed store write returns before the cache is touched
//! or anything is sent. Broadcast problems are logged and never fail an
//! operation.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use quizlobby_core::ids::{SessionId, UserId};
use quizlobby_core::member::{LivePlayer, MemberRecord, MemberStatus, UserProfile};
use quizlobby_core::net::messages::{GameStateView, LobbyInvitationMsg, ServerMessage};
use quizlobby_core::ranking::{RankedPlayer, all_complete, is_complete, rank};
use quizlobby_core::session::{
    DEFAULT_TOTAL_QUESTIONS, GameSettings, LifecycleStatus, SessionRecord, Visibility,
};
use quizlobby_core::time::now_millis;

use crate::broadcaster::{SessionView, SnapshotBroadcaster};
use crate::cache::{CachedSession, GameState, SessionCache};
use crate::config::{PresenceRecovery, ServerConfig};
use crate::error::{LobbyError, StoreError};
use crate::locks::SessionLocks;
use crate::registry::ConnectionRegistry;
use crate::store::{RosterStore, UserDirectory, bounded};

/// Successful result of a coordinator operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome<T> {
    /// Human-readable summary for the caller.
    pub message: String,
    pub value: T,
}

impl<T> Outcome<T> {
    pub fn new(message: impl Into<String>, value: T) -> Self {
        Self {
            message: message.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveResult {
    /// The user had no membership row. Nothing changed.
    NotMember,
    Left,
    HostMigrated { new_host: UserId },
    /// The user was the last member and the lobby was deleted.
    SessionClosed,
}

/// Tunables the coordinator reads from the server config.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub store_timeout: Duration,
    pub presence: PresenceRecovery,
    pub default_total_questions: u32,
    pub max_name_len: usize,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(2),
            presence: PresenceRecovery::default(),
            default_total_questions: DEFAULT_TOTAL_QUESTIONS,
            max_name_len: 64,
        }
    }
}

impl From<&ServerConfig> for CoordinatorOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            store_timeout: config.store.timeout(),
            presence: config.presence.recovery,
            default_total_questions: config.lobby.default_total_questions,
            max_name_len: config.lobby.max_name_len,
        }
    }
}

enum HostChange {
    Unchanged,
    Migrated(UserId),
    Closed,
}

/// Rebuild a cache entry from durable rows. Absent members are parked; the
/// status they held before going absent is unknown, so they come back as
/// `joined`.
fn cached_from_store(record: &SessionRecord, rows: &[MemberRecord]) -> CachedSession {
    let mut players = Vec::new();
    let mut parked = HashMap::new();
    for row in rows {
        let player = LivePlayer {
            id: row.user_id.clone(),
            name: row.name.clone(),
            status: row.status,
            progress: row.progress.clone(),
        };
        if row.status.is_live() {
            players.push(player);
        } else {
            parked.insert(
                row.user_id.clone(),
                LivePlayer {
                    status: MemberStatus::Joined,
                    ..player
                },
            );
        }
    }
    CachedSession {
        host_id: record.host_id.clone(),
        name: record.name.clone(),
        settings: record.settings.clone(),
        status: record.status,
        players,
        parked,
        game: None,
    }
}

/// Drives both stores of truth for lobby membership and gameplay.
pub struct SessionCoordinator {
    store: Arc<dyn RosterStore>,
    directory: Arc<dyn UserDirectory>,
    cache: Arc<SessionCache>,
    locks: SessionLocks,
    broadcaster: SnapshotBroadcaster,
    options: CoordinatorOptions,
}

impl SessionCoordinator {
    pub fn new(
        store: Arc<dyn RosterStore>,
        directory: Arc<dyn UserDirectory>,
        cache: Arc<SessionCache>,
        registry: Arc<ConnectionRegistry>,
        options: CoordinatorOptions,
    ) -> Self {
        let broadcaster = SnapshotBroadcaster::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            registry,
            options.store_timeout,
        );
        Self {
            store,
            directory,
            cache,
            locks: SessionLocks::new(),
            broadcaster,
            options,
        }
    }

    pub fn presence_policy(&self) -> PresenceRecovery {
        self.options.presence
    }

    /// Sessions with a held or awaited lock.
    pub fn busy_sessions(&self) -> usize {
        self.locks.active()
    }

    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, LobbyError> {
        bounded(self.options.store_timeout, fut).await
    }

    async fn require_session(&self, id: &SessionId) -> Result<SessionRecord, LobbyError> {
        self.call(self.store.get_session(id))
            .await?
            .ok_or_else(|| LobbyError::SessionNotFound(id.clone()))
    }

    /// Fetch a membership row, telling a missing lobby apart from a missing
    /// member.
    async fn require_member(
        &self,
        session: &SessionId,
        user: &UserId,
    ) -> Result<MemberRecord, LobbyError> {
        if let Some(row) = self.call(self.store.get_member(session, user)).await? {
            return Ok(row);
        }
        self.require_session(session).await?;
        Err(LobbyError::MemberNotFound {
            session: session.clone(),
            user: user.clone(),
        })
    }

    async fn find_user(&self, id: &UserId) -> Result<UserProfile, LobbyError> {
        self.call(self.directory.find_user(id))
            .await?
            .ok_or_else(|| LobbyError::UserNotFound(id.clone()))
    }

    /// Reload a session into the cache if it is not there. The caller holds
    /// the session lock.
    async fn ensure_cached(&self, id: &SessionId) -> Result<(), LobbyError> {
        if self.cache.contains(id) {
            return Ok(());
        }
        let record = self.require_session(id).await?;
        let rows = self.call(self.store.list_members(id)).await?;
        self.cache.put(id.clone(), cached_from_store(&record, &rows));
        tracing::debug!(session = %id, members = rows.len(), "Reloaded session into cache");
        Ok(())
    }

    async fn load_view(&self, id: &SessionId) -> Result<SessionView, LobbyError> {
        self.broadcaster
            .session_view(id)
            .await?
            .ok_or_else(|| LobbyError::SessionNotFound(id.clone()))
    }

    async fn publish(&self, id: &SessionId) {
        if let Err(e) = self.broadcaster.broadcast_lobby_update(id).await {
            tracing::warn!(session = %id, error = %e, "Failed to build lobby update");
        }
    }

    fn validate_name(&self, raw: &str) -> Result<String, LobbyError> {
        let name = raw.trim();
        if name.is_empty() {
            return Err(LobbyError::InvalidName("name is empty".into()));
        }
        if name.chars().count() > self.options.max_name_len {
            return Err(LobbyError::InvalidName(format!(
                "name is longer than {} characters",
                self.options.max_name_len
            )));
        }
        if name.chars().any(char::is_control) {
            return Err(LobbyError::InvalidName(
                "name contains control characters".into(),
            ));
        }
        Ok(name.to_string())
    }

    fn with_default_questions(&self, settings: GameSettings) -> GameSettings {
        let mut value = settings.0;
        if !value.is_object() {
            value = serde_json::Value::Object(serde_json::Map::new());
        }
        if let Some(map) = value.as_object_mut() {
            map.entry("totalQuestions")
                .or_insert_with(|| self.options.default_total_questions.into());
        }
        GameSettings(value)
    }

    /// Status of a member as the cache sees it, falling back to the row.
    fn current_status(&self, session: &SessionId, row: &MemberRecord) -> MemberStatus {
        match self.cache.get(session) {
            Some(cached) if cached.parked.contains_key(&row.user_id) => MemberStatus::Disconnected,
            Some(cached) => cached.player(&row.user_id).map_or(row.status, |p| p.status),
            None => row.status,
        }
    }

    fn mirror_status(&self, session: &SessionId, row: &MemberRecord, status: MemberStatus) {
        if !status.is_live() {
            self.cache.park_member(session, &row.user_id);
            return;
        }
        let mirrored = self.cache.revive_member(session, &row.user_id, status, || LivePlayer {
            id: row.user_id.clone(),
            name: row.name.clone(),
            status,
            progress: row.progress.clone(),
        });
        if !mirrored {
            tracing::warn!(
                session = %session, user = %row.user_id,
                "Session missing from cache, status not mirrored"
            );
        }
    }

    /// Store write, cache mirror, lobby update. A member already in `status`
    /// is left alone so repeated heartbeats stay quiet.
    async fn transition(
        &self,
        session: &SessionId,
        row: &MemberRecord,
        status: MemberStatus,
    ) -> Result<bool, LobbyError> {
        let current = self.current_status(session, row);
        if current == status {
            return Ok(false);
        }
        self.call(self.store.update_member_status(session, &row.user_id, status))
            .await?;
        self.mirror_status(session, row, status);
        tracing::info!(
            session = %session, user = %row.user_id, from = %current, to = %status,
            "Member status changed"
        );
        self.publish(session).await;
        Ok(true)
    }

    /// Make sure the lobby has a host who is still a member, promoting the
    /// earliest remaining joiner or deleting the lobby when nobody is left.
    async fn settle_host(&self, session: &SessionId) -> Result<HostChange, LobbyError> {
        let Some(record) = self.call(self.store.get_session(session)).await? else {
            self.cache.remove_session(session);
            return Ok(HostChange::Unchanged);
        };
        let remaining = self.call(self.store.list_members(session)).await?;
        let Some(successor) = remaining.first() else {
            self.call(self.store.delete_session(session)).await?;
            self.cache.remove_session(session);
            tracing::info!(session = %session, "Lobby closed");
            return Ok(HostChange::Closed);
        };
        if remaining.iter().any(|m| m.user_id == record.host_id) {
            return Ok(HostChange::Unchanged);
        }
        let new_host = successor.user_id.clone();
        self.call(self.store.set_host(session, &new_host)).await?;
        self.cache.set_host(session, &new_host);
        tracing::info!(
            session = %session, from = %record.host_id, to = %new_host,
            "Host migrated"
        );
        Ok(HostChange::Migrated(new_host))
    }

    /// End a running game once every live player has answered everything.
    async fn finish_if_complete(&self, session: &SessionId) -> Result<bool, LobbyError> {
        let Some(cached) = self.cache.get(session) else {
            return Ok(false);
        };
        if cached.status != LifecycleStatus::Playing
            || !all_complete(&cached.players, cached.total_questions())
        {
            return Ok(false);
        }
        for player in cached.players.iter().chain(cached.parked.values()) {
            self.call(self.store.save_progress(session, &player.id, &player.progress))
                .await?;
        }
        self.call(self.store.set_session_status(session, LifecycleStatus::Finished))
            .await?;
        self.cache.set_lifecycle(session, LifecycleStatus::Finished);
        tracing::info!(session = %session, players = cached.players.len(), "Game finished");
        self.broadcaster.broadcast_game_end(session);
        self.publish(session).await;
        Ok(true)
    }

    async fn finish_quietly(&self, session: &SessionId) {
        if let Err(e) = self.finish_if_complete(session).await {
            tracing::warn!(session = %session, error = %e, "Failed to finish game");
        }
    }

    /// Create a lobby with `host` as its first member.
    pub async fn create_session(
        &self,
        host: &UserId,
        name: &str,
        settings: GameSettings,
        visibility: Visibility,
    ) -> Result<Outcome<SessionView>, LobbyError> {
        let name = self.validate_name(name)?;
        let profile = self.find_user(host).await?;
        let id = SessionId::generate();
        let _guard = self.locks.acquire(&id).await;

        let record = SessionRecord {
            id: id.clone(),
            name,
            host_id: host.clone(),
            visibility,
            authorized: BTreeSet::new(),
            settings: self.with_default_questions(settings),
            status: LifecycleStatus::Waiting,
        };
        self.call(self.store.create_session(record.clone())).await?;
        let row = match self
            .call(self.store.add_member(&id, host, &profile.name, MemberStatus::Joined))
            .await
        {
            Ok(row) => row,
            Err(e) => {
                if let Err(cleanup) = self.call(self.store.delete_session(&id)).await {
                    tracing::warn!(session = %id, error = %cleanup, "Failed to remove hostless lobby");
                }
                return Err(e);
            },
        };
        self.cache
            .put(id.clone(), cached_from_store(&record, std::slice::from_ref(&row)));
        tracing::info!(session = %id, host = %host, "Lobby created");

        let view = self.load_view(&id).await?;
        self.broadcaster.publish_lobby_update(&view);
        Ok(Outcome::new(format!("created lobby {}", record.name), view))
    }

    /// Authorize `target` to join and send them an invitation.
    pub async fn invite(
        &self,
        host: &UserId,
        session: &SessionId,
        target: &UserId,
    ) -> Result<Outcome<()>, LobbyError> {
        let _guard = self.locks.acquire(session).await;
        let record = self.require_session(session).await?;
        if &record.host_id != host {
            return Err(LobbyError::Unauthorized(
                "only the host can invite players".into(),
            ));
        }
        if self
            .call(self.store.get_member(session, target))
            .await?
            .is_some()
        {
            return Ok(Outcome::new(format!("{target} is already in the lobby"), ()));
        }
        let invitee = self.find_user(target).await?;
        let host_name = match self.call(self.store.get_member(session, host)).await? {
            Some(row) => row.name,
            None => host.to_string(),
        };

        self.call(self.store.add_authorized(session, target)).await?;
        tracing::info!(session = %session, host = %host, target = %target, "Player invited");
        self.broadcaster.send_to(
            target,
            &ServerMessage::LobbyInvitation(LobbyInvitationMsg {
                session_id: session.clone(),
                host_id: host.clone(),
                host_name,
                session_name: record.name,
            }),
        );
        Ok(Outcome::new(format!("invited {}", invitee.name), ()))
    }

    /// Join a lobby, consuming the user's invitation.
    ///
    /// A user who already has a membership row is admitted again and set back
    /// to `joined`.
    pub async fn join(
        &self,
        user: &UserId,
        session: &SessionId,
    ) -> Result<Outcome<SessionView>, LobbyError> {
        let _guard = self.locks.acquire(session).await;
        let record = self.require_session(session).await?;
        let existing = self.call(self.store.get_member(session, user)).await?;
        if existing.is_none() && !record.admits(user) {
            return Err(LobbyError::Forbidden(
                "you have not been invited to this lobby".into(),
            ));
        }
        self.ensure_cached(session).await?;

        let row = match existing {
            Some(row) => {
                self.call(self.store.update_member_status(session, user, MemberStatus::Joined))
                    .await?;
                row
            },
            None => {
                let profile = self.find_user(user).await?;
                let consumed = record.authorized.contains(user);
                if consumed {
                    self.call(self.store.remove_authorized(session, user)).await?;
                }
                match self
                    .call(self.store.add_member(session, user, &profile.name, MemberStatus::Joined))
                    .await
                {
                    Ok(row) => row,
                    Err(e) => {
                        if consumed
                            && let Err(restore) =
                                self.call(self.store.add_authorized(session, user)).await
                        {
                            tracing::warn!(
                                session = %session, user = %user, error = %restore,
                                "Failed to restore invitation"
                            );
                        }
                        return Err(e);
                    },
                }
            },
        };
        self.mirror_status(session, &row, MemberStatus::Joined);
        tracing::info!(session = %session, user = %user, "Player joined");

        let view = self.load_view(session).await?;
        self.broadcaster.publish_lobby_update(&view);
        Ok(Outcome::new(format!("joined {}", record.name), view))
    }

    /// Leave a lobby. Leaving a lobby you are not in succeeds and changes
    /// nothing.
    pub async fn leave(
        &self,
        user: &UserId,
        session: &SessionId,
    ) -> Result<Outcome<LeaveResult>, LobbyError> {
        let _guard = self.locks.acquire(session).await;
        let Some(removed) = self.call(self.store.remove_member(session, user)).await? else {
            return Ok(Outcome::new(
                "you were not in this lobby",
                LeaveResult::NotMember,
            ));
        };
        self.cache.remove_member(session, user);
        tracing::info!(session = %session, user = %user, "Player left");
        self.broadcaster
            .broadcast_player_left(session, user, &removed.name);

        let result = match self.settle_host(session).await? {
            HostChange::Closed => {
                return Ok(Outcome::new(
                    "left the lobby, which is now closed",
                    LeaveResult::SessionClosed,
                ));
            },
            HostChange::Migrated(new_host) => LeaveResult::HostMigrated { new_host },
            HostChange::Unchanged => LeaveResult::Left,
        };
        self.finish_quietly(session).await;
        self.publish(session).await;
        Ok(Outcome::new("left the lobby", result))
    }

    /// Toggle readiness: `ready` or back to `joined`.
    pub async fn set_ready(
        &self,
        user: &UserId,
        session: &SessionId,
        ready: bool,
    ) -> Result<Outcome<MemberStatus>, LobbyError> {
        let _guard = self.locks.acquire(session).await;
        let row = self.require_member(session, user).await?;
        self.ensure_cached(session).await?;
        let status = if ready {
            MemberStatus::Ready
        } else {
            MemberStatus::Joined
        };
        self.transition(session, &row, status).await?;
        Ok(Outcome::new(format!("you are {status}"), status))
    }

    /// Presence with reset semantics: coming back always lands on `joined`.
    pub async fn set_absent(
        &self,
        user: &UserId,
        session: &SessionId,
        absent: bool,
    ) -> Result<Outcome<MemberStatus>, LobbyError> {
        let _guard = self.locks.acquire(session).await;
        self.absent_locked(user, session, absent).await
    }

    /// Presence with restore semantics: coming back lands on the status held
    /// before the absence, or `joined` if that is unknown.
    pub async fn set_present(
        &self,
        user: &UserId,
        session: &SessionId,
        present: bool,
    ) -> Result<Outcome<MemberStatus>, LobbyError> {
        let _guard = self.locks.acquire(session).await;
        self.present_locked(user, session, present).await
    }

    /// Presence change from the transport, using the configured recovery
    /// policy. A "present" signal for a member who is not absent is a
    /// heartbeat and changes nothing.
    pub async fn apply_presence(
        &self,
        user: &UserId,
        session: &SessionId,
        absent: bool,
    ) -> Result<Outcome<MemberStatus>, LobbyError> {
        let _guard = self.locks.acquire(session).await;
        if !absent {
            let row = self.require_member(session, user).await?;
            self.ensure_cached(session).await?;
            let current = self.current_status(session, &row);
            if current.is_live() {
                return Ok(Outcome::new(format!("you are {current}"), current));
            }
        }
        match self.options.presence {
            PresenceRecovery::Reset => self.absent_locked(user, session, absent).await,
            PresenceRecovery::Restore => self.present_locked(user, session, !absent).await,
        }
    }

    async fn absent_locked(
        &self,
        user: &UserId,
        session: &SessionId,
        absent: bool,
    ) -> Result<Outcome<MemberStatus>, LobbyError> {
        let row = self.require_member(session, user).await?;
        self.ensure_cached(session).await?;
        let status = if absent {
            MemberStatus::Disconnected
        } else {
            MemberStatus::Joined
        };
        self.transition(session, &row, status).await?;
        if absent {
            self.finish_quietly(session).await;
        }
        Ok(Outcome::new(format!("you are {status}"), status))
    }

    async fn present_locked(
        &self,
        user: &UserId,
        session: &SessionId,
        present: bool,
    ) -> Result<Outcome<MemberStatus>, LobbyError> {
        let row = self.require_member(session, user).await?;
        self.ensure_cached(session).await?;
        let status = if present {
            let prior = self
                .cache
                .parked_status(session, user)
                .unwrap_or_else(|| self.current_status(session, &row));
            match prior {
                MemberStatus::Disconnected => MemberStatus::Joined,
                other => other,
            }
        } else {
            MemberStatus::Disconnected
        };
        self.transition(session, &row, status).await?;
        if !present {
            self.finish_quietly(session).await;
        }
        Ok(Outcome::new(format!("you are {status}"), status))
    }

    /// Merged view of a lobby. Refills the cache from the store if needed.
    pub async fn session_view(
        &self,
        session: &SessionId,
    ) -> Result<Outcome<SessionView>, LobbyError> {
        let _guard = self.locks.acquire(session).await;
        self.ensure_cached(session).await?;
        let view = self.load_view(session).await?;
        Ok(Outcome::new(view.name.clone(), view))
    }

    /// Whether every member is ready. A lobby without members is vacuously
    /// ready.
    pub async fn all_ready(&self, session: &SessionId) -> Result<bool, LobbyError> {
        let view = self.session_view(session).await?.value;
        Ok(view
            .players
            .iter()
            .all(|p| p.status == Some(MemberStatus::Ready)))
    }

    /// Start the game. Only the host may start, only from `waiting`, and only
    /// once the lobby has members who are all ready.
    pub async fn start_game(
        &self,
        host: &UserId,
        session: &SessionId,
        content: serde_json::Value,
    ) -> Result<Outcome<GameStateView>, LobbyError> {
        let _guard = self.locks.acquire(session).await;
        let record = self.require_session(session).await?;
        if &record.host_id != host {
            return Err(LobbyError::Unauthorized(
                "only the host can start the game".into(),
            ));
        }
        self.ensure_cached(session).await?;
        let view = self.load_view(session).await?;
        if view.status != LifecycleStatus::Waiting {
            return Err(LobbyError::Conflict(format!(
                "lobby is already {}",
                view.status.as_str()
            )));
        }
        if view.players.is_empty()
            || view
                .players
                .iter()
                .any(|p| p.status != Some(MemberStatus::Ready))
        {
            return Err(LobbyError::Forbidden("not every player is ready".into()));
        }

        self.call(self.store.set_session_status(session, LifecycleStatus::Playing))
            .await?;
        let game = GameState {
            start_time: now_millis(),
            settings: view.settings.clone(),
            content,
        };
        let shown = GameStateView {
            start_time: game.start_time,
            settings: game.settings.clone(),
        };
        self.cache.begin_game(session, game);
        tracing::info!(
            session = %session, players = view.players.len(),
            questions = shown.settings.total_questions(), "Game started"
        );
        self.broadcaster.broadcast_game_start(session);
        self.publish(session).await;
        Ok(Outcome::new("game started", shown))
    }

    /// Record one answer and return the running standings. The game finishes
    /// when every live player has answered every question.
    pub async fn submit_answer(
        &self,
        user: &UserId,
        session: &SessionId,
        item: &str,
        correct: bool,
        points: u32,
    ) -> Result<Outcome<Vec<RankedPlayer>>, LobbyError> {
        let _guard = self.locks.acquire(session).await;
        self.ensure_cached(session).await?;
        let cached = self
            .cache
            .get(session)
            .ok_or_else(|| LobbyError::SessionNotFound(session.clone()))?;
        if cached.status != LifecycleStatus::Playing {
            return Err(LobbyError::Conflict("no game is running in this lobby".into()));
        }
        let not_live = || LobbyError::MemberNotFound {
            session: session.clone(),
            user: user.clone(),
        };
        let total = cached.total_questions();
        let player = cached.player(user).ok_or_else(not_live)?;

        if !is_complete(player, total) {
            self.cache
                .record_answer(session, user, item, correct, points)
                .ok_or_else(not_live)?;
            self.broadcaster.broadcast_player_progress(session);
            self.broadcaster.broadcast_score_update(session, user);
        } else if !all_complete(&cached.players, total) {
            return Err(LobbyError::Conflict(
                "you have already answered every question".into(),
            ));
        }
        // A complete game that failed to persist is retried here.
        let finished = self.finish_if_complete(session).await?;
        let standings = self
            .cache
            .get(session)
            .map(|c| rank(&c.players))
            .unwrap_or_default();
        let message = if finished { "game over" } else { "answer recorded" };
        Ok(Outcome::new(message, standings))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::sync::mpsc;

    use super::*;
    use crate::store::{MemoryRosterStore, MemoryUserDirectory};
    use quizlobby_core::net::protocol::decode_server_message;
    use quizlobby_core::test_helpers::{make_session, session, settings_with_questions, user};

    struct Harness {
        coord: Arc<SessionCoordinator>,
        store: Arc<MemoryRosterStore>,
        cache: Arc<SessionCache>,
        registry: Arc<ConnectionRegistry>,
    }

    fn harness_with(options: CoordinatorOptions) -> Harness {
        let store = Arc::new(MemoryRosterStore::new());
        let directory = Arc::new(MemoryUserDirectory::new());
        for id in ["h", "a", "b", "c", "g"] {
            directory.upsert(UserProfile {
                id: user(id),
                name: id.to_uppercase(),
            });
        }
        let cache = Arc::new(SessionCache::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let dyn_store: Arc<dyn RosterStore> = Arc::clone(&store) as Arc<dyn RosterStore>;
        let coord = SessionCoordinator::new(
            dyn_store,
            directory,
            Arc::clone(&cache),
            Arc::clone(&registry),
            options,
        );
        Harness {
            coord: Arc::new(coord),
            store,
            cache,
            registry,
        }
    }

    fn harness() -> Harness {
        harness_with(CoordinatorOptions::default())
    }

    impl Harness {
        fn connect(&self, id: &str) -> mpsc::Receiver<Bytes> {
            let (tx, rx) = mpsc::channel(64);
            self.registry.register(user(id), tx);
            rx
        }

        /// Lobby hosted by `h` with `others` invited and joined in order.
        async fn lobby(&self, others: &[&str], settings: GameSettings) -> SessionId {
            let id = self
                .coord
                .create_session(&user("h"), "Quiz", settings, Visibility::Private)
                .await
                .unwrap()
                .value
                .id;
            for other in others {
                self.coord.invite(&user("h"), &id, &user(other)).await.unwrap();
                self.coord.join(&user(other), &id).await.unwrap();
            }
            id
        }

        async fn host_of(&self, id: &SessionId) -> UserId {
            self.store.get_session(id).await.unwrap().unwrap().host_id
        }

        async fn durable_status(&self, id: &SessionId, who: &str) -> MemberStatus {
            self.store
                .get_member(id, &user(who))
                .await
                .unwrap()
                .unwrap()
                .status
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Bytes>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(data) = rx.try_recv() {
            out.push(decode_server_message(&data).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn create_adds_host_as_member() {
        let h = harness();
        let id = h.lobby(&[], GameSettings(serde_json::json!({ "theme": "flags" }))).await;
        let view = h.coord.session_view(&id).await.unwrap().value;
        assert_eq!(view.host_id, user("h"));
        assert_eq!(view.players.len(), 1);
        assert_eq!(view.players[0].status, Some(MemberStatus::Joined));
        assert_eq!(view.settings.0["theme"], "flags");
        assert_eq!(view.settings.total_questions(), 10);
    }

    #[tokio::test]
    async fn create_rejects_bad_names_and_unknown_hosts() {
        let h = harness();
        let err = h
            .coord
            .create_session(&user("h"), "  ", GameSettings::default(), Visibility::Private)
            .await
            .unwrap_err();
        assert!(matches!(err, LobbyError::InvalidName(_)));

        let err = h
            .coord
            .create_session(&user("h"), "a\u{7}b", GameSettings::default(), Visibility::Private)
            .await
            .unwrap_err();
        assert!(matches!(err, LobbyError::InvalidName(_)));

        let err = h
            .coord
            .create_session(&user("nobody"), "Quiz", GameSettings::default(), Visibility::Private)
            .await
            .unwrap_err();
        assert_eq!(err, LobbyError::UserNotFound(user("nobody")));
    }

    #[tokio::test]
    async fn host_is_always_a_member() {
        let h = harness();
        let id = h.lobby(&["a", "b"], GameSettings::default()).await;
        for leaver in ["h", "b"] {
            h.coord.leave(&user(leaver), &id).await.unwrap();
            let host = h.host_of(&id).await;
            let members = h.store.list_members(&id).await.unwrap();
            assert!(members.iter().any(|m| m.user_id == host));
            assert_eq!(h.cache.get(&id).unwrap().host_id, host);
        }
    }

    #[tokio::test]
    async fn leave_is_idempotent() {
        let h = harness();
        let id = h.lobby(&["a"], GameSettings::default()).await;
        let first = h.coord.leave(&user("a"), &id).await.unwrap();
        assert_eq!(first.value, LeaveResult::Left);
        let second = h.coord.leave(&user("a"), &id).await.unwrap();
        assert_eq!(second.value, LeaveResult::NotMember);
        assert_eq!(h.store.list_members(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn non_member_leave_survives_store_read_failure() {
        let h = harness();
        let id = h.lobby(&["a"], GameSettings::default()).await;
        let mut rx = h.connect("a");

        h.store.set_fail_reads(true);
        let out = h.coord.leave(&user("g"), &id).await.unwrap();
        assert_eq!(out.value, LeaveResult::NotMember);
        h.store.set_fail_reads(false);

        assert_eq!(h.host_of(&id).await, user("h"));
        assert_eq!(h.store.list_members(&id).await.unwrap().len(), 2);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn non_member_leave_does_not_touch_host() {
        let h = harness();
        let sid = session("s1");
        h.store.create_session(make_session("s1", "h")).await.unwrap();
        h.store
            .add_member(&sid, &user("a"), "A", MemberStatus::Joined)
            .await
            .unwrap();
        let mut rx = h.connect("a");

        let out = h.coord.leave(&user("g"), &sid).await.unwrap();
        assert_eq!(out.value, LeaveResult::NotMember);
        assert_eq!(h.host_of(&sid).await, user("h"));
        assert_eq!(h.store.list_members(&sid).await.unwrap().len(), 1);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn single_member_ready_toggle() {
        let h = harness();
        let id = h.lobby(&[], GameSettings::default()).await;
        h.coord.set_ready(&user("h"), &id, true).await.unwrap();
        assert!(h.coord.all_ready(&id).await.unwrap());
        h.coord.set_ready(&user("h"), &id, false).await.unwrap();
        assert!(!h.coord.all_ready(&id).await.unwrap());
    }

    #[tokio::test]
    async fn ready_toggles_drive_all_ready() {
        let h = harness();
        let id = h.lobby(&["a"], GameSettings::default()).await;
        assert!(!h.coord.all_ready(&id).await.unwrap());

        h.coord.set_ready(&user("h"), &id, true).await.unwrap();
        h.coord.set_ready(&user("a"), &id, true).await.unwrap();
        assert!(h.coord.all_ready(&id).await.unwrap());
        assert_eq!(h.durable_status(&id, "a").await, MemberStatus::Ready);

        h.coord.set_ready(&user("a"), &id, false).await.unwrap();
        assert!(!h.coord.all_ready(&id).await.unwrap());
    }

    #[tokio::test]
    async fn ready_for_non_member_is_not_found() {
        let h = harness();
        let id = h.lobby(&[], GameSettings::default()).await;
        let err = h.coord.set_ready(&user("b"), &id, true).await.unwrap_err();
        assert!(matches!(err, LobbyError::MemberNotFound { .. }));
        let err = h
            .coord
            .set_ready(&user("b"), &session("gone"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, LobbyError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn host_migrates_to_earliest_joiner() {
        let h = harness();
        let id = h.lobby(&["a", "b"], GameSettings::default()).await;
        let mut rx_a = h.connect("a");
        let mut rx_b = h.connect("b");

        let out = h.coord.leave(&user("h"), &id).await.unwrap();
        assert_eq!(
            out.value,
            LeaveResult::HostMigrated {
                new_host: user("a")
            }
        );
        assert_eq!(h.host_of(&id).await, user("a"));

        for rx in [&mut rx_a, &mut rx_b] {
            let msgs = drain(rx);
            assert!(msgs.iter().any(|m| matches!(
                m,
                ServerMessage::PlayerLeftGame(left) if left.player_id == user("h")
            )));
            let update = msgs
                .iter()
                .find_map(|m| match m {
                    ServerMessage::LobbyUpdate(u) => Some(u),
                    _ => None,
                })
                .unwrap();
            assert_eq!(update.host_id, user("a"));
            let ids: Vec<_> = update.players.iter().map(|p| p.id.clone()).collect();
            assert_eq!(ids, vec![user("a"), user("b")]);
        }
    }

    #[tokio::test]
    async fn last_member_leaving_deletes_lobby() {
        let h = harness();
        let id = h.lobby(&[], GameSettings::default()).await;
        let out = h.coord.leave(&user("h"), &id).await.unwrap();
        assert_eq!(out.value, LeaveResult::SessionClosed);
        assert!(h.store.get_session(&id).await.unwrap().is_none());
        assert!(!h.cache.contains(&id));
    }

    #[tokio::test]
    async fn absent_then_back_resets_to_joined() {
        let h = harness();
        let id = h.lobby(&["a"], GameSettings::default()).await;
        h.coord.set_ready(&user("a"), &id, true).await.unwrap();

        let out = h.coord.set_absent(&user("a"), &id, true).await.unwrap();
        assert_eq!(out.value, MemberStatus::Disconnected);
        assert_eq!(h.durable_status(&id, "a").await, MemberStatus::Disconnected);
        let cached = h.cache.get(&id).unwrap();
        assert!(cached.player(&user("a")).is_none());
        assert!(cached.parked.contains_key(&user("a")));

        let view = h.coord.session_view(&id).await.unwrap().value;
        assert_eq!(view.players[1].status, Some(MemberStatus::Disconnected));

        let out = h.coord.set_absent(&user("a"), &id, false).await.unwrap();
        assert_eq!(out.value, MemberStatus::Joined);
        assert_eq!(
            h.cache.get(&id).unwrap().player(&user("a")).unwrap().status,
            MemberStatus::Joined
        );
    }

    #[tokio::test]
    async fn set_present_restores_ready() {
        let h = harness();
        let id = h.lobby(&["a"], GameSettings::default()).await;
        h.coord.set_ready(&user("a"), &id, true).await.unwrap();
        h.coord.set_present(&user("a"), &id, false).await.unwrap();
        let out = h.coord.set_present(&user("a"), &id, true).await.unwrap();
        assert_eq!(out.value, MemberStatus::Ready);
        assert_eq!(h.durable_status(&id, "a").await, MemberStatus::Ready);
    }

    #[tokio::test]
    async fn apply_presence_follows_policy() {
        let h = harness_with(CoordinatorOptions {
            presence: PresenceRecovery::Restore,
            ..CoordinatorOptions::default()
        });
        let id = h.lobby(&["a"], GameSettings::default()).await;
        h.coord.set_ready(&user("a"), &id, true).await.unwrap();
        h.coord.apply_presence(&user("a"), &id, true).await.unwrap();
        let back = h.coord.apply_presence(&user("a"), &id, false).await.unwrap();
        assert_eq!(back.value, MemberStatus::Ready);

        let h = harness();
        let id = h.lobby(&["a"], GameSettings::default()).await;
        h.coord.set_ready(&user("a"), &id, true).await.unwrap();
        h.coord.apply_presence(&user("a"), &id, true).await.unwrap();
        let back = h.coord.apply_presence(&user("a"), &id, false).await.unwrap();
        assert_eq!(back.value, MemberStatus::Joined);
    }

    #[tokio::test]
    async fn repeated_presence_is_silent() {
        let h = harness();
        let id = h.lobby(&[], GameSettings::default()).await;
        let mut rx = h.connect("h");
        h.coord.set_absent(&user("h"), &id, false).await.unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn heartbeat_keeps_ready_player_ready() {
        let h = harness();
        let id = h.lobby(&["a"], GameSettings::default()).await;
        h.coord.set_ready(&user("a"), &id, true).await.unwrap();
        let out = h.coord.apply_presence(&user("a"), &id, false).await.unwrap();
        assert_eq!(out.value, MemberStatus::Ready);
        assert_eq!(h.durable_status(&id, "a").await, MemberStatus::Ready);
    }

    #[tokio::test]
    async fn invitation_is_consumed_by_join() {
        let h = harness();
        let id = h.lobby(&[], GameSettings::default()).await;
        let mut rx_a = h.connect("a");

        h.coord.invite(&user("h"), &id, &user("a")).await.unwrap();
        let msgs = drain(&mut rx_a);
        assert!(matches!(
            &msgs[..],
            [ServerMessage::LobbyInvitation(inv)] if inv.host_name == "H" && inv.session_name == "Quiz"
        ));

        let err = h.coord.join(&user("b"), &id).await.unwrap_err();
        assert!(matches!(err, LobbyError::Forbidden(_)));

        h.coord.join(&user("a"), &id).await.unwrap();
        let record = h.store.get_session(&id).await.unwrap().unwrap();
        assert!(!record.authorized.contains(&user("a")));

        h.coord.leave(&user("a"), &id).await.unwrap();
        let err = h.coord.join(&user("a"), &id).await.unwrap_err();
        assert!(matches!(err, LobbyError::Forbidden(_)));
    }

    #[tokio::test]
    async fn invite_rules() {
        let h = harness();
        let id = h.lobby(&["a"], GameSettings::default()).await;
        let err = h.coord.invite(&user("a"), &id, &user("b")).await.unwrap_err();
        assert!(matches!(err, LobbyError::Unauthorized(_)));

        let out = h.coord.invite(&user("h"), &id, &user("a")).await.unwrap();
        assert!(out.message.contains("already"));

        let err = h.coord.invite(&user("h"), &id, &user("zed")).await.unwrap_err();
        assert_eq!(err, LobbyError::UserNotFound(user("zed")));
    }

    #[tokio::test]
    async fn public_lobby_needs_no_invite() {
        let h = harness();
        let id = h
            .coord
            .create_session(&user("h"), "Open", GameSettings::default(), Visibility::Public)
            .await
            .unwrap()
            .value
            .id;
        let view = h.coord.join(&user("g"), &id).await.unwrap().value;
        assert_eq!(view.players.len(), 2);
    }

    #[tokio::test]
    async fn join_missing_lobby_is_not_found() {
        let h = harness();
        let sid = session("nope");
        let err = h.coord.join(&user("a"), &sid).await.unwrap_err();
        assert_eq!(err, LobbyError::SessionNotFound(sid));
    }

    #[tokio::test]
    async fn failed_join_write_leaves_cache_and_clients_alone() {
        let h = harness();
        let id = h.lobby(&[], GameSettings::default()).await;
        h.coord.invite(&user("h"), &id, &user("a")).await.unwrap();
        let mut rx = h.connect("h");
        let before = h.cache.get(&id);

        h.store.set_fail_writes(true);
        let err = h.coord.join(&user("a"), &id).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(h.cache.get(&id), before);
        assert!(drain(&mut rx).is_empty());
        h.store.set_fail_writes(false);
        assert!(h.store.get_member(&id, &user("a")).await.unwrap().is_none());
        let record = h.store.get_session(&id).await.unwrap().unwrap();
        assert!(record.authorized.contains(&user("a")));

        h.coord.join(&user("a"), &id).await.unwrap();
    }

    #[tokio::test]
    async fn failed_member_insert_restores_invitation() {
        let h = harness();
        let id = h.lobby(&[], GameSettings::default()).await;
        h.coord.invite(&user("h"), &id, &user("a")).await.unwrap();

        // Consuming the invitation succeeds, adding the member does not.
        h.store.fail_one_write_after(1);
        let err = h.coord.join(&user("a"), &id).await.unwrap_err();
        assert!(err.is_retryable());

        assert!(h.store.get_member(&id, &user("a")).await.unwrap().is_none());
        let record = h.store.get_session(&id).await.unwrap().unwrap();
        assert!(record.authorized.contains(&user("a")));
        h.coord.join(&user("a"), &id).await.unwrap();
        let record = h.store.get_session(&id).await.unwrap().unwrap();
        assert!(!record.authorized.contains(&user("a")));
    }

    #[tokio::test]
    async fn stalled_store_times_out() {
        let h = harness_with(CoordinatorOptions {
            store_timeout: Duration::from_millis(20),
            ..CoordinatorOptions::default()
        });
        let id = h.lobby(&[], GameSettings::default()).await;
        h.store.set_latency(Duration::from_millis(200));
        let err = h.coord.set_ready(&user("h"), &id, true).await.unwrap_err();
        assert_eq!(err, LobbyError::StoreTimeout);
        assert!(err.is_retryable());
        assert_eq!(h.coord.busy_sessions(), 0);
    }

    #[tokio::test]
    async fn concurrent_leaves_close_the_lobby_once() {
        let h = harness();
        let id = h.lobby(&["a", "b", "c"], GameSettings::default()).await;
        let mut tasks = Vec::new();
        for who in ["h", "a", "b", "c"] {
            let coord = Arc::clone(&h.coord);
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                coord.leave(&user(who), &id).await.unwrap().value
            }));
        }
        let mut closed = 0;
        for t in tasks {
            if t.await.unwrap() == LeaveResult::SessionClosed {
                closed += 1;
            }
        }
        assert_eq!(closed, 1);
        assert!(h.store.get_session(&id).await.unwrap().is_none());
        assert!(!h.cache.contains(&id));
        assert_eq!(h.coord.busy_sessions(), 0);
    }

    #[tokio::test]
    async fn concurrent_joins_all_land() {
        let h = harness();
        let id = h
            .coord
            .create_session(&user("h"), "Open", GameSettings::default(), Visibility::Public)
            .await
            .unwrap()
            .value
            .id;
        let mut tasks = Vec::new();
        for who in ["a", "b", "c", "g"] {
            let coord = Arc::clone(&h.coord);
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                coord.join(&user(who), &id).await.unwrap();
                coord.set_ready(&user(who), &id, true).await.unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        let cached = h.cache.get(&id).unwrap();
        assert_eq!(cached.players.len(), 5);
        assert_eq!(h.store.list_members(&id).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn cache_refills_from_store() {
        let h = harness();
        let id = h.lobby(&["a"], GameSettings::default()).await;
        h.coord.set_ready(&user("a"), &id, true).await.unwrap();
        h.cache.remove_session(&id);

        let view = h.coord.session_view(&id).await.unwrap().value;
        assert!(h.cache.contains(&id));
        assert_eq!(view.players[1].status, Some(MemberStatus::Ready));
    }

    #[tokio::test]
    async fn start_game_guards() {
        let h = harness();
        let id = h.lobby(&["a"], settings_with_questions(2)).await;

        let err = h
            .coord
            .start_game(&user("a"), &id, serde_json::json!([]))
            .await
            .unwrap_err();
        assert!(matches!(err, LobbyError::Unauthorized(_)));

        let err = h
            .coord
            .start_game(&user("h"), &id, serde_json::json!([]))
            .await
            .unwrap_err();
        assert!(matches!(err, LobbyError::Forbidden(_)));

        h.coord.set_ready(&user("h"), &id, true).await.unwrap();
        h.coord.set_ready(&user("a"), &id, true).await.unwrap();
        h.coord
            .start_game(&user("h"), &id, serde_json::json!([]))
            .await
            .unwrap();
        let err = h
            .coord
            .start_game(&user("h"), &id, serde_json::json!([]))
            .await
            .unwrap_err();
        assert!(matches!(err, LobbyError::Conflict(_)));
    }

    #[tokio::test]
    async fn full_game_ranks_and_persists() {
        let h = harness();
        let id = h.lobby(&["a"], settings_with_questions(2)).await;
        h.coord.set_ready(&user("h"), &id, true).await.unwrap();
        h.coord.set_ready(&user("a"), &id, true).await.unwrap();
        let mut rx_a = h.connect("a");

        let early = h
            .coord
            .submit_answer(&user("a"), &id, "q0", true, 1)
            .await
            .unwrap_err();
        assert!(matches!(early, LobbyError::Conflict(_)));

        let started = h
            .coord
            .start_game(&user("h"), &id, serde_json::json!({ "questions": ["q1", "q2"] }))
            .await
            .unwrap();
        assert_eq!(started.value.settings.total_questions(), 2);
        let msgs = drain(&mut rx_a);
        assert!(msgs.iter().any(|m| matches!(m, ServerMessage::GameStart(g) if g.total_questions == 2)));

        h.coord.submit_answer(&user("h"), &id, "q1", true, 10).await.unwrap();
        h.coord.submit_answer(&user("h"), &id, "q2", true, 5).await.unwrap();
        let err = h
            .coord
            .submit_answer(&user("h"), &id, "q3", true, 5)
            .await
            .unwrap_err();
        assert!(matches!(err, LobbyError::Conflict(_)));

        h.coord.submit_answer(&user("a"), &id, "q1", false, 10).await.unwrap();
        let last = h.coord.submit_answer(&user("a"), &id, "q2", true, 3).await.unwrap();
        assert_eq!(last.message, "game over");
        let order: Vec<_> = last.value.iter().map(|r| (r.id.clone(), r.rank)).collect();
        assert_eq!(order, vec![(user("h"), 1), (user("a"), 2)]);

        let record = h.store.get_session(&id).await.unwrap().unwrap();
        assert_eq!(record.status, LifecycleStatus::Finished);
        let a_row = h.store.get_member(&id, &user("a")).await.unwrap().unwrap();
        assert_eq!(a_row.progress.score, 3);
        assert_eq!(a_row.progress.incorrect_items, vec!["q1"]);

        let msgs = drain(&mut rx_a);
        assert!(msgs.iter().any(|m| matches!(m, ServerMessage::ScoreUpdate(_))));
        assert!(msgs.iter().any(|m| matches!(m, ServerMessage::PlayerProgressUpdate(_))));
        assert!(msgs.iter().any(|m| matches!(m, ServerMessage::GameEnd(_))));
    }

    #[tokio::test]
    async fn answers_outside_a_game_conflict() {
        let h = harness();
        let id = h.lobby(&[], GameSettings::default()).await;
        let err = h
            .coord
            .submit_answer(&user("h"), &id, "q1", true, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, LobbyError::Conflict(_)));
    }

    #[tokio::test]
    async fn leaving_last_unfinished_player_ends_game() {
        let h = harness();
        let id = h.lobby(&["a"], settings_with_questions(1)).await;
        h.coord.set_ready(&user("h"), &id, true).await.unwrap();
        h.coord.set_ready(&user("a"), &id, true).await.unwrap();
        h.coord
            .start_game(&user("h"), &id, serde_json::json!(null))
            .await
            .unwrap();
        h.coord.submit_answer(&user("h"), &id, "q1", true, 2).await.unwrap();
        h.coord.leave(&user("a"), &id).await.unwrap();
        assert_eq!(h.cache.get(&id).unwrap().status, LifecycleStatus::Finished);
    }
}
