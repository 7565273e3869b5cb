use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;

use quizlobby_core::ids::{SessionId, UserId};
use quizlobby_core::member::{LivePlayer, MemberRecord};
use quizlobby_core::net::messages::{
    GameEndMsg, GameStartMsg, GameStateView, LobbyUpdateMsg, PlayerLeftGameMsg,
    PlayerProgressUpdateMsg, PlayerView, ScoreUpdateMsg, ServerMessage,
};
use quizlobby_core::net::protocol::encode_server_message;
use quizlobby_core::session::{GameSettings, LifecycleStatus};
use quizlobby_core::time::now_millis;

use crate::cache::{CachedSession, SessionCache};
use crate::error::LobbyError;
use crate::registry::ConnectionRegistry;
use crate::store::{RosterStore, bounded};

/// Merged, store-and-cache reconciled view of one lobby.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    pub id: SessionId,
    pub name: String,
    pub host_id: UserId,
    pub settings: GameSettings,
    pub status: LifecycleStatus,
    pub players: Vec<PlayerView>,
}

impl SessionView {
    pub fn lobby_update(&self) -> LobbyUpdateMsg {
        LobbyUpdateMsg {
            session_id: self.id.clone(),
            players: self.players.clone(),
            host_id: self.host_id.clone(),
            settings: self.settings.clone(),
            status: self.status,
        }
    }
}

/// Overlay cached gameplay fields on durable membership rows.
///
/// Rows define who is in the lobby and in what order. A live cache entry wins
/// for status and counters. A parked entry (member currently absent) supplies
/// counters only, since the row already says `disconnected`. Without any
/// cache entry the row's own values are used.
pub fn merge_roster(rows: &[MemberRecord], cached: Option<&CachedSession>) -> Vec<PlayerView> {
    rows.iter()
        .map(|row| {
            let live = cached.and_then(|c| c.player(&row.user_id));
            let parked = cached.and_then(|c| c.parked.get(&row.user_id));
            let status = live.map_or(row.status, |p| p.status);
            let progress = live.or(parked).map_or(&row.progress, |p| &p.progress);
            PlayerView {
                id: row.user_id.clone(),
                name: row.name.clone(),
                status: Some(status),
                score: Some(progress.score),
                progress: Some(progress.progress),
                validated_items: Some(progress.validated_items.clone()),
                incorrect_items: Some(progress.incorrect_items.clone()),
            }
        })
        .collect()
}

fn progress_row(p: &LivePlayer) -> PlayerView {
    PlayerView {
        id: p.id.clone(),
        name: p.name.clone(),
        status: None,
        score: Some(p.progress.score),
        progress: Some(p.progress.progress),
        validated_items: Some(p.progress.validated_items.clone()),
        incorrect_items: Some(p.progress.incorrect_items.clone()),
    }
}

fn score_row(p: &LivePlayer) -> PlayerView {
    PlayerView {
        validated_items: None,
        incorrect_items: None,
        ..progress_row(p)
    }
}

/// Builds snapshots and fans them out through the connection registry.
///
/// Delivery is best-effort; nothing here reports a dropped send. Errors are
/// only returned when the roster store cannot be read.
pub struct SnapshotBroadcaster {
    store: Arc<dyn RosterStore>,
    cache: Arc<SessionCache>,
    registry: Arc<ConnectionRegistry>,
    store_timeout: Duration,
}

impl SnapshotBroadcaster {
    pub fn new(
        store: Arc<dyn RosterStore>,
        cache: Arc<SessionCache>,
        registry: Arc<ConnectionRegistry>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            registry,
            store_timeout,
        }
    }

    /// Encode once, then hand the same buffer to every recipient.
    fn fan_out<'a>(
        &self,
        session: &SessionId,
        recipients: impl IntoIterator<Item = &'a UserId>,
        msg: &ServerMessage,
    ) {
        let data = match encode_server_message(msg) {
            Ok(data) => Bytes::from(data),
            Err(e) => {
                tracing::warn!(
                    session = %session, kind = msg.message_type().name(), error = %e,
                    "Failed to encode broadcast"
                );
                return;
            },
        };
        let mut sent = 0usize;
        for user in recipients {
            self.registry.send_encoded(user, data.clone());
            sent += 1;
        }
        tracing::trace!(
            session = %session, kind = msg.message_type().name(), recipients = sent,
            "Broadcast"
        );
    }

    /// Current merged view, or `None` if the lobby does not exist.
    pub async fn session_view(&self, id: &SessionId) -> Result<Option<SessionView>, LobbyError> {
        let rows = bounded(self.store_timeout, self.store.list_members(id)).await?;
        if let Some(cached) = self.cache.get(id) {
            return Ok(Some(SessionView {
                id: id.clone(),
                name: cached.name.clone(),
                host_id: cached.host_id.clone(),
                settings: cached.settings.clone(),
                status: cached.status,
                players: merge_roster(&rows, Some(&cached)),
            }));
        }
        let Some(record) = bounded(self.store_timeout, self.store.get_session(id)).await? else {
            return Ok(None);
        };
        Ok(Some(SessionView {
            id: id.clone(),
            name: record.name,
            host_id: record.host_id,
            settings: record.settings,
            status: record.status,
            players: merge_roster(&rows, None),
        }))
    }

    /// Send `lobby_update` to every durable member, connected or not.
    pub async fn broadcast_lobby_update(&self, id: &SessionId) -> Result<(), LobbyError> {
        if let Some(view) = self.session_view(id).await? {
            self.publish_lobby_update(&view);
        }
        Ok(())
    }

    /// Send an already merged view as `lobby_update`.
    pub fn publish_lobby_update(&self, view: &SessionView) {
        let msg = ServerMessage::LobbyUpdate(view.lobby_update());
        self.fan_out(&view.id, view.players.iter().map(|p| &p.id), &msg);
    }

    /// Announce a started game to live players. Question content is stripped.
    pub fn broadcast_game_start(&self, id: &SessionId) {
        let Some(cached) = self.cache.get(id) else {
            return;
        };
        let Some(game) = cached.game.as_ref() else {
            return;
        };
        let msg = ServerMessage::GameStart(GameStartMsg {
            session_id: id.clone(),
            start_time: game.start_time,
            total_questions: game.settings.total_questions(),
            settings: game.settings.clone(),
            game_state: GameStateView {
                start_time: game.start_time,
                settings: game.settings.clone(),
            },
        });
        self.fan_out(id, cached.players.iter().map(|p| &p.id), &msg);
    }

    /// Counters and item lists of every live player, straight from the cache.
    pub fn broadcast_player_progress(&self, id: &SessionId) {
        let Some(cached) = self.cache.get(id) else {
            return;
        };
        let msg = ServerMessage::PlayerProgressUpdate(PlayerProgressUpdateMsg {
            session_id: id.clone(),
            players: cached.players.iter().map(progress_row).collect(),
        });
        self.fan_out(id, cached.players.iter().map(|p| &p.id), &msg);
    }

    pub fn broadcast_score_update(&self, id: &SessionId, updated: &UserId) {
        let Some(cached) = self.cache.get(id) else {
            return;
        };
        let msg = ServerMessage::ScoreUpdate(ScoreUpdateMsg {
            session_id: id.clone(),
            players: cached.players.iter().map(score_row).collect(),
            updated_player_id: updated.clone(),
        });
        self.fan_out(id, cached.players.iter().map(|p| &p.id), &msg);
    }

    pub fn broadcast_game_end(&self, id: &SessionId) {
        let Some(cached) = self.cache.get(id) else {
            return;
        };
        let msg = ServerMessage::GameEnd(GameEndMsg {
            session_id: id.clone(),
        });
        self.fan_out(id, cached.players.iter().map(|p| &p.id), &msg);
    }

    /// Tell the remaining live players that `player` left.
    pub fn broadcast_player_left(&self, id: &SessionId, player: &UserId, player_name: &str) {
        let Some(cached) = self.cache.get(id) else {
            return;
        };
        let msg = ServerMessage::PlayerLeftGame(PlayerLeftGameMsg {
            session_id: id.clone(),
            player_id: player.clone(),
            player_name: player_name.to_string(),
            timestamp: now_millis(),
        });
        self.fan_out(
            id,
            cached
                .players
                .iter()
                .map(|p| &p.id)
                .filter(|uid| *uid != player),
            &msg,
        );
    }

    /// Unicast to one user.
    pub fn send_to(&self, user: &UserId, msg: &ServerMessage) {
        self.registry.send(user, msg);
    }
}
