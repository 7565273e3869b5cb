use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use quizlobby_core::ids::{SessionId, UserId};
use quizlobby_core::member::UserProfile;
use quizlobby_core::net::messages::{ActionResultMsg, ClientMessage, ServerMessage};
use quizlobby_core::net::protocol::{decode_client_message, encode_server_message};
use quizlobby_core::session::Visibility;

use crate::coordinator::LeaveResult;
use crate::error::LobbyError;
use crate::registry::UserSender;
use crate::state::{AppState, ConnectionGuard};

/// Query string of `/ws`. The user id is trusted: authentication happens in
/// front of this server.
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub user_id: String,
    pub name: Option<String>,
}

pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Result<Response, StatusCode> {
    let max_ws = state.config.limits.max_ws_connections;
    let current = state.ws_connection_count.load(Ordering::Relaxed);
    if current >= max_ws {
        tracing::warn!(current, max = max_ws, "WS connection limit reached");
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    let user = UserId::parse(&params.user_id).map_err(|e| {
        tracing::debug!(error = %e, "Rejected connection with invalid user id");
        StatusCode::BAD_REQUEST
    })?;
    let name = params
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(user.as_str())
        .to_string();
    if name.chars().count() > state.config.lobby.max_name_len || name.chars().any(char::is_control)
    {
        return Err(StatusCode::BAD_REQUEST);
    }

    let max_size = state.config.limits.max_message_size;
    Ok(ws
        .max_message_size(max_size)
        .on_upgrade(move |socket| handle_socket(socket, state, user, name))
        .into_response())
}

/// Per-socket bookkeeping.
struct Connection {
    user: UserId,
    /// Own delivery channel, so replies reach this socket even if the user
    /// has since connected elsewhere.
    tx: UserSender,
    /// Lobbies entered over this socket, marked absent when it closes.
    sessions: BTreeSet<SessionId>,
}

async fn handle_socket(socket: WebSocket, state: AppState, user: UserId, name: String) {
    let _guard = ConnectionGuard::new(Arc::clone(&state.ws_connection_count));
    state.directory.upsert(UserProfile {
        id: user.clone(),
        name,
    });

    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<Bytes>(state.config.limits.player_message_buffer);
    state.registry.register(user.clone(), tx.clone());
    spawn_writer(ws_sender, rx);
    tracing::info!(user = %user, "Player connected");

    let mut conn = Connection {
        user,
        tx,
        sessions: BTreeSet::new(),
    };
    read_loop(&mut ws_receiver, &state, &mut conn).await;

    // A newer socket for the same user owns presence from here on.
    if !state.registry.unregister_channel(&conn.user, &conn.tx) {
        tracing::info!(user = %conn.user, "Player disconnected, replaced by newer connection");
        return;
    }
    for session in &conn.sessions {
        if let Err(e) = state
            .coordinator
            .apply_presence(&conn.user, session, true)
            .await
        {
            tracing::debug!(
                user = %conn.user, session = %session, error = %e,
                "Could not mark player absent"
            );
        }
    }
    tracing::info!(user = %conn.user, lobbies = conn.sessions.len(), "Player disconnected");
}

fn spawn_writer(mut ws_sender: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Bytes>) {
    tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            if ws_sender.send(Message::Binary(data)).await.is_err() {
                break;
            }
        }
    });
}

async fn read_loop(
    ws_receiver: &mut SplitStream<WebSocket>,
    state: &AppState,
    conn: &mut Connection,
) {
    let max_size = state.config.limits.max_message_size;
    while let Some(Ok(msg)) = ws_receiver.next().await {
        let data = match msg {
            Message::Binary(d) => d,
            Message::Close(_) => break,
            _ => continue,
        };
        if data.is_empty() || data.len() > max_size {
            continue;
        }

        let client_msg = match decode_client_message(&data) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(user = %conn.user, error = %e, "Dropped undecodable message");
                continue;
            },
        };
        let reply = dispatch(state, conn, client_msg).await;
        send_reply(conn, &reply);
    }
}

fn send_reply(conn: &Connection, reply: &ActionResultMsg) {
    let msg = ServerMessage::ActionResult(reply.clone());
    match encode_server_message(&msg) {
        Ok(data) => {
            if let Err(e) = conn.tx.try_send(Bytes::from(data)) {
                tracing::debug!(user = %conn.user, error = %e, "Failed to queue action result");
            }
        },
        Err(e) => tracing::warn!(user = %conn.user, error = %e, "Failed to encode action result"),
    }
}

/// Run one client action and turn its outcome into a reply.
async fn dispatch(state: &AppState, conn: &mut Connection, msg: ClientMessage) -> ActionResultMsg {
    let action = msg.message_type().name().to_string();
    match handle(state, conn, msg).await {
        Ok((message, session_id)) => ActionResultMsg {
            action,
            success: true,
            message,
            retryable: false,
            session_id,
        },
        Err(e) => {
            tracing::debug!(user = %conn.user, action = %action, error = %e, "Action failed");
            ActionResultMsg {
                action,
                success: false,
                message: e.to_string(),
                retryable: e.is_retryable(),
                session_id: None,
            }
        },
    }
}

async fn handle(
    state: &AppState,
    conn: &mut Connection,
    msg: ClientMessage,
) -> Result<(String, Option<SessionId>), LobbyError> {
    let coordinator = &state.coordinator;
    let user = &conn.user;
    match msg {
        ClientMessage::CreateLobby(m) => {
            let visibility = if m.public {
                Visibility::Public
            } else {
                Visibility::Private
            };
            let out = coordinator
                .create_session(user, &m.name, m.settings, visibility)
                .await?;
            conn.sessions.insert(out.value.id.clone());
            Ok((out.message, Some(out.value.id)))
        },
        ClientMessage::InviteToLobby(m) => {
            let session = LobbyError::parse_session(&m.session_id)?;
            let target = LobbyError::parse_user("target id", &m.target_id)?;
            let out = coordinator.invite(user, &session, &target).await?;
            Ok((out.message, Some(session)))
        },
        ClientMessage::JoinLobby(m) => {
            let session = LobbyError::parse_session(&m.session_id)?;
            let out = coordinator.join(user, &session).await?;
            conn.sessions.insert(session.clone());
            Ok((out.message, Some(session)))
        },
        ClientMessage::LeaveLobby(m) => {
            let session = LobbyError::parse_session(&m.session_id)?;
            let out = coordinator.leave(user, &session).await?;
            conn.sessions.remove(&session);
            let message = match out.value {
                LeaveResult::HostMigrated { new_host } => {
                    format!("{}; {new_host} is the new host", out.message)
                },
                _ => out.message,
            };
            Ok((message, Some(session)))
        },
        ClientMessage::SetReady(m) => {
            let session = LobbyError::parse_session(&m.session_id)?;
            let out = coordinator.set_ready(user, &session, m.ready).await?;
            Ok((out.message, Some(session)))
        },
        ClientMessage::Presence(m) => {
            let session = LobbyError::parse_session(&m.session_id)?;
            let out = coordinator
                .apply_presence(user, &session, !m.present)
                .await?;
            if m.present {
                conn.sessions.insert(session.clone());
            }
            Ok((out.message, Some(session)))
        },
        ClientMessage::StartGame(m) => {
            let session = LobbyError::parse_session(&m.session_id)?;
            let out = coordinator.start_game(user, &session, m.content).await?;
            Ok((out.message, Some(session)))
        },
        ClientMessage::SubmitAnswer(m) => {
            let session = LobbyError::parse_session(&m.session_id)?;
            let out = coordinator
                .submit_answer(user, &session, &m.item, m.correct, m.points)
                .await?;
            Ok((out.message, Some(session)))
        },
    }
}
