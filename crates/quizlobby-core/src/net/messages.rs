use serde::{Deserialize, Serialize};

use crate::ids::{SessionId, UserId};
use crate::member::MemberStatus;
use crate::session::{GameSettings, LifecycleStatus};

/// Network message type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    // Client -> Server
    CreateLobby = 0x01,
    InviteToLobby = 0x02,
    JoinLobby = 0x03,
    LeaveLobby = 0x04,
    SetReady = 0x05,
    Presence = 0x06,
    StartGame = 0x07,
    SubmitAnswer = 0x08,

    // Server -> Client
    LobbyInvitation = 0x10,
    LobbyUpdate = 0x11,
    GameStart = 0x12,
    PlayerProgressUpdate = 0x13,
    ScoreUpdate = 0x14,
    GameEnd = 0x15,
    PlayerLeftGame = 0x16,

    // Server -> Client (reply to the acting connection only)
    ActionResult = 0x30,
}

impl MessageType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::CreateLobby),
            0x02 => Some(Self::InviteToLobby),
            0x03 => Some(Self::JoinLobby),
            0x04 => Some(Self::LeaveLobby),
            0x05 => Some(Self::SetReady),
            0x06 => Some(Self::Presence),
            0x07 => Some(Self::StartGame),
            0x08 => Some(Self::SubmitAnswer),
            0x10 => Some(Self::LobbyInvitation),
            0x11 => Some(Self::LobbyUpdate),
            0x12 => Some(Self::GameStart),
            0x13 => Some(Self::PlayerProgressUpdate),
            0x14 => Some(Self::ScoreUpdate),
            0x15 => Some(Self::GameEnd),
            0x16 => Some(Self::PlayerLeftGame),
            0x30 => Some(Self::ActionResult),
            _ => None,
        }
    }

    /// Stable snake_case name used by clients and in logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::CreateLobby => "create_lobby",
            Self::InviteToLobby => "invite_to_lobby",
            Self::JoinLobby => "join_lobby",
            Self::LeaveLobby => "leave_lobby",
            Self::SetReady => "set_ready",
            Self::Presence => "presence",
            Self::StartGame => "start_game",
            Self::SubmitAnswer => "submit_answer",
            Self::LobbyInvitation => "lobby_invitation",
            Self::LobbyUpdate => "lobby_update",
            Self::GameStart => "game_start",
            Self::PlayerProgressUpdate => "player_progress_update",
            Self::ScoreUpdate => "score_update",
            Self::GameEnd => "game_end",
            Self::PlayerLeftGame => "player_left_game",
            Self::ActionResult => "action_result",
        }
    }

    pub fn is_client_message(self) -> bool {
        (self as u8) < 0x10
    }
}

// ---------------------------------------------------------------------------
// Client -> Server
// ---------------------------------------------------------------------------

/// Identifiers arrive as raw strings and are validated by the server before
/// any lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLobbyMsg {
    pub name: String,
    pub settings: GameSettings,
    pub public: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteToLobbyMsg {
    pub session_id: String,
    pub target_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinLobbyMsg {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveLobbyMsg {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetReadyMsg {
    pub session_id: String,
    pub ready: bool,
}

/// Liveness signal from the client's heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMsg {
    pub session_id: String,
    pub present: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartGameMsg {
    pub session_id: String,
    /// Question payload produced by the content service. Never echoed back.
    pub content: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitAnswerMsg {
    pub session_id: String,
    pub item: String,
    pub correct: bool,
    pub points: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    CreateLobby(CreateLobbyMsg),
    InviteToLobby(InviteToLobbyMsg),
    JoinLobby(JoinLobbyMsg),
    LeaveLobby(LeaveLobbyMsg),
    SetReady(SetReadyMsg),
    Presence(PresenceMsg),
    StartGame(StartGameMsg),
    SubmitAnswer(SubmitAnswerMsg),
}

impl ClientMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::CreateLobby(_) => MessageType::CreateLobby,
            Self::InviteToLobby(_) => MessageType::InviteToLobby,
            Self::JoinLobby(_) => MessageType::JoinLobby,
            Self::LeaveLobby(_) => MessageType::LeaveLobby,
            Self::SetReady(_) => MessageType::SetReady,
            Self::Presence(_) => MessageType::Presence,
            Self::StartGame(_) => MessageType::StartGame,
            Self::SubmitAnswer(_) => MessageType::SubmitAnswer,
        }
    }
}

// ---------------------------------------------------------------------------
// Server -> Client
// ---------------------------------------------------------------------------

/// One row of a player list. Which optional fields are filled depends on the
/// message: lobby updates carry everything, score updates only counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerView {
    pub id: UserId,
    pub name: String,
    pub status: Option<MemberStatus>,
    pub score: Option<u32>,
    pub progress: Option<u32>,
    pub validated_items: Option<Vec<String>>,
    pub incorrect_items: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbyInvitationMsg {
    pub session_id: SessionId,
    pub host_id: UserId,
    pub host_name: String,
    pub session_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbyUpdateMsg {
    pub session_id: SessionId,
    pub players: Vec<PlayerView>,
    pub host_id: UserId,
    pub settings: GameSettings,
    pub status: LifecycleStatus,
}

/// Game state as shown to clients: the question content is stripped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStateView {
    pub start_time: u64,
    pub settings: GameSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStartMsg {
    pub session_id: SessionId,
    /// Unix epoch milliseconds.
    pub start_time: u64,
    pub total_questions: u32,
    pub settings: GameSettings,
    pub game_state: GameStateView,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerProgressUpdateMsg {
    pub session_id: SessionId,
    pub players: Vec<PlayerView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreUpdateMsg {
    pub session_id: SessionId,
    pub players: Vec<PlayerView>,
    pub updated_player_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameEndMsg {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerLeftGameMsg {
    pub session_id: SessionId,
    pub player_id: UserId,
    pub player_name: String,
    /// Unix epoch milliseconds.
    pub timestamp: u64,
}

/// Outcome of one client action, sent only to the acting connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResultMsg {
    pub action: String,
    pub success: bool,
    pub message: String,
    pub retryable: bool,
    /// Session the action created or targeted, when known.
    pub session_id: Option<SessionId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    LobbyInvitation(LobbyInvitationMsg),
    LobbyUpdate(LobbyUpdateMsg),
    GameStart(GameStartMsg),
    PlayerProgressUpdate(PlayerProgressUpdateMsg),
    ScoreUpdate(ScoreUpdateMsg),
    GameEnd(GameEndMsg),
    PlayerLeftGame(PlayerLeftGameMsg),
    ActionResult(ActionResultMsg),
}

impl ServerMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::LobbyInvitation(_) => MessageType::LobbyInvitation,
            Self::LobbyUpdate(_) => MessageType::LobbyUpdate,
            Self::GameStart(_) => MessageType::GameStart,
            Self::PlayerProgressUpdate(_) => MessageType::PlayerProgressUpdate,
            Self::ScoreUpdate(_) => MessageType::ScoreUpdate,
            Self::GameEnd(_) => MessageType::GameEnd,
            Self::PlayerLeftGame(_) => MessageType::PlayerLeftGame,
            Self::ActionResult(_) => MessageType::ActionResult,
        }
    }
}
