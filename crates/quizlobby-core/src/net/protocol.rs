use serde::{Deserialize, Serialize};

use super::messages::{
    ActionResultMsg, ClientMessage, CreateLobbyMsg, GameEndMsg, GameStartMsg, InviteToLobbyMsg,
    JoinLobbyMsg, LeaveLobbyMsg, LobbyInvitationMsg, LobbyUpdateMsg, MessageType,
    PlayerLeftGameMsg, PlayerProgressUpdateMsg, PresenceMsg, ScoreUpdateMsg, ServerMessage,
    SetReadyMsg, StartGameMsg, SubmitAnswerMsg,
};

/// Maximum message payload size in bytes.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024; // 64 KiB

#[derive(Debug)]
pub enum ProtocolError {
    EmptyMessage,
    UnknownMessageType(u8),
    PayloadTooLarge(usize),
    SerializeError(String),
    DeserializeError(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyMessage => write!(f, "empty message"),
            Self::UnknownMessageType(b) => write!(f, "unknown message type: 0x{b:02x}"),
            Self::PayloadTooLarge(size) => {
                write!(
                    f,
                    "payload too large: {size} bytes (max {MAX_MESSAGE_SIZE})"
                )
            },
            Self::SerializeError(e) => write!(f, "serialize error: {e}"),
            Self::DeserializeError(e) => write!(f, "deserialize error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Encode a serializable payload with a 1-byte type prefix.
pub fn encode_message<T: Serialize>(
    msg_type: MessageType,
    payload: &T,
) -> Result<Vec<u8>, ProtocolError> {
    let payload_bytes =
        rmp_serde::to_vec(payload).map_err(|e| ProtocolError::SerializeError(e.to_string()))?;
    let total = 1 + payload_bytes.len();
    if total > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::PayloadTooLarge(total));
    }
    let mut buf = Vec::with_capacity(total);
    buf.push(msg_type as u8);
    buf.extend_from_slice(&payload_bytes);
    Ok(buf)
}

/// Encode a `ClientMessage` to wire format.
pub fn encode_client_message(msg: &ClientMessage) -> Result<Vec<u8>, ProtocolError> {
    let ty = msg.message_type();
    match msg {
        ClientMessage::CreateLobby(m) => encode_message(ty, m),
        ClientMessage::InviteToLobby(m) => encode_message(ty, m),
        ClientMessage::JoinLobby(m) => encode_message(ty, m),
        ClientMessage::LeaveLobby(m) => encode_message(ty, m),
        ClientMessage::SetReady(m) => encode_message(ty, m),
        ClientMessage::Presence(m) => encode_message(ty, m),
        ClientMessage::StartGame(m) => encode_message(ty, m),
        ClientMessage::SubmitAnswer(m) => encode_message(ty, m),
    }
}

/// Encode a `ServerMessage` to wire format.
pub fn encode_server_message(msg: &ServerMessage) -> Result<Vec<u8>, ProtocolError> {
    let ty = msg.message_type();
    match msg {
        ServerMessage::LobbyInvitation(m) => encode_message(ty, m),
        ServerMessage::LobbyUpdate(m) => encode_message(ty, m),
        ServerMessage::GameStart(m) => encode_message(ty, m),
        ServerMessage::PlayerProgressUpdate(m) => encode_message(ty, m),
        ServerMessage::ScoreUpdate(m) => encode_message(ty, m),
        ServerMessage::GameEnd(m) => encode_message(ty, m),
        ServerMessage::PlayerLeftGame(m) => encode_message(ty, m),
        ServerMessage::ActionResult(m) => encode_message(ty, m),
    }
}

/// Extract the message type byte from raw wire data.
pub fn decode_message_type(data: &[u8]) -> Result<MessageType, ProtocolError> {
    if data.is_empty() {
        return Err(ProtocolError::EmptyMessage);
    }
    MessageType::from_byte(data[0]).ok_or(ProtocolError::UnknownMessageType(data[0]))
}

/// Decode a MessagePack payload (bytes after the type prefix).
pub fn decode_payload<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, ProtocolError> {
    if data.is_empty() {
        return Err(ProtocolError::EmptyMessage);
    }
    rmp_serde::from_slice(&data[1..]).map_err(|e| ProtocolError::DeserializeError(e.to_string()))
}

/// Decode raw wire data into a `ClientMessage`.
pub fn decode_client_message(data: &[u8]) -> Result<ClientMessage, ProtocolError> {
    let msg_type = decode_message_type(data)?;
    match msg_type {
        MessageType::CreateLobby => Ok(ClientMessage::CreateLobby(decode_payload::<
            CreateLobbyMsg,
        >(data)?)),
        MessageType::InviteToLobby => Ok(ClientMessage::InviteToLobby(decode_payload::<
            InviteToLobbyMsg,
        >(data)?)),
        MessageType::JoinLobby => Ok(ClientMessage::JoinLobby(decode_payload::<JoinLobbyMsg>(
            data,
        )?)),
        MessageType::LeaveLobby => Ok(ClientMessage::LeaveLobby(decode_payload::<
            LeaveLobbyMsg,
        >(data)?)),
        MessageType::SetReady => Ok(ClientMessage::SetReady(decode_payload::<SetReadyMsg>(
            data,
        )?)),
        MessageType::Presence => Ok(ClientMessage::Presence(decode_payload::<PresenceMsg>(
            data,
        )?)),
        MessageType::StartGame => Ok(ClientMessage::StartGame(decode_payload::<StartGameMsg>(
            data,
        )?)),
        MessageType::SubmitAnswer => Ok(ClientMessage::SubmitAnswer(decode_payload::<
            SubmitAnswerMsg,
        >(data)?)),
        _ => Err(ProtocolError::UnknownMessageType(data[0])),
    }
}

/// Decode raw wire data into a `ServerMessage`.
pub fn decode_server_message(data: &[u8]) -> Result<ServerMessage, ProtocolError> {
    let msg_type = decode_message_type(data)?;
    match msg_type {
        MessageType::LobbyInvitation => Ok(ServerMessage::LobbyInvitation(decode_payload::<
            LobbyInvitationMsg,
        >(data)?)),
        MessageType::LobbyUpdate => Ok(ServerMessage::LobbyUpdate(decode_payload::<
            LobbyUpdateMsg,
        >(data)?)),
        MessageType::GameStart => Ok(ServerMessage::GameStart(decode_payload::<GameStartMsg>(
            data,
        )?)),
        MessageType::PlayerProgressUpdate => Ok(ServerMessage::PlayerProgressUpdate(
            decode_payload::<PlayerProgressUpdateMsg>(data)?,
        )),
        MessageType::ScoreUpdate => Ok(ServerMessage::ScoreUpdate(decode_payload::<
            ScoreUpdateMsg,
        >(data)?)),
        MessageType::GameEnd => Ok(ServerMessage::GameEnd(decode_payload::<GameEndMsg>(data)?)),
        MessageType::PlayerLeftGame => Ok(ServerMessage::PlayerLeftGame(decode_payload::<
            PlayerLeftGameMsg,
        >(data)?)),
        MessageType::ActionResult => Ok(ServerMessage::ActionResult(decode_payload::<
            ActionResultMsg,
        >(data)?)),
        _ => Err(ProtocolError::UnknownMessageType(data[0])),
    }
}
