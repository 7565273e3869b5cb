use serde::{Deserialize, Serialize};

use crate::ids::{SessionId, UserId};

/// Participation status of a member inside a lobby.
///
/// Invitations are tracked separately as pending authorizations on the
/// session, so there is no `Invited` variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Joined,
    Ready,
    Disconnected,
}

impl MemberStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Joined => "joined",
            Self::Ready => "ready",
            Self::Disconnected => "disconnected",
        }
    }

    /// Whether a member in this status has a live entry in the session cache.
    pub fn is_live(self) -> bool {
        !matches!(self, Self::Disconnected)
    }
}

impl std::fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gameplay counters that the session cache owns while a session is active.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberProgress {
    pub score: u32,
    pub progress: u32,
    pub validated_items: Vec<String>,
    pub incorrect_items: Vec<String>,
}

/// Durable membership row, keyed by (session, user).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub name: String,
    pub status: MemberStatus,
    pub progress: MemberProgress,
    /// Store-assigned, strictly increasing across all rows. Defines join order.
    pub join_seq: u64,
}

/// Public identity of a user as returned by the user directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub name: String,
}

/// A player's live entry in the session cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivePlayer {
    pub id: UserId,
    pub name: String,
    pub status: MemberStatus,
    pub progress: MemberProgress,
}

impl LivePlayer {
    pub fn new(id: UserId, name: String, status: MemberStatus) -> Self {
        Self {
            id,
            name,
            status,
            progress: MemberProgress::default(),
        }
    }
}
