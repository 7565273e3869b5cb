use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::ids::{SessionId, UserId};

/// Question count used when a lobby's settings do not specify one.
pub const DEFAULT_TOTAL_QUESTIONS: u32 = 10;

/// Lifecycle of a lobby session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    #[default]
    Waiting,
    Playing,
    Finished,
}

impl LifecycleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Playing => "playing",
            Self::Finished => "finished",
        }
    }
}

/// Who may join without an invitation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Private,
    Public,
}

/// Opaque game configuration chosen by the host.
///
/// The engine only interprets `totalQuestions`; everything else is passed
/// through to clients untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GameSettings(pub serde_json::Value);

impl Default for GameSettings {
    fn default() -> Self {
        Self(serde_json::json!({ "totalQuestions": DEFAULT_TOTAL_QUESTIONS }))
    }
}

impl GameSettings {
    pub fn total_questions(&self) -> u32 {
        self.0
            .get("totalQuestions")
            .and_then(serde_json::Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(DEFAULT_TOTAL_QUESTIONS)
    }
}

/// Durable lobby row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub name: String,
    pub host_id: UserId,
    pub visibility: Visibility,
    /// Users invited by the host who have not joined yet.
    pub authorized: BTreeSet<UserId>,
    pub settings: GameSettings,
    pub status: LifecycleStatus,
}

impl SessionRecord {
    /// Whether `user` may join without further checks.
    pub fn admits(&self, user: &UserId) -> bool {
        self.visibility == Visibility::Public
            || &self.host_id == user
            || self.authorized.contains(user)
    }
}
