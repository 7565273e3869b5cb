use quizlobby_core::ids::{IdError, SessionId, UserId};

/// Failures reported by a roster store adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Connectivity or backend failure; the caller may retry later.
    #[error("roster store unavailable: {0}")]
    Unavailable(String),
    #[error("duplicate record: {0}")]
    Duplicate(String),
    #[error("record missing: {0}")]
    Missing(String),
}

/// Every way a coordinator operation can fail.
///
/// `Display` is the human-readable message returned to the caller, so each
/// variant names who or what was missing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LobbyError {
    #[error("invalid {field}: {source}")]
    InvalidId {
        field: &'static str,
        #[source]
        source: IdError,
    },
    #[error("invalid lobby name: {0}")]
    InvalidName(String),
    #[error("no such lobby: {0}")]
    SessionNotFound(SessionId),
    #[error("user {user} is not in lobby {session}")]
    MemberNotFound { session: SessionId, user: UserId },
    #[error("unknown user: {0}")]
    UserNotFound(UserId),
    /// Caller is not the host of the lobby.
    #[error("not your lobby: {0}")]
    Unauthorized(String),
    /// Caller lacks permission for a lobby it may otherwise see.
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("roster store timed out")]
    StoreTimeout,
}

impl LobbyError {
    /// Parse a client-supplied user id, mapping failures to `InvalidId`.
    pub fn parse_user(field: &'static str, raw: &str) -> Result<UserId, Self> {
        UserId::parse(raw).map_err(|source| Self::InvalidId { field, source })
    }

    /// Parse a client-supplied session id, mapping failures to `InvalidId`.
    pub fn parse_session(raw: &str) -> Result<SessionId, Self> {
        SessionId::parse(raw).map_err(|source| Self::InvalidId {
            field: "session id",
            source,
        })
    }

    /// Transient failures the calling boundary may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreTimeout | Self::Store(StoreError::Unavailable(_))
        )
    }
}
