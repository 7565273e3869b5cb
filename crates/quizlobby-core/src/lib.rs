pub mod ids;
pub mod member;
pub mod net;
pub mod ranking;
pub mod session;
pub mod time;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers {
    use std::collections::BTreeSet;

    use crate::ids::{SessionId, UserId};
    use crate::session::{GameSettings, LifecycleStatus, SessionRecord, Visibility};

    /// Parse a known-good user id.
    pub fn user(id: &str) -> UserId {
        UserId::parse(id).unwrap_or_else(|e| panic!("bad test user id {id:?}: {e}"))
    }

    /// Parse a known-good session id.
    pub fn session(id: &str) -> SessionId {
        SessionId::parse(id).unwrap_or_else(|e| panic!("bad test session id {id:?}: {e}"))
    }

    /// Settings with the given question count.
    pub fn settings_with_questions(total: u32) -> GameSettings {
        GameSettings(serde_json::json!({ "totalQuestions": total }))
    }

    /// A private waiting session hosted by `host`.
    pub fn make_session(id: &str, host: &str) -> SessionRecord {
        SessionRecord {
            id: session(id),
            name: format!("Lobby {id}"),
            host_id: user(host),
            visibility: Visibility::Private,
            authorized: BTreeSet::new(),
            settings: GameSettings::default(),
            status: LifecycleStatus::Waiting,
        }
    }
}
