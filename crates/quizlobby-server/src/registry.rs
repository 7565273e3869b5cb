use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use bytes::Bytes;
use tokio::sync::mpsc;

use quizlobby_core::ids::UserId;
use quizlobby_core::net::messages::ServerMessage;
use quizlobby_core::net::protocol::encode_server_message;

/// Per-user sender for outbound WebSocket binary messages.
/// Bounded so a slow client cannot exhaust memory.
/// Uses `Bytes` for zero-copy cloning when broadcasting to many users.
pub type UserSender = mpsc::Sender<Bytes>;

/// Maps each user to at most one live delivery channel.
///
/// Delivery is best-effort: sending to a user without a channel, or whose
/// channel is full or closed, is a silent drop. Messages to one user are not
/// ordered across a reconnect race, because the old and new socket may both
/// be draining at the same time.
#[derive(Default)]
pub struct ConnectionRegistry {
    channels: RwLock<HashMap<UserId, UserSender>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel, replacing any previous one for this user.
    pub fn register(&self, user: UserId, sender: UserSender) {
        let replaced = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user.clone(), sender);
        if replaced.is_some() {
            tracing::debug!(user = %user, "Replaced existing connection");
        }
    }

    pub fn unregister(&self, user: &UserId) {
        self.channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(user);
    }

    /// Remove the user's channel only if it is still `sender`. Returns whether
    /// it was removed. A socket tearing down after its user reconnected
    /// elsewhere must not evict the newer channel.
    pub fn unregister_channel(&self, user: &UserId, sender: &UserSender) -> bool {
        let mut channels = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match channels.get(user) {
            Some(current) if current.same_channel(sender) => {
                channels.remove(user);
                true
            },
            _ => false,
        }
    }

    pub fn is_connected(&self, user: &UserId) -> bool {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(user)
    }

    pub fn connected_count(&self) -> usize {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Send an already-encoded frame.
    pub fn send_encoded(&self, user: &UserId, data: Bytes) {
        let sender = self
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user)
            .cloned();
        let Some(sender) = sender else {
            tracing::trace!(user = %user, "No connection, dropping message");
            return;
        };
        if let Err(e) = sender.try_send(data) {
            tracing::debug!(
                user = %user, error = %e,
                "Failed to send to user (slow or disconnected)"
            );
        }
    }

    /// Encode and send one message.
    pub fn send(&self, user: &UserId, msg: &ServerMessage) {
        match encode_server_message(msg) {
            Ok(data) => self.send_encoded(user, Bytes::from(data)),
            Err(e) => {
                tracing::warn!(
                    user = %user, kind = msg.message_type().name(), error = %e,
                    "Failed to encode message"
                );
            },
        }
    }
}
