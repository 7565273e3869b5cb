//! Ports to the durable roster store and the user directory, plus in-memory
//! adapters used by the binary and the tests.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use quizlobby_core::ids::{SessionId, UserId};
use quizlobby_core::member::{MemberProgress, MemberRecord, MemberStatus, UserProfile};
use quizlobby_core::session::{LifecycleStatus, SessionRecord};

use crate::error::{LobbyError, StoreError};

/// Await a store call with a deadline. Expiry becomes the retryable
/// [`LobbyError::StoreTimeout`] so a stalled backend releases the session lock.
pub async fn bounded<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, LobbyError> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result.map_err(LobbyError::from),
        Err(_) => Err(LobbyError::StoreTimeout),
    }
}

/// Durable, authoritative record of lobbies, membership and authorizations.
///
/// Each call is atomic on its own. No transaction spans calls, so the
/// coordinator orders them: store write, then cache mirror, then broadcast.
#[async_trait]
pub trait RosterStore: Send + Sync {
    async fn create_session(&self, record: SessionRecord) -> Result<(), StoreError>;
    async fn get_session(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError>;
    async fn get_member(
        &self,
        session: &SessionId,
        user: &UserId,
    ) -> Result<Option<MemberRecord>, StoreError>;
    /// Members ordered by join order.
    async fn list_members(&self, session: &SessionId) -> Result<Vec<MemberRecord>, StoreError>;
    async fn add_member(
        &self,
        session: &SessionId,
        user: &UserId,
        name: &str,
        status: MemberStatus,
    ) -> Result<MemberRecord, StoreError>;
    async fn update_member_status(
        &self,
        session: &SessionId,
        user: &UserId,
        status: MemberStatus,
    ) -> Result<(), StoreError>;
    async fn remove_member(
        &self,
        session: &SessionId,
        user: &UserId,
    ) -> Result<Option<MemberRecord>, StoreError>;
    async fn save_progress(
        &self,
        session: &SessionId,
        user: &UserId,
        progress: &MemberProgress,
    ) -> Result<(), StoreError>;
    async fn add_authorized(&self, session: &SessionId, user: &UserId) -> Result<(), StoreError>;
    /// Returns whether an authorization was present.
    async fn remove_authorized(
        &self,
        session: &SessionId,
        user: &UserId,
    ) -> Result<bool, StoreError>;
    async fn set_host(&self, session: &SessionId, user: &UserId) -> Result<(), StoreError>;
    async fn set_session_status(
        &self,
        session: &SessionId,
        status: LifecycleStatus,
    ) -> Result<(), StoreError>;
    /// Deletes the lobby and every membership row.
    async fn delete_session(&self, session: &SessionId) -> Result<(), StoreError>;
}

/// Read-only identity lookup.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_user(&self, id: &UserId) -> Result<Option<UserProfile>, StoreError>;
}

#[derive(Default)]
struct RosterTables {
    sessions: HashMap<SessionId, SessionRecord>,
    members: HashMap<SessionId, Vec<MemberRecord>>,
    next_seq: u64,
}

/// In-process roster store.
///
/// Supports injected read and write failures and latency so callers can
/// exercise the error and timeout paths.
#[derive(Default)]
pub struct MemoryRosterStore {
    tables: Mutex<RosterTables>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    /// Writes still allowed before a single injected failure.
    write_budget: Mutex<Option<u32>>,
    latency_ms: AtomicU64,
}

impl MemoryRosterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with `StoreError::Unavailable`.
    pub fn set_fail_writes(&self, fail: bool) {
        *self.budget() = None;
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Let the next `allowed` writes through and fail the one after.
    pub fn fail_one_write_after(&self, allowed: u32) {
        *self.budget() = Some(allowed);
    }

    fn budget(&self) -> MutexGuard<'_, Option<u32>> {
        self.write_budget.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every subsequent read fail with `StoreError::Unavailable`.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(ms, Ordering::SeqCst);
    }

    fn tables(&self) -> MutexGuard<'_, RosterTables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn delay(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    async fn simulate_read(&self) -> Result<(), StoreError> {
        self.delay().await;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected read failure".into()));
        }
        Ok(())
    }

    async fn simulate_write(&self) -> Result<(), StoreError> {
        self.delay().await;
        {
            let mut budget = self.budget();
            match *budget {
                Some(0) => {
                    *budget = None;
                    return Err(StoreError::Unavailable("injected write failure".into()));
                },
                Some(n) => *budget = Some(n - 1),
                None => {},
            }
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        Ok(())
    }
}

fn session_mut<'a>(
    tables: &'a mut RosterTables,
    id: &SessionId,
) -> Result<&'a mut SessionRecord, StoreError> {
    tables
        .sessions
        .get_mut(id)
        .ok_or_else(|| StoreError::Missing(format!("session {id}")))
}

#[async_trait]
impl RosterStore for MemoryRosterStore {
    async fn create_session(&self, record: SessionRecord) -> Result<(), StoreError> {
        self.simulate_write().await?;
        let mut tables = self.tables();
        if tables.sessions.contains_key(&record.id) {
            return Err(StoreError::Duplicate(format!("session {}", record.id)));
        }
        tables.members.insert(record.id.clone(), Vec::new());
        tables.sessions.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError> {
        self.simulate_read().await?;
        Ok(self.tables().sessions.get(id).cloned())
    }

    async fn get_member(
        &self,
        session: &SessionId,
        user: &UserId,
    ) -> Result<Option<MemberRecord>, StoreError> {
        self.simulate_read().await?;
        Ok(self
            .tables()
            .members
            .get(session)
            .and_then(|rows| rows.iter().find(|m| &m.user_id == user))
            .cloned())
    }

    async fn list_members(&self, session: &SessionId) -> Result<Vec<MemberRecord>, StoreError> {
        self.simulate_read().await?;
        let mut rows = self
            .tables()
            .members
            .get(session)
            .cloned()
            .unwrap_or_default();
        rows.sort_by_key(|m| m.join_seq);
        Ok(rows)
    }

    async fn add_member(
        &self,
        session: &SessionId,
        user: &UserId,
        name: &str,
        status: MemberStatus,
    ) -> Result<MemberRecord, StoreError> {
        self.simulate_write().await?;
        let mut tables = self.tables();
        if !tables.sessions.contains_key(session) {
            return Err(StoreError::Missing(format!("session {session}")));
        }
        let join_seq = tables.next_seq;
        tables.next_seq += 1;
        let rows = tables.members.entry(session.clone()).or_default();
        if rows.iter().any(|m| &m.user_id == user) {
            return Err(StoreError::Duplicate(format!("member {user} in {session}")));
        }
        let record = MemberRecord {
            session_id: session.clone(),
            user_id: user.clone(),
            name: name.to_string(),
            status,
            progress: MemberProgress::default(),
            join_seq,
        };
        rows.push(record.clone());
        Ok(record)
    }

    async fn update_member_status(
        &self,
        session: &SessionId,
        user: &UserId,
        status: MemberStatus,
    ) -> Result<(), StoreError> {
        self.simulate_write().await?;
        let mut tables = self.tables();
        let row = tables
            .members
            .get_mut(session)
            .and_then(|rows| rows.iter_mut().find(|m| &m.user_id == user))
            .ok_or_else(|| StoreError::Missing(format!("member {user} in {session}")))?;
        row.status = status;
        Ok(())
    }

    async fn remove_member(
        &self,
        session: &SessionId,
        user: &UserId,
    ) -> Result<Option<MemberRecord>, StoreError> {
        self.simulate_write().await?;
        let mut tables = self.tables();
        let Some(rows) = tables.members.get_mut(session) else {
            return Ok(None);
        };
        let removed = rows
            .iter()
            .position(|m| &m.user_id == user)
            .map(|idx| rows.remove(idx));
        Ok(removed)
    }

    async fn save_progress(
        &self,
        session: &SessionId,
        user: &UserId,
        progress: &MemberProgress,
    ) -> Result<(), StoreError> {
        self.simulate_write().await?;
        let mut tables = self.tables();
        let row = tables
            .members
            .get_mut(session)
            .and_then(|rows| rows.iter_mut().find(|m| &m.user_id == user))
            .ok_or_else(|| StoreError::Missing(format!("member {user} in {session}")))?;
        row.progress = progress.clone();
        Ok(())
    }

    async fn add_authorized(&self, session: &SessionId, user: &UserId) -> Result<(), StoreError> {
        self.simulate_write().await?;
        let mut tables = self.tables();
        session_mut(&mut tables, session)?
            .authorized
            .insert(user.clone());
        Ok(())
    }

    async fn remove_authorized(
        &self,
        session: &SessionId,
        user: &UserId,
    ) -> Result<bool, StoreError> {
        self.simulate_write().await?;
        let mut tables = self.tables();
        Ok(session_mut(&mut tables, session)?.authorized.remove(user))
    }

    async fn set_host(&self, session: &SessionId, user: &UserId) -> Result<(), StoreError> {
        self.simulate_write().await?;
        let mut tables = self.tables();
        session_mut(&mut tables, session)?.host_id = user.clone();
        Ok(())
    }

    async fn set_session_status(
        &self,
        session: &SessionId,
        status: LifecycleStatus,
    ) -> Result<(), StoreError> {
        self.simulate_write().await?;
        let mut tables = self.tables();
        session_mut(&mut tables, session)?.status = status;
        Ok(())
    }

    async fn delete_session(&self, session: &SessionId) -> Result<(), StoreError> {
        self.simulate_write().await?;
        let mut tables = self.tables();
        tables.sessions.remove(session);
        tables.members.remove(session);
        Ok(())
    }
}

/// In-process user directory.
#[derive(Default)]
pub struct MemoryUserDirectory {
    users: Mutex<HashMap<UserId, UserProfile>>,
}

impl MemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or rename a user.
    pub fn upsert(&self, profile: UserProfile) {
        self.users
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(profile.id.clone(), profile);
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn find_user(&self, id: &UserId) -> Result<Option<UserProfile>, StoreError> {
        Ok(self
            .users
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned())
    }
}
