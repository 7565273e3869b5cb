use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;

use quizlobby_core::ids::SessionId;

type LockTable = Arc<Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>>;

/// One async mutex per session id.
///
/// Operations on the same session run one at a time in lock order; different
/// sessions never contend. The table itself is locked only long enough to
/// find or insert an entry. An entry is dropped once no guard holds or waits
/// on it, so the table stays proportional to the sessions in use.
#[derive(Default, Clone)]
pub struct SessionLocks {
    table: LockTable,
}

/// Exclusive access to one session until dropped.
pub struct SessionGuard {
    guard: Option<OwnedMutexGuard<()>>,
    _entry: TableEntry,
}

/// Interest in one table entry. Dropping it prunes the entry once nothing
/// else holds or waits on the lock, including when an acquire is cancelled
/// while waiting.
struct TableEntry {
    session: SessionId,
    table: LockTable,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, session: &SessionId) -> SessionGuard {
        let entry = TableEntry {
            session: session.clone(),
            table: Arc::clone(&self.table),
        };
        let lock = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(table.entry(session.clone()).or_default())
        };
        let guard = lock.lock_owned().await;
        SessionGuard {
            guard: Some(guard),
            _entry: entry,
        }
    }

    /// Number of sessions with a held or awaited lock.
    pub fn active(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        // Release before the entry checks who still references the lock.
        self.guard.take();
    }
}

impl Drop for TableEntry {
    fn drop(&mut self) {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if table
            .get(&self.session)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            table.remove(&self.session);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use quizlobby_core::test_helpers::session;

    #[tokio::test]
    async fn same_session_is_serialized() {
        let locks = SessionLocks::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = Arc::clone(&inside);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire(&session("s1")).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_sessions_do_not_block() {
        let locks = SessionLocks::new();
        let _a = locks.acquire(&session("a")).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire(&session("b"))).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn idle_entries_are_pruned() {
        let locks = SessionLocks::new();
        {
            let _g = locks.acquire(&session("a")).await;
            assert_eq!(locks.active(), 1);
        }
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn abandoned_waiter_does_not_leak_entry() {
        let locks = SessionLocks::new();
        let first = locks.acquire(&session("a")).await;
        let waiter_session = session("a");
        let mut waiter = Box::pin(locks.acquire(&waiter_session));
        assert!(futures::poll!(waiter.as_mut()).is_pending());

        drop(first);
        assert_eq!(locks.active(), 1);
        drop(waiter);
        assert_eq!(locks.active(), 0);

        let _again = locks.acquire(&session("a")).await;
        assert_eq!(locks.active(), 1);
    }

    #[tokio::test]
    async fn waiter_keeps_entry_alive() {
        let locks = SessionLocks::new();
        let first = locks.acquire(&session("a")).await;
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.acquire(&session("a")).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(first);
        assert_eq!(locks.active(), 1);
        waiter.await.unwrap();
        assert_eq!(locks.active(), 0);
    }
}
