//! Keyed concurrent store of upto sessions.
//!
//! Sessions live in a [`DashMap`] of per-session async mutex slots: the map
//! shard lock is only held long enough to clone the slot handle, and every
//! read or mutation of session state happens under that session's own lock,
//! so mutators are serialized per id and readers never observe a torn
//! session.

use alloy_primitives::U256;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{Session, SessionId, SessionStatus};
use crate::timestamp::UnixTimestamp;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AccrueError {
    #[error("session not found")]
    NotFound,
    #[error("session is {0}, not accepting charges")]
    NotOpen(SessionStatus),
    #[error("charge would exceed the session cap")]
    CapExceeded,
    #[error("session deadline is imminent")]
    DeadlineImminent,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("session not found")]
    NotFound,
    #[error("session is {actual}, expected {expected}")]
    Conflict {
        expected: SessionStatus,
        actual: SessionStatus,
    },
}

#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<SessionId, Arc<Mutex<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: &SessionId) -> Option<Arc<Mutex<Session>>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Inserts a new session. Returns `false` without touching the stored
    /// session when the id is already taken.
    pub fn insert(&self, session: Session) -> bool {
        match self.sessions.entry(session.id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(Mutex::new(session)));
                true
            }
        }
    }

    /// Snapshot of a session's current state.
    pub async fn get(&self, id: &SessionId) -> Option<Session> {
        let slot = self.slot(id)?;
        let session = slot.lock().await;
        Some(session.clone())
    }

    /// Whole-record read-modify-write under the session's guard. Returns
    /// the updated snapshot.
    pub async fn update<F>(&self, id: &SessionId, mutate: F) -> Option<Session>
    where
        F: FnOnce(&mut Session),
    {
        let slot = self.slot(id)?;
        let mut session = slot.lock().await;
        mutate(&mut session);
        Some(session.clone())
    }

    /// Atomically accrues a metered charge.
    ///
    /// Admits the charge iff the session is open, the cap covers
    /// `settled_total + pending_spent + delta`, and the deadline is further
    /// out than the buffer.
    pub async fn accrue(
        &self,
        id: &SessionId,
        delta: U256,
        deadline_buffer_secs: u64,
    ) -> Result<Session, AccrueError> {
        let slot = self.slot(id).ok_or(AccrueError::NotFound)?;
        let mut session = slot.lock().await;

        if session.status != SessionStatus::Open {
            return Err(AccrueError::NotOpen(session.status));
        }
        if session.deadline <= UnixTimestamp::now() + deadline_buffer_secs {
            return Err(AccrueError::DeadlineImminent);
        }
        let projected = session
            .settled_total
            .checked_add(session.pending_spent)
            .and_then(|spent| spent.checked_add(delta))
            .ok_or(AccrueError::CapExceeded)?;
        if projected > session.cap {
            return Err(AccrueError::CapExceeded);
        }

        session.pending_spent += delta;
        session.touched_at_ms = UnixTimestamp::now_millis();
        Ok(session.clone())
    }

    /// Compare-and-swap on the session status.
    pub async fn transition(
        &self,
        id: &SessionId,
        from: SessionStatus,
        to: SessionStatus,
    ) -> Result<Session, TransitionError> {
        let slot = self.slot(id).ok_or(TransitionError::NotFound)?;
        let mut session = slot.lock().await;
        if session.status != from {
            return Err(TransitionError::Conflict {
                expected: from,
                actual: session.status,
            });
        }
        session.status = to;
        Ok(session.clone())
    }

    /// Snapshot of the stored session ids, for the sweeper.
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drops closed sessions whose last activity is older than `ttl_ms`.
    ///
    /// A session is never evicted before it is closed and its settlement
    /// receipt, if any, has been recorded.
    pub async fn evict_expired(&self, ttl_ms: u64) -> usize {
        let cutoff = UnixTimestamp::now_millis().saturating_sub(ttl_ms);
        let mut evicted = 0;
        for id in self.session_ids() {
            let Some(session) = self.get(&id).await else {
                continue;
            };
            if session.status != SessionStatus::Closed {
                continue;
            }
            let last_activity = session
                .last_settlement
                .as_ref()
                .map(|record| record.at_ms)
                .unwrap_or(session.touched_at_ms);
            if last_activity < cutoff {
                self.sessions.remove(&id);
                evicted += 1;
            }
        }
        evicted
    }

    /// Startup sweep over sessions stuck in `settling`.
    ///
    /// The outcome of their in-flight transaction is unknown, so they are
    /// logged and left for operator action rather than force-closed or
    /// retried.
    pub async fn recover_settling(&self) -> Vec<SessionId> {
        let mut stuck = Vec::new();
        for id in self.session_ids() {
            let Some(session) = self.get(&id).await else {
                continue;
            };
            if session.status == SessionStatus::Settling {
                tracing::warn!(
                    session = %id,
                    pending = %session.pending_spent,
                    "Session stuck in settling, outcome unknown; leaving for operator action"
                );
                stuck.push(id);
            }
        }
        stuck
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing;

    #[tokio::test]
    async fn accrue_increments_pending_spent() {
        let store = SessionStore::new();
        assert!(store.insert(testing::session("s1", 1_000_000, 3600)));

        let session = store
            .accrue(&SessionId::from("s1"), U256::from(100_000u64), 60)
            .await
            .unwrap();
        assert_eq!(session.pending_spent, U256::from(100_000u64));

        let session = store
            .accrue(&SessionId::from("s1"), U256::from(50_000u64), 60)
            .await
            .unwrap();
        assert_eq!(session.pending_spent, U256::from(150_000u64));
    }

    #[tokio::test]
    async fn accrue_admits_exactly_up_to_cap() {
        let store = SessionStore::new();
        store.insert(testing::session("s1", 100, 3600));
        let id = SessionId::from("s1");

        store.accrue(&id, U256::from(100u64), 60).await.unwrap();
        assert_eq!(
            store.accrue(&id, U256::from(1u64), 60).await,
            Err(AccrueError::CapExceeded)
        );
    }

    #[tokio::test]
    async fn accrue_rejects_unknown_session() {
        let store = SessionStore::new();
        assert_eq!(
            store
                .accrue(&SessionId::from("ghost"), U256::from(1u64), 60)
                .await,
            Err(AccrueError::NotFound)
        );
    }

    #[tokio::test]
    async fn accrue_rejects_non_open_sessions() {
        let store = SessionStore::new();
        store.insert(testing::session("s1", 100, 3600));
        let id = SessionId::from("s1");
        store
            .transition(&id, SessionStatus::Open, SessionStatus::Closed)
            .await
            .unwrap();

        assert_eq!(
            store.accrue(&id, U256::from(1u64), 60).await,
            Err(AccrueError::NotOpen(SessionStatus::Closed))
        );
    }

    #[tokio::test]
    async fn accrue_rejects_imminent_deadline() {
        let store = SessionStore::new();
        store.insert(testing::session("s1", 100, 30));

        assert_eq!(
            store.accrue(&SessionId::from("s1"), U256::from(1u64), 60).await,
            Err(AccrueError::DeadlineImminent)
        );
    }

    #[tokio::test]
    async fn transition_is_compare_and_swap() {
        let store = SessionStore::new();
        store.insert(testing::session("s1", 100, 3600));
        let id = SessionId::from("s1");

        let session = store
            .transition(&id, SessionStatus::Open, SessionStatus::Settling)
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Settling);

        assert_eq!(
            store
                .transition(&id, SessionStatus::Open, SessionStatus::Settling)
                .await,
            Err(TransitionError::Conflict {
                expected: SessionStatus::Open,
                actual: SessionStatus::Settling,
            })
        );
    }

    #[tokio::test]
    async fn insert_does_not_clobber_existing_session() {
        let store = SessionStore::new();
        store.insert(testing::session("s1", 100, 3600));
        store
            .accrue(&SessionId::from("s1"), U256::from(40u64), 60)
            .await
            .unwrap();

        assert!(!store.insert(testing::session("s1", 100, 3600)));
        let session = store.get(&SessionId::from("s1")).await.unwrap();
        assert_eq!(session.pending_spent, U256::from(40u64));
    }

    #[tokio::test]
    async fn concurrent_accruals_never_exceed_cap() {
        let store = Arc::new(SessionStore::new());
        store.insert(testing::session("s1", 1_000, 3600));

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .accrue(&SessionId::from("s1"), U256::from(100u64), 60)
                    .await
                    .is_ok()
            }));
        }
        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 10);
        let session = store.get(&SessionId::from("s1")).await.unwrap();
        assert_eq!(session.pending_spent, U256::from(1_000u64));
        assert!(session.settled_total + session.pending_spent <= session.cap);
    }

    #[tokio::test]
    async fn evicts_only_stale_closed_sessions() {
        let store = SessionStore::new();
        store.insert(testing::session("open", 100, 3600));
        store.insert(testing::session("closed", 100, 3600));
        let closed = SessionId::from("closed");
        store
            .update(&closed, |session| {
                session.status = SessionStatus::Closed;
                session.touched_at_ms = 0;
            })
            .await
            .unwrap();

        let evicted = store.evict_expired(1_000).await;
        assert_eq!(evicted, 1);
        assert!(store.get(&closed).await.is_none());
        assert!(store.get(&SessionId::from("open")).await.is_some());
    }

    #[tokio::test]
    async fn recover_settling_reports_stuck_sessions() {
        let store = SessionStore::new();
        store.insert(testing::session("ok", 100, 3600));
        store.insert(testing::session("stuck", 100, 3600));
        store
            .transition(
                &SessionId::from("stuck"),
                SessionStatus::Open,
                SessionStatus::Settling,
            )
            .await
            .unwrap();

        let stuck = store.recover_settling().await;
        assert_eq!(stuck, vec![SessionId::from("stuck")]);
        // left untouched, pending operator action
        let session = store.get(&SessionId::from("stuck")).await.unwrap();
        assert_eq!(session.status, SessionStatus::Settling);
    }
}
