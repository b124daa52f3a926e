//! Session registry: maps session IDs to their runtime state.
//!
//! Each session lives in its own [`SessionSlot`] with two locks:
//!
//! ```text
//! SessionRegistry ── RwLock<HashMap<SessionId, Arc<SessionSlot>>>
//!                                             │
//!                          ┌──────────────────┴──────────────────┐
//!                          │ state: Arc<Mutex<SessionState>>     │  roster, playback, channels
//!                          │ delivery: Arc<Mutex<()>>            │  fan-out turn
//!                          └─────────────────────────────────────┘
//! ```
//!
//! Mutations hold `state` only for the map update. The delivery turn is
//! taken before `state` is released, so fan-out for one session happens in
//! mutation order while the push loop itself runs outside `state`.
//! Unrelated sessions never share a lock beyond the brief registry lookup.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::protocol::SessionId;
use crate::session::SessionState;

/// Exclusive access to one session's state.
pub type SessionGuard = OwnedMutexGuard<SessionState>;

/// One session's state plus its delivery turn.
#[derive(Debug)]
pub struct SessionSlot {
    state: Arc<Mutex<SessionState>>,
    delivery: Arc<Mutex<()>>,
}

impl SessionSlot {
    fn new(id: SessionId) -> Self {
        Self {
            state: Arc::new(Mutex::new(SessionState::new(id))),
            delivery: Arc::new(Mutex::new(())),
        }
    }

    /// Enter the session's exclusive region.
    pub async fn lock(&self) -> SessionGuard {
        self.state.clone().lock_owned().await
    }

    /// Reserve the next fan-out turn. Call while holding [`Self::lock`].
    pub(crate) async fn delivery_turn(&self) -> OwnedMutexGuard<()> {
        self.delivery.clone().lock_owned().await
    }
}

/// In-memory registry of live sessions. Never touches persistence.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<SessionSlot>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the slot for `session_id`.
    ///
    /// Existing roster and playback data are never reset. The flag is
    /// `true` when a new slot was created.
    pub async fn get_or_create(&self, session_id: SessionId) -> (Arc<SessionSlot>, bool) {
        // Fast path: read lock
        {
            let sessions = self.sessions.read().await;
            if let Some(slot) = sessions.get(&session_id) {
                return (slot.clone(), false);
            }
        }

        // Slow path: write lock to create
        let mut sessions = self.sessions.write().await;
        // Double-check after acquiring write lock
        if let Some(slot) = sessions.get(&session_id) {
            return (slot.clone(), false);
        }

        let slot = Arc::new(SessionSlot::new(session_id));
        sessions.insert(session_id, slot.clone());
        (slot, true)
    }

    pub async fn get(&self, session_id: SessionId) -> Option<Arc<SessionSlot>> {
        self.sessions.read().await.get(&session_id).cloned()
    }

    pub async fn remove(&self, session_id: SessionId) -> Option<Arc<SessionSlot>> {
        self.sessions.write().await.remove(&session_id)
    }

    /// Remove only if the registered slot is `slot` itself.
    pub(crate) async fn remove_slot(&self, session_id: SessionId, slot: &Arc<SessionSlot>) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(&session_id) {
            Some(current) if Arc::ptr_eq(current, slot) => {
                sessions.remove(&session_id);
                true
            }
            _ => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// All registered session IDs, sorted.
    pub async fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) async fn slots(&self) -> Vec<Arc<SessionSlot>> {
        self.sessions.read().await.values().cloned().collect()
    }
}
