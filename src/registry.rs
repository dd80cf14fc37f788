//! The set of sessions a server currently has open.
//!
//! Every operation takes the one lock for the length of a map access and nothing else: no
//! I/O happens while it is held. Removal also marks the session `Closed` under the lock, so
//! no reader can find a closed session still listed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::session::{ConnectionId, SessionState};

type SessionMap = HashMap<ConnectionId, Arc<SessionState>>;

#[derive(Debug, Default)]
struct Inner {
    entries: Mutex<SessionMap>,
    idle: Notify,
}

/// Shared, cloneable handle to the session map.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Inner>,
}

impl ConnectionRegistry {
    pub fn new() -> ConnectionRegistry {
        ConnectionRegistry::default()
    }

    fn lock(&self) -> MutexGuard<'_, SessionMap> {
        // Each critical section is a single map operation, so a panicking holder cannot leave
        // the map half-updated.
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Lists a session. Returns `false` if its id was already present.
    pub fn add(&self, state: Arc<SessionState>) -> bool {
        let mut entries = self.lock();
        if entries.contains_key(&state.id()) {
            return false;
        }
        entries.insert(state.id(), state);
        true
    }

    /// Lists a session and returns a guard that unlists it when released or dropped.
    ///
    /// Returns `None` if the id is already listed: that entry belongs to another guard.
    pub fn register(&self, state: Arc<SessionState>) -> Option<Registration> {
        if !self.add(state.clone()) {
            return None;
        }
        Some(Registration {
            registry: self.clone(),
            state,
            released: false,
        })
    }

    /// Unlists a session and marks it `Closed`. Removing an absent id does nothing.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<SessionState>> {
        let mut entries = self.lock();
        let removed = entries.remove(&id);
        if let Some(state) = &removed {
            state.mark_closed();
        }
        if entries.is_empty() {
            self.inner.idle.notify_waiters();
        }
        removed
    }

    /// Visits every listed session under the lock. `visit` must not block.
    pub fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&Arc<SessionState>),
    {
        let entries = self.lock();
        for state in entries.values() {
            visit(state);
        }
    }

    /// A copy of the listed sessions, for callers that need to do more than `for_each` allows.
    pub fn snapshot(&self) -> Vec<Arc<SessionState>> {
        self.lock().values().cloned().collect()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Resolves once no session is listed.
    pub async fn wait_idle(&self) {
        loop {
            // Registered before checking so a removal in between still wakes us.
            let notified = self.inner.idle.notified();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// A session's place in the registry.
///
/// [`release`](Registration::release) unlists it; dropping an unreleased guard does the same,
/// so a session task that panics or is aborted still leaves the registry.
#[derive(Debug)]
pub struct Registration {
    registry: ConnectionRegistry,
    state: Arc<SessionState>,
    released: bool,
}

impl Registration {
    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    pub fn release(mut self) {
        self.unlist();
    }

    fn unlist(&mut self) {
        if !self.released {
            self.released = true;
            self.registry.remove(self.state.id());
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.unlist();
    }
}
