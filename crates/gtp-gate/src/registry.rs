//! Session registry: session id → live session, plus an O(1) live count.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::session::Session;

#[derive(Default)]
pub struct Registry {
    sessions: DashMap<String, Arc<Session>>,
    count: AtomicI64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a session. Fails (returning it) if the id is already taken.
    pub fn insert(&self, session: Arc<Session>) -> Result<(), Arc<Session>> {
        match self.sessions.entry(session.id().to_owned()) {
            Entry::Occupied(_) => Err(session),
            Entry::Vacant(v) => {
                v.insert(session);
                self.count.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
        }
    }

    /// Remove `id` only if it still maps to `session`. Idempotent.
    pub fn remove(&self, id: &str, session: &Arc<Session>) -> bool {
        let removed = self.sessions.remove_if(id, |_, current| Arc::ptr_eq(current, session)).is_some();
        if removed {
            self.count.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|e| Arc::clone(e.value()))
    }

    /// Whether `id` still refers to exactly this session object.
    pub fn is_current(&self, id: &str, session: &Arc<Session>) -> bool {
        self.sessions.get(id).is_some_and(|e| Arc::ptr_eq(e.value(), session))
    }

    pub fn count(&self) -> i64 {
        self.count.load(Ordering::Acquire)
    }

    /// Visit sessions until `f` returns false.
    pub fn range(&self, mut f: impl FnMut(&Arc<Session>) -> bool) {
        for entry in self.sessions.iter() {
            if !f(entry.value()) {
                break;
            }
        }
    }

    pub fn each(&self, mut f: impl FnMut(&Arc<Session>)) {
        self.range(|s| {
            f(s);
            true
        });
    }
}
