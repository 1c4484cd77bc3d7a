//! Where variable values live outside the in-memory store: browser storage for
//! variables flagged `persist_value`, and the server for variables bound to a
//! backend store.

mod backend;
mod storage;

pub use backend::*;
pub use storage::*;

use crate::error::Result;
use serde_json::Value;
use std::sync::Arc;
use var_graph::variable::Uid;

/// The storage tiers a runtime persists to.
///
/// Values of `persist_value` variables are written to the local tier, which
/// every tab of the app shares. Keys in both tiers carry the session id, see
/// [`session_key`].
#[derive(Debug, Clone)]
pub struct Persistence {
    session_id: Arc<str>,
    local: Arc<dyn StorageArea>,
    session: Arc<dyn StorageArea>,
}

impl Persistence {
    /// Creates a persistence layer over the given tiers.
    pub fn new(
        session_id: impl Into<Arc<str>>,
        local: Arc<dyn StorageArea>,
        session: Arc<dyn StorageArea>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            local,
            session,
        }
    }

    /// The current session id.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The persisted value of `uid`, if there is one that can be read.
    pub fn load(&self, uid: &str) -> Option<Value> {
        let raw = self.local.get(&session_key(&self.session_id, uid))?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(
                    %uid,
                    error = %e,
                    "ignoring unreadable persisted value"
                );
                None
            }
        }
    }

    /// Persists the value of `uid`.
    pub fn save(&self, uid: &str, value: &Value) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.local.set(&session_key(&self.session_id, uid), raw)
    }

    /// The variable a storage event from another tab applies to, with its new
    /// value.
    ///
    /// Events for other sessions, removals, and unreadable values are ignored.
    pub fn read_event(&self, event: &StorageEvent) -> Option<(Uid, Value)> {
        let (session, uid) = parse_session_key(&event.key)?;
        if session != &*self.session_id {
            return None;
        }
        let value = serde_json::from_str(event.new_value.as_deref()?).ok()?;
        Some((Uid::from(uid), value))
    }

    /// Removes every persisted key that belongs to a session other than
    /// `current`, from both tiers. Returns the number of keys removed.
    pub fn clean_session_cache(&self, current: &str) -> usize {
        let mut removed = 0;
        for area in [&self.local, &self.session] {
            for key in area.keys() {
                if parse_session_key(&key)
                    .is_some_and(|(session, _)| session != current)
                {
                    area.remove(&key);
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            tracing::debug!(
                removed,
                %current,
                "purged persisted values of old sessions"
            );
        }
        removed
    }
}
