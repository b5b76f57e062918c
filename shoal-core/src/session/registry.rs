//! Per-connection session registry.
//!
//! Client session ids are only unique within one connection, so every
//! connection owns its own registry. Writers are `SESSION_INIT` and close;
//! every packet reads it. Once drained for connection close the registry
//! accepts no more sessions.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::session::info::SessionInfo;

#[derive(Default)]
struct Entries {
    sessions: HashMap<i32, Arc<SessionInfo>>,
    closed: bool,
}

/// Result of registering a session.
pub enum Registration {
    Added,
    /// The id was in use; the previous session must be closed by the caller.
    Replaced(Arc<SessionInfo>),
    /// The connection closed first; the new session must be closed by the caller.
    Rejected,
}

#[derive(Default)]
pub struct SessionRegistry {
    entries: RwLock<Entries>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, client_session_id: i32) -> Option<Arc<SessionInfo>> {
        self.read().sessions.get(&client_session_id).cloned()
    }

    pub fn insert(&self, info: Arc<SessionInfo>) -> Registration {
        let mut entries = self.write();
        if entries.closed {
            return Registration::Rejected;
        }
        match entries.sessions.insert(info.client_session_id(), info) {
            Some(replaced) => Registration::Replaced(replaced),
            None => Registration::Added,
        }
    }

    /// Remove `info` if it is still the registered session for its id.
    pub fn remove(&self, info: &Arc<SessionInfo>) -> bool {
        let mut entries = self.write();
        match entries.sessions.get(&info.client_session_id()) {
            Some(current) if Arc::ptr_eq(current, info) => {
                entries.sessions.remove(&info.client_session_id());
                true
            }
            _ => false,
        }
    }

    /// Take every session and refuse later inserts.
    pub fn drain(&self) -> Vec<Arc<SessionInfo>> {
        let mut entries = self.write();
        entries.closed = true;
        entries.sessions.drain().map(|(_, info)| info).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.read().closed
    }

    pub fn len(&self) -> usize {
        self.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
