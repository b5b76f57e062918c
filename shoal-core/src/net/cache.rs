//! Per-connection LRU of prepared statements and open results.
//!
//! Statements are cached under the packet id that created them and results
//! under the client-chosen result id. Clients renumber long-lived results
//! with `RESULT_CHANGE_ID` before they age out.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tracing::debug;

use crate::engine::{LocalResult, PreparedStatement};

pub enum CachedObject {
    Statement {
        session_key: u64,
        statement: Arc<dyn PreparedStatement>,
    },
    Result {
        session_key: u64,
        result: LocalResult,
    },
}

impl CachedObject {
    fn session_key(&self) -> u64 {
        match self {
            CachedObject::Statement { session_key, .. } | CachedObject::Result { session_key, .. } => {
                *session_key
            }
        }
    }

    fn close(&mut self) {
        match self {
            CachedObject::Statement { statement, .. } => statement.close(),
            CachedObject::Result { result, .. } => result.close(),
        }
    }
}

pub struct ObjectCache {
    entries: LruCache<i32, CachedObject>,
}

impl ObjectCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    fn insert(&mut self, id: i32, object: CachedObject) {
        if let Some((evicted_id, mut evicted)) = self.entries.push(id, object) {
            if evicted_id != id {
                debug!(id = evicted_id, "evicted cached object");
            }
            evicted.close();
        }
    }

    pub fn put_statement(&mut self, id: i32, session_key: u64, statement: Arc<dyn PreparedStatement>) {
        self.insert(
            id,
            CachedObject::Statement {
                session_key,
                statement,
            },
        );
    }

    pub fn put_result(&mut self, id: i32, session_key: u64, result: LocalResult) {
        self.insert(id, CachedObject::Result { session_key, result });
    }

    pub fn statement(&mut self, id: i32) -> Option<Arc<dyn PreparedStatement>> {
        match self.entries.get(&id) {
            Some(CachedObject::Statement { statement, .. }) => Some(statement.clone()),
            _ => None,
        }
    }

    pub fn result_mut(&mut self, id: i32) -> Option<&mut LocalResult> {
        match self.entries.get_mut(&id) {
            Some(CachedObject::Result { result, .. }) => Some(result),
            _ => None,
        }
    }

    /// Remove and close an object. Missing ids are ignored.
    pub fn remove(&mut self, id: i32) -> Option<CachedObject> {
        let mut removed = self.entries.pop(&id)?;
        removed.close();
        Some(removed)
    }

    /// Move an object to a new id, marking it most recently used.
    pub fn change_id(&mut self, old_id: i32, new_id: i32) -> bool {
        match self.entries.pop(&old_id) {
            Some(object) => {
                self.insert(new_id, object);
                true
            }
            None => false,
        }
    }

    /// Close every object that belongs to a session.
    pub fn evict_session(&mut self, session_key: u64) -> usize {
        let ids: Vec<i32> = self
            .entries
            .iter()
            .filter(|(_, object)| object.session_key() == session_key)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            self.remove(*id);
        }
        ids.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_protocol::Value;

    fn result() -> LocalResult {
        LocalResult::new(Vec::new(), vec![vec![Value::Int(1)]], false)
    }

    #[test]
    fn least_recently_used_result_is_evicted() {
        let mut cache = ObjectCache::new(2);
        cache.put_result(1, 1, result());
        cache.put_result(2, 1, result());
        assert!(cache.result_mut(1).is_some());
        cache.put_result(3, 1, result());
        assert!(cache.result_mut(2).is_none());
        assert!(cache.result_mut(1).is_some());
    }

    #[test]
    fn change_id_keeps_object_alive() {
        let mut cache = ObjectCache::new(2);
        cache.put_result(1, 1, result());
        cache.put_result(2, 1, result());
        assert!(cache.change_id(1, 5));
        cache.put_result(3, 1, result());
        assert!(cache.result_mut(5).is_some());
        assert!(cache.result_mut(1).is_none());
        assert!(!cache.change_id(1, 6));
    }

    #[test]
    fn remove_is_idempotent() {
        let mut cache = ObjectCache::new(4);
        cache.put_result(1, 1, result());
        assert!(cache.remove(1).is_some());
        assert!(cache.remove(1).is_none());
    }

    #[test]
    fn evict_session_leaves_other_sessions() {
        let mut cache = ObjectCache::new(4);
        cache.put_result(1, 10, result());
        cache.put_result(2, 20, result());
        cache.put_result(3, 10, result());
        assert_eq!(cache.evict_session(10), 2);
        assert_eq!(cache.len(), 1);
    }
}
