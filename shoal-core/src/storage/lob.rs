//! Large object store and per-connection read cursors.

use std::collections::HashMap;
use std::hash::Hasher;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use lru::LruCache;
use siphasher::sip::SipHasher13;
use shoal_protocol::Value;
use uuid::Uuid;

use crate::error::ServerError;

/// Largest chunk returned by one `COMMAND_READ_LOB`.
pub const MAX_LOB_READ: usize = 64 * 1024;

struct StoredLob {
    owner: u64,
    data: Bytes,
}

/// Node-wide LOB storage. LOBs belong to the session that produced them.
pub struct LobStore {
    next_id: AtomicI64,
    keys: (u64, u64),
    lobs: Mutex<HashMap<i64, StoredLob>>,
}

impl Default for LobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LobStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            keys: Uuid::new_v4().as_u64_pair(),
            lobs: Mutex::new(HashMap::new()),
        }
    }

    fn mac(&self, id: i64) -> Bytes {
        let mut hasher = SipHasher13::new_with_keys(self.keys.0, self.keys.1);
        hasher.write_i64(id);
        Bytes::copy_from_slice(&hasher.finish().to_be_bytes())
    }

    pub fn verify(&self, id: i64, hmac: &[u8]) -> bool {
        self.mac(id).as_ref() == hmac
    }

    /// Keep `data` and return the value that references it.
    pub fn store(&self, owner: u64, data: Bytes) -> Value {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let length = data.len() as i64;
        if let Ok(mut lobs) = self.lobs.lock() {
            lobs.insert(id, StoredLob { owner, data });
        }
        Value::Lob {
            id,
            hmac: self.mac(id),
            length,
        }
    }

    pub fn get(&self, id: i64) -> Option<Bytes> {
        self.lobs
            .lock()
            .ok()
            .and_then(|lobs| lobs.get(&id).map(|lob| lob.data.clone()))
    }

    /// Drop every LOB produced by a session.
    pub fn release_owner(&self, owner: u64) -> usize {
        match self.lobs.lock() {
            Ok(mut lobs) => {
                let before = lobs.len();
                lobs.retain(|_, lob| lob.owner != owner);
                before - lobs.len()
            }
            Err(_) => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.lobs.lock().map(|lobs| lobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct LobCursor {
    data: Bytes,
    position: usize,
}

/// Per-connection LRU of open LOB cursors.
pub struct LobCursorCache {
    cursors: LruCache<i64, LobCursor>,
}

impl LobCursorCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cursors: LruCache::new(capacity),
        }
    }

    /// Read up to `length` bytes at `offset`, capped at `MAX_LOB_READ`.
    pub fn read(
        &mut self,
        store: &LobStore,
        id: i64,
        hmac: &[u8],
        offset: i64,
        length: i32,
    ) -> Result<Bytes, ServerError> {
        if !store.verify(id, hmac) {
            return Err(ServerError::sql(
                shoal_protocol::error_codes::GENERAL_ERROR_1,
                format!("invalid LOB hmac for {id}"),
            ));
        }
        let offset = usize::try_from(offset).map_err(|_| {
            ServerError::sql(
                shoal_protocol::error_codes::GENERAL_ERROR_1,
                format!("negative LOB offset {offset}"),
            )
        })?;
        if !self.cursors.contains(&id) {
            let data = store.get(id).ok_or(ServerError::ObjectClosed(id as i32))?;
            self.cursors.put(id, LobCursor { data, position: 0 });
        }
        let cursor = self
            .cursors
            .get_mut(&id)
            .ok_or(ServerError::ObjectClosed(id as i32))?;
        if cursor.position != offset {
            cursor.position = offset.min(cursor.data.len());
        }
        let wanted = usize::try_from(length).unwrap_or(0).min(MAX_LOB_READ);
        let end = (cursor.position + wanted).min(cursor.data.len());
        let chunk = cursor.data.slice(cursor.position..end);
        cursor.position = end;
        Ok(chunk)
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lob_ref(value: &Value) -> (i64, Bytes) {
        match value {
            Value::Lob { id, hmac, .. } => (*id, hmac.clone()),
            other => panic!("expected LOB, got {other:?}"),
        }
    }

    #[test]
    fn reads_sequential_chunks_and_repositions() -> anyhow::Result<()> {
        let store = LobStore::new();
        let value = store.store(1, Bytes::from(vec![7u8; 100]));
        let (id, hmac) = lob_ref(&value);
        let mut cursors = LobCursorCache::new(4);

        assert_eq!(cursors.read(&store, id, &hmac, 0, 60)?.len(), 60);
        assert_eq!(cursors.read(&store, id, &hmac, 60, 60)?.len(), 40);
        assert_eq!(cursors.read(&store, id, &hmac, 90, 5)?.len(), 5);
        assert!(cursors.read(&store, id, &hmac, 100, 5)?.is_empty());
        Ok(())
    }

    #[test]
    fn reads_are_capped() -> anyhow::Result<()> {
        let store = LobStore::new();
        let (id, hmac) = lob_ref(&store.store(1, Bytes::from(vec![0u8; MAX_LOB_READ * 2])));
        let mut cursors = LobCursorCache::new(1);
        assert_eq!(cursors.read(&store, id, &hmac, 0, i32::MAX)?.len(), MAX_LOB_READ);
        Ok(())
    }

    #[test]
    fn forged_hmac_is_rejected() {
        let store = LobStore::new();
        let (id, _) = lob_ref(&store.store(1, Bytes::from_static(b"secret")));
        let mut cursors = LobCursorCache::new(1);
        assert!(cursors.read(&store, id, b"forged", 0, 10).is_err());
    }

    #[test]
    fn release_owner_drops_only_that_session() {
        let store = LobStore::new();
        store.store(1, Bytes::from_static(b"a"));
        store.store(2, Bytes::from_static(b"b"));
        assert_eq!(store.release_owner(1), 1);
        assert_eq!(store.len(), 1);
    }
}
