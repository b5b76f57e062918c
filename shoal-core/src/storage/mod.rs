//! In-memory ordered map storage.
//!
//! Maps hold `Vec<u8>` keys and values in key order. Writers take a per-key
//! lock owned by their transaction and record the previous value in the
//! transaction's undo log, so rollback can restore it.

pub mod lob;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use bytes::Bytes;
use shoal_protocol::{LeafPageMovePlan, PacketReader, PacketWriter, PageKey, PROTOCOL_VERSION_CURRENT};
use tracing::{debug, info};

use crate::error::ServerError;
use crate::transaction::Transaction;

/// Result of a storage access that may be blocked by another transaction's lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access<T> {
    Ready(T),
    Locked { holder: u64 },
}

impl<T> Access<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Access<U> {
        match self {
            Access::Ready(value) => Access::Ready(f(value)),
            Access::Locked { holder } => Access::Locked { holder },
        }
    }
}

/// All maps of one node.
#[derive(Default)]
pub struct Storage {
    maps: RwLock<HashMap<String, Arc<StorageMap>>>,
}

impl Storage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a map, creating it on first use.
    pub fn map(&self, name: &str) -> Arc<StorageMap> {
        if let Ok(maps) = self.maps.read() {
            if let Some(map) = maps.get(name) {
                return map.clone();
            }
        }
        match self.maps.write() {
            Ok(mut maps) => maps
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(StorageMap::new(name)))
                .clone(),
            Err(_) => Arc::new(StorageMap::new(name)),
        }
    }

    pub fn map_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .maps
            .read()
            .map(|maps| maps.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Serialize the root page of every named map into one bundle.
    pub fn root_pages(&self, names: &[String]) -> Result<Bytes, ServerError> {
        let mut out = PacketWriter::with_version(PROTOCOL_VERSION_CURRENT);
        out.write_i32(names.len() as i32);
        for name in names {
            let page = self.map(name).root_page()?;
            out.write_str(name).write_bytes(Some(page.as_ref()));
        }
        Ok(out.finish())
    }

    /// Replace the contents of every map named in a root-page bundle.
    pub fn replicate_root_pages(&self, db_name: &str, bundle: Bytes) -> Result<usize, ServerError> {
        let mut input = PacketReader::new(bundle, PROTOCOL_VERSION_CURRENT);
        let count = input.read_count()?;
        for _ in 0..count {
            let name = input.read_str()?;
            let page = input.read_bytes()?.unwrap_or_default();
            self.map(&name).set_root_page(page)?;
        }
        info!(db_name, maps = count, "replicated root pages");
        Ok(count)
    }
}

#[derive(Default)]
struct MapState {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    locks: HashMap<Vec<u8>, u64>,
    next_append_key: i64,
    boundaries: BTreeSet<Vec<u8>>,
    move_plans: HashMap<PageKey, LeafPageMovePlan>,
}

impl MapState {
    fn lock_for(&mut self, transaction_id: u64, key: &[u8]) -> Option<u64> {
        match self.locks.get(key) {
            Some(holder) if *holder != transaction_id => Some(*holder),
            Some(_) => None,
            None => {
                self.locks.insert(key.to_vec(), transaction_id);
                None
            }
        }
    }

    fn page_range(&self, page_key: &PageKey) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
        let lower = if page_key.first {
            Bound::Unbounded
        } else {
            Bound::Included(page_key.key.to_vec())
        };
        let upper = self
            .boundaries
            .range((Bound::Excluded(page_key.key.to_vec()), Bound::Unbounded))
            .next()
            .map(|next| Bound::Excluded(next.clone()))
            .unwrap_or(Bound::Unbounded);
        (lower, upper)
    }
}

pub struct StorageMap {
    name: String,
    state: Mutex<MapState>,
}

impl StorageMap {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(MapState {
                next_append_key: 1,
                ..MapState::default()
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> Result<MutexGuard<'_, MapState>, ServerError> {
        self.state
            .lock()
            .map_err(|_| ServerError::Storage(format!("map {} mutex poisoned", self.name)))
    }

    pub fn len(&self) -> usize {
        self.state().map(|state| state.data.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, tx: &Transaction, key: &[u8]) -> Result<Access<Option<Vec<u8>>>, ServerError> {
        let state = self.state()?;
        if let Some(holder) = state.locks.get(key) {
            if *holder != tx.id() {
                return Ok(Access::Locked { holder: *holder });
            }
        }
        Ok(Access::Ready(state.data.get(key).cloned()))
    }

    /// Read outside any transaction; waits on every lock.
    pub fn get_committed(&self, key: &[u8]) -> Result<Access<Option<Vec<u8>>>, ServerError> {
        let state = self.state()?;
        if let Some(holder) = state.locks.get(key) {
            return Ok(Access::Locked { holder: *holder });
        }
        Ok(Access::Ready(state.data.get(key).cloned()))
    }

    /// Write `value` under `key`, returning the previous value.
    pub fn put(
        self: &Arc<Self>,
        tx: &Transaction,
        key: &[u8],
        value: &[u8],
    ) -> Result<Access<Option<Vec<u8>>>, ServerError> {
        tx.check_writable()?;
        let previous = {
            let mut state = self.state()?;
            if let Some(holder) = state.lock_for(tx.id(), key) {
                return Ok(Access::Locked { holder });
            }
            state.data.insert(key.to_vec(), value.to_vec())
        };
        tx.record_undo(self.clone(), key.to_vec(), previous.clone())?;
        Ok(Access::Ready(previous))
    }

    /// Store `value` under the next auto-increment key.
    pub fn append(self: &Arc<Self>, tx: &Transaction, value: &[u8]) -> Result<i64, ServerError> {
        tx.check_writable()?;
        let key = {
            let mut state = self.state()?;
            let key = state.next_append_key;
            state.next_append_key += 1;
            let encoded = key.to_be_bytes().to_vec();
            state.locks.insert(encoded.clone(), tx.id());
            state.data.insert(encoded, value.to_vec());
            key
        };
        tx.record_undo(self.clone(), key.to_be_bytes().to_vec(), None)?;
        Ok(key)
    }

    pub(crate) fn restore(&self, key: &[u8], previous: Option<Vec<u8>>) -> Result<(), ServerError> {
        let mut state = self.state()?;
        match previous {
            Some(value) => state.data.insert(key.to_vec(), value),
            None => state.data.remove(key),
        };
        Ok(())
    }

    pub(crate) fn unlock(&self, transaction_id: u64, key: &[u8]) -> Result<(), ServerError> {
        let mut state = self.state()?;
        if state.locks.get(key) == Some(&transaction_id) {
            state.locks.remove(key);
        }
        Ok(())
    }

    /// Register a move plan for a leaf page and return the winning plan.
    ///
    /// The first plan for a page wins; a later plan replaces it only with a higher index.
    pub fn prepare_move_leaf_page(&self, plan: LeafPageMovePlan) -> Result<LeafPageMovePlan, ServerError> {
        let mut state = self.state()?;
        let winner = match state.move_plans.get(&plan.page_key) {
            Some(existing) if existing.index >= plan.index => existing.clone(),
            _ => {
                state.move_plans.insert(plan.page_key.clone(), plan.clone());
                plan
            }
        };
        debug!(map = %self.name, mover = %winner.mover_host_id, index = winner.index, "move plan");
        Ok(winner)
    }

    /// Install a page's entries; `add_page` also registers its boundary.
    pub fn add_leaf_page(&self, page_key: &PageKey, page: Bytes, add_page: bool) -> Result<usize, ServerError> {
        let entries = decode_page(page)?;
        let mut state = self.state()?;
        let count = entries.len();
        for (key, value) in entries {
            state.data.insert(key, value);
        }
        if add_page && !page_key.first {
            state.boundaries.insert(page_key.key.to_vec());
        }
        state.move_plans.remove(page_key);
        debug!(map = %self.name, entries = count, "added leaf page");
        Ok(count)
    }

    pub fn remove_leaf_page(&self, page_key: &PageKey) -> Result<usize, ServerError> {
        let mut state = self.state()?;
        let range = state.page_range(page_key);
        let keys: Vec<Vec<u8>> = state.data.range(range).map(|(k, _)| k.clone()).collect();
        for key in &keys {
            state.data.remove(key);
        }
        if !page_key.first {
            state.boundaries.remove(page_key.key.as_ref());
        }
        Ok(keys.len())
    }

    pub fn read_page(&self, page_key: &PageKey) -> Result<Bytes, ServerError> {
        let state = self.state()?;
        let range = state.page_range(page_key);
        Ok(encode_page(state.data.range(range)))
    }

    pub fn root_page(&self) -> Result<Bytes, ServerError> {
        let state = self.state()?;
        Ok(encode_page(state.data.iter()))
    }

    /// Replace the whole map with the entries of a serialized page.
    pub fn set_root_page(&self, page: Bytes) -> Result<(), ServerError> {
        let entries = decode_page(page)?;
        let mut state = self.state()?;
        state.data = entries.into_iter().collect();
        state.boundaries.clear();
        let max_key = state
            .data
            .keys()
            .filter_map(|key| <[u8; 8]>::try_from(key.as_slice()).ok())
            .map(i64::from_be_bytes)
            .max()
            .unwrap_or(0);
        state.next_append_key = state.next_append_key.max(max_key + 1);
        Ok(())
    }
}

fn encode_page<'a>(entries: impl Iterator<Item = (&'a Vec<u8>, &'a Vec<u8>)>) -> Bytes {
    let entries: Vec<_> = entries.collect();
    let mut out = PacketWriter::with_version(PROTOCOL_VERSION_CURRENT);
    out.write_i32(entries.len() as i32);
    for (key, value) in entries {
        out.write_bytes(Some(key.as_slice()))
            .write_bytes(Some(value.as_slice()));
    }
    out.finish()
}

fn decode_page(page: Bytes) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ServerError> {
    if page.is_empty() {
        return Ok(Vec::new());
    }
    let mut input = PacketReader::new(page, PROTOCOL_VERSION_CURRENT);
    let count = input.read_count()?;
    let mut entries = Vec::with_capacity(input.capacity_hint(count));
    for _ in 0..count {
        let key = input.read_bytes()?.unwrap_or_default().to_vec();
        let value = input.read_bytes()?.unwrap_or_default().to_vec();
        entries.push((key, value));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(id: u64) -> Transaction {
        Transaction::new(id, format!("127.0.0.1:9210:{id}"))
    }

    #[test]
    fn put_then_get_round_trips() -> anyhow::Result<()> {
        let storage = Storage::new();
        let map = storage.map("m");
        let t = tx(1);
        assert_eq!(map.put(&t, b"k", b"v")?, Access::Ready(None));
        assert_eq!(map.get(&t, b"k")?, Access::Ready(Some(b"v".to_vec())));
        assert_eq!(map.put(&t, b"k", b"w")?, Access::Ready(Some(b"v".to_vec())));
        Ok(())
    }

    #[test]
    fn conflicting_writer_sees_lock_until_commit() -> anyhow::Result<()> {
        let storage = Storage::new();
        let map = storage.map("m");
        let first = tx(1);
        let second = tx(2);
        map.put(&first, b"k", b"v")?;
        assert_eq!(map.put(&second, b"k", b"x")?, Access::Locked { holder: 1 });
        assert_eq!(map.get(&second, b"k")?, Access::Locked { holder: 1 });

        first.finish_commit(1)?;
        assert_eq!(map.put(&second, b"k", b"x")?, Access::Ready(Some(b"v".to_vec())));
        Ok(())
    }

    #[test]
    fn append_allocates_increasing_big_endian_keys() -> anyhow::Result<()> {
        let storage = Storage::new();
        let map = storage.map("log");
        let t = tx(1);
        assert_eq!(map.append(&t, b"a")?, 1);
        assert_eq!(map.append(&t, b"b")?, 2);
        assert_eq!(
            map.get(&t, &2i64.to_be_bytes())?,
            Access::Ready(Some(b"b".to_vec()))
        );
        Ok(())
    }

    #[test]
    fn leaf_pages_move_between_maps() -> anyhow::Result<()> {
        let source = Storage::new();
        let map = source.map("m");
        let t = tx(1);
        for key in [b"a", b"c", b"m", b"x"] {
            map.put(&t, key, key)?;
        }
        t.finish_commit(1)?;
        let split = PageKey::new(Bytes::from_static(b"m"), false);
        map.add_leaf_page(&split, Bytes::new(), true)?;

        let page = map.read_page(&split)?;
        let target = Storage::new();
        let copy = target.map("m");
        assert_eq!(copy.add_leaf_page(&split, page, true)?, 2);
        assert_eq!(map.remove_leaf_page(&split)?, 2);
        assert_eq!(map.len(), 2);
        assert_eq!(copy.len(), 2);

        let first = PageKey::new(Bytes::new(), true);
        assert_eq!(decode_page(map.read_page(&first)?)?.len(), 2);
        Ok(())
    }

    #[test]
    fn move_plan_prefers_first_then_higher_index() -> anyhow::Result<()> {
        let storage = Storage::new();
        let map = storage.map("m");
        let key = PageKey::new(Bytes::from_static(b"k"), false);
        let first = LeafPageMovePlan::new("a", vec!["a:1".to_string()], key.clone());
        let second = LeafPageMovePlan::new("b", vec!["b:1".to_string()], key.clone());

        assert_eq!(map.prepare_move_leaf_page(first.clone())?.mover_host_id, "a");
        assert_eq!(map.prepare_move_leaf_page(second.clone())?.mover_host_id, "a");

        let mut retry = second;
        retry.increment_index();
        assert_eq!(map.prepare_move_leaf_page(retry)?.mover_host_id, "b");
        Ok(())
    }

    #[test]
    fn root_pages_replace_map_contents() -> anyhow::Result<()> {
        let source = Storage::new();
        let t = tx(1);
        source.map("a").put(&t, b"1", b"one")?;
        source.map("b").append(&t, b"row")?;
        t.finish_commit(1)?;
        let bundle = source.root_pages(&source.map_names())?;

        let replica = Storage::new();
        replica.map("a").put(&tx(2), b"stale", b"x")?;
        assert_eq!(replica.replicate_root_pages("db", bundle)?, 2);
        assert_eq!(replica.map("a").len(), 1);

        let writer = tx(3);
        assert_eq!(replica.map("b").append(&writer, b"next")?, 2);
        Ok(())
    }
}
