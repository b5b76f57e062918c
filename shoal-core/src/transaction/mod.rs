//! Local transactions and the distributed commit pipeline.
//!
//! A `Transaction` moves through `Open -> PendingValidate -> Committed` or ends
//! in `RolledBack`. State changes happen under the transaction's own lock and
//! listeners run after it is released, so exactly one of commit or rollback
//! takes effect.

mod coordinator;
pub mod name;
mod validator;

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::warn;

pub use coordinator::{CoordinatorCounts, TransactionCoordinator};
pub use validator::{ValidatorMessage, ValidatorQueue, ValidatorStats, ValidatorStatsSnapshot};

use crate::error::ServerError;
use crate::storage::StorageMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "committed_at_ms", rename_all = "snake_case")]
pub enum TransactionState {
    Open,
    PendingValidate,
    /// Commit timestamp in milliseconds since the epoch.
    Committed(u64),
    RolledBack,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed(_) | TransactionState::RolledBack)
    }
}

/// Resources enlisted in a transaction.
pub trait TransactionListener: Send + Sync {
    fn on_commit(&self, transaction: &Transaction) -> Result<(), ServerError>;

    fn on_rollback(&self, transaction: &Transaction) -> Result<(), ServerError>;
}

/// Answers whether a remote sub-transaction is committed on its home node.
pub trait ParticipantValidator: Send + Sync {
    fn validate(&self, name: &str) -> Result<bool, ServerError>;
}

pub(crate) struct UndoEntry {
    map: Arc<StorageMap>,
    key: Vec<u8>,
    previous: Option<Vec<u8>>,
}

pub struct Transaction {
    id: u64,
    local_name: String,
    state: Mutex<TransactionState>,
    participants: Mutex<Vec<String>>,
    undo: Mutex<Vec<UndoEntry>>,
    savepoints: Mutex<Vec<(String, usize)>>,
    listeners: Mutex<Vec<Arc<dyn TransactionListener>>>,
    validator: Mutex<Option<Arc<dyn ParticipantValidator>>>,
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>, ServerError> {
    mutex
        .lock()
        .map_err(|_| ServerError::Internal(format!("transaction {what} mutex poisoned")))
}

impl Transaction {
    pub(crate) fn new(id: u64, local_name: String) -> Self {
        Self {
            id,
            participants: Mutex::new(vec![local_name.clone()]),
            local_name,
            state: Mutex::new(TransactionState::Open),
            undo: Mutex::new(Vec::new()),
            savepoints: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            validator: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// This node's name for the transaction.
    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    pub fn state(&self) -> TransactionState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(TransactionState::RolledBack)
    }

    pub fn is_open(&self) -> bool {
        self.state() == TransactionState::Open
    }

    /// Every local transaction name known to belong to this transaction, comma separated.
    pub fn local_names(&self) -> String {
        self.participants
            .lock()
            .map(|names| names.join(","))
            .unwrap_or_default()
    }

    pub fn add_participant(&self, name: &str) -> Result<(), ServerError> {
        let mut participants = lock(&self.participants, "participant")?;
        if !participants.iter().any(|existing| existing == name) {
            participants.push(name.to_string());
        }
        Ok(())
    }

    pub fn add_listener(&self, listener: Arc<dyn TransactionListener>) -> Result<(), ServerError> {
        lock(&self.listeners, "listener")?.push(listener);
        Ok(())
    }

    pub fn set_validator(&self, validator: Arc<dyn ParticipantValidator>) -> Result<(), ServerError> {
        *lock(&self.validator, "validator")? = Some(validator);
        Ok(())
    }

    pub fn validator(&self) -> Option<Arc<dyn ParticipantValidator>> {
        self.validator.lock().ok().and_then(|v| v.clone())
    }

    pub(crate) fn check_writable(&self) -> Result<(), ServerError> {
        match self.state() {
            TransactionState::Open => Ok(()),
            other => Err(ServerError::Internal(format!(
                "transaction {} is not writable in state {other:?}",
                self.id
            ))),
        }
    }

    pub(crate) fn record_undo(
        &self,
        map: Arc<StorageMap>,
        key: Vec<u8>,
        previous: Option<Vec<u8>>,
    ) -> Result<(), ServerError> {
        lock(&self.undo, "undo")?.push(UndoEntry { map, key, previous });
        Ok(())
    }

    pub fn add_savepoint(&self, name: &str) -> Result<(), ServerError> {
        self.check_writable()?;
        let mark = lock(&self.undo, "undo")?.len();
        let mut savepoints = lock(&self.savepoints, "savepoint")?;
        savepoints.retain(|(existing, _)| existing != name);
        savepoints.push((name.to_string(), mark));
        Ok(())
    }

    /// Undo storage writes made after the named savepoint.
    pub fn rollback_to_savepoint(&self, name: &str) -> Result<(), ServerError> {
        self.check_writable()?;
        let mark = {
            let mut savepoints = lock(&self.savepoints, "savepoint")?;
            let position = savepoints
                .iter()
                .rposition(|(existing, _)| existing == name)
                .ok_or_else(|| {
                    ServerError::sql(
                        shoal_protocol::error_codes::GENERAL_ERROR_1,
                        format!("savepoint {name} not found"),
                    )
                })?;
            let mark = savepoints[position].1;
            savepoints.truncate(position + 1);
            mark
        };
        let mut undo = lock(&self.undo, "undo")?;
        let undone: Vec<UndoEntry> = undo.split_off(mark);
        for entry in undone.iter().rev() {
            entry.map.restore(&entry.key, entry.previous.clone())?;
        }
        for entry in &undone {
            let still_written = undo
                .iter()
                .any(|kept| Arc::ptr_eq(&kept.map, &entry.map) && kept.key == entry.key);
            if !still_written {
                entry.map.unlock(self.id, &entry.key)?;
            }
        }
        Ok(())
    }

    /// Move `Open` to `PendingValidate`.
    pub(crate) fn mark_pending_validate(&self) -> Result<(), ServerError> {
        let mut state = lock(&self.state, "state")?;
        match *state {
            TransactionState::Open => {
                *state = TransactionState::PendingValidate;
                Ok(())
            }
            other => Err(ServerError::Internal(format!(
                "transaction {} cannot start validation from {other:?}",
                self.id
            ))),
        }
    }

    /// Finish the transaction as committed. Returns false when it already ended.
    pub(crate) fn finish_commit(&self, committed_at_ms: u64) -> Result<bool, ServerError> {
        {
            let mut state = lock(&self.state, "state")?;
            if state.is_terminal() {
                return Ok(false);
            }
            *state = TransactionState::Committed(committed_at_ms);
        }
        let mut first_error = None;
        for listener in self.listeners_snapshot()? {
            if let Err(err) = listener.on_commit(self) {
                warn!(transaction_id = self.id, error = %err, "commit listener failed");
                first_error.get_or_insert(err);
            }
        }
        self.release_locks()?;
        match first_error {
            Some(err) => Err(err),
            None => Ok(true),
        }
    }

    /// Undo every write and finish as rolled back. Returns false when it already ended.
    pub(crate) fn finish_rollback(&self) -> Result<bool, ServerError> {
        {
            let mut state = lock(&self.state, "state")?;
            if state.is_terminal() {
                return Ok(false);
            }
            *state = TransactionState::RolledBack;
        }
        let undone: Vec<UndoEntry> = std::mem::take(&mut *lock(&self.undo, "undo")?);
        for entry in undone.iter().rev() {
            entry.map.restore(&entry.key, entry.previous.clone())?;
        }
        for entry in &undone {
            entry.map.unlock(self.id, &entry.key)?;
        }
        for listener in self.listeners_snapshot()? {
            if let Err(err) = listener.on_rollback(self) {
                warn!(transaction_id = self.id, error = %err, "rollback listener failed");
            }
        }
        Ok(true)
    }

    fn listeners_snapshot(&self) -> Result<Vec<Arc<dyn TransactionListener>>, ServerError> {
        Ok(lock(&self.listeners, "listener")?.clone())
    }

    fn release_locks(&self) -> Result<(), ServerError> {
        let undone: Vec<UndoEntry> = std::mem::take(&mut *lock(&self.undo, "undo")?);
        for entry in &undone {
            entry.map.unlock(self.id, &entry.key)?;
        }
        lock(&self.savepoints, "savepoint")?.clear();
        Ok(())
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("local_name", &self.local_name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::storage::{Access, Storage};

    #[derive(Default)]
    struct CountingListener {
        commits: AtomicUsize,
        rollbacks: AtomicUsize,
    }

    impl TransactionListener for CountingListener {
        fn on_commit(&self, _: &Transaction) -> Result<(), ServerError> {
            self.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_rollback(&self, _: &Transaction) -> Result<(), ServerError> {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn only_first_terminal_transition_wins() -> anyhow::Result<()> {
        let tx = Transaction::new(1, "h:1:1".to_string());
        let listener = Arc::new(CountingListener::default());
        tx.add_listener(listener.clone())?;

        assert!(tx.finish_commit(10)?);
        assert!(!tx.finish_rollback()?);
        assert_eq!(tx.state(), TransactionState::Committed(10));
        assert_eq!(listener.commits.load(Ordering::SeqCst), 1);
        assert_eq!(listener.rollbacks.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn rollback_allowed_from_pending_validate() -> anyhow::Result<()> {
        let tx = Transaction::new(2, "h:1:2".to_string());
        tx.mark_pending_validate()?;
        assert!(tx.mark_pending_validate().is_err());
        assert!(tx.finish_rollback()?);
        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert!(tx.check_writable().is_err());
        Ok(())
    }

    #[test]
    fn rollback_restores_storage_and_releases_locks() -> anyhow::Result<()> {
        let storage = Storage::new();
        let map = storage.map("accounts");
        let setup = Transaction::new(1, "h:1:1".to_string());
        map.put(&setup, b"k", b"v1")?;
        setup.finish_commit(1)?;

        let tx = Transaction::new(2, "h:1:2".to_string());
        map.put(&tx, b"k", b"v2")?;
        map.put(&tx, b"new", b"x")?;
        tx.finish_rollback()?;

        let reader = Transaction::new(3, "h:1:3".to_string());
        assert_eq!(map.get(&reader, b"k")?, Access::Ready(Some(b"v1".to_vec())));
        assert_eq!(map.get(&reader, b"new")?, Access::Ready(None));
        Ok(())
    }

    #[test]
    fn savepoint_rolls_back_partially() -> anyhow::Result<()> {
        let storage = Storage::new();
        let map = storage.map("m");
        let tx = Transaction::new(1, "h:1:1".to_string());
        map.put(&tx, b"a", b"1")?;
        tx.add_savepoint("sp")?;
        map.put(&tx, b"b", b"2")?;
        tx.rollback_to_savepoint("sp")?;
        assert!(tx.rollback_to_savepoint("missing").is_err());

        assert_eq!(map.get(&tx, b"a")?, Access::Ready(Some(b"1".to_vec())));
        assert_eq!(map.get(&tx, b"b")?, Access::Ready(None));
        tx.finish_commit(5)?;
        Ok(())
    }

    #[test]
    fn participants_are_deduplicated() -> anyhow::Result<()> {
        let tx = Transaction::new(4, "a:1:4".to_string());
        tx.add_participant("b:2:9")?;
        tx.add_participant("b:2:9")?;
        assert_eq!(tx.local_names(), "a:1:4,b:2:9");
        Ok(())
    }
}
