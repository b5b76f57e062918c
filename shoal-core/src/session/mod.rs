//! Server-side session state.
//!
//! A `Session` is the conversation behind one client session id: its engine
//! connection, auto-commit flag and the transaction it currently runs. The
//! scheduler that owns the session is the only thread that mutates it.

pub mod auth;
pub mod info;
pub mod registry;

use std::sync::Arc;

use tracing::{debug, warn};

pub use info::{SessionInfo, SliceOutcome};
pub use registry::{Registration, SessionRegistry};

use crate::engine::{PreparedStatement, SqlConnection};
use crate::error::ServerError;
use crate::sql_parser::TransactionControl;
use crate::storage::lob::LobStore;
use crate::storage::{Access, Storage};
use crate::transaction::{Transaction, TransactionCoordinator, TransactionListener, TransactionState};

/// Enlists the session's engine connection in its transaction.
struct EngineParticipant {
    connection: Arc<dyn SqlConnection>,
}

impl TransactionListener for EngineParticipant {
    fn on_commit(&self, _transaction: &Transaction) -> Result<(), ServerError> {
        self.connection.commit()
    }

    fn on_rollback(&self, _transaction: &Transaction) -> Result<(), ServerError> {
        self.connection.rollback()
    }
}

pub struct Session {
    key: u64,
    user: String,
    connection: Arc<dyn SqlConnection>,
    coordinator: Arc<TransactionCoordinator>,
    storage: Arc<Storage>,
    lobs: Arc<LobStore>,
    auto_commit: bool,
    restore_auto_commit: bool,
    root: bool,
    replication_name: Option<String>,
    current: Option<Arc<Transaction>>,
    pending_validation: Option<Arc<Transaction>>,
    listeners: Vec<Arc<dyn TransactionListener>>,
    last_row_key: i64,
    closed: bool,
}

impl Session {
    pub fn new(
        key: u64,
        user: impl Into<String>,
        connection: Arc<dyn SqlConnection>,
        coordinator: Arc<TransactionCoordinator>,
        storage: Arc<Storage>,
        lobs: Arc<LobStore>,
    ) -> Self {
        Self {
            key,
            user: user.into(),
            connection,
            coordinator,
            storage,
            lobs,
            auto_commit: true,
            restore_auto_commit: false,
            root: true,
            replication_name: None,
            current: None,
            pending_validation: None,
            listeners: Vec::new(),
            last_row_key: 0,
            closed: false,
        }
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn lobs(&self) -> &Arc<LobStore> {
        &self.lobs
    }

    pub fn coordinator(&self) -> &Arc<TransactionCoordinator> {
        &self.coordinator
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    /// Switching auto-commit on commits the open transaction.
    pub fn set_auto_commit(&mut self, auto_commit: bool) -> Result<(), ServerError> {
        if auto_commit && !self.auto_commit {
            self.commit()?;
        }
        self.auto_commit = auto_commit;
        self.restore_auto_commit = false;
        Ok(())
    }

    pub fn is_root(&self) -> bool {
        self.root
    }

    pub fn replication_name(&self) -> Option<&str> {
        self.replication_name.as_deref()
    }

    pub fn set_replication_name(&mut self, name: Option<String>) {
        self.replication_name = name;
    }

    pub fn last_row_key(&self) -> i64 {
        self.last_row_key
    }

    pub fn current_transaction(&self) -> Option<&Arc<Transaction>> {
        self.current.as_ref()
    }

    /// Listener added to every transaction this session starts.
    pub fn add_transaction_listener(&mut self, listener: Arc<dyn TransactionListener>) {
        self.listeners.push(listener);
    }

    /// Distributed operations keep the transaction open for an explicit commit.
    pub fn enter_distributed(&mut self) {
        self.auto_commit = false;
        self.restore_auto_commit = false;
        self.root = false;
    }

    /// Replicated writes stay open until `COMMAND_REPLICATION_COMMIT`.
    pub fn enter_replication(&mut self, name: String) {
        self.replication_name = Some(name);
        self.auto_commit = false;
        self.restore_auto_commit = false;
    }

    /// True while the previously committed transaction still waits for validation.
    pub fn awaiting_validation(&mut self) -> bool {
        match self.pending_validation.as_ref().map(|tx| tx.state()) {
            Some(TransactionState::PendingValidate) => true,
            Some(_) => {
                self.pending_validation = None;
                false
            }
            None => false,
        }
    }

    /// The open transaction, started on first use.
    pub fn transaction(&mut self) -> Result<Arc<Transaction>, ServerError> {
        if let Some(tx) = &self.current {
            if tx.is_open() {
                return Ok(tx.clone());
            }
        }
        let tx = self.coordinator.begin()?;
        if let Err(err) = self.connection.begin() {
            self.coordinator.rollback(&tx)?;
            return Err(err);
        }
        tx.add_listener(Arc::new(EngineParticipant {
            connection: self.connection.clone(),
        }))?;
        for listener in &self.listeners {
            tx.add_listener(listener.clone())?;
        }
        debug!(session = self.key, transaction_id = tx.id(), "session transaction started");
        self.current = Some(tx.clone());
        Ok(tx)
    }

    /// Start a transaction before a statement when auto-commit is off.
    pub fn before_statement(&mut self) -> Result<(), ServerError> {
        if !self.auto_commit {
            self.transaction()?;
        }
        Ok(())
    }

    pub fn prepare(&self, sql: &str, fetch_size: i32) -> Result<Arc<dyn PreparedStatement>, ServerError> {
        if self.closed {
            return Err(ServerError::SessionNotFound);
        }
        self.connection.clone().prepare(sql, fetch_size)
    }

    /// Comma separated local transaction names of the open transaction.
    pub fn local_names(&self) -> String {
        self.current
            .as_ref()
            .map(|tx| tx.local_names())
            .unwrap_or_default()
    }

    pub fn commit(&mut self) -> Result<(), ServerError> {
        if let Some(tx) = self.current.take() {
            let name = tx.local_name().to_string();
            self.coordinator.commit(&tx, &name)?;
        }
        self.finish_explicit();
        Ok(())
    }

    /// Commit with the participant names collected by the client.
    pub fn commit_distributed(&mut self, all_local_names: &str) -> Result<(), ServerError> {
        let Some(tx) = self.current.take() else {
            return Ok(());
        };
        let names = if all_local_names.trim().is_empty() {
            tx.local_names()
        } else {
            all_local_names.to_string()
        };
        self.coordinator.commit(&tx, &names)?;
        if tx.state() == TransactionState::PendingValidate {
            self.pending_validation = Some(tx);
        }
        Ok(())
    }

    /// Roll back the open transaction and any transaction awaiting validation.
    pub fn rollback(&mut self) -> Result<(), ServerError> {
        let mut first_error = None;
        for tx in [self.current.take(), self.pending_validation.take()]
            .into_iter()
            .flatten()
        {
            if let Err(err) = self.coordinator.rollback(&tx) {
                first_error.get_or_insert(err);
            }
        }
        self.finish_explicit();
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn finish_explicit(&mut self) {
        if self.restore_auto_commit {
            self.auto_commit = true;
            self.restore_auto_commit = false;
        }
    }

    pub fn add_savepoint(&mut self, name: &str) -> Result<(), ServerError> {
        self.transaction()?.add_savepoint(name)
    }

    pub fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), ServerError> {
        match &self.current {
            Some(tx) => tx.rollback_to_savepoint(name),
            None => Err(ServerError::sql(
                shoal_protocol::error_codes::GENERAL_ERROR_1,
                format!("savepoint {name} not found"),
            )),
        }
    }

    /// Run BEGIN/COMMIT/ROLLBACK/SAVEPOINT through the session's transaction.
    pub fn execute_transaction_control(&mut self, control: &TransactionControl) -> Result<(), ServerError> {
        match control {
            TransactionControl::Begin => {
                if self.auto_commit {
                    self.auto_commit = false;
                    self.restore_auto_commit = true;
                }
                self.transaction().map(|_| ())
            }
            TransactionControl::Commit => self.commit(),
            TransactionControl::Rollback => self.rollback(),
            TransactionControl::Savepoint(name) => self.add_savepoint(name),
            TransactionControl::RollbackToSavepoint(name) => self.rollback_to_savepoint(name),
        }
    }

    pub fn replication_commit(&mut self, valid_key: i64, auto_commit: bool) -> Result<(), ServerError> {
        self.commit()?;
        if valid_key >= 0 {
            self.last_row_key = self.last_row_key.max(valid_key);
        }
        self.auto_commit = auto_commit;
        Ok(())
    }

    fn with_write_transaction<T>(
        &mut self,
        write: impl FnOnce(&Arc<Transaction>) -> Result<Access<T>, ServerError>,
    ) -> Result<Access<T>, ServerError> {
        if !self.auto_commit {
            let tx = self.transaction()?;
            return write(&tx);
        }
        let tx = self.coordinator.begin()?;
        match write(&tx) {
            Ok(Access::Ready(value)) => {
                self.coordinator.commit(&tx, tx.local_name())?;
                Ok(Access::Ready(value))
            }
            other => {
                self.coordinator.rollback(&tx)?;
                other
            }
        }
    }

    pub fn storage_get(&mut self, map: &str, key: &[u8]) -> Result<Access<Option<Vec<u8>>>, ServerError> {
        let map = self.storage.map(map);
        match &self.current {
            Some(tx) if tx.is_open() => map.get(tx, key),
            _ => map.get_committed(key),
        }
    }

    pub fn storage_put(
        &mut self,
        map: &str,
        key: &[u8],
        value: &[u8],
    ) -> Result<Access<Option<Vec<u8>>>, ServerError> {
        let map = self.storage.map(map);
        self.with_write_transaction(|tx| map.put(tx, key, value))
    }

    pub fn storage_append(&mut self, map: &str, value: &[u8]) -> Result<Access<i64>, ServerError> {
        let map = self.storage.map(map);
        let result = self.with_write_transaction(|tx| map.append(tx, value).map(Access::Ready))?;
        if let Access::Ready(key) = result {
            self.last_row_key = key;
        }
        Ok(result)
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Roll back everything and release the engine connection's transaction.
    pub fn close(&mut self) -> Result<(), ServerError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let result = self.rollback();
        if let Err(err) = self.connection.rollback() {
            warn!(session = self.key, error = %err, "engine rollback on close failed");
        }
        self.lobs.release_owner(self.key);
        debug!(session = self.key, "session closed");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::engine::{DuckDbEngine, SqlEngine};
    use shoal_protocol::Value;

    fn session() -> anyhow::Result<(Session, Arc<TransactionCoordinator>)> {
        let engine = DuckDbEngine::new(&ServerConfig::default())?;
        let coordinator = TransactionCoordinator::start("127.0.0.1:9210", None, 16)?;
        let session = Session::new(
            1,
            "sa",
            engine.connect()?,
            coordinator.clone(),
            Arc::new(Storage::new()),
            Arc::new(LobStore::new()),
        );
        Ok((session, coordinator))
    }

    fn count(session: &Session, sql: &str) -> anyhow::Result<Option<Value>> {
        let mut result = session.prepare(sql, 10)?.execute_query(0, false)?;
        Ok(result.next_row().map(|row| row[0].clone()))
    }

    #[test]
    fn explicit_begin_rollback_discards_engine_writes() -> anyhow::Result<()> {
        let (mut session, coordinator) = session()?;
        session.prepare("CREATE TABLE s_t (id INTEGER)", 10)?.execute_update()?;

        session.execute_transaction_control(&TransactionControl::Begin)?;
        assert!(!session.auto_commit());
        session.prepare("INSERT INTO s_t VALUES (1)", 10)?.execute_update()?;
        session.execute_transaction_control(&TransactionControl::Rollback)?;

        assert!(session.auto_commit());
        assert_eq!(count(&session, "SELECT count(*) FROM s_t")?, Some(Value::Long(0)));
        assert_eq!(coordinator.counts().rolled_back, 1);
        coordinator.shutdown();
        Ok(())
    }

    #[test]
    fn auto_commit_storage_writes_commit_immediately() -> anyhow::Result<()> {
        let (mut session, coordinator) = session()?;
        assert_eq!(session.storage_put("m", b"k", b"v")?, Access::Ready(None));
        assert_eq!(
            session.storage_get("m", b"k")?,
            Access::Ready(Some(b"v".to_vec()))
        );
        assert_eq!(session.storage_append("log", b"x")?, Access::Ready(1));
        assert_eq!(session.last_row_key(), 1);
        assert_eq!(coordinator.counts().open, 0);
        coordinator.shutdown();
        Ok(())
    }

    #[test]
    fn distributed_commit_with_foreign_name_waits_for_validation() -> anyhow::Result<()> {
        let (mut session, coordinator) = session()?;
        session.enter_distributed();
        session.storage_put("m", b"k", b"v")?;
        let names = format!("{},10.0.0.9:9210:4", session.local_names());
        session.commit_distributed(&names)?;

        assert!(session.awaiting_validation());
        session.rollback()?;
        assert!(!session.awaiting_validation());
        assert_eq!(session.storage_get("m", b"k")?, Access::Ready(None));
        coordinator.shutdown();
        Ok(())
    }

    #[test]
    fn close_rolls_back_open_transaction() -> anyhow::Result<()> {
        let (mut session, coordinator) = session()?;
        session.set_auto_commit(false)?;
        session.storage_put("m", b"k", b"v")?;
        let tx = session.current_transaction().cloned();
        session.close()?;
        assert!(session.is_closed());
        assert_eq!(tx.map(|t| t.state()), Some(TransactionState::RolledBack));
        coordinator.shutdown();
        Ok(())
    }
}
