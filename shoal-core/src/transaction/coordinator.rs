use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use lru::LruCache;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::name::{self, TransactionName};
use super::validator::{ValidatorQueue, ValidatorStats};
use super::{ParticipantValidator, Transaction, TransactionState};
use crate::error::ServerError;
use crate::metrics::now_millis;

const OUTCOME_HISTORY: usize = 1024;

#[derive(Debug, Clone, Default, Serialize)]
pub struct CoordinatorCounts {
    pub open: usize,
    pub pending_validate: usize,
    pub committed: u64,
    pub rolled_back: u64,
}

/// Per-node transaction lifecycle.
///
/// Owns the id counter, the table of live transactions and the validator
/// queue that finishes distributed commits.
pub struct TransactionCoordinator {
    endpoint: String,
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, Arc<Transaction>>>,
    outcomes: Mutex<LruCache<u64, TransactionState>>,
    default_validator: RwLock<Option<Arc<dyn ParticipantValidator>>>,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    validator_queue: ValidatorQueue,
}

impl TransactionCoordinator {
    /// Create the coordinator and start its validator thread.
    pub fn start(
        endpoint: impl Into<String>,
        default_validator: Option<Arc<dyn ParticipantValidator>>,
        validator_batch_size: usize,
    ) -> Result<Arc<Self>, ServerError> {
        let endpoint = endpoint.into();
        let capacity = NonZeroUsize::new(OUTCOME_HISTORY).unwrap_or(NonZeroUsize::MIN);
        let mut spawn_error = None;
        let coordinator = Arc::new_cyclic(|weak| {
            let validator_queue = match ValidatorQueue::start(weak.clone(), validator_batch_size) {
                Ok(queue) => queue,
                Err(err) => {
                    spawn_error = Some(err);
                    ValidatorQueue::stopped()
                }
            };
            Self {
                endpoint,
                next_id: AtomicU64::new(1),
                live: Mutex::new(HashMap::new()),
                outcomes: Mutex::new(LruCache::new(capacity)),
                default_validator: RwLock::new(default_validator),
                committed: AtomicU64::new(0),
                rolled_back: AtomicU64::new(0),
                validator_queue,
            }
        });
        if let Some(err) = spawn_error {
            return Err(err);
        }
        info!(endpoint = %coordinator.endpoint, "transaction coordinator started");
        Ok(coordinator)
    }

    /// `host:port` prefix of every local transaction name.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn set_default_validator(&self, validator: Arc<dyn ParticipantValidator>) {
        if let Ok(mut slot) = self.default_validator.write() {
            *slot = Some(validator);
        }
    }

    pub fn default_validator(&self) -> Option<Arc<dyn ParticipantValidator>> {
        self.default_validator.read().ok().and_then(|v| v.clone())
    }

    pub fn begin(&self) -> Result<Arc<Transaction>, ServerError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let tx = Arc::new(Transaction::new(id, format!("{}:{id}", self.endpoint)));
        if let Some(validator) = self.default_validator() {
            tx.set_validator(validator)?;
        }
        self.live
            .lock()
            .map_err(|_| ServerError::Internal("transaction table poisoned".to_string()))?
            .insert(id, tx.clone());
        debug!(transaction_id = id, "begin transaction");
        Ok(tx)
    }

    /// Add a participant's local name to the transaction.
    pub fn add_local(&self, tx: &Transaction, name: &str) -> Result<(), ServerError> {
        TransactionName::parse(name)?;
        tx.add_participant(name)
    }

    /// Commit `tx`, validating every foreign name in `all_local_names` first.
    ///
    /// Without foreign names the transaction commits immediately. Otherwise it
    /// enters `PendingValidate` and the validator queue finishes it.
    pub fn commit(&self, tx: &Arc<Transaction>, all_local_names: &str) -> Result<(), ServerError> {
        let has_foreign = name::split_names(all_local_names)
            .any(|candidate| !name::is_local(candidate, &self.endpoint));
        if !has_foreign {
            return self.finish_commit(tx);
        }
        for candidate in name::split_names(all_local_names) {
            tx.add_participant(candidate)?;
        }
        tx.mark_pending_validate()?;
        debug!(transaction_id = tx.id(), names = all_local_names, "awaiting validation");
        self.validator_queue
            .enqueue(Arc::downgrade(tx), all_local_names.to_string())
    }

    /// Called by the validator queue once every foreign participant confirmed.
    ///
    /// A transaction that was rolled back meanwhile is left alone.
    pub fn commit_after_validate(&self, tx: &Arc<Transaction>) -> Result<(), ServerError> {
        match tx.state() {
            TransactionState::PendingValidate => self.finish_commit(tx),
            state => {
                debug!(transaction_id = tx.id(), ?state, "skip commit after validate");
                Ok(())
            }
        }
    }

    fn finish_commit(&self, tx: &Arc<Transaction>) -> Result<(), ServerError> {
        let result = tx.finish_commit(now_millis());
        if matches!(result, Ok(true)) {
            self.committed.fetch_add(1, Ordering::Relaxed);
        }
        self.retire(tx);
        result.map(|_| ())
    }

    pub fn rollback(&self, tx: &Arc<Transaction>) -> Result<(), ServerError> {
        let result = tx.finish_rollback();
        if matches!(result, Ok(true)) {
            self.rolled_back.fetch_add(1, Ordering::Relaxed);
            debug!(transaction_id = tx.id(), "rolled back");
        }
        self.retire(tx);
        result.map(|_| ())
    }

    fn retire(&self, tx: &Transaction) {
        let state = tx.state();
        if !state.is_terminal() {
            return;
        }
        if let Ok(mut live) = self.live.lock() {
            live.remove(&tx.id());
        }
        if let Ok(mut outcomes) = self.outcomes.lock() {
            outcomes.put(tx.id(), state);
        }
    }

    /// Answer a peer asking whether one of this node's transactions committed.
    ///
    /// `PendingValidate` counts as valid so two nodes validating each other
    /// both make progress.
    pub fn validate(&self, local_name: &str) -> Result<bool, ServerError> {
        let parsed = TransactionName::parse(local_name)?;
        if parsed.endpoint() != self.endpoint {
            warn!(name = local_name, endpoint = %self.endpoint, "validate for foreign name");
            return Ok(false);
        }
        Ok(matches!(
            self.state_of(parsed.transaction_id),
            Some(TransactionState::PendingValidate | TransactionState::Committed(_))
        ))
    }

    pub fn state_of(&self, transaction_id: u64) -> Option<TransactionState> {
        if let Some(tx) = self
            .live
            .lock()
            .ok()
            .and_then(|live| live.get(&transaction_id).cloned())
        {
            return Some(tx.state());
        }
        self.outcomes
            .lock()
            .ok()
            .and_then(|mut outcomes| outcomes.get(&transaction_id).copied())
    }

    pub fn counts(&self) -> CoordinatorCounts {
        let (open, pending_validate) = self
            .live
            .lock()
            .map(|live| {
                live.values().fold((0, 0), |(open, pending), tx| match tx.state() {
                    TransactionState::Open => (open + 1, pending),
                    TransactionState::PendingValidate => (open, pending + 1),
                    _ => (open, pending),
                })
            })
            .unwrap_or_default();
        CoordinatorCounts {
            open,
            pending_validate,
            committed: self.committed.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
        }
    }

    pub fn validator_stats(&self) -> Arc<ValidatorStats> {
        self.validator_queue.stats()
    }

    /// Stop the validator thread.
    pub fn shutdown(&self) {
        self.validator_queue.close();
    }
}
