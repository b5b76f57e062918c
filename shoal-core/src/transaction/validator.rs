//! Background validation of distributed commits.
//!
//! A single consumer thread drains `ValidatorMessage`s in batches. For each
//! message it asks the transaction's validator about every foreign name and
//! commits the transaction once all of them answered true. Failures are
//! swallowed per message; the transaction then stays `PendingValidate`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use super::coordinator::TransactionCoordinator;
use super::name;
use super::{Transaction, TransactionState};
use crate::error::ServerError;

pub enum ValidatorMessage {
    Validate {
        transaction: Weak<Transaction>,
        names: String,
    },
    Close,
}

#[derive(Debug, Default)]
pub struct ValidatorStats {
    received: AtomicU64,
    validated_names: AtomicU64,
    committed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidatorStatsSnapshot {
    pub received: u64,
    pub validated_names: u64,
    pub committed: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl ValidatorStats {
    pub fn snapshot(&self) -> ValidatorStatsSnapshot {
        ValidatorStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            validated_names: self.validated_names.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

pub struct ValidatorQueue {
    sender: Option<UnboundedSender<ValidatorMessage>>,
    stopped: Arc<AtomicBool>,
    stats: Arc<ValidatorStats>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ValidatorQueue {
    pub(crate) fn start(
        coordinator: Weak<TransactionCoordinator>,
        batch_size: usize,
    ) -> Result<Self, ServerError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let stopped = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(ValidatorStats::default());
        let worker = Worker {
            coordinator,
            stopped: stopped.clone(),
            stats: stats.clone(),
            batch_size: batch_size.max(1),
        };
        let handle = std::thread::Builder::new()
            .name("transaction-validator".to_string())
            .spawn(move || worker.run(receiver))?;
        Ok(Self {
            sender: Some(sender),
            stopped,
            stats,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// A queue that refuses every message.
    pub(crate) fn stopped() -> Self {
        Self {
            sender: None,
            stopped: Arc::new(AtomicBool::new(true)),
            stats: Arc::new(ValidatorStats::default()),
            handle: Mutex::new(None),
        }
    }

    pub(crate) fn enqueue(&self, transaction: Weak<Transaction>, names: String) -> Result<(), ServerError> {
        let sender = match (&self.sender, self.stopped.load(Ordering::Acquire)) {
            (Some(sender), false) => sender,
            _ => {
                return Err(ServerError::DistributedTransactionFailure(
                    "validator queue is closed".to_string(),
                ))
            }
        };
        sender
            .send(ValidatorMessage::Validate { transaction, names })
            .map_err(|_| {
                ServerError::DistributedTransactionFailure("validator thread has exited".to_string())
            })
    }

    pub fn stats(&self) -> Arc<ValidatorStats> {
        self.stats.clone()
    }

    /// Flip the stop flag, wake the consumer and wait for it to exit.
    pub fn close(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(sender) = &self.sender {
            let _ = sender.send(ValidatorMessage::Close);
        }
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                warn!("transaction validator thread panicked");
            }
        }
    }
}

impl Drop for ValidatorQueue {
    fn drop(&mut self) {
        self.close();
    }
}

struct Worker {
    coordinator: Weak<TransactionCoordinator>,
    stopped: Arc<AtomicBool>,
    stats: Arc<ValidatorStats>,
    batch_size: usize,
}

impl Worker {
    fn run(self, mut receiver: UnboundedReceiver<ValidatorMessage>) {
        info!(batch_size = self.batch_size, "transaction validator started");
        let mut batch = Vec::with_capacity(self.batch_size);
        'outer: while !self.stopped.load(Ordering::Acquire) {
            match receiver.blocking_recv() {
                Some(message) => batch.push(message),
                None => break,
            }
            while batch.len() < self.batch_size {
                match receiver.try_recv() {
                    Ok(message) => batch.push(message),
                    Err(_) => break,
                }
            }
            for message in batch.drain(..) {
                if self.stopped.load(Ordering::Acquire) {
                    break 'outer;
                }
                match message {
                    ValidatorMessage::Close => break 'outer,
                    ValidatorMessage::Validate { transaction, names } => {
                        self.stats.received.fetch_add(1, Ordering::Relaxed);
                        self.process(transaction, &names);
                    }
                }
            }
        }
        info!("transaction validator stopped");
    }

    fn process(&self, transaction: Weak<Transaction>, names: &str) {
        let (Some(coordinator), Some(tx)) = (self.coordinator.upgrade(), transaction.upgrade()) else {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if tx.state() != TransactionState::PendingValidate {
            debug!(transaction_id = tx.id(), "transaction ended before validation");
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        match self.validate_all(&coordinator, &tx, names) {
            Ok(true) => match coordinator.commit_after_validate(&tx) {
                Ok(()) => {
                    self.stats.committed.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    warn!(transaction_id = tx.id(), error = %err, "commit after validate failed");
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                }
            },
            Ok(false) => {
                debug!(transaction_id = tx.id(), "participant did not validate");
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                warn!(transaction_id = tx.id(), error = %err, "validation failed");
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn validate_all(
        &self,
        coordinator: &TransactionCoordinator,
        tx: &Transaction,
        names: &str,
    ) -> Result<bool, ServerError> {
        let validator = tx
            .validator()
            .or_else(|| coordinator.default_validator())
            .ok_or_else(|| {
                ServerError::DistributedTransactionFailure("no participant validator".to_string())
            })?;
        for candidate in name::split_names(names) {
            if name::is_local(candidate, coordinator.endpoint()) {
                continue;
            }
            if !validator.validate(candidate)? {
                return Ok(false);
            }
            self.stats.validated_names.fetch_add(1, Ordering::Relaxed);
        }
        Ok(true)
    }
}
