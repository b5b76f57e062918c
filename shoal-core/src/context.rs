//! Node-wide services shared by every connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::engine::{DuckDbEngine, SqlEngine};
use crate::error::ServerError;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::net::ConnectionContext;
use crate::scheduler::{SchedulerOptions, SchedulerPool, SchedulerSnapshot};
use crate::session::auth::{self, Authenticator};
use crate::storage::lob::LobStore;
use crate::storage::Storage;
use crate::transaction::{
    CoordinatorCounts, ParticipantValidator, TransactionCoordinator, ValidatorStatsSnapshot,
};

pub struct ServerContext {
    pub config: ServerConfig,
    pub engine: Arc<dyn SqlEngine>,
    pub coordinator: Arc<TransactionCoordinator>,
    pub storage: Arc<Storage>,
    pub lobs: Arc<LobStore>,
    pub schedulers: Arc<SchedulerPool>,
    pub metrics: Metrics,
    pub authenticator: Arc<dyn Authenticator>,
    pub runtime: Handle,
    session_permits: Arc<Semaphore>,
    next_session_key: AtomicU64,
    next_connection_id: AtomicU64,
    connections: RwLock<HashMap<u64, Weak<ConnectionContext>>>,
}

#[derive(Clone, Serialize)]
pub struct ServerSnapshot {
    pub endpoint: String,
    pub connections: usize,
    pub sessions: usize,
    pub max_sessions: usize,
    pub lobs: usize,
    pub storage_maps: Vec<String>,
    pub coordinator: CoordinatorCounts,
    pub validator: ValidatorStatsSnapshot,
    pub schedulers: Vec<SchedulerSnapshot>,
    pub metrics: MetricsSnapshot,
}

impl ServerContext {
    /// Build the node services. `endpoint` is the `host:port` used in local
    /// transaction names.
    pub fn new(
        config: ServerConfig,
        endpoint: String,
        validator: Option<Arc<dyn ParticipantValidator>>,
    ) -> Result<Arc<Self>, ServerError> {
        let runtime = Handle::try_current()
            .map_err(|err| ServerError::Internal(format!("no tokio runtime: {err}")))?;
        let engine: Arc<dyn SqlEngine> = Arc::new(DuckDbEngine::new(&config)?);
        let coordinator =
            TransactionCoordinator::start(endpoint, validator, config.validator_batch_size)?;
        let schedulers = SchedulerPool::start(SchedulerOptions {
            count: config.scheduler_count,
            ..SchedulerOptions::default()
        })?;
        let metrics = Metrics::new(config.slow_query_threshold_ms, config.metrics_history_size);
        let authenticator = auth::from_config(&config);
        let session_permits = Arc::new(Semaphore::new(config.max_sessions));
        Ok(Arc::new(Self {
            config,
            engine,
            coordinator,
            storage: Arc::new(Storage::new()),
            lobs: Arc::new(LobStore::new()),
            schedulers,
            metrics,
            authenticator,
            runtime,
            session_permits,
            next_session_key: AtomicU64::new(1),
            next_connection_id: AtomicU64::new(1),
            connections: RwLock::new(HashMap::new()),
        }))
    }

    pub fn next_session_key(&self) -> u64 {
        self.next_session_key.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// One permit per open session; each session holds a pooled engine connection.
    pub fn try_acquire_session(&self) -> Result<OwnedSemaphorePermit, ServerError> {
        self.session_permits.clone().try_acquire_owned().map_err(|_| {
            ServerError::sql(
                shoal_protocol::error_codes::GENERAL_ERROR_1,
                format!("too many sessions (max {})", self.config.max_sessions),
            )
        })
    }

    pub fn register_connection(&self, conn: &Arc<ConnectionContext>) {
        self.connections
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(conn.id(), Arc::downgrade(conn));
    }

    pub fn unregister_connection(&self, id: u64) {
        self.connections
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id);
    }

    fn live_connections(&self) -> Vec<Arc<ConnectionContext>> {
        self.connections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn snapshot(&self) -> ServerSnapshot {
        let connections = self.live_connections();
        ServerSnapshot {
            endpoint: self.coordinator.endpoint().to_string(),
            connections: connections.len(),
            sessions: connections.iter().map(|conn| conn.session_count()).sum(),
            max_sessions: self.config.max_sessions,
            lobs: self.lobs.len(),
            storage_maps: self.storage.map_names(),
            coordinator: self.coordinator.counts(),
            validator: self.coordinator.validator_stats().snapshot(),
            schedulers: self.schedulers.snapshot(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Close every connection, then stop the schedulers and the validator.
    pub fn shutdown(&self) {
        let connections = self.live_connections();
        if !connections.is_empty() {
            warn!(count = connections.len(), "closing open connections");
        }
        for conn in connections {
            conn.close_all();
        }
        self.schedulers.shutdown();
        self.coordinator.shutdown();
        info!("server context stopped");
    }
}
