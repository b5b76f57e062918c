#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::Result;
use shoal_client::{ClientConnection, ClientSession, SessionOptions};
use shoal_core::transaction::name::TransactionName;
use shoal_core::transaction::{ParticipantValidator, TransactionCoordinator, TransactionState};
use shoal_core::{ServerConfig, ServerError, ServerHandle, ShoalServer};

pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        advertise_host: "127.0.0.1".to_string(),
        scheduler_count: 2,
        max_sessions: 16,
        lock_timeout_ms: 30_000,
        status_enabled: false,
        ..ServerConfig::default()
    }
}

pub async fn start_server(config: ServerConfig) -> Result<ServerHandle> {
    ShoalServer::start(config, None).await
}

pub async fn start_with_validator(
    config: ServerConfig,
    validator: Arc<dyn ParticipantValidator>,
) -> Result<ServerHandle> {
    ShoalServer::start(config, Some(validator)).await
}

pub async fn connect(handle: &ServerHandle) -> Result<Arc<ClientConnection>> {
    Ok(ClientConnection::connect(&handle.local_addr().to_string()).await?)
}

pub async fn open_session(handle: &ServerHandle) -> Result<ClientSession> {
    let conn = connect(handle).await?;
    Ok(conn.create_session(SessionOptions::default()).await?)
}

/// Always answers the same.
pub struct FixedValidator(pub bool);

impl ParticipantValidator for FixedValidator {
    fn validate(&self, _name: &str) -> Result<bool, ServerError> {
        Ok(self.0)
    }
}

/// Validates names against in-process coordinators, keyed by endpoint.
#[derive(Default)]
pub struct CoordinatorDirectory {
    nodes: RwLock<HashMap<String, Arc<TransactionCoordinator>>>,
}

impl CoordinatorDirectory {
    pub fn register(&self, handle: &ServerHandle) {
        let coordinator = handle.context().coordinator.clone();
        if let Ok(mut nodes) = self.nodes.write() {
            nodes.insert(coordinator.endpoint().to_string(), coordinator);
        }
    }
}

impl ParticipantValidator for CoordinatorDirectory {
    /// Waits while the peer's transaction is still open, like a peer that
    /// answers once its own commit request arrived.
    fn validate(&self, name: &str) -> Result<bool, ServerError> {
        let parsed = TransactionName::parse(name)?;
        let coordinator = self
            .nodes
            .read()
            .ok()
            .and_then(|nodes| nodes.get(&parsed.endpoint()).cloned());
        let Some(coordinator) = coordinator else {
            return Ok(false);
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if coordinator.validate(name)? {
                return Ok(true);
            }
            let open = matches!(
                coordinator.state_of(parsed.transaction_id),
                Some(TransactionState::Open)
            );
            if !open || Instant::now() > deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

pub fn transaction_id(local_name: &str) -> Result<u64> {
    Ok(TransactionName::parse(local_name)?.transaction_id)
}

/// Poll `handle`'s coordinator until `transaction_id` reaches a state matching `accept`.
pub async fn wait_for_state(
    handle: &ServerHandle,
    transaction_id: u64,
    accept: impl Fn(TransactionState) -> bool,
) -> Result<TransactionState> {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let state = handle.context().coordinator.state_of(transaction_id);
        if let Some(state) = state {
            if accept(state) {
                return Ok(state);
            }
        }
        if Instant::now() > deadline {
            anyhow::bail!("transaction {transaction_id} stuck in {state:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
