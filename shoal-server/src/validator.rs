//! Asks peer nodes whether their half of a distributed transaction committed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use shoal_client::{ClientConnection, ClientError, ClientSession, SessionOptions};
use shoal_core::transaction::name::TransactionName;
use shoal_core::{ParticipantValidator, ServerConfig, ServerError};
use tokio::runtime::Handle;
use tracing::{debug, warn};

const VALIDATE_TIMEOUT: Duration = Duration::from_secs(10);

/// One client session per peer endpoint, opened on first use.
pub struct PeerValidator {
    runtime: Handle,
    options: SessionOptions,
    peers: Mutex<HashMap<String, Arc<ClientSession>>>,
}

impl PeerValidator {
    /// Must be called from inside the server's tokio runtime.
    pub fn new(config: &ServerConfig) -> Self {
        let mut options = SessionOptions::default();
        if let Some(user) = &config.auth_user {
            options.user = user.clone();
        }
        if let Some(password) = &config.auth_password {
            options.password = password.clone().into_bytes();
        }
        Self {
            runtime: Handle::current(),
            options,
            peers: Mutex::new(HashMap::new()),
        }
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<String, Arc<ClientSession>>> {
        self.peers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn session(&self, endpoint: &str) -> Result<Arc<ClientSession>, ClientError> {
        if let Some(session) = self.peers().get(endpoint) {
            if !session.connection().is_closed() {
                return Ok(session.clone());
            }
        }
        let conn = ClientConnection::connect(endpoint).await?;
        let session = Arc::new(conn.create_session(self.options.clone()).await?);
        debug!(%endpoint, "opened validation session");
        self.peers().insert(endpoint.to_string(), session.clone());
        Ok(session)
    }

    async fn ask(&self, endpoint: &str, name: &str) -> Result<bool, ClientError> {
        let session = self.session(endpoint).await?;
        session.dt_validate(name).await
    }
}

impl ParticipantValidator for PeerValidator {
    /// Blocks the calling thread; runs on the validator thread, never on the runtime.
    fn validate(&self, name: &str) -> Result<bool, ServerError> {
        let endpoint = TransactionName::parse(name)?.endpoint();
        let outcome = self
            .runtime
            .block_on(async { tokio::time::timeout(VALIDATE_TIMEOUT, self.ask(&endpoint, name)).await });
        match outcome {
            Ok(Ok(valid)) => Ok(valid),
            Ok(Err(err)) => {
                warn!(%endpoint, name, error = %err, "peer validation failed");
                self.peers().remove(&endpoint);
                Err(ServerError::DistributedTransactionFailure(format!(
                    "validate {name} on {endpoint}: {err}"
                )))
            }
            Err(_) => {
                warn!(%endpoint, name, "peer validation timed out");
                self.peers().remove(&endpoint);
                Err(ServerError::DistributedTransactionFailure(format!(
                    "validate {name} on {endpoint} timed out"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_core::transaction::TransactionState;

    fn local_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            scheduler_count: 1,
            max_sessions: 4,
            status_enabled: false,
            ..ServerConfig::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn validates_names_against_a_running_peer() -> anyhow::Result<()> {
        let peer = shoal_core::ShoalServer::start(local_config(), None).await?;
        let coordinator = peer.context().coordinator.clone();
        let tx = coordinator.begin()?;
        let name = tx.local_name().to_string();

        let validator = Arc::new(PeerValidator::new(&local_config()));
        let open = {
            let validator = validator.clone();
            let name = name.clone();
            tokio::task::spawn_blocking(move || validator.validate(&name)).await??
        };
        assert!(!open);

        coordinator.commit(&tx, &name)?;
        assert!(matches!(tx.state(), TransactionState::Committed(_)));
        let committed = {
            let validator = validator.clone();
            tokio::task::spawn_blocking(move || validator.validate(&name)).await??
        };
        assert!(committed);
        assert_eq!(validator.peers().len(), 1);

        peer.shutdown().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unreachable_peer_is_an_error() -> anyhow::Result<()> {
        let validator = Arc::new(PeerValidator::new(&local_config()));
        let outcome =
            tokio::task::spawn_blocking(move || validator.validate("127.0.0.1:1:5")).await?;
        assert!(matches!(
            outcome,
            Err(ServerError::DistributedTransactionFailure(_))
        ));
        Ok(())
    }
}
