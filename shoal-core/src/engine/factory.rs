//! Pooled DuckDB connection factory.
//!
//! Every pooled connection is a clone of one root database handle, so all
//! sessions see the same catalog whether the database lives in memory or on
//! disk.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use duckdb::Connection;
use r2d2::{CustomizeConnection, ManageConnection, Pool};
use tracing::{debug, info, instrument};

use crate::config::ServerConfig;
use crate::engine::connection::DuckDbConnection;
use crate::engine::{SqlConnection, SqlEngine};
use crate::error::ServerError;

const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(5);

/// Engine backed by a pool of connections to one DuckDB database.
#[derive(Clone)]
pub struct DuckDbEngine {
    pool: Pool<DuckDbManager>,
}

/// r2d2 manager cloning connections from the root handle.
pub struct DuckDbManager {
    root: Mutex<Connection>,
}

impl DuckDbEngine {
    #[instrument(skip(config))]
    pub fn new(config: &ServerConfig) -> Result<Self, ServerError> {
        let root = match config.database_path.as_deref() {
            Some(path) if !path.trim().is_empty() => {
                info!(path, "opening DuckDB database");
                Connection::open(path)?
            }
            _ => {
                info!("opening in-memory DuckDB database");
                Connection::open_in_memory()?
            }
        };

        let max_size = config.max_sessions.max(1) as u32;
        let min_idle = max_size.clamp(1, 4);

        let pool = Pool::builder()
            .max_size(max_size)
            .min_idle(Some(min_idle))
            .connection_timeout(CHECKOUT_TIMEOUT)
            .connection_customizer(Box::new(ResetOnAcquire))
            .build(DuckDbManager {
                root: Mutex::new(root),
            })
            .map_err(|err| ServerError::Internal(format!("failed to build DuckDB pool: {err}")))?;

        Ok(Self { pool })
    }
}

impl SqlEngine for DuckDbEngine {
    fn connect(&self) -> Result<Arc<dyn SqlConnection>, ServerError> {
        let pooled = self.pool.get_timeout(CHECKOUT_TIMEOUT).map_err(|err| {
            ServerError::Internal(format!("failed to get pooled DuckDB connection: {err}"))
        })?;
        debug!("checked out pooled DuckDB connection");
        Ok(Arc::new(DuckDbConnection::new(pooled)))
    }
}

impl ManageConnection for DuckDbManager {
    type Connection = Connection;
    type Error = ServerError;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let root = self
            .root
            .lock()
            .map_err(|_| ServerError::Internal("root connection mutex poisoned".to_string()))?;
        Ok(root.try_clone()?)
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.execute_batch("SELECT 1;")?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// Clears any transaction a previous session left open.
#[derive(Debug, Clone)]
struct ResetOnAcquire;

impl CustomizeConnection<Connection, ServerError> for ResetOnAcquire {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), ServerError> {
        if let Err(err) = conn.execute_batch("ROLLBACK;") {
            let msg = err.to_string();
            if !msg.contains("no transaction is active") {
                return Err(ServerError::DuckDb(err));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connections_share_one_catalog() -> anyhow::Result<()> {
        let engine = DuckDbEngine::new(&ServerConfig::default())?;
        let first = engine.connect()?;
        let second = engine.connect()?;

        first
            .clone()
            .prepare("CREATE TABLE shared_t (id INTEGER)", 10)?
            .execute_update()?;
        first
            .prepare("INSERT INTO shared_t VALUES (1), (2)", 10)?
            .execute_update()?;

        let mut result = second
            .prepare("SELECT count(*) FROM shared_t", 10)?
            .execute_query(0, false)?;
        assert_eq!(result.next_row(), Some(&[shoal_protocol::Value::Long(2)][..]));
        Ok(())
    }
}
