use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Host written into local transaction names; peers dial it back to validate.
    pub advertise_host: String,
    /// Number of scheduler threads.
    pub scheduler_count: usize,
    /// Session idle timeout in seconds.
    pub session_timeout_seconds: u64,
    /// Capacity of the per-connection statement/result cache.
    pub server_cached_objects: usize,
    /// Fetch size used when a client does not send one.
    pub result_fetch_size: i32,
    /// Size of the DuckDB connection pool, one connection per open session.
    pub max_sessions: usize,
    /// Upper bound on messages the transaction validator drains per batch.
    pub validator_batch_size: usize,
    /// How long a storage write may wait for a row lock held by another transaction.
    pub lock_timeout_ms: u64,
    /// BLOBs above this many bytes are returned as LOB references.
    pub lob_inline_limit: usize,
    /// Optional DuckDB database file. In-memory when unset.
    pub database_path: Option<String>,
    pub auth_user: Option<String>,
    pub auth_password: Option<String>,
    /// Log format: "compact" or "json".
    pub log_format: String,
    pub status_enabled: bool,
    pub status_host: String,
    pub status_port: u16,
    pub status_path_prefix: String,
    pub slow_query_threshold_ms: u64,
    pub metrics_history_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9210,
            advertise_host: "127.0.0.1".to_string(),
            scheduler_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            session_timeout_seconds: 1800,
            server_cached_objects: 64,
            result_fetch_size: 100,
            max_sessions: 256,
            validator_batch_size: 128,
            lock_timeout_ms: 10_000,
            lob_inline_limit: 4096,
            database_path: None,
            auth_user: None,
            auth_password: None,
            log_format: "compact".to_string(),
            status_enabled: true,
            status_host: "0.0.0.0".to_string(),
            status_port: 9211,
            status_path_prefix: String::new(),
            slow_query_threshold_ms: 1_000,
            metrics_history_size: 200,
        }
    }
}

impl ServerConfig {
    pub fn load() -> anyhow::Result<Self> {
        let defaults_json = serde_json::to_string(&Self::default())
            .with_context(|| "failed to serialize defaults")?;
        let settings = config::Config::builder()
            .add_source(
                config::File::from_str(&defaults_json, config::FileFormat::Json).required(false),
            )
            .add_source(config::Environment::with_prefix("SHOAL"))
            .build()
            .with_context(|| "failed to load configuration")?;
        let cfg: ServerConfig = settings
            .try_deserialize()
            .with_context(|| "failed to deserialize configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.to_socket_addrs()?
            .next()
            .ok_or_else(|| anyhow::anyhow!("unable to resolve bind address for {addr}"))
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_seconds)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.scheduler_count == 0 {
            anyhow::bail!("scheduler_count must be at least 1");
        }
        if self.server_cached_objects < 2 {
            anyhow::bail!("server_cached_objects must be at least 2");
        }
        if self.validator_batch_size == 0 {
            anyhow::bail!("validator_batch_size must be at least 1");
        }
        if self.max_sessions == 0 {
            anyhow::bail!("max_sessions must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() -> anyhow::Result<()> {
        let config = ServerConfig::default();
        config.validate()?;
        assert!(config.scheduler_count >= 1);
        assert_eq!(config.validator_batch_size, 128);
        assert_eq!(config.server_cached_objects, 64);
        Ok(())
    }

    #[test]
    fn validate_rejects_zero_schedulers_and_tiny_cache() {
        let no_schedulers = ServerConfig {
            scheduler_count: 0,
            ..ServerConfig::default()
        };
        assert!(no_schedulers.validate().is_err());

        let tiny_cache = ServerConfig {
            server_cached_objects: 1,
            ..ServerConfig::default()
        };
        assert!(tiny_cache.validate().is_err());
    }

    #[test]
    fn bind_addr_resolves_loopback() -> anyhow::Result<()> {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..ServerConfig::default()
        };
        assert_eq!(config.bind_addr()?.port(), 0);
        Ok(())
    }
}
