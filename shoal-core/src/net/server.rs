use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::context::ServerContext;
use crate::net::ConnectionContext;
use crate::transaction::ParticipantValidator;

pub struct ShoalServer;

/// A running server. Dropping the handle does not stop it; call `shutdown`.
pub struct ServerHandle {
    local_addr: SocketAddr,
    context: Arc<ServerContext>,
    shutdown: watch::Sender<bool>,
    accept_loop: JoinHandle<()>,
}

impl ShoalServer {
    /// Bind, build the node services and start accepting connections.
    ///
    /// Local transaction names use `advertise_host` and the port actually bound,
    /// so `port = 0` works for tests.
    pub async fn start(
        config: ServerConfig,
        validator: Option<Arc<dyn ParticipantValidator>>,
    ) -> Result<ServerHandle> {
        config.validate()?;
        let addr = config.bind_addr().context("failed to resolve bind address")?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let local_addr = listener.local_addr()?;
        let endpoint = format!("{}:{}", config.advertise_host, local_addr.port());
        let context = ServerContext::new(config, endpoint.clone(), validator)
            .context("failed to initialize server context")?;
        info!(%local_addr, %endpoint, "shoal server listening");

        let (shutdown, mut stopped) = watch::channel(false);
        let accept_context = context.clone();
        let accept_loop = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            tokio::spawn(ConnectionContext::serve(accept_context.clone(), stream, peer));
                        }
                        Err(err) => error!(error = %err, "accept failed"),
                    },
                }
            }
            info!("accept loop stopped");
        });

        Ok(ServerHandle {
            local_addr,
            context,
            shutdown,
            accept_loop,
        })
    }
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// Stop accepting, close every connection and stop the background threads.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.accept_loop.await.context("accept loop panicked")?;
        let context = self.context.clone();
        tokio::task::spawn_blocking(move || context.shutdown())
            .await
            .context("server shutdown task panicked")?;
        Ok(())
    }
}
