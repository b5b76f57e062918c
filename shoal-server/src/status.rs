use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::State, response::Html, routing::get, Json, Router};
use serde::Serialize;

use shoal_core::{ServerConfig, ServerContext, ServerSnapshot};

#[derive(Clone)]
struct StatusState {
    context: Arc<ServerContext>,
}

#[derive(Serialize)]
struct StatusPayload {
    generated_at: String,
    #[serde(flatten)]
    server: ServerSnapshot,
}

pub fn spawn_status_server(config: &ServerConfig, context: Arc<ServerContext>) -> Result<()> {
    if !config.status_enabled {
        return Ok(());
    }

    let addr: SocketAddr = format!("{}:{}", config.status_host, config.status_port)
        .parse()
        .with_context(|| "invalid status server bind address")?;

    let app = router(&config.status_path_prefix, StatusState { context });

    tokio::spawn(async move {
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                if let Err(err) = axum::serve(listener, app).await {
                    tracing::error!(%err, "status server failed");
                }
            }
            Err(err) => {
                tracing::error!(%err, "status server bind failed");
            }
        }
    });

    tracing::info!(%addr, "status server listening");
    Ok(())
}

fn router(prefix: &str, state: StatusState) -> Router {
    let prefix = normalize_prefix(prefix);
    Router::new()
        .route(&format!("{prefix}/"), get(status_page))
        .route(&format!("{prefix}/status.json"), get(status_json))
        .with_state(state)
}

async fn status_page() -> Html<&'static str> {
    Html(STATUS_PAGE)
}

async fn status_json(State(state): State<StatusState>) -> Json<StatusPayload> {
    Json(StatusPayload {
        generated_at: chrono::Utc::now().to_rfc3339(),
        server: state.context.snapshot(),
    })
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

const STATUS_PAGE: &str = include_str!("status.html");

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use shoal_core::ShoalServer;

    use super::*;

    fn config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            scheduler_count: 1,
            max_sessions: 7,
            status_enabled: false,
            ..ServerConfig::default()
        }
    }

    #[test]
    fn normalize_prefix_handles_empty_and_non_empty_inputs() {
        assert_eq!(normalize_prefix(""), "");
        assert_eq!(normalize_prefix("/"), "");
        assert_eq!(normalize_prefix("status"), "/status");
        assert_eq!(normalize_prefix("/status/"), "/status");
    }

    #[tokio::test]
    async fn status_page_returns_embedded_html() {
        let page = status_page().await;
        assert!(page.0.contains("<html"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn status_json_reports_the_server_snapshot() -> Result<()> {
        let handle = ShoalServer::start(config(), None).await?;
        let state = StatusState {
            context: handle.context().clone(),
        };

        let Json(payload) = status_json(State(state)).await;
        assert!(!payload.generated_at.is_empty());
        assert_eq!(payload.server.max_sessions, 7);
        assert_eq!(payload.server.connections, 0);
        assert_eq!(payload.server.schedulers.len(), 1);

        let json = serde_json::to_value(&payload)?;
        assert!(json.get("endpoint").is_some());
        assert!(json.get("coordinator").is_some());

        handle.shutdown().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn spawn_status_server_validates_bind_address_when_enabled() -> Result<()> {
        let handle = ShoalServer::start(config(), None).await?;
        let enabled = ServerConfig {
            status_enabled: true,
            status_host: "invalid host".to_string(),
            status_port: 9999,
            ..config()
        };
        let err = spawn_status_server(&enabled, handle.context().clone())
            .err()
            .ok_or_else(|| anyhow!("expected invalid bind address error"))?;
        assert!(err
            .to_string()
            .contains("invalid status server bind address"));

        spawn_status_server(&config(), handle.context().clone())?;
        handle.shutdown().await
    }
}
