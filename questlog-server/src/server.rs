//! Axum server setup and router configuration.

use crate::shutdown::wait_for_shutdown;
use crate::state::AppState;
use axum::extract::State;
use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::get};
use questlog_core::chain::ConnectionState;
use serde::Serialize;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Build the main application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .with_state(state)
}

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    watcher: ConnectionState,
    queue_depth: usize,
    queue_draining: bool,
    failed_events: u64,
}

/// Liveness: healthy until the chain watcher has given up.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let watcher = state.watcher_state();
    let (code, status) = if watcher == ConnectionState::Closed {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    } else {
        (StatusCode::OK, "healthy")
    };
    let queue = state.pipeline.queue();
    (
        code,
        Json(HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION"),
            watcher,
            queue_depth: queue.len(),
            queue_draining: queue.is_draining(),
            failed_events: state.pipeline.failed_events(),
        }),
    )
}

/// Ready check response.
#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    database: &'static str,
}

/// Readiness: the store answers a ping.
async fn ready_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ready",
                database: "connected",
            }),
        ),
        Err(e) => {
            tracing::warn!("Readiness check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ReadyResponse {
                    status: "not_ready",
                    database: "unreachable",
                }),
            )
        }
    }
}

/// Run the server until the shutdown flag is set.
pub async fn run_server(
    router: Router,
    addr: SocketAddr,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use questlog_core::config::QueueConfig;
    use questlog_core::persistence::MemoryPersistence;
    use questlog_core::pipeline::Pipeline;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn router(watcher: ConnectionState) -> (Router, watch::Sender<ConnectionState>) {
        let store = Arc::new(MemoryPersistence::new());
        let pipeline = Pipeline::new(QueueConfig::default(), store.clone());
        let (state_tx, state_rx) = watch::channel(watcher);
        (build_router(AppState::new(store, pipeline, state_rx)), state_tx)
    }

    async fn status_of(router: Router, path: &str) -> StatusCode {
        let request = Request::builder().uri(path).body(Body::empty()).unwrap();
        router.oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_health_follows_watcher_state() {
        let (router, state_tx) = router(ConnectionState::Reconnecting);
        assert_eq!(status_of(router.clone(), "/health").await, StatusCode::OK);

        state_tx.send_replace(ConnectionState::Closed);
        assert_eq!(
            status_of(router, "/health").await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_ready_pings_store() {
        let (router, _state_tx) = router(ConnectionState::Connected);
        assert_eq!(status_of(router, "/ready").await, StatusCode::OK);
    }
}
