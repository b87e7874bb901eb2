//! HTTP side channels for the transport host: `/health` and `/stats`.
//!
//! Not part of the collaboration core; operators and load balancers poll
//! these. Served on a separate port from the WebSocket listener.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::manager::RoomManager;
use crate::protocol::now_ms;
use crate::server::ServerStats;

#[derive(Clone)]
pub struct HttpState {
    pub manager: Arc<RoomManager>,
    pub stats: Arc<RwLock<ServerStats>>,
}

/// Build the side-channel router.
pub fn router(manager: Arc<RoomManager>, stats: Arc<RwLock<ServerStats>>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats_endpoint))
        .with_state(HttpState { manager, stats })
}

/// Bind and serve until the task is dropped.
pub async fn serve(
    addr: &str,
    manager: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("http side channel listening on {addr}");
    axum::serve(listener, router(manager, stats)).await?;
    Ok(())
}

async fn health(State(state): State<HttpState>) -> Json<Value> {
    Json(health_payload(&state).await)
}

async fn stats_endpoint(State(state): State<HttpState>) -> Json<Value> {
    Json(stats_payload(&state).await)
}

async fn health_payload(state: &HttpState) -> Value {
    let manager_stats = state.manager.stats().await;
    let server_stats = state.stats.read().await.clone();
    json!({
        "status": "ok",
        "stats": {
            "rooms": manager_stats.room_count,
            "sessions": manager_stats.session_count,
            "connections": server_stats.active_connections,
        },
        "timestamp": now_ms(),
    })
}

async fn stats_payload(state: &HttpState) -> Value {
    let manager_stats = state.manager.stats().await;
    let server_stats = state.stats.read().await.clone();
    json!({
        "server": server_stats,
        "manager": manager_stats,
        "timestamp": now_ms(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ManagerConfig;
    use crate::session::SendQueue;

    fn state() -> HttpState {
        HttpState {
            manager: Arc::new(RoomManager::new(ManagerConfig::default())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    #[tokio::test]
    async fn test_health_shape() {
        let state = state();
        let payload = health_payload(&state).await;

        assert_eq!(payload["status"], "ok");
        assert_eq!(payload["stats"]["rooms"], 0);
        assert_eq!(payload["stats"]["sessions"], 0);
        assert!(payload["timestamp"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_stats_reflect_rooms() {
        let state = state();
        let queue = Arc::new(SendQueue::new(16));
        state.manager.join(1, queue, "r1", None).await.unwrap();

        let payload = stats_payload(&state).await;
        assert_eq!(payload["manager"]["room_count"], 1);
        assert_eq!(payload["manager"]["session_count"], 1);
        assert_eq!(payload["manager"]["rooms"][0]["id"], "r1");
    }
}
