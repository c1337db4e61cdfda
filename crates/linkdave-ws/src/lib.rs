//! The node server: WebSocket sessions speaking the LinkDave protocol, plus
//! the health/stats HTTP surface.

mod handler;
mod player;
mod server;
mod session;

pub use player::PlayerState;
pub use server::{HealthResponse, NodeServer};
pub use session::Session;

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};

/// Inbound frames larger than this close the session.
const MAX_MESSAGE_SIZE: usize = 512 * 1024;

/// The `/ws` router bound to a node. Origin checks pass everything; the
/// controller↔node link carries no authentication by design.
pub fn gateway_router(server: Arc<NodeServer>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(server)
}

/// The `/health` + `/stats` router, served on the node's second listener.
pub fn monitor_router(server: Arc<NodeServer>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .with_state(server)
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(server): State<Arc<NodeServer>>,
) -> impl IntoResponse {
    let client_name = headers
        .get("Client-Name")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handler::handle_connection(socket, server, client_name))
}

async fn health(State(server): State<Arc<NodeServer>>) -> Json<HealthResponse> {
    Json(server.health())
}

async fn stats(State(server): State<Arc<NodeServer>>) -> Json<linkdave_protocol::StatsData> {
    Json(server.stats())
}
