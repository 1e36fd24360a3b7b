use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::services::ServeDir;
use tracing::info;

use crate::models::{PollerState, PresenceOverview, PresenceSnapshot};

/// Read-only view handed to the web layer. Polling is never triggered from
/// here.
#[derive(Clone)]
pub struct ApiState {
    pub state: Arc<RwLock<PollerState>>,
    pub stale_after_secs: u64,
}

pub async fn get_overview(State(api): State<ApiState>) -> Json<PresenceOverview> {
    let state = api.state.read().await;
    Json(state.overview(api.stale_after_secs))
}

pub async fn get_subject(
    Path(subject_id): Path<String>,
    State(api): State<ApiState>,
) -> Result<Json<PresenceSnapshot>, StatusCode> {
    let state = api.state.read().await;
    state
        .snapshots
        .get(&subject_id)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

pub fn create_router(api: ApiState) -> Router {
    Router::new()
        .route("/api/presence", get(get_overview))
        .route("/api/presence/{subject_id}", get(get_subject))
        .fallback_service(ServeDir::new("public"))
        .with_state(api)
}

pub async fn start_server(port: u16, api: ApiState) {
    let app = create_router(api);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Presence API: http://localhost:{}", addr.port());
    let listener = tokio::net::TcpListener::bind(addr).await.expect("Failed to bind API port");
    axum::serve(listener, app).await.unwrap();
}
