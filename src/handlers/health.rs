use std::sync::Arc;

use axum::{extract::State, Json};
use crate::db::dbcolab;
use crate::models::{HealthResponse, ReadyResponse};
use crate::ws::RoomRegistry;
use tracing::debug;

/// Health check endpoint
pub async fn health_check() -> Json<HealthResponse> {
    debug!("Health check requested");
    Json(HealthResponse::ok("Server is running"))
}

/// Readiness check endpoint
pub async fn ready_check(State(registry): State<Arc<RoomRegistry>>) -> Json<ReadyResponse> {
    debug!("Readiness check requested");
    let storage = if dbcolab::get_db().is_some() { "postgres" } else { "memory" };
    Json(ReadyResponse {
        status: "ok".to_string(),
        message: "Service is ready".to_string(),
        n_rooms: registry.room_count().await as u32,
        storage: storage.to_string(),
    })
}
