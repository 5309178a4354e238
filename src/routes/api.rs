use crate::{handlers::{diagnostics, doc_latest, health_check, ready_check}, routes::auth_middleware::auth_middleware, ws::RoomRegistry};
use axum::{routing::get, Router, middleware};
use std::sync::Arc;

/// Create API routes
pub fn create_api_routes(registry: Arc<RoomRegistry>) -> Router {
    let protected = Router::<Arc<RoomRegistry>>::new()
        .route("/v1/diagnostics", get(diagnostics))
        .route("/v1/documents/:doc_id/latest", get(doc_latest))
        .route_layer(middleware::from_fn(auth_middleware)); // Applies to all routes added above

    Router::<Arc<RoomRegistry>>::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .merge(protected)
        .with_state(registry)
}
