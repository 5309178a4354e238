use utoipa::OpenApi;
use crate::models::*;

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
#[allow(dead_code)]
pub async fn health_check_doc() {}

/// Readiness with the number of live rooms
#[utoipa::path(
    get,
    path = "/api/ready",
    responses(
        (status = 200, description = "Service is ready to accept sessions", body = ReadyResponse)
    )
)]
#[allow(dead_code)]
pub async fn ready_check_doc() {}

/// Room, connection and process statistics
#[utoipa::path(
    get,
    path = "/api/v1/diagnostics",
    responses(
        (status = 200, description = "Current diagnostics", body = DiagnosticsResponse),
        (status = 401, description = "Missing or invalid token", body = ErrorResponse),
        (status = 403, description = "Cloud admin access required", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn diagnostics_doc() {}

/// Latest text and version of a document
#[utoipa::path(
    get,
    path = "/api/v1/documents/{doc_id}/latest",
    params(
        ("doc_id" = String, Path, description = "Document identifier"),
        ("format" = Option<String>, Query, description = "json (default), binary or both")
    ),
    responses(
        (status = 200, description = "Latest document state", body = DocumentLatestResponse),
        (status = 400, description = "Invalid output format", body = ErrorResponse),
        (status = 403, description = "Caller is not the application service", body = ErrorResponse),
        (status = 404, description = "Document not found", body = ErrorResponse),
        (status = 503, description = "Storage unavailable", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn doc_latest_doc() {}

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check_doc,
        ready_check_doc,
        diagnostics_doc,
        doc_latest_doc,
    ),
    components(
        schemas(HealthResponse, ReadyResponse, DiagnosticsResponse, DocumentLatestResponse, ErrorResponse, Permission)
    ),
    tags(
        (name = "api", description = "API endpoints")
    )
)]
pub struct ApiDoc;
