use axum::{http::StatusCode, Json};
use crate::models::ErrorResponse;

const CLOUD_ADMIN_PRPL: &str = "r/Colabri-CloudAdmin";

pub fn is_cloud_admin(prpls: &[String]) -> bool {
    prpls.iter().any(|p| p == CLOUD_ADMIN_PRPL)
}

fn forbidden(error: String) -> (StatusCode, Json<ErrorResponse>) {
    (StatusCode::FORBIDDEN, Json(ErrorResponse::new(StatusCode::FORBIDDEN, error)))
}

pub fn ensure_service(prpls: &[String], service_name: &str) -> Result<String, (StatusCode, Json<ErrorResponse>)> {
    let service_prpl = format!("s/{}", service_name);
    if prpls.iter().any(|p| p == &service_prpl) {
        return Ok(service_prpl);
    }

    if is_cloud_admin(prpls) {
        return Ok(CLOUD_ADMIN_PRPL.to_string());
    }

    Err(forbidden(format!("Service '{}' access denied", service_name)))
}

pub fn ensure_cloud_admin(prpls: &[String]) -> Result<String, (StatusCode, Json<ErrorResponse>)> {
    if is_cloud_admin(prpls) {
        return Ok(CLOUD_ADMIN_PRPL.to_string());
    }

    Err(forbidden("Cloud Admin access required".to_string()))
}
