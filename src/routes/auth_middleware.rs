use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use tracing::{error, info};
use crate::config;
use crate::ws::userctx;
use crate::services::auth_service::{get_auth_token, roles_from_claims, validate_jwt};

/// Validate the bearer token and place the caller's principals in the request extensions.
pub async fn auth_middleware(
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {

    // 1. Get the auth token from the request
    let token = match get_auth_token(&req) {
        Ok(token) => token,
        Err(_) => return Err(StatusCode::UNAUTHORIZED),
    };

    // 2. Validate Token
    let config = config::get_config();
    let secret = match &config.cloud_auth_jwt_secret {
        Some(secret) => secret,
        None => {
            error!("Cloud auth JWT secret not configured");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };
    let token_data = match validate_jwt(&token, secret) {
        Ok(token_data) => token_data,
        Err(e) => {
            error!("JWT validation failed: {}", e);
            return Err(StatusCode::UNAUTHORIZED);
        }
    };

    // 3. Both token types need a subject
    let sub = match token_data.claims.get("sub").and_then(|v| v.as_str()) {
        Some(sub) => sub.to_string(),
        None => {
            error!("JWT token does not contain 'sub' claim");
            return Err(StatusCode::UNAUTHORIZED);
        }
    };

    // 4. Determine the type of token (user/service)
    let token_type = token_data.claims.get("type").and_then(|v| v.as_str()).unwrap_or("user");

    if token_type == "user" {
        info!("User token validated successfully");
        let name = token_data.claims.get("name").and_then(|v| v.as_str()).map(str::to_string);
        let user_ctx = match userctx::get_or_fetch_user_ctx_async(&sub, name, roles_from_claims(&token_data.claims)).await {
            Ok(user_ctx) => user_ctx,
            Err(e) => {
                error!("Failed to load user context for {}: {}", sub, e);
                return Err(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };
        let extensions = req.extensions_mut();
        extensions.insert(user_ctx.principals.clone());
        extensions.insert(user_ctx);
    } else if token_type == "service" {
        info!("Service token validated successfully");
        req.extensions_mut().insert(vec![format!("s/{}", sub)]);
    } else {
        error!("Invalid token type: {}", token_type);
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(req).await)
}
