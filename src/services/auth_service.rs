use std::sync::Arc;

use tracing::{info, warn};
use axum::http::{self};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation, TokenData};

use crate::ws::sync_config::{AuthenticateFn, BoxFuture};
use crate::ws::userctx::{self, UserCtx};

// Get the auth token from a request
pub fn get_auth_token<B>(req: &http::Request<B>) -> Result<String, String> {
    get_auth_token_from_headers(req.headers())
}

pub fn get_auth_token_from_headers(headers: &http::HeaderMap) -> Result<String, String> {
    // 1. Try to get token from Authorization header
    if let Some(auth_header) = headers.get(http::header::AUTHORIZATION) {
        let auth_str = auth_header.to_str().map_err(|_| "Invalid Authorization header".to_string())?;
        Ok(auth_str
            .strip_prefix("Bearer ")
            .unwrap_or(auth_str)
            .to_string())
    }
    // 2. Try to get token from cookies
    else {
        let cookie_header = headers.get(http::header::COOKIE)
            .ok_or_else(|| "Missing Authorization header or Cookie".to_string())?
            .to_str()
            .map_err(|_| "Invalid Cookie header".to_string())?;

        for c in cookie::Cookie::split_parse(cookie_header).flatten() {
            if c.name() == "auth_token" {
                return Ok(c.value().to_string());
            }
        }
        Err("auth_token cookie not found".to_string())
    }
}

// Validate a JWT token and return the token data
pub fn validate_jwt(token: &str, secret: &str) -> Result<TokenData<serde_json::Value>, jsonwebtoken::errors::Error> {
    let validation = Validation::new(Algorithm::HS256);
    let decoding_key = DecodingKey::from_secret(secret.as_bytes());
    decode::<serde_json::Value>(token, &decoding_key, &validation)
}

/// Roles listed in the `roles` claim
pub fn roles_from_claims(claims: &serde_json::Value) -> Vec<String> {
    match claims.get("roles").and_then(|v| v.as_array()) {
        Some(roles_array) => roles_array.iter().filter_map(|r| r.as_str().map(|s| s.to_string())).collect(),
        None => Vec::new(),
    }
}

/// Verify a user token and build the user context behind it.
pub async fn authenticate_token(token: Option<String>, secret: &str) -> Result<UserCtx, String> {
    let token = token.ok_or_else(|| "Missing auth token".to_string())?;
    let token_data = validate_jwt(&token, secret).map_err(|e| format!("JWT validation failed: {}", e))?;

    let uid = token_data.claims.get("sub").and_then(|v| v.as_str())
        .ok_or_else(|| "Can't extract a UID from the JWT token".to_string())?;
    info!("JWT token validated successfully for user: {}", uid);

    let display_name = token_data.claims.get("name").and_then(|v| v.as_str()).map(str::to_string);
    let roles = roles_from_claims(&token_data.claims);

    userctx::get_or_fetch_user_ctx_async(uid, display_name, roles)
        .await
        .map_err(|e| format!("Failed to load user context for {}: {}", uid, e))
}

/// Authenticator for WebSocket connections. Without a secret every connection is anonymous.
pub fn jwt_authenticate_fn(secret: Option<String>) -> AuthenticateFn {
    match secret {
        Some(secret) => {
            let secret = Arc::new(secret);
            Arc::new(move |token: Option<String>| -> BoxFuture<Result<UserCtx, String>> {
                let secret = secret.clone();
                Box::pin(async move { authenticate_token(token, &secret).await })
            })
        }
        None => {
            warn!("No JWT secret configured, WebSocket connections are anonymous");
            Arc::new(|_token: Option<String>| -> BoxFuture<Result<UserCtx, String>> {
                Box::pin(async { Ok(UserCtx::anonymous()) })
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const SECRET: &str = "test-secret";

    fn token(claims: serde_json::Value) -> String {
        encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
    }

    fn exp() -> i64 {
        chrono::Utc::now().timestamp() + 600
    }

    #[test]
    fn token_from_bearer_header_or_cookie() {
        let req = http::Request::builder()
            .header(http::header::AUTHORIZATION, "Bearer abc")
            .body(())
            .unwrap();
        assert_eq!(get_auth_token(&req), Ok("abc".to_string()));

        let req = http::Request::builder()
            .header(http::header::COOKIE, "theme=dark; auth_token=xyz")
            .body(())
            .unwrap();
        assert_eq!(get_auth_token(&req), Ok("xyz".to_string()));

        let req = http::Request::builder().body(()).unwrap();
        assert!(get_auth_token(&req).is_err());
    }

    #[tokio::test]
    async fn valid_token_yields_user_ctx() {
        let t = token(json!({"sub": "u-42", "name": "Grace", "roles": ["Editor"], "type": "user", "exp": exp()}));
        let ctx = authenticate_token(Some(t), SECRET).await.unwrap();
        assert_eq!(ctx.uid, "u-42");
        assert_eq!(ctx.display_name.as_deref(), Some("Grace"));
        assert!(ctx.has_principal("r/Editor"));
    }

    #[tokio::test]
    async fn bad_or_missing_token_is_rejected() {
        assert!(authenticate_token(None, SECRET).await.is_err());
        let forged = encode(
            &Header::default(),
            &json!({"sub": "u-1", "exp": exp()}),
            &EncodingKey::from_secret(b"other"),
        )
        .unwrap();
        assert!(authenticate_token(Some(forged), SECRET).await.is_err());
    }
}
