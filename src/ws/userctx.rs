use moka::sync::Cache;
use serde_json::Value;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{error, info};

use crate::clients::app_service_client;

/// Verified identity of the user behind a connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserCtx {
    pub uid: String,
    pub display_name: Option<String>,
    pub principals: Vec<String>,
}

impl UserCtx {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            display_name: None,
            principals: Vec::new(),
        }
    }

    /// Identity handed out when no authenticator is configured.
    pub fn anonymous() -> Self {
        Self::new(format!("anonymous-{}", uuid::Uuid::new_v4()))
    }

    pub fn with_principals(mut self, principals: Vec<String>) -> Self {
        self.principals = principals;
        self
    }

    pub fn has_principal(&self, principal: &str) -> bool {
        self.principals.iter().any(|p| p == principal)
    }
}

static USER_CTX_CACHE: OnceLock<Cache<String, Vec<String>>> = OnceLock::new();

pub fn init_user_ctx_cache() {
    get_user_ctx_cache();
    info!("User cache initialized");
}

pub fn get_user_ctx_cache() -> &'static Cache<String, Vec<String>> {
    USER_CTX_CACHE.get_or_init(|| {
        Cache::builder()
            .max_capacity(100_000)
            .time_to_idle(Duration::from_secs(5 * 60))
            .build()
    })
}

fn parse_principals_from_json(prpls_json: Value) -> Vec<String> {
    if let Some(prpls_val) = prpls_json.get("prpls") {
        serde_json::from_value(prpls_val.clone()).unwrap_or_else(|e| {
            error!("Failed to parse principals array from 'prpls' field: {}", e);
            Vec::new()
        })
    } else {
        serde_json::from_value(prpls_json).unwrap_or_else(|e| {
            error!("Failed to parse principals JSON: {}", e);
            Vec::new()
        })
    }
}

async fn fetch_principals_from_service(uid: &str) -> Result<Vec<String>, String> {
    let client = match app_service_client::get_app_service_client() {
        Some(client) => client,
        // No application service configured: the token's roles are all we know
        None => return Ok(Vec::new()),
    };

    let prpls_json = client
        .get_prpls(uid)
        .await
        .map_err(|e| {
            error!("Failed to retrieve principals for user {}: {}", uid, e);
            format!("Failed to retrieve principals: {}", e)
        })?;

    info!("Retrieved principals for user {}: {}", uid, prpls_json);
    Ok(parse_principals_from_json(prpls_json))
}

/// Build the user context for `uid`, merging cached service principals with token roles.
pub async fn get_or_fetch_user_ctx_async(uid: &str, display_name: Option<String>, roles: Vec<String>) -> Result<UserCtx, String> {
    let cache = get_user_ctx_cache();

    let mut principals = match cache.get(uid) {
        Some(principals) => principals,
        None => {
            info!("User context cache miss for uid {}. Refreshing from app service.", uid);
            let fetched = fetch_principals_from_service(uid).await?;
            cache.insert(uid.to_string(), fetched.clone());
            fetched
        }
    };

    for role in roles {
        let role_prpl = format!("r/{}", role);
        if !principals.contains(&role_prpl) {
            principals.push(role_prpl);
        }
    }

    Ok(UserCtx {
        uid: uid.to_string(),
        display_name,
        principals,
    })
}
