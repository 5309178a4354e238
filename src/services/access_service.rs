use std::sync::{Arc, OnceLock};
use std::time::Duration;

use moka::future::Cache;
use tracing::{error, info};

use crate::auth::auth;
use crate::clients::app_service_client;
use crate::models::Permission;
use crate::ws::sync_config::{AuthorizeFn, BoxFuture};
use crate::ws::userctx::UserCtx;

static PERMISSION_CACHE: OnceLock<Cache<(String, String), Permission>> = OnceLock::new();

fn permission_cache() -> &'static Cache<(String, String), Permission> {
    PERMISSION_CACHE.get_or_init(|| {
        Cache::builder()
            .max_capacity(100_000)
            .time_to_live(Duration::from_secs(60))
            .build()
    })
}

/// Permission of `user` on `doc_id`.
///
/// Cloud admins can always edit. Without an application service every authenticated user can edit.
pub async fn authorize_user(user: UserCtx, doc_id: String) -> Result<Permission, String> {
    if auth::is_cloud_admin(&user.principals) {
        return Ok(Permission::Edit);
    }

    let Some(client) = app_service_client::get_app_service_client() else {
        return Ok(Permission::Edit);
    };

    let key = (user.uid.clone(), doc_id.clone());
    if let Some(permission) = permission_cache().get(&key).await {
        return Ok(permission);
    }

    let permission = client.get_doc_permission(&user.uid, &doc_id).await.map_err(|e| {
        error!("Failed to retrieve permission of {} on {}: {}", user.uid, doc_id, e);
        format!("Failed to retrieve permission: {}", e)
    })?;
    info!("User {} has {:?} access to {}", user.uid, permission, doc_id);
    permission_cache().insert(key, permission).await;
    Ok(permission)
}

pub fn authorize_fn() -> AuthorizeFn {
    Arc::new(|user: UserCtx, doc_id: String| -> BoxFuture<Result<Permission, String>> {
        Box::pin(authorize_user(user, doc_id))
    })
}
