use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::clients::retry::RetryPolicy;
use crate::config::Config;
use crate::models::{DocSnapshot, Permission};
use super::userctx::UserCtx;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Storage collaborator: latest persisted snapshot of a document, if any.
pub type LoadDocumentFn = Arc<dyn Fn(String) -> BoxFuture<Result<Option<DocSnapshot>, String>> + Send + Sync>;

/// Storage collaborator: persist a checkpoint.
pub type SaveDocumentFn = Arc<dyn Fn(DocSnapshot) -> BoxFuture<Result<(), String>> + Send + Sync>;

/// Authentication collaborator: token presented on the upgrade request to a verified identity.
pub type AuthenticateFn = Arc<dyn Fn(Option<String>) -> BoxFuture<Result<UserCtx, String>> + Send + Sync>;

/// Authorization collaborator: permission of a user on a document.
pub type AuthorizeFn = Arc<dyn Fn(UserCtx, String) -> BoxFuture<Result<Permission, String>> + Send + Sync>;

/// Engine configuration and collaborator hooks.
#[derive(Clone)]
pub struct SyncConfig {
    pub on_load_document: Option<LoadDocumentFn>,
    pub on_save_document: Option<SaveDocumentFn>,
    pub authenticate: Option<AuthenticateFn>,
    pub authorize: Option<AuthorizeFn>,
    pub grace_period: Duration,
    pub linger: Duration,
    pub history_retention: usize,
    pub outbound_capacity: usize,
    pub save_interval: Duration,
    /// Delays between failed periodic checkpoints, and attempts for the final one
    pub save_retry: RetryPolicy,
    pub load_retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            on_load_document: None,
            on_save_document: None,
            authenticate: None,
            authorize: None,
            grace_period: Duration::from_secs(30),
            linger: Duration::from_secs(5),
            history_retention: 500,
            outbound_capacity: 256,
            save_interval: Duration::from_secs(30),
            save_retry: RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(300)),
            load_retry: RetryPolicy::new(3, Duration::from_millis(200), Duration::from_secs(2)),
        }
    }
}

impl SyncConfig {
    /// Engine tuning from the application configuration. Hooks are left unset.
    pub fn from_config(config: &Config) -> Self {
        let defaults = Self::default();
        Self {
            grace_period: config.grace_period(),
            linger: config.room_linger(),
            history_retention: config.history_retention,
            outbound_capacity: config.outbound_queue_capacity.max(1),
            save_interval: config.checkpoint_interval(),
            save_retry: RetryPolicy {
                max_delay: config.checkpoint_max_backoff(),
                ..defaults.save_retry.clone()
            },
            ..defaults
        }
    }
}
