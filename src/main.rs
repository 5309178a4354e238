use std::panic;

use colabri_sync::{
    build_app,
    clients::app_service_client,
    config::{self, Config},
    db,
    services::{access_service, auth_service, snapshot_service::{self, MemorySnapshotStore}},
    ws::{userctx, RoomRegistry, SyncConfig},
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {

    // Set panic hook for better error messages
    panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
    }));

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "colabri_sync=debug,tower_http=debug,axum::rejection=trace,info".into()
        }))
        .init();

    info!("Starting server...");

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        error!("Failed to load configuration: {}", e);
        warn!("Using default configuration");
        Config::default()
    });
    let config = config::init_config(config);

    userctx::init_user_ctx_cache();

    // Application service for principals and document permissions
    match (&config.app_service_url, &config.cloud_auth_jwt_secret) {
        (Some(url), Some(secret)) => {
            match app_service_client::init_app_service_client(url.clone(), secret.clone(), config.cloud_service_name.clone()) {
                Ok(_) => info!("App service client initialized for {}", url),
                Err(e) => error!("Failed to initialize app service client: {}", e),
            }
        }
        _ => warn!("No app service configured - every authenticated user may edit every document"),
    }

    let mut sync_config = SyncConfig::from_config(config);

    // Storage collaborator
    let mut db_ready = false;
    if let Some(db_url) = &config.db_url {
        match db::dbcolab::init_db(db_url).await {
            Ok(_) => {
                info!("Database initialized successfully");
                db_ready = true;
            }
            Err(e) => error!("Failed to initialize database: {}", e),
        }
    }
    if db_ready {
        sync_config.on_load_document = Some(snapshot_service::db_load_fn());
        sync_config.on_save_document = Some(snapshot_service::db_save_fn());
    } else {
        warn!("No database available - documents are kept in memory only");
        let store = MemorySnapshotStore::new();
        sync_config.on_load_document = Some(store.load_fn());
        sync_config.on_save_document = Some(store.save_fn());
    }

    if config.cloud_auth_jwt_secret.is_none() {
        warn!("No JWT secret configured - WebSocket clients connect anonymously");
    }
    sync_config.authenticate = Some(auth_service::jwt_authenticate_fn(config.cloud_auth_jwt_secret.clone()));
    sync_config.authorize = Some(access_service::authorize_fn());

    let registry = RoomRegistry::new(sync_config);
    let app = build_app(registry, &config.cors_origin_list());

    let listener = tokio::net::TcpListener::bind(config.server_address()).await.map_err(|e| {
        error!("Failed to bind to {}: {}", config.server_address(), e);
        e
    })?;

    info!("🚀 Server running on http://{}", config.server_address());
    info!("📡 WebSocket available at ws://{}/ws", config.server_address());
    info!("📚 Swagger UI available at http://{}/swagger", config.server_address());

    axum::serve(listener, app).await?;
    Ok(())
}
