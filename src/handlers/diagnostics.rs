use crate::{auth::auth, models::{DiagnosticsResponse, ErrorResponse}, ws::{userctx, RoomRegistry}};
use axum::{extract::{State, Extension}, http::StatusCode, Json};
use std::sync::Arc;
use std::sync::{Mutex, OnceLock};
use sysinfo::System;
use tracing::info;

static SYSTEM_MONITOR: OnceLock<Mutex<System>> = OnceLock::new();

/// Room, participant and process statistics
pub async fn diagnostics(
    State(registry): State<Arc<RoomRegistry>>,
    Extension(prpls): Extension<Vec<String>>,
) -> Result<(StatusCode, Json<DiagnosticsResponse>), (StatusCode, Json<ErrorResponse>)> {

    let _ = auth::ensure_cloud_admin(&prpls)?;

    // Aggregate diagnostics from the rooms
    let mut n_conn: u32 = 0;
    let mut n_disconnected: u32 = 0;
    let mut n_unsaved_docs: u32 = 0;
    let rooms = registry.stats().await;
    for room in &rooms {
        n_conn += room.active as u32;
        n_disconnected += room.disconnected as u32;
        if room.version > room.saved_version {
            n_unsaved_docs += 1;
        }
    }
    let n_rooms = rooms.len() as u32;

    let n_user_ctx = userctx::get_user_ctx_cache().entry_count() as u32;

    // System stats
    let (cpu_usage, memory_alloc, memory_free, memory_total) = {
        let sys_lock = SYSTEM_MONITOR.get_or_init(|| {
            Mutex::new(System::new_all())
        });
        match sys_lock.lock() {
            Ok(mut sys) => {
                sys.refresh_cpu();
                sys.refresh_memory();
                (
                    sys.global_cpu_info().cpu_usage(),
                    sys.used_memory(),
                    sys.free_memory(),
                    sys.total_memory(),
                )
            }
            Err(_) => (0.0, 0, 0, 0)
        }
    };

    info!(
        "Diagnostics: CPU: {:.2}%, Mem: {}/{} MB (Free: {} MB), Conn: {}, Held: {}, Rooms: {}",
        cpu_usage,
        memory_alloc / 1024 / 1024,
        memory_total / 1024 / 1024,
        memory_free / 1024 / 1024,
        n_conn,
        n_disconnected,
        n_rooms
    );

    Ok((
        StatusCode::OK,
        Json(DiagnosticsResponse {
            n_rooms,
            n_conn,
            n_disconnected,
            n_unsaved_docs,
            n_user_ctx,
            cpu_usage,
            memory_alloc,
            memory_total,
            memory_free,
        }),
    ))
}
