use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Response for diagnostics information
#[derive(Serialize, Deserialize, ToSchema)]
pub struct DiagnosticsResponse {
    pub n_rooms: u32,
    /// Participants with a live connection
    pub n_conn: u32,
    /// Participants held within their reconnection grace period
    pub n_disconnected: u32,
    /// Rooms with edits not yet checkpointed
    pub n_unsaved_docs: u32,
    pub n_user_ctx: u32,
    pub cpu_usage: f32,
    pub memory_alloc: u64,
    pub memory_total: u64,
    pub memory_free: u64,
}
