use std::sync::Arc;
use tracing::{info, warn};

use crate::error::SyncError;
use crate::models::{JoinMessage, Permission};
use crate::ws::{Connection, JoinAccepted, JoinRequest, RoomHandle, RoomRegistry, UserCtx};

/// Handle JoinMessage: authorize the user on the document, then join (or reattach to) its room.
pub async fn handle_join_message(
    join_msg: JoinMessage,
    user: &UserCtx,
    registry: &Arc<RoomRegistry>,
    connection: Connection,
) -> Result<(RoomHandle, JoinAccepted), SyncError> {
    info!(
        "Join message received for document {}: user={}, participant={:?}",
        join_msg.document_id, user.uid, join_msg.participant_id
    );

    let permission = match &registry.config().authorize {
        Some(authorize) => authorize(user.clone(), join_msg.document_id.clone())
            .await
            .map_err(|e| {
                warn!("Authorization check failed for {} on {}: {}", user.uid, join_msg.document_id, e);
                SyncError::AuthorizationDenied(format!("authorization check failed: {}", e))
            })?,
        None => Permission::Edit,
    };
    if !permission.can_join() {
        return Err(SyncError::AuthorizationDenied(format!(
            "no access to document {}",
            join_msg.document_id
        )));
    }

    let display_name = Some(join_msg.display_name.trim())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .or_else(|| user.display_name.clone())
        .unwrap_or_else(|| user.uid.clone());

    let request = JoinRequest {
        uid: user.uid.clone(),
        display_name,
        permission,
        participant_id: join_msg.participant_id,
        acked_version: join_msg.acked_version,
        connection,
    };
    registry.join(&join_msg.document_id, request).await
}
