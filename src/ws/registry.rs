use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::SyncError;
use super::room::{self, JoinAccepted, JoinRequest, RoomHandle, RoomStats};
use super::sync_config::SyncConfig;

const JOIN_ATTEMPTS: usize = 3;

/// Live rooms by document id. Rooms are created on first join and remove themselves when they stop.
pub struct RoomRegistry {
    rooms: Mutex<HashMap<String, RoomHandle>>,
    config: Arc<SyncConfig>,
    next_room_id: AtomicU64,
}

impl RoomRegistry {
    pub fn new(config: SyncConfig) -> Arc<Self> {
        Arc::new(Self {
            rooms: Mutex::new(HashMap::new()),
            config: Arc::new(config),
            next_room_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn get(&self, doc_id: &str) -> Option<RoomHandle> {
        self.rooms
            .lock()
            .await
            .get(doc_id)
            .filter(|handle| !handle.is_closed())
            .cloned()
    }

    pub async fn get_or_create(self: &Arc<Self>, doc_id: &str) -> RoomHandle {
        let mut rooms = self.rooms.lock().await;
        if let Some(handle) = rooms.get(doc_id).filter(|handle| !handle.is_closed()) {
            return handle.clone();
        }

        let room_id = self.next_room_id.fetch_add(1, Ordering::Relaxed);
        let (handle, task) = room::spawn(doc_id.to_string(), room_id, self.config.clone());
        rooms.insert(doc_id.to_string(), handle.clone());
        info!(doc_id, room_id, "Created room");

        // Supervise the room so a failure or panic only takes out this document.
        let registry: Weak<Self> = Arc::downgrade(self);
        let doc_id = doc_id.to_string();
        tokio::spawn(async move {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(doc_id = %doc_id, room_id, "Room ended with error: {}", e),
                Err(e) if e.is_panic() => error!(doc_id = %doc_id, room_id, "Room task panicked"),
                Err(e) => warn!(doc_id = %doc_id, room_id, "Room task cancelled: {}", e),
            }
            if let Some(registry) = registry.upgrade() {
                registry.remove(&doc_id, room_id).await;
            }
        });

        handle
    }

    /// Drop `doc_id` from the registry if it still points at `room_id`.
    pub async fn remove(&self, doc_id: &str, room_id: u64) -> bool {
        let mut rooms = self.rooms.lock().await;
        if rooms.get(doc_id).is_some_and(|handle| handle.room_id == room_id) {
            rooms.remove(doc_id);
            return true;
        }
        false
    }

    /// Join `doc_id`, creating its room if needed. A room that closes between lookup and join is
    /// replaced and the join retried.
    pub async fn join(self: &Arc<Self>, doc_id: &str, request: JoinRequest) -> Result<(RoomHandle, JoinAccepted), SyncError> {
        let mut last_err = SyncError::RoomClosed;
        for _ in 0..JOIN_ATTEMPTS {
            let handle = self.get_or_create(doc_id).await;
            match handle.join(request.clone()).await {
                Ok(accepted) => return Ok((handle, accepted)),
                Err(SyncError::RoomClosed) => {
                    self.remove(doc_id, handle.room_id).await;
                    last_err = SyncError::RoomClosed;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }

    pub async fn handles(&self) -> Vec<RoomHandle> {
        self.rooms.lock().await.values().cloned().collect()
    }

    /// Stats of every room that answers.
    pub async fn stats(&self) -> Vec<RoomStats> {
        let mut stats = Vec::new();
        for handle in self.handles().await {
            if let Ok(room_stats) = handle.stats().await {
                stats.push(room_stats);
            }
        }
        stats
    }
}
