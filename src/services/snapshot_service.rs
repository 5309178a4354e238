use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};

use crate::db::dbcolab;
use crate::models::DocSnapshot;
use crate::ws::sync_config::{BoxFuture, LoadDocumentFn, SaveDocumentFn};

/// Load the latest snapshot of a document from PostgreSQL.
pub async fn fetch_doc_snapshot_from_db(doc_id: String) -> Result<Option<DocSnapshot>, String> {
    info!("Loading document: {}", doc_id);

    let db = match dbcolab::get_db() {
        Some(db) => db,
        None => {
            error!("Database not initialized");
            return Err("Database not initialized".to_string());
        }
    };

    match db.load_snapshot(&doc_id).await {
        Ok(Some(row)) => row.to_snapshot().map(Some),
        Ok(None) => {
            info!("No stored snapshot for {}, starting empty", doc_id);
            Ok(None)
        }
        Err(e) => {
            error!("Database error loading document '{}': {}", doc_id, e);
            Err(format!("Database error: {}", e))
        }
    }
}

/// Persist a checkpoint to PostgreSQL. An older checkpoint never overwrites a newer one.
pub async fn store_doc_snapshot_in_db(snapshot: DocSnapshot) -> Result<(), String> {
    let db = dbcolab::get_db().ok_or_else(|| "Database not initialized".to_string())?;
    match db.save_snapshot(&snapshot).await {
        Ok(true) => Ok(()),
        Ok(false) => {
            warn!(
                "Stored snapshot of {} is newer than version {}, skipped",
                snapshot.doc_id, snapshot.version
            );
            Ok(())
        }
        Err(e) => Err(format!("Database error: {}", e)),
    }
}

pub fn db_load_fn() -> LoadDocumentFn {
    Arc::new(|doc_id: String| -> BoxFuture<Result<Option<DocSnapshot>, String>> {
        Box::pin(fetch_doc_snapshot_from_db(doc_id))
    })
}

pub fn db_save_fn() -> SaveDocumentFn {
    Arc::new(|snapshot: DocSnapshot| -> BoxFuture<Result<(), String>> {
        Box::pin(store_doc_snapshot_in_db(snapshot))
    })
}

/// Process-local snapshot store, used when no database is configured.
#[derive(Clone, Default)]
pub struct MemorySnapshotStore {
    snapshots: Arc<Mutex<HashMap<String, DocSnapshot>>>,
    failing: Arc<AtomicBool>,
    save_attempts: Arc<AtomicU32>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every load and save fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn save_attempts(&self) -> u32 {
        self.save_attempts.load(Ordering::SeqCst)
    }

    pub fn saved(&self, doc_id: &str) -> Option<DocSnapshot> {
        self.lock().get(doc_id).cloned()
    }

    pub fn insert(&self, snapshot: DocSnapshot) {
        self.lock().insert(snapshot.doc_id.clone(), snapshot);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, DocSnapshot>> {
        self.snapshots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load(&self, doc_id: &str) -> Result<Option<DocSnapshot>, String> {
        if self.failing.load(Ordering::SeqCst) {
            return Err("snapshot store unavailable".to_string());
        }
        Ok(self.saved(doc_id))
    }

    fn save(&self, snapshot: DocSnapshot) -> Result<(), String> {
        self.save_attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err("snapshot store unavailable".to_string());
        }
        let mut snapshots = self.lock();
        let newer_stored = snapshots
            .get(&snapshot.doc_id)
            .is_some_and(|stored| stored.version > snapshot.version);
        if !newer_stored {
            snapshots.insert(snapshot.doc_id.clone(), snapshot);
        }
        Ok(())
    }

    pub fn load_fn(&self) -> LoadDocumentFn {
        let store = self.clone();
        Arc::new(move |doc_id: String| -> BoxFuture<Result<Option<DocSnapshot>, String>> {
            let result = store.load(&doc_id);
            Box::pin(async move { result })
        })
    }

    pub fn save_fn(&self) -> SaveDocumentFn {
        let store = self.clone();
        Arc::new(move |snapshot: DocSnapshot| -> BoxFuture<Result<(), String>> {
            let result = store.save(snapshot);
            Box::pin(async move { result })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(version: u64, text: &str) -> DocSnapshot {
        DocSnapshot {
            doc_id: "doc".into(),
            text: text.into(),
            version,
        }
    }

    #[tokio::test]
    async fn save_never_regresses_version() {
        let store = MemorySnapshotStore::new();
        let save = store.save_fn();
        save(snapshot(4, "newer")).await.unwrap();
        save(snapshot(2, "older")).await.unwrap();
        assert_eq!(store.saved("doc"), Some(snapshot(4, "newer")));
        assert_eq!(store.save_attempts(), 2);
    }

    #[tokio::test]
    async fn failing_store_errors_until_recovered() {
        let store = MemorySnapshotStore::new();
        let load = store.load_fn();
        store.set_failing(true);
        assert!(load("doc".into()).await.is_err());
        store.set_failing(false);
        assert_eq!(load("doc".into()).await, Ok(None));
    }
}
