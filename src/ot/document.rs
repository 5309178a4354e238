use std::collections::VecDeque;

use tracing::debug;

use crate::error::SyncError;
use crate::models::DocSnapshot;
use super::operation::Operation;
use super::transform::transform;

/// Result of a successful [`DocumentState::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub operation: Operation,
    pub version: u64,
}

/// Authoritative text of one document.
///
/// `history[i]` is the operation that produced version `base_version + i + 1`, so
/// `version == base_version + history.len()` and `text` is always `base_text` with
/// `history` applied in order.
#[derive(Debug, Clone)]
pub struct DocumentState {
    id: String,
    base_text: String,
    base_version: u64,
    text: String,
    version: u64,
    history: VecDeque<Operation>,
    retention: usize,
}

impl DocumentState {
    pub fn new(id: impl Into<String>, text: impl Into<String>, version: u64, retention: usize) -> Self {
        let text = text.into();
        Self {
            id: id.into(),
            base_text: text.clone(),
            base_version: version,
            text,
            version,
            history: VecDeque::new(),
            retention,
        }
    }

    pub fn from_snapshot(snapshot: DocSnapshot, retention: usize) -> Self {
        Self::new(snapshot.doc_id, snapshot.text, snapshot.version, retention)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Oldest version that can still be reached by replaying history.
    pub fn base_version(&self) -> u64 {
        self.base_version
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn snapshot(&self) -> DocSnapshot {
        DocSnapshot {
            doc_id: self.id.clone(),
            text: self.text.clone(),
            version: self.version,
        }
    }

    /// Rebase `op` over every history entry after its authored version and apply it.
    pub fn submit(&mut self, op: Operation) -> Result<Applied, SyncError> {
        if op.authored_version > self.version {
            return Err(SyncError::InvalidOperation(format!(
                "operation authored at version {} but document is at version {}",
                op.authored_version, self.version
            )));
        }
        if op.authored_version < self.base_version {
            return Err(SyncError::VersionConflict {
                authored: op.authored_version,
                base: self.base_version,
            });
        }

        let rebased = if op.authored_version == self.version {
            op
        } else {
            let start = (op.authored_version - self.base_version) as usize;
            transform(&op, self.history.range(start..))
        };

        self.text = rebased.apply(&self.text)?;
        self.version += 1;
        self.history.push_back(rebased.clone());

        Ok(Applied {
            operation: rebased,
            version: self.version,
        })
    }

    /// Operations applied after `version`, each paired with the version it produced.
    ///
    /// `None` when that range is no longer fully retained, or `version` is ahead of the document.
    pub fn entries_since(&self, version: u64) -> Option<Vec<(u64, Operation)>> {
        if version < self.base_version || version > self.version {
            return None;
        }
        let start = (version - self.base_version) as usize;
        Some(
            self.history
                .iter()
                .enumerate()
                .skip(start)
                .map(|(i, op)| (self.base_version + i as u64 + 1, op.clone()))
                .collect(),
        )
    }

    /// Fold the oldest history entries into the baseline while history exceeds the retention
    /// bound. Entries above `min_acked` are kept regardless.
    pub fn compact(&mut self, min_acked: u64) -> Result<usize, SyncError> {
        let mut dropped = 0;
        while self.history.len() > self.retention && self.base_version < min_acked {
            let Some(op) = self.history.pop_front() else {
                break;
            };
            self.base_text = op.apply(&self.base_text)?;
            self.base_version += 1;
            dropped += 1;
        }
        if dropped > 0 {
            debug!(doc_id = %self.id, dropped, base_version = self.base_version, "Compacted history");
        }
        Ok(dropped)
    }

    /// Replay history over the baseline and compare with the live text.
    pub fn check_invariants(&self) -> Result<(), SyncError> {
        if self.version != self.base_version + self.history.len() as u64 {
            return Err(SyncError::RoomFailed(format!(
                "version {} does not match base {} + {} history entries",
                self.version,
                self.base_version,
                self.history.len()
            )));
        }
        let mut replay = self.base_text.clone();
        for op in &self.history {
            replay = op
                .apply(&replay)
                .map_err(|e| SyncError::RoomFailed(format!("history does not replay: {}", e)))?;
        }
        if replay != self.text {
            return Err(SyncError::RoomFailed("text diverged from replayed history".to_string()));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn replace_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
    }
}
