use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Insert,
    Delete,
}

/// One atomic text mutation.
///
/// Positions and lengths count `char`s, not bytes. An `Operation` is never mutated
/// after it is built; rebasing produces a new value through [`Operation::rebased`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    #[serde(rename = "type")]
    pub kind: OpKind,
    pub position: usize,
    #[serde(default)]
    pub content: String,
    pub length: usize,
    pub authored_version: u64,
    pub origin_participant_id: String,
    pub timestamp: DateTime<Utc>,
}

impl Operation {
    pub fn insert(position: usize, content: impl Into<String>, authored_version: u64, origin: impl Into<String>) -> Self {
        let content = content.into();
        let length = content.chars().count();
        Self {
            kind: OpKind::Insert,
            position,
            content,
            length,
            authored_version,
            origin_participant_id: origin.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn delete(position: usize, length: usize, authored_version: u64, origin: impl Into<String>) -> Self {
        Self {
            kind: OpKind::Delete,
            position,
            content: String::new(),
            length,
            authored_version,
            origin_participant_id: origin.into(),
            timestamp: Utc::now(),
        }
    }

    /// Copy of this operation moved to `position` with `length` chars affected.
    ///
    /// For inserts a zero length drops the content, which is how an insert swallowed by a
    /// concurrent delete becomes a no-op.
    pub fn rebased(&self, position: usize, length: usize) -> Self {
        let content = match self.kind {
            OpKind::Insert if length == 0 => String::new(),
            OpKind::Insert => self.content.clone(),
            OpKind::Delete => String::new(),
        };
        Self {
            kind: self.kind,
            position,
            content,
            length,
            authored_version: self.authored_version,
            origin_participant_id: self.origin_participant_id.clone(),
            timestamp: self.timestamp,
        }
    }

    /// Exclusive end of the affected range, clamped at `usize::MAX`.
    pub fn end(&self) -> usize {
        self.position.saturating_add(self.length)
    }

    pub fn is_noop(&self) -> bool {
        self.length == 0
    }

    /// Apply this operation to `text`, returning the new text.
    pub fn apply(&self, text: &str) -> Result<String, SyncError> {
        let start = byte_offset(text, self.position).ok_or_else(|| {
            SyncError::InvalidOperation(format!(
                "position {} is past the end of the document ({} chars)",
                self.position,
                text.chars().count()
            ))
        })?;

        match self.kind {
            OpKind::Insert => {
                let mut out = String::with_capacity(text.len() + self.content.len());
                out.push_str(&text[..start]);
                out.push_str(&self.content);
                out.push_str(&text[start..]);
                Ok(out)
            }
            OpKind::Delete => {
                let end = byte_offset(text, self.end()).ok_or_else(|| {
                    SyncError::InvalidOperation(format!(
                        "delete range {}..{} is past the end of the document ({} chars)",
                        self.position,
                        self.end(),
                        text.chars().count()
                    ))
                })?;
                let mut out = String::with_capacity(text.len() - (end - start));
                out.push_str(&text[..start]);
                out.push_str(&text[end..]);
                Ok(out)
            }
        }
    }
}

/// Byte index of the `char_pos`-th char, or `text.len()` when `char_pos` equals the char count.
fn byte_offset(text: &str, char_pos: usize) -> Option<usize> {
    text.char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .nth(char_pos)
}
