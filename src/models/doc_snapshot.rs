use serde::{Deserialize, Serialize};

/// Persisted state of a document, as exchanged with the storage collaborator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DocSnapshot {
    pub doc_id: String,
    pub text: String,
    pub version: u64,
}

impl DocSnapshot {
    pub fn empty(doc_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            text: String::new(),
            version: 0,
        }
    }

    /// CBOR blob stored in the database.
    pub fn to_cbor(&self) -> Result<Vec<u8>, String> {
        serde_cbor::to_vec(self).map_err(|e| format!("Failed to serialize snapshot: {}", e))
    }

    pub fn from_cbor(bytes: &[u8]) -> Result<Self, String> {
        serde_cbor::from_slice(bytes).map_err(|e| format!("Failed to deserialize snapshot: {}", e))
    }
}
