use serde::{Deserialize, Serialize};
use serde_with::{serde_as, base64::Base64, skip_serializing_none};
use utoipa::ToSchema;

/// Response for the latest state of a document
#[serde_as]
#[skip_serializing_none]
#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DocumentLatestResponse {
    pub doc_id: String,
    pub version: u64,
    pub text: Option<String>,
    /// CBOR encoded snapshot
    #[serde_as(as = "Option<Base64>")]
    #[schema(value_type = Option<String>, format = Byte)]
    pub binary: Option<Vec<u8>>,
    /// `memory` when served from a live room, `storage` otherwise
    pub source: String,
}
