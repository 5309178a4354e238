use crate::{auth::auth, models::{DocSnapshot, DocumentLatestResponse, ErrorResponse}, ws::RoomRegistry};
use axum::{extract::{State, Path, Extension, Query}, http::StatusCode, Json};
use std::sync::Arc;
use tracing::{error, info};
use serde::Deserialize;

#[derive(Deserialize)]
pub struct OutputFormatQuery {
    format: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum OutputFormat {
    Json,
    Binary,
    Both,
}

impl OutputFormat {
    fn from_query(format: Option<String>) -> Result<Self, String> {
        match format.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            None => Ok(OutputFormat::Json),
            Some(value) => match value.to_lowercase().as_str() {
                "json" => Ok(OutputFormat::Json),
                "binary" => Ok(OutputFormat::Binary),
                "both" => Ok(OutputFormat::Both),
                other => Err(format!("Invalid output format '{}'. Use 'json', 'binary', or 'both'.", other)),
            },
        }
    }

    fn include_json(self) -> bool {
        matches!(self, OutputFormat::Json | OutputFormat::Both)
    }

    fn include_binary(self) -> bool {
        matches!(self, OutputFormat::Binary | OutputFormat::Both)
    }
}

fn error_response(status: StatusCode, error: String) -> (StatusCode, Json<ErrorResponse>) {
    (status, Json(ErrorResponse::new(status, error)))
}

fn build_response(
    snapshot: DocSnapshot,
    output_format: OutputFormat,
    source: &str,
) -> Result<DocumentLatestResponse, (StatusCode, Json<ErrorResponse>)> {
    let binary = if output_format.include_binary() {
        Some(snapshot.to_cbor().map_err(|e| {
            error!("Failed to encode snapshot of {}: {}", snapshot.doc_id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        })?)
    } else {
        None
    };
    Ok(DocumentLatestResponse {
        doc_id: snapshot.doc_id,
        version: snapshot.version,
        text: output_format.include_json().then_some(snapshot.text),
        binary,
        source: source.to_string(),
    })
}

/// Latest text and version of a document, from its live room or from storage
pub async fn doc_latest(
    State(registry): State<Arc<RoomRegistry>>,
    Extension(prpls): Extension<Vec<String>>,
    Path(doc_id): Path<String>,
    Query(query): Query<OutputFormatQuery>,
) -> Result<(StatusCode, Json<DocumentLatestResponse>), (StatusCode, Json<ErrorResponse>)> {

    let output_format = OutputFormat::from_query(query.format)
        .map_err(|message| error_response(StatusCode::BAD_REQUEST, message))?;

    // Ensure the caller is the application service
    let _ = auth::ensure_service(&prpls, "colabri-app")?;

    // Try the live room first
    if let Some(room) = registry.get(&doc_id).await {
        if let Ok(snapshot) = room.snapshot().await {
            info!("Serving latest state of {} from memory at version {}", doc_id, snapshot.version);
            return Ok((StatusCode::OK, Json(build_response(snapshot, output_format, "memory")?)));
        }
    }

    // Otherwise ask the storage collaborator
    let Some(load) = registry.config().on_load_document.clone() else {
        return Err(error_response(StatusCode::NOT_FOUND, format!("Document '{}' not found", doc_id)));
    };
    match load(doc_id.clone()).await {
        Ok(Some(snapshot)) => Ok((StatusCode::OK, Json(build_response(snapshot, output_format, "storage")?))),
        Ok(None) => {
            error!("Document '{}' not found", doc_id);
            Err(error_response(StatusCode::NOT_FOUND, format!("Document '{}' not found", doc_id)))
        }
        Err(e) => {
            error!("Failed to load document '{}': {}", doc_id, e);
            Err(error_response(StatusCode::SERVICE_UNAVAILABLE, format!("Storage unavailable: {}", e)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_defaults_to_json() {
        assert_eq!(OutputFormat::from_query(None), Ok(OutputFormat::Json));
        assert_eq!(OutputFormat::from_query(Some(" BOTH ".into())), Ok(OutputFormat::Both));
        assert!(OutputFormat::from_query(Some("xml".into())).is_err());
    }

    #[test]
    fn binary_payload_decodes_back_to_snapshot() {
        let snapshot = DocSnapshot {
            doc_id: "d".into(),
            text: "héllo".into(),
            version: 9,
        };
        let response = build_response(snapshot.clone(), OutputFormat::Binary, "memory").ok().unwrap();
        assert!(response.text.is_none());
        let decoded = DocSnapshot::from_cbor(response.binary.as_deref().unwrap()).unwrap();
        assert_eq!(decoded, snapshot);

        let json = serde_json::to_value(&response).unwrap();
        assert!(json["binary"].is_string());
        assert!(json.get("text").is_none());
    }
}
