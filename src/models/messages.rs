use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::error::{ErrorCode, SyncError};
use crate::models::Permission;
use crate::ot::{OpKind, Operation};

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct JoinMessage {
    pub document_id: String,
    /// Present when reconnecting to reattach an existing session.
    #[serde(default)]
    pub participant_id: Option<String>,
    pub display_name: String,
    #[serde(default)]
    pub acked_version: Option<u64>,
}

/// An operation as it travels on the wire. The origin is never trusted from the client.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WireOperation {
    #[serde(rename = "type")]
    pub kind: OpKind,
    pub position: usize,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub length: Option<usize>,
    pub authored_version: u64,
}

impl WireOperation {
    pub fn into_operation(self, origin: &str) -> Result<Operation, SyncError> {
        let op = self.build(origin)?;
        if op.position.checked_add(op.length).is_none() {
            return Err(SyncError::InvalidOperation(format!(
                "range {} + {} overflows",
                op.position, op.length
            )));
        }
        Ok(op)
    }

    fn build(self, origin: &str) -> Result<Operation, SyncError> {
        match self.kind {
            OpKind::Insert => {
                let content = self.content.ok_or_else(|| {
                    SyncError::Protocol("insert operation is missing 'content'".to_string())
                })?;
                let op = Operation::insert(self.position, content, self.authored_version, origin);
                if let Some(length) = self.length {
                    if length != op.length {
                        return Err(SyncError::InvalidOperation(format!(
                            "insert length {} does not match content length {}",
                            length, op.length
                        )));
                    }
                }
                Ok(op)
            }
            OpKind::Delete => {
                let length = self.length.ok_or_else(|| {
                    SyncError::Protocol("delete operation is missing 'length'".to_string())
                })?;
                if self.content.as_deref().is_some_and(|c| !c.is_empty()) {
                    return Err(SyncError::InvalidOperation(
                        "delete operation must not carry content".to_string(),
                    ));
                }
                Ok(Operation::delete(self.position, length, self.authored_version, origin))
            }
        }
    }
}

impl From<&Operation> for WireOperation {
    fn from(op: &Operation) -> Self {
        Self {
            kind: op.kind,
            position: op.position,
            content: match op.kind {
                OpKind::Insert => Some(op.content.clone()),
                OpKind::Delete => None,
            },
            length: Some(op.length),
            authored_version: op.authored_version,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TextChangeMessage {
    pub operation: WireOperation,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CursorPositionMessage {
    pub position: usize,
}

/// `start` and `end` both null clears the selection.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SelectionChangeMessage {
    pub start: Option<usize>,
    pub end: Option<usize>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AckMessage {
    pub version: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ResyncMessage {
    pub acked_version: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReceivedMessage {
    Join(JoinMessage),
    TextChange(TextChangeMessage),
    CursorPosition(CursorPositionMessage),
    SelectionChange(SelectionChangeMessage),
    Ack(AckMessage),
    Resync(ResyncMessage),
    Leave,
    Ping,
}

impl ReceivedMessage {
    /// Decode one text frame. Unknown types and missing fields are protocol errors.
    pub fn parse(text: &str) -> Result<Self, SyncError> {
        serde_json::from_str(text).map_err(|e| SyncError::Protocol(e.to_string()))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JoinedMessage {
    pub participant_id: String,
    pub document_id: String,
    pub version: u64,
    pub permission: Permission,
}

/// Either a full snapshot (`text`) or the operations since `base_version`.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentStateMessage {
    pub version: u64,
    pub text: Option<String>,
    pub base_version: Option<u64>,
    pub operations: Option<Vec<TextChangeEvent>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TextChangeEvent {
    /// Version produced by applying this operation.
    pub version: u64,
    pub participant_id: String,
    pub operation: WireOperation,
}

impl TextChangeEvent {
    pub fn new(version: u64, op: &Operation) -> Self {
        Self {
            version,
            participant_id: op.origin_participant_id.clone(),
            operation: WireOperation::from(op),
        }
    }

    /// Rebuild the applied operation on the receiving side.
    pub fn to_operation(&self) -> Result<Operation, SyncError> {
        self.operation.clone().into_operation(&self.participant_id)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CursorPositionEvent {
    pub participant_id: String,
    pub position: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SelectionChangeEvent {
    pub participant_id: String,
    pub start: Option<usize>,
    pub end: Option<usize>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserPresenceEvent {
    pub participant_id: String,
    pub display_name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PongMessage {
    pub date: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SendMessage {
    Joined(JoinedMessage),
    DocumentState(DocumentStateMessage),
    TextChange(TextChangeEvent),
    CursorPosition(CursorPositionEvent),
    SelectionChange(SelectionChangeEvent),
    UserJoined(UserPresenceEvent),
    UserLeft(UserPresenceEvent),
    Error(ErrorMessage),
    Pong(PongMessage),
}

impl SendMessage {
    pub fn error(err: &SyncError) -> Self {
        SendMessage::Error(ErrorMessage {
            code: err.code(),
            message: err.to_string(),
        })
    }

    pub fn to_text(&self) -> Result<String, String> {
        serde_json::to_string(self).map_err(|e| format!("Failed to serialize message: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_join_without_participant_id() {
        let msg = ReceivedMessage::parse(
            r#"{"type":"join","documentId":"doc-1","displayName":"Ada"}"#,
        )
        .unwrap();
        match msg {
            ReceivedMessage::Join(join) => {
                assert_eq!(join.document_id, "doc-1");
                assert_eq!(join.participant_id, None);
                assert_eq!(join.display_name, "Ada");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn parses_unit_messages() {
        assert!(matches!(ReceivedMessage::parse(r#"{"type":"leave"}"#), Ok(ReceivedMessage::Leave)));
        assert!(matches!(ReceivedMessage::parse(r#"{"type":"ping"}"#), Ok(ReceivedMessage::Ping)));
    }

    #[test]
    fn unknown_type_is_a_protocol_error() {
        let err = ReceivedMessage::parse(r#"{"type":"shout","text":"hi"}"#).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolError);
    }

    #[test]
    fn missing_field_is_a_protocol_error() {
        let err = ReceivedMessage::parse(r#"{"type":"cursor_position"}"#).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolError);

        let err = ReceivedMessage::parse("not json at all").unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolError);
    }

    #[test]
    fn wire_insert_builds_operation_with_server_origin() {
        let msg = ReceivedMessage::parse(
            r#"{"type":"text_change","operation":{"type":"insert","position":2,"content":"hé","authoredVersion":7}}"#,
        )
        .unwrap();
        let ReceivedMessage::TextChange(change) = msg else {
            panic!("expected text_change");
        };
        let op = change.operation.into_operation("p-9").unwrap();
        assert_eq!(op.kind, OpKind::Insert);
        assert_eq!(op.length, 2);
        assert_eq!(op.authored_version, 7);
        assert_eq!(op.origin_participant_id, "p-9");
    }

    #[test]
    fn wire_operation_validation() {
        let delete_without_length = WireOperation {
            kind: OpKind::Delete,
            position: 0,
            content: None,
            length: None,
            authored_version: 0,
        };
        assert_eq!(
            delete_without_length.into_operation("p").unwrap_err().code(),
            ErrorCode::ProtocolError
        );

        let wrong_length = WireOperation {
            kind: OpKind::Insert,
            position: 0,
            content: Some("abc".to_string()),
            length: Some(2),
            authored_version: 0,
        };
        assert_eq!(
            wrong_length.into_operation("p").unwrap_err().code(),
            ErrorCode::InvalidOperation
        );
    }

    #[test]
    fn overflowing_range_is_rejected() {
        let msg = ReceivedMessage::parse(
            r#"{"type":"text_change","operation":{"type":"delete","position":1,"length":18446744073709551615,"authoredVersion":0}}"#,
        )
        .unwrap();
        let ReceivedMessage::TextChange(change) = msg else {
            panic!("expected text_change");
        };
        assert_eq!(
            change.operation.into_operation("p").unwrap_err().code(),
            ErrorCode::InvalidOperation
        );

        let insert_at_max = WireOperation {
            kind: OpKind::Insert,
            position: usize::MAX,
            content: Some("x".to_string()),
            length: None,
            authored_version: 0,
        };
        assert_eq!(
            insert_at_max.into_operation("p").unwrap_err().code(),
            ErrorCode::InvalidOperation
        );

        let delete_to_max = WireOperation {
            kind: OpKind::Delete,
            position: 1,
            content: None,
            length: Some(usize::MAX - 1),
            authored_version: 0,
        };
        assert!(delete_to_max.into_operation("p").is_ok());
    }

    #[test]
    fn document_state_omits_absent_fields() {
        let msg = SendMessage::DocumentState(DocumentStateMessage {
            version: 3,
            text: Some("abc".to_string()),
            base_version: None,
            operations: None,
        });
        let json: serde_json::Value = serde_json::from_str(&msg.to_text().unwrap()).unwrap();
        assert_eq!(json["type"], "document_state");
        assert_eq!(json["version"], 3);
        assert_eq!(json["text"], "abc");
        assert!(json.get("operations").is_none());
        assert!(json.get("baseVersion").is_none());
    }

    #[test]
    fn error_message_carries_code() {
        let msg = SendMessage::error(&SyncError::Protocol("bad".into()));
        let json: serde_json::Value = serde_json::from_str(&msg.to_text().unwrap()).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "protocol_error");
    }
}
