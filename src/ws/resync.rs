use crate::models::{DocumentStateMessage, TextChangeEvent};
use crate::ot::DocumentState;

/// What a (re)connecting participant needs to catch up from `acked_version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchUp {
    pub message: DocumentStateMessage,
    /// The client must replace its replica rather than replay operations.
    pub is_snapshot: bool,
}

/// Operations after `acked_version` when they are all still retained, otherwise the full text.
///
/// Pure in the document: asking twice with the same version yields the same answer.
pub fn catch_up(doc: &DocumentState, acked_version: Option<u64>) -> CatchUp {
    let entries = acked_version.and_then(|acked| doc.entries_since(acked).map(|ops| (acked, ops)));
    match entries {
        Some((acked, ops)) => CatchUp {
            message: DocumentStateMessage {
                version: doc.version(),
                text: None,
                base_version: Some(acked),
                operations: Some(ops.iter().map(|(version, op)| TextChangeEvent::new(*version, op)).collect()),
            },
            is_snapshot: false,
        },
        None => snapshot(doc),
    }
}

pub fn snapshot(doc: &DocumentState) -> CatchUp {
    CatchUp {
        message: DocumentStateMessage {
            version: doc.version(),
            text: Some(doc.text().to_string()),
            base_version: None,
            operations: None,
        },
        is_snapshot: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::Operation;

    fn doc_with_history(retention: usize, edits: u64) -> DocumentState {
        let mut doc = DocumentState::new("doc", "", 0, retention);
        for v in 0..edits {
            doc.submit(Operation::insert(v as usize, "a", v, "writer")).unwrap();
        }
        doc
    }

    #[test]
    fn retained_range_is_replayed() {
        let doc = doc_with_history(100, 5);
        let result = catch_up(&doc, Some(3));
        assert!(!result.is_snapshot);
        assert_eq!(result.message.base_version, Some(3));
        let ops = result.message.operations.unwrap();
        assert_eq!(ops.iter().map(|e| e.version).collect::<Vec<_>>(), vec![4, 5]);
    }

    #[test]
    fn up_to_date_client_gets_empty_operation_list() {
        let doc = doc_with_history(100, 2);
        let result = catch_up(&doc, Some(2));
        assert_eq!(result.message.operations, Some(vec![]));
    }

    #[test]
    fn resync_is_idempotent() {
        let doc = doc_with_history(100, 4);
        assert_eq!(catch_up(&doc, Some(1)), catch_up(&doc, Some(1)));
    }

    #[test]
    fn compacted_range_falls_back_to_snapshot() {
        // history compacted up to 100, participant acked 50
        let mut doc = doc_with_history(10, 110);
        doc.compact(110).unwrap();
        assert_eq!(doc.base_version(), 100);

        let result = catch_up(&doc, Some(50));
        assert!(result.is_snapshot);
        assert_eq!(result.message.version, 110);
        assert_eq!(result.message.text.as_deref(), Some(doc.text()));
        assert!(result.message.operations.is_none());
    }

    #[test]
    fn unknown_or_future_version_gets_snapshot() {
        let doc = doc_with_history(100, 2);
        assert!(catch_up(&doc, None).is_snapshot);
        assert!(catch_up(&doc, Some(9)).is_snapshot);
    }
}
