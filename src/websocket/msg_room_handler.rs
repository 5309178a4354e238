use tracing::debug;
use crate::models::ReceivedMessage;
use crate::ws::{RoomMessage, Selection};

/// Map a client message to the room traffic it stands for.
///
/// `None` for messages the gateway answers itself (`join`, `ping`).
pub fn to_room_message(msg: ReceivedMessage) -> Option<RoomMessage> {
    let room_msg = match msg {
        ReceivedMessage::TextChange(change) => RoomMessage::TextChange(change.operation),
        ReceivedMessage::CursorPosition(cursor) => RoomMessage::Cursor(cursor.position),
        ReceivedMessage::SelectionChange(selection) => {
            let selection = match (selection.start, selection.end) {
                (Some(start), Some(end)) => Some(Selection {
                    start: start.min(end),
                    end: start.max(end),
                }),
                _ => None,
            };
            RoomMessage::Selection(selection)
        }
        ReceivedMessage::Ack(ack) => RoomMessage::Ack(ack.version),
        ReceivedMessage::Resync(resync) => RoomMessage::Resync(resync.acked_version),
        ReceivedMessage::Leave => RoomMessage::Leave,
        ReceivedMessage::Join(_) | ReceivedMessage::Ping => return None,
    };
    debug!("Routing {:?} to room", room_msg);
    Some(room_msg)
}
