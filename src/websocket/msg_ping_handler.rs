use tracing::{debug, error};
use axum::extract::ws::Message;
use tokio::sync::mpsc::UnboundedSender;
use chrono::Utc;
use crate::models::{PongMessage, SendMessage};

/// Handle PingMessage
pub fn handle_ping_message(conn_id: u64, local: &UnboundedSender<Message>) {
    debug!("Ping message received on connection {}", conn_id);

    // Reply with pong
    let pong = SendMessage::Pong(PongMessage { date: Utc::now().to_rfc3339() });
    match pong.to_text() {
        Ok(text) => {
            if local.send(Message::Text(text)).is_err() {
                error!("Failed to send Pong message on connection {}", conn_id);
            }
        }
        Err(e) => error!("{}", e),
    }
}
