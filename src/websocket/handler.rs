use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use axum::{
    extract::{Query, State, ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade}},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{ErrorCode, SyncError};
use crate::models::{ErrorMessage, ReceivedMessage, SendMessage};
use crate::services::auth_service::get_auth_token_from_headers;
use crate::utils::scope_guard::ScopeGuard;
use crate::websocket::msg_join_handler::handle_join_message;
use crate::websocket::msg_ping_handler::handle_ping_message;
use crate::websocket::msg_room_handler::to_room_message;
use crate::ws::{Connection, RoomHandle, RoomRegistry, UserCtx};

/// Close code sent when a join is refused.
pub const CLOSE_AUTHORIZATION_DENIED: u16 = 4003;
/// Close code sent when the room behind a session is gone.
pub const CLOSE_ROOM_UNAVAILABLE: u16 = 4011;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Deserialize)]
pub struct WsParams {
    token: Option<String>,
}

/// Session established by a successful join.
struct Joined {
    room: RoomHandle,
    participant_id: String,
}

/// WebSocket handler
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(registry): State<Arc<RoomRegistry>>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
) -> Response {
    info!("New WebSocket connection attempt");

    let token = get_auth_token_from_headers(&headers).ok().or(params.token);
    let user = match &registry.config().authenticate {
        Some(authenticate) => match authenticate(token).await {
            Ok(user) => user,
            Err(e) => {
                warn!("WebSocket authentication failed: {}", e);
                return StatusCode::UNAUTHORIZED.into_response();
            }
        },
        None => UserCtx::anonymous(),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, registry, user))
}

fn error_frame(code: ErrorCode, message: impl Into<String>) -> Option<Message> {
    let msg = SendMessage::Error(ErrorMessage { code, message: message.into() });
    encode(&msg)
}

fn encode(msg: &SendMessage) -> Option<Message> {
    match msg.to_text() {
        Ok(text) => Some(Message::Text(text)),
        Err(e) => {
            error!("{}", e);
            None
        }
    }
}

fn close_frame(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame { code, reason: reason.into() }))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, registry: Arc<RoomRegistry>, user: UserCtx) {
    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    info!("WebSocket connection {} established for user {}", conn_id, user.uid);

    let (mut sender, mut receiver) = socket.split();

    // Room traffic is bounded; gateway replies (pong, errors, close) go on a local channel
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<SendMessage>(registry.config().outbound_capacity);
    let (local_tx, mut local_rx) = mpsc::unbounded_channel::<Message>();

    // Report the lost connection to the room however this function exits
    let joined: Arc<Mutex<Option<Joined>>> = Arc::new(Mutex::new(None));
    let guard_joined = joined.clone();
    let _guard = ScopeGuard::new(move || {
        let session = guard_joined.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
        if let Some(session) = session {
            session.room.disconnected(&session.participant_id, conn_id);
        }
    });

    // Writer: forward room and gateway messages to the socket
    let mut send_task = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                msg = outbound_rx.recv() => match msg {
                    Some(msg) => match encode(&msg) {
                        Some(frame) => frame,
                        None => continue,
                    },
                    // the room let go of this connection
                    None => close_frame(CLOSE_ROOM_UNAVAILABLE, "session ended"),
                },
                msg = local_rx.recv() => match msg {
                    Some(frame) => frame,
                    None => break,
                },
            };
            let closing = matches!(frame, Message::Close(_));
            if sender.send(frame).await.is_err() || closing {
                break;
            }
        }
    });

    // Reader: parse client frames and route them
    let reader_joined = joined.clone();
    let mut recv_task = tokio::spawn(async move {
        let mut outbound = Some(outbound_tx);
        let mut refused = false;

        while let Some(frame) = receiver.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };
            if refused {
                continue;
            }

            let msg = match ReceivedMessage::parse(&text) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("Rejecting malformed message on connection {}: {}", conn_id, e);
                    if let Some(frame) = encode(&SendMessage::error(&e)) {
                        let _ = local_tx.send(frame);
                    }
                    continue;
                }
            };

            let current = reader_joined
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .as_ref()
                .map(|j| (j.room.clone(), j.participant_id.clone()));

            match msg {
                ReceivedMessage::Ping => handle_ping_message(conn_id, &local_tx),
                ReceivedMessage::Join(join_msg) => {
                    if current.is_some() {
                        if let Some(frame) = error_frame(ErrorCode::AlreadyJoined, "connection already joined a document") {
                            let _ = local_tx.send(frame);
                        }
                        continue;
                    }
                    let Some(queue) = outbound.clone() else {
                        continue;
                    };
                    match handle_join_message(join_msg, &user, &registry, Connection::new(conn_id, queue)).await {
                        Ok((room, accepted)) => {
                            info!(
                                "Connection {} joined {} as participant {} (reattached: {})",
                                conn_id, room.doc_id, accepted.participant_id, accepted.reattached
                            );
                            // the room now holds the only sender
                            outbound = None;
                            *reader_joined.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Joined {
                                room,
                                participant_id: accepted.participant_id,
                            });
                        }
                        Err(e @ SyncError::AuthorizationDenied(_)) => {
                            warn!("Join refused on connection {}: {}", conn_id, e);
                            if let Some(frame) = encode(&SendMessage::error(&e)) {
                                let _ = local_tx.send(frame);
                            }
                            let _ = local_tx.send(close_frame(CLOSE_AUTHORIZATION_DENIED, "authorization denied"));
                            refused = true;
                        }
                        Err(e) => {
                            warn!("Join failed on connection {}: {}", conn_id, e);
                            if let Some(frame) = encode(&SendMessage::error(&e)) {
                                let _ = local_tx.send(frame);
                            }
                        }
                    }
                }
                other => {
                    let Some((room, participant_id)) = current else {
                        if let Some(frame) = error_frame(ErrorCode::NotJoined, "join a document first") {
                            let _ = local_tx.send(frame);
                        }
                        continue;
                    };
                    let Some(room_msg) = to_room_message(other) else {
                        continue;
                    };
                    let leaving = matches!(room_msg, crate::ws::RoomMessage::Leave);
                    if let Err(e) = room.message(&participant_id, conn_id, room_msg) {
                        error!("Room for {} is gone: {}", room.doc_id, e);
                        if let Some(frame) = encode(&SendMessage::error(&e)) {
                            let _ = local_tx.send(frame);
                        }
                        let _ = local_tx.send(close_frame(CLOSE_ROOM_UNAVAILABLE, "room unavailable"));
                        refused = true;
                    }
                    if leaving {
                        reader_joined.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
                    }
                }
            }
        }
    });

    // Wait for either task to finish (and finish the other)
    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    };
    info!("WebSocket connection {} terminated", conn_id);
}
