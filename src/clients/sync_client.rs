//! WebSocket client for a sync server.
//!
//! The client keeps a replica of one document that only ever changes from server messages:
//! local edits are sent as operations authored against the replica version and take effect
//! when the server's `text_change` broadcast comes back. On connection loss it reconnects
//! under a [`RetryPolicy`], presenting its participant id and acknowledged version so the
//! server can reattach the session and send the missing operations.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::clients::retry::RetryPolicy;
use crate::models::{
    AckMessage, CursorPositionEvent, CursorPositionMessage, DocumentStateMessage, ErrorMessage,
    JoinMessage, JoinedMessage, ReceivedMessage, ResyncMessage, SelectionChangeEvent,
    SelectionChangeMessage, SendMessage, TextChangeEvent, TextChangeMessage, UserPresenceEvent,
    WireOperation,
};
use crate::ot::OpKind;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("not connected")]
    NotConnected,

    #[error("invalid edit: {0}")]
    InvalidEdit(String),

    #[error("client closed")]
    Closed,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The server accepted the join (again, after a reconnect)
    Joined(JoinedMessage),
    /// Replica brought up to date from a `document_state`
    Synced { version: u64, text: String },
    /// A broadcast operation was applied; `own` is the acknowledgement of a local edit
    Changed { version: u64, participant_id: String, own: bool },
    UserJoined(UserPresenceEvent),
    UserLeft(UserPresenceEvent),
    Cursor(CursorPositionEvent),
    Selection(SelectionChangeEvent),
    Error(ErrorMessage),
    Pong(String),
    /// Connection lost; a reconnect is under way
    Disconnected,
    Reconnecting { attempt: u32 },
    /// The client stopped, either on request or because reconnecting gave up
    Closed,
}

#[derive(Debug, Clone)]
pub struct SyncClientOptions {
    /// Server endpoint, e.g. `ws://127.0.0.1:3000/ws`
    pub url: String,
    pub document_id: String,
    pub display_name: String,
    pub token: Option<String>,
    pub retry: RetryPolicy,
    pub event_capacity: usize,
}

impl SyncClientOptions {
    pub fn new(url: impl Into<String>, document_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            document_id: document_id.into(),
            display_name: display_name.into(),
            token: None,
            retry: RetryPolicy::default(),
            event_capacity: 256,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Local copy of the document, driven by server messages only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Replica {
    pub text: String,
    pub version: u64,
    pub participant_id: Option<String>,
    pub acked_version: u64,
    pub connected: bool,
}

/// What the connection should do after a server message was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Reply {
    None,
    Ack(u64),
    Resync(u64),
}

impl Replica {
    fn join_message(&self, options: &SyncClientOptions) -> JoinMessage {
        JoinMessage {
            document_id: options.document_id.clone(),
            participant_id: self.participant_id.clone(),
            display_name: options.display_name.clone(),
            acked_version: self.participant_id.as_ref().map(|_| self.acked_version),
        }
    }

    fn acknowledge(&mut self) -> Reply {
        self.acked_version = self.version;
        Reply::Ack(self.version)
    }

    fn apply_state(&mut self, state: &DocumentStateMessage) -> Result<Reply, String> {
        if let Some(text) = &state.text {
            self.text = text.clone();
            self.version = state.version;
            return Ok(self.acknowledge());
        }
        for event in state.operations.iter().flatten() {
            if event.version <= self.version {
                continue;
            }
            if event.version != self.version + 1 {
                return Ok(Reply::Resync(self.version));
            }
            self.apply_change(event)?;
        }
        if self.version < state.version {
            return Ok(Reply::Resync(self.version));
        }
        Ok(self.acknowledge())
    }

    fn apply_change(&mut self, event: &TextChangeEvent) -> Result<(), String> {
        let op = event.to_operation().map_err(|e| e.to_string())?;
        self.text = op.apply(&self.text).map_err(|e| e.to_string())?;
        self.version = event.version;
        Ok(())
    }

    fn on_text_change(&mut self, event: &TextChangeEvent) -> Result<Reply, String> {
        if event.version <= self.version {
            return Ok(Reply::None);
        }
        if event.version != self.version + 1 {
            return Ok(Reply::Resync(self.version));
        }
        self.apply_change(event)?;
        Ok(self.acknowledge())
    }

    fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

enum Command {
    Send(ReceivedMessage),
    Close,
}

enum SessionEnd {
    Lost,
    Closed,
}

/// Handle to a running client. Dropping it stops the connection.
pub struct SyncClient {
    replica: Arc<Mutex<Replica>>,
    commands: mpsc::UnboundedSender<Command>,
}

impl SyncClient {
    /// Connect, join the document and start the connection task.
    pub async fn connect(options: SyncClientOptions) -> Result<(Self, mpsc::Receiver<ClientEvent>), ClientError> {
        let (event_tx, event_rx) = mpsc::channel(options.event_capacity.max(1));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let replica = Arc::new(Mutex::new(Replica::default()));

        let ws = options
            .retry
            .run("connect", || open(&options, &replica))
            .await?;
        info!("Connected to {} for document {}", options.url, options.document_id);

        tokio::spawn(drive(ws, options, replica.clone(), command_rx, event_tx));

        Ok((Self { replica, commands: command_tx }, event_rx))
    }

    pub async fn text(&self) -> String {
        self.replica.lock().await.text.clone()
    }

    pub async fn version(&self) -> u64 {
        self.replica.lock().await.version
    }

    pub async fn participant_id(&self) -> Option<String> {
        self.replica.lock().await.participant_id.clone()
    }

    pub async fn replica(&self) -> Replica {
        self.replica.lock().await.clone()
    }

    fn send(&self, msg: ReceivedMessage) -> Result<(), ClientError> {
        self.commands.send(Command::Send(msg)).map_err(|_| ClientError::Closed)
    }

    async fn connected_replica(&self) -> Result<Replica, ClientError> {
        let replica = self.replica.lock().await.clone();
        if !replica.connected {
            return Err(ClientError::NotConnected);
        }
        Ok(replica)
    }

    /// Insert `content` at `position` of the current replica.
    pub async fn insert(&self, position: usize, content: &str) -> Result<(), ClientError> {
        let replica = self.connected_replica().await?;
        if position > replica.char_len() {
            return Err(ClientError::InvalidEdit(format!(
                "position {} beyond end of document ({})",
                position,
                replica.char_len()
            )));
        }
        self.send(ReceivedMessage::TextChange(TextChangeMessage {
            operation: WireOperation {
                kind: OpKind::Insert,
                position,
                content: Some(content.to_string()),
                length: Some(content.chars().count()),
                authored_version: replica.version,
            },
        }))
    }

    /// Delete `length` characters starting at `position` of the current replica.
    pub async fn delete(&self, position: usize, length: usize) -> Result<(), ClientError> {
        let replica = self.connected_replica().await?;
        let end = position.checked_add(length).filter(|end| *end <= replica.char_len());
        if end.is_none() {
            return Err(ClientError::InvalidEdit(format!(
                "range {} + {} beyond end of document ({})",
                position,
                length,
                replica.char_len()
            )));
        }
        self.send(ReceivedMessage::TextChange(TextChangeMessage {
            operation: WireOperation {
                kind: OpKind::Delete,
                position,
                content: None,
                length: Some(length),
                authored_version: replica.version,
            },
        }))
    }

    pub fn cursor(&self, position: usize) -> Result<(), ClientError> {
        self.send(ReceivedMessage::CursorPosition(CursorPositionMessage { position }))
    }

    pub fn selection(&self, start: Option<usize>, end: Option<usize>) -> Result<(), ClientError> {
        self.send(ReceivedMessage::SelectionChange(SelectionChangeMessage { start, end }))
    }

    pub fn ping(&self) -> Result<(), ClientError> {
        self.send(ReceivedMessage::Ping)
    }

    /// Ask the server for everything after the acknowledged version.
    pub async fn resync(&self) -> Result<(), ClientError> {
        let acked_version = self.replica.lock().await.acked_version;
        self.send(ReceivedMessage::Resync(ResyncMessage { acked_version }))
    }

    /// Leave the document and stop the connection task.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// Open a socket and send the join for the current replica state.
async fn open(options: &SyncClientOptions, replica: &Mutex<Replica>) -> Result<WsStream, ClientError> {
    let mut request = options
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| ClientError::Connect(e.to_string()))?;
    if let Some(token) = &options.token {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let (mut ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| ClientError::Connect(e.to_string()))?;

    let join = replica.lock().await.join_message(options);
    send_frame(&mut ws, &ReceivedMessage::Join(join))
        .await
        .map_err(|e| ClientError::Connect(e.to_string()))?;
    Ok(ws)
}

async fn send_frame(ws: &mut WsStream, msg: &ReceivedMessage) -> Result<(), String> {
    let text = serde_json::to_string(msg).map_err(|e| format!("Failed to serialize message: {}", e))?;
    ws.send(Message::text(text)).await.map_err(|e| e.to_string())
}

/// Connection task: serve the socket, reconnect when it drops.
async fn drive(
    mut ws: WsStream,
    options: SyncClientOptions,
    replica: Arc<Mutex<Replica>>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::Sender<ClientEvent>,
) {
    loop {
        if let SessionEnd::Closed = serve(&mut ws, &replica, &mut commands, &events).await {
            break;
        }
        replica.lock().await.connected = false;
        let _ = events.send(ClientEvent::Disconnected).await;

        let mut attempt = 1;
        let reconnected = loop {
            let _ = events.send(ClientEvent::Reconnecting { attempt }).await;
            match open(&options, &replica).await {
                Ok(socket) => break Some(socket),
                Err(e) if options.retry.allows(attempt) => {
                    let delay = options.retry.delay(attempt);
                    warn!("Reconnect attempt {} failed: {}. Retrying in {:?}", attempt, e, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!("Giving up reconnecting to {} after {} attempts: {}", options.url, attempt, e);
                    break None;
                }
            }
        };
        match reconnected {
            Some(socket) => {
                info!("Reconnected to {} after {} attempt(s)", options.url, attempt);
                ws = socket;
            }
            None => break,
        }
    }
    replica.lock().await.connected = false;
    let _ = events.send(ClientEvent::Closed).await;
}

async fn serve(
    ws: &mut WsStream,
    replica: &Mutex<Replica>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    events: &mpsc::Sender<ClientEvent>,
) -> SessionEnd {
    loop {
        tokio::select! {
            frame = ws.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return SessionEnd::Lost,
                    Some(Ok(_)) => continue,
                };
                let msg: SendMessage = match serde_json::from_str(text.as_str()) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("Ignoring unreadable server message: {}", e);
                        continue;
                    }
                };
                let reply = on_server_message(msg, replica, events).await;
                let outgoing = match reply {
                    Reply::None => continue,
                    Reply::Ack(version) => ReceivedMessage::Ack(AckMessage { version }),
                    Reply::Resync(acked_version) => ReceivedMessage::Resync(ResyncMessage { acked_version }),
                };
                if send_frame(ws, &outgoing).await.is_err() {
                    return SessionEnd::Lost;
                }
            }
            command = commands.recv() => match command {
                Some(Command::Send(msg)) => {
                    if let Err(e) = send_frame(ws, &msg).await {
                        debug!("Send failed: {}", e);
                        return SessionEnd::Lost;
                    }
                }
                Some(Command::Close) | None => {
                    let _ = send_frame(ws, &ReceivedMessage::Leave).await;
                    let _ = ws.close(None).await;
                    return SessionEnd::Closed;
                }
            },
        }
    }
}

async fn on_server_message(msg: SendMessage, replica: &Mutex<Replica>, events: &mpsc::Sender<ClientEvent>) -> Reply {
    let mut state = replica.lock().await;
    let (event, reply) = match msg {
        SendMessage::Joined(joined) => {
            state.participant_id = Some(joined.participant_id.clone());
            state.connected = true;
            (ClientEvent::Joined(joined), Reply::None)
        }
        SendMessage::DocumentState(doc) => match state.apply_state(&doc) {
            Ok(reply) => (
                ClientEvent::Synced { version: state.version, text: state.text.clone() },
                reply,
            ),
            Err(e) => {
                warn!("Catch-up could not be applied: {}", e);
                (ClientEvent::Error(local_error(e)), Reply::Resync(state.acked_version))
            }
        },
        SendMessage::TextChange(change) => match state.on_text_change(&change) {
            Ok(Reply::None) => return Reply::None,
            Ok(reply @ Reply::Resync(_)) => return reply,
            Ok(reply) => {
                let own = state.participant_id.as_deref() == Some(change.participant_id.as_str());
                (
                    ClientEvent::Changed { version: change.version, participant_id: change.participant_id, own },
                    reply,
                )
            }
            Err(e) => {
                warn!("Broadcast operation could not be applied: {}", e);
                (ClientEvent::Error(local_error(e)), Reply::Resync(state.acked_version))
            }
        },
        SendMessage::CursorPosition(cursor) => (ClientEvent::Cursor(cursor), Reply::None),
        SendMessage::SelectionChange(selection) => (ClientEvent::Selection(selection), Reply::None),
        SendMessage::UserJoined(user) => (ClientEvent::UserJoined(user), Reply::None),
        SendMessage::UserLeft(user) => (ClientEvent::UserLeft(user), Reply::None),
        SendMessage::Error(error) => (ClientEvent::Error(error), Reply::None),
        SendMessage::Pong(pong) => (ClientEvent::Pong(pong.date), Reply::None),
    };
    drop(state);
    let _ = events.send(event).await;
    reply
}

fn local_error(message: String) -> ErrorMessage {
    ErrorMessage { code: crate::error::ErrorCode::InternalError, message }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::Operation;

    fn change(version: u64, op: &Operation) -> TextChangeEvent {
        TextChangeEvent::new(version, op)
    }

    #[test]
    fn first_join_has_no_participant_id() {
        let options = SyncClientOptions::new("ws://localhost/ws", "doc", "Ada");
        let mut replica = Replica::default();
        let join = replica.join_message(&options);
        assert_eq!(join.participant_id, None);
        assert_eq!(join.acked_version, None);

        replica.participant_id = Some("p-1".into());
        replica.acked_version = 7;
        let join = replica.join_message(&options);
        assert_eq!(join.participant_id.as_deref(), Some("p-1"));
        assert_eq!(join.acked_version, Some(7));
    }

    #[test]
    fn snapshot_replaces_text_and_acks() {
        let mut replica = Replica { text: "stale".into(), version: 2, ..Default::default() };
        let reply = replica
            .apply_state(&DocumentStateMessage {
                version: 10,
                text: Some("fresh".into()),
                base_version: None,
                operations: None,
            })
            .unwrap();
        assert_eq!(reply, Reply::Ack(10));
        assert_eq!(replica.text, "fresh");
        assert_eq!(replica.acked_version, 10);
    }

    #[test]
    fn incremental_catch_up_skips_known_versions() {
        let mut replica = Replica { text: "abc".into(), version: 1, ..Default::default() };
        let ops = vec![
            change(1, &Operation::insert(0, "a", 0, "p")),
            change(2, &Operation::insert(3, "d", 1, "q")),
            change(3, &Operation::delete(0, 1, 2, "q")),
        ];
        let reply = replica
            .apply_state(&DocumentStateMessage {
                version: 3,
                text: None,
                base_version: Some(0),
                operations: Some(ops),
            })
            .unwrap();
        assert_eq!(reply, Reply::Ack(3));
        assert_eq!(replica.text, "bcd");
    }

    #[test]
    fn gap_in_broadcasts_requests_resync() {
        let mut replica = Replica { text: "abc".into(), version: 4, acked_version: 4, ..Default::default() };
        let skipped = change(6, &Operation::insert(0, "x", 5, "q"));
        assert_eq!(replica.on_text_change(&skipped).unwrap(), Reply::Resync(4));
        assert_eq!(replica.text, "abc");

        let next = change(5, &Operation::insert(3, "!", 4, "q"));
        assert_eq!(replica.on_text_change(&next).unwrap(), Reply::Ack(5));
        assert_eq!(replica.text, "abc!");
        assert_eq!(replica.on_text_change(&next).unwrap(), Reply::None);
    }
}
