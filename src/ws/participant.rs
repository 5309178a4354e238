use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::models::{Permission, SendMessage};

/// Sending half of a gateway connection, as seen by the room.
#[derive(Debug, Clone)]
pub struct Connection {
    pub conn_id: u64,
    pub outbound: mpsc::Sender<SendMessage>,
}

impl Connection {
    pub fn new(conn_id: u64, outbound: mpsc::Sender<SendMessage>) -> Self {
        Self { conn_id, outbound }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Disconnected,
}

/// Why a message could not be queued for a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// Outbound queue is at capacity; the connection is treated as failed.
    Overflow,
    Closed,
    Detached,
}

#[derive(Debug)]
pub struct ParticipantSession {
    pub participant_id: String,
    pub uid: String,
    pub display_name: String,
    pub permission: Permission,
    pub acked_version: u64,
    pub cursor_position: Option<usize>,
    pub selection: Option<Selection>,
    state: SessionState,
    connection: Option<Connection>,
    grace_epoch: u64,
    grace_timer: Option<JoinHandle<()>>,
}

impl ParticipantSession {
    pub fn new(
        participant_id: String,
        uid: String,
        display_name: String,
        permission: Permission,
        acked_version: u64,
        connection: Connection,
    ) -> Self {
        Self {
            participant_id,
            uid,
            display_name,
            permission,
            acked_version,
            cursor_position: None,
            selection: None,
            state: SessionState::Active,
            connection: Some(connection),
            grace_epoch: 0,
            grace_timer: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn conn_id(&self) -> Option<u64> {
        self.connection.as_ref().map(|c| c.conn_id)
    }

    pub fn grace_epoch(&self) -> u64 {
        self.grace_epoch
    }

    /// Queue `msg` without waiting.
    pub fn send(&self, msg: &SendMessage) -> Result<(), SendFailure> {
        let Some(connection) = self.connection.as_ref() else {
            return Err(SendFailure::Detached);
        };
        connection.outbound.try_send(msg.clone()).map_err(|e| match e {
            TrySendError::Full(_) => SendFailure::Overflow,
            TrySendError::Closed(_) => SendFailure::Closed,
        })
    }

    /// Raise the acknowledged version. Never lowers it.
    pub fn acknowledge(&mut self, version: u64) {
        if version > self.acked_version {
            self.acked_version = version;
        }
    }

    /// Drop the connection and enter `Disconnected`. Returns the epoch the grace timer must carry.
    pub fn detach(&mut self) -> u64 {
        self.connection = None;
        self.state = SessionState::Disconnected;
        self.cancel_grace_timer();
        self.grace_epoch
    }

    /// Hold the timer started after [`detach`](Self::detach); it is aborted on reattach or drop.
    pub fn arm_grace_timer(&mut self, timer: JoinHandle<()>) {
        if let Some(previous) = self.grace_timer.replace(timer) {
            previous.abort();
        }
    }

    /// Whether a grace expiry carrying `epoch` still applies to this session.
    pub fn grace_expired(&self, epoch: u64) -> bool {
        self.state == SessionState::Disconnected && self.grace_epoch == epoch
    }

    /// Bind a new connection, cancelling any pending grace expiry.
    pub fn reattach(&mut self, connection: Connection) {
        self.cancel_grace_timer();
        self.connection = Some(connection);
        self.state = SessionState::Active;
    }

    /// Close the outbound queue so the gateway writer ends the socket.
    pub fn close(&mut self) {
        self.connection = None;
        self.cancel_grace_timer();
    }

    fn cancel_grace_timer(&mut self) {
        self.grace_epoch += 1;
        if let Some(timer) = self.grace_timer.take() {
            timer.abort();
        }
    }
}

impl Drop for ParticipantSession {
    fn drop(&mut self) {
        if let Some(timer) = self.grace_timer.take() {
            timer.abort();
        }
    }
}
