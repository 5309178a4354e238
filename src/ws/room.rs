use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::models::{DocSnapshot, JoinedMessage, Permission, SendMessage, TextChangeEvent, WireOperation};
use crate::ot::DocumentState;
use super::participant::{Connection, ParticipantSession, SendFailure, Selection};
use super::presence;
use super::resync;
use super::sync_config::SyncConfig;

/// A connection asking to join (or rejoin) the room. Identity and permission are already verified.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub uid: String,
    pub display_name: String,
    pub permission: Permission,
    /// Participant id from an earlier join, presented to reattach.
    pub participant_id: Option<String>,
    pub acked_version: Option<u64>,
    pub connection: Connection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinAccepted {
    pub participant_id: String,
    pub reattached: bool,
}

/// Participant traffic routed by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomMessage {
    TextChange(WireOperation),
    Cursor(usize),
    Selection(Option<Selection>),
    Ack(u64),
    Resync(u64),
    Leave,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomStats {
    pub room_id: u64,
    pub doc_id: String,
    pub version: u64,
    pub base_version: u64,
    pub history_len: usize,
    pub saved_version: u64,
    pub active: usize,
    pub disconnected: usize,
}

#[derive(Debug)]
pub enum RoomCommand {
    Join {
        request: JoinRequest,
        reply: oneshot::Sender<Result<JoinAccepted, SyncError>>,
    },
    Message {
        participant_id: String,
        conn_id: u64,
        message: RoomMessage,
    },
    Disconnected {
        participant_id: String,
        conn_id: u64,
    },
    GraceExpired {
        participant_id: String,
        epoch: u64,
    },
    LingerExpired {
        epoch: u64,
    },
    CheckpointDone {
        version: u64,
        result: Result<(), String>,
    },
    Snapshot {
        reply: oneshot::Sender<DocSnapshot>,
    },
    Stats {
        reply: oneshot::Sender<RoomStats>,
    },
}

/// Address of a running room. Cheap to clone; every call is a message to the room task.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    pub room_id: u64,
    pub doc_id: String,
    tx: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    pub fn send(&self, command: RoomCommand) -> Result<(), SyncError> {
        self.tx.send(command).map_err(|_| SyncError::RoomClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn join(&self, request: JoinRequest) -> Result<JoinAccepted, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Join { request, reply })?;
        rx.await.map_err(|_| SyncError::RoomClosed)?
    }

    pub fn message(&self, participant_id: &str, conn_id: u64, message: RoomMessage) -> Result<(), SyncError> {
        self.send(RoomCommand::Message {
            participant_id: participant_id.to_string(),
            conn_id,
            message,
        })
    }

    /// Report a lost connection. A room that is already gone has nothing to hold.
    pub fn disconnected(&self, participant_id: &str, conn_id: u64) {
        let _ = self.send(RoomCommand::Disconnected {
            participant_id: participant_id.to_string(),
            conn_id,
        });
    }

    pub async fn snapshot(&self) -> Result<DocSnapshot, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Snapshot { reply })?;
        rx.await.map_err(|_| SyncError::RoomClosed)
    }

    pub async fn stats(&self) -> Result<RoomStats, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Stats { reply })?;
        rx.await.map_err(|_| SyncError::RoomClosed)
    }
}

/// Start the room task for `doc_id`. Commands sent before the document is loaded are queued.
pub fn spawn(doc_id: String, room_id: u64, config: Arc<SyncConfig>) -> (RoomHandle, JoinHandle<Result<(), SyncError>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = RoomHandle {
        room_id,
        doc_id: doc_id.clone(),
        tx: tx.clone(),
    };
    let task = tokio::spawn(run(doc_id, room_id, config, tx, rx));
    (handle, task)
}

async fn run(
    doc_id: String,
    room_id: u64,
    config: Arc<SyncConfig>,
    tx: mpsc::UnboundedSender<RoomCommand>,
    mut rx: mpsc::UnboundedReceiver<RoomCommand>,
) -> Result<(), SyncError> {
    let doc = match load_document(&doc_id, &config).await {
        Ok(doc) => doc,
        Err(e) => {
            error!(doc_id = %doc_id, "Failed to load document: {}", e);
            reject_pending(&mut rx, &e).await;
            return Err(e);
        }
    };
    info!(doc_id = %doc_id, room_id, version = doc.version(), "Room started");

    let mut room = Room::new(doc, room_id, config, tx);
    room.arm_linger();
    let result = room.serve(&mut rx).await;
    if let Err(e) = &result {
        error!(doc_id = %doc_id, room_id, "Room failed: {}", e);
    }
    rx.close();
    room.shutdown();
    reject_pending(&mut rx, &SyncError::RoomClosed).await;
    info!(doc_id = %doc_id, room_id, "Room stopped");
    result
}

async fn load_document(doc_id: &str, config: &SyncConfig) -> Result<DocumentState, SyncError> {
    let snapshot = match &config.on_load_document {
        Some(load) => config
            .load_retry
            .run("load document", || load(doc_id.to_string()))
            .await
            .map_err(SyncError::StorageUnavailable)?,
        None => None,
    };
    let snapshot = match snapshot {
        Some(snapshot) => DocSnapshot {
            doc_id: doc_id.to_string(),
            ..snapshot
        },
        None => DocSnapshot::empty(doc_id),
    };
    Ok(DocumentState::from_snapshot(snapshot, config.history_retention))
}

/// Answer queued joins with `err` and drop everything else.
async fn reject_pending(rx: &mut mpsc::UnboundedReceiver<RoomCommand>, err: &SyncError) {
    rx.close();
    while let Some(command) = rx.recv().await {
        if let RoomCommand::Join { reply, .. } = command {
            let _ = reply.send(Err(err.clone()));
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

#[derive(Debug)]
struct CheckpointState {
    saved_version: u64,
    in_flight: bool,
    final_in_flight: bool,
    failures: u32,
    next_at: Option<Instant>,
}

struct Room {
    room_id: u64,
    doc: DocumentState,
    participants: HashMap<String, ParticipantSession>,
    config: Arc<SyncConfig>,
    tx: mpsc::UnboundedSender<RoomCommand>,
    checkpoint: CheckpointState,
    linger_epoch: u64,
    linger_timer: Option<JoinHandle<()>>,
    closing: bool,
}

impl Room {
    fn new(doc: DocumentState, room_id: u64, config: Arc<SyncConfig>, tx: mpsc::UnboundedSender<RoomCommand>) -> Self {
        let saved_version = doc.version();
        Self {
            room_id,
            doc,
            participants: HashMap::new(),
            config,
            tx,
            checkpoint: CheckpointState {
                saved_version,
                in_flight: false,
                final_in_flight: false,
                failures: 0,
                next_at: None,
            },
            linger_epoch: 0,
            linger_timer: None,
            closing: false,
        }
    }

    fn doc_id(&self) -> &str {
        self.doc.id()
    }

    async fn serve(&mut self, rx: &mut mpsc::UnboundedReceiver<RoomCommand>) -> Result<(), SyncError> {
        loop {
            let next_at = self.checkpoint.next_at;
            let command = tokio::select! {
                command = rx.recv() => command,
                _ = sleep_until(next_at.unwrap_or_else(Instant::now)), if next_at.is_some() => {
                    self.start_checkpoint(false);
                    continue;
                }
            };
            let Some(command) = command else {
                return Ok(());
            };
            if let Flow::Stop = self.handle(command)? {
                return Ok(());
            }
        }
    }

    fn handle(&mut self, command: RoomCommand) -> Result<Flow, SyncError> {
        match command {
            RoomCommand::Join { request, reply } => {
                let result = self.join(request);
                if let Err(e) = &result {
                    warn!(doc_id = %self.doc_id(), "Join rejected: {}", e);
                }
                let _ = reply.send(result);
            }
            RoomCommand::Message { participant_id, conn_id, message } => {
                self.on_message(&participant_id, conn_id, message)?;
            }
            RoomCommand::Disconnected { participant_id, conn_id } => {
                self.on_disconnected(&participant_id, Some(conn_id));
            }
            RoomCommand::GraceExpired { participant_id, epoch } => {
                let expired = self
                    .participants
                    .get(&participant_id)
                    .is_some_and(|s| s.grace_expired(epoch));
                if expired {
                    info!(doc_id = %self.doc_id(), participant_id = %participant_id, "Grace period expired");
                    self.remove(&participant_id);
                }
            }
            RoomCommand::LingerExpired { epoch } => {
                if epoch == self.linger_epoch {
                    return Ok(self.try_close());
                }
            }
            RoomCommand::CheckpointDone { version, result } => {
                return Ok(self.on_checkpoint_done(version, result));
            }
            RoomCommand::Snapshot { reply } => {
                let _ = reply.send(self.doc.snapshot());
            }
            RoomCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
        Ok(Flow::Continue)
    }

    fn join(&mut self, request: JoinRequest) -> Result<JoinAccepted, SyncError> {
        if !request.permission.can_join() {
            return Err(SyncError::AuthorizationDenied(format!(
                "no access to document {}",
                self.doc_id()
            )));
        }
        self.cancel_linger();

        let reattach = request
            .participant_id
            .as_ref()
            .filter(|pid| self.participants.get(*pid).is_some_and(|s| s.uid == request.uid))
            .cloned();
        match reattach {
            Some(participant_id) => Ok(self.reattach(participant_id, request)),
            None => {
                if let Some(unknown) = &request.participant_id {
                    info!(doc_id = %self.doc_id(), participant_id = %unknown, "Unknown participant, issuing a new id");
                }
                Ok(self.admit(request))
            }
        }
    }

    fn admit(&mut self, request: JoinRequest) -> JoinAccepted {
        let participant_id = Uuid::new_v4().to_string();
        let version = self.doc.version();
        let session = ParticipantSession::new(
            participant_id.clone(),
            request.uid,
            request.display_name,
            request.permission,
            version,
            request.connection,
        );
        info!(
            doc_id = %self.doc_id(),
            participant_id = %participant_id,
            uid = %session.uid,
            version,
            "Participant joined"
        );
        let permission = session.permission;
        self.participants.insert(participant_id.clone(), session);

        let mut outgoing = vec![
            self.joined(&participant_id, permission),
            SendMessage::DocumentState(resync::snapshot(&self.doc).message),
        ];
        outgoing.extend(presence::presence_of_others(&self.participants, &participant_id));
        self.deliver(&participant_id, outgoing);
        self.announce(&participant_id);

        JoinAccepted {
            participant_id,
            reattached: false,
        }
    }

    fn reattach(&mut self, participant_id: String, request: JoinRequest) -> JoinAccepted {
        let version = self.doc.version();
        let mut outgoing = Vec::new();
        if let Some(session) = self.participants.get_mut(&participant_id) {
            session.reattach(request.connection);
            session.permission = request.permission;
            session.display_name = request.display_name;

            let basis = request.acked_version.unwrap_or(session.acked_version);
            let catch_up = resync::catch_up(&self.doc, Some(basis));
            if catch_up.is_snapshot {
                session.acknowledge(version);
            }
            info!(
                doc_id = %self.doc.id(),
                participant_id = %participant_id,
                basis,
                snapshot = catch_up.is_snapshot,
                "Participant reattached"
            );
            outgoing.push(SendMessage::Joined(JoinedMessage {
                participant_id: participant_id.clone(),
                document_id: self.doc.id().to_string(),
                version,
                permission: session.permission,
            }));
            outgoing.push(SendMessage::DocumentState(catch_up.message));
        }
        outgoing.extend(presence::presence_of_others(&self.participants, &participant_id));
        self.deliver(&participant_id, outgoing);
        self.announce(&participant_id);

        JoinAccepted {
            participant_id,
            reattached: true,
        }
    }

    fn joined(&self, participant_id: &str, permission: Permission) -> SendMessage {
        SendMessage::Joined(JoinedMessage {
            participant_id: participant_id.to_string(),
            document_id: self.doc_id().to_string(),
            version: self.doc.version(),
            permission,
        })
    }

    /// Tell everyone else that `participant_id` is present, with its last cursor and selection.
    fn announce(&mut self, participant_id: &str) {
        let Some(session) = self.participants.get(participant_id) else {
            return;
        };
        let mut messages = vec![presence::user_joined(session)];
        messages.extend(presence::cursor(session));
        if session.selection.is_some() {
            messages.push(presence::selection(session));
        }
        for msg in &messages {
            self.broadcast(Some(participant_id), msg);
        }
    }

    fn on_disconnected(&mut self, participant_id: &str, conn_id: Option<u64>) {
        let grace = self.config.grace_period;
        let tx = self.tx.clone();
        let doc_id = self.doc.id().to_string();
        let Some(session) = self.participants.get_mut(participant_id) else {
            return;
        };
        if !session.is_active() {
            return;
        }
        if conn_id.is_some_and(|id| session.conn_id() != Some(id)) {
            debug!(doc_id = %doc_id, participant_id, "Ignoring disconnect of a replaced connection");
            return;
        }

        let epoch = session.detach();
        let expired_id = participant_id.to_string();
        let timer = tokio::spawn(async move {
            sleep(grace).await;
            let _ = tx.send(RoomCommand::GraceExpired {
                participant_id: expired_id,
                epoch,
            });
        });
        session.arm_grace_timer(timer);
        info!(doc_id = %doc_id, participant_id, grace = ?grace, "Participant disconnected, holding session");
    }

    fn remove(&mut self, participant_id: &str) {
        let Some(mut session) = self.participants.remove(participant_id) else {
            return;
        };
        session.close();
        info!(doc_id = %self.doc_id(), participant_id, "Participant left");
        let msg = presence::user_left(&session);
        self.broadcast(None, &msg);
        if self.participants.is_empty() {
            self.arm_linger();
        }
    }

    fn on_message(&mut self, participant_id: &str, conn_id: u64, message: RoomMessage) -> Result<(), SyncError> {
        let current = self
            .participants
            .get(participant_id)
            .is_some_and(|s| s.is_active() && s.conn_id() == Some(conn_id));
        if !current {
            debug!(doc_id = %self.doc_id(), participant_id, conn_id, "Dropping message from stale connection");
            return Ok(());
        }

        match message {
            RoomMessage::TextChange(operation) => self.on_text_change(participant_id, operation)?,
            RoomMessage::Cursor(position) => {
                if let Some(session) = self.participants.get_mut(participant_id) {
                    session.cursor_position = Some(position);
                }
                let msg = self.participants.get(participant_id).and_then(presence::cursor);
                if let Some(msg) = msg {
                    self.broadcast(Some(participant_id), &msg);
                }
            }
            RoomMessage::Selection(selection) => {
                let Some(session) = self.participants.get_mut(participant_id) else {
                    return Ok(());
                };
                session.selection = selection;
                let msg = presence::selection(session);
                self.broadcast(Some(participant_id), &msg);
            }
            RoomMessage::Ack(version) => {
                let version = version.min(self.doc.version());
                if let Some(session) = self.participants.get_mut(participant_id) {
                    session.acknowledge(version);
                }
                self.compact()?;
            }
            RoomMessage::Resync(acked_version) => {
                let catch_up = resync::catch_up(&self.doc, Some(acked_version));
                if catch_up.is_snapshot {
                    let version = self.doc.version();
                    if let Some(session) = self.participants.get_mut(participant_id) {
                        session.acknowledge(version);
                    }
                }
                self.deliver(participant_id, vec![SendMessage::DocumentState(catch_up.message)]);
            }
            RoomMessage::Leave => self.remove(participant_id),
        }
        Ok(())
    }

    fn on_text_change(&mut self, participant_id: &str, operation: WireOperation) -> Result<(), SyncError> {
        let can_edit = self
            .participants
            .get(participant_id)
            .is_some_and(|s| s.permission.can_edit());
        if !can_edit {
            let err = SyncError::AuthorizationDenied("read-only access to this document".to_string());
            self.deliver(participant_id, vec![SendMessage::error(&err)]);
            return Ok(());
        }

        let op = match operation.into_operation(participant_id) {
            Ok(op) => op,
            Err(e) => {
                self.deliver(participant_id, vec![SendMessage::error(&e)]);
                return Ok(());
            }
        };
        let authored = op.authored_version;

        match self.doc.submit(op) {
            Ok(applied) => {
                if let Some(session) = self.participants.get_mut(participant_id) {
                    session.acknowledge(authored);
                }
                debug!(
                    doc_id = %self.doc.id(),
                    participant_id,
                    authored,
                    version = applied.version,
                    "Applied operation"
                );
                let event = SendMessage::TextChange(TextChangeEvent::new(applied.version, &applied.operation));
                self.broadcast(None, &event);
                self.schedule_checkpoint();
                self.compact()?;
                if cfg!(debug_assertions) {
                    self.doc.check_invariants()?;
                }
            }
            Err(e @ SyncError::VersionConflict { .. }) => {
                warn!(doc_id = %self.doc_id(), participant_id, "{}; sending snapshot", e);
                let snapshot = resync::snapshot(&self.doc);
                let version = self.doc.version();
                if let Some(session) = self.participants.get_mut(participant_id) {
                    session.acknowledge(version);
                }
                self.deliver(
                    participant_id,
                    vec![SendMessage::error(&e), SendMessage::DocumentState(snapshot.message)],
                );
            }
            Err(e) => {
                debug!(doc_id = %self.doc_id(), participant_id, "Rejected operation: {}", e);
                self.deliver(participant_id, vec![SendMessage::error(&e)]);
            }
        }
        Ok(())
    }

    /// Fold history that every connected participant has acknowledged.
    fn compact(&mut self) -> Result<(), SyncError> {
        let min_acked = self
            .participants
            .values()
            .filter(|s| s.is_active())
            .map(|s| s.acked_version)
            .min()
            .unwrap_or(self.doc.version());
        self.doc
            .compact(min_acked)
            .map_err(|e| SyncError::RoomFailed(format!("compaction failed: {}", e)))?;
        Ok(())
    }

    fn broadcast(&mut self, except: Option<&str>, msg: &SendMessage) {
        for failed in presence::fan_out(&self.participants, except, msg) {
            self.connection_failed(&failed);
        }
    }

    fn deliver(&mut self, participant_id: &str, messages: Vec<SendMessage>) {
        for msg in messages {
            let Some(session) = self.participants.get(participant_id) else {
                return;
            };
            match session.send(&msg) {
                Ok(()) => {}
                Err(SendFailure::Detached) => return,
                Err(SendFailure::Overflow) | Err(SendFailure::Closed) => {
                    self.connection_failed(participant_id);
                    return;
                }
            }
        }
    }

    fn connection_failed(&mut self, participant_id: &str) {
        warn!(doc_id = %self.doc_id(), participant_id, "Outbound queue full or closed, dropping connection");
        self.on_disconnected(participant_id, None);
    }

    fn arm_linger(&mut self) {
        self.cancel_linger();
        let epoch = self.linger_epoch;
        let linger = self.config.linger;
        let tx = self.tx.clone();
        self.linger_timer = Some(tokio::spawn(async move {
            sleep(linger).await;
            let _ = tx.send(RoomCommand::LingerExpired { epoch });
        }));
    }

    fn cancel_linger(&mut self) {
        self.linger_epoch += 1;
        self.closing = false;
        if let Some(timer) = self.linger_timer.take() {
            timer.abort();
        }
    }

    fn has_unsaved_changes(&self) -> bool {
        self.config.on_save_document.is_some() && self.doc.version() > self.checkpoint.saved_version
    }

    fn try_close(&mut self) -> Flow {
        if !self.participants.is_empty() {
            self.closing = false;
            return Flow::Continue;
        }
        self.closing = true;
        if self.checkpoint.in_flight {
            return Flow::Continue;
        }
        if self.has_unsaved_changes() {
            self.start_checkpoint(true);
            return Flow::Continue;
        }
        info!(doc_id = %self.doc_id(), version = self.doc.version(), "Room empty, closing");
        Flow::Stop
    }

    fn shutdown(&mut self) {
        self.cancel_linger();
        for (_, mut session) in self.participants.drain() {
            session.close();
        }
    }

    fn stats(&self) -> RoomStats {
        let active = self.participants.values().filter(|s| s.is_active()).count();
        RoomStats {
            room_id: self.room_id,
            doc_id: self.doc.id().to_string(),
            version: self.doc.version(),
            base_version: self.doc.base_version(),
            history_len: self.doc.history_len(),
            saved_version: self.checkpoint.saved_version,
            active,
            disconnected: self.participants.len() - active,
        }
    }

    fn schedule_checkpoint(&mut self) {
        if self.config.on_save_document.is_none() || self.checkpoint.in_flight || self.checkpoint.next_at.is_some() {
            return;
        }
        self.checkpoint.next_at = Some(Instant::now() + self.config.save_interval);
    }

    /// Save the current snapshot off the serial path. The final checkpoint retries under `save_retry`.
    fn start_checkpoint(&mut self, final_attempt: bool) {
        self.checkpoint.next_at = None;
        let Some(save) = self.config.on_save_document.clone() else {
            return;
        };
        let snapshot = self.doc.snapshot();
        let version = snapshot.version;
        self.checkpoint.in_flight = true;
        self.checkpoint.final_in_flight = final_attempt;

        let policy = self.config.save_retry.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = if final_attempt {
                policy.run("final checkpoint", || save(snapshot.clone())).await
            } else {
                save(snapshot).await
            };
            let _ = tx.send(RoomCommand::CheckpointDone { version, result });
        });
    }

    fn on_checkpoint_done(&mut self, version: u64, result: Result<(), String>) -> Flow {
        let was_final = self.checkpoint.final_in_flight;
        self.checkpoint.in_flight = false;
        self.checkpoint.final_in_flight = false;

        match result {
            Ok(()) => {
                self.checkpoint.saved_version = self.checkpoint.saved_version.max(version);
                self.checkpoint.failures = 0;
                debug!(doc_id = %self.doc_id(), version, "Checkpoint saved");
                if self.closing {
                    return self.try_close();
                }
                if self.has_unsaved_changes() {
                    self.schedule_checkpoint();
                }
            }
            Err(e) => {
                self.checkpoint.failures += 1;
                let err = SyncError::StorageUnavailable(e);
                let delay = self.config.save_retry.delay(self.checkpoint.failures);
                if was_final {
                    error!(doc_id = %self.doc_id(), version, "Final checkpoint failed, keeping room open: {}", err);
                    self.checkpoint.next_at = Some(Instant::now() + delay);
                    if self.participants.is_empty() {
                        self.arm_linger();
                    }
                } else if self.closing {
                    return self.try_close();
                } else {
                    warn!(
                        doc_id = %self.doc_id(),
                        version,
                        failures = self.checkpoint.failures,
                        "Checkpoint failed, retrying in {:?}: {}",
                        delay,
                        err
                    );
                    self.checkpoint.next_at = Some(Instant::now() + delay);
                }
            }
        }
        Flow::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::retry::RetryPolicy;
    use crate::error::ErrorCode;
    use crate::ot::OpKind;
    use crate::services::snapshot_service::MemorySnapshotStore;
    use std::time::Duration;
    use tokio::sync::mpsc::error::TryRecvError;

    fn test_config() -> SyncConfig {
        SyncConfig {
            grace_period: Duration::from_secs(30),
            linger: Duration::from_secs(5),
            history_retention: 500,
            outbound_capacity: 64,
            save_interval: Duration::from_secs(1),
            save_retry: RetryPolicy::new(2, Duration::from_secs(1), Duration::from_secs(4)).without_jitter(),
            load_retry: RetryPolicy::new(2, Duration::from_millis(100), Duration::from_millis(100)).without_jitter(),
            ..SyncConfig::default()
        }
    }

    fn with_store(store: &MemorySnapshotStore) -> SyncConfig {
        SyncConfig {
            on_load_document: Some(store.load_fn()),
            on_save_document: Some(store.save_fn()),
            ..test_config()
        }
    }

    async fn join(
        handle: &RoomHandle,
        uid: &str,
        permission: Permission,
        capacity: usize,
        conn_id: u64,
        rejoin: Option<(String, u64)>,
    ) -> (JoinAccepted, mpsc::Receiver<SendMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        let (participant_id, acked_version) = match rejoin {
            Some((pid, acked)) => (Some(pid), Some(acked)),
            None => (None, None),
        };
        let accepted = handle
            .join(JoinRequest {
                uid: uid.to_string(),
                display_name: uid.to_uppercase(),
                permission,
                participant_id,
                acked_version,
                connection: Connection::new(conn_id, tx),
            })
            .await
            .unwrap();
        (accepted, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<SendMessage>) -> Vec<SendMessage> {
        let mut messages = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            messages.push(msg);
        }
        messages
    }

    fn insert(position: usize, content: &str, authored_version: u64) -> RoomMessage {
        RoomMessage::TextChange(WireOperation {
            kind: OpKind::Insert,
            position,
            content: Some(content.to_string()),
            length: None,
            authored_version,
        })
    }

    fn left_events(messages: &[SendMessage], participant_id: &str) -> usize {
        messages
            .iter()
            .filter(|m| matches!(m, SendMessage::UserLeft(e) if e.participant_id == participant_id))
            .count()
    }

    #[cfg(debug_assertions)]
    #[tokio::test(start_paused = true)]
    async fn diverged_document_fails_the_room() {
        let (tx, _inbox) = mpsc::unbounded_channel();
        let mut doc = DocumentState::new("doc", "abc", 0, 500);
        doc.replace_text("abX");
        let mut room = Room::new(doc, 1, Arc::new(test_config()), tx);

        let (conn_tx, _conn_rx) = mpsc::channel(64);
        let accepted = room
            .join(JoinRequest {
                uid: "ua".to_string(),
                display_name: "UA".to_string(),
                permission: Permission::Edit,
                participant_id: None,
                acked_version: None,
                connection: Connection::new(1, conn_tx),
            })
            .unwrap();

        let result = room.handle(RoomCommand::Message {
            participant_id: accepted.participant_id,
            conn_id: 1,
            message: insert(0, "x", 0),
        });
        assert!(matches!(result, Err(SyncError::RoomFailed(_))));
    }

    #[tokio::test]
    async fn join_sends_joined_then_snapshot_then_presence() {
        let (handle, _task) = spawn("doc".into(), 1, Arc::new(test_config()));
        let (a, mut rx_a) = join(&handle, "ua", Permission::Edit, 64, 1, None).await;
        let (b, mut rx_b) = join(&handle, "ub", Permission::View, 64, 2, None).await;

        let to_b = drain(&mut rx_b);
        assert!(matches!(&to_b[0], SendMessage::Joined(j) if j.participant_id == b.participant_id && j.permission == Permission::View));
        assert!(matches!(&to_b[1], SendMessage::DocumentState(s) if s.version == 0 && s.text.as_deref() == Some("")));
        assert!(matches!(&to_b[2], SendMessage::UserJoined(e) if e.participant_id == a.participant_id));

        let to_a = drain(&mut rx_a);
        assert!(matches!(to_a.last(), Some(SendMessage::UserJoined(e)) if e.participant_id == b.participant_id));
    }

    #[tokio::test]
    async fn text_change_is_broadcast_to_everyone_including_author() {
        let (handle, _task) = spawn("doc".into(), 1, Arc::new(test_config()));
        let (a, mut rx_a) = join(&handle, "ua", Permission::Edit, 64, 1, None).await;
        let (_b, mut rx_b) = join(&handle, "ub", Permission::Edit, 64, 2, None).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        handle.message(&a.participant_id, 1, insert(0, "hi", 0)).unwrap();
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.version, 1);

        for rx in [&mut rx_a, &mut rx_b] {
            let messages = drain(rx);
            assert!(matches!(
                &messages[..],
                [SendMessage::TextChange(e)] if e.version == 1 && e.participant_id == a.participant_id
            ));
        }
        assert_eq!(handle.snapshot().await.unwrap().text, "hi");
    }

    #[tokio::test]
    async fn cursor_updates_go_to_others_only() {
        let (handle, _task) = spawn("doc".into(), 1, Arc::new(test_config()));
        let (a, mut rx_a) = join(&handle, "ua", Permission::Edit, 64, 1, None).await;
        let (_b, mut rx_b) = join(&handle, "ub", Permission::Edit, 64, 2, None).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        handle.message(&a.participant_id, 1, RoomMessage::Cursor(4)).unwrap();
        handle
            .message(&a.participant_id, 1, RoomMessage::Selection(Some(Selection { start: 1, end: 4 })))
            .unwrap();
        handle.stats().await.unwrap();

        assert!(drain(&mut rx_a).is_empty());
        let to_b = drain(&mut rx_b);
        assert!(matches!(&to_b[0], SendMessage::CursorPosition(e) if e.position == 4));
        assert!(matches!(&to_b[1], SendMessage::SelectionChange(e) if e.start == Some(1) && e.end == Some(4)));
    }

    #[tokio::test]
    async fn view_permission_cannot_edit() {
        let (handle, _task) = spawn("doc".into(), 1, Arc::new(test_config()));
        let (viewer, mut rx) = join(&handle, "uv", Permission::View, 64, 1, None).await;
        drain(&mut rx);

        handle.message(&viewer.participant_id, 1, insert(0, "x", 0)).unwrap();
        assert_eq!(handle.stats().await.unwrap().version, 0);
        assert!(matches!(&drain(&mut rx)[..], [SendMessage::Error(e)] if e.code == ErrorCode::AuthorizationDenied));
    }

    #[tokio::test]
    async fn no_permission_is_rejected() {
        let (handle, _task) = spawn("doc".into(), 1, Arc::new(test_config()));
        let (tx, _rx) = mpsc::channel(4);
        let err = handle
            .join(JoinRequest {
                uid: "u".into(),
                display_name: "U".into(),
                permission: Permission::None,
                participant_id: None,
                acked_version: None,
                connection: Connection::new(1, tx),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::AuthorizationDenied);
    }

    #[tokio::test]
    async fn invalid_operation_keeps_session() {
        let (handle, _task) = spawn("doc".into(), 1, Arc::new(test_config()));
        let (a, mut rx) = join(&handle, "ua", Permission::Edit, 64, 1, None).await;
        drain(&mut rx);

        handle.message(&a.participant_id, 1, insert(9, "x", 0)).unwrap();
        handle.message(&a.participant_id, 1, insert(0, "x", 3)).unwrap();
        handle.message(&a.participant_id, 1, insert(0, "ok", 0)).unwrap();
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.version, 1);
        assert_eq!(stats.active, 1);

        let messages = drain(&mut rx);
        assert!(matches!(&messages[0], SendMessage::Error(e) if e.code == ErrorCode::InvalidOperation));
        assert!(matches!(&messages[1], SendMessage::Error(e) if e.code == ErrorCode::InvalidOperation));
        assert!(matches!(&messages[2], SendMessage::TextChange(e) if e.version == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_within_grace_restores_session_without_user_left() {
        let (handle, _task) = spawn("doc".into(), 1, Arc::new(test_config()));
        let (a, mut rx_a) = join(&handle, "ua", Permission::Edit, 64, 1, None).await;
        let (_b, mut rx_b) = join(&handle, "ub", Permission::Edit, 64, 2, None).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        handle.disconnected(&a.participant_id, 1);
        sleep(Duration::from_secs(10)).await;
        assert_eq!(handle.stats().await.unwrap().disconnected, 1);

        let (again, mut rx_a2) = join(&handle, "ua", Permission::Edit, 64, 3, Some((a.participant_id.clone(), 0))).await;
        assert!(again.reattached);
        assert_eq!(again.participant_id, a.participant_id);

        let to_a = drain(&mut rx_a2);
        assert!(matches!(&to_a[0], SendMessage::Joined(_)));
        assert!(matches!(&to_a[1], SendMessage::DocumentState(s) if s.base_version == Some(0)));

        // original grace deadline passes without effect
        sleep(Duration::from_secs(25)).await;
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.active, 2);
        assert_eq!(left_events(&drain(&mut rx_b), &a.participant_id), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn grace_expiry_broadcasts_user_left_once() {
        let (handle, _task) = spawn("doc".into(), 1, Arc::new(test_config()));
        let (a, mut rx_a) = join(&handle, "ua", Permission::Edit, 64, 1, None).await;
        let (_b, mut rx_b) = join(&handle, "ub", Permission::Edit, 64, 2, None).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        handle.disconnected(&a.participant_id, 1);
        sleep(Duration::from_secs(29)).await;
        handle.stats().await.unwrap();
        assert_eq!(left_events(&drain(&mut rx_b), &a.participant_id), 0);

        sleep(Duration::from_secs(2)).await;
        let stats = handle.stats().await.unwrap();
        assert_eq!((stats.active, stats.disconnected), (1, 0));
        assert_eq!(left_events(&drain(&mut rx_b), &a.participant_id), 1);

        let (fresh, _rx) = join(&handle, "ua", Permission::Edit, 64, 3, Some((a.participant_id.clone(), 0))).await;
        assert!(!fresh.reattached);
        assert_ne!(fresh.participant_id, a.participant_id);
    }

    #[tokio::test]
    async fn stale_connection_disconnect_is_ignored() {
        let (handle, _task) = spawn("doc".into(), 1, Arc::new(test_config()));
        let (a, _rx_a) = join(&handle, "ua", Permission::Edit, 64, 1, None).await;
        let (_again, _rx_a2) = join(&handle, "ua", Permission::Edit, 64, 2, Some((a.participant_id.clone(), 0))).await;

        handle.disconnected(&a.participant_id, 1);
        assert_eq!(handle.stats().await.unwrap().active, 1);
    }

    #[tokio::test]
    async fn compacted_history_resyncs_with_snapshot() {
        let config = SyncConfig {
            history_retention: 10,
            outbound_capacity: 1024,
            ..test_config()
        };
        let (handle, _task) = spawn("doc".into(), 1, Arc::new(config));
        let (b, _rx_b) = join(&handle, "ub", Permission::Edit, 1024, 1, None).await;
        handle.disconnected(&b.participant_id, 1);
        let (a, _rx_a) = join(&handle, "ua", Permission::Edit, 1024, 2, None).await;

        for v in 0..110u64 {
            handle.message(&a.participant_id, 2, insert(v as usize, "a", v)).unwrap();
        }
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.version, 110);
        assert_eq!(stats.base_version, 100);

        let (again, mut rx_b2) = join(&handle, "ub", Permission::Edit, 1024, 3, Some((b.participant_id.clone(), 50))).await;
        assert!(again.reattached);
        let messages = drain(&mut rx_b2);
        match &messages[1] {
            SendMessage::DocumentState(state) => {
                assert_eq!(state.version, 110);
                assert_eq!(state.text.as_deref().map(|t| t.chars().count()), Some(110));
                assert!(state.operations.is_none());
            }
            other => panic!("expected document_state, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn lagging_participant_holds_back_compaction() {
        let config = SyncConfig {
            history_retention: 2,
            ..test_config()
        };
        let (handle, _task) = spawn("doc".into(), 1, Arc::new(config));
        let (a, _rx_a) = join(&handle, "ua", Permission::Edit, 64, 1, None).await;
        let (lagging, _rx_l) = join(&handle, "ul", Permission::Edit, 64, 2, None).await;

        for v in 0..6u64 {
            handle.message(&a.participant_id, 1, insert(0, "a", v)).unwrap();
        }
        assert_eq!(handle.stats().await.unwrap().base_version, 0);

        handle.message(&lagging.participant_id, 2, RoomMessage::Ack(3)).unwrap();
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.base_version, 3);
        assert_eq!(stats.history_len, 3);
    }

    #[tokio::test]
    async fn resync_request_is_idempotent() {
        let (handle, _task) = spawn("doc".into(), 1, Arc::new(test_config()));
        let (a, mut rx) = join(&handle, "ua", Permission::Edit, 64, 1, None).await;
        for v in 0..3u64 {
            handle.message(&a.participant_id, 1, insert(0, "z", v)).unwrap();
        }
        handle.stats().await.unwrap();
        drain(&mut rx);

        handle.message(&a.participant_id, 1, RoomMessage::Resync(1)).unwrap();
        handle.message(&a.participant_id, 1, RoomMessage::Resync(1)).unwrap();
        handle.stats().await.unwrap();
        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], messages[1]);
        assert!(matches!(&messages[0], SendMessage::DocumentState(s) if s.operations.as_ref().map(Vec::len) == Some(2)));
    }

    #[tokio::test]
    async fn slow_consumer_is_disconnected_not_backpressured() {
        let (handle, _task) = spawn("doc".into(), 1, Arc::new(SyncConfig { outbound_capacity: 4, ..test_config() }));
        let (a, mut rx_a) = join(&handle, "ua", Permission::Edit, 4, 1, None).await;
        let (b, mut rx_b) = join(&handle, "ub", Permission::Edit, 4, 2, None).await;
        drain(&mut rx_b);

        for position in 0..3 {
            handle.message(&b.participant_id, 2, RoomMessage::Cursor(position)).unwrap();
        }
        let stats = handle.stats().await.unwrap();
        assert_eq!((stats.active, stats.disconnected), (1, 1));
        assert_eq!(left_events(&drain(&mut rx_b), &a.participant_id), 0);

        assert_eq!(drain(&mut rx_a).len(), 4);
        assert!(matches!(rx_a.try_recv(), Err(TryRecvError::Disconnected)));
    }

    #[tokio::test]
    async fn leave_removes_immediately() {
        let (handle, _task) = spawn("doc".into(), 1, Arc::new(test_config()));
        let (a, _rx_a) = join(&handle, "ua", Permission::Edit, 64, 1, None).await;
        let (_b, mut rx_b) = join(&handle, "ub", Permission::Edit, 64, 2, None).await;
        drain(&mut rx_b);

        handle.message(&a.participant_id, 1, RoomMessage::Leave).unwrap();
        assert_eq!(handle.stats().await.unwrap().active, 1);
        assert_eq!(left_events(&drain(&mut rx_b), &a.participant_id), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_room_checkpoints_then_closes() {
        let store = MemorySnapshotStore::new();
        let (handle, task) = spawn("doc".into(), 1, Arc::new(with_store(&store)));
        let (a, _rx) = join(&handle, "ua", Permission::Edit, 64, 1, None).await;
        handle.message(&a.participant_id, 1, insert(0, "saved", 0)).unwrap();
        handle.message(&a.participant_id, 1, RoomMessage::Leave).unwrap();

        sleep(Duration::from_secs(6)).await;
        assert!(task.await.unwrap().is_ok());
        assert_eq!(store.saved("doc").map(|s| (s.text, s.version)), Some(("saved".to_string(), 1)));
        assert_eq!(handle.stats().await.unwrap_err(), SyncError::RoomClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn rejoin_during_linger_keeps_room() {
        let (handle, _task) = spawn("doc".into(), 1, Arc::new(test_config()));
        let (a, _rx) = join(&handle, "ua", Permission::Edit, 64, 1, None).await;
        handle.message(&a.participant_id, 1, RoomMessage::Leave).unwrap();

        sleep(Duration::from_secs(3)).await;
        let (_b, _rx_b) = join(&handle, "ub", Permission::Edit, 64, 2, None).await;
        sleep(Duration::from_secs(10)).await;
        assert_eq!(handle.stats().await.unwrap().active, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn storage_outage_does_not_block_edits() {
        let store = MemorySnapshotStore::new();
        let (handle, task) = spawn("doc".into(), 1, Arc::new(with_store(&store)));
        let (a, _rx) = join(&handle, "ua", Permission::Edit, 64, 1, None).await;
        store.set_failing(true);

        handle.message(&a.participant_id, 1, insert(0, "a", 0)).unwrap();
        sleep(Duration::from_secs(5)).await;
        handle.message(&a.participant_id, 1, insert(1, "b", 1)).unwrap();
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.version, 2);
        assert_eq!(stats.saved_version, 0);
        assert!(store.save_attempts() >= 2);

        // final checkpoint fails too, the room must stay up
        handle.message(&a.participant_id, 1, RoomMessage::Leave).unwrap();
        sleep(Duration::from_secs(20)).await;
        assert!(handle.stats().await.is_ok());
        assert!(store.saved("doc").is_none());

        store.set_failing(false);
        sleep(Duration::from_secs(60)).await;
        assert!(task.await.unwrap().is_ok());
        assert_eq!(store.saved("doc").map(|s| s.version), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn load_failure_rejects_queued_joins() {
        let store = MemorySnapshotStore::new();
        store.set_failing(true);
        let (handle, task) = spawn("doc".into(), 1, Arc::new(with_store(&store)));
        let (tx, _rx) = mpsc::channel(4);
        let err = handle
            .join(JoinRequest {
                uid: "u".into(),
                display_name: "U".into(),
                permission: Permission::Edit,
                participant_id: None,
                acked_version: None,
                connection: Connection::new(1, tx),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::StorageUnavailable);
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn loads_persisted_snapshot() {
        let store = MemorySnapshotStore::new();
        store.insert(DocSnapshot {
            doc_id: "doc".into(),
            text: "hello".into(),
            version: 5,
        });
        let (handle, _task) = spawn("doc".into(), 1, Arc::new(with_store(&store)));
        let (_a, mut rx) = join(&handle, "ua", Permission::Edit, 64, 1, None).await;
        let messages = drain(&mut rx);
        assert!(matches!(&messages[1], SendMessage::DocumentState(s) if s.version == 5 && s.text.as_deref() == Some("hello")));
    }
}
