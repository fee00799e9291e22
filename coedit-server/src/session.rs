//! Per-connection state machine and message dispatch.
//!
//! Each WebSocket gets one inbound task (this module) and one writer task
//! draining the connection's bounded outbound queue. A connection starts
//! unauthenticated, must complete `join-room` within the configured
//! deadline, and then dispatches room traffic until it leaves, errors out,
//! or is killed (queue overflow, replacement login, room teardown). Frames
//! produced anywhere (here, the document engine, the hub) all travel
//! through the same outbound queue, which is what keeps per-document
//! ordering intact on the wire.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::{SinkExt, StreamExt, stream::SplitStream};
use tokio::sync::{Notify, mpsc};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::{Fanout, SubmitRequest};
use crate::hub::{Admission, Hub, RoomState};
use crate::limit::{ConnectionLimits, RateLimitConfig};
use crate::presence::{ACTIVITY_EDITING, ACTIVITY_VIEWING, record_cursor, record_presence};
use crate::proto::{
    CursorUpdatePayload, DocumentOperationPayload, ErrorCode, Inbound, JoinRoomPayload,
    OpenDocumentPayload, ProtocolError, ServerEvent,
};
use crate::store::{CursorRecord, ParticipantRecord, Store};

/// Connection-level tunables.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// How long an unauthenticated connection may take to join a room.
    pub join_timeout: Duration,
    pub rate: RateLimitConfig,
    /// Protocol violations tolerated before the connection is closed.
    pub max_strikes: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(10),
            rate: RateLimitConfig::default(),
            max_strikes: 10,
        }
    }
}

enum Phase {
    Init,
    Joined {
        room: Arc<RoomState>,
        participant: ParticipantRecord,
    },
    Closed,
}

/// Routes engine output: the ack to this connection's own queue, the
/// broadcast to the rest of the room.
struct RoomFanout {
    room: Arc<RoomState>,
    author_tx: mpsc::Sender<Message>,
    author_kill: Arc<Notify>,
}

impl Fanout for RoomFanout {
    fn ack(&self, frame: Message) {
        match self.author_tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("author outbound queue overflow, dropping connection");
                self.author_kill.notify_waiters();
            }
            // The author disconnected mid-submit; the ack is discarded.
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn broadcast(&self, author: Uuid, frame: Message) {
        self.room.send_to_all_except(Some(author), &frame);
    }
}

struct Connection {
    connection_id: u64,
    hub: Arc<Hub>,
    store: Arc<dyn Store>,
    config: SessionConfig,
    tx: mpsc::Sender<Message>,
    kill: Arc<Notify>,
    limits: ConnectionLimits,
    phase: Phase,
    strikes: u32,
}

/// Drive one WebSocket connection to completion.
pub async fn handle_socket(
    socket: WebSocket,
    hub: Arc<Hub>,
    store: Arc<dyn Store>,
    config: SessionConfig,
) {
    let connection_id = hub.next_connection_id();
    let (mut sink, stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(hub.config().outbound_capacity);
    let kill = Arc::new(Notify::new());

    // Writer task: the only place that touches the sink. Ends when every
    // sender is gone and the queue has drained.
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut conn = Connection {
        connection_id,
        hub,
        store,
        config,
        tx,
        kill,
        limits: ConnectionLimits::new(&config.rate),
        phase: Phase::Init,
        strikes: 0,
    };
    debug!(connection_id, "connection opened");
    conn.run(stream).await;

    if let Phase::Joined { room, participant } = &conn.phase {
        conn.hub.leave(room, participant, conn.connection_id).await;
    }
    drop(conn);
    let _ = writer.await;
    debug!(connection_id, "connection closed");
}

impl Connection {
    async fn run(&mut self, mut stream: SplitStream<WebSocket>) {
        let join_deadline = Instant::now() + self.config.join_timeout;
        loop {
            let next = match &self.phase {
                Phase::Init => match timeout_at(join_deadline, stream.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        info!(connection_id = self.connection_id, "join deadline expired");
                        self.send_error(
                            None,
                            &ProtocolError::new(ErrorCode::Unauthorized, "join-room timed out"),
                        );
                        return;
                    }
                },
                Phase::Joined { .. } => tokio::select! {
                    next = stream.next() => next,
                    _ = self.kill.notified() => {
                        info!(connection_id = self.connection_id, "connection killed");
                        return;
                    }
                },
                Phase::Closed => return,
            };
            let text = match next {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) | None => return,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!(connection_id = self.connection_id, "socket error: {e}");
                    return;
                }
            };
            let inbound: Inbound = match serde_json::from_str(&text) {
                Ok(inbound) => inbound,
                Err(e) => {
                    self.strike(
                        None,
                        &ProtocolError::new(
                            ErrorCode::InvalidOperation,
                            format!("malformed frame: {e}"),
                        ),
                    );
                    continue;
                }
            };
            self.dispatch(inbound).await;
            if self.strikes >= self.config.max_strikes {
                info!(connection_id = self.connection_id, "too many protocol errors");
                return;
            }
        }
    }

    async fn dispatch(&mut self, inbound: Inbound) {
        #[derive(Clone, Copy, PartialEq)]
        enum PhaseKind {
            Init,
            Joined,
            Closed,
        }
        let kind = match &self.phase {
            Phase::Init => PhaseKind::Init,
            Phase::Joined { .. } => PhaseKind::Joined,
            Phase::Closed => PhaseKind::Closed,
        };
        let request_id = inbound.request_id.clone();
        let result = match (kind, inbound.event.as_str()) {
            (PhaseKind::Init, "join-room") => self.handle_join(&inbound).await,
            (PhaseKind::Init, _) => Err(ProtocolError::new(
                ErrorCode::Unauthorized,
                "join a room before sending other events",
            )),
            (PhaseKind::Joined, "document-operation") => self.handle_operation(&inbound).await,
            (PhaseKind::Joined, "cursor-update") => self.handle_cursor(&inbound).await,
            (PhaseKind::Joined, "open-document") => self.handle_open(&inbound).await,
            (PhaseKind::Joined, "leave-room") => self.handle_leave(&inbound).await,
            (PhaseKind::Joined, "ping") => {
                self.send(ServerEvent::Pong {}.frame(request_id.as_deref()));
                Ok(())
            }
            (PhaseKind::Joined, "join-room") => Err(ProtocolError::new(
                ErrorCode::InvalidOperation,
                "already joined a room",
            )),
            (PhaseKind::Closed, _) => return,
            (_, other) => Err(ProtocolError::new(
                ErrorCode::InvalidOperation,
                format!("unknown event {other:?}"),
            )),
        };
        if let Err(err) = result {
            match err.code {
                // Authentication and admission failures end the connection.
                ErrorCode::Unauthorized | ErrorCode::InvalidToken => {
                    self.send_error(request_id.as_deref(), &err);
                    self.phase = Phase::Closed;
                }
                ErrorCode::AccessDenied | ErrorCode::RoomFull
                    if matches!(self.phase, Phase::Init) =>
                {
                    self.send_error(request_id.as_deref(), &err);
                    self.phase = Phase::Closed;
                }
                ErrorCode::InvalidOperation | ErrorCode::MissingField => {
                    self.strike(request_id.as_deref(), &err);
                }
                _ => self.send_error(request_id.as_deref(), &err),
            }
        }
    }

    async fn handle_join(&mut self, inbound: &Inbound) -> Result<(), ProtocolError> {
        if !self.limits.joins.try_consume() {
            return Err(ProtocolError::rate_limited(
                "too many join attempts",
                self.limits.joins.retry_after_secs(),
            ));
        }
        let payload: JoinRoomPayload = inbound.parse()?;
        let user = self.store.get_user_from_token(&payload.token).await?;
        let Admission {
            room,
            participant,
            info,
            snapshot,
        } = self
            .hub
            .join(
                payload.room_id,
                &user,
                payload.display_name,
                self.connection_id,
                self.tx.clone(),
                self.kill.clone(),
            )
            .await?;

        self.send(
            ServerEvent::JoinedRoom {
                participant_id: participant.id,
                room: info,
                snapshot,
            }
            .frame(inbound.request_id.as_deref()),
        );
        info!(
            connection_id = self.connection_id,
            room_id = %payload.room_id,
            user_id = %user.id,
            "session joined"
        );
        self.phase = Phase::Joined { room, participant };
        Ok(())
    }

    async fn handle_operation(&mut self, inbound: &Inbound) -> Result<(), ProtocolError> {
        let Phase::Joined { room, participant } = &self.phase else {
            return Ok(());
        };
        if !self.limits.operations.try_consume() {
            return Err(ProtocolError::rate_limited(
                "operation rate exceeded, back off",
                self.limits.operations.retry_after_secs(),
            ));
        }
        let payload: DocumentOperationPayload = inbound.parse()?;
        if !participant.role.can_edit() {
            return Err(ProtocolError::new(
                ErrorCode::InsufficientPermissions,
                "viewers cannot edit documents",
            ));
        }
        let engine = room.engine(payload.document_id).await?;
        let fanout = RoomFanout {
            room: room.clone(),
            author_tx: self.tx.clone(),
            author_kill: self.kill.clone(),
        };
        engine
            .submit(
                SubmitRequest {
                    participant_id: participant.id,
                    role: participant.role,
                    client_id: payload.client_id,
                    client_sequence_start: payload.client_sequence_start,
                    base_version: payload.base_version,
                    ops: payload.ops,
                    request_id: inbound.request_id.clone(),
                },
                &fanout,
            )
            .await?;

        room.touch(participant.id);
        record_presence(
            &self.store,
            participant.id,
            room.room_id,
            crate::store::PresenceStatus::Online,
            Some(payload.document_id),
            ACTIVITY_EDITING,
        )
        .await;
        Ok(())
    }

    async fn handle_cursor(&mut self, inbound: &Inbound) -> Result<(), ProtocolError> {
        let Phase::Joined { room, participant } = &self.phase else {
            return Ok(());
        };
        // Cursors are best-effort: excess updates are dropped, not errored.
        if !self.limits.cursor_updates.try_consume() {
            return Ok(());
        }
        let payload: CursorUpdatePayload = inbound.parse()?;
        let doc = self.store.get_document(payload.document_id).await?;
        if doc.room_id != room.room_id {
            return Err(ProtocolError::new(
                ErrorCode::NotFound,
                "document not found",
            ));
        }

        record_cursor(
            &self.store,
            CursorRecord {
                participant_id: participant.id,
                document_id: payload.document_id,
                line: payload.line,
                column: payload.column,
                selection_start: payload.selection_start,
                selection_end: payload.selection_end,
                updated_at: Utc::now(),
            },
        )
        .await;
        room.send_to_all_except(
            Some(participant.id),
            &ServerEvent::CursorUpdated {
                document_id: payload.document_id,
                participant_id: participant.id,
                line: payload.line,
                column: payload.column,
                selection_start: payload.selection_start,
                selection_end: payload.selection_end,
            }
            .frame(None),
        );
        room.touch(participant.id);
        record_presence(
            &self.store,
            participant.id,
            room.room_id,
            crate::store::PresenceStatus::Online,
            Some(payload.document_id),
            ACTIVITY_VIEWING,
        )
        .await;
        Ok(())
    }

    async fn handle_open(&mut self, inbound: &Inbound) -> Result<(), ProtocolError> {
        let Phase::Joined { room, participant } = &self.phase else {
            return Ok(());
        };
        let payload: OpenDocumentPayload = inbound.parse()?;
        let engine = room.engine(payload.document_id).await?;
        let (content, version) = engine.snapshot().await?;
        self.send(
            ServerEvent::DocumentState {
                document_id: payload.document_id,
                content,
                version,
            }
            .frame(inbound.request_id.as_deref()),
        );
        room.touch(participant.id);
        record_presence(
            &self.store,
            participant.id,
            room.room_id,
            crate::store::PresenceStatus::Online,
            Some(payload.document_id),
            ACTIVITY_VIEWING,
        )
        .await;
        Ok(())
    }

    async fn handle_leave(&mut self, inbound: &Inbound) -> Result<(), ProtocolError> {
        if let Phase::Joined { room, participant } = &self.phase {
            self.hub.leave(room, participant, self.connection_id).await;
        }
        self.send(ServerEvent::LeftRoom {}.frame(inbound.request_id.as_deref()));
        self.phase = Phase::Closed;
        Ok(())
    }

    fn send(&self, frame: Message) {
        match self.tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    connection_id = self.connection_id,
                    "outbound queue overflow, dropping connection"
                );
                self.kill.notify_waiters();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn send_error(&self, request_id: Option<&str>, err: &ProtocolError) {
        debug!(connection_id = self.connection_id, code = %err.code, "{}", err.message);
        self.send(ServerEvent::error(err).frame(request_id));
    }

    fn strike(&mut self, request_id: Option<&str>, err: &ProtocolError) {
        self.strikes += 1;
        self.send_error(request_id, err);
    }
}
