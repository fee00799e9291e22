//! Wire framing for the bidirectional collaboration channel.
//!
//! Every frame is one JSON object `{event, payload, requestId?}`. Inbound
//! frames are parsed in two steps (envelope, then per-event payload) so a
//! malformed payload can be answered with a typed error instead of a dropped
//! connection. Outbound frames are built once and fanned out as-is.

use axum::extract::ws::Message;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

use crate::ot;
use crate::store::{
    CursorRecord, DocumentRecord, OpKind, OperationRecord, ParticipantRecord, PresenceStatus,
    Role, RoomRecord, RoomStatus, StoreError,
};

/// Machine-readable error codes surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Unauthorized,
    InvalidToken,
    AccessDenied,
    InsufficientPermissions,
    InvalidOperation,
    MissingField,
    SyncRequired,
    RoomFull,
    RateLimited,
    NotFound,
    InternalError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl ErrorCode {
    /// HTTP status used when the same code travels over the admin surface.
    pub fn http_status(self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            ErrorCode::Unauthorized | ErrorCode::InvalidToken => StatusCode::UNAUTHORIZED,
            ErrorCode::AccessDenied | ErrorCode::InsufficientPermissions => StatusCode::FORBIDDEN,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::RoomFull | ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::InvalidOperation | ErrorCode::MissingField => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ErrorCode::SyncRequired => StatusCode::CONFLICT,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// A typed protocol failure: code, human-readable message, optional backoff.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct ProtocolError {
    pub code: ErrorCode,
    pub message: String,
    pub retry_after_secs: Option<u64>,
}

impl ProtocolError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_after_secs: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after_secs: u64) -> Self {
        Self {
            code: ErrorCode::RateLimited,
            message: message.into(),
            retry_after_secs: Some(retry_after_secs),
        }
    }
}

impl From<StoreError> for ProtocolError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => {
                Self::new(ErrorCode::NotFound, format!("{what} not found"))
            }
            StoreError::InvalidToken => Self::new(ErrorCode::InvalidToken, "invalid token"),
            StoreError::Conflict(msg) => Self::new(ErrorCode::InvalidOperation, msg),
            StoreError::Io(_) | StoreError::Encoding(_) => {
                // Detail stays in the logs; clients get an opaque code.
                Self::new(ErrorCode::InternalError, "internal error")
            }
        }
    }
}

/// Inbound frame envelope; the payload is parsed per event.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inbound {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    pub request_id: Option<String>,
}

impl Inbound {
    /// Parse the payload for the event, mapping serde errors to
    /// `MissingField`/`InvalidOperation`.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            let msg = e.to_string();
            let code = if msg.contains("missing field") {
                ErrorCode::MissingField
            } else {
                ErrorCode::InvalidOperation
            };
            ProtocolError::new(code, format!("invalid {} payload: {msg}", self.event))
        })
    }
}

/// One run of a wire change, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WireOp {
    Insert { text: String },
    Delete { count: u64 },
    Retain { count: u64 },
}

impl WireOp {
    /// Convert a wire batch into a normalized OT change.
    pub fn to_change(ops: &[WireOp]) -> ot::Change {
        let mut change = ot::Change::new();
        for op in ops {
            match op {
                WireOp::Insert { text } => change.insert(text),
                WireOp::Delete { count } => change.delete(*count as usize),
                WireOp::Retain { count } => change.retain(*count as usize),
            };
        }
        change
    }
}

// ---- inbound payloads ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomPayload {
    pub room_id: Uuid,
    pub token: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenDocumentPayload {
    pub document_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentOperationPayload {
    pub document_id: Uuid,
    pub base_version: u64,
    pub client_id: Uuid,
    pub client_sequence_start: u64,
    pub ops: Vec<WireOp>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorUpdatePayload {
    pub document_id: Uuid,
    pub line: u32,
    pub column: u32,
    #[serde(default)]
    pub selection_start: Option<u32>,
    #[serde(default)]
    pub selection_end: Option<u32>,
}

// ---- outbound payloads ----

/// Room fields exposed on the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub id: Uuid,
    pub name: String,
    pub status: RoomStatus,
    pub owner: String,
    pub max_participants: u32,
}

impl From<&RoomRecord> for RoomInfo {
    fn from(room: &RoomRecord) -> Self {
        Self {
            id: room.id,
            name: room.name.clone(),
            status: room.status,
            owner: room.owner.clone(),
            max_participants: room.max_participants,
        }
    }
}

/// Participant fields exposed on the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub id: Uuid,
    pub user_id: String,
    pub role: Role,
    pub display_name: String,
    pub color: String,
    pub presence_status: PresenceStatus,
}

impl From<&ParticipantRecord> for ParticipantInfo {
    fn from(p: &ParticipantRecord) -> Self {
        Self {
            id: p.id,
            user_id: p.user_id.clone(),
            role: p.role,
            display_name: p.display_name.clone(),
            color: p.color.clone(),
            presence_status: p.presence_status,
        }
    }
}

/// Document fields included in the join snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSummary {
    pub id: Uuid,
    pub file_path: String,
    pub version: u64,
}

impl From<&DocumentRecord> for DocumentSummary {
    fn from(doc: &DocumentRecord) -> Self {
        Self {
            id: doc.id,
            file_path: doc.file_path.clone(),
            version: doc.version,
        }
    }
}

/// Last-known cursor of a peer, included in the join snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorInfo {
    pub participant_id: Uuid,
    pub document_id: Uuid,
    pub line: u32,
    pub column: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection_start: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection_end: Option<u32>,
}

impl From<&CursorRecord> for CursorInfo {
    fn from(c: &CursorRecord) -> Self {
        Self {
            participant_id: c.participant_id,
            document_id: c.document_id,
            line: c.line,
            column: c.column,
            selection_start: c.selection_start,
            selection_end: c.selection_end,
        }
    }
}

/// State handed to a member right after joining.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub participants: Vec<ParticipantInfo>,
    pub documents: Vec<DocumentSummary>,
    pub cursors: Vec<CursorInfo>,
}

/// One applied run in an `operations-applied` broadcast.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedOp {
    #[serde(flatten)]
    pub op: WireOp,
    pub position: u64,
}

/// One persisted run in an `operations-confirmed` ack.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmedOp {
    pub server_sequence: u64,
    pub client_sequence: u64,
    #[serde(flatten)]
    pub op: WireOp,
    pub position: u64,
}

fn record_wire_op(record: &OperationRecord) -> WireOp {
    match record.kind {
        OpKind::Insert => WireOp::Insert {
            text: record.content.clone().unwrap_or_default(),
        },
        OpKind::Delete => WireOp::Delete {
            count: record.length.unwrap_or_default(),
        },
        OpKind::Retain => WireOp::Retain {
            count: record.length.unwrap_or_default(),
        },
    }
}

impl From<&OperationRecord> for AppliedOp {
    fn from(record: &OperationRecord) -> Self {
        Self {
            op: record_wire_op(record),
            position: record.position,
        }
    }
}

impl From<&OperationRecord> for ConfirmedOp {
    fn from(record: &OperationRecord) -> Self {
        Self {
            server_sequence: record.server_sequence,
            client_sequence: record.client_sequence,
            op: record_wire_op(record),
            position: record.position,
        }
    }
}

/// A frame sent from the server to a client.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "event", content = "payload")]
pub enum ServerEvent {
    #[serde(rename = "joined-room")]
    JoinedRoom {
        #[serde(rename = "participantId")]
        participant_id: Uuid,
        room: RoomInfo,
        snapshot: RoomSnapshot,
    },
    #[serde(rename = "left-room")]
    LeftRoom {},
    #[serde(rename = "document-state")]
    DocumentState {
        #[serde(rename = "documentId")]
        document_id: Uuid,
        content: String,
        version: u64,
    },
    #[serde(rename = "participant-joined")]
    ParticipantJoined { participant: ParticipantInfo },
    #[serde(rename = "participant-left")]
    ParticipantLeft {
        #[serde(rename = "participantId")]
        participant_id: Uuid,
    },
    #[serde(rename = "operations-applied")]
    OperationsApplied {
        #[serde(rename = "documentId")]
        document_id: Uuid,
        #[serde(rename = "participantId")]
        participant_id: Uuid,
        ops: Vec<AppliedOp>,
        #[serde(rename = "serverSequences")]
        server_sequences: Vec<u64>,
    },
    #[serde(rename = "operations-confirmed")]
    OperationsConfirmed {
        #[serde(rename = "documentId")]
        document_id: Uuid,
        ops: Vec<ConfirmedOp>,
        #[serde(rename = "newVersion")]
        new_version: u64,
    },
    #[serde(rename = "cursor-updated")]
    CursorUpdated {
        #[serde(rename = "documentId")]
        document_id: Uuid,
        #[serde(rename = "participantId")]
        participant_id: Uuid,
        line: u32,
        column: u32,
        #[serde(rename = "selectionStart", skip_serializing_if = "Option::is_none")]
        selection_start: Option<u32>,
        #[serde(rename = "selectionEnd", skip_serializing_if = "Option::is_none")]
        selection_end: Option<u32>,
    },
    #[serde(rename = "presence-update")]
    PresenceUpdate {
        #[serde(rename = "participantId")]
        participant_id: Uuid,
        status: PresenceStatus,
        #[serde(rename = "currentDocumentId", skip_serializing_if = "Option::is_none")]
        current_document_id: Option<Uuid>,
        #[serde(rename = "activityType")]
        activity_type: String,
    },
    #[serde(rename = "pong")]
    Pong {},
    #[serde(rename = "error")]
    Error {
        code: ErrorCode,
        message: String,
        #[serde(rename = "retryAfterSecs", skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
    },
}

impl ServerEvent {
    pub fn error(err: &ProtocolError) -> Self {
        ServerEvent::Error {
            code: err.code,
            message: err.message.clone(),
            retry_after_secs: err.retry_after_secs,
        }
    }

    /// Serialize into a WebSocket frame, attaching the request id when the
    /// frame answers a request.
    pub fn frame(&self, request_id: Option<&str>) -> Message {
        let mut value = serde_json::to_value(self).expect("failed serialize");
        if let (Some(id), Some(obj)) = (request_id, value.as_object_mut()) {
            obj.insert("requestId".into(), json!(id));
        }
        Message::text(value.to_string())
    }
}
