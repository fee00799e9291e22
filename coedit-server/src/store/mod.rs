//! Durable-state contract for rooms, documents, operations and presence.
//!
//! The collaboration core only ever talks to a [`Store`]; swapping the
//! bundled in-memory implementation for a SQL or remote backend is a matter
//! of implementing this trait. Server-sequence allocation is serialized per
//! document by the caller (the document engine holds the per-document lock
//! across [`Store::append_operations`]).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod memory;

pub use memory::MemoryStore;

/// Identity resolved from a bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Stable user id from the identity backend.
    pub id: String,
    /// Human-readable name.
    pub name: String,
}

/// Lifecycle state of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    Active,
    Inactive,
    Archived,
}

/// A named collaboration room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRecord {
    pub id: Uuid,
    pub name: String,
    pub status: RoomStatus,
    /// User id of the room owner.
    pub owner: String,
    pub max_participants: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Access level of a participant within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Editor,
    Viewer,
}

impl Role {
    /// Whether this role may author document operations.
    pub fn can_edit(self) -> bool {
        matches!(self, Role::Owner | Role::Editor)
    }

    /// Whether this role may change or delete the room itself.
    pub fn can_manage(self) -> bool {
        self == Role::Owner
    }
}

/// Presence state of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

/// Membership of a user in a room, unique on `(room_id, user_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantRecord {
    pub id: Uuid,
    pub room_id: Uuid,
    pub user_id: String,
    pub role: Role,
    pub display_name: String,
    /// Cursor/decoration color, assigned from a fixed palette on creation.
    pub color: String,
    pub presence_status: PresenceStatus,
    pub last_seen: DateTime<Utc>,
}

/// A shared text document, unique on `(room_id, file_path)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRecord {
    pub id: Uuid,
    pub room_id: Uuid,
    pub file_path: String,
    pub content: String,
    /// Count of persisted operations; equals the highest server sequence.
    pub version: u64,
    pub size_bytes: u64,
    pub line_count: u64,
    pub last_operation_ts: Option<DateTime<Utc>>,
}

impl DocumentRecord {
    /// Build a fresh document around `content`, computing the derived fields.
    pub fn create(room_id: Uuid, file_path: String, content: String) -> Self {
        let size_bytes = content.len() as u64;
        let line_count = line_count_of(&content);
        Self {
            id: Uuid::new_v4(),
            room_id,
            file_path,
            content,
            version: 0,
            size_bytes,
            line_count,
            last_operation_ts: None,
        }
    }
}

/// Kind of a persisted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Insert,
    Delete,
    Retain,
}

/// One applied edit in a document's append-only history.
///
/// A submitted batch persists as one or more records (transformation can
/// split a run around a concurrent insert). Every record of a batch carries
/// the batch's `client_sequence` start, so the idempotency key
/// `(client_id, client_sequence)` identifies the batch and never consumes
/// sequence numbers the client will use for its next batch;
/// `batch_offset` orders the records within it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    pub id: Uuid,
    pub document_id: Uuid,
    pub participant_id: Uuid,
    pub kind: OpKind,
    /// Character offset in the document at the moment this record applies.
    pub position: u64,
    pub length: Option<u64>,
    pub content: Option<String>,
    pub client_id: Uuid,
    /// `clientSequenceStart` of the batch this record belongs to.
    pub client_sequence: u64,
    /// Position of this record within its batch.
    pub batch_offset: u64,
    pub server_sequence: u64,
    pub timestamp: DateTime<Utc>,
}

/// An operation about to be appended; the store assigns id, server
/// sequence and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    pub participant_id: Uuid,
    pub kind: OpKind,
    pub position: u64,
    pub length: Option<u64>,
    pub content: Option<String>,
    pub client_id: Uuid,
    pub client_sequence: u64,
    pub batch_offset: u64,
}

/// Last-known cursor of a participant in a document. Upsert-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorRecord {
    pub participant_id: Uuid,
    pub document_id: Uuid,
    pub line: u32,
    pub column: u32,
    pub selection_start: Option<u32>,
    pub selection_end: Option<u32>,
    pub updated_at: DateTime<Utc>,
}

/// Presence row of a participant in a room. Upsert-only, best-effort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub participant_id: Uuid,
    pub room_id: Uuid,
    pub status: PresenceStatus,
    pub current_document_id: Option<Uuid>,
    pub activity_type: String,
    pub last_activity: DateTime<Utc>,
}

/// Errors surfaced by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("invalid or expired token")]
    InvalidToken,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Abstraction over the durable backend.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Resolve a bearer token to a user, or `InvalidToken`.
    async fn get_user_from_token(&self, token: &str) -> Result<UserRecord, StoreError>;

    async fn create_room(&self, room: RoomRecord) -> Result<RoomRecord, StoreError>;
    async fn get_room(&self, id: Uuid) -> Result<RoomRecord, StoreError>;
    async fn list_rooms(&self) -> Result<Vec<RoomRecord>, StoreError>;
    async fn update_room(&self, room: RoomRecord) -> Result<RoomRecord, StoreError>;
    /// Delete a room, cascading to its participants, documents, operations,
    /// cursors and presence rows.
    async fn delete_room(&self, id: Uuid) -> Result<(), StoreError>;

    async fn get_participant(
        &self,
        room_id: Uuid,
        user_id: &str,
    ) -> Result<Option<ParticipantRecord>, StoreError>;
    async fn upsert_participant(
        &self,
        participant: ParticipantRecord,
    ) -> Result<ParticipantRecord, StoreError>;
    async fn participants_in_room(
        &self,
        room_id: Uuid,
    ) -> Result<Vec<ParticipantRecord>, StoreError>;

    /// Create a document; `Conflict` if `(room_id, file_path)` is taken.
    async fn create_document(&self, doc: DocumentRecord) -> Result<DocumentRecord, StoreError>;
    async fn get_document(&self, id: Uuid) -> Result<DocumentRecord, StoreError>;
    async fn find_document(
        &self,
        room_id: Uuid,
        file_path: &str,
    ) -> Result<Option<DocumentRecord>, StoreError>;
    async fn list_documents(&self, room_id: Uuid) -> Result<Vec<DocumentRecord>, StoreError>;
    async fn delete_document(&self, id: Uuid) -> Result<(), StoreError>;

    /// Operations with `server_sequence > after`, ascending, at most `limit`.
    async fn operations_since(
        &self,
        document_id: Uuid,
        after: u64,
        limit: usize,
    ) -> Result<Vec<OperationRecord>, StoreError>;
    /// The first record of the batch keyed by
    /// `(client_id, client_sequence)`, if that batch was persisted.
    async fn find_operation_by_key(
        &self,
        document_id: Uuid,
        client_id: Uuid,
        client_sequence: u64,
    ) -> Result<Option<OperationRecord>, StoreError>;
    /// All records carrying exactly this batch key, in server-sequence
    /// order. Records of other batches are never included, even when their
    /// sequences are adjacent in the log.
    async fn operations_for_batch(
        &self,
        document_id: Uuid,
        client_id: Uuid,
        client_sequence_start: u64,
    ) -> Result<Vec<OperationRecord>, StoreError>;
    /// Atomically append a batch and update the document row.
    ///
    /// Assigns consecutive server sequences continuing from the document's
    /// current version; `new_version` must equal that version plus
    /// `ops.len()`. On any failure nothing is persisted.
    async fn append_operations(
        &self,
        document_id: Uuid,
        ops: Vec<NewOperation>,
        new_content: &str,
        new_version: u64,
    ) -> Result<Vec<OperationRecord>, StoreError>;

    async fn upsert_cursor(&self, cursor: CursorRecord) -> Result<(), StoreError>;
    async fn cursors_for_document(
        &self,
        document_id: Uuid,
    ) -> Result<Vec<CursorRecord>, StoreError>;
    async fn upsert_presence(&self, presence: PresenceRecord) -> Result<(), StoreError>;
}

/// Line count rule used everywhere a document row is updated:
/// `max(1, newlines + (1 if non-empty))`.
pub fn line_count_of(content: &str) -> u64 {
    let newlines = content.matches('\n').count() as u64;
    let tail = u64::from(!content.is_empty());
    (newlines + tail).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_count_rule() {
        assert_eq!(line_count_of(""), 1);
        assert_eq!(line_count_of("a"), 1);
        assert_eq!(line_count_of("a\n"), 2);
        assert_eq!(line_count_of("a\nb"), 2);
        assert_eq!(line_count_of("\n\n"), 3);
    }

    #[test]
    fn roles_gate_editing_and_management() {
        assert!(Role::Owner.can_edit() && Role::Owner.can_manage());
        assert!(Role::Editor.can_edit() && !Role::Editor.can_manage());
        assert!(!Role::Viewer.can_edit() && !Role::Viewer.can_manage());
    }
}
