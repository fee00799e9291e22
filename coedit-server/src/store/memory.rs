//! In-memory reference store with optional JSON-file persistence.
//!
//! Rooms, documents and the per-document operation logs survive restarts
//! when a storage root is configured (`rooms/*.json`, `docs/*.json`,
//! `ops/*.jsonl`). Participants, cursors, presence and the token table are
//! session-scoped. Appends for one document are serialized by the calling
//! document engine, per the [`Store`] contract.

use std::path::{Path, PathBuf};

use chrono::Utc;
use dashmap::DashMap;
use rand::random;
use tokio::fs;
use tracing::warn;
use uuid::Uuid;

use super::{
    CursorRecord, DocumentRecord, NewOperation, OperationRecord, ParticipantRecord,
    PresenceRecord, RoomRecord, Store, StoreError, UserRecord, line_count_of,
};
use async_trait::async_trait;

/// The bundled [`Store`] implementation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    root: Option<PathBuf>,
    tokens: DashMap<String, UserRecord>,
    rooms: DashMap<Uuid, RoomRecord>,
    participants: DashMap<Uuid, ParticipantRecord>,
    participant_index: DashMap<(Uuid, String), Uuid>,
    documents: DashMap<Uuid, DocumentRecord>,
    document_index: DashMap<(Uuid, String), Uuid>,
    operations: DashMap<Uuid, Vec<OperationRecord>>,
    operation_index: DashMap<(Uuid, Uuid, u64), u64>,
    cursors: DashMap<(Uuid, Uuid), CursorRecord>,
    presence: DashMap<(Uuid, Uuid), PresenceRecord>,
}

impl MemoryStore {
    /// A purely in-memory store; state is lost on drop.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store rooted at `root`, loading any persisted state.
    pub async fn open(root: PathBuf) -> Result<Self, StoreError> {
        let store = Self {
            root: Some(root.clone()),
            tokens: DashMap::default(),
            rooms: DashMap::default(),
            participants: DashMap::default(),
            participant_index: DashMap::default(),
            documents: DashMap::default(),
            document_index: DashMap::default(),
            operations: DashMap::default(),
            operation_index: DashMap::default(),
            cursors: DashMap::default(),
            presence: DashMap::default(),
        };
        for dir in ["rooms", "docs", "ops"] {
            fs::create_dir_all(root.join(dir)).await?;
        }

        let mut entries = fs::read_dir(root.join("rooms")).await?;
        while let Some(entry) = entries.next_entry().await? {
            match serde_json::from_str::<RoomRecord>(&fs::read_to_string(entry.path()).await?) {
                Ok(room) => {
                    store.rooms.insert(room.id, room);
                }
                Err(e) => warn!("skipping unreadable room file {:?}: {e}", entry.path()),
            }
        }

        let mut entries = fs::read_dir(root.join("docs")).await?;
        while let Some(entry) = entries.next_entry().await? {
            match serde_json::from_str::<DocumentRecord>(&fs::read_to_string(entry.path()).await?)
            {
                Ok(doc) => {
                    store
                        .document_index
                        .insert((doc.room_id, doc.file_path.clone()), doc.id);
                    store.documents.insert(doc.id, doc);
                }
                Err(e) => warn!("skipping unreadable document file {:?}: {e}", entry.path()),
            }
        }

        let mut entries = fs::read_dir(root.join("ops")).await?;
        while let Some(entry) = entries.next_entry().await? {
            let mut log = Vec::new();
            for line in fs::read_to_string(entry.path()).await?.lines() {
                match serde_json::from_str::<OperationRecord>(line) {
                    Ok(op) => log.push(op),
                    Err(e) => warn!("skipping unreadable op in {:?}: {e}", entry.path()),
                }
            }
            if let Some(first) = log.first() {
                let document_id = first.document_id;
                log.sort_by_key(|op| op.server_sequence);
                for op in &log {
                    // Split batches share a key; the index points at the
                    // batch's first record.
                    store
                        .operation_index
                        .entry((document_id, op.client_id, op.client_sequence))
                        .or_insert(op.server_sequence);
                }
                store.operations.insert(document_id, log);
            }
        }

        Ok(store)
    }

    /// A disk-backed store under a fresh temporary directory, for tests.
    pub async fn temporary() -> Result<Self, StoreError> {
        let root = std::env::temp_dir().join(format!("coedit_{:x}", random::<u64>()));
        Self::open(root).await
    }

    /// Register a bearer token for `user`.
    pub fn insert_token(&self, token: &str, user: UserRecord) {
        self.tokens.insert(token.to_owned(), user);
    }

    /// Load a `token -> user` JSON map, registering every entry.
    pub async fn load_users(&self, path: &Path) -> Result<usize, StoreError> {
        let users: std::collections::HashMap<String, UserRecord> =
            serde_json::from_str(&fs::read_to_string(path).await?)?;
        let count = users.len();
        for (token, user) in users {
            self.tokens.insert(token, user);
        }
        Ok(count)
    }

    fn room_path(&self, id: Uuid) -> Option<PathBuf> {
        self.root.as_ref().map(|r| r.join("rooms").join(format!("{id}.json")))
    }

    fn doc_path(&self, id: Uuid) -> Option<PathBuf> {
        self.root.as_ref().map(|r| r.join("docs").join(format!("{id}.json")))
    }

    fn ops_path(&self, id: Uuid) -> Option<PathBuf> {
        self.root.as_ref().map(|r| r.join("ops").join(format!("{id}.jsonl")))
    }

    async fn write_json<T: serde::Serialize>(
        path: Option<PathBuf>,
        value: &T,
    ) -> Result<(), StoreError> {
        let Some(path) = path else { return Ok(()) };
        let data = serde_json::to_string_pretty(value)?;
        tokio::task::spawn_blocking(move || std::fs::write(path, data))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;
        Ok(())
    }

    async fn remove_file(path: Option<PathBuf>) {
        if let Some(path) = path
            && let Err(e) = fs::remove_file(&path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("failed to remove {path:?}: {e}");
        }
    }

    async fn append_log(
        path: Option<PathBuf>,
        records: &[OperationRecord],
    ) -> Result<(), StoreError> {
        let Some(path) = path else { return Ok(()) };
        let mut lines = String::new();
        for record in records {
            lines.push_str(&serde_json::to_string(record)?);
            lines.push('\n');
        }
        tokio::task::spawn_blocking(move || {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            file.write_all(lines.as_bytes())
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_user_from_token(&self, token: &str) -> Result<UserRecord, StoreError> {
        self.tokens
            .get(token)
            .map(|user| user.clone())
            .ok_or(StoreError::InvalidToken)
    }

    async fn create_room(&self, room: RoomRecord) -> Result<RoomRecord, StoreError> {
        Self::write_json(self.room_path(room.id), &room).await?;
        self.rooms.insert(room.id, room.clone());
        Ok(room)
    }

    async fn get_room(&self, id: Uuid) -> Result<RoomRecord, StoreError> {
        self.rooms
            .get(&id)
            .map(|room| room.clone())
            .ok_or(StoreError::NotFound("room"))
    }

    async fn list_rooms(&self) -> Result<Vec<RoomRecord>, StoreError> {
        let mut rooms: Vec<_> = self.rooms.iter().map(|r| r.clone()).collect();
        rooms.sort_by_key(|r| r.created_at);
        Ok(rooms)
    }

    async fn update_room(&self, room: RoomRecord) -> Result<RoomRecord, StoreError> {
        if !self.rooms.contains_key(&room.id) {
            return Err(StoreError::NotFound("room"));
        }
        Self::write_json(self.room_path(room.id), &room).await?;
        self.rooms.insert(room.id, room.clone());
        Ok(room)
    }

    async fn delete_room(&self, id: Uuid) -> Result<(), StoreError> {
        self.rooms.remove(&id).ok_or(StoreError::NotFound("room"))?;
        Self::remove_file(self.room_path(id)).await;

        let doc_ids: Vec<Uuid> = self
            .documents
            .iter()
            .filter(|d| d.room_id == id)
            .map(|d| d.id)
            .collect();
        for doc_id in doc_ids {
            if let Some((_, doc)) = self.documents.remove(&doc_id) {
                self.document_index.remove(&(doc.room_id, doc.file_path));
            }
            self.operations.remove(&doc_id);
            self.operation_index.retain(|(d, _, _), _| *d != doc_id);
            self.cursors.retain(|(_, d), _| *d != doc_id);
            Self::remove_file(self.doc_path(doc_id)).await;
            Self::remove_file(self.ops_path(doc_id)).await;
        }

        let participant_ids: Vec<Uuid> = self
            .participants
            .iter()
            .filter(|p| p.room_id == id)
            .map(|p| p.id)
            .collect();
        for pid in participant_ids {
            self.participants.remove(&pid);
        }
        self.participant_index.retain(|(room, _), _| *room != id);
        self.presence.retain(|(_, room), _| *room != id);
        Ok(())
    }

    async fn get_participant(
        &self,
        room_id: Uuid,
        user_id: &str,
    ) -> Result<Option<ParticipantRecord>, StoreError> {
        let id = self
            .participant_index
            .get(&(room_id, user_id.to_owned()))
            .map(|entry| *entry);
        Ok(id.and_then(|id| self.participants.get(&id).map(|p| p.clone())))
    }

    async fn upsert_participant(
        &self,
        mut participant: ParticipantRecord,
    ) -> Result<ParticipantRecord, StoreError> {
        let key = (participant.room_id, participant.user_id.clone());
        // Keep the participant id stable across re-joins.
        if let Some(existing) = self.participant_index.get(&key) {
            participant.id = *existing;
        }
        self.participant_index.insert(key, participant.id);
        self.participants.insert(participant.id, participant.clone());
        Ok(participant)
    }

    async fn participants_in_room(
        &self,
        room_id: Uuid,
    ) -> Result<Vec<ParticipantRecord>, StoreError> {
        let mut participants: Vec<_> = self
            .participants
            .iter()
            .filter(|p| p.room_id == room_id)
            .map(|p| p.clone())
            .collect();
        participants.sort_by_key(|p| p.id);
        Ok(participants)
    }

    async fn create_document(&self, doc: DocumentRecord) -> Result<DocumentRecord, StoreError> {
        use dashmap::mapref::entry::Entry;
        if !self.rooms.contains_key(&doc.room_id) {
            return Err(StoreError::NotFound("room"));
        }
        match self
            .document_index
            .entry((doc.room_id, doc.file_path.clone()))
        {
            Entry::Occupied(_) => {
                return Err(StoreError::Conflict(format!(
                    "document {} already exists in room",
                    doc.file_path
                )));
            }
            Entry::Vacant(entry) => entry.insert(doc.id),
        };
        Self::write_json(self.doc_path(doc.id), &doc).await?;
        self.documents.insert(doc.id, doc.clone());
        Ok(doc)
    }

    async fn get_document(&self, id: Uuid) -> Result<DocumentRecord, StoreError> {
        self.documents
            .get(&id)
            .map(|doc| doc.clone())
            .ok_or(StoreError::NotFound("document"))
    }

    async fn find_document(
        &self,
        room_id: Uuid,
        file_path: &str,
    ) -> Result<Option<DocumentRecord>, StoreError> {
        let id = self
            .document_index
            .get(&(room_id, file_path.to_owned()))
            .map(|entry| *entry);
        Ok(id.and_then(|id| self.documents.get(&id).map(|d| d.clone())))
    }

    async fn list_documents(&self, room_id: Uuid) -> Result<Vec<DocumentRecord>, StoreError> {
        let mut docs: Vec<_> = self
            .documents
            .iter()
            .filter(|d| d.room_id == room_id)
            .map(|d| d.clone())
            .collect();
        docs.sort_by(|a, b| a.file_path.cmp(&b.file_path));
        Ok(docs)
    }

    async fn delete_document(&self, id: Uuid) -> Result<(), StoreError> {
        let (_, doc) = self
            .documents
            .remove(&id)
            .ok_or(StoreError::NotFound("document"))?;
        self.document_index.remove(&(doc.room_id, doc.file_path));
        self.operations.remove(&id);
        self.operation_index.retain(|(d, _, _), _| *d != id);
        self.cursors.retain(|(_, d), _| *d != id);
        Self::remove_file(self.doc_path(id)).await;
        Self::remove_file(self.ops_path(id)).await;
        Ok(())
    }

    async fn operations_since(
        &self,
        document_id: Uuid,
        after: u64,
        limit: usize,
    ) -> Result<Vec<OperationRecord>, StoreError> {
        Ok(self
            .operations
            .get(&document_id)
            .map(|log| {
                log.iter()
                    .filter(|op| op.server_sequence > after)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn find_operation_by_key(
        &self,
        document_id: Uuid,
        client_id: Uuid,
        client_sequence: u64,
    ) -> Result<Option<OperationRecord>, StoreError> {
        let seq = self
            .operation_index
            .get(&(document_id, client_id, client_sequence))
            .map(|entry| *entry);
        Ok(seq.and_then(|seq| {
            self.operations
                .get(&document_id)
                .and_then(|log| log.get(seq as usize - 1).cloned())
        }))
    }

    async fn operations_for_batch(
        &self,
        document_id: Uuid,
        client_id: Uuid,
        client_sequence_start: u64,
    ) -> Result<Vec<OperationRecord>, StoreError> {
        let Some(log) = self.operations.get(&document_id) else {
            return Ok(Vec::new());
        };
        Ok(log
            .iter()
            .filter(|op| {
                op.client_id == client_id && op.client_sequence == client_sequence_start
            })
            .cloned()
            .collect())
    }

    async fn append_operations(
        &self,
        document_id: Uuid,
        ops: Vec<NewOperation>,
        new_content: &str,
        new_version: u64,
    ) -> Result<Vec<OperationRecord>, StoreError> {
        let mut doc = self
            .documents
            .get(&document_id)
            .map(|doc| doc.clone())
            .ok_or(StoreError::NotFound("document"))?;
        if new_version != doc.version + ops.len() as u64 {
            return Err(StoreError::Conflict(format!(
                "version {new_version} does not extend {} by {} ops",
                doc.version,
                ops.len()
            )));
        }
        for op in &ops {
            if self
                .operation_index
                .contains_key(&(document_id, op.client_id, op.client_sequence))
            {
                return Err(StoreError::Conflict(format!(
                    "duplicate idempotency key ({}, {})",
                    op.client_id, op.client_sequence
                )));
            }
        }

        let now = Utc::now();
        let records: Vec<OperationRecord> = ops
            .into_iter()
            .enumerate()
            .map(|(i, op)| OperationRecord {
                id: Uuid::new_v4(),
                document_id,
                participant_id: op.participant_id,
                kind: op.kind,
                position: op.position,
                length: op.length,
                content: op.content,
                client_id: op.client_id,
                client_sequence: op.client_sequence,
                batch_offset: op.batch_offset,
                server_sequence: doc.version + 1 + i as u64,
                timestamp: now,
            })
            .collect();

        doc.content = new_content.to_owned();
        doc.version = new_version;
        doc.size_bytes = new_content.len() as u64;
        doc.line_count = line_count_of(new_content);
        doc.last_operation_ts = Some(now);

        // Disk first so a failed write leaves memory untouched.
        Self::append_log(self.ops_path(document_id), &records).await?;
        Self::write_json(self.doc_path(document_id), &doc).await?;

        for record in &records {
            self.operation_index
                .entry((document_id, record.client_id, record.client_sequence))
                .or_insert(record.server_sequence);
        }
        self.operations
            .entry(document_id)
            .or_default()
            .extend(records.iter().cloned());
        self.documents.insert(document_id, doc);
        Ok(records)
    }

    async fn upsert_cursor(&self, cursor: CursorRecord) -> Result<(), StoreError> {
        self.cursors
            .insert((cursor.participant_id, cursor.document_id), cursor);
        Ok(())
    }

    async fn cursors_for_document(
        &self,
        document_id: Uuid,
    ) -> Result<Vec<CursorRecord>, StoreError> {
        let mut cursors: Vec<_> = self
            .cursors
            .iter()
            .filter(|c| c.document_id == document_id)
            .map(|c| c.clone())
            .collect();
        cursors.sort_by_key(|c| c.participant_id);
        Ok(cursors)
    }

    async fn upsert_presence(&self, presence: PresenceRecord) -> Result<(), StoreError> {
        self.presence
            .insert((presence.participant_id, presence.room_id), presence);
        Ok(())
    }
}

#[cfg(test)]
impl Drop for MemoryStore {
    fn drop(&mut self) {
        // Clean up temporary storage directories on drop.
        if let Some(root) = &self.root
            && root.parent() == Some(std::env::temp_dir().as_path())
        {
            let _ = std::fs::remove_dir_all(root);
        }
    }
}
