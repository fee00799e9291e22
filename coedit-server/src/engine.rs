//! Per-document engine: serializes concurrent edits into one authoritative
//! history.
//!
//! Each active document is owned by exactly one [`DocEngine`]. A submit
//! holds the engine's lock across the whole pipeline (load, idempotency
//! check, staleness check, transform, apply, persist, sequence assignment,
//! and enqueueing of the author's ack and the room broadcast), so members
//! always observe operations in server-sequence order and the author's ack
//! is queued before any later batch can be. Delivery itself happens outside
//! the lock on each peer's writer task.

use std::sync::Arc;

use axum::extract::ws::Message;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::ot::{Change, num_chars};
use crate::presence::transform_cursor;
use crate::proto::{
    AppliedOp, ConfirmedOp, ErrorCode, ProtocolError, ServerEvent, WireOp,
};
use crate::store::{NewOperation, OpKind, OperationRecord, Role, Store};

/// Tunables for the submit pipeline.
#[derive(Debug, Clone, Copy)]
pub struct EngineLimits {
    /// Maximum lag (in operations) between a client's base version and the
    /// current version before the client must resync.
    pub sync_window: u64,
    /// Cap on the size of a document after an applied change.
    pub max_document_bytes: usize,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            sync_window: 100,
            max_document_bytes: 256 * 1024,
        }
    }
}

/// Sink for frames produced inside the submit critical section.
///
/// Implementations must not block: frames go onto bounded per-peer queues
/// and delivery happens elsewhere.
pub trait Fanout: Send + Sync {
    /// Queue the author's acknowledgement.
    fn ack(&self, frame: Message);
    /// Queue a frame to every room member except the author.
    fn broadcast(&self, author: Uuid, frame: Message);
}

/// An edit batch on its way into the document history.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub participant_id: Uuid,
    pub role: Role,
    pub client_id: Uuid,
    pub client_sequence_start: u64,
    pub base_version: u64,
    pub ops: Vec<WireOp>,
    pub request_id: Option<String>,
}

#[derive(Debug, Default)]
struct DocState {
    loaded: bool,
    content: String,
    version: u64,
}

/// The authoritative serializer for one document.
pub struct DocEngine {
    document_id: Uuid,
    store: Arc<dyn Store>,
    limits: EngineLimits,
    state: Mutex<DocState>,
}

impl DocEngine {
    pub fn new(document_id: Uuid, store: Arc<dyn Store>, limits: EngineLimits) -> Self {
        Self {
            document_id,
            store,
            limits,
            state: Mutex::new(DocState::default()),
        }
    }

    /// Current content and version, loading the document on first use.
    pub async fn snapshot(&self) -> Result<(String, u64), ProtocolError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        Ok((state.content.clone(), state.version))
    }

    /// Run one batch through the transform/apply/persist pipeline.
    ///
    /// On success the author's ack and the room broadcast have been queued;
    /// on error nothing was persisted and nothing was queued.
    pub async fn submit(
        &self,
        req: SubmitRequest,
        fanout: &dyn Fanout,
    ) -> Result<(), ProtocolError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;

        if !req.role.can_edit() {
            return Err(ProtocolError::new(
                ErrorCode::InsufficientPermissions,
                "viewers cannot edit documents",
            ));
        }
        let change = WireOp::to_change(&req.ops);
        if req.ops.is_empty() || change.is_noop() {
            return Err(ProtocolError::new(
                ErrorCode::InvalidOperation,
                "batch contains no effective operations",
            ));
        }

        // Retried batches are answered from history; appends are atomic, so
        // a partially persisted batch cannot exist.
        if self
            .store
            .find_operation_by_key(self.document_id, req.client_id, req.client_sequence_start)
            .await?
            .is_some()
        {
            let records = self
                .store
                .operations_for_batch(
                    self.document_id,
                    req.client_id,
                    req.client_sequence_start,
                )
                .await?;
            debug!(
                document_id = %self.document_id,
                client_id = %req.client_id,
                "replayed batch answered idempotently"
            );
            fanout.ack(self.confirmed_frame(&records, state.version, &req));
            return Ok(());
        }

        if req.base_version > state.version {
            return Err(ProtocolError::new(
                ErrorCode::InvalidOperation,
                format!(
                    "base version {} is ahead of document version {}",
                    req.base_version, state.version
                ),
            ));
        }
        if state.version - req.base_version > self.limits.sync_window {
            return Err(ProtocolError::new(
                ErrorCode::SyncRequired,
                format!(
                    "base version {} is too far behind version {}; refetch the document",
                    req.base_version, state.version
                ),
            ));
        }

        let tail = self
            .store
            .operations_since(self.document_id, req.base_version, usize::MAX)
            .await?;

        // Length of the document as the client saw it, walked back through
        // the concurrent tail.
        let mut base_len = num_chars(&state.content);
        for record in tail.iter().rev() {
            match record.kind {
                OpKind::Insert => {
                    base_len =
                        base_len.saturating_sub(record.content.as_deref().map(num_chars).unwrap_or(0));
                }
                OpKind::Delete => base_len += record.length.unwrap_or(0) as usize,
                OpKind::Retain => {}
            }
        }
        if !change.validate_against(base_len) {
            return Err(ProtocolError::new(
                ErrorCode::InvalidOperation,
                format!(
                    "change consumes {} characters but the document had {base_len}",
                    change.base_len()
                ),
            ));
        }

        // Rebase the incoming change across everything applied since its
        // base version. History is the left (winning) side of each pair.
        let mut change = change;
        let mut len_at = base_len;
        for record in &tail {
            let history = change_of_record(record)
                .padded_to(len_at)
                .map_err(invalid_op)?;
            let next_len = history.target_len();
            let (_, rebased) = history
                .transform(&change.padded_to(len_at).map_err(invalid_op)?)
                .map_err(invalid_op)?;
            change = rebased;
            len_at = next_len;
        }

        let old_content = state.content.clone();
        let new_content = change.apply(&old_content).map_err(invalid_op)?;
        if new_content.len() > self.limits.max_document_bytes {
            return Err(ProtocolError::new(
                ErrorCode::InvalidOperation,
                format!(
                    "document would grow to {} bytes (limit {})",
                    new_content.len(),
                    self.limits.max_document_bytes
                ),
            ));
        }

        let runs = decompose(&change, &req);
        if runs.is_empty() {
            // The whole batch was transformed away by concurrent edits.
            fanout.ack(self.confirmed_frame(&[], state.version, &req));
            return Ok(());
        }

        let new_version = state.version + runs.len() as u64;
        let records = self
            .store
            .append_operations(self.document_id, runs, &new_content, new_version)
            .await?;

        state.content = new_content;
        state.version = new_version;

        self.transform_stored_cursors(&req, &old_content, &state.content, &change)
            .await;

        fanout.ack(self.confirmed_frame(&records, new_version, &req));
        fanout.broadcast(
            req.participant_id,
            ServerEvent::OperationsApplied {
                document_id: self.document_id,
                participant_id: req.participant_id,
                ops: records.iter().map(AppliedOp::from).collect(),
                server_sequences: records.iter().map(|r| r.server_sequence).collect(),
            }
            .frame(None),
        );
        debug!(
            document_id = %self.document_id,
            participant_id = %req.participant_id,
            version = new_version,
            "applied batch of {} ops",
            records.len()
        );
        Ok(())
    }

    async fn ensure_loaded(&self, state: &mut DocState) -> Result<(), ProtocolError> {
        if !state.loaded {
            let doc = self.store.get_document(self.document_id).await?;
            state.content = doc.content;
            state.version = doc.version;
            state.loaded = true;
        }
        Ok(())
    }

    fn confirmed_frame(
        &self,
        records: &[OperationRecord],
        version: u64,
        req: &SubmitRequest,
    ) -> Message {
        ServerEvent::OperationsConfirmed {
            document_id: self.document_id,
            ops: records.iter().map(ConfirmedOp::from).collect(),
            new_version: version,
        }
        .frame(req.request_id.as_deref())
    }

    /// Keep persisted cursors of other participants pointing at the same
    /// logical characters. Best-effort.
    async fn transform_stored_cursors(
        &self,
        req: &SubmitRequest,
        old_content: &str,
        new_content: &str,
        change: &Change,
    ) {
        let cursors = match self.store.cursors_for_document(self.document_id).await {
            Ok(cursors) => cursors,
            Err(e) => {
                warn!(document_id = %self.document_id, "cursor read failed: {e}");
                return;
            }
        };
        for mut cursor in cursors {
            if cursor.participant_id == req.participant_id {
                continue;
            }
            transform_cursor(&mut cursor, old_content, new_content, change);
            crate::presence::record_cursor(&self.store, cursor).await;
        }
    }
}

fn invalid_op(e: crate::ot::OtError) -> ProtocolError {
    ProtocolError::new(ErrorCode::InvalidOperation, e.to_string())
}

/// Reconstruct the change a persisted record applies to the document state
/// just before it.
fn change_of_record(record: &OperationRecord) -> Change {
    let mut change = Change::new();
    change.retain(record.position as usize);
    match record.kind {
        OpKind::Insert => change.insert(record.content.as_deref().unwrap_or_default()),
        OpKind::Delete => change.delete(record.length.unwrap_or_default() as usize),
        OpKind::Retain => change.retain(record.length.unwrap_or_default() as usize),
    };
    change
}

/// Split a rebased change into content-affecting runs with positions in
/// successive-application coordinates, one store row per run.
///
/// Every run carries the batch's `client_sequence_start` unchanged; the
/// run index goes into `batch_offset`. Transformation can split one
/// authored op into several runs, and deriving sequences from the run
/// count would collide with the numbers the client mints for its next
/// batch.
fn decompose(change: &Change, req: &SubmitRequest) -> Vec<NewOperation> {
    let mut runs = Vec::new();
    let mut position = 0usize;
    for op in change.ops() {
        match op {
            crate::ot::Op::Retain(n) => position += n,
            crate::ot::Op::Insert(s) => {
                runs.push(NewOperation {
                    participant_id: req.participant_id,
                    kind: OpKind::Insert,
                    position: position as u64,
                    length: None,
                    content: Some(s.clone()),
                    client_id: req.client_id,
                    client_sequence: req.client_sequence_start,
                    batch_offset: runs.len() as u64,
                });
                position += num_chars(s);
            }
            crate::ot::Op::Delete(n) => {
                runs.push(NewOperation {
                    participant_id: req.participant_id,
                    kind: OpKind::Delete,
                    position: position as u64,
                    length: Some(*n as u64),
                    content: None,
                    client_id: req.client_id,
                    client_sequence: req.client_sequence_start,
                    batch_offset: runs.len() as u64,
                });
            }
        }
    }
    runs
}
