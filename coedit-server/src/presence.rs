//! Cursor and presence bookkeeping.
//!
//! Cursors address text as `(line, column)` while the OT layer works in flat
//! character offsets; the helpers here convert between the two against a
//! concrete document snapshot. All presence writes are best-effort: a failed
//! upsert is logged and never fails the surrounding operation.

use std::sync::Arc;

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::ot::Change;
use crate::store::{CursorRecord, PresenceRecord, PresenceStatus, Store};

/// Activity tag recorded while a participant is emitting operations.
pub const ACTIVITY_EDITING: &str = "editing";
/// Activity tag recorded while a participant is moving a cursor or reading.
pub const ACTIVITY_VIEWING: &str = "viewing";
/// Activity tag recorded when a participant has gone quiet.
pub const ACTIVITY_IDLE: &str = "idle";

/// Flat character offset of `(line, column)` in `content`, clamped to the
/// nearest valid position.
pub fn offset_of(content: &str, line: u32, column: u32) -> usize {
    let mut offset = 0;
    for (i, l) in content.split('\n').enumerate() {
        let len = l.chars().count();
        if i as u32 == line {
            return offset + (column as usize).min(len);
        }
        offset += len + 1;
    }
    content.chars().count()
}

/// Inverse of [`offset_of`]: `(line, column)` of a character offset.
pub fn position_at(content: &str, offset: usize) -> (u32, u32) {
    let mut line = 0u32;
    let mut column = 0u32;
    for c in content.chars().take(offset) {
        if c == '\n' {
            line += 1;
            column = 0;
        } else {
            column += 1;
        }
    }
    (line, column)
}

/// Rewrite a cursor so it refers to the same logical character after
/// `change` turned `old` into `new`.
pub fn transform_cursor(cursor: &mut CursorRecord, old: &str, new: &str, change: &Change) {
    let offset = offset_of(old, cursor.line, cursor.column);
    let (line, column) = position_at(new, change.transform_index(offset as u32) as usize);
    cursor.line = line;
    cursor.column = column;
    cursor.selection_start = cursor.selection_start.map(|s| change.transform_index(s));
    cursor.selection_end = cursor.selection_end.map(|s| change.transform_index(s));
    cursor.updated_at = Utc::now();
}

/// Upsert a presence row, swallowing (but logging) failures.
pub async fn record_presence(
    store: &Arc<dyn Store>,
    participant_id: Uuid,
    room_id: Uuid,
    status: PresenceStatus,
    current_document_id: Option<Uuid>,
    activity_type: &str,
) {
    let presence = PresenceRecord {
        participant_id,
        room_id,
        status,
        current_document_id,
        activity_type: activity_type.to_owned(),
        last_activity: Utc::now(),
    };
    if let Err(e) = store.upsert_presence(presence).await {
        warn!(%participant_id, %room_id, "presence upsert failed: {e}");
    }
}

/// Upsert a cursor row, swallowing (but logging) failures.
pub async fn record_cursor(store: &Arc<dyn Store>, cursor: CursorRecord) {
    let participant_id = cursor.participant_id;
    if let Err(e) = store.upsert_cursor(cursor).await {
        warn!(%participant_id, "cursor upsert failed: {e}");
    }
}
