//! In-memory room registry: membership, admission, fan-out and lifecycle.
//!
//! The hub owns the `room id -> RoomState` map. Each [`RoomState`] holds the
//! live members (with their bounded outbound queues) and the document
//! engines instantiated for that room. Durable state is only ever touched
//! through the store; dropping in-memory room state loses nothing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::Message;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Notify, mpsc};
use tokio::time::{self, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::{DocEngine, EngineLimits};
use crate::presence::{ACTIVITY_IDLE, ACTIVITY_VIEWING, record_presence};
use crate::proto::{
    CursorInfo, DocumentSummary, ErrorCode, ParticipantInfo, ProtocolError, RoomInfo,
    RoomSnapshot, ServerEvent,
};
use crate::store::{
    ParticipantRecord, PresenceStatus, Role, RoomStatus, Store, UserRecord,
};

/// Cursor colors handed out to new participants, round-robin.
const PALETTE: [&str; 8] = [
    "#e03131", "#1971c2", "#2f9e44", "#f08c00", "#9c36b5", "#0c8599", "#e8590c", "#6741d9",
];

/// The palette color for the nth participant of a room.
pub fn palette_color(index: usize) -> &'static str {
    PALETTE[index % PALETTE.len()]
}

/// Hub tunables.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub limits: EngineLimits,
    /// Capacity of each member's outbound queue; overflow drops the peer.
    pub outbound_capacity: usize,
    /// Drop in-memory room state after this long without members.
    pub idle_after: Duration,
    /// Flip silent members to away after this long.
    pub away_after: Duration,
    pub sweep_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            limits: EngineLimits::default(),
            outbound_capacity: 64,
            idle_after: Duration::from_secs(300),
            away_after: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// A live connection's handle inside a room.
pub struct Member {
    pub connection_id: u64,
    tx: mpsc::Sender<Message>,
    kill: Arc<Notify>,
    last_activity: std::sync::Mutex<Instant>,
    away: AtomicBool,
}

/// Everything the hub keeps in memory for one active room.
pub struct RoomState {
    pub room_id: Uuid,
    members: DashMap<Uuid, Member>,
    engines: DashMap<Uuid, Arc<DocEngine>>,
    store: Arc<dyn Store>,
    limits: EngineLimits,
}

impl RoomState {
    fn new(room_id: Uuid, store: Arc<dyn Store>, limits: EngineLimits) -> Self {
        Self {
            room_id,
            members: DashMap::new(),
            engines: DashMap::new(),
            store,
            limits,
        }
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// The engine for a document in this room, created on first use.
    pub async fn engine(&self, document_id: Uuid) -> Result<Arc<DocEngine>, ProtocolError> {
        if let Some(engine) = self.engines.get(&document_id) {
            return Ok(engine.clone());
        }
        let doc = self.store.get_document(document_id).await?;
        if doc.room_id != self.room_id {
            return Err(ProtocolError::new(
                ErrorCode::NotFound,
                "document not found",
            ));
        }
        let engine = self
            .engines
            .entry(document_id)
            .or_insert_with(|| {
                Arc::new(DocEngine::new(document_id, self.store.clone(), self.limits))
            })
            .clone();
        Ok(engine)
    }

    pub fn drop_engine(&self, document_id: Uuid) {
        self.engines.remove(&document_id);
    }

    /// Queue a frame to every member except `exclude`.
    ///
    /// Delivery is best-effort per peer: a closed queue is the peer's own
    /// teardown in progress, a full queue marks the peer unhealthy and its
    /// connection is dropped.
    pub fn send_to_all_except(&self, exclude: Option<Uuid>, frame: &Message) {
        for member in self.members.iter() {
            if Some(*member.key()) == exclude {
                continue;
            }
            member.value().send(frame.clone());
        }
    }

    /// Record activity for the away sweep.
    pub fn touch(&self, participant_id: Uuid) {
        if let Some(member) = self.members.get(&participant_id) {
            *member.last_activity.lock().expect("activity lock") = Instant::now();
            member.away.store(false, Ordering::Relaxed);
        }
    }
}

impl Member {
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
}

struct RoomEntry {
    last_accessed: Instant,
    state: Arc<RoomState>,
}

/// What a successful join hands back to the connection.
pub struct Admission {
    pub room: Arc<RoomState>,
    pub participant: ParticipantRecord,
    pub info: RoomInfo,
    pub snapshot: RoomSnapshot,
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission")
            .field("room_id", &self.room.room_id)
            .field("participant", &self.participant)
            .field("info", &self.info)
            .field("snapshot", &self.snapshot)
            .finish()
    }
}

/// Registry of live rooms.
pub struct Hub {
    rooms: DashMap<Uuid, RoomEntry>,
    store: Arc<dyn Store>,
    config: HubConfig,
    connection_counter: AtomicU64,
}

impl Hub {
    pub fn new(store: Arc<dyn Store>, config: HubConfig) -> Self {
        Self {
            rooms: DashMap::new(),
            store,
            config,
            connection_counter: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Allocate an id for a new connection.
    pub fn next_connection_id(&self) -> u64 {
        self.connection_counter.fetch_add(1, Ordering::Relaxed)
    }

    fn room_state(&self, room_id: Uuid) -> Arc<RoomState> {
        use dashmap::mapref::entry::Entry;
        let mut entry = match self.rooms.entry(room_id) {
            Entry::Occupied(e) => e.into_ref(),
            Entry::Vacant(e) => e.insert(RoomEntry {
                last_accessed: Instant::now(),
                state: Arc::new(RoomState::new(
                    room_id,
                    self.store.clone(),
                    self.config.limits,
                )),
            }),
        };
        let value = entry.value_mut();
        value.last_accessed = Instant::now();
        value.state.clone()
    }

    /// Admit an authenticated user into a room.
    ///
    /// Users with an existing participant row keep their role; unknown
    /// users are enrolled on the fly, as owner when they own the room and
    /// as editor otherwise. Capacity counts live members only.
    pub async fn join(
        &self,
        room_id: Uuid,
        user: &UserRecord,
        display_name: Option<String>,
        connection_id: u64,
        tx: mpsc::Sender<Message>,
        kill: Arc<Notify>,
    ) -> Result<Admission, ProtocolError> {
        let mut room = self.store.get_room(room_id).await?;
        if room.status == RoomStatus::Archived {
            return Err(ProtocolError::new(
                ErrorCode::AccessDenied,
                "room is archived",
            ));
        }
        if room.expires_at.is_some_and(|expiry| expiry <= Utc::now()) {
            return Err(ProtocolError::new(
                ErrorCode::AccessDenied,
                "room has expired",
            ));
        }

        let existing = self.store.get_participant(room_id, &user.id).await?;
        let participant = match existing {
            Some(mut participant) => {
                participant.presence_status = PresenceStatus::Online;
                participant.last_seen = Utc::now();
                if let Some(name) = display_name {
                    participant.display_name = name;
                }
                participant
            }
            None => {
                let role = if room.owner == user.id {
                    Role::Owner
                } else {
                    Role::Editor
                };
                let index = self.store.participants_in_room(room_id).await?.len();
                ParticipantRecord {
                    id: Uuid::new_v4(),
                    room_id,
                    user_id: user.id.clone(),
                    role,
                    display_name: display_name.unwrap_or_else(|| user.name.clone()),
                    color: palette_color(index).to_owned(),
                    presence_status: PresenceStatus::Online,
                    last_seen: Utc::now(),
                }
            }
        };

        let state = self.room_state(room_id);
        if state.member_count() >= room.max_participants as usize
            && !state.members.contains_key(&participant.id)
        {
            return Err(ProtocolError::new(ErrorCode::RoomFull, "room is full"));
        }

        let participant = self.store.upsert_participant(participant).await?;
        if room.status == RoomStatus::Inactive {
            room.status = RoomStatus::Active;
            if let Err(e) = self.store.update_room(room.clone()).await {
                warn!(%room_id, "failed to reactivate room: {e}");
            }
        }

        // A second connection for the same participant replaces the first.
        if let Some(old) = state.members.insert(
            participant.id,
            Member {
                connection_id,
                tx,
                kill,
                last_activity: std::sync::Mutex::new(Instant::now()),
                away: AtomicBool::new(false),
            },
        ) {
            info!(
                participant_id = %participant.id,
                "replacing connection {}",
                old.connection_id
            );
            old.kill.notify_waiters();
        }

        record_presence(
            &self.store,
            participant.id,
            room_id,
            PresenceStatus::Online,
            None,
            ACTIVITY_VIEWING,
        )
        .await;

        let participants = self
            .store
            .participants_in_room(room_id)
            .await?
            .iter()
            .map(ParticipantInfo::from)
            .collect();
        let docs = self.store.list_documents(room_id).await?;
        let mut cursors = Vec::new();
        for doc in &docs {
            cursors.extend(
                self.store
                    .cursors_for_document(doc.id)
                    .await?
                    .iter()
                    .map(CursorInfo::from),
            );
        }
        let documents = docs.iter().map(DocumentSummary::from).collect();

        state.send_to_all_except(
            Some(participant.id),
            &ServerEvent::ParticipantJoined {
                participant: ParticipantInfo::from(&participant),
            }
            .frame(None),
        );
        info!(%room_id, participant_id = %participant.id, connection_id, "participant joined");

        Ok(Admission {
            room: state,
            participant,
            info: RoomInfo::from(&room),
            snapshot: RoomSnapshot {
                participants,
                documents,
                cursors,
            },
        })
    }

    /// Remove a connection from its room, marking the participant offline.
    pub async fn leave(
        &self,
        room: &Arc<RoomState>,
        participant: &ParticipantRecord,
        connection_id: u64,
    ) {
        // A replacement connection may already own the membership slot.
        if room
            .members
            .remove_if(&participant.id, |_, m| m.connection_id == connection_id)
            .is_none()
        {
            return;
        }

        let mut offline = participant.clone();
        offline.presence_status = PresenceStatus::Offline;
        offline.last_seen = Utc::now();
        if let Err(e) = self.store.upsert_participant(offline).await {
            warn!(participant_id = %participant.id, "offline upsert failed: {e}");
        }
        record_presence(
            &self.store,
            participant.id,
            room.room_id,
            PresenceStatus::Offline,
            None,
            ACTIVITY_IDLE,
        )
        .await;

        room.send_to_all_except(
            None,
            &ServerEvent::ParticipantLeft {
                participant_id: participant.id,
            }
            .frame(None),
        );
        info!(
            room_id = %room.room_id,
            participant_id = %participant.id,
            connection_id,
            "participant left"
        );
    }

    /// Tear down a room's live state, disconnecting every member.
    pub fn close_room(&self, room_id: Uuid) {
        if let Some((_, entry)) = self.rooms.remove(&room_id) {
            for member in entry.state.members.iter() {
                member.kill.notify_waiters();
            }
            entry.state.members.clear();
        }
    }

    /// Drop a document's engine wherever it is live.
    pub fn drop_document(&self, room_id: Uuid, document_id: Uuid) {
        if let Some(entry) = self.rooms.get(&room_id) {
            entry.state.drop_engine(document_id);
        }
    }

    /// Count of rooms with live in-memory state.
    pub fn live_room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Periodic maintenance: reclaim idle rooms, flip silent members to
    /// away. Runs until the server shuts down.
    pub async fn run_maintenance(self: Arc<Self>) {
        loop {
            time::sleep(self.config.sweep_interval).await;
            self.sweep().await;
        }
    }

    async fn sweep(&self) {
        let mut idle = Vec::new();
        let mut live = Vec::new();
        for entry in self.rooms.iter() {
            let state = &entry.value().state;
            if state.members.is_empty()
                && entry.value().last_accessed.elapsed() > self.config.idle_after
            {
                idle.push(*entry.key());
            } else {
                live.push(state.clone());
            }
        }
        for state in &live {
            self.sweep_away(state).await;
        }
        for room_id in idle {
            info!(%room_id, "reclaiming idle room state");
            self.rooms.remove(&room_id);
            if let Ok(mut room) = self.store.get_room(room_id).await
                && room.status == RoomStatus::Active
            {
                room.status = RoomStatus::Inactive;
                if let Err(e) = self.store.update_room(room).await {
                    warn!(%room_id, "failed to mark room inactive: {e}");
                }
            }
        }
    }

    async fn sweep_away(&self, state: &Arc<RoomState>) {
        let mut newly_away = Vec::new();
        for member in state.members.iter() {
            let last = *member.last_activity.lock().expect("activity lock");
            if last.elapsed() > self.config.away_after
                && !member.away.swap(true, Ordering::Relaxed)
            {
                newly_away.push(*member.key());
            }
        }
        for participant_id in newly_away {
            record_presence(
                &self.store,
                participant_id,
                state.room_id,
                PresenceStatus::Away,
                None,
                ACTIVITY_IDLE,
            )
            .await;
            state.send_to_all_except(
                None,
                &ServerEvent::PresenceUpdate {
                    participant_id,
                    status: PresenceStatus::Away,
                    current_document_id: None,
                    activity_type: ACTIVITY_IDLE.to_owned(),
                }
                .frame(None),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, RoomRecord};

    async fn seeded() -> (Arc<Hub>, Uuid) {
        let store = Arc::new(MemoryStore::new());
        store.insert_token(
            "tok-alice",
            UserRecord {
                id: "alice".into(),
                name: "Alice".into(),
            },
        );
        store.insert_token(
            "tok-bob",
            UserRecord {
                id: "bob".into(),
                name: "Bob".into(),
            },
        );
        let room = store
            .create_room(RoomRecord {
                id: Uuid::new_v4(),
                name: "hub-test".into(),
                status: RoomStatus::Active,
                owner: "alice".into(),
                max_participants: 1,
                created_at: Utc::now(),
                expires_at: None,
            })
            .await
            .unwrap();
        let hub = Arc::new(Hub::new(store, HubConfig::default()));
        (hub, room.id)
    }

    fn conn() -> (mpsc::Sender<Message>, mpsc::Receiver<Message>, Arc<Notify>) {
        let (tx, rx) = mpsc::channel(8);
        (tx, rx, Arc::new(Notify::new()))
    }

    #[tokio::test]
    async fn owner_is_enrolled_as_owner_and_room_fills_up() {
        let (hub, room_id) = seeded().await;
        let user = UserRecord {
            id: "alice".into(),
            name: "Alice".into(),
        };
        let (tx, _rx, kill) = conn();
        let admission = hub
            .join(room_id, &user, None, hub.next_connection_id(), tx, kill)
            .await
            .unwrap();
        assert_eq!(admission.participant.role, Role::Owner);
        assert_eq!(admission.snapshot.participants.len(), 1);

        let bob = UserRecord {
            id: "bob".into(),
            name: "Bob".into(),
        };
        let (tx, _rx2, kill) = conn();
        let err = hub
            .join(room_id, &bob, None, hub.next_connection_id(), tx, kill)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RoomFull);
    }

    #[tokio::test]
    async fn replacement_connection_kills_the_old_one() {
        let (hub, room_id) = seeded().await;
        let user = UserRecord {
            id: "alice".into(),
            name: "Alice".into(),
        };
        let (tx1, _rx1, kill1) = conn();
        let first = hub
            .join(room_id, &user, None, hub.next_connection_id(), tx1, kill1.clone())
            .await
            .unwrap();
        let mut killed = std::pin::pin!(kill1.notified());
        killed.as_mut().enable();
        let (tx2, _rx2, kill2) = conn();
        let second = hub
            .join(room_id, &user, None, hub.next_connection_id(), tx2, kill2)
            .await
            .unwrap();
        killed.await;
        assert_eq!(first.participant.id, second.participant.id);
        assert_eq!(second.room.member_count(), 1);
    }
}
