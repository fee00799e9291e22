//! Server backend for coedit, a real-time collaborative text editor.
//!
//! Clients connect over WebSocket, join rooms, and edit shared documents;
//! the server serializes concurrent edits per document with operational
//! transformation and fans out operations, cursors and presence to the rest
//! of the room. A thin HTTP surface handles room/document administration.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Context;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::TypedHeader;
use axum_extra::headers::Authorization;
use axum_extra::headers::authorization::Bearer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

pub mod engine;
pub mod hub;
pub mod limit;
pub mod ot;
pub mod presence;
pub mod proto;
pub mod session;
pub mod store;

use crate::hub::{Hub, HubConfig};
use crate::presence::ACTIVITY_IDLE;
use crate::proto::{ErrorCode, ProtocolError};
use crate::session::SessionConfig;
use crate::store::{
    DocumentRecord, MemoryStore, ParticipantRecord, PresenceStatus, Role, RoomRecord, RoomStatus,
    Store, StoreError, UserRecord,
};

/// Server configuration assembled from CLI flags and environment.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Storage root for persisted rooms/documents; in-memory when unset.
    pub storage: Option<PathBuf>,
    /// JSON file mapping bearer tokens to users.
    pub users_file: Option<PathBuf>,
    pub hub: HubConfig,
    pub session: SessionConfig,
}

/// Shared state behind every request handler.
pub struct ServerState {
    store: Arc<MemoryStore>,
    hub: Arc<Hub>,
    session: SessionConfig,
    started_at: SystemTime,
    default_max_participants: u32,
}

impl ServerState {
    /// Build server state from configuration, loading persisted storage and
    /// the users file when configured.
    pub async fn new(config: ServerConfig) -> anyhow::Result<Self> {
        let store = match &config.storage {
            Some(root) => MemoryStore::open(root.clone())
                .await
                .context("opening storage root")?,
            None => MemoryStore::new(),
        };
        if let Some(users) = &config.users_file {
            let count = store
                .load_users(users)
                .await
                .context("loading users file")?;
            info!("loaded {count} users from {users:?}");
        }
        let store = Arc::new(store);
        let dyn_store: Arc<dyn Store> = store.clone();
        Ok(Self {
            store,
            hub: Arc::new(Hub::new(dyn_store, config.hub)),
            session: config.session,
            started_at: SystemTime::now(),
            default_max_participants: 32,
        })
    }

    /// State backed by a fresh in-memory store, for tests.
    pub async fn temporary() -> anyhow::Result<Self> {
        Self::new(ServerConfig::default()).await
    }

    /// Direct handle to the bundled store (token seeding in tests/tools).
    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    fn dyn_store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }
}

/// Build the full application router and start background maintenance.
pub fn server(state: Arc<ServerState>) -> Router {
    tokio::spawn(state.hub.clone().run_maintenance());
    Router::new().nest("/api", api_routes()).with_state(state)
}

fn api_routes() -> Router<Arc<ServerState>> {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/socket", get(socket_handler))
        .route("/rooms", post(create_room).get(list_rooms))
        .route(
            "/rooms/{id}",
            get(get_room).put(update_room).delete(delete_room),
        )
        .route("/rooms/{id}/join", post(join_room))
        .route("/rooms/{id}/leave", post(leave_room))
        .route("/documents", post(create_document).get(list_documents))
        .route("/documents/{id}", get(get_document).delete(delete_document))
}

/// Uniform response envelope for the admin surface.
#[derive(Debug, Serialize)]
struct ApiResponse<T: Serialize> {
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<ErrorCode>,
}

fn ok<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        data: Some(data),
        error: None,
        code: None,
    })
}

/// Protocol errors rendered as HTTP responses with the same envelope.
struct ApiError(ProtocolError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.code.http_status();
        let body = Json(ApiResponse::<()> {
            data: None,
            error: Some(self.0.message),
            code: Some(self.0.code),
        });
        (status, body).into_response()
    }
}

impl From<ProtocolError> for ApiError {
    fn from(err: ProtocolError) -> Self {
        Self(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self(err.into())
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

async fn authed(
    state: &ServerState,
    bearer: &Authorization<Bearer>,
) -> Result<UserRecord, ApiError> {
    Ok(state.store.get_user_from_token(bearer.token()).await?)
}

fn forbidden(message: &str) -> ApiError {
    ApiError(ProtocolError::new(
        ErrorCode::InsufficientPermissions,
        message,
    ))
}

// ---- handlers ----

#[derive(Serialize)]
struct Health {
    status: &'static str,
}

async fn health_handler() -> Json<ApiResponse<Health>> {
    ok(Health { status: "ok" })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Stats {
    /// Seconds since Unix epoch when the server started.
    start_time: u64,
    /// Rooms with live in-memory state.
    live_rooms: usize,
    /// Rooms known to the store.
    rooms: usize,
}

async fn stats_handler(State(state): State<Arc<ServerState>>) -> ApiResult<Stats> {
    let start_time = state
        .started_at
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    Ok(ok(Stats {
        start_time,
        live_rooms: state.hub.live_room_count(),
        rooms: state.store.list_rooms().await?.len(),
    }))
}

async fn socket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
) -> impl IntoResponse {
    let hub = state.hub.clone();
    let store = state.dyn_store();
    let config = state.session;
    ws.on_upgrade(move |socket| session::handle_socket(socket, hub, store, config))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRoomBody {
    name: String,
    max_participants: Option<u32>,
    expires_at: Option<DateTime<Utc>>,
}

async fn create_room(
    State(state): State<Arc<ServerState>>,
    TypedHeader(bearer): TypedHeader<Authorization<Bearer>>,
    Json(body): Json<CreateRoomBody>,
) -> ApiResult<RoomRecord> {
    let user = authed(&state, &bearer).await?;
    let room = state
        .store
        .create_room(RoomRecord {
            id: Uuid::new_v4(),
            name: body.name,
            status: RoomStatus::Active,
            owner: user.id,
            max_participants: body
                .max_participants
                .unwrap_or(state.default_max_participants),
            created_at: Utc::now(),
            expires_at: body.expires_at,
        })
        .await?;
    info!(room_id = %room.id, "room created");
    Ok(ok(room))
}

async fn list_rooms(State(state): State<Arc<ServerState>>) -> ApiResult<Vec<RoomRecord>> {
    Ok(ok(state.store.list_rooms().await?))
}

async fn get_room(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<RoomRecord> {
    Ok(ok(state.store.get_room(id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateRoomBody {
    name: Option<String>,
    status: Option<RoomStatus>,
    max_participants: Option<u32>,
}

async fn update_room(
    State(state): State<Arc<ServerState>>,
    TypedHeader(bearer): TypedHeader<Authorization<Bearer>>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateRoomBody>,
) -> ApiResult<RoomRecord> {
    let user = authed(&state, &bearer).await?;
    let mut room = state.store.get_room(id).await?;
    if room.owner != user.id {
        return Err(forbidden("only the room owner can update the room"));
    }
    if let Some(name) = body.name {
        room.name = name;
    }
    if let Some(max) = body.max_participants {
        room.max_participants = max;
    }
    if let Some(status) = body.status {
        room.status = status;
        if status == RoomStatus::Archived {
            state.hub.close_room(id);
        }
    }
    Ok(ok(state.store.update_room(room).await?))
}

async fn delete_room(
    State(state): State<Arc<ServerState>>,
    TypedHeader(bearer): TypedHeader<Authorization<Bearer>>,
    Path(id): Path<Uuid>,
) -> ApiResult<()> {
    let user = authed(&state, &bearer).await?;
    let room = state.store.get_room(id).await?;
    if room.owner != user.id {
        return Err(forbidden("only the room owner can delete the room"));
    }
    state.hub.close_room(id);
    state.store.delete_room(id).await?;
    info!(room_id = %id, "room deleted");
    Ok(ok(()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinRoomBody {
    display_name: Option<String>,
}

async fn join_room(
    State(state): State<Arc<ServerState>>,
    TypedHeader(bearer): TypedHeader<Authorization<Bearer>>,
    Path(id): Path<Uuid>,
    body: Option<Json<JoinRoomBody>>,
) -> ApiResult<ParticipantRecord> {
    let user = authed(&state, &bearer).await?;
    let room = state.store.get_room(id).await?;
    if room.status == RoomStatus::Archived {
        return Err(ApiError(ProtocolError::new(
            ErrorCode::AccessDenied,
            "room is archived",
        )));
    }
    let display_name = body.and_then(|Json(b)| b.display_name);
    let participant = match state.store.get_participant(id, &user.id).await? {
        Some(mut participant) => {
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
            let index = state.store.participants_in_room(id).await?.len();
            ParticipantRecord {
                id: Uuid::new_v4(),
                room_id: id,
                user_id: user.id.clone(),
                role,
                display_name: display_name.unwrap_or_else(|| user.name.clone()),
                color: hub::palette_color(index).to_owned(),
                presence_status: PresenceStatus::Offline,
                last_seen: Utc::now(),
            }
        }
    };
    Ok(ok(state.store.upsert_participant(participant).await?))
}

async fn leave_room(
    State(state): State<Arc<ServerState>>,
    TypedHeader(bearer): TypedHeader<Authorization<Bearer>>,
    Path(id): Path<Uuid>,
) -> ApiResult<()> {
    let user = authed(&state, &bearer).await?;
    let Some(mut participant) = state.store.get_participant(id, &user.id).await? else {
        return Err(ApiError(ProtocolError::new(
            ErrorCode::NotFound,
            "participant not found",
        )));
    };
    participant.presence_status = PresenceStatus::Offline;
    participant.last_seen = Utc::now();
    let participant = state.store.upsert_participant(participant).await?;
    presence::record_presence(
        &state.dyn_store(),
        participant.id,
        id,
        PresenceStatus::Offline,
        None,
        ACTIVITY_IDLE,
    )
    .await;
    Ok(ok(()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateDocumentBody {
    room_id: Uuid,
    file_path: String,
    #[serde(default)]
    content: Option<String>,
}

async fn create_document(
    State(state): State<Arc<ServerState>>,
    TypedHeader(bearer): TypedHeader<Authorization<Bearer>>,
    Json(body): Json<CreateDocumentBody>,
) -> ApiResult<DocumentRecord> {
    let user = authed(&state, &bearer).await?;
    let room = state.store.get_room(body.room_id).await?;
    let participant = state.store.get_participant(room.id, &user.id).await?;
    let can_edit =
        user.id == room.owner || participant.map(|p| p.role.can_edit()).unwrap_or(false);
    if !can_edit {
        return Err(forbidden("join the room as an editor first"));
    }
    let doc = state
        .store
        .create_document(DocumentRecord::create(
            body.room_id,
            body.file_path,
            body.content.unwrap_or_default(),
        ))
        .await?;
    info!(document_id = %doc.id, room_id = %doc.room_id, "document created");
    Ok(ok(doc))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListDocumentsQuery {
    room_id: Uuid,
}

async fn list_documents(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<ListDocumentsQuery>,
) -> ApiResult<Vec<DocumentRecord>> {
    Ok(ok(state.store.list_documents(query.room_id).await?))
}

async fn get_document(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<DocumentRecord> {
    Ok(ok(state.store.get_document(id).await?))
}

async fn delete_document(
    State(state): State<Arc<ServerState>>,
    TypedHeader(bearer): TypedHeader<Authorization<Bearer>>,
    Path(id): Path<Uuid>,
) -> ApiResult<()> {
    let user = authed(&state, &bearer).await?;
    let doc = state.store.get_document(id).await?;
    let room = state.store.get_room(doc.room_id).await?;
    if room.owner != user.id {
        return Err(forbidden("only the room owner can delete documents"));
    }
    state.hub.drop_document(doc.room_id, id);
    state.store.delete_document(id).await?;
    info!(document_id = %id, "document deleted");
    Ok(ok(()))
}
