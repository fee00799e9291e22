use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use coedit_server::store::UserRecord;
use coedit_server::{ServerConfig, ServerState, server};
use futures::{SinkExt, StreamExt};
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// A test WebSocket client that sends and receives JSON frames.
pub struct JsonSocket(WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>);

impl JsonSocket {
    pub async fn send(&mut self, msg: &Value) {
        self.0.send(msg.to_string().into()).await.unwrap();
    }

    pub async fn recv(&mut self) -> Result<Value> {
        let msg = self
            .0
            .next()
            .await
            .ok_or_else(|| anyhow!("WebSocket closed"))??;
        let msg = msg.to_text().map_err(|_| anyhow!("non-string message"))?;
        Ok(serde_json::from_str(msg)?)
    }

    /// Receive one frame and assert its event name, returning the payload.
    pub async fn recv_event(&mut self, event: &str) -> Result<Value> {
        let msg = self.recv().await?;
        assert_eq!(msg["event"], event, "unexpected frame: {msg}");
        Ok(msg["payload"].clone())
    }

    pub async fn recv_closed(&mut self) -> Result<()> {
        loop {
            match self.0.next().await {
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(other)) => {
                    return Err(anyhow!("expected close, got {other:?}"));
                }
                Some(Err(_)) => return Ok(()),
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.0.close(None).await;
    }
}

pub struct TestClient {
    client: reqwest::Client,
    addr: SocketAddr,
}

impl TestClient {
    pub async fn start(state: Arc<ServerState>) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let router = server(state).layer(TraceLayer::new_for_http());
        tokio::spawn(axum::serve(listener, router).into_future());
        Ok(Self {
            client: reqwest::Client::new(),
            addr,
        })
    }

    pub async fn get(&self, path: &str) -> Result<(StatusCode, Value)> {
        let url = format!("http://{}/{}", self.addr, path);
        info!("GET {}", url);
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        Ok((status, resp.json().await?))
    }

    pub async fn post(&self, path: &str, token: Option<&str>, body: &Value) -> Result<(StatusCode, Value)> {
        self.send_json(reqwest::Method::POST, path, token, body).await
    }

    pub async fn put(&self, path: &str, token: Option<&str>, body: &Value) -> Result<(StatusCode, Value)> {
        self.send_json(reqwest::Method::PUT, path, token, body).await
    }

    pub async fn delete(&self, path: &str, token: Option<&str>) -> Result<(StatusCode, Value)> {
        self.send_json(reqwest::Method::DELETE, path, token, &Value::Null)
            .await
    }

    async fn send_json(
        &self,
        method: reqwest::Method,
        path: &str,
        token: Option<&str>,
        body: &Value,
    ) -> Result<(StatusCode, Value)> {
        let url = format!("http://{}/{}", self.addr, path);
        info!("{} {}", method, url);
        let mut req = self.client.request(method, &url);
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        if !body.is_null() {
            req = req.json(body);
        }
        let resp = req.send().await?;
        let status = resp.status();
        Ok((status, resp.json().await?))
    }

    pub async fn connect(&self) -> Result<JsonSocket> {
        let (socket, _response) =
            tokio_tungstenite::connect_async(format!("ws://{}/api/socket", self.addr))
                .await
                .unwrap();
        Ok(JsonSocket(socket))
    }
}

/// Start a server with default configuration and three seeded users.
pub async fn start_server() -> Result<(TestClient, Arc<ServerState>)> {
    start_server_with(ServerConfig::default()).await
}

/// Start a server with custom configuration and three seeded users.
pub async fn start_server_with(config: ServerConfig) -> Result<(TestClient, Arc<ServerState>)> {
    logging();
    let state = Arc::new(ServerState::new(config).await?);
    for (token, id, name) in [
        ("tok-alice", "alice", "Alice"),
        ("tok-bob", "bob", "Bob"),
        ("tok-carol", "carol", "Carol"),
    ] {
        state.store().insert_token(
            token,
            UserRecord {
                id: id.into(),
                name: name.into(),
            },
        );
    }
    let client = TestClient::start(state.clone()).await?;
    Ok((client, state))
}

/// Create a room over HTTP, returning its id.
pub async fn create_room(client: &TestClient, token: &str, name: &str) -> Uuid {
    let (status, body) = client
        .post("api/rooms", Some(token), &json!({ "name": name }))
        .await
        .unwrap();
    assert_eq!(status, StatusCode::OK, "{body}");
    serde_json::from_value(body["data"]["id"].clone()).unwrap()
}

/// Create a document over HTTP, returning its id.
pub async fn create_document(
    client: &TestClient,
    token: &str,
    room_id: Uuid,
    file_path: &str,
    content: &str,
) -> Uuid {
    let (status, body) = client
        .post(
            "api/documents",
            Some(token),
            &json!({ "roomId": room_id, "filePath": file_path, "content": content }),
        )
        .await
        .unwrap();
    assert_eq!(status, StatusCode::OK, "{body}");
    serde_json::from_value(body["data"]["id"].clone()).unwrap()
}

/// Join a room over an open socket, returning the `joined-room` payload.
pub async fn join_room(socket: &mut JsonSocket, room_id: Uuid, token: &str) -> Value {
    socket
        .send(&json!({
            "event": "join-room",
            "payload": { "roomId": room_id, "token": token },
            "requestId": "join-1",
        }))
        .await;
    socket.recv_event("joined-room").await.unwrap()
}

/// Payload for a `document-operation` frame with a fresh client id.
pub fn operation_frame(
    document_id: Uuid,
    base_version: u64,
    client_id: Uuid,
    seq_start: u64,
    ops: Value,
    request_id: &str,
) -> Value {
    json!({
        "event": "document-operation",
        "payload": {
            "documentId": document_id,
            "baseVersion": base_version,
            "clientId": client_id,
            "clientSequenceStart": seq_start,
            "ops": ops,
        },
        "requestId": request_id,
    })
}

pub fn logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coedit_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().without_time())
        .try_init()
        .ok();
}
