//! Admin HTTP surface: health, room/document CRUD, auth and the error
//! envelope.

use anyhow::Result;
use common::*;
use reqwest::StatusCode;
use serde_json::json;

pub mod common;

#[tokio::test]
async fn test_health_and_stats() -> Result<()> {
    let (client, _state) = start_server().await?;
    let (status, body) = client.get("api/health").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "ok");

    create_room(&client, "tok-alice", "stats").await;
    let (status, body) = client.get("api/stats").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["rooms"], 1);
    Ok(())
}

#[tokio::test]
async fn test_room_crud_and_ownership() -> Result<()> {
    let (client, _state) = start_server().await?;
    let room_id = create_room(&client, "tok-alice", "crud").await;

    let (status, body) = client.get("api/rooms").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (status, body) = client.get(&format!("api/rooms/{room_id}")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["name"], "crud");
    assert_eq!(body["data"]["owner"], "alice");
    assert_eq!(body["data"]["status"], "active");

    // Only the owner may rename.
    let (status, body) = client
        .put(
            &format!("api/rooms/{room_id}"),
            Some("tok-bob"),
            &json!({ "name": "hijacked" }),
        )
        .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "InsufficientPermissions");
    assert!(body["data"].is_null());

    let (status, body) = client
        .put(
            &format!("api/rooms/{room_id}"),
            Some("tok-alice"),
            &json!({ "name": "renamed" }),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["name"], "renamed");

    let (status, _body) = client
        .delete(&format!("api/rooms/{room_id}"), Some("tok-alice"))
        .await?;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = client.get(&format!("api/rooms/{room_id}")).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NotFound");
    Ok(())
}

#[tokio::test]
async fn test_invalid_token_is_unauthorized() -> Result<()> {
    let (client, _state) = start_server().await?;
    let (status, body) = client
        .post("api/rooms", Some("tok-nobody"), &json!({ "name": "x" }))
        .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "InvalidToken");
    Ok(())
}

#[tokio::test]
async fn test_document_crud() -> Result<()> {
    let (client, _state) = start_server().await?;
    let room_id = create_room(&client, "tok-alice", "docs").await;
    let doc_id = create_document(&client, "tok-alice", room_id, "src/lib.rs", "fn main() {}\n").await;

    let (status, body) = client.get(&format!("api/documents/{doc_id}")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["filePath"], "src/lib.rs");
    assert_eq!(body["data"]["version"], 0);
    assert_eq!(body["data"]["lineCount"], 2);

    let (status, body) = client
        .get(&format!("api/documents?roomId={room_id}"))
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    // Duplicate path in the same room is rejected.
    let (status, body) = client
        .post(
            "api/documents",
            Some("tok-alice"),
            &json!({ "roomId": room_id, "filePath": "src/lib.rs" }),
        )
        .await?;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "InvalidOperation");

    // Non-members cannot create documents; non-owners cannot delete them.
    let (status, body) = client
        .post(
            "api/documents",
            Some("tok-carol"),
            &json!({ "roomId": room_id, "filePath": "other.rs" }),
        )
        .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "InsufficientPermissions");

    let (status, _body) = client
        .delete(&format!("api/documents/{doc_id}"), Some("tok-bob"))
        .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _body) = client
        .delete(&format!("api/documents/{doc_id}"), Some("tok-alice"))
        .await?;
    assert_eq!(status, StatusCode::OK);
    let (status, _body) = client.get(&format!("api/documents/{doc_id}")).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn test_http_join_and_leave() -> Result<()> {
    let (client, _state) = start_server().await?;
    let room_id = create_room(&client, "tok-alice", "membership").await;

    let (status, body) = client
        .post(
            &format!("api/rooms/{room_id}/join"),
            Some("tok-bob"),
            &json!({ "displayName": "Bobby" }),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["role"], "editor");
    assert_eq!(body["data"]["displayName"], "Bobby");
    assert!(body["data"]["color"].as_str().unwrap().starts_with('#'));

    let (status, _body) = client
        .post(&format!("api/rooms/{room_id}/leave"), Some("tok-bob"), &json!({}))
        .await?;
    assert_eq!(status, StatusCode::OK);

    // Rooms can be archived, after which joining is denied.
    let (status, _body) = client
        .put(
            &format!("api/rooms/{room_id}"),
            Some("tok-alice"),
            &json!({ "status": "archived" }),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = client
        .post(&format!("api/rooms/{room_id}/join"), Some("tok-carol"), &json!({}))
        .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "AccessDenied");
    Ok(())
}
