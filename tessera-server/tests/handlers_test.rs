//! Integration tests for the object store HTTP handlers.

use bytes::Bytes;
use http_body_util::BodyExt;
use std::sync::Arc;
use tessera_core::{Base, Serializer};
use tessera_server::{ServerConfig, ServerState, handlers};

const BOUNDARY: &str = "testboundary";

fn memory_state() -> Arc<ServerState> {
    Arc::new(ServerState::new(ServerConfig::in_memory()))
}

/// Build a multipart body holding one part with the given `[hash, json]`
/// pairs.
fn multipart_body(pairs: &[(String, String)]) -> (String, Vec<u8>) {
    let content_type = format!("multipart/form-data; boundary={}", BOUNDARY);
    let payload = serde_json::to_string(&pairs).unwrap();
    let body = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"batch-0\"; filename=\"batch-0\"\r\nContent-Type: application/json\r\n\r\n{payload}\r\n--{b}--\r\n",
        b = BOUNDARY,
        payload = payload,
    );
    (content_type, body.into_bytes())
}

async fn body_bytes(resp: hyper::Response<http_body_util::Full<Bytes>>) -> Vec<u8> {
    resp.into_body().collect().await.unwrap().to_bytes().to_vec()
}

fn sample_graph() -> tessera_core::Serialized {
    let mut child = Base::new("Point");
    child.set("x", 1).unwrap();
    let mut root = Base::new("Model");
    root.set("@child", child).unwrap();
    root.set("name", "roof").unwrap();
    Serializer::new().serialize(&root).unwrap()
}

#[tokio::test]
async fn test_upload_then_fetch_single() {
    let state = memory_state();
    let serialized = sample_graph();

    let pairs: Vec<(String, String)> = serialized
        .objects
        .iter()
        .map(|(id, json)| (id.to_hex(), json.clone()))
        .collect();
    let (content_type, body) = multipart_body(&pairs);

    let resp = handlers::handle_request(
        "POST",
        "/objects/job-1",
        Some(&content_type),
        None,
        &body,
        &state,
    )
    .await;
    assert_eq!(resp.status(), 200);
    let saved: serde_json::Value = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(saved["savedCount"], 2);

    let path = format!("/objects/job-1/{}/single", serialized.root_id.to_hex());
    let resp = handlers::handle_request("GET", &path, None, None, &[], &state).await;
    assert_eq!(resp.status(), 200);
    let fetched = String::from_utf8(body_bytes(resp).await).unwrap();
    assert_eq!(fetched, serialized.root_json);
}

#[tokio::test]
async fn test_fetch_missing_object_is_404() {
    let state = memory_state();
    let missing = tessera_core::ObjectId::from_data(b"missing");
    let path = format!("/objects/job-1/{}/single", missing.to_hex());
    let resp = handlers::handle_request("GET", &path, None, None, &[], &state).await;
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_upload_rejects_hash_mismatch() {
    let state = memory_state();
    let serialized = sample_graph();

    let bogus = tessera_core::ObjectId::from_data(b"not the content");
    let pairs = vec![(bogus.to_hex(), serialized.root_json.clone())];
    let (content_type, body) = multipart_body(&pairs);

    let resp = handlers::handle_request(
        "POST",
        "/objects/job-1",
        Some(&content_type),
        None,
        &body,
        &state,
    )
    .await;
    assert_eq!(resp.status(), 400);

    // the tampered batch left nothing behind
    let path = format!("/objects/job-1/{}/single", bogus.to_hex());
    let resp = handlers::handle_request("GET", &path, None, None, &[], &state).await;
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_stream_returns_root_and_closure() {
    let state = memory_state();
    let serialized = sample_graph();

    let pairs: Vec<(String, String)> = serialized
        .objects
        .iter()
        .map(|(id, json)| (id.to_hex(), json.clone()))
        .collect();
    let (content_type, body) = multipart_body(&pairs);
    let resp = handlers::handle_request(
        "POST",
        "/objects/job-1",
        Some(&content_type),
        None,
        &body,
        &state,
    )
    .await;
    assert_eq!(resp.status(), 200);

    let path = format!("/objects/job-1/{}", serialized.root_id.to_hex());
    let resp = handlers::handle_request("GET", &path, None, None, &[], &state).await;
    assert_eq!(resp.status(), 200);

    let text = String::from_utf8(body_bytes(resp).await).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);

    let (first_hash, first_json) = lines[0].split_once('\t').unwrap();
    assert_eq!(first_hash, serialized.root_id.to_hex());
    assert_eq!(first_json, serialized.root_json);
}

#[tokio::test]
async fn test_auth_token_is_enforced() {
    let state = Arc::new(ServerState::new(ServerConfig {
        data_dir: None,
        auth_token: Some("secret".to_string()),
        verify_hashes: true,
    }));
    let serialized = sample_graph();
    let path = format!("/objects/job-1/{}/single", serialized.root_id.to_hex());

    let resp = handlers::handle_request("GET", &path, None, None, &[], &state).await;
    assert_eq!(resp.status(), 401);

    let resp =
        handlers::handle_request("GET", &path, None, Some("Bearer wrong"), &[], &state).await;
    assert_eq!(resp.status(), 401);

    let resp =
        handlers::handle_request("GET", &path, None, Some("Bearer secret"), &[], &state).await;
    assert_eq!(resp.status(), 404); // authorized, object simply absent
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let state = memory_state();
    let resp = handlers::handle_request("GET", "/streams", None, None, &[], &state).await;
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_invalid_stream_id_rejected() {
    let state = memory_state();
    let (content_type, body) = multipart_body(&[]);
    let resp = handlers::handle_request(
        "POST",
        "/objects/..%2Fescape",
        Some(&content_type),
        None,
        &body,
        &state,
    )
    .await;
    assert_eq!(resp.status(), 400);
}
