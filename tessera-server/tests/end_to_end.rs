//! End-to-end tests: real HTTP between the server transport and an
//! in-process server instance.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tessera_core::{
    Base, MemoryTransport, ReceiveOptions, SendOptions, ServerTransport,
    ServerTransportOptions, Transport, receive, send, serializer,
};
use tessera_server::{ServerConfig, ServerState};
use tokio::net::TcpListener;

async fn start_server(config: ServerConfig) -> (String, Arc<ServerState>) {
    let state = Arc::new(ServerState::new(config));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serve_state = state.clone();
    tokio::spawn(async move {
        let _ = tessera_server::serve(listener, serve_state).await;
    });
    (format!("http://{}", addr), state)
}

fn fast_options() -> ServerTransportOptions {
    ServerTransportOptions {
        flush_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

fn no_cache() -> SendOptions {
    SendOptions {
        use_default_cache: false,
        ..Default::default()
    }
}

fn graph_with_children(count: usize) -> Base {
    let mut root = Base::new("Model");
    root.set("name", "site").unwrap();
    for index in 0..count {
        let mut child = Base::new("Point");
        child.set("x", index as i64).unwrap();
        child.set("payload", "p".repeat(40)).unwrap();
        root.set(&format!("@child{}", index), child).unwrap();
    }
    root
}

#[tokio::test]
async fn test_send_receive_roundtrip_over_http() {
    let (url, _state) = start_server(ServerConfig::in_memory()).await;
    let root = graph_with_children(10);

    let remote: Arc<dyn Transport> = Arc::new(
        ServerTransport::with_options(&url, "job-1", None, fast_options()).unwrap(),
    );
    let sent = send(&root, vec![remote], no_cache()).await.unwrap();
    assert_eq!(sent.object_count, 11);

    // fresh transports on the receive side, nothing cached locally
    let remote: Arc<dyn Transport> = Arc::new(
        ServerTransport::with_options(&url, "job-1", None, fast_options()).unwrap(),
    );
    let local = Arc::new(MemoryTransport::new());
    let reported = Arc::new(std::sync::atomic::AtomicU64::new(0));
    let reported_clone = reported.clone();

    let received = receive(
        sent.root_id,
        Some(remote),
        Some(local.clone()),
        ReceiveOptions {
            on_total_children: Some(Arc::new(move |total| {
                reported_clone.store(total, Ordering::SeqCst);
            })),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(reported.load(Ordering::SeqCst), 11);
    assert_eq!(local.len().await, 11);

    let reserialized = serializer::Serializer::new().serialize(&received).unwrap();
    assert_eq!(reserialized.root_id, sent.root_id);
}

#[tokio::test]
async fn test_small_byte_cap_splits_into_multiple_requests() {
    let (url, state) = start_server(ServerConfig::in_memory()).await;
    let root = graph_with_children(30);

    let options = ServerTransportOptions {
        flush_interval: Duration::from_millis(10),
        max_part_bytes: 600,
        max_parts_per_request: 2,
        ..Default::default()
    };
    let remote: Arc<dyn Transport> =
        Arc::new(ServerTransport::with_options(&url, "job-caps", None, options).unwrap());

    let sent = send(&root, vec![remote], no_cache()).await.unwrap();
    assert_eq!(sent.object_count, 31);
    assert!(state.post_requests.load(Ordering::SeqCst) >= 2);

    // everything arrived despite the split
    let probe =
        ServerTransport::with_options(&url, "job-caps", None, fast_options()).unwrap();
    assert!(probe.get_object(sent.root_id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_wrong_token_fails_the_send() {
    let (url, _state) = start_server(ServerConfig {
        data_dir: None,
        auth_token: Some("secret".to_string()),
        verify_hashes: true,
    })
    .await;

    let unauthorized: Arc<dyn Transport> = Arc::new(
        ServerTransport::with_options(&url, "job-1", Some("wrong".to_string()), fast_options())
            .unwrap(),
    );
    let result = send(&graph_with_children(2), vec![unauthorized], no_cache()).await;
    let message = result.expect_err("send must fail without the right token").to_string();
    assert!(message.contains("401"), "unexpected error: {}", message);

    let authorized: Arc<dyn Transport> = Arc::new(
        ServerTransport::with_options(&url, "job-1", Some("secret".to_string()), fast_options())
            .unwrap(),
    );
    send(&graph_with_children(2), vec![authorized], no_cache())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_get_object_miss_is_none_not_an_error() {
    let (url, _state) = start_server(ServerConfig::in_memory()).await;
    let transport =
        ServerTransport::with_options(&url, "job-1", None, fast_options()).unwrap();
    let missing = tessera_core::ObjectId::from_data(b"absent");
    assert_eq!(transport.get_object(missing).await.unwrap(), None);
}

#[tokio::test]
async fn test_sqlite_backed_server_persists_streams() {
    let data_dir = tempfile::tempdir().unwrap();
    let (url, _state) = start_server(ServerConfig {
        data_dir: Some(data_dir.path().to_path_buf()),
        auth_token: None,
        verify_hashes: true,
    })
    .await;

    let remote: Arc<dyn Transport> = Arc::new(
        ServerTransport::with_options(&url, "durable", None, fast_options()).unwrap(),
    );
    let sent = send(&graph_with_children(3), vec![remote], no_cache())
        .await
        .unwrap();

    assert!(data_dir.path().join("streams").join("durable.db").exists());

    let probe = ServerTransport::with_options(&url, "durable", None, fast_options()).unwrap();
    assert!(probe.get_object(sent.root_id).await.unwrap().is_some());
}
