//! End-to-end tests: WebSocket-backed stores talking through a live relay.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tandem_engine::{SyncOptions, SyncStore, User};
use tandem_server::config::Config;
use tandem_server::storage::FileSystemStorage;
use tandem_server::{create_app, AppState};
use tandem_websocket::{WebSocketConfig, WebSocketTransport};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Board {
    count: i64,
    #[serde(default)]
    title: String,
}

fn board() -> Board {
    Board {
        count: 0,
        title: String::new(),
    }
}

/// Start a relay on an ephemeral port, storing documents under `dir`.
async fn start_server(dir: &Path) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let config = Config {
        host: "127.0.0.1".to_string(),
        port: addr.port(),
        storage_path: dir.to_path_buf(),
    };
    let storage = Arc::new(FileSystemStorage::new(dir));
    let app = create_app(AppState::new(config, storage));

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn open_store(
    addr: SocketAddr,
    project: &str,
    user: &str,
) -> (SyncStore<Board>, Arc<WebSocketTransport>) {
    let config = WebSocketConfig::new(project).with_base_url(format!("ws://{}/ws", addr));
    let transport = Arc::new(WebSocketTransport::new(config).unwrap());
    let store = SyncStore::new(board(), SyncOptions::new(transport.clone(), User::new(user))).unwrap();
    (store, transport)
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn user_ids(store: &SyncStore<Board>) -> Vec<String> {
    store.users().into_iter().map(|u| u.id).collect()
}

#[tokio::test]
async fn health_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_server(dir.path()).await;

    let body: Value = reqwest::get(format!("http://{}/health", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn missing_user_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_server(dir.path()).await;

    let response = reqwest::get(format!("http://{}/ws/board", addr)).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn two_clients_stay_in_sync() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_server(dir.path()).await;

    let (alice, _alice_transport) = open_store(addr, "board", "alice");
    eventually(|| alice.is_ready()).await;

    let (bob, bob_transport) = open_store(addr, "board", "bob");
    eventually(|| bob.is_ready()).await;

    // Presence in both directions
    eventually(|| user_ids(&alice) == vec!["bob"]).await;
    eventually(|| user_ids(&bob) == vec!["alice"]).await;

    // Patches both ways
    alice.commit(|b| b.count += 1).unwrap();
    eventually(|| bob.state().count == 1).await;

    bob.commit(|b| b.title = "Roadmap".into()).unwrap();
    eventually(|| alice.state().title == "Roadmap").await;
    assert_eq!(alice.state().count, 1);

    // Profile updates
    bob.update_self(|me| me.set("name", "Bob")).unwrap();
    eventually(|| {
        alice
            .users()
            .first()
            .and_then(|u| u.get("name").cloned())
            .is_some_and(|name| name == "Bob")
    })
    .await;

    // Departure
    bob_transport.close();
    assert!(!bob.is_ready());
    eventually(|| alice.users().is_empty()).await;

    // The document was written out when bob left
    let file = dir.path().join("board.json");
    eventually(|| file.exists()).await;
    let stored: Value = serde_json::from_slice(&std::fs::read(&file).unwrap()).unwrap();
    assert_eq!(stored["count"], 1);
    assert_eq!(stored["title"], "Roadmap");
}

#[tokio::test]
async fn late_joiner_receives_current_document() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_server(dir.path()).await;

    let (first, _t1) = open_store(addr, "doc", "first");
    eventually(|| first.is_ready()).await;
    first.commit(|b| b.count = 42).unwrap();

    // Let the relay apply the patch before the second client asks for the document.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (late, _t2) = open_store(addr, "doc", "late");
    eventually(|| late.is_ready()).await;
    assert_eq!(late.state().count, 42);
}

#[tokio::test]
async fn projects_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_server(dir.path()).await;

    let (a, _ta) = open_store(addr, "one", "a");
    let (b, _tb) = open_store(addr, "two", "b");
    eventually(|| a.is_ready() && b.is_ready()).await;

    a.commit(|s| s.count = 5).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(b.state().count, 0);
    assert!(a.users().is_empty());
    assert!(b.users().is_empty());
}

#[tokio::test]
async fn stored_document_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("saved.json"), br#"{"count": 9, "title": "Kept"}"#).unwrap();
    let addr = start_server(dir.path()).await;

    let (store, _t) = open_store(addr, "saved", "a");
    eventually(|| store.is_ready()).await;
    assert_eq!(
        store.state(),
        Board {
            count: 9,
            title: "Kept".into()
        }
    );
}
