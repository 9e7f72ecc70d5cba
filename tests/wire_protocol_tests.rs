//! Black-box tests for the device wire protocol: everything here talks to a
//! live `ConnectionHandler`/`SyncEngine` over a real TCP socket, the way an
//! actual device client would, rather than calling engine methods directly.

use std::net::SocketAddr;
use std::sync::Arc;

use or3_sync::engine::auth::{Authorizer, InMemoryAuthorizer};
use or3_sync::engine::blob::{BlobGateway, FsBlobStore};
use or3_sync::engine::store::SyncStore;
use or3_sync::engine::SyncEngine;
use or3_sync::protocol::ConnectionHandler;
use or3_sync::types::Role;

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

/// Binds a listener on an ephemeral port and spawns one `ConnectionHandler`
/// per accepted connection, mirroring `Server::run`'s accept loop without
/// the GC/flush/rate-limit crons this set of tests has no need for.
async fn spawn_server(blob_dir: &std::path::Path) -> (SocketAddr, Arc<InMemoryAuthorizer>) {
    let authorizer = Arc::new(InMemoryAuthorizer::new());
    let blob_store = FsBlobStore::new(blob_dir.join("blobs")).unwrap();
    let blob = BlobGateway::new(b"test-secret".to_vec(), Box::new(blob_store));
    let engine = Arc::new(SyncEngine::new(
        Arc::new(SyncStore::new()),
        Arc::clone(&authorizer) as Arc<dyn Authorizer>,
        blob,
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => break,
            };
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                let handler = ConnectionHandler::new(stream, engine);
                let _ = handler.run().await;
            });
        }
    });

    (addr, authorizer)
}

/// A minimal device client: connects, sends `hello`, then lets the test
/// drive arbitrary RPCs as raw JSON and read back raw JSON responses.
struct DeviceClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: u64,
}

impl DeviceClient {
    async fn connect(addr: SocketAddr, user_id: &str, device_id: &str) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            next_id: 0,
        };
        let resp = client
            .call("hello", json!({"userId": user_id, "deviceId": device_id}))
            .await;
        assert_eq!(resp["ok"], true, "hello failed: {:?}", resp);
        client
    }

    async fn call(&mut self, rpc: &str, params: Value) -> Value {
        self.next_id += 1;
        let request_id = format!("req-{}", self.next_id);
        let mut line = json!({"rpc": rpc, "requestId": request_id, "params": params}).to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();

        let mut buf = String::new();
        self.reader.read_line(&mut buf).await.unwrap();
        let response: Value = serde_json::from_str(buf.trim_end()).unwrap();
        assert_eq!(response["requestId"], request_id);
        response
    }
}

fn put_op(op_id: &str, table: &str, pk: &str, payload: Value, clock: u64, device_id: &str) -> Value {
    json!({
        "op_id": op_id,
        "table_name": table,
        "operation": "put",
        "pk": pk,
        "payload": payload,
        "clock": clock,
        "hlc": format!("hlc-{}", clock),
        "device_id": device_id,
    })
}

fn delete_op(op_id: &str, table: &str, pk: &str, clock: u64, device_id: &str) -> Value {
    json!({
        "op_id": op_id,
        "table_name": table,
        "operation": "delete",
        "pk": pk,
        "payload": null,
        "clock": clock,
        "hlc": format!("hlc-{}", clock),
        "device_id": device_id,
    })
}

#[tokio::test]
async fn push_from_one_device_is_visible_to_another_via_pull() {
    let dir = TempDir::new().unwrap();
    let (addr, authorizer) = spawn_server(dir.path()).await;
    authorizer.set_role("ws1", "alice", Role::Editor);

    let mut phone = DeviceClient::connect(addr, "alice", "phone").await;
    let mut laptop = DeviceClient::connect(addr, "alice", "laptop").await;

    let push_resp = phone
        .call(
            "push",
            json!({
                "workspaceId": "ws1",
                "ops": [put_op("op-1", "kv", "key1", json!({"value": "hello"}), 1, "phone")],
            }),
        )
        .await;
    assert_eq!(push_resp["ok"], true);
    assert_eq!(push_resp["result"]["results"][0]["success"], true);

    let pull_resp = laptop
        .call("pull", json!({"workspaceId": "ws1", "cursor": 0, "limit": 50}))
        .await;
    assert_eq!(pull_resp["ok"], true);
    let changes = pull_resp["result"]["changes"].as_array().unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0]["pk"], "key1");
    assert_eq!(changes[0]["payload"]["value"], "hello");
    assert_eq!(pull_resp["result"]["hasMore"], false);
}

#[tokio::test]
async fn push_is_rejected_for_a_user_with_no_membership() {
    let dir = TempDir::new().unwrap();
    let (addr, _authorizer) = spawn_server(dir.path()).await;

    let mut client = DeviceClient::connect(addr, "mallory", "phone").await;
    let resp = client
        .call(
            "push",
            json!({
                "workspaceId": "ws1",
                "ops": [put_op("op-1", "kv", "key1", json!({"value": "hi"}), 1, "phone")],
            }),
        )
        .await;

    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"]["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn delete_then_pull_surfaces_a_tombstone_change() {
    let dir = TempDir::new().unwrap();
    let (addr, authorizer) = spawn_server(dir.path()).await;
    authorizer.set_role("ws1", "alice", Role::Editor);

    let mut client = DeviceClient::connect(addr, "alice", "phone").await;
    client
        .call(
            "push",
            json!({
                "workspaceId": "ws1",
                "ops": [put_op("op-1", "kv", "key1", json!({"value": "v1"}), 1, "phone")],
            }),
        )
        .await;
    let del_resp = client
        .call(
            "push",
            json!({
                "workspaceId": "ws1",
                "ops": [delete_op("op-2", "kv", "key1", 2, "phone")],
            }),
        )
        .await;
    assert_eq!(del_resp["result"]["results"][0]["success"], true);

    let pull_resp = client
        .call("pull", json!({"workspaceId": "ws1", "cursor": 0, "limit": 50}))
        .await;
    let changes = pull_resp["result"]["changes"].as_array().unwrap();
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[1]["op"], "delete");
    assert_eq!(changes[1]["payload"], Value::Null);
}

#[tokio::test]
async fn watch_returns_once_a_concurrent_push_lands() {
    let dir = TempDir::new().unwrap();
    let (addr, authorizer) = spawn_server(dir.path()).await;
    authorizer.set_role("ws1", "alice", Role::Editor);

    let mut watcher = DeviceClient::connect(addr, "alice", "laptop").await;
    let mut pusher = DeviceClient::connect(addr, "alice", "phone").await;

    let watch_task = tokio::spawn(async move {
        watcher
            .call(
                "watch",
                json!({"workspaceId": "ws1", "cursor": 0, "limit": 50, "idleTimeoutMs": 5_000}),
            )
            .await
    });

    // Give the watcher time to register and start waiting before we push.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    pusher
        .call(
            "push",
            json!({
                "workspaceId": "ws1",
                "ops": [put_op("op-1", "kv", "key1", json!({"value": "pushed"}), 1, "phone")],
            }),
        )
        .await;

    let watch_resp = tokio::time::timeout(std::time::Duration::from_secs(5), watch_task)
        .await
        .expect("watch did not return before the test timeout")
        .unwrap();
    let changes = watch_resp["result"]["changes"].as_array().unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0]["pk"], "key1");
}

#[tokio::test]
async fn connection_is_rejected_unless_hello_is_first() {
    let dir = TempDir::new().unwrap();
    let (addr, _authorizer) = spawn_server(dir.path()).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut line = json!({
        "rpc": "getServerVersion",
        "requestId": "req-1",
        "params": {"workspaceId": "ws1"},
    })
    .to_string();
    line.push('\n');
    write_half.write_all(line.as_bytes()).await.unwrap();

    let mut buf = String::new();
    reader.read_line(&mut buf).await.unwrap();
    let response: Value = serde_json::from_str(buf.trim_end()).unwrap();
    assert_eq!(response["ok"], false);
    assert_eq!(response["error"]["code"], "INVALID_PAYLOAD");
}

#[tokio::test]
async fn upload_url_commit_and_fetch_round_trip_over_the_wire() {
    let dir = TempDir::new().unwrap();
    let (addr, authorizer) = spawn_server(dir.path()).await;
    authorizer.set_role("ws1", "alice", Role::Editor);

    let mut client = DeviceClient::connect(addr, "alice", "phone").await;

    let upload_resp = client
        .call(
            "generateUploadUrl",
            json!({"workspaceId": "ws1", "hash": "deadbeef", "mimeType": "image/png", "sizeBytes": 3}),
        )
        .await;
    assert_eq!(upload_resp["ok"], true);
    assert!(upload_resp["result"]["url"].as_str().unwrap().contains('.'));

    let commit_resp = client
        .call(
            "commitUpload",
            json!({
                "workspaceId": "ws1",
                "hash": "deadbeef",
                "storageId": "deadbeef",
                "providerId": "local",
                "mimeType": "image/png",
                "sizeBytes": 3,
                "name": "pic.png",
                "kind": null,
                "width": null,
                "height": null,
                "pageCount": null,
            }),
        )
        .await;
    assert_eq!(commit_resp["ok"], true);

    let url_resp = client
        .call("getFileUrl", json!({"workspaceId": "ws1", "hash": "deadbeef"}))
        .await;
    assert_eq!(url_resp["ok"], true);
    assert!(url_resp["result"]["url"].is_string());
}
