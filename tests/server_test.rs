//! Wire-level integration tests: framed protocol against a live server.

use std::sync::Arc;
use std::time::Duration;

use keyquarry::config::{ListenAddress, ServerConfig};
use keyquarry::network::{read_message, write_message, ProtocolServer, Request, RequestBody, Response};
use keyquarry::server::{build_state, AppState};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Start a full server (state, dispatcher, listener) on a random port.
async fn start_test_server(
    mutate: impl FnOnce(&mut ServerConfig),
) -> (Arc<AppState>, std::net::SocketAddr) {
    let mut config = ServerConfig {
        listen_address: ListenAddress::Tcp("127.0.0.1:0".to_string()),
        min_lock_duration: Duration::from_millis(10),
        privileged_client_id: Some("admin".to_string()),
        ..ServerConfig::default()
    };
    mutate(&mut config);

    let state = build_state(config).await.unwrap();

    let bus = state.kernel.bus().clone();
    let bus_token = state.shutdown.clone();
    tokio::spawn(async move { bus.run(bus_token).await });

    let server = ProtocolServer::bind(state.clone()).await.unwrap();
    let addr = server.local_addr().unwrap();
    let serve_token = state.shutdown.clone();
    tokio::spawn(async move {
        let _ = server.serve(serve_token).await;
    });

    (state, addr)
}

struct TestClient {
    stream: TcpStream,
    client_id: String,
    next_id: u64,
}

impl TestClient {
    async fn connect(addr: std::net::SocketAddr, client_id: &str) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            client_id: client_id.to_string(),
            next_id: 1,
        }
    }

    async fn send(&mut self, body: RequestBody) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let request = Request {
            id,
            client_id: self.client_id.clone(),
            body,
        };
        write_message(&mut self.stream, &request).await.unwrap();
        id
    }

    async fn recv(&mut self) -> Response {
        timeout(Duration::from_secs(2), read_message(&mut self.stream))
            .await
            .expect("response timed out")
            .unwrap()
            .expect("connection closed")
    }

    async fn call(&mut self, body: RequestBody) -> Response {
        let id = self.send(body).await;
        let response = self.recv().await;
        assert_eq!(response.id, id);
        response
    }
}

fn set_body(key: &str, value: &[u8]) -> RequestBody {
    RequestBody::Set {
        key: key.to_string(),
        value: value.to_vec(),
        content_type: None,
        lock_duration: None,
        lifespan: None,
    }
}

#[tokio::test]
async fn test_set_get_over_wire() {
    let (_state, addr) = start_test_server(|_| {}).await;
    let mut client = TestClient::connect(addr, "wire-client").await;

    let response = client.call(set_body("foo", b"bar")).await;
    assert!(response.ok, "{:?}", response.error);
    let result = response.result.unwrap();
    assert_eq!(result["is_new"], true);
    assert_eq!(result["version"], 1);

    let response = client
        .call(RequestBody::Get {
            key: "foo".to_string(),
        })
        .await;
    assert!(response.ok);
    // values travel base64-encoded
    assert_eq!(response.result.unwrap()["value"], "YmFy");

    let response = client.call(RequestBody::Stats).await;
    assert!(response.ok);
    assert_eq!(response.result.unwrap()["keys"], 1);
}

#[tokio::test]
async fn test_error_taxonomy_over_wire() {
    let (_state, addr) = start_test_server(|_| {}).await;
    let mut client = TestClient::connect(addr, "wire-client").await;

    let response = client
        .call(RequestBody::Get {
            key: "missing".to_string(),
        })
        .await;
    assert!(!response.ok);
    assert_eq!(response.error.unwrap().kind, "not_found");

    // a request without client metadata is rejected
    let mut anonymous = TestClient::connect(addr, "").await;
    let response = anonymous.call(RequestBody::Stats).await;
    assert!(!response.ok);
    assert_eq!(response.error.unwrap().kind, "invalid_argument");
}

#[tokio::test]
async fn test_foreign_lock_over_wire() {
    let (_state, addr) = start_test_server(|_| {}).await;
    let mut alice = TestClient::connect(addr, "alice").await;
    let mut bob = TestClient::connect(addr, "bob").await;

    assert!(alice.call(set_body("k", b"v")).await.ok);
    let response = alice
        .call(RequestBody::Lock {
            key: "k".to_string(),
            duration: "10s".to_string(),
            create_if_missing: false,
        })
        .await;
    assert!(response.ok);

    let response = bob.call(set_body("k", b"x")).await;
    assert!(!response.ok);
    assert_eq!(response.error.unwrap().kind, "locked");

    let response = bob
        .call(RequestBody::Unlock {
            key: "k".to_string(),
        })
        .await;
    assert_eq!(response.error.unwrap().kind, "locked");

    assert!(alice
        .call(RequestBody::Unlock {
            key: "k".to_string(),
        })
        .await
        .ok);
    assert!(bob.call(set_body("k", b"x")).await.ok);
}

#[tokio::test]
async fn test_watch_stream_over_wire() {
    let (_state, addr) = start_test_server(|_| {}).await;

    let mut watcher = TestClient::connect(addr, "watcher").await;
    let watch_id = watcher
        .send(RequestBody::WatchStream {
            keys: vec!["observed".to_string()],
            kinds: vec![],
            client_ids: vec![],
        })
        .await;
    let ack = watcher.recv().await;
    assert!(ack.ok);
    assert_eq!(ack.result.unwrap()["streaming"], true);

    let mut writer = TestClient::connect(addr, "writer").await;
    assert!(writer.call(set_body("observed", b"v1")).await.ok);
    assert!(writer.call(set_body("other", b"x")).await.ok);
    assert!(writer.call(set_body("observed", b"v2")).await.ok);

    let frame = watcher.recv().await;
    assert_eq!(frame.id, watch_id);
    let event = frame.result.unwrap();
    assert_eq!(event["key"], "observed");
    assert_eq!(event["kind"], "created");
    assert_eq!(event["client_id"], "writer");

    let frame = watcher.recv().await;
    let event = frame.result.unwrap();
    assert_eq!(event["key"], "observed");
    assert_eq!(event["kind"], "updated");
}

#[tokio::test]
async fn test_watch_key_value_over_wire() {
    let (_state, addr) = start_test_server(|_| {}).await;

    let mut watcher = TestClient::connect(addr, "watcher").await;
    watcher
        .send(RequestBody::WatchKeyValue {
            key: "kv".to_string(),
        })
        .await;
    assert!(watcher.recv().await.ok); // ack

    let mut writer = TestClient::connect(addr, "writer").await;
    assert!(writer.call(set_body("kv", b"payload")).await.ok);

    let frame = watcher.recv().await;
    let result = frame.result.unwrap();
    assert_eq!(result["key"], "kv");
    assert_eq!(result["kind"], "created");
    assert_eq!(result["version"], 1);
    // full tuple includes the value bytes
    assert_eq!(result["value"], "cGF5bG9hZA==");
}

#[tokio::test]
async fn test_privileged_admin_surface() {
    let (state, addr) = start_test_server(|_| {}).await;

    let mut plain = TestClient::connect(addr, "plain").await;
    let response = plain
        .call(RequestBody::Prune {
            prune_to: 0,
            ignore_keys: vec![],
        })
        .await;
    assert_eq!(response.error.unwrap().kind, "permission_denied");

    let response = plain.call(RequestBody::Shutdown).await;
    assert_eq!(response.error.unwrap().kind, "permission_denied");

    let mut admin = TestClient::connect(addr, "admin").await;
    assert!(admin.call(set_body("a", b"1")).await.ok);
    let response = admin
        .call(RequestBody::Prune {
            prune_to: 0,
            ignore_keys: vec![],
        })
        .await;
    assert!(response.ok);

    let response = admin.call(RequestBody::Shutdown).await;
    assert!(response.ok);
    // shutdown cancels the root token
    timeout(Duration::from_secs(1), state.shutdown.cancelled())
        .await
        .expect("shutdown token should fire");
}

#[tokio::test]
async fn test_readonly_and_register_over_wire() {
    let (_state, addr) = start_test_server(|_| {}).await;

    let mut client = TestClient::connect(addr, "someone").await;
    let response = client.call(RequestBody::Register).await;
    assert!(response.ok);
    assert_eq!(response.result.unwrap()["is_new"], true);

    let mut admin = TestClient::connect(addr, "admin").await;
    assert!(admin
        .call(RequestBody::SetReadOnly { enable: true })
        .await
        .ok);

    let response = client.call(set_body("k", b"v")).await;
    assert_eq!(response.error.unwrap().kind, "readonly");
    // privileged writes pass through readonly
    assert!(admin.call(set_body("k", b"v")).await.ok);

    assert!(admin
        .call(RequestBody::SetReadOnly { enable: false })
        .await
        .ok);
    assert!(client.call(set_body("k2", b"v")).await.ok);
}

#[tokio::test]
async fn test_lifespan_and_metrics_over_wire() {
    let (_state, addr) = start_test_server(|_| {}).await;
    let mut client = TestClient::connect(addr, "c1").await;

    let response = client
        .call(RequestBody::Set {
            key: "ttl".to_string(),
            value: b"v".to_vec(),
            content_type: None,
            lock_duration: None,
            lifespan: Some("50ms".to_string()),
        })
        .await;
    assert!(response.ok);

    let response = client
        .call(RequestBody::Exists {
            key: "ttl".to_string(),
        })
        .await;
    assert_eq!(response.result.unwrap()["exists"], true);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let response = client
        .call(RequestBody::Exists {
            key: "ttl".to_string(),
        })
        .await;
    assert_eq!(response.result.unwrap()["exists"], false);

    // the lifetime metric survives the expiry
    let response = client
        .call(RequestBody::GetKeyMetric {
            key: "ttl".to_string(),
        })
        .await;
    assert!(response.ok);
    assert_eq!(response.result.unwrap()["set_count"], 1);
}
