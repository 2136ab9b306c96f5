//! End-to-end tests driving the server through a real WebSocket client.
//!
//! Every test binds to an ephemeral port on localhost and talks to the
//! server with a `tokio-tungstenite` client, in plaintext or with the
//! shared key loaded from the server's own key file.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use airsync_core::{events, Cipher, HandlerId, Message, MessageCodec, Server, ServerConfig};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct TestServer {
    server: Arc<Server>,
    addr: std::net::SocketAddr,
    key_path: PathBuf,
    icons_dir: PathBuf,
    connected: Arc<AtomicUsize>,
    disconnected: Arc<AtomicUsize>,
    handler_ids: Arc<Mutex<Vec<HandlerId>>>,
    task: tokio::task::JoinHandle<()>,
    _tmp: tempfile::TempDir,
}

async fn spawn_server(no_encrypt: bool) -> TestServer {
    let tmp = tempfile::tempdir().unwrap();
    let key_path = tmp.path().join("airsync.key");
    let icons_dir = tmp.path().join("icons");
    let config = ServerConfig {
        key_path: key_path.clone(),
        icon_cache_path: icons_dir.clone(),
        ..ServerConfig::default()
    };
    let server = Arc::new(Server::new(config).unwrap());

    server.on_event(events::MAC_INFO_REQUEST, |_device_info, _id| async move {
        Ok(Some(json!({
            "name": "PC",
            "type": "PC",
            "isPlus": true,
            "isPlusSubscription": true,
        })))
    });

    let connected = Arc::new(AtomicUsize::new(0));
    let handler_ids = Arc::new(Mutex::new(Vec::new()));
    {
        let connected = connected.clone();
        let handler_ids = handler_ids.clone();
        server.on_event(events::DEVICE_CONNECTED, move |_data, id| {
            let connected = connected.clone();
            let handler_ids = handler_ids.clone();
            async move {
                connected.fetch_add(1, Ordering::SeqCst);
                handler_ids.lock().unwrap().push(id);
                Ok(None)
            }
        });
    }
    let disconnected = Arc::new(AtomicUsize::new(0));
    {
        let disconnected = disconnected.clone();
        server.on_event(events::DEVICE_DISCONNECTED, move |_data, _id| {
            let disconnected = disconnected.clone();
            async move {
                disconnected.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
        });
    }

    let task = tokio::spawn({
        let server = server.clone();
        async move {
            server.start("127.0.0.1", 0, no_encrypt).await.unwrap();
        }
    });

    let addr = wait_for(|| server.local_addr()).await;

    TestServer {
        server,
        addr,
        key_path,
        icons_dir,
        connected,
        disconnected,
        handler_ids,
        task,
        _tmp: tmp,
    }
}

impl TestServer {
    /// Client-side codec sharing the server's key file.
    fn client_codec(&self, encrypted: bool) -> MessageCodec {
        let cipher = Arc::new(Cipher::from_key_file(&self.key_path).unwrap());
        MessageCodec::new(cipher, encrypted)
    }

    async fn connect(&self) -> WsClient {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", self.addr))
            .await
            .unwrap();
        ws
    }

    async fn latest_handler_id(&self) -> HandlerId {
        let handler_ids = self.handler_ids.clone();
        wait_for(move || handler_ids.lock().unwrap().last().copied()).await
    }
}

async fn wait_for<T>(mut condition: impl FnMut() -> Option<T>) -> T {
    for _ in 0..500 {
        if let Some(value) = condition() {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5s");
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    wait_for(move || condition().then_some(())).await
}

async fn send_msg(ws: &mut WsClient, codec: &MessageCodec, kind: &str, data: Value) {
    let text = codec.encode(&Message::new(kind, data)).unwrap();
    ws.send(WsMessage::Text(text)).await.unwrap();
}

async fn recv_msg(ws: &mut WsClient, codec: &MessageCodec) -> Message {
    loop {
        let frame = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .expect("websocket error");
        match frame {
            WsMessage::Text(text) => return codec.decode(&text).expect("undecodable frame"),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Asserts that nothing arrives for a little while.
async fn expect_silence(ws: &mut WsClient) {
    match tokio::time::timeout(Duration::from_millis(300), ws.next()).await {
        Err(_) => {}
        Ok(frame) => panic!("expected silence, got {frame:?}"),
    }
}

async fn expect_close_code(ws: &mut WsClient, code: u16) {
    loop {
        let frame = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for close")
            .expect("connection closed without a close frame")
            .expect("websocket error");
        match frame {
            WsMessage::Close(Some(close)) => {
                assert_eq!(u16::from(close.code), code);
                return;
            }
            WsMessage::Close(None) => panic!("close frame carried no code"),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => panic!("expected close, got {other:?}"),
        }
    }
}

async fn handshake(ws: &mut WsClient, codec: &MessageCodec) -> Message {
    send_msg(ws, codec, "device", json!({"name": "Pixel"})).await;
    let reply = recv_msg(ws, codec).await;
    assert_eq!(reply.kind, "macInfo");
    reply
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(ring::digest::digest(&ring::digest::SHA256, data).as_ref())
}

// --- handshake -------------------------------------------------------------

#[tokio::test]
async fn handshake_returns_enriched_mac_info() {
    let ts = spawn_server(true).await;
    let codec = ts.client_codec(false);
    let mut ws = ts.connect().await;

    let reply = handshake(&mut ws, &codec).await;
    assert_eq!(reply.data["name"], "PC");
    assert_eq!(reply.data["type"], "PC");
    assert_eq!(reply.data["isPlus"], true);
    assert_eq!(reply.data["isPlusSubscription"], true);
    assert_eq!(reply.data["savedAppPackages"], json!([]));

    wait_until(|| ts.connected.load(Ordering::SeqCst) == 1).await;
    assert_eq!(ts.server.get_state("device_info"), json!({"name": "Pixel"}));

    drop(ws);
    wait_until(|| ts.disconnected.load(Ordering::SeqCst) == 1).await;
    assert_eq!(ts.connected.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn encrypted_handshake_round_trip() {
    let ts = spawn_server(false).await;
    let codec = ts.client_codec(true);
    let mut ws = ts.connect().await;

    let reply = handshake(&mut ws, &codec).await;
    assert_eq!(reply.data["name"], "PC");
    assert_eq!(reply.data["savedAppPackages"], json!([]));
}

#[tokio::test]
async fn first_message_other_than_device_closes_1002() {
    let ts = spawn_server(true).await;
    let codec = ts.client_codec(false);
    let mut ws = ts.connect().await;

    send_msg(&mut ws, &codec, "status", json!({})).await;
    expect_close_code(&mut ws, 1002).await;

    wait_until(|| ts.disconnected.load(Ordering::SeqCst) == 1).await;
    assert_eq!(ts.connected.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_mac_info_handler_closes_1011() {
    // Build a server without the required handshake callback.
    let tmp = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        key_path: tmp.path().join("k.key"),
        icon_cache_path: tmp.path().join("icons"),
        ..ServerConfig::default()
    };
    let server = Arc::new(Server::new(config).unwrap());
    let task = tokio::spawn({
        let server = server.clone();
        async move { server.start("127.0.0.1", 0, true).await.unwrap() }
    });
    let addr = wait_for(|| server.local_addr()).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .unwrap();
    let codec = MessageCodec::new(
        Arc::new(Cipher::from_key_file(tmp.path().join("k.key")).unwrap()),
        false,
    );
    send_msg(&mut ws, &codec, "device", json!({"name": "Pixel"})).await;
    expect_close_code(&mut ws, 1011).await;

    server.stop().await;
    task.await.unwrap();
}

#[tokio::test]
async fn duplicate_device_message_is_ignored() {
    let ts = spawn_server(true).await;
    let codec = ts.client_codec(false);
    let mut ws = ts.connect().await;

    handshake(&mut ws, &codec).await;
    send_msg(&mut ws, &codec, "device", json!({"name": "Impostor"})).await;
    expect_silence(&mut ws).await;

    assert_eq!(ts.connected.load(Ordering::SeqCst), 1);
    assert_eq!(ts.server.get_state("device_info"), json!({"name": "Pixel"}));
}

// --- dispatch --------------------------------------------------------------

#[tokio::test]
async fn notification_lifecycle_updates_state() {
    let ts = spawn_server(true).await;
    let codec = ts.client_codec(false);
    let mut ws = ts.connect().await;
    handshake(&mut ws, &codec).await;

    send_msg(
        &mut ws,
        &codec,
        "notification",
        json!({"id": "n1", "app": "X", "title": "T"}),
    )
    .await;
    wait_until(|| {
        ts.server.get_state("notifications")
            == json!({"n1": {"id": "n1", "app": "X", "title": "T"}})
    })
    .await;

    send_msg(
        &mut ws,
        &codec,
        "notificationUpdate",
        json!({"id": "n1", "dismissed": true}),
    )
    .await;
    wait_until(|| ts.server.get_state("notifications") == json!({})).await;
}

#[tokio::test]
async fn unknown_message_type_is_tolerated() {
    let ts = spawn_server(true).await;
    let codec = ts.client_codec(false);
    let mut ws = ts.connect().await;
    handshake(&mut ws, &codec).await;

    send_msg(&mut ws, &codec, "somethingNew", json!({"x": 1})).await;
    // The connection survives and keeps dispatching.
    send_msg(&mut ws, &codec, "status", json!({"battery": {"level": 9}})).await;
    wait_until(|| ts.server.get_state("status") == json!({"battery": {"level": 9}})).await;
}

#[tokio::test]
async fn undecryptable_frame_is_dropped_not_fatal() {
    let ts = spawn_server(false).await;
    let codec = ts.client_codec(true);
    let mut ws = ts.connect().await;

    // Garbage first: logged and dropped, the connection stays open.
    ws.send(WsMessage::Text("complete garbage".into())).await.unwrap();
    let reply = handshake(&mut ws, &codec).await;
    assert_eq!(reply.data["name"], "PC");
}

#[tokio::test]
async fn mac_media_control_echoes_response() {
    let ts = spawn_server(true).await;
    let codec = ts.client_codec(false);
    let mut ws = ts.connect().await;
    handshake(&mut ws, &codec).await;

    send_msg(&mut ws, &codec, "macMediaControl", json!({"action": "playPause"})).await;
    let reply = recv_msg(&mut ws, &codec).await;
    assert_eq!(reply.kind, "macMediaControlResponse");
    assert_eq!(reply.data, json!({"action": "playPause", "success": true}));
}

// --- send / broadcast ------------------------------------------------------

#[tokio::test]
async fn broadcast_reaches_only_authenticated_connections() {
    let ts = spawn_server(true).await;
    let codec = ts.client_codec(false);

    let mut authed = ts.connect().await;
    handshake(&mut authed, &codec).await;
    let mut silent = ts.connect().await;

    ts.server
        .broadcast(Message::new("macUpdate", json!({"tick": 1})))
        .await;

    let received = recv_msg(&mut authed, &codec).await;
    assert_eq!(received.kind, "macUpdate");
    expect_silence(&mut silent).await;
}

#[tokio::test]
async fn targeted_send_reaches_authenticated_handler() {
    let ts = spawn_server(true).await;
    let codec = ts.client_codec(false);
    let mut ws = ts.connect().await;
    handshake(&mut ws, &codec).await;
    let id = ts.latest_handler_id().await;

    ts.server
        .send(id, Message::new("macUpdate", json!({"hello": true})))
        .await;
    let received = recv_msg(&mut ws, &codec).await;
    assert_eq!(received.kind, "macUpdate");
    assert_eq!(received.data, json!({"hello": true}));
}

#[tokio::test]
async fn send_to_dead_handler_is_dropped() {
    let ts = spawn_server(true).await;
    let codec = ts.client_codec(false);
    let mut ws = ts.connect().await;
    handshake(&mut ws, &codec).await;
    let id = ts.latest_handler_id().await;

    drop(ws);
    wait_until(|| ts.disconnected.load(Ordering::SeqCst) == 1).await;

    // Logged warning, no panic, no effect.
    ts.server.send(id, Message::new("macUpdate", json!({}))).await;
}

// --- file transfer ---------------------------------------------------------

#[tokio::test]
async fn outgoing_transfer_round_trip() {
    let ts = spawn_server(true).await;
    let codec = ts.client_codec(false);
    let mut ws = ts.connect().await;
    handshake(&mut ws, &codec).await;
    let id = ts.latest_handler_id().await;

    // 150 000 bytes over 65 536-byte chunks: indices 0, 1, 2.
    let payload: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    std::io::Write::write_all(&mut file, &payload).unwrap();

    let sender = tokio::spawn({
        let server = ts.server.clone();
        let path = file.path().to_owned();
        async move { server.send_file(path, id).await }
    });

    let init = recv_msg(&mut ws, &codec).await;
    assert_eq!(init.kind, "fileTransferInit");
    assert_eq!(init.data["size"], 150_000);
    assert_eq!(init.data["mime"], "application/octet-stream");
    assert_eq!(init.data["checksum"], json!(sha256_hex(&payload)));
    let transfer_id = init.data["id"].as_str().unwrap().to_owned();

    let mut received = Vec::new();
    for expected_index in 0..3u64 {
        let chunk = recv_msg(&mut ws, &codec).await;
        assert_eq!(chunk.kind, "fileChunk");
        assert_eq!(chunk.data["id"].as_str().unwrap(), transfer_id);
        assert_eq!(chunk.data["index"], json!(expected_index));
        received
            .extend(BASE64.decode(chunk.data["chunk"].as_str().unwrap().as_bytes()).unwrap());
        send_msg(
            &mut ws,
            &codec,
            "fileChunkAck",
            json!({"id": transfer_id, "index": expected_index}),
        )
        .await;
    }

    let complete = recv_msg(&mut ws, &codec).await;
    assert_eq!(complete.kind, "fileTransferComplete");
    assert_eq!(complete.data["size"], 150_000);
    assert_eq!(received, payload);

    send_msg(
        &mut ws,
        &codec,
        "transferVerified",
        json!({"id": transfer_id, "verified": true}),
    )
    .await;
    sender.await.unwrap();
}

#[tokio::test]
async fn incoming_transfer_checksum_mismatch_reports_unverified() {
    let ts = spawn_server(true).await;
    let completed: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
    {
        let completed = completed.clone();
        ts.server
            .on_event(events::FILE_TRANSFER_COMPLETE, move |data, _id| {
                let completed = completed.clone();
                async move {
                    *completed.lock().unwrap() = Some(data);
                    Ok(None)
                }
            });
    }

    let codec = ts.client_codec(false);
    let mut ws = ts.connect().await;
    handshake(&mut ws, &codec).await;

    let bogus = "deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef";
    send_msg(
        &mut ws,
        &codec,
        "fileTransferInit",
        json!({"id": "t1", "name": "f.txt", "size": 3, "mime": "text/plain", "checksum": bogus}),
    )
    .await;
    send_msg(
        &mut ws,
        &codec,
        "fileChunk",
        json!({"id": "t1", "index": 0, "chunk": BASE64.encode(b"abc")}),
    )
    .await;
    send_msg(
        &mut ws,
        &codec,
        "fileTransferComplete",
        json!({"id": "t1", "name": "f.txt", "size": 3, "checksum": bogus}),
    )
    .await;

    let reply = recv_msg(&mut ws, &codec).await;
    assert_eq!(reply.kind, "transferVerified");
    assert_eq!(reply.data, json!({"id": "t1", "verified": false}));

    let payload = wait_for(|| completed.lock().unwrap().clone()).await;
    assert_eq!(payload["verified"], false);
    let temp_path = PathBuf::from(payload["temp_path"].as_str().unwrap());
    assert_eq!(std::fs::read(&temp_path).unwrap(), b"abc");
    std::fs::remove_file(temp_path).unwrap();
}

#[tokio::test]
async fn incoming_transfer_matching_checksum_verifies() {
    let ts = spawn_server(true).await;
    let completed: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
    {
        let completed = completed.clone();
        ts.server
            .on_event(events::FILE_TRANSFER_COMPLETE, move |data, _id| {
                let completed = completed.clone();
                async move {
                    *completed.lock().unwrap() = Some(data);
                    Ok(None)
                }
            });
    }

    let codec = ts.client_codec(false);
    let mut ws = ts.connect().await;
    handshake(&mut ws, &codec).await;

    let checksum = sha256_hex(b"abc");
    send_msg(
        &mut ws,
        &codec,
        "fileTransferInit",
        json!({"id": "t2", "name": "ok.txt", "size": 3, "checksum": checksum}),
    )
    .await;
    send_msg(
        &mut ws,
        &codec,
        "fileChunk",
        json!({"id": "t2", "index": 0, "chunk": BASE64.encode(b"abc")}),
    )
    .await;
    send_msg(
        &mut ws,
        &codec,
        "fileTransferComplete",
        json!({"id": "t2", "name": "ok.txt", "size": 3, "checksum": checksum}),
    )
    .await;

    let reply = recv_msg(&mut ws, &codec).await;
    assert_eq!(reply.data, json!({"id": "t2", "verified": true}));

    let payload = wait_for(|| completed.lock().unwrap().clone()).await;
    assert_eq!(payload["verified"], true);
    std::fs::remove_file(payload["temp_path"].as_str().unwrap()).unwrap();
}

#[tokio::test]
async fn incoming_transfer_null_checksum_sentinel_verifies() {
    let ts = spawn_server(true).await;
    let codec = ts.client_codec(false);
    let mut ws = ts.connect().await;
    handshake(&mut ws, &codec).await;

    send_msg(
        &mut ws,
        &codec,
        "fileTransferInit",
        json!({"id": "t3", "name": "n.bin", "size": 3, "checksum": "null"}),
    )
    .await;
    send_msg(
        &mut ws,
        &codec,
        "fileChunk",
        json!({"id": "t3", "index": 0, "chunk": BASE64.encode(b"xyz")}),
    )
    .await;

    let captured: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
    {
        let captured = captured.clone();
        ts.server
            .on_event(events::FILE_TRANSFER_COMPLETE, move |data, _id| {
                let captured = captured.clone();
                async move {
                    *captured.lock().unwrap() = Some(data);
                    Ok(None)
                }
            });
    }
    send_msg(
        &mut ws,
        &codec,
        "fileTransferComplete",
        json!({"id": "t3", "name": "n.bin", "size": 3, "checksum": "null"}),
    )
    .await;

    let reply = recv_msg(&mut ws, &codec).await;
    assert_eq!(reply.data, json!({"id": "t3", "verified": true}));
    let payload = wait_for(|| captured.lock().unwrap().clone()).await;
    std::fs::remove_file(payload["temp_path"].as_str().unwrap()).unwrap();
}

#[tokio::test]
async fn chunk_for_unknown_transfer_is_dropped() {
    let ts = spawn_server(true).await;
    let codec = ts.client_codec(false);
    let mut ws = ts.connect().await;
    handshake(&mut ws, &codec).await;

    send_msg(
        &mut ws,
        &codec,
        "fileChunk",
        json!({"id": "nope", "index": 0, "chunk": BASE64.encode(b"zz")}),
    )
    .await;
    // Still alive afterwards.
    send_msg(&mut ws, &codec, "status", json!({"ok": 1})).await;
    wait_until(|| ts.server.get_state("status") == json!({"ok": 1})).await;
}

// --- app icons -------------------------------------------------------------

#[tokio::test]
async fn app_icon_cache_is_write_once() {
    let ts = spawn_server(true).await;
    let codec = ts.client_codec(false);
    let mut ws = ts.connect().await;
    handshake(&mut ws, &codec).await;

    let png = b"\x89PNG fake icon bytes";
    let data_uri = format!("data:image/png;base64,{}", BASE64.encode(png));
    send_msg(
        &mut ws,
        &codec,
        "appIcons",
        json!({"com.x": {"name": "X", "systemApp": false, "listening": true, "icon": data_uri}}),
    )
    .await;

    let icon_path = ts.icons_dir.join("com.x.png");
    {
        let icon_path = icon_path.clone();
        wait_until(move || icon_path.exists()).await;
    }
    assert_eq!(std::fs::read(&icon_path).unwrap(), png);

    // Metadata is cached without the raw bytes.
    wait_until(|| {
        ts.server.get_state("app_icons")
            == json!({"com.x": {"name": "X", "systemApp": false, "listening": true}})
    })
    .await;

    // A second catalog with different bytes must not rewrite the file.
    let other_uri = format!("data:image/png;base64,{}", BASE64.encode(b"different"));
    send_msg(
        &mut ws,
        &codec,
        "appIcons",
        json!({
            "com.x": {"name": "X", "systemApp": false, "listening": true, "icon": other_uri},
            "com.marker": {"name": "M", "systemApp": true, "listening": false},
        }),
    )
    .await;
    wait_until(|| {
        ts.server.get_state("app_icons")["com.marker"] != Value::Null
    })
    .await;
    assert_eq!(std::fs::read(&icon_path).unwrap(), png);
}

#[tokio::test]
async fn app_icon_accepts_url_safe_unpadded_base64() {
    let ts = spawn_server(true).await;
    let codec = ts.client_codec(false);
    let mut ws = ts.connect().await;
    handshake(&mut ws, &codec).await;

    let bytes: Vec<u8> = vec![0xFF, 0xEF, 0xBE, 0x01, 0x02];
    let url_safe = BASE64
        .encode(&bytes)
        .replace('+', "-")
        .replace('/', "_")
        .trim_end_matches('=')
        .to_owned();
    send_msg(
        &mut ws,
        &codec,
        "appIcons",
        json!({"com.urlsafe": {"name": "U", "icon": url_safe}}),
    )
    .await;

    let icon_path = ts.icons_dir.join("com.urlsafe.png");
    {
        let icon_path = icon_path.clone();
        wait_until(move || icon_path.exists()).await;
    }
    assert_eq!(std::fs::read(&icon_path).unwrap(), bytes);
}

#[tokio::test]
async fn handshake_after_icons_lists_saved_packages() {
    let ts = spawn_server(true).await;
    let codec = ts.client_codec(false);
    let mut ws = ts.connect().await;
    handshake(&mut ws, &codec).await;

    send_msg(
        &mut ws,
        &codec,
        "appIcons",
        json!({"com.a": {"name": "A"}, "com.b": {"name": "B"}}),
    )
    .await;
    wait_until(|| ts.server.get_state("app_icons") != json!({})).await;
    drop(ws);
    wait_until(|| ts.disconnected.load(Ordering::SeqCst) == 1).await;

    let mut ws = ts.connect().await;
    let reply = handshake(&mut ws, &codec).await;
    let mut packages: Vec<String> = reply.data["savedAppPackages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_owned())
        .collect();
    packages.sort();
    assert_eq!(packages, vec!["com.a".to_owned(), "com.b".to_owned()]);
}

// --- lifecycle -------------------------------------------------------------

#[tokio::test]
async fn stop_closes_connections_and_unwinds_start() {
    let ts = spawn_server(true).await;
    let codec = ts.client_codec(false);
    let mut ws = ts.connect().await;
    handshake(&mut ws, &codec).await;

    ts.server.stop().await;
    ts.task.await.unwrap();

    wait_until(|| ts.disconnected.load(Ordering::SeqCst) == 1).await;
    assert!(ts.server.local_addr().is_none());
    assert!(
        tokio_tungstenite::connect_async(format!("ws://{}", ts.addr))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn pairing_uri_present_only_in_encrypted_mode() {
    let encrypted = spawn_server(false).await;
    let uri = encrypted.server.pairing_uri().unwrap();
    let uri = uri.to_string();
    assert!(uri.starts_with("airsync://"));
    assert!(uri.contains(&format!(":{}?key=", encrypted.addr.port())));
    let key_b64 = BASE64.encode(std::fs::read(&encrypted.key_path).unwrap());
    assert!(uri.ends_with(&key_b64));

    let plaintext = spawn_server(true).await;
    assert!(plaintext.server.pairing_uri().is_none());
}
