//! Spool-file cleanup on abnormal connection termination.
//!
//! Kept in its own test binary: it observes `airsync_`-prefixed spool
//! files in the system temp directory, so it must not run alongside the
//! other transfer tests.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::SinkExt;
use serde_json::json;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use airsync_core::{events, Cipher, Message, MessageCodec, Server, ServerConfig};

fn spool_files() -> HashSet<PathBuf> {
    std::fs::read_dir(std::env::temp_dir())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("airsync_"))
        })
        .collect()
}

#[tokio::test]
async fn dropped_connection_removes_spool_files() {
    let tmp = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        key_path: tmp.path().join("airsync.key"),
        icon_cache_path: tmp.path().join("icons"),
        ..ServerConfig::default()
    };
    let server = Arc::new(Server::new(config).unwrap());
    server.on_event(events::MAC_INFO_REQUEST, |_data, _id| async move {
        Ok(Some(json!({"name": "PC", "type": "PC"})))
    });
    let inits = Arc::new(AtomicUsize::new(0));
    {
        let inits = inits.clone();
        server.on_event(events::FILE_TRANSFER_INIT, move |_data, _id| {
            let inits = inits.clone();
            async move {
                inits.fetch_add(1, Ordering::SeqCst);
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

    tokio::spawn({
        let server = server.clone();
        async move { server.start("127.0.0.1", 0, true).await.unwrap() }
    });
    let addr = loop {
        if let Some(addr) = server.local_addr() {
            break addr;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    let before = spool_files();

    let codec = MessageCodec::new(
        Arc::new(Cipher::from_key_file(tmp.path().join("airsync.key")).unwrap()),
        false,
    );
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .unwrap();
    let send = |kind: &str, data: serde_json::Value| {
        codec.encode(&Message::new(kind, data)).unwrap()
    };
    ws.send(WsMessage::Text(send("device", json!({"name": "Pixel"}))))
        .await
        .unwrap();
    ws.send(WsMessage::Text(send(
        "fileTransferInit",
        json!({"id": "t1", "name": "big.bin", "size": 1_000_000, "checksum": "null"}),
    )))
    .await
    .unwrap();
    ws.send(WsMessage::Text(send(
        "fileChunk",
        json!({"id": "t1", "index": 0, "chunk": BASE64.encode(vec![7u8; 4096])}),
    )))
    .await
    .unwrap();

    // Wait until the spool file exists, then kill the connection without
    // completing the transfer.
    for _ in 0..500 {
        if inits.load(Ordering::SeqCst) == 1 && spool_files().len() > before.len() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(spool_files().len() > before.len(), "spool file never appeared");
    drop(ws);

    for _ in 0..500 {
        if disconnected.load(Ordering::SeqCst) == 1 && spool_files().len() == before.len() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        spool_files(),
        before,
        "spool files must be removed on abnormal termination"
    );
}
