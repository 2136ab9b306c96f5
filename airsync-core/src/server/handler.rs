// SPDX-FileCopyrightText: 2026 AirSync Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Connection Handler
//!
//! One handler per accepted WebSocket: it authenticates the peer with the
//! `device` handshake, dispatches typed messages to the state cache and
//! the event registry, and runs the chunked file-transfer protocol in both
//! directions. Dispatch is strictly sequential in arrival order; transfer
//! drivers and server-initiated sends share the write half behind a mutex.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::protocol::{msg_type, CodecError, FileChunk, FileChunkAck, Message, MessageCodec, TransferVerified};
use crate::state::DeviceState;

use super::events::{self, EventRegistry};
use super::transfer::{
    outgoing_channels, IncomingTransfer, OutgoingSignals, TransferError, TransferState,
    ACK_TIMEOUT, CHUNK_SIZE, VERIFY_TIMEOUT,
};
use super::HandlerId;

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;

/// Whether the read loop should keep going after a dispatched message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

pub(crate) struct ConnectionHandler {
    id: HandlerId,
    peer: SocketAddr,
    codec: MessageCodec,
    state: Arc<DeviceState>,
    registry: Arc<EventRegistry>,
    icon_cache: PathBuf,
    authenticated: AtomicBool,
    /// Write half; `None` once the connection is gone, making sends no-ops.
    sink: Mutex<Option<WsSink>>,
    /// Wakes the read loop after a server-initiated close.
    closed: Notify,
    /// In-flight transfers by transfer id.
    transfers: Mutex<HashMap<String, TransferState>>,
}

impl ConnectionHandler {
    pub(crate) fn new(
        codec: MessageCodec,
        state: Arc<DeviceState>,
        registry: Arc<EventRegistry>,
        icon_cache: PathBuf,
        peer: SocketAddr,
    ) -> Self {
        let id = HandlerId::new();
        debug!("handler {id} created for {peer}");
        ConnectionHandler {
            id,
            peer,
            codec,
            state,
            registry,
            icon_cache,
            authenticated: AtomicBool::new(false),
            sink: Mutex::new(None),
            closed: Notify::new(),
            transfers: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn id(&self) -> HandlerId {
        self.id
    }

    pub(crate) fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Reads the socket until it closes, then cleans up.
    pub(crate) async fn run(&self, ws: WebSocketStream<TcpStream>) {
        let (sink, mut stream) = ws.split();
        *self.sink.lock().await = Some(sink);
        info!("handler {}: new connection from {}", self.id, self.peer);

        loop {
            let frame = tokio::select! {
                frame = stream.next() => frame,
                _ = self.closed.notified() => break,
            };
            let Some(frame) = frame else { break };
            match frame {
                Ok(WsMessage::Text(text)) => {
                    if self.dispatch_text(&text).await == Flow::Stop {
                        break;
                    }
                }
                Ok(WsMessage::Close(_)) => {
                    info!("handler {}: connection from {} closed cleanly", self.id, self.peer);
                    break;
                }
                // tungstenite answers pings on the next write
                Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {}
                Ok(other) => {
                    debug!("handler {}: ignoring non-text frame: {:?}", self.id, other);
                }
                Err(e) => {
                    info!("handler {}: connection error: {}", self.id, e);
                    break;
                }
            }
        }

        self.teardown().await;
    }

    /// Serializes, frames and writes one message; write failures are
    /// logged, never raised, and a closed connection makes this a no-op.
    pub(crate) async fn send(&self, msg: &Message) {
        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return;
        };
        let text = match self.codec.encode(msg) {
            Ok(text) => text,
            Err(e) => {
                error!("handler {}: failed to encode message: {}", self.id, e);
                return;
            }
        };
        if let Err(e) = sink.send(WsMessage::Text(text)).await {
            warn!("handler {}: failed to send message: {}", self.id, e);
        }
    }

    /// Starts the close handshake with the given code. Later sends become
    /// no-ops; closing twice is harmless.
    pub(crate) async fn close(&self, code: CloseCode, reason: &'static str) {
        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return;
        };
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        if let Err(e) = sink.send(WsMessage::Close(Some(frame))).await {
            warn!("handler {}: error during graceful close: {}", self.id, e);
        }
        *guard = None;
        self.closed.notify_one();
    }

    async fn dispatch_text(&self, text: &str) -> Flow {
        let msg = match self.codec.decode(text) {
            Ok(msg) => msg,
            Err(CodecError::Cipher(_)) => {
                warn!(
                    "handler {}: dropping frame that failed decryption, is the client using encryption?",
                    self.id
                );
                return Flow::Continue;
            }
            Err(CodecError::Json(e)) => {
                let preview: String = text.chars().take(100).collect();
                warn!("handler {}: received invalid JSON ({e}): {preview}...", self.id);
                return Flow::Continue;
            }
        };
        self.dispatch(msg).await
    }

    async fn dispatch(&self, msg: Message) -> Flow {
        if !self.is_authenticated() && msg.kind != msg_type::DEVICE {
            warn!(
                "handler {}: protocol violation, first message was '{}'",
                self.id, msg.kind
            );
            self.close(CloseCode::Protocol, "first message must be 'device'")
                .await;
            return Flow::Stop;
        }

        match msg.kind.as_str() {
            msg_type::DEVICE => return self.handle_device(msg.data).await,
            msg_type::STATUS => self.handle_cached_event(msg.data, "status", events::STATUS).await,
            msg_type::NOTIFICATION => {
                self.handle_cached_event(msg.data, "notification", events::NOTIFICATION)
                    .await
            }
            msg_type::NOTIFICATION_UPDATE => {
                self.handle_cached_event(msg.data, "notificationUpdate", events::NOTIFICATION_UPDATE)
                    .await
            }
            msg_type::CLIPBOARD_UPDATE => {
                self.handle_cached_event(msg.data, "clipboardUpdate", events::CLIPBOARD_UPDATE)
                    .await
            }
            msg_type::NOTIFICATION_ACTION_RESPONSE => {
                debug!("handler {}: notification action response: {:?}", self.id, msg.data);
            }
            msg_type::DISMISSAL_RESPONSE => {
                debug!("handler {}: notification dismissal response: {:?}", self.id, msg.data);
            }
            msg_type::MEDIA_CONTROL_RESPONSE => {
                debug!("handler {}: media control response: {:?}", self.id, msg.data);
            }
            msg_type::MAC_MEDIA_CONTROL => self.handle_mac_media_control(msg.data).await,
            msg_type::APP_ICONS => self.handle_app_icons(msg.data).await,
            msg_type::FILE_TRANSFER_INIT => self.handle_file_transfer_init(msg.data).await,
            msg_type::FILE_CHUNK => self.handle_file_chunk(msg.data).await,
            msg_type::FILE_CHUNK_ACK => self.handle_file_chunk_ack(msg.data).await,
            msg_type::FILE_TRANSFER_COMPLETE => self.handle_file_transfer_complete(msg.data).await,
            msg_type::TRANSFER_VERIFIED => self.handle_transfer_verified(msg.data).await,
            unknown => {
                warn!("handler {}: received unknown message type '{}'", self.id, unknown);
            }
        }
        Flow::Continue
    }

    /// Handshake: cache the device info, authenticate, ask the host for
    /// the macInfo record and answer with it.
    async fn handle_device(&self, data: Value) -> Flow {
        if self.authenticated.load(Ordering::SeqCst) {
            warn!("handler {}: received duplicate 'device' message, ignoring", self.id);
            return Flow::Continue;
        }
        info!(
            "handler {}: device handshake received: {:?}",
            self.id,
            data.get("name")
        );
        self.state.set_device_info(data.clone());
        self.authenticated.store(true, Ordering::SeqCst);

        let mac_info = self
            .registry
            .fire(events::MAC_INFO_REQUEST, data, self.id)
            .await;
        let mut mac_info = match mac_info {
            Some(Value::Object(map)) if !map.is_empty() => map,
            _ => {
                error!(
                    "handler {}: 'mac_info_request' handler missing, failed or returned no data; closing",
                    self.id
                );
                self.close(CloseCode::Error, "failed to get macInfo").await;
                return Flow::Stop;
            }
        };

        let packages: Vec<Value> = self
            .state
            .app_icon_packages()
            .into_iter()
            .map(Value::String)
            .collect();
        mac_info.insert("savedAppPackages".to_owned(), Value::Array(packages));

        self.send(&Message::new(msg_type::MAC_INFO, Value::Object(mac_info)))
            .await;
        self.registry
            .fire(events::DEVICE_CONNECTED, Value::Null, self.id)
            .await;
        Flow::Continue
    }

    /// Common shape of the cache-then-notify message types.
    async fn handle_cached_event(&self, data: Value, state_key: &str, event: &str) {
        self.state.update(state_key, data.clone());
        self.registry.fire(event, data, self.id).await;
    }

    async fn handle_mac_media_control(&self, data: Value) {
        info!("handler {}: mac media control requested: {:?}", self.id, data);
        let action = data.get("action").cloned().unwrap_or(Value::Null);
        self.registry
            .fire(events::MAC_MEDIA_CONTROL, data, self.id)
            .await;
        self.send(&Message::new(
            msg_type::MAC_MEDIA_CONTROL_RESPONSE,
            json!({ "action": action, "success": true }),
        ))
        .await;
    }

    /// Caches icon bytes to disk (write-once) and the metadata to state.
    async fn handle_app_icons(&self, data: Value) {
        let Value::Object(entries) = data else {
            warn!("handler {}: appIcons payload is not an object", self.id);
            return;
        };
        info!(
            "handler {}: received appIcons message with {} icons",
            self.id,
            entries.len()
        );

        let mut metadata = Map::new();
        let mut cached = 0usize;
        for (package, icon_data) in &entries {
            metadata.insert(
                package.clone(),
                json!({
                    "name": icon_data.get("name").cloned().unwrap_or(Value::Null),
                    "systemApp": icon_data.get("systemApp").cloned().unwrap_or(Value::Null),
                    "listening": icon_data.get("listening").cloned().unwrap_or(Value::Null),
                }),
            );

            let Some(icon_b64) = icon_data.get("icon").and_then(Value::as_str) else {
                continue;
            };
            if icon_b64.is_empty() {
                continue;
            }
            // The cache is flat; a package name must not escape it.
            if package.contains('/') || package.contains('\\') || package.contains("..") {
                warn!(
                    "handler {}: refusing icon cache entry with unsafe package name {:?}",
                    self.id, package
                );
                continue;
            }
            match self.cache_icon(package, icon_b64).await {
                Ok(true) => cached += 1,
                Ok(false) => {}
                Err(e) => error!("failed to cache icon for {}: {}", package, e),
            }
        }
        info!("app icon caching complete, wrote {} new icons to cache", cached);

        self.state.update("appIcons", Value::Object(metadata.clone()));
        self.registry
            .fire(events::APP_ICONS, Value::Object(metadata), self.id)
            .await;
    }

    /// Writes `<icon_cache>/<package>.png` unless a non-empty file is
    /// already there. Returns whether a file was written.
    async fn cache_icon(&self, package: &str, raw: &str) -> io::Result<bool> {
        let icon_path = self.icon_cache.join(format!("{package}.png"));
        let occupied = match tokio::fs::metadata(&icon_path).await {
            Ok(meta) => meta.len() > 0,
            Err(_) => false,
        };
        if occupied {
            return Ok(false);
        }

        // Payloads arrive as data URIs in URL-safe base64 without padding.
        let encoded = raw.rsplit_once(',').map(|(_, b64)| b64).unwrap_or(raw);
        let mut normalized = encoded.trim().replace('-', "+").replace('_', "/");
        while normalized.len() % 4 != 0 {
            normalized.push('=');
        }
        let bytes = BASE64
            .decode(normalized.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        tokio::fs::create_dir_all(&self.icon_cache).await?;
        tokio::fs::write(&icon_path, &bytes).await?;
        Ok(true)
    }

    async fn handle_file_transfer_init(&self, data: Value) {
        let Some(tf_id) = data.get("id").and_then(Value::as_str).map(str::to_owned) else {
            warn!("handler {}: fileTransferInit without id", self.id);
            return;
        };
        match IncomingTransfer::open(data.clone()).await {
            Ok(transfer) => {
                self.transfers
                    .lock()
                    .await
                    .insert(tf_id, TransferState::Incoming(transfer));
                info!("handler {}: receiving file: {:?}", self.id, data.get("name"));
                self.registry
                    .fire(events::FILE_TRANSFER_INIT, data, self.id)
                    .await;
            }
            Err(e) => {
                error!(
                    "handler {}: failed to open spool file for transfer {}: {}",
                    self.id, tf_id, e
                );
            }
        }
    }

    async fn handle_file_chunk(&self, data: Value) {
        let chunk: FileChunk = match serde_json::from_value(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("handler {}: invalid fileChunk payload: {}", self.id, e);
                return;
            }
        };

        // Take the transfer out of the table so no lock is held across the
        // write; dispatch is sequential, nothing else can see the gap.
        let entry = self.transfers.lock().await.remove(&chunk.id);
        match entry {
            Some(TransferState::Incoming(mut transfer)) => {
                if let Err(e) = append_chunk(&mut transfer, &chunk.chunk).await {
                    error!(
                        "handler {}: failed to write file chunk for {}: {}",
                        self.id, chunk.id, e
                    );
                }
                self.transfers
                    .lock()
                    .await
                    .insert(chunk.id, TransferState::Incoming(transfer));
            }
            Some(other) => {
                warn!(
                    "handler {}: received chunk for outgoing transfer {}",
                    self.id, chunk.id
                );
                self.transfers.lock().await.insert(chunk.id, other);
            }
            None => {
                warn!(
                    "handler {}: received chunk for unknown transfer ID {}",
                    self.id, chunk.id
                );
            }
        }
    }

    async fn handle_file_chunk_ack(&self, data: Value) {
        let ack: FileChunkAck = match serde_json::from_value(data) {
            Ok(ack) => ack,
            Err(e) => {
                warn!("handler {}: invalid fileChunkAck payload: {}", self.id, e);
                return;
            }
        };
        let mut transfers = self.transfers.lock().await;
        match transfers.get_mut(&ack.id) {
            Some(TransferState::Outgoing(outgoing)) => match outgoing.acks.remove(&ack.index) {
                Some(signal) => {
                    let _ = signal.send(());
                }
                None => warn!(
                    "handler {}: received ack for unknown chunk index {}",
                    self.id, ack.index
                ),
            },
            _ => warn!(
                "handler {}: received ack for unknown transfer {}",
                self.id, ack.id
            ),
        }
    }

    async fn handle_file_transfer_complete(&self, mut data: Value) {
        let Some(tf_id) = data.get("id").and_then(Value::as_str).map(str::to_owned) else {
            warn!("handler {}: fileTransferComplete without id", self.id);
            return;
        };
        let entry = self.transfers.lock().await.remove(&tf_id);
        let transfer = match entry {
            Some(TransferState::Incoming(transfer)) => transfer,
            Some(other) => {
                warn!(
                    "handler {}: received complete for outgoing transfer {}",
                    self.id, tf_id
                );
                self.transfers.lock().await.insert(tf_id, other);
                return;
            }
            None => {
                warn!(
                    "handler {}: received complete for unknown transfer ID {}",
                    self.id, tf_id
                );
                return;
            }
        };

        let IncomingTransfer {
            meta: _,
            file,
            temp,
            digest,
        } = transfer;
        if let Some(mut file) = file {
            if let Err(e) = file.flush().await {
                error!("handler {}: failed to flush spool file for {}: {}", self.id, tf_id, e);
            }
        }

        let computed = hex::encode(digest.finish().as_ref());
        let declared = data.get("checksum").and_then(Value::as_str);
        // Some senders put the literal string "null" where they have no
        // checksum to declare.
        let verified = match declared {
            Some(doc) if !doc.is_empty() && doc != "null" => {
                if doc == computed {
                    info!("file checksum VERIFIED for {}: {}", tf_id, computed);
                    true
                } else {
                    warn!(
                        "file checksum MISMATCH for {}! declared: {}, got: {}",
                        tf_id, doc, computed
                    );
                    false
                }
            }
            _ => {
                info!("no checksum provided for {}, assuming verified", tf_id);
                true
            }
        };

        let spool_path = match temp.keep() {
            Ok(path) => path,
            Err(e) => {
                error!(
                    "handler {}: failed to keep spool file for {}: {}",
                    self.id, tf_id, e
                );
                return;
            }
        };

        info!(
            "handler {}: file transfer complete: {:?}",
            self.id,
            data.get("name")
        );
        if let Some(payload) = data.as_object_mut() {
            payload.insert(
                "temp_path".to_owned(),
                Value::String(spool_path.to_string_lossy().into_owned()),
            );
            payload.insert("verified".to_owned(), Value::Bool(verified));
        }
        self.registry
            .fire(events::FILE_TRANSFER_COMPLETE, data, self.id)
            .await;
        self.send(&Message::new(
            msg_type::TRANSFER_VERIFIED,
            json!({ "id": tf_id, "verified": verified }),
        ))
        .await;
    }

    async fn handle_transfer_verified(&self, data: Value) {
        let verdict: TransferVerified = match serde_json::from_value(data.clone()) {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!("handler {}: invalid transferVerified payload: {}", self.id, e);
                return;
            }
        };
        let mut transfers = self.transfers.lock().await;
        match transfers.get_mut(&verdict.id) {
            Some(TransferState::Outgoing(outgoing)) if outgoing.verified.is_some() => {
                info!(
                    "handler {}: peer reports verification for {}: {}",
                    self.id, verdict.id, verdict.verified
                );
                if let Some(signal) = outgoing.verified.take() {
                    let _ = signal.send(verdict.verified);
                }
            }
            _ => {
                info!(
                    "handler {}: file transfer verified by device: {:?}",
                    self.id, data
                );
            }
        }
    }

    /// Pushes a file to the peer: init, acked chunks in ascending index
    /// order, complete, then a best-effort wait for the peer's verdict.
    pub(crate) async fn start_outgoing_transfer(
        &self,
        path: &Path,
        name: &str,
        size: u64,
        mime: &str,
        checksum: &str,
    ) -> Result<(), TransferError> {
        let transfer_id = Uuid::new_v4().to_string();
        let total_chunks = size.div_ceil(CHUNK_SIZE as u64);
        let (transfer, signals) = outgoing_channels(total_chunks);
        self.transfers
            .lock()
            .await
            .insert(transfer_id.clone(), TransferState::Outgoing(transfer));
        info!(
            "handler {}: starting outgoing transfer {} ({}, {} chunks)",
            self.id, transfer_id, name, total_chunks
        );

        let result = self
            .drive_outgoing(&transfer_id, path, name, size, mime, checksum, total_chunks, signals)
            .await;

        self.transfers.lock().await.remove(&transfer_id);
        if let Err(e) = &result {
            error!(
                "handler {}: file transfer {} failed: {}",
                self.id, transfer_id, e
            );
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive_outgoing(
        &self,
        transfer_id: &str,
        path: &Path,
        name: &str,
        size: u64,
        mime: &str,
        checksum: &str,
        total_chunks: u64,
        mut signals: OutgoingSignals,
    ) -> Result<(), TransferError> {
        self.send(&Message::new(
            msg_type::FILE_TRANSFER_INIT,
            json!({
                "id": transfer_id,
                "name": name,
                "size": size,
                "mime": mime,
                "checksum": checksum,
            }),
        ))
        .await;

        let file = tokio::fs::File::open(path).await?;
        let mut reader = BufReader::new(file);
        let mut buf = vec![0u8; CHUNK_SIZE];

        for index in 0..total_chunks {
            let n = read_chunk(&mut reader, &mut buf).await?;
            let chunk_b64 = BASE64.encode(&buf[..n]);
            self.send(&Message::new(
                msg_type::FILE_CHUNK,
                json!({ "id": transfer_id, "index": index, "chunk": chunk_b64 }),
            ))
            .await;

            let ack = signals
                .acks
                .remove(&index)
                .expect("one ack signal exists per chunk index");
            match tokio::time::timeout(ACK_TIMEOUT, ack).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(TransferError::ConnectionClosed),
                Err(_) => return Err(TransferError::AckTimeout { index }),
            }
        }

        self.send(&Message::new(
            msg_type::FILE_TRANSFER_COMPLETE,
            json!({
                "id": transfer_id,
                "name": name,
                "size": size,
                "checksum": checksum,
            }),
        ))
        .await;

        match tokio::time::timeout(VERIFY_TIMEOUT, signals.verified).await {
            Ok(Ok(verified)) => {
                info!(
                    "handler {}: transfer {} verified by peer: {}",
                    self.id, transfer_id, verified
                );
            }
            Ok(Err(_)) => {
                info!(
                    "handler {}: connection closed before verification of {}",
                    self.id, transfer_id
                );
            }
            Err(_) => {
                error!(
                    "handler {}: timed out waiting for final 'transferVerified' message",
                    self.id
                );
            }
        }
        Ok(())
    }

    /// Releases every per-connection resource: the write half, incomplete
    /// incoming spool files (deleted by drop) and the signal senders of
    /// outgoing transfers (aborting their drivers).
    async fn teardown(&self) {
        *self.sink.lock().await = None;
        let mut transfers = self.transfers.lock().await;
        for (tf_id, transfer) in transfers.drain() {
            if let TransferState::Incoming(transfer) = transfer {
                warn!(
                    "cleaning up incomplete incoming file transfer: {tf_id} ({:?})",
                    transfer.meta.get("name")
                );
            }
        }
    }
}

/// Decodes and appends one chunk, folding it into the running digest.
async fn append_chunk(transfer: &mut IncomingTransfer, chunk_b64: &str) -> io::Result<()> {
    let bytes = BASE64
        .decode(chunk_b64.as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let Some(file) = transfer.file.as_mut() else {
        return Err(io::Error::new(io::ErrorKind::NotFound, "spool file already closed"));
    };
    file.write_all(&bytes).await?;
    transfer.digest.update(&bytes);
    Ok(())
}

/// Reads up to one chunk, returning how many bytes were filled.
async fn read_chunk(
    reader: &mut BufReader<tokio::fs::File>,
    buf: &mut [u8],
) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
