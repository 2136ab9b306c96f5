// SPDX-FileCopyrightText: 2026 AirSync Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! AirSync Server
//!
//! Accept loop and public API surface: event registration, targeted and
//! broadcast sends, outgoing file transfers and the pairing URI. One task
//! is spawned per inbound connection; the handler registry tracks live
//! connections and the `device_disconnected` event fires exactly once per
//! connection, from the accept wrapper.

pub mod events;
mod handler;
mod transfer;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::collab::{ServiceAdvertisement, FALLBACK_MIME, SERVICE_TYPE};
use crate::config::ServerConfig;
use crate::crypto::Cipher;
use crate::pairing::{local_ipv4, PairingUri};
use crate::protocol::{Message, MessageCodec};
use crate::state::DeviceState;

use events::EventRegistry;
use handler::ConnectionHandler;

pub use events::{EventCallbackError, EventOutcome};
pub use transfer::TransferError;

/// Maximum size of one inbound WebSocket message.
const MAX_FRAME_BYTES: usize = 100 * 1024 * 1024;

/// Aggregate deadline for one broadcast fan-out.
const BROADCAST_TIMEOUT: Duration = Duration::from_secs(5);

/// Opaque identifier of a live connection, unique within a server
/// lifetime. Surfaced to every event callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(Uuid);

impl HandlerId {
    pub(crate) fn new() -> Self {
        HandlerId(Uuid::new_v4())
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Server error types. Only startup failures surface here; message-level
/// errors are logged and absorbed.
#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("cipher error: {0}")]
    Cipher(#[from] crate::crypto::CipherError),

    #[error("failed to create icon cache directory {path}: {source}")]
    IconCacheDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// The AirSync server core.
///
/// All methods take `&self`; wrap the server in an [`Arc`] to drive
/// `start` from one task and the send/stop API from others.
pub struct Server {
    config: ServerConfig,
    cipher: Arc<Cipher>,
    state: Arc<DeviceState>,
    registry: Arc<EventRegistry>,
    handlers: Arc<tokio::sync::Mutex<HashMap<HandlerId, Arc<ConnectionHandler>>>>,
    shutdown: Notify,
    running: AtomicBool,
    no_encrypt: AtomicBool,
    local_ip: IpAddr,
    local_addr: std::sync::Mutex<Option<SocketAddr>>,
}

impl Server {
    /// Builds a server: loads (or creates) the key file and the icon
    /// cache directory. Both failures are fatal.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let cipher = Arc::new(Cipher::from_key_file(&config.key_path)?);
        std::fs::create_dir_all(&config.icon_cache_path).map_err(|source| {
            ServerError::IconCacheDir {
                path: config.icon_cache_path.clone(),
                source,
            }
        })?;
        let local_ip = local_ipv4();
        debug!("airsync server initialized");
        Ok(Server {
            config,
            cipher,
            state: Arc::new(DeviceState::new()),
            registry: Arc::new(EventRegistry::new()),
            handlers: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            shutdown: Notify::new(),
            running: AtomicBool::new(false),
            no_encrypt: AtomicBool::new(false),
            local_ip,
            local_addr: std::sync::Mutex::new(None),
        })
    }

    /// Registers the async callback for a named event, replacing any
    /// previous one. See [`events`] for the known names and payloads.
    pub fn on_event<F, Fut>(&self, event: &str, callback: F)
    where
        F: Fn(Value, HandlerId) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = EventOutcome> + Send + 'static,
    {
        self.registry.register(event, callback);
    }

    /// Binds, optionally advertises, and accepts connections until
    /// [`Server::stop`] is called. The encryption mode passed here is
    /// fixed for the whole run.
    pub async fn start(&self, host: &str, port: u16, no_encrypt: bool) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("server is already running");
            return Ok(());
        }
        if no_encrypt {
            warn!("ENCRYPTION DISABLED. This is for debugging only.");
        }
        self.no_encrypt.store(no_encrypt, Ordering::SeqCst);

        let listener = TcpListener::bind((host, port)).await.map_err(|source| {
            self.running.store(false, Ordering::SeqCst);
            ServerError::Bind {
                addr: format!("{host}:{port}"),
                source,
            }
        })?;
        let addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: format!("{host}:{port}"),
            source,
        })?;
        *self.local_addr.lock().unwrap() = Some(addr);
        info!("websocket server listening on {addr}");

        if self.config.discovery {
            self.start_discovery(addr.port()).await;
        }

        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        self.spawn_connection(&mut tasks, stream, peer, no_encrypt);
                        // Reap connections that have already finished.
                        while tasks.try_join_next().is_some() {}
                    }
                    Err(e) => error!("failed to accept connection: {e}"),
                },
            }
        }

        drop(listener);
        self.close_all(CloseCode::Normal, "server shutting down").await;
        while tasks.join_next().await.is_some() {}
        if self.config.discovery {
            self.stop_discovery().await;
        }
        *self.local_addr.lock().unwrap() = None;
        self.running.store(false, Ordering::SeqCst);
        info!("airsync server has stopped");
        Ok(())
    }

    fn spawn_connection(
        &self,
        tasks: &mut JoinSet<()>,
        stream: tokio::net::TcpStream,
        peer: SocketAddr,
        no_encrypt: bool,
    ) {
        let codec = MessageCodec::new(self.cipher.clone(), !no_encrypt);
        let state = self.state.clone();
        let registry = self.registry.clone();
        let handlers = self.handlers.clone();
        let icon_cache = self.config.icon_cache_path.clone();

        tasks.spawn(async move {
            let mut ws_config = WebSocketConfig::default();
            ws_config.max_message_size = Some(MAX_FRAME_BYTES);
            ws_config.max_frame_size = Some(MAX_FRAME_BYTES);

            let ws = match tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await
            {
                Ok(ws) => ws,
                Err(e) => {
                    error!("websocket handshake failed for {peer}: {e}");
                    return;
                }
            };

            let handler = Arc::new(ConnectionHandler::new(
                codec, state, registry.clone(), icon_cache, peer,
            ));
            let id = handler.id();
            handlers.lock().await.insert(id, handler.clone());

            handler.run(ws).await;

            let remaining = {
                let mut map = handlers.lock().await;
                map.remove(&id);
                map.len()
            };
            // Single fire site keeps this at exactly once per connection.
            registry
                .fire(events::DEVICE_DISCONNECTED, Value::Null, id)
                .await;
            info!("device disconnected: {peer} ({remaining} live connections)");
        });
    }

    /// Stops accepting, closes every live connection and lets `start`
    /// unwind: it drains the connection tasks (each runs its cleanup)
    /// and releases the discovery advertisement before returning.
    pub async fn stop(&self) {
        info!("shutting down server...");
        self.shutdown.notify_one();
        self.close_all(CloseCode::Normal, "server shutting down").await;
    }

    async fn close_all(&self, code: CloseCode, reason: &'static str) {
        let live: Vec<_> = self.handlers.lock().await.values().cloned().collect();
        for handler in live {
            handler.close(code, reason).await;
        }
    }

    /// Sends to one connection iff it exists and is authenticated.
    pub async fn send(&self, handler_id: HandlerId, msg: Message) {
        let target = self.handlers.lock().await.get(&handler_id).cloned();
        match target {
            Some(handler) if handler.is_authenticated() => handler.send(&msg).await,
            _ => warn!(
                "could not send message: handler {handler_id} not found or not authenticated"
            ),
        }
    }

    /// Concurrently sends to every authenticated connection, waiting at
    /// most five seconds in aggregate.
    pub async fn broadcast(&self, msg: Message) {
        let targets: Vec<_> = self
            .handlers
            .lock()
            .await
            .values()
            .filter(|handler| handler.is_authenticated())
            .cloned()
            .collect();
        if targets.is_empty() {
            return;
        }
        let msg = Arc::new(msg);
        let sends = targets.iter().map(|handler| {
            let handler = handler.clone();
            let msg = msg.clone();
            async move { handler.send(&msg).await }
        });
        if tokio::time::timeout(BROADCAST_TIMEOUT, futures_util::future::join_all(sends))
            .await
            .is_err()
        {
            error!("broadcast did not complete within {BROADCAST_TIMEOUT:?}");
        }
    }

    /// Pushes a file to one connection: stat, hash and MIME-probe the
    /// file, then run the chunked transfer. Failures are logged, never
    /// raised.
    pub async fn send_file(&self, file_path: impl AsRef<Path>, handler_id: HandlerId) {
        let path = file_path.as_ref();
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) => meta,
            Err(_) => {
                error!("cannot send file: {} does not exist", path.display());
                return;
            }
        };
        info!("preparing to send file: {} to {handler_id}", path.display());

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_owned());
        let size = meta.len();
        let mime = self.probe_mime(path).await;

        let hash_path = path.to_owned();
        let checksum =
            match tokio::task::spawn_blocking(move || transfer::hash_file_sync(&hash_path)).await {
                Ok(Ok(checksum)) => checksum,
                Ok(Err(e)) => {
                    error!("failed to read {} for hashing: {e}", path.display());
                    return;
                }
                Err(e) => {
                    error!("hashing task failed for {}: {e}", path.display());
                    return;
                }
            };

        let target = self.handlers.lock().await.get(&handler_id).cloned();
        let Some(handler) = target else {
            error!("cannot send file: no active handler with ID {handler_id}");
            return;
        };
        if let Err(e) = handler
            .start_outgoing_transfer(path, &name, size, &mime, &checksum)
            .await
        {
            error!("failed to complete file transfer: {e}");
        }
    }

    async fn probe_mime(&self, path: &Path) -> String {
        let Some(probe) = self.config.mime_probe.clone() else {
            return FALLBACK_MIME.to_owned();
        };
        let path = path.to_owned();
        match tokio::task::spawn_blocking(move || probe.probe(&path)).await {
            Ok(Some(mime)) => mime,
            Ok(None) => FALLBACK_MIME.to_owned(),
            Err(e) => {
                warn!("MIME probe failed: {e}");
                FALLBACK_MIME.to_owned()
            }
        }
    }

    /// Deep snapshot of one state slot.
    pub fn get_state(&self, key: &str) -> Value {
        self.state.get(key)
    }

    /// Deep snapshot of the whole state cache.
    pub fn state_snapshot(&self) -> Value {
        self.state.snapshot()
    }

    /// The address the listener is currently bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    /// The connection-bootstrap URI for QR display.
    ///
    /// Withheld (with an error log) while encryption is disabled, and
    /// unavailable before the listener is bound.
    pub fn pairing_uri(&self) -> Option<PairingUri> {
        if self.no_encrypt.load(Ordering::SeqCst) {
            error!("cannot build pairing URI: encryption is disabled");
            return None;
        }
        let addr = (*self.local_addr.lock().unwrap())?;
        Some(PairingUri::new(
            self.local_ip,
            addr.port(),
            self.cipher.key_base64(),
        ))
    }

    async fn start_discovery(&self, port: u16) {
        let Some(advertiser) = self.config.advertiser.clone() else {
            warn!("discovery enabled but no advertiser is configured");
            return;
        };
        info!("starting service discovery...");
        let service_name = hostname::get()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "airsync".to_owned());
        let advertisement = ServiceAdvertisement::airsync(service_name.clone(), self.local_ip, port);
        let result =
            tokio::task::spawn_blocking(move || advertiser.advertise(&advertisement)).await;
        match result {
            Ok(Ok(())) => info!(
                "service discovery active, advertising '{service_name}' on {SERVICE_TYPE}"
            ),
            Ok(Err(e)) => error!("failed to start service discovery: {e}"),
            Err(e) => error!("discovery task failed: {e}"),
        }
    }

    async fn stop_discovery(&self) {
        let Some(advertiser) = self.config.advertiser.clone() else {
            return;
        };
        info!("stopping service discovery...");
        match tokio::task::spawn_blocking(move || advertiser.release()).await {
            Ok(Ok(())) => info!("service discovery stopped"),
            Ok(Err(e)) => warn!("error while stopping service discovery: {e}"),
            Err(e) => warn!("discovery task failed: {e}"),
        }
    }
}
