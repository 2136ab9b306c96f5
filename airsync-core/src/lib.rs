// SPDX-FileCopyrightText: 2026 AirSync Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! AirSync Core Library
//!
//! Desktop-side server for the AirSync protocol: pairs with a mobile peer
//! over the LAN and exchanges device handshakes, notifications, media
//! status, clipboard updates, app-icon catalogs and bulk files over an
//! authenticated, AES-256-GCM encrypted WebSocket channel.
//!
//! # Basic usage
//!
//! ```ignore
//! use airsync_core::{events, Server, ServerConfig};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let server = Arc::new(Server::new(ServerConfig::default())?);
//!
//! // The mac_info_request handler is required.
//! server.on_event(events::MAC_INFO_REQUEST, |device_info, _handler_id| async move {
//!     println!("device {:?} requesting macInfo", device_info.get("name"));
//!     Ok(Some(json!({"name": "My PC", "type": "PC"})))
//! });
//!
//! server.on_event(events::NOTIFICATION, |data, _handler_id| async move {
//!     println!("[{}] {}", data["app"], data["title"]);
//!     Ok(None)
//! });
//!
//! if let Some(uri) = server.pairing_uri() {
//!     println!("scan to connect: {uri}");
//! }
//! server.start("0.0.0.0", 5297, false).await?;
//! ```

pub mod collab;
pub mod config;
pub mod crypto;
pub mod pairing;
pub mod protocol;
pub mod server;
pub mod state;

pub use collab::{
    DiscoveryAdvertiser, DiscoveryError, MimeProbe, ServiceAdvertisement, FALLBACK_MIME,
    SERVICE_TYPE,
};
pub use config::{ServerConfig, DEFAULT_HOST, DEFAULT_PORT};
pub use crypto::{Cipher, CipherError, SymmetricKey};
pub use pairing::PairingUri;
pub use protocol::{msg_type, CodecError, Message, MessageCodec};
pub use server::events;
pub use server::{
    EventCallbackError, EventOutcome, HandlerId, Server, ServerError, TransferError,
};
pub use state::DeviceState;
