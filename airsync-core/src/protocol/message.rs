// SPDX-FileCopyrightText: 2026 AirSync Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Wire Message Types
//!
//! Every frame carries one JSON object `{ "type": ..., "data": ... }`.
//! `data` stays an opaque [`Value`] for the payloads the core only caches
//! or forwards; the file-transfer control messages get typed structs so
//! ids and chunk indices are validated once at the edge.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Recognized values of the `type` discriminator.
pub mod msg_type {
    pub const DEVICE: &str = "device";
    pub const MAC_INFO: &str = "macInfo";
    pub const STATUS: &str = "status";
    pub const NOTIFICATION: &str = "notification";
    pub const NOTIFICATION_UPDATE: &str = "notificationUpdate";
    pub const NOTIFICATION_ACTION_RESPONSE: &str = "notificationActionResponse";
    pub const DISMISSAL_RESPONSE: &str = "dismissalResponse";
    pub const MEDIA_CONTROL_RESPONSE: &str = "mediaControlResponse";
    pub const MAC_MEDIA_CONTROL: &str = "macMediaControl";
    pub const MAC_MEDIA_CONTROL_RESPONSE: &str = "macMediaControlResponse";
    pub const APP_ICONS: &str = "appIcons";
    pub const CLIPBOARD_UPDATE: &str = "clipboardUpdate";
    pub const FILE_TRANSFER_INIT: &str = "fileTransferInit";
    pub const FILE_CHUNK: &str = "fileChunk";
    pub const FILE_CHUNK_ACK: &str = "fileChunkAck";
    pub const FILE_TRANSFER_COMPLETE: &str = "fileTransferComplete";
    pub const TRANSFER_VERIFIED: &str = "transferVerified";
}

/// One message on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Type discriminator; unknown values are tolerated.
    #[serde(rename = "type")]
    pub kind: String,
    /// Payload whose shape depends on `kind`; defaults to `{}`.
    #[serde(default = "empty_object")]
    pub data: Value,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl Message {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Message {
            kind: kind.into(),
            data,
        }
    }
}

/// One base64 chunk of a file transfer.
#[derive(Debug, Clone, Deserialize)]
pub struct FileChunk {
    pub id: String,
    pub index: u64,
    pub chunk: String,
}

/// Peer acknowledgment of one chunk index.
#[derive(Debug, Clone, Deserialize)]
pub struct FileChunkAck {
    pub id: String,
    pub index: u64,
}

/// Terminal verification verdict for an outgoing transfer.
#[derive(Debug, Clone, Deserialize)]
pub struct TransferVerified {
    pub id: String,
    #[serde(default)]
    pub verified: bool,
}
