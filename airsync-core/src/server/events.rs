// SPDX-FileCopyrightText: 2026 AirSync Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Event Registry
//!
//! Named async callbacks supplied by the host application. At most one
//! callback is registered per event name; registering again replaces the
//! previous one. Every callback receives the event payload and the id of
//! the connection that produced it; `device_connected` and
//! `device_disconnected` carry a null payload, and `mac_info_request`
//! receives the device-info payload and must return the macInfo record.
//!
//! A callback error is logged and otherwise ignored, except for
//! `mac_info_request`, whose failure closes the calling connection.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures_util::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, error};

use super::HandlerId;

/// Required handshake callback: `(device_info, handler_id) -> macInfo`.
pub const MAC_INFO_REQUEST: &str = "mac_info_request";
/// Fired once after a successful handshake.
pub const DEVICE_CONNECTED: &str = "device_connected";
/// Fired exactly once when a connection terminates.
pub const DEVICE_DISCONNECTED: &str = "device_disconnected";
/// Battery and media status payload.
pub const STATUS: &str = "status";
/// New or updated notification.
pub const NOTIFICATION: &str = "notification";
/// Notification update, typically a dismissal.
pub const NOTIFICATION_UPDATE: &str = "notificationUpdate";
/// App-icon metadata after a catalog message was cached.
pub const APP_ICONS: &str = "app_icons";
/// Clipboard payload pushed by the peer.
pub const CLIPBOARD_UPDATE: &str = "clipboardUpdate";
/// Media-control request aimed at this machine.
pub const MAC_MEDIA_CONTROL: &str = "macMediaControl";
/// Incoming file transfer announced.
pub const FILE_TRANSFER_INIT: &str = "fileTransferInit";
/// Incoming file transfer finished; payload carries `temp_path` and
/// `verified`.
pub const FILE_TRANSFER_COMPLETE: &str = "fileTransferComplete";

/// Error type event callbacks may return.
pub type EventCallbackError = Box<dyn std::error::Error + Send + Sync>;

/// What an event callback resolves to. Only `mac_info_request` is expected
/// to produce a value.
pub type EventOutcome = Result<Option<Value>, EventCallbackError>;

type StoredCallback = Arc<dyn Fn(Value, HandlerId) -> BoxFuture<'static, EventOutcome> + Send + Sync>;

/// Registry mapping event names to async callbacks.
#[derive(Default)]
pub struct EventRegistry {
    callbacks: RwLock<HashMap<String, StoredCallback>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        EventRegistry::default()
    }

    /// Registers `callback` for `event`, replacing any previous one.
    pub fn register<F, Fut>(&self, event: &str, callback: F)
    where
        F: Fn(Value, HandlerId) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = EventOutcome> + Send + 'static,
    {
        let stored: StoredCallback = Arc::new(move |data, id| Box::pin(callback(data, id)));
        let previous = self
            .callbacks
            .write()
            .unwrap()
            .insert(event.to_owned(), stored);
        if previous.is_some() {
            debug!("event handler for '{event}' replaced");
        }
    }

    /// Whether a callback is registered for `event`.
    pub fn is_registered(&self, event: &str) -> bool {
        self.callbacks.read().unwrap().contains_key(event)
    }

    /// Invokes the callback for `event`, if any.
    ///
    /// Returns the callback's value; a missing callback or a callback
    /// error both yield `None`. The lock is released before the await.
    pub async fn fire(&self, event: &str, data: Value, handler_id: HandlerId) -> Option<Value> {
        let callback = self.callbacks.read().unwrap().get(event).cloned()?;
        match callback(data, handler_id).await {
            Ok(value) => value,
            Err(e) => {
                error!("error in event handler for '{event}': {e}");
                None
            }
        }
    }
}
