// SPDX-FileCopyrightText: 2026 AirSync Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Device State Cache
//!
//! Thread-safe cache of the last known state of the connected device, so
//! the host application can query battery, media or notification data
//! without polling the phone. Reads hand out owned copies taken under the
//! lock; mutating a returned value never touches the cache.

use std::sync::Mutex;

use serde_json::{Map, Value};
use tracing::{debug, info};

fn empty_object() -> Value {
    Value::Object(Map::new())
}

#[derive(Debug)]
struct Slots {
    device_info: Value,
    status: Value,
    notifications: Map<String, Value>,
    app_icons: Map<String, Value>,
    clipboard: Value,
}

impl Default for Slots {
    fn default() -> Self {
        Slots {
            device_info: empty_object(),
            status: empty_object(),
            notifications: Map::new(),
            app_icons: Map::new(),
            clipboard: empty_object(),
        }
    }
}

/// Snapshot cache of one logical peer.
///
/// All access is serialized under a single mutex, which is never held
/// across an await point.
#[derive(Debug, Default)]
pub struct DeviceState {
    slots: Mutex<Slots>,
}

impl DeviceState {
    pub fn new() -> Self {
        DeviceState::default()
    }

    /// Caches the payload of the `device` handshake message.
    pub fn set_device_info(&self, data: Value) {
        let mut slots = self.slots.lock().unwrap();
        info!("state: device info set for {:?}", data.get("name"));
        slots.device_info = data;
    }

    /// Updates one slot of the cached state.
    ///
    /// The key decides the merge semantics: notifications are keyed by id
    /// and removed on dismissal, app icons merge last-writer-wins per
    /// package, everything else overwrites. Unknown keys are dropped.
    pub fn update(&self, key: &str, data: Value) {
        let mut slots = self.slots.lock().unwrap();
        match key {
            "notification" => {
                if let Some(id) = non_empty_str(data.get("id")) {
                    let id = id.to_owned();
                    debug!("state: added notification {id}");
                    slots.notifications.insert(id, data);
                }
            }
            "notificationUpdate" => {
                let dismissed = data.get("dismissed").and_then(Value::as_bool) == Some(true);
                if let Some(id) = non_empty_str(data.get("id")) {
                    if dismissed && slots.notifications.remove(id).is_some() {
                        debug!("state: dismissed notification {id}");
                    }
                }
            }
            "appIcons" => {
                if let Value::Object(entries) = data {
                    slots.app_icons.extend(entries);
                    info!("state: app icons updated, total apps: {}", slots.app_icons.len());
                }
            }
            "clipboardUpdate" => {
                info!("state: clipboard updated");
                slots.clipboard = data;
            }
            "device_info" => slots.device_info = data,
            "status" => slots.status = data,
            "clipboard" => slots.clipboard = data,
            "notifications" => {
                if let Value::Object(entries) = data {
                    slots.notifications = entries;
                }
            }
            "app_icons" => {
                if let Value::Object(entries) = data {
                    slots.app_icons = entries;
                }
            }
            _ => debug!("state: ignoring update for unknown key '{key}'"),
        }
    }

    /// Returns a deep snapshot of one slot, or `{}` for unknown keys.
    pub fn get(&self, key: &str) -> Value {
        let slots = self.slots.lock().unwrap();
        match key {
            "device_info" => slots.device_info.clone(),
            "status" => slots.status.clone(),
            "notifications" => Value::Object(slots.notifications.clone()),
            "app_icons" => Value::Object(slots.app_icons.clone()),
            "clipboard" => slots.clipboard.clone(),
            _ => empty_object(),
        }
    }

    /// Returns a deep snapshot of the whole cache.
    pub fn snapshot(&self) -> Value {
        let slots = self.slots.lock().unwrap();
        let mut all = Map::new();
        all.insert("device_info".into(), slots.device_info.clone());
        all.insert("status".into(), slots.status.clone());
        all.insert(
            "notifications".into(),
            Value::Object(slots.notifications.clone()),
        );
        all.insert("app_icons".into(), Value::Object(slots.app_icons.clone()));
        all.insert("clipboard".into(), slots.clipboard.clone());
        Value::Object(all)
    }

    /// Package names currently present in the app-icon slot.
    pub fn app_icon_packages(&self) -> Vec<String> {
        let slots = self.slots.lock().unwrap();
        slots.app_icons.keys().cloned().collect()
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}
