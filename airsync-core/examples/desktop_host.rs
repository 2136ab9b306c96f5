//! Minimal desktop host application.
//!
//! Registers the required `mac_info_request` callback plus a few
//! informational handlers, prints the pairing URI for QR display and runs
//! the server until Ctrl+C. Clipboard and notification OS integration are
//! host concerns and stay out of this example.

use std::sync::Arc;
use std::time::Duration;

use airsync_core::{events, Server, ServerConfig};
use serde_json::json;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = ServerConfig {
        key_path: "cache/airsync.key".into(),
        icon_cache_path: "cache/icons".into(),
        ..ServerConfig::default()
    };
    std::fs::create_dir_all("cache")?;
    let server = Arc::new(Server::new(config)?);

    server.on_event(events::MAC_INFO_REQUEST, |device_info, _handler_id| async move {
        info!("device {:?} requesting macInfo", device_info.get("name"));
        Ok(Some(json!({
            "name": hostname::get().map(|h| h.to_string_lossy().into_owned()).unwrap_or_else(|_| "My PC".into()),
            "type": "PC",
            "isPlus": true,
            "isPlusSubscription": true,
        })))
    });

    server.on_event(events::DEVICE_CONNECTED, |_data, handler_id| async move {
        info!("device {handler_id} connected");
        Ok(None)
    });

    server.on_event(events::DEVICE_DISCONNECTED, |_data, handler_id| async move {
        info!("device {handler_id} disconnected");
        Ok(None)
    });

    server.on_event(events::NOTIFICATION, |data, _handler_id| async move {
        info!(
            "notification: {} - {}",
            data.get("app").and_then(|v| v.as_str()).unwrap_or("?"),
            data.get("title").and_then(|v| v.as_str()).unwrap_or("?"),
        );
        Ok(None)
    });

    server.on_event(events::STATUS, |data, _handler_id| async move {
        if let Some(battery) = data.get("battery") {
            info!(
                "battery: {}% (charging: {})",
                battery.get("level").and_then(|v| v.as_u64()).unwrap_or(0),
                battery.get("isCharging").and_then(|v| v.as_bool()).unwrap_or(false),
            );
        }
        Ok(None)
    });

    server.on_event(events::FILE_TRANSFER_COMPLETE, |data, _handler_id| async move {
        info!(
            "received file {:?} at {:?} (verified: {:?})",
            data.get("name"),
            data.get("temp_path"),
            data.get("verified"),
        );
        Ok(None)
    });

    // The pairing URI is available once the listener is bound.
    let for_uri = server.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Some(uri) = for_uri.pairing_uri() {
                println!("--- scan to connect ---");
                println!("{uri}");
                println!("-----------------------");
                break;
            }
        }
    });

    let for_ctrl_c = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            for_ctrl_c.stop().await;
        }
    });

    info!("starting AirSync server... press Ctrl+C to stop");
    server.start("0.0.0.0", 5297, false).await?;
    Ok(())
}
