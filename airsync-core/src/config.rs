// SPDX-FileCopyrightText: 2026 AirSync Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Server Configuration

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::collab::{DiscoveryAdvertiser, MimeProbe};

/// Default WebSocket listen port.
pub const DEFAULT_PORT: u16 = 5297;

/// Default listen host.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Construction-time options for [`crate::Server`].
///
/// The listen address and the no-encrypt flag are passed to
/// [`crate::Server::start`] instead: they belong to one run of the server,
/// not to the instance.
#[derive(Clone)]
pub struct ServerConfig {
    /// Location of the raw 32-byte symmetric key file.
    pub key_path: PathBuf,
    /// Root directory for cached app icons (`<root>/<package>.png`).
    pub icon_cache_path: PathBuf,
    /// Whether to advertise the service over the discovery collaborator.
    pub discovery: bool,
    /// mDNS/Zeroconf publisher; required for `discovery` to take effect.
    pub advertiser: Option<Arc<dyn DiscoveryAdvertiser>>,
    /// MIME sniffer for outgoing transfers; falls back to
    /// `application/octet-stream`.
    pub mime_probe: Option<Arc<dyn MimeProbe>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            key_path: PathBuf::from("airsync.key"),
            icon_cache_path: PathBuf::from("cache/icons"),
            discovery: false,
            advertiser: None,
            mime_probe: None,
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("key_path", &self.key_path)
            .field("icon_cache_path", &self.icon_cache_path)
            .field("discovery", &self.discovery)
            .field("advertiser", &self.advertiser.is_some())
            .field("mime_probe", &self.mime_probe.is_some())
            .finish()
    }
}
