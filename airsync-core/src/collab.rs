// SPDX-FileCopyrightText: 2026 AirSync Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! External Collaborator Interfaces
//!
//! The core does not ship an mDNS responder or a MIME sniffer; the host
//! application plugs implementations in through [`crate::ServerConfig`].
//! The QR renderer collaborator needs no trait: it consumes the
//! [`crate::PairingUri`] string.

use std::net::IpAddr;
use std::path::Path;

use thiserror::Error;

/// Service type advertised on the local network.
pub const SERVICE_TYPE: &str = "_airsync._tcp.local.";

/// MIME type reported when no probe is configured or the probe abstains.
pub const FALLBACK_MIME: &str = "application/octet-stream";

/// Discovery backend error.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("discovery backend error: {0}")]
    Backend(String),
}

/// One service record to publish over mDNS/Zeroconf.
#[derive(Debug, Clone)]
pub struct ServiceAdvertisement {
    /// Instance name, usually the machine hostname.
    pub service_name: String,
    /// Service type, [`SERVICE_TYPE`] for AirSync.
    pub service_type: String,
    /// Address the WebSocket server listens on.
    pub address: IpAddr,
    /// Port the WebSocket server listens on.
    pub port: u16,
}

impl ServiceAdvertisement {
    /// Builds an AirSync advertisement for the given endpoint.
    pub fn airsync(service_name: impl Into<String>, address: IpAddr, port: u16) -> Self {
        ServiceAdvertisement {
            service_name: service_name.into(),
            service_type: SERVICE_TYPE.to_owned(),
            address,
            port,
        }
    }
}

/// LAN discovery publisher (mDNS/Zeroconf).
///
/// Called on the blocking pool; implementations may block.
pub trait DiscoveryAdvertiser: Send + Sync {
    /// Registers the service record.
    fn advertise(&self, service: &ServiceAdvertisement) -> Result<(), DiscoveryError>;

    /// Withdraws the service record.
    fn release(&self) -> Result<(), DiscoveryError>;
}

/// MIME sniffer used for the outgoing-transfer preflight.
///
/// Called on the blocking pool; `None` falls back to [`FALLBACK_MIME`].
pub trait MimeProbe: Send + Sync {
    fn probe(&self, path: &Path) -> Option<String>;
}
