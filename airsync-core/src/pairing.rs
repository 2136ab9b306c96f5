// SPDX-FileCopyrightText: 2026 AirSync Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Pairing URI
//!
//! The mobile peer bootstraps the shared AES key by scanning a QR code
//! containing `airsync://<ipv4>:<port>?key=<base64 key>`. Rendering the QR
//! image is the host application's affair; the core only builds the URI,
//! and withholds it entirely when encryption is disabled.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// Connection bootstrap URI embedded in the pairing QR code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingUri {
    host: IpAddr,
    port: u16,
    key_b64: String,
}

impl PairingUri {
    pub fn new(host: IpAddr, port: u16, key_b64: impl Into<String>) -> Self {
        PairingUri {
            host,
            port,
            key_b64: key_b64.into(),
        }
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The symmetric key, base64-encoded.
    pub fn key_base64(&self) -> &str {
        &self.key_b64
    }
}

impl fmt::Display for PairingUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "airsync://{}:{}?key={}",
            self.host, self.port, self.key_b64
        )
    }
}

/// Best-effort local IPv4 discovery.
///
/// Asks the routing table which source address would reach a public host;
/// no packet is sent. Falls back to loopback on machines without a route.
pub(crate) fn local_ipv4() -> IpAddr {
    let fallback = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let Ok(socket) = UdpSocket::bind(("0.0.0.0", 0)) else {
        return fallback;
    };
    if socket.connect(("8.8.8.8", 80)).is_err() {
        return fallback;
    }
    socket.local_addr().map(|addr| addr.ip()).unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_scheme_host_port_and_key() {
        let uri = PairingUri::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 7)), 5297, "c2VjcmV0");
        assert_eq!(uri.to_string(), "airsync://192.168.1.7:5297?key=c2VjcmV0");
    }
}
