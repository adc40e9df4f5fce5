//! Peer endpoints
//!
//! An endpoint is an immutable `address:port` pair. Its string key is the
//! map key used by the peer table for connected peers and candidates.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

/// Endpoint parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    #[error("Missing port in endpoint: {0}")]
    MissingPort(String),
    #[error("Invalid port in endpoint: {0}")]
    InvalidPort(String),
    #[error("Empty host in endpoint: {0}")]
    EmptyHost(String),
}

/// A remote `address:port` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    address: String,
    port: u16,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Map key, `"address:port"`
    pub fn key(&self) -> String {
        self.to_string()
    }

    /// Parse the address as an IP, if it is one
    pub fn ip(&self) -> Option<IpAddr> {
        self.address.parse().ok()
    }

    /// Whether the address is loopback, private, link-local or unspecified.
    ///
    /// Hostnames are never considered private.
    pub fn is_private(&self) -> bool {
        self.ip().map(is_private_ip).unwrap_or(false)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.address.contains(':') {
            write!(f, "[{}]:{}", self.address, self.port)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        // Bracketed IPv6: [::1]:8333
        if let Some(rest) = s.strip_prefix('[') {
            let (host, port) = rest
                .split_once("]:")
                .ok_or_else(|| EndpointError::MissingPort(s.to_string()))?;
            if host.is_empty() {
                return Err(EndpointError::EmptyHost(s.to_string()));
            }
            let port = port
                .parse()
                .map_err(|_| EndpointError::InvalidPort(s.to_string()))?;
            return Ok(Self::new(host, port));
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| EndpointError::MissingPort(s.to_string()))?;
        if host.is_empty() {
            return Err(EndpointError::EmptyHost(s.to_string()));
        }
        let port = port
            .parse()
            .map_err(|_| EndpointError::InvalidPort(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

/// Addresses peers must never advertise to each other
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                // 100.64.0.0/10 carrier-grade NAT
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xc0) == 64)
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00 // unique local
                || (first & 0xffc0) == 0xfe80 // link local
                || v6.to_ipv4_mapped().map(|v4| is_private_ip(IpAddr::V4(v4))).unwrap_or(false)
        }
    }
}
