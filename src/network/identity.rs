//! Node identity
//!
//! The self-describing record a node sends in its announce message. Our own
//! identity is built once at startup; remote identities are parsed from
//! announcements and peer-table replies.

use crate::config::NetworkConfig;
use crate::network::capabilities::Capabilities;
use crate::network::endpoint::Endpoint;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Protocol version spoken by this build
pub const PROTOCOL_VERSION: u32 = 1;

/// Identity exchanged on announce
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Published (externally reachable) address, empty if not shared
    pub address: String,
    /// Listening port
    pub port: u16,
    pub app_name: String,
    pub app_version: String,
    pub protocol_version: u32,
    /// Platform string, only present if the node opts into sharing it
    pub platform: Option<String>,
    pub start_time: DateTime<Utc>,
    /// Whether this node may be advertised to other peers
    pub share_address: bool,
    /// Capability bit-vector, see [`Capabilities::to_bit_vector`]
    pub capabilities: i64,
    /// Random, one per process lifetime
    pub session_id: String,
}

impl NodeIdentity {
    /// Build this node's identity from configuration
    pub fn local(config: &NetworkConfig) -> Self {
        let platform = config
            .share_platform
            .then(|| format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH));

        Self {
            address: config.published_address(),
            port: config.listen_port,
            app_name: config.app_name.clone(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: config.protocol_version,
            platform,
            start_time: Utc::now(),
            share_address: config.share_address,
            capabilities: Capabilities::all().to_bit_vector(),
            session_id: new_session_id(),
        }
    }

    /// Same identity listening on a different port. Used once the real
    /// listening port is known after binding to port 0.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities::from_bit_vector(self.capabilities)
    }

    /// Advertised endpoint, if the node shared an address
    pub fn endpoint(&self) -> Option<Endpoint> {
        if self.address.is_empty() || self.port == 0 {
            return None;
        }
        Some(Endpoint::new(self.address.clone(), self.port))
    }

    /// `app_name/app_version`
    pub fn user_agent(&self) -> String {
        format!("{}/{}", self.app_name, self.app_version)
    }

    /// Whether `other` describes this same node.
    ///
    /// A restarted node gets a new session id, so a matching address counts
    /// as well.
    pub fn is_same_node(&self, other: &NodeIdentity) -> bool {
        if self.session_id == other.session_id {
            return true;
        }
        !self.address.is_empty() && self.address == other.address
    }
}

/// 16 random bytes, hex encoded
pub fn new_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(address: &str, session: &str) -> NodeIdentity {
        let mut id = NodeIdentity::local(&NetworkConfig::default());
        id.address = address.to_string();
        id.session_id = session.to_string();
        id
    }

    #[test]
    fn test_local_identity() {
        let config = NetworkConfig {
            listen_port: 9100,
            share_platform: false,
            ..Default::default()
        };
        let id = NodeIdentity::local(&config);

        assert_eq!(id.port, 9100);
        assert_eq!(id.protocol_version, PROTOCOL_VERSION);
        assert!(id.platform.is_none());
        assert_eq!(id.session_id.len(), 32);
        assert_eq!(id.capabilities(), Capabilities::all());
    }

    #[test]
    fn test_session_ids_are_random() {
        assert_ne!(new_session_id(), new_session_id());
    }

    #[test]
    fn test_same_node_by_session_or_address() {
        let me = identity("8.8.8.8", "aaaa");

        assert!(me.is_same_node(&identity("1.1.1.1", "aaaa")));
        assert!(me.is_same_node(&identity("8.8.8.8", "bbbb")));
        assert!(!me.is_same_node(&identity("1.1.1.1", "bbbb")));

        // An unpublished address never matches by address
        let anon = identity("", "aaaa");
        assert!(!anon.is_same_node(&identity("", "cccc")));
    }

    #[test]
    fn test_endpoint_requires_address() {
        let id = identity("", "aaaa");
        assert!(id.endpoint().is_none());

        let id = identity("8.8.8.8", "aaaa").with_port(9000);
        assert_eq!(id.endpoint().unwrap().key(), "8.8.8.8:9000");
    }

    #[test]
    fn test_serde_round_trip() {
        let id = identity("8.8.8.8", "abcd");
        let json = serde_json::to_string(&id).unwrap();
        let back: NodeIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
