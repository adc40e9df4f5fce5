//! Network configuration
//!
//! Loaded from a JSON file and overridden by command line flags. Every field
//! has a default, so an empty `{}` file is a valid configuration.

use crate::network::endpoint::{Endpoint, EndpointError};
use crate::network::identity::PROTOCOL_VERSION;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default P2P port, also used for DNS seed results
pub const DEFAULT_PORT: u16 = 7331;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(#[from] EndpointError),
}

/// Peer-to-peer layer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Interface to listen on
    pub listen_address: String,
    /// Port to listen on (0 picks a free port)
    pub listen_port: u16,
    /// Externally reachable address, announced to peers
    pub published_address: Option<String>,
    /// Connections below this trigger candidate dialing
    pub min_peers: usize,
    /// Hard cap on connected peers
    pub max_peers: usize,
    pub enable_bootstrap: bool,
    /// Endpoints taken from the bootstrapper per upkeep cycle
    pub bootstrap_peer_limit: usize,
    /// Static bootstrap endpoints (`host:port`)
    pub bootstrap_peers: Vec<String>,
    /// DNS seed hostnames
    pub dns_seeds: Vec<String>,
    /// Port assumed for DNS seed results
    pub default_port: u16,
    /// Explicitly configured peers, always kept as candidates
    pub peers: Vec<String>,
    /// Misbehavior score at which an address is banned
    pub ban_threshold: u32,
    pub share_platform: bool,
    pub share_address: bool,
    pub app_name: String,
    pub protocol_version: u32,

    pub upkeep_interval_secs: u64,
    pub warden_decay_interval_secs: u64,
    pub peer_timeout_secs: u64,
    pub reconnect_delay_secs: u64,
    pub connect_timeout_secs: u64,
    pub cool_down_secs: u64,
    pub bootstrap_refresh_secs: u64,
    pub max_dials_per_upkeep: usize,
    pub shutdown_grace_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            listen_port: DEFAULT_PORT,
            published_address: None,
            min_peers: 8,
            max_peers: 25,
            enable_bootstrap: true,
            bootstrap_peer_limit: 16,
            bootstrap_peers: Vec::new(),
            dns_seeds: Vec::new(),
            default_port: DEFAULT_PORT,
            peers: Vec::new(),
            ban_threshold: 100,
            share_platform: true,
            share_address: true,
            app_name: "peerlink".to_string(),
            protocol_version: PROTOCOL_VERSION,
            upkeep_interval_secs: 60,
            warden_decay_interval_secs: 60,
            peer_timeout_secs: 300,
            reconnect_delay_secs: 5,
            connect_timeout_secs: 10,
            cool_down_secs: 600,
            bootstrap_refresh_secs: 300,
            max_dials_per_upkeep: 8,
            shutdown_grace_secs: 5,
        }
    }
}

impl NetworkConfig {
    /// Load from a JSON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        let config: NetworkConfig = serde_json::from_str(&data)?;
        config.endpoints()?;
        Ok(config)
    }

    /// Save as pretty JSON
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data)?;
        Ok(())
    }

    /// Address announced to peers: the published address if set, otherwise
    /// the listen address unless it is a wildcard.
    pub fn published_address(&self) -> String {
        match &self.published_address {
            Some(addr) if !addr.is_empty() => addr.clone(),
            _ if self.listen_address == "0.0.0.0" || self.listen_address == "::" => String::new(),
            _ => self.listen_address.clone(),
        }
    }

    pub fn listen_endpoint(&self) -> String {
        Endpoint::new(self.listen_address.clone(), self.listen_port).to_string()
    }

    /// Parse the static bootstrap and explicit peer lists
    pub fn endpoints(&self) -> Result<(Vec<Endpoint>, Vec<Endpoint>), ConfigError> {
        let bootstrap = parse_all(&self.bootstrap_peers)?;
        let peers = parse_all(&self.peers)?;
        Ok((bootstrap, peers))
    }

    /// Non-fatal consistency problems, logged at startup
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.max_peers <= self.min_peers {
            warnings.push(format!(
                "max_peers ({}) should exceed min_peers ({}); inbound capacity is effectively zero",
                self.max_peers, self.min_peers
            ));
        }
        if self.enable_bootstrap && self.bootstrap_peers.is_empty() && self.dns_seeds.is_empty() {
            warnings.push("bootstrap enabled but no bootstrap peers or DNS seeds configured".into());
        }
        if self.peer_timeout_secs == 0 {
            warnings.push("peer_timeout_secs is zero; every peer will be groomed".into());
        }
        if self.ban_threshold == 0 {
            warnings.push("ban_threshold is zero; any penalty bans immediately".into());
        }
        if self.upkeep_interval_secs == 0 {
            warnings.push("upkeep_interval_secs is zero; upkeep runs every second".into());
        }
        if self.warden_decay_interval_secs == 0 {
            warnings.push("warden_decay_interval_secs is zero; scores decay every second".into());
        }
        if self.max_dials_per_upkeep == 0 {
            warnings.push("max_dials_per_upkeep is zero; no outbound connections will be made".into());
        }

        warnings
    }

    pub fn upkeep_interval(&self) -> Duration {
        Duration::from_secs(self.upkeep_interval_secs)
    }

    pub fn warden_decay_interval(&self) -> Duration {
        Duration::from_secs(self.warden_decay_interval_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn bootstrap_refresh(&self) -> Duration {
        Duration::from_secs(self.bootstrap_refresh_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn peer_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.peer_timeout_secs as i64)
    }

    pub fn cool_down(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cool_down_secs as i64)
    }
}

fn parse_all(list: &[String]) -> Result<Vec<Endpoint>, ConfigError> {
    list.iter()
        .map(|s| s.parse::<Endpoint>().map_err(ConfigError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = NetworkConfig {
            dns_seeds: vec!["seed.example.org".into()],
            ..Default::default()
        };
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_max_not_above_min_warns() {
        let config = NetworkConfig {
            min_peers: 10,
            max_peers: 10,
            enable_bootstrap: false,
            ..Default::default()
        };
        let warnings = config.validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("max_peers"));
    }

    #[test]
    fn test_zero_timer_intervals_warn() {
        let config = NetworkConfig {
            upkeep_interval_secs: 0,
            warden_decay_interval_secs: 0,
            enable_bootstrap: false,
            ..Default::default()
        };
        let warnings = config.validate();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("upkeep_interval_secs"));
        assert!(warnings[1].contains("warden_decay_interval_secs"));
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"listen_port": 9999, "peers": ["8.8.8.8:9999"], "min_peers": 2}}"#
        )
        .unwrap();

        let config = NetworkConfig::load(file.path()).unwrap();
        assert_eq!(config.listen_port, 9999);
        assert_eq!(config.min_peers, 2);
        assert_eq!(config.max_peers, 25);

        let (bootstrap, peers) = config.endpoints().unwrap();
        assert!(bootstrap.is_empty());
        assert_eq!(peers[0].key(), "8.8.8.8:9999");
    }

    #[test]
    fn test_load_rejects_bad_endpoint() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"bootstrap_peers": ["no-port"]}}"#).unwrap();

        assert!(matches!(
            NetworkConfig::load(file.path()),
            Err(ConfigError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("network.json");

        let config = NetworkConfig {
            published_address: Some("203.0.113.5".into()),
            ..Default::default()
        };
        config.save(&path).unwrap();

        assert_eq!(NetworkConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_published_address() {
        let mut config = NetworkConfig::default();
        assert_eq!(config.published_address(), "");

        config.listen_address = "127.0.0.1".into();
        assert_eq!(config.published_address(), "127.0.0.1");

        config.published_address = Some("203.0.113.5".into());
        assert_eq!(config.published_address(), "203.0.113.5");
    }
}
