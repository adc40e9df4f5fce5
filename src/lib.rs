//! peerlink: the peer-to-peer layer of a blockchain node
//!
//! This crate discovers, connects to, authenticates, monitors and
//! disciplines peer nodes:
//! - Length-prefixed, type-tagged JSON envelopes over TCP
//! - Announce handshake carrying a self-describing node identity
//! - Peer table with minimum/maximum peer enforcement and candidates
//! - Misbehavior scoring with linear decay and temporary bans
//! - Bootstrap from static peers and DNS seeds
//!
//! # Example
//!
//! ```no_run
//! use peerlink::config::NetworkConfig;
//! use peerlink::network::Node;
//!
//! # async fn run() -> Result<(), peerlink::network::NetworkError> {
//! let config = NetworkConfig {
//!     peers: vec!["203.0.113.7:7331".into()],
//!     ..Default::default()
//! };
//! let node = Node::start(config).await?;
//! let mut events = node.subscribe();
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! node.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod network;

pub use config::NetworkConfig;
pub use network::{Node, PeerTable};
