//! P2P Networking module
//!
//! Peer connections over length-prefixed TCP framing, a peer table that
//! keeps the node connected, misbehavior scoring and bootstrap discovery.
//!
//! # Features
//! - Announce handshake with protocol version check
//! - Bounded per-peer send queues with write-stall detection
//! - Self-healing reconnection for dialed peers
//! - Misbehavior scoring with linear decay and temporary bans
//! - Peer-table exchange and DNS-seed bootstrap
//! - Block and transaction gossip suppression

pub mod ban;
pub mod bootstrap;
pub mod capabilities;
pub mod codec;
pub mod endpoint;
pub mod events;
pub mod identity;
pub mod message;
pub mod node;
pub mod peer;
pub mod server;
pub mod state;
pub mod table;
pub mod warden;

pub use ban::{Ban, BanKind, TEMPORARY_BAN_HOURS};
pub use bootstrap::Bootstrapper;
pub use capabilities::Capabilities;
pub use codec::{FrameCodec, FrameError, HARD_FRAME_LIMIT, SOFT_FRAME_LIMIT};
pub use endpoint::{Endpoint, EndpointError};
pub use events::{EventBus, NetworkEvent};
pub use identity::{NodeIdentity, PROTOCOL_VERSION};
pub use message::{Envelope, MessageKind, Payload};
pub use node::{Node, NodeStatus};
pub use peer::{
    Direction, NetworkError, PeerConnection, PeerEvent, PeerInfo, PeerStatus, SEND_QUEUE_CAPACITY,
};
pub use server::{dial, Server};
pub use state::PeerState;
pub use table::{Candidate, PeerTable, Rejection, TableStats, UpkeepReport};
pub use warden::{Misbehavior, Verdict, Warden};
