//! Wire message envelope
//!
//! Every frame carries one [`Envelope`]: a per-connection message id, an
//! acknowledgement flag and exactly one payload variant. Application
//! payloads (blocks, transactions, queries) are opaque JSON values; this
//! layer only routes them by [`MessageKind`].

use crate::network::identity::NodeIdentity;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Message payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum Payload {
    /// First message on every connection
    Announce(NodeIdentity),

    /// Keep-alive
    Heartbeat { timestamp: i64 },

    /// Ask a peer for the identities it is connected to
    PeerTableRequest,

    /// Identities of a peer's connected peers
    PeerTableReply(Vec<NodeIdentity>),

    Block(Value),
    Transaction(Value),
    BlockQuery(Value),
    BlockQueryReply(Value),
    SyncRequest(Value),
    SyncReply(Value),
}

/// Payload discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Announce,
    Heartbeat,
    PeerTableRequest,
    PeerTableReply,
    Block,
    Transaction,
    BlockQuery,
    BlockQueryReply,
    SyncRequest,
    SyncReply,
}

impl MessageKind {
    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::Announce => "Announce",
            MessageKind::Heartbeat => "Heartbeat",
            MessageKind::PeerTableRequest => "PeerTableRequest",
            MessageKind::PeerTableReply => "PeerTableReply",
            MessageKind::Block => "Block",
            MessageKind::Transaction => "Transaction",
            MessageKind::BlockQuery => "BlockQuery",
            MessageKind::BlockQueryReply => "BlockQueryReply",
            MessageKind::SyncRequest => "SyncRequest",
            MessageKind::SyncReply => "SyncReply",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Announce(_) => MessageKind::Announce,
            Payload::Heartbeat { .. } => MessageKind::Heartbeat,
            Payload::PeerTableRequest => MessageKind::PeerTableRequest,
            Payload::PeerTableReply(_) => MessageKind::PeerTableReply,
            Payload::Block(_) => MessageKind::Block,
            Payload::Transaction(_) => MessageKind::Transaction,
            Payload::BlockQuery(_) => MessageKind::BlockQuery,
            Payload::BlockQueryReply(_) => MessageKind::BlockQueryReply,
            Payload::SyncRequest(_) => MessageKind::SyncRequest,
            Payload::SyncReply(_) => MessageKind::SyncReply,
        }
    }
}

/// Typed message as carried in one frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Monotonically increasing per connection
    pub id: u64,
    /// Set when this message acknowledges `id` of an earlier request
    #[serde(default)]
    pub ack: bool,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(id: u64, payload: Payload) -> Self {
        Self {
            id,
            ack: false,
            payload,
        }
    }

    /// Reply to the request with the given id
    pub fn ack(id: u64, payload: Payload) -> Self {
        Self {
            id,
            ack: true,
            payload,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// Serialize message to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}
