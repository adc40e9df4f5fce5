//! Network events
//!
//! The event bus is constructed once by the node and handed to every
//! component that raises events. Any number of application-layer
//! subscribers can listen; slow subscribers lose the oldest events.

use crate::network::endpoint::Endpoint;
use crate::network::identity::NodeIdentity;
use crate::network::message::{Envelope, MessageKind};
use crate::network::warden::Misbehavior;
use tokio::sync::broadcast;

/// Events buffered per subscriber
pub const EVENT_BUFFER: usize = 1024;

/// Events raised to external collaborators
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// A peer completed its announce
    PeerConnected {
        key: String,
        identity: NodeIdentity,
    },
    PeerDisconnected {
        key: String,
    },
    PeerBanned {
        address: String,
        permanent: bool,
    },
    MisbehaviorDetected {
        key: String,
        reason: Misbehavior,
        score: u32,
    },
    /// One event per inbound message, for the application layer
    Message {
        key: String,
        kind: MessageKind,
        envelope: Envelope,
    },
    /// Zero peers after exhausting candidates, bootstrap and cool-downs
    ConnectivityLost,
    /// Listener bound
    Listening {
        endpoint: Endpoint,
    },
}

/// Broadcast dispatcher for [`NetworkEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<NetworkEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.tx.subscribe()
    }

    /// Publish; having no subscribers is fine
    pub fn publish(&self, event: NetworkEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
