//! Peer connections
//!
//! A [`PeerConnection`] owns one socket at a time and is driven by a single
//! task. The task reads length-prefixed frames, decodes envelopes and hands
//! them to the peer table, and drains a bounded send queue one frame at a
//! time. Connections this node dialed redial once after an I/O failure;
//! accepted connections never do, so the two ends of a link cannot both
//! flap it.

use crate::config::{ConfigError, NetworkConfig};
use crate::network::codec::{FrameCodec, FrameError, SOFT_FRAME_LIMIT};
use crate::network::endpoint::Endpoint;
use crate::network::identity::NodeIdentity;
use crate::network::message::{Envelope, MessageKind, Payload};
use crate::network::server::dial;
use crate::network::state::PeerState;
use crate::network::table::Rejection;
use crate::network::warden::Misbehavior;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

/// Messages queued per peer before new sends are dropped
pub const SEND_QUEUE_CAPACITY: usize = 1100;

/// A write pending this long is logged
pub const WRITE_STALL_WARNING: Duration = Duration::from_secs(60);

/// A write pending this long means the peer is dead
pub const WRITE_STALL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const WATCHDOG_INTERVAL: Duration = Duration::from_secs(10);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Errors
// =============================================================================

/// Network layer errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Connection to {0} timed out")]
    Timeout(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Connection rejected: {0}")]
    Rejected(Rejection),
    #[error("Network is not running")]
    NotRunning,
}

// =============================================================================
// Status
// =============================================================================

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Initialized,
    Connecting,
    Connected,
    Errored,
    Closed,
}

impl PeerStatus {
    /// Lifecycle is monotonic, except that an outbound connection may
    /// come back from `Errored` by redialing.
    pub fn can_transition_to(self, next: PeerStatus, direction: Direction) -> bool {
        use PeerStatus::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Initialized, Connecting | Connected | Errored) => true,
            (Connecting, Connected | Errored) => true,
            (Connected, Errored) => true,
            (Errored, Connecting | Connected) => direction == Direction::Outbound,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PeerStatus::Errored | PeerStatus::Closed)
    }
}

/// Write-side health of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteHealth {
    Healthy,
    Slow,
    Dead,
}

/// Classify how long the current write has been pending
pub fn write_health(pending_for: Duration, pending: bool) -> WriteHealth {
    if !pending || pending_for < WRITE_STALL_WARNING {
        WriteHealth::Healthy
    } else if pending_for < WRITE_STALL_TIMEOUT {
        WriteHealth::Slow
    } else {
        WriteHealth::Dead
    }
}

// =============================================================================
// Events to the table
// =============================================================================

/// What a connection reports to its peer table
#[derive(Debug)]
pub enum PeerEvent {
    Message {
        peer: Arc<PeerConnection>,
        envelope: Envelope,
    },
    Misbehavior {
        peer: Arc<PeerConnection>,
        kind: Misbehavior,
    },
    Disconnected {
        peer: Arc<PeerConnection>,
    },
}

/// Timing knobs for a connection
#[derive(Debug, Clone, Copy)]
pub struct PeerSettings {
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
}

impl From<&NetworkConfig> for PeerSettings {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            reconnect_delay: config.reconnect_delay(),
            connect_timeout: config.connect_timeout(),
        }
    }
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self::from(&NetworkConfig::default())
    }
}

/// Snapshot of a connection for display
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub key: String,
    pub endpoint: Endpoint,
    pub direction: Direction,
    pub status: PeerStatus,
    pub identity: Option<NodeIdentity>,
    pub announced: bool,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub queued: usize,
    pub last_message_received_at: DateTime<Utc>,
}

enum LinkOutcome {
    /// We closed it
    Closed,
    /// Dropped for misbehavior, never redialed
    Dropped,
    /// I/O failure or remote close
    Failed(String),
}

// =============================================================================
// Peer Connection
// =============================================================================

/// One peer link
pub struct PeerConnection {
    id: u64,
    endpoint: Endpoint,
    direction: Direction,
    local: NodeIdentity,
    settings: PeerSettings,
    key: RwLock<String>,
    status: RwLock<PeerStatus>,
    identity: RwLock<Option<NodeIdentity>>,
    state: Mutex<PeerState>,
    queue_tx: mpsc::Sender<Envelope>,
    queue_rx: Mutex<Option<mpsc::Receiver<Envelope>>>,
    next_message_id: AtomicU64,
    in_flight: AtomicBool,
    write_progress_at: Mutex<Instant>,
    handshaken: AtomicBool,
    /// Set by the first accepted announce and never cleared
    announced_once: AtomicBool,
    reconnect_armed: AtomicBool,
    cancel: CancellationToken,
}

impl PeerConnection {
    pub fn new(
        endpoint: Endpoint,
        direction: Direction,
        local: NodeIdentity,
        settings: PeerSettings,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            key: RwLock::new(endpoint.key()),
            endpoint,
            direction,
            local,
            settings,
            status: RwLock::new(PeerStatus::Initialized),
            identity: RwLock::new(None),
            state: Mutex::new(PeerState::new()),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            next_message_id: AtomicU64::new(1),
            in_flight: AtomicBool::new(false),
            write_progress_at: Mutex::new(Instant::now()),
            handshaken: AtomicBool::new(false),
            announced_once: AtomicBool::new(false),
            reconnect_armed: AtomicBool::new(direction == Direction::Outbound),
            cancel: CancellationToken::new(),
        })
    }

    /// Start driving `stream`. The announce goes out first.
    pub fn spawn(self: &Arc<Self>, stream: TcpStream, events: mpsc::Sender<PeerEvent>) {
        if !self.set_status(PeerStatus::Connected) {
            return;
        }
        let Some(rx) = self.queue_rx.lock().take() else {
            log::error!("Peer {} spawned twice", self.endpoint);
            return;
        };

        let peer = Arc::clone(self);
        tokio::spawn(async move { peer.run(stream, rx, events).await });
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_outbound(&self) -> bool {
        self.direction == Direction::Outbound
    }

    /// Peer table key
    pub fn key(&self) -> String {
        self.key.read().clone()
    }

    pub fn set_key(&self, key: String) {
        *self.key.write() = key;
    }

    pub fn status(&self) -> PeerStatus {
        *self.status.read()
    }

    /// Apply a lifecycle transition; false if it is not allowed
    pub fn set_status(&self, next: PeerStatus) -> bool {
        let mut status = self.status.write();
        if *status == next {
            return true;
        }
        if !status.can_transition_to(next, self.direction) {
            log::debug!(
                "Peer {}: ignoring status change {:?} -> {:?}",
                self.endpoint,
                *status,
                next
            );
            return false;
        }
        *status = next;
        true
    }

    pub fn identity(&self) -> Option<NodeIdentity> {
        self.identity.read().clone()
    }

    pub fn set_identity(&self, identity: NodeIdentity) {
        *self.identity.write() = Some(identity);
    }

    pub fn has_announced(&self) -> bool {
        self.state.lock().has_announced()
    }

    /// Run `f` against the peer's state
    pub fn with_state<R>(&self, f: impl FnOnce(&mut PeerState) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// Messages waiting in the send queue
    pub fn queue_len(&self) -> usize {
        SEND_QUEUE_CAPACITY - self.queue_tx.capacity()
    }

    /// Queue a message. Never blocks; returns false if it was dropped.
    pub fn send(&self, payload: Payload) -> bool {
        let envelope = Envelope::new(self.next_id(), payload);
        self.enqueue(envelope)
    }

    /// Queue an acknowledgement of request `id`
    pub fn reply(&self, id: u64, payload: Payload) -> bool {
        self.enqueue(Envelope::ack(id, payload))
    }

    fn enqueue(&self, envelope: Envelope) -> bool {
        if self.status() == PeerStatus::Closed {
            return false;
        }
        match self.queue_tx.try_send(envelope) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                log::warn!(
                    "Send queue full for {}, dropping {}",
                    self.endpoint,
                    envelope.kind()
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn next_id(&self) -> u64 {
        self.next_message_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Close for good. Returns false if it was already closed.
    pub fn disconnect(&self) -> bool {
        let was_closed = self.status() == PeerStatus::Closed;
        self.set_status(PeerStatus::Closed);
        self.cancel.cancel();
        !was_closed
    }

    pub fn info(&self) -> PeerInfo {
        let state = self.state.lock();
        PeerInfo {
            key: self.key(),
            endpoint: self.endpoint.clone(),
            direction: self.direction,
            status: self.status(),
            identity: self.identity(),
            announced: self.is_handshaken(),
            bytes_sent: state.bytes_sent(),
            bytes_received: state.bytes_received(),
            queued: self.queue_len(),
            last_message_received_at: state.last_message_received_at(),
        }
    }

    /// Whether the table accepted this socket's announce
    pub fn is_handshaken(&self) -> bool {
        self.handshaken.load(Ordering::SeqCst)
    }

    /// Whether any socket of this link was ever handshaken. Survives a
    /// redial, unlike [`PeerConnection::is_handshaken`].
    pub fn was_announced(&self) -> bool {
        self.announced_once.load(Ordering::SeqCst)
    }

    /// Record the accepted announce. Re-arms one redial for outbound links.
    /// Returns true only for the first announce on this link.
    pub(crate) fn complete_handshake(&self, identity: NodeIdentity) -> bool {
        self.set_identity(identity);
        self.handshaken.store(true, Ordering::SeqCst);
        if self.is_outbound() {
            self.reconnect_armed.store(true, Ordering::SeqCst);
        }
        !self.announced_once.swap(true, Ordering::SeqCst)
    }

    // =========================================================================
    // Connection task
    // =========================================================================

    async fn run(
        self: Arc<Self>,
        mut stream: TcpStream,
        mut rx: mpsc::Receiver<Envelope>,
        events: mpsc::Sender<PeerEvent>,
    ) {
        loop {
            match self.drive(stream, &mut rx, &events).await {
                LinkOutcome::Closed => {
                    log::debug!("Peer {} closed", self.endpoint);
                    break;
                }
                LinkOutcome::Dropped => {
                    self.fail(&events).await;
                    break;
                }
                LinkOutcome::Failed(reason) => {
                    log::info!("Connection to {} failed: {}", self.endpoint, reason);
                    if self.reconnect_armed.swap(false, Ordering::SeqCst) {
                        self.set_status(PeerStatus::Errored);
                        if let Some(fresh) = self.reconnect().await {
                            stream = fresh;
                            continue;
                        }
                    }
                    self.fail(&events).await;
                    break;
                }
            }
        }
    }

    async fn fail(self: &Arc<Self>, events: &mpsc::Sender<PeerEvent>) {
        if self.status() == PeerStatus::Closed {
            return;
        }
        self.set_status(PeerStatus::Errored);
        let _ = events
            .send(PeerEvent::Disconnected {
                peer: Arc::clone(self),
            })
            .await;
    }

    async fn reconnect(&self) -> Option<TcpStream> {
        tokio::select! {
            _ = self.cancel.cancelled() => return None,
            _ = tokio::time::sleep(self.settings.reconnect_delay) => {}
        }

        if !self.set_status(PeerStatus::Connecting) {
            return None;
        }
        log::info!("Reconnecting to {}", self.endpoint);
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return None,
            result = dial(&self.endpoint, self.settings.connect_timeout) => result,
        };

        match result {
            Ok(stream) => {
                // Socket-level state only; counters and caches carry over
                self.state.lock().reset_announced();
                self.handshaken.store(false, Ordering::SeqCst);
                self.in_flight.store(false, Ordering::SeqCst);
                if !self.set_status(PeerStatus::Connected) {
                    return None;
                }
                log::info!("Reconnected to {}", self.endpoint);
                Some(stream)
            }
            Err(e) => {
                log::warn!("Reconnect to {} failed: {}", self.endpoint, e);
                None
            }
        }
    }

    async fn drive(
        self: &Arc<Self>,
        stream: TcpStream,
        rx: &mut mpsc::Receiver<Envelope>,
        events: &mpsc::Sender<PeerEvent>,
    ) -> LinkOutcome {
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, FrameCodec::new());
        let mut writer = FramedWrite::new(write_half, FrameCodec::new());

        let announce = Envelope::new(self.next_id(), Payload::Announce(self.local.clone()));
        if let Err(e) = self.write_envelope(&mut writer, &announce).await {
            return LinkOutcome::Failed(e.to_string());
        }

        tokio::select! {
            _ = self.cancel.cancelled() => LinkOutcome::Closed,
            outcome = self.read_loop(&mut reader, events) => outcome,
            outcome = self.write_loop(&mut writer, rx) => outcome,
            outcome = self.watchdog() => outcome,
        }
    }

    async fn read_loop(
        self: &Arc<Self>,
        reader: &mut FramedRead<OwnedReadHalf, FrameCodec>,
        events: &mpsc::Sender<PeerEvent>,
    ) -> LinkOutcome {
        loop {
            let frame = match reader.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(FrameError::ExcessiveLength(len))) => {
                    log::warn!("Peer {} sent a {} byte frame, dropping", self.endpoint, len);
                    self.report(events, Misbehavior::ExcessivelyOversizedMessage)
                        .await;
                    return LinkOutcome::Dropped;
                }
                Some(Err(FrameError::IoError(e))) => return LinkOutcome::Failed(e.to_string()),
                None => return LinkOutcome::Failed("closed by peer".to_string()),
            };
            let wire_len = frame.len() + 4;

            if frame.len() > SOFT_FRAME_LIMIT {
                log::warn!(
                    "Discarding {} byte message from {} (limit {})",
                    frame.len(),
                    self.endpoint,
                    SOFT_FRAME_LIMIT
                );
                self.state.lock().record_discarded(wire_len);
                self.report(events, Misbehavior::OversizedMessage).await;
                continue;
            }

            let envelope = match Envelope::from_bytes(&frame) {
                Ok(envelope) => envelope,
                Err(e) => {
                    log::debug!("Malformed envelope from {}: {}", self.endpoint, e);
                    self.state.lock().record_discarded(wire_len);
                    self.report(events, Misbehavior::MalformedEnvelope).await;
                    continue;
                }
            };

            let verdict = {
                let mut state = self.state.lock();
                state.record_received(wire_len);
                match (envelope.kind(), state.has_announced()) {
                    (MessageKind::Announce, false) => {
                        state.mark_announced();
                        None
                    }
                    (MessageKind::Announce, true) => Some(Misbehavior::DuplicateAnnounce),
                    (_, false) => Some(Misbehavior::UnannouncedTraffic),
                    (_, true) => None,
                }
            };

            match verdict {
                Some(Misbehavior::UnannouncedTraffic) => {
                    log::debug!(
                        "Ignoring {} from unannounced peer {}",
                        envelope.kind(),
                        self.endpoint
                    );
                    self.report(events, Misbehavior::UnannouncedTraffic).await;
                    continue;
                }
                Some(kind) => {
                    self.report(events, kind).await;
                    continue;
                }
                None => {}
            }

            log::trace!("Received {} from {}", envelope.kind(), self.endpoint);
            let event = PeerEvent::Message {
                peer: Arc::clone(self),
                envelope,
            };
            if events.send(event).await.is_err() {
                return LinkOutcome::Closed;
            }
        }
    }

    async fn report(self: &Arc<Self>, events: &mpsc::Sender<PeerEvent>, kind: Misbehavior) {
        let _ = events
            .send(PeerEvent::Misbehavior {
                peer: Arc::clone(self),
                kind,
            })
            .await;
    }

    async fn write_loop(
        &self,
        writer: &mut FramedWrite<OwnedWriteHalf, FrameCodec>,
        rx: &mut mpsc::Receiver<Envelope>,
    ) -> LinkOutcome {
        loop {
            let Some(envelope) = rx.recv().await else {
                return LinkOutcome::Closed;
            };
            if let Err(e) = self.write_envelope(writer, &envelope).await {
                return LinkOutcome::Failed(e.to_string());
            }
        }
    }

    /// Write one frame; the single in-flight buffer lives in the codec
    async fn write_envelope(
        &self,
        writer: &mut FramedWrite<OwnedWriteHalf, FrameCodec>,
        envelope: &Envelope,
    ) -> Result<(), FrameError> {
        let bytes = match envelope.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Failed to encode {}: {}", envelope.kind(), e);
                return Ok(());
            }
        };
        let wire_len = bytes.len() + 4;

        *self.write_progress_at.lock() = Instant::now();
        self.in_flight.store(true, Ordering::SeqCst);
        writer.send(Bytes::from(bytes)).await?;
        self.in_flight.store(false, Ordering::SeqCst);
        *self.write_progress_at.lock() = Instant::now();

        self.state.lock().record_sent(wire_len);
        log::trace!("Sent {} to {}", envelope.kind(), self.endpoint);
        Ok(())
    }

    async fn watchdog(&self) -> LinkOutcome {
        let mut ticker = tokio::time::interval(WATCHDOG_INTERVAL);
        let mut warned = false;

        loop {
            ticker.tick().await;
            let pending = self.in_flight.load(Ordering::SeqCst);
            let pending_for = self.write_progress_at.lock().elapsed();

            match write_health(pending_for, pending) {
                WriteHealth::Healthy => warned = false,
                WriteHealth::Slow if !warned => {
                    log::warn!(
                        "No write to {} completed for {}s ({} queued)",
                        self.endpoint,
                        pending_for.as_secs(),
                        self.queue_len()
                    );
                    warned = true;
                }
                WriteHealth::Slow => {}
                WriteHealth::Dead => {
                    log::warn!(
                        "Write to {} stalled for {}s, disconnecting",
                        self.endpoint,
                        pending_for.as_secs()
                    );
                    return LinkOutcome::Dropped;
                }
            }
        }
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("key", &self.key())
            .field("direction", &self.direction)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn local_identity() -> NodeIdentity {
        NodeIdentity::local(&NetworkConfig::default())
    }

    fn fast_settings() -> PeerSettings {
        PeerSettings {
            reconnect_delay: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(2),
        }
    }

    /// Connected (ours, theirs) socket pair plus the listener
    async fn socket_pair() -> (TcpStream, TcpStream, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ours = TcpStream::connect(addr).await.unwrap();
        let (theirs, _) = listener.accept().await.unwrap();
        (ours, theirs, listener)
    }

    async fn write_frame(stream: &mut TcpStream, payload: &[u8]) {
        let mut buf = bytes::BytesMut::new();
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);
        stream.write_all(&buf).await.unwrap();
    }

    async fn read_envelope(reader: &mut FramedRead<TcpStream, FrameCodec>) -> Envelope {
        let frame = timeout(WAIT, reader.next()).await.unwrap().unwrap().unwrap();
        Envelope::from_bytes(&frame).unwrap()
    }

    async fn next_event(rx: &mut mpsc::Receiver<PeerEvent>) -> PeerEvent {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    fn announce_bytes() -> Vec<u8> {
        Envelope::new(1, Payload::Announce(local_identity()))
            .to_bytes()
            .unwrap()
    }

    #[test]
    fn test_status_transitions() {
        use PeerStatus::*;
        let out = Direction::Outbound;
        let inb = Direction::Inbound;

        assert!(Initialized.can_transition_to(Connected, inb));
        assert!(Connecting.can_transition_to(Connected, out));
        assert!(Connected.can_transition_to(Errored, inb));
        assert!(Errored.can_transition_to(Connected, out));
        assert!(Errored.can_transition_to(Connecting, out));
        assert!(!Errored.can_transition_to(Connected, inb));
        assert!(!Errored.can_transition_to(Connecting, inb));
        assert!(!Connected.can_transition_to(Initialized, out));
        assert!(!Closed.can_transition_to(Connected, out));
        assert!(Errored.can_transition_to(Closed, inb));
    }

    #[test]
    fn test_write_health() {
        assert_eq!(write_health(Duration::from_secs(600), false), WriteHealth::Healthy);
        assert_eq!(write_health(Duration::from_secs(59), true), WriteHealth::Healthy);
        assert_eq!(write_health(Duration::from_secs(61), true), WriteHealth::Slow);
        assert_eq!(write_health(Duration::from_secs(301), true), WriteHealth::Dead);
    }

    #[test]
    fn test_send_queue_backpressure() {
        let peer = PeerConnection::new(
            Endpoint::new("8.8.8.8", 7331),
            Direction::Outbound,
            local_identity(),
            PeerSettings::default(),
        );

        let mut accepted = 0;
        for i in 0..(SEND_QUEUE_CAPACITY + 500) {
            if peer.send(Payload::Heartbeat { timestamp: i as i64 }) {
                accepted += 1;
            }
        }

        assert_eq!(accepted, SEND_QUEUE_CAPACITY);
        assert_eq!(peer.queue_len(), SEND_QUEUE_CAPACITY);
    }

    #[test]
    fn test_closed_peer_rejects_sends() {
        let peer = PeerConnection::new(
            Endpoint::new("8.8.8.8", 7331),
            Direction::Inbound,
            local_identity(),
            PeerSettings::default(),
        );
        assert!(peer.disconnect());
        assert!(!peer.disconnect());
        assert_eq!(peer.status(), PeerStatus::Closed);
        assert!(!peer.send(Payload::PeerTableRequest));
    }

    #[tokio::test]
    async fn test_announce_sent_first_then_queue() {
        let (ours, theirs, _listener) = socket_pair().await;
        let (tx, _rx) = mpsc::channel(16);
        let identity = local_identity();
        let peer = PeerConnection::new(
            Endpoint::from(ours.peer_addr().unwrap()),
            Direction::Inbound,
            identity.clone(),
            fast_settings(),
        );
        peer.send(Payload::PeerTableRequest);
        peer.spawn(ours, tx);

        let mut reader = FramedRead::new(theirs, FrameCodec::new());
        let first = read_envelope(&mut reader).await;
        assert_eq!(first.payload, Payload::Announce(identity));
        let second = read_envelope(&mut reader).await;
        assert_eq!(second.kind(), MessageKind::PeerTableRequest);
        assert_ne!(second.id, first.id);
        assert_eq!(peer.status(), PeerStatus::Connected);
    }

    #[tokio::test]
    async fn test_unannounced_then_announced_traffic() {
        let (ours, mut theirs, _listener) = socket_pair().await;
        let (tx, mut rx) = mpsc::channel(16);
        let peer = PeerConnection::new(
            Endpoint::from(ours.peer_addr().unwrap()),
            Direction::Inbound,
            local_identity(),
            fast_settings(),
        );
        peer.spawn(ours, tx);

        let heartbeat = Envelope::new(1, Payload::Heartbeat { timestamp: 1 })
            .to_bytes()
            .unwrap();
        write_frame(&mut theirs, &heartbeat).await;
        match next_event(&mut rx).await {
            PeerEvent::Misbehavior { kind, .. } => assert_eq!(kind, Misbehavior::UnannouncedTraffic),
            other => panic!("Unexpected event {:?}", other),
        }

        write_frame(&mut theirs, &announce_bytes()).await;
        write_frame(&mut theirs, &heartbeat).await;

        match next_event(&mut rx).await {
            PeerEvent::Message { envelope, .. } => assert_eq!(envelope.kind(), MessageKind::Announce),
            other => panic!("Unexpected event {:?}", other),
        }
        match next_event(&mut rx).await {
            PeerEvent::Message { envelope, .. } => assert_eq!(envelope.kind(), MessageKind::Heartbeat),
            other => panic!("Unexpected event {:?}", other),
        }
        assert!(peer.has_announced());
    }

    #[tokio::test]
    async fn test_malformed_envelope_keeps_connection() {
        let (ours, mut theirs, _listener) = socket_pair().await;
        let (tx, mut rx) = mpsc::channel(16);
        let peer = PeerConnection::new(
            Endpoint::from(ours.peer_addr().unwrap()),
            Direction::Inbound,
            local_identity(),
            fast_settings(),
        );
        peer.spawn(ours, tx);

        write_frame(&mut theirs, b"{garbage").await;
        write_frame(&mut theirs, &announce_bytes()).await;

        match next_event(&mut rx).await {
            PeerEvent::Misbehavior { kind, .. } => assert_eq!(kind, Misbehavior::MalformedEnvelope),
            other => panic!("Unexpected event {:?}", other),
        }
        match next_event(&mut rx).await {
            PeerEvent::Message { envelope, .. } => assert_eq!(envelope.kind(), MessageKind::Announce),
            other => panic!("Unexpected event {:?}", other),
        }
        assert_eq!(peer.status(), PeerStatus::Connected);
    }

    #[tokio::test]
    async fn test_oversized_frame_discarded_connection_kept() {
        let (ours, mut theirs, _listener) = socket_pair().await;
        let (tx, mut rx) = mpsc::channel(16);
        let peer = PeerConnection::new(
            Endpoint::from(ours.peer_addr().unwrap()),
            Direction::Inbound,
            local_identity(),
            fast_settings(),
        );
        peer.spawn(ours, tx);

        write_frame(&mut theirs, &vec![b'x'; SOFT_FRAME_LIMIT + 1]).await;
        write_frame(&mut theirs, &announce_bytes()).await;

        match next_event(&mut rx).await {
            PeerEvent::Misbehavior { kind, .. } => assert_eq!(kind, Misbehavior::OversizedMessage),
            other => panic!("Unexpected event {:?}", other),
        }
        match next_event(&mut rx).await {
            PeerEvent::Message { envelope, .. } => assert_eq!(envelope.kind(), MessageKind::Announce),
            other => panic!("Unexpected event {:?}", other),
        }
        assert_eq!(peer.status(), PeerStatus::Connected);
        assert!(peer.with_state(|s| s.bytes_received()) > SOFT_FRAME_LIMIT as u64);
    }

    #[tokio::test]
    async fn test_excessive_frame_drops_connection() {
        let (ours, mut theirs, _listener) = socket_pair().await;
        let (tx, mut rx) = mpsc::channel(16);
        let peer = PeerConnection::new(
            Endpoint::from(ours.peer_addr().unwrap()),
            Direction::Outbound,
            local_identity(),
            fast_settings(),
        );
        peer.spawn(ours, tx);

        let mut header = bytes::BytesMut::new();
        header.put_u32(17 * 1024 * 1024);
        theirs.write_all(&header).await.unwrap();

        match next_event(&mut rx).await {
            PeerEvent::Misbehavior { kind, .. } => {
                assert_eq!(kind, Misbehavior::ExcessivelyOversizedMessage)
            }
            other => panic!("Unexpected event {:?}", other),
        }
        // Dropped for misbehavior: no redial even though we dialed it
        assert!(matches!(next_event(&mut rx).await, PeerEvent::Disconnected { .. }));
        assert_eq!(peer.status(), PeerStatus::Errored);
    }

    #[tokio::test]
    async fn test_inbound_remote_close_raises_disconnect() {
        let (ours, theirs, _listener) = socket_pair().await;
        let (tx, mut rx) = mpsc::channel(16);
        let peer = PeerConnection::new(
            Endpoint::from(ours.peer_addr().unwrap()),
            Direction::Inbound,
            local_identity(),
            fast_settings(),
        );
        peer.spawn(ours, tx);
        drop(theirs);

        assert!(matches!(next_event(&mut rx).await, PeerEvent::Disconnected { .. }));
        assert_eq!(peer.status(), PeerStatus::Errored);
    }

    #[tokio::test]
    async fn test_outbound_reconnects_after_failure() {
        let (ours, theirs, listener) = socket_pair().await;
        let (tx, mut rx) = mpsc::channel(16);
        let peer = PeerConnection::new(
            Endpoint::from(listener.local_addr().unwrap()),
            Direction::Outbound,
            local_identity(),
            fast_settings(),
        );
        peer.spawn(ours, tx);
        peer.with_state(|s| s.request_sent());
        drop(theirs);

        // The redial lands on the same listener and announces again
        let (second, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let mut reader = FramedRead::new(second, FrameCodec::new());
        let first = read_envelope(&mut reader).await;
        assert_eq!(first.kind(), MessageKind::Announce);

        assert_eq!(peer.status(), PeerStatus::Connected);
        assert!(!peer.has_announced());
        // Counters survive the reconnect
        assert_eq!(peer.with_state(|s| s.unfulfilled_requests()), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_explicit_disconnect_is_silent() {
        let (ours, _theirs, _listener) = socket_pair().await;
        let (tx, mut rx) = mpsc::channel(16);
        let peer = PeerConnection::new(
            Endpoint::from(ours.peer_addr().unwrap()),
            Direction::Outbound,
            local_identity(),
            fast_settings(),
        );
        peer.spawn(ours, tx);
        peer.disconnect();

        // Task exits without reporting; the sender is dropped with it
        assert!(timeout(WAIT, rx.recv()).await.unwrap().is_none());
        assert_eq!(peer.status(), PeerStatus::Closed);
    }
}
