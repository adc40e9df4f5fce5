//! Peer table
//!
//! Registry of live connections, discovered candidates, bans and dial
//! cool-downs. All maps are concurrent; no lock covers the whole table.
//! Connection events are consumed by a single dispatch task, so announce
//! handling, re-keying and removal never race each other.

use crate::config::NetworkConfig;
use crate::network::ban::Ban;
use crate::network::bootstrap::Bootstrapper;
use crate::network::endpoint::Endpoint;
use crate::network::events::{EventBus, NetworkEvent};
use crate::network::identity::NodeIdentity;
use crate::network::message::{Envelope, Payload};
use crate::network::peer::{
    Direction, NetworkError, PeerConnection, PeerEvent, PeerInfo, PeerSettings, PeerStatus,
};
use crate::network::server::dial;
use crate::network::warden::{Misbehavior, Verdict, Warden};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use futures::future::join_all;
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Connection events buffered between peers and the dispatcher
pub const PEER_EVENT_BUFFER: usize = 1000;

/// Why a connection was refused
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    #[error("peer table is full")]
    TableFull,
    #[error("address is blacklisted")]
    Blacklisted,
    #[error("already connected")]
    Duplicate,
    #[error("endpoint is this node")]
    SelfConnection,
    #[error("network is shutting down")]
    NotRunning,
}

/// A known, unconnected peer
#[derive(Debug, Clone)]
pub struct Candidate {
    pub endpoint: Endpoint,
    pub identity: Option<NodeIdentity>,
    pub discovered_at: DateTime<Utc>,
}

/// Table size snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableStats {
    pub connected: usize,
    pub announced: usize,
    pub candidates: usize,
    pub banned: usize,
    pub cooling_down: usize,
    pub dialing: usize,
}

/// What one upkeep pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpkeepReport {
    pub groomed: usize,
    pub cool_downs_released: usize,
    pub dialed: usize,
    pub bans_released: usize,
    pub peers: usize,
}

/// The peer registry
pub struct PeerTable {
    config: NetworkConfig,
    identity: NodeIdentity,
    settings: PeerSettings,
    peers: DashMap<String, Arc<PeerConnection>>,
    candidates: DashMap<String, Candidate>,
    blacklist: DashMap<String, Ban>,
    do_not_connect: DashMap<String, DateTime<Utc>>,
    dialing: DashSet<String>,
    explicit_peers: DashSet<Endpoint>,
    own_endpoints: DashSet<Endpoint>,
    warden: Warden,
    bootstrapper: Bootstrapper,
    events: EventBus,
    peer_tx: mpsc::Sender<PeerEvent>,
    running: AtomicBool,
}

impl PeerTable {
    /// Build a table; the receiver must be handed to [`PeerTable::dispatch`]
    pub fn new(
        config: NetworkConfig,
        identity: NodeIdentity,
        events: EventBus,
    ) -> Result<(Arc<Self>, mpsc::Receiver<PeerEvent>), NetworkError> {
        let (bootstrap_peers, explicit_peers) = config.endpoints()?;
        let (peer_tx, peer_rx) = mpsc::channel(PEER_EVENT_BUFFER);

        let bootstrapper = Bootstrapper::new(
            bootstrap_peers,
            config.dns_seeds.clone(),
            config.default_port,
        )
        .with_refresh_interval(config.bootstrap_refresh());

        let table = Arc::new(Self {
            settings: PeerSettings::from(&config),
            warden: Warden::new(config.ban_threshold),
            explicit_peers: explicit_peers.into_iter().collect(),
            config,
            identity,
            peers: DashMap::new(),
            candidates: DashMap::new(),
            blacklist: DashMap::new(),
            do_not_connect: DashMap::new(),
            dialing: DashSet::new(),
            own_endpoints: DashSet::new(),
            bootstrapper,
            events,
            peer_tx,
            running: AtomicBool::new(true),
        });

        Ok((table, peer_rx))
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn warden(&self) -> &Warden {
        &self.warden
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Admission
    // =========================================================================

    /// Admit an accepted socket. On rejection the socket is dropped.
    pub fn register_incoming(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<Arc<PeerConnection>, Rejection> {
        let endpoint = Endpoint::from(addr);

        if !self.is_running() {
            return Err(Rejection::NotRunning);
        }
        if self.peer_count() >= self.config.max_peers {
            log::info!("Rejecting inbound {}: table full", endpoint);
            return Err(Rejection::TableFull);
        }
        if self.is_banned(endpoint.address()) {
            log::info!("Rejecting inbound {}: blacklisted", endpoint);
            return Err(Rejection::Blacklisted);
        }

        let peer = PeerConnection::new(
            endpoint.clone(),
            Direction::Inbound,
            self.identity.clone(),
            self.settings,
        );
        self.insert_peer(&peer)?;

        log::info!("Accepted inbound peer {}", endpoint);
        peer.spawn(stream, self.peer_tx.clone());
        Ok(peer)
    }

    /// Dial `endpoint` and register the connection
    pub async fn establish_outbound(
        &self,
        endpoint: Endpoint,
    ) -> Result<Arc<PeerConnection>, NetworkError> {
        if !self.is_running() {
            log::error!("Outbound dial to {} while not running", endpoint);
            return Err(NetworkError::NotRunning);
        }

        let key = endpoint.key();
        if self.is_own_endpoint(&endpoint) {
            return Err(NetworkError::Rejected(Rejection::SelfConnection));
        }
        if self.peers.contains_key(&key) {
            return Err(NetworkError::Rejected(Rejection::Duplicate));
        }
        if self.peer_count() >= self.config.max_peers {
            return Err(NetworkError::Rejected(Rejection::TableFull));
        }
        if self.is_banned(endpoint.address()) {
            return Err(NetworkError::Rejected(Rejection::Blacklisted));
        }
        if !self.dialing.insert(key.clone()) {
            return Err(NetworkError::Rejected(Rejection::Duplicate));
        }

        let peer = PeerConnection::new(
            endpoint,
            Direction::Outbound,
            self.identity.clone(),
            self.settings,
        );
        peer.set_status(PeerStatus::Connecting);

        log::debug!("Dialing {}", peer.endpoint());
        let result = dial(peer.endpoint(), self.settings.connect_timeout).await;
        self.dialing.remove(&key);
        let stream = result?;

        if let Some(identity) = self
            .candidates
            .get(&key)
            .and_then(|candidate| candidate.identity.clone())
        {
            peer.set_identity(identity);
        }
        self.insert_peer(&peer).map_err(NetworkError::Rejected)?;

        log::info!("Connected to peer {}", key);
        peer.spawn(stream, self.peer_tx.clone());
        Ok(peer)
    }

    fn insert_peer(&self, peer: &Arc<PeerConnection>) -> Result<(), Rejection> {
        match self.peers.entry(peer.key()) {
            Entry::Occupied(existing) if !existing.get().status().is_terminal() => {
                log::debug!("Already connected to {}", peer.key());
                Err(Rejection::Duplicate)
            }
            Entry::Occupied(mut stale) => {
                stale.insert(Arc::clone(peer));
                Ok(())
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(peer));
                Ok(())
            }
        }
    }

    fn is_own_endpoint(&self, endpoint: &Endpoint) -> bool {
        if self.own_endpoints.contains(endpoint) {
            return true;
        }
        if endpoint.port() != self.identity.port {
            return false;
        }
        endpoint.address() == self.identity.address
            || endpoint.address() == self.config.listen_address
    }

    // =========================================================================
    // Event dispatch
    // =========================================================================

    /// Consume connection events until every sender is gone
    pub async fn dispatch(self: Arc<Self>, mut rx: mpsc::Receiver<PeerEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle_event(event);
        }
        log::debug!("Peer event dispatcher stopped");
    }

    pub fn handle_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::Message { peer, envelope } => self.handle_message(&peer, envelope),
            PeerEvent::Misbehavior { peer, kind } => self.report_misbehavior(&peer, kind),
            PeerEvent::Disconnected { peer } => {
                log::info!("Peer {} disconnected", peer.key());
                self.drop_peer(&peer);
            }
        }
    }

    fn handle_message(&self, peer: &Arc<PeerConnection>, envelope: Envelope) {
        // An errored outbound link may still be redialing
        if peer.status() == PeerStatus::Closed {
            return;
        }

        match &envelope.payload {
            Payload::Announce(identity) => {
                if !self.accept_announce(peer, identity) {
                    return;
                }
            }
            Payload::PeerTableRequest => {
                let shared = self.shareable_identities_for(peer);
                peer.reply(envelope.id, Payload::PeerTableReply(shared));
            }
            Payload::PeerTableReply(identities) => {
                if !peer.with_state(|state| state.request_fulfilled()) {
                    self.report_misbehavior(peer, Misbehavior::UnsolicitedPeerTable);
                }
                self.process_remote_peer_table(identities);
            }
            _ => {}
        }

        self.events.publish(NetworkEvent::Message {
            key: peer.key(),
            kind: envelope.kind(),
            envelope,
        });
    }

    fn accept_announce(&self, peer: &Arc<PeerConnection>, identity: &NodeIdentity) -> bool {
        if identity.protocol_version != self.identity.protocol_version {
            log::warn!(
                "Peer {} speaks protocol {}, we speak {}",
                peer.key(),
                identity.protocol_version,
                self.identity.protocol_version
            );
            self.report_misbehavior(peer, Misbehavior::ProtocolMismatch);
            return false;
        }

        if identity.session_id == self.identity.session_id {
            log::info!("Connection {} is to ourselves, closing", peer.key());
            self.own_endpoints.insert(peer.endpoint().clone());
            self.drop_peer(peer);
            return false;
        }

        if let Some(existing) = self.find_link_to(&identity.session_id, peer) {
            let ours = &self.identity.session_id;
            let theirs = &identity.session_id;
            let dialer = |conn: &PeerConnection| if conn.is_outbound() { ours } else { theirs };

            if dialer(peer.as_ref()) < dialer(existing.as_ref()) {
                log::info!(
                    "Duplicate link to {}, keeping {} over {}",
                    theirs,
                    peer.key(),
                    existing.key()
                );
                self.drop_peer(&existing);
            } else {
                log::info!(
                    "Duplicate link to {}, keeping {} over {}",
                    theirs,
                    existing.key(),
                    peer.key()
                );
                self.drop_peer(peer);
                return false;
            }
        }

        let first = peer.complete_handshake(identity.clone());
        if !peer.is_outbound() {
            self.rekey_inbound(peer, identity);
        }

        let key = peer.key();
        self.candidates.remove(&key);
        if !first {
            log::info!("Peer {} announced again after reconnecting", key);
            return true;
        }
        log::info!(
            "Peer {} announced: {} protocol {}",
            key,
            identity.user_agent(),
            identity.protocol_version
        );
        self.events.publish(NetworkEvent::PeerConnected {
            key,
            identity: identity.clone(),
        });
        true
    }

    fn find_link_to(
        &self,
        session_id: &str,
        except: &Arc<PeerConnection>,
    ) -> Option<Arc<PeerConnection>> {
        self.peers
            .iter()
            .filter(|entry| !Arc::ptr_eq(entry.value(), except))
            .filter(|entry| entry.is_handshaken() && !entry.status().is_terminal())
            .find(|entry| {
                entry
                    .identity()
                    .map(|id| id.session_id == session_id)
                    .unwrap_or(false)
            })
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Move an inbound connection from its socket key to the endpoint the
    /// peer listens on
    fn rekey_inbound(&self, peer: &Arc<PeerConnection>, identity: &NodeIdentity) {
        let canonical = match identity.endpoint() {
            Some(endpoint) => endpoint,
            None if identity.port != 0 => Endpoint::new(peer.endpoint().address(), identity.port),
            None => return,
        };
        let old_key = peer.key();
        let new_key = canonical.key();
        if old_key == new_key {
            return;
        }

        match self.peers.entry(new_key.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(peer));
            }
            Entry::Occupied(_) => return,
        }
        peer.set_key(new_key);
        self.peers.remove_if(&old_key, |_, v| Arc::ptr_eq(v, peer));
    }

    /// Disconnect and unregister one connection
    fn drop_peer(&self, peer: &Arc<PeerConnection>) {
        peer.disconnect();
        let key = peer.key();
        let removed = self
            .peers
            .remove_if(&key, |_, v| Arc::ptr_eq(v, peer))
            .is_some();

        if removed && peer.was_announced() {
            self.events.publish(NetworkEvent::PeerDisconnected { key });
        }
    }

    /// Apply the warden's verdict for one misbehavior signal
    pub fn report_misbehavior(&self, peer: &Arc<PeerConnection>, kind: Misbehavior) {
        let address = peer.endpoint().address().to_string();
        let verdict = self.warden.penalize(&address, kind);
        let score = match verdict {
            Verdict::Tolerated { score } | Verdict::Ban { score } => score,
        };

        log::info!("Misbehavior from {}: {} (score {})", peer.key(), kind, score);
        self.events.publish(NetworkEvent::MisbehaviorDetected {
            key: peer.key(),
            reason: kind,
            score,
        });

        if let Verdict::Ban { .. } = verdict {
            self.ban_address(&address);
        } else if kind.disconnects() {
            self.drop_peer(peer);
        }
    }

    // =========================================================================
    // Discovery
    // =========================================================================

    /// Turn a remote peer table into candidates; returns how many were added
    pub fn process_remote_peer_table(&self, identities: &[NodeIdentity]) -> usize {
        let mut added = 0;

        for identity in identities {
            if self.identity.is_same_node(identity) {
                continue;
            }
            let Some(endpoint) = identity.endpoint() else {
                continue;
            };
            if endpoint.is_private() {
                log::debug!("Ignoring private address {} in peer table", endpoint);
                continue;
            }
            let key = endpoint.key();
            if self.peers.contains_key(&key) || self.is_banned(endpoint.address()) {
                continue;
            }
            if self.is_own_endpoint(&endpoint) {
                continue;
            }

            self.candidates.insert(
                key,
                Candidate {
                    endpoint,
                    identity: Some(identity.clone()),
                    discovered_at: Utc::now(),
                },
            );
            added += 1;
        }

        if added > 0 {
            log::debug!("Added {} candidates from peer table", added);
        }
        added
    }

    /// Add an endpoint with no known identity as a candidate
    pub fn add_candidate(&self, endpoint: Endpoint) -> bool {
        let key = endpoint.key();
        if self.peers.contains_key(&key) || self.is_own_endpoint(&endpoint) {
            return false;
        }
        self.candidates.entry(key).or_insert_with(|| Candidate {
            endpoint,
            identity: None,
            discovered_at: Utc::now(),
        });
        true
    }

    pub fn candidates(&self) -> Vec<Candidate> {
        self.candidates.iter().map(|c| c.value().clone()).collect()
    }

    /// Identities of announced peers that allow their address to be shared
    pub fn shareable_identities(&self) -> Vec<NodeIdentity> {
        self.shareable_except(None)
    }

    /// Shareable identities, leaving out `requester` itself
    pub fn shareable_identities_for(&self, requester: &Arc<PeerConnection>) -> Vec<NodeIdentity> {
        self.shareable_except(Some(requester))
    }

    fn shareable_except(&self, skip: Option<&Arc<PeerConnection>>) -> Vec<NodeIdentity> {
        self.peers
            .iter()
            .filter(|entry| entry.is_handshaken())
            .filter(|entry| skip.map_or(true, |peer| !Arc::ptr_eq(entry.value(), peer)))
            .filter_map(|entry| entry.identity())
            .filter(|identity| identity.share_address && identity.endpoint().is_some())
            .collect()
    }

    /// Configure an explicit peer; it stays a candidate while unconnected
    pub fn add_peer(&self, endpoint: Endpoint) {
        self.explicit_peers.insert(endpoint.clone());
        self.add_candidate(endpoint);
    }

    pub fn remove_peer(&self, endpoint: &Endpoint) {
        self.explicit_peers.remove(endpoint);
        self.candidates.remove(&endpoint.key());
        self.disconnect(&endpoint.key());
    }

    // =========================================================================
    // Bans and cool-downs
    // =========================================================================

    /// Disconnect every peer from `address` and ban it for four hours
    pub fn ban_address(&self, address: &str) {
        self.ban(Ban::temporary(address));
    }

    pub fn ban_address_permanently(&self, address: &str) {
        self.ban(Ban::permanent(address));
    }

    fn ban(&self, ban: Ban) {
        let address = ban.address.clone();
        let permanent = ban.is_permanent();

        // Blacklist first so no new inbound slips in while we disconnect
        match self.blacklist.entry(address.clone()) {
            Entry::Occupied(mut existing) => {
                if !existing.get().is_permanent() {
                    existing.insert(ban);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(ban);
            }
        }

        let doomed: Vec<Arc<PeerConnection>> = self
            .peers
            .iter()
            .filter(|entry| entry.endpoint().address() == address)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for peer in &doomed {
            self.drop_peer(peer);
        }
        self.candidates.retain(|_, c| c.endpoint.address() != address);

        log::warn!(
            "Banned {} ({}), disconnected {} peers",
            address,
            if permanent { "permanent" } else { "temporary" },
            doomed.len()
        );
        self.events
            .publish(NetworkEvent::PeerBanned { address, permanent });
    }

    pub fn is_banned(&self, address: &str) -> bool {
        self.is_banned_at(address, Utc::now())
    }

    pub fn is_banned_at(&self, address: &str, now: DateTime<Utc>) -> bool {
        self.blacklist
            .get(address)
            .map(|ban| !ban.is_expired_at(now))
            .unwrap_or(false)
    }

    pub fn bans(&self) -> Vec<Ban> {
        self.blacklist.iter().map(|b| b.value().clone()).collect()
    }

    /// Drop expired bans and forget their scores
    pub fn release_expired_bans_at(&self, now: DateTime<Utc>) -> usize {
        let mut released = Vec::new();
        self.blacklist.retain(|address, ban| {
            if ban.is_expired_at(now) {
                released.push(address.clone());
                false
            } else {
                true
            }
        });

        for address in &released {
            log::info!("Ban on {} expired", address);
            self.warden.forgive(address);
        }
        released.len()
    }

    pub fn cool_down_at(&self, address: &str, now: DateTime<Utc>) {
        self.do_not_connect
            .insert(address.to_string(), now + self.config.cool_down());
    }

    pub fn is_cooling_down_at(&self, address: &str, now: DateTime<Utc>) -> bool {
        self.do_not_connect
            .get(address)
            .map(|until| *until > now)
            .unwrap_or(false)
    }

    pub fn release_cool_downs_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.do_not_connect.len();
        self.do_not_connect.retain(|_, until| *until > now);
        before - self.do_not_connect.len()
    }

    // =========================================================================
    // Upkeep
    // =========================================================================

    pub async fn upkeep(&self) -> UpkeepReport {
        self.upkeep_at(Utc::now()).await
    }

    /// One maintenance pass
    pub async fn upkeep_at(&self, now: DateTime<Utc>) -> UpkeepReport {
        if !self.is_running() {
            return UpkeepReport::default();
        }

        let mut report = UpkeepReport {
            groomed: self.groom_at(now),
            cool_downs_released: self.release_cool_downs_at(now),
            ..Default::default()
        };
        report.dialed = self.ensure_minimum_peers_at(now).await;
        report.bans_released = self.release_expired_bans_at(now);
        self.send_heartbeats(now);
        report.peers = self.peer_count();

        log::info!(
            "Upkeep: {} peers, {} candidates, {} groomed, {} dialed, {} bans released",
            report.peers,
            self.candidates.len(),
            report.groomed,
            report.dialed,
            report.bans_released
        );
        report
    }

    /// Disconnect peers that have been silent past the timeout
    pub fn groom_at(&self, now: DateTime<Utc>) -> usize {
        let timeout = self.config.peer_timeout();
        let stale: Vec<Arc<PeerConnection>> = self
            .peers
            .iter()
            .filter(|entry| entry.with_state(|state| state.is_stale_at(now, timeout)))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for peer in &stale {
            log::info!("Grooming silent peer {}", peer.key());
            self.drop_peer(peer);
        }
        stale.len()
    }

    async fn ensure_minimum_peers_at(&self, now: DateTime<Utc>) -> usize {
        if self.peer_count() >= self.config.min_peers {
            return 0;
        }

        let explicit: Vec<Endpoint> = self
            .explicit_peers
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for endpoint in explicit {
            self.add_candidate(endpoint);
        }

        if self.candidates.is_empty() {
            if self.peer_count() > 0 {
                self.request_peer_tables();
                return 0;
            }
            if self.config.enable_bootstrap {
                let fresh = self
                    .bootstrapper
                    .next_n(self.config.bootstrap_peer_limit)
                    .await;
                log::debug!("Bootstrapper supplied {} endpoints", fresh.len());
                for endpoint in fresh {
                    self.add_candidate(endpoint);
                }
            }
        }

        let mut dialed = self.dial_candidates(now).await;

        if self.peer_count() == 0 {
            if !self.do_not_connect.is_empty() {
                log::info!("No peers, clearing {} cool-downs", self.do_not_connect.len());
                self.do_not_connect.clear();
                dialed += self.dial_candidates(now).await;
            }
            if self.peer_count() == 0 {
                log::warn!("No peers after exhausting candidates and bootstrap");
                self.events.publish(NetworkEvent::ConnectivityLost);
            }
        }
        dialed
    }

    /// Dial a random selection of candidates; returns successful dials
    async fn dial_candidates(&self, now: DateTime<Utc>) -> usize {
        let needed = self.config.min_peers.saturating_sub(self.peer_count());
        let budget = needed.min(self.config.max_dials_per_upkeep);
        if budget == 0 {
            return 0;
        }

        let mut pool = self.candidates();
        pool.shuffle(&mut rand::thread_rng());
        let selected: Vec<Endpoint> = pool
            .into_iter()
            .map(|candidate| candidate.endpoint)
            .filter(|endpoint| !self.peers.contains_key(&endpoint.key()))
            .filter(|endpoint| !self.is_cooling_down_at(endpoint.address(), now))
            .filter(|endpoint| !self.is_banned_at(endpoint.address(), now))
            .take(budget)
            .collect();

        let attempts = selected
            .iter()
            .map(|endpoint| self.establish_outbound(endpoint.clone()));
        let results = join_all(attempts).await;

        let mut connected = 0;
        for (endpoint, result) in selected.iter().zip(results) {
            match result {
                Ok(_) => {
                    self.candidates.remove(&endpoint.key());
                    connected += 1;
                }
                Err(NetworkError::Rejected(reason)) => {
                    log::debug!("Skipped candidate {}: {}", endpoint, reason);
                    if reason == Rejection::SelfConnection {
                        self.candidates.remove(&endpoint.key());
                    }
                }
                Err(e) => {
                    log::info!("Dial to {} failed: {}", endpoint, e);
                    self.cool_down_at(endpoint.address(), now);
                }
            }
        }
        connected
    }

    fn request_peer_tables(&self) {
        for peer in self.announced_peers() {
            if peer.send(Payload::PeerTableRequest) {
                peer.with_state(|state| state.request_sent());
            }
        }
    }

    fn send_heartbeats(&self, now: DateTime<Utc>) {
        let timestamp = now.timestamp();
        for peer in self.announced_peers() {
            peer.send(Payload::Heartbeat { timestamp });
        }
    }

    // =========================================================================
    // Messaging
    // =========================================================================

    /// Queue a message to one peer
    pub fn send_to(&self, key: &str, payload: Payload) -> bool {
        match self.peers.get(key) {
            Some(peer) if peer.is_handshaken() => peer.send(payload),
            _ => false,
        }
    }

    /// Queue a message to every announced peer; returns how many took it
    pub fn broadcast(&self, payload: Payload) -> usize {
        self.announced_peers()
            .iter()
            .filter(|peer| peer.send(payload.clone()))
            .count()
    }

    /// Relay a block to peers that have neither sent nor received it
    pub fn gossip_block(&self, hash: &str, block: serde_json::Value) -> usize {
        let mut relayed = 0;
        for peer in self.announced_peers() {
            if peer.with_state(|state| state.should_relay_block(hash))
                && peer.send(Payload::Block(block.clone()))
            {
                relayed += 1;
            }
        }
        relayed
    }

    pub fn gossip_transaction(&self, hash: &str, transaction: serde_json::Value) -> usize {
        let mut relayed = 0;
        for peer in self.announced_peers() {
            if peer.with_state(|state| state.should_relay_transaction(hash))
                && peer.send(Payload::Transaction(transaction.clone()))
            {
                relayed += 1;
            }
        }
        relayed
    }

    /// Record that `key` showed us a block; true the first time
    pub fn note_block_seen(&self, key: &str, hash: &str) -> bool {
        self.peers
            .get(key)
            .map(|peer| peer.with_state(|state| state.note_block_seen(hash)))
            .unwrap_or(false)
    }

    pub fn note_transaction_seen(&self, key: &str, hash: &str) -> bool {
        self.peers
            .get(key)
            .map(|peer| peer.with_state(|state| state.note_transaction_seen(hash)))
            .unwrap_or(false)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer(&self, key: &str) -> Option<Arc<PeerConnection>> {
        self.peers.get(key).map(|p| Arc::clone(p.value()))
    }

    pub fn announced_peers(&self) -> Vec<Arc<PeerConnection>> {
        self.peers
            .iter()
            .filter(|entry| entry.is_handshaken())
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Snapshots of every announced peer
    pub fn connected_peers(&self) -> Vec<PeerInfo> {
        self.announced_peers().iter().map(|p| p.info()).collect()
    }

    pub fn stats(&self) -> TableStats {
        TableStats {
            connected: self.peers.len(),
            announced: self.peers.iter().filter(|p| p.is_handshaken()).count(),
            candidates: self.candidates.len(),
            banned: self.blacklist.len(),
            cooling_down: self.do_not_connect.len(),
            dialing: self.dialing.len(),
        }
    }

    /// Disconnect the peer at `key`; false if there was none
    pub fn disconnect(&self, key: &str) -> bool {
        match self.peer(key) {
            Some(peer) => {
                self.drop_peer(&peer);
                true
            }
            None => false,
        }
    }

    /// Stop admitting peers and disconnect everyone
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let all: Vec<Arc<PeerConnection>> =
            self.peers.iter().map(|p| Arc::clone(p.value())).collect();
        for peer in &all {
            self.drop_peer(peer);
        }
        log::info!("Peer table shut down, disconnected {} peers", all.len());
    }
}
