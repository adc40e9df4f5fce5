//! Per-connection peer state
//!
//! Counters and gossip-suppression caches for one connection. The caches
//! are best effort: they may drop entries under load without breaking any
//! protocol rule, they only avoid relaying the same item twice.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// Cache entries older than this are compacted away
pub const DEDUP_EXPIRY_SECS: i64 = 600;

/// Compaction runs every this many inserts
pub const DEDUP_COMPACT_EVERY: usize = 256;

/// Upper bound on entries kept per cache
pub const DEDUP_MAX_ENTRIES: usize = 20_000;

// =============================================================================
// Dedup Cache
// =============================================================================

/// Bounded set of recently seen hashes
#[derive(Debug, Default)]
pub struct DedupCache {
    entries: HashMap<String, DateTime<Utc>>,
    inserts_since_compaction: usize,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.entries.contains_key(hash)
    }

    /// Insert, returning true if the hash was not already present
    pub fn insert(&mut self, hash: &str) -> bool {
        self.insert_at(hash, Utc::now())
    }

    pub fn insert_at(&mut self, hash: &str, now: DateTime<Utc>) -> bool {
        let fresh = self.entries.insert(hash.to_string(), now).is_none();

        self.inserts_since_compaction += 1;
        if self.inserts_since_compaction >= DEDUP_COMPACT_EVERY {
            self.compact_at(now);
        }
        fresh
    }

    /// Drop expired entries; clear everything if still over the cap
    pub fn compact_at(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::seconds(DEDUP_EXPIRY_SECS);
        self.entries.retain(|_, seen| *seen > cutoff);
        if self.entries.len() > DEDUP_MAX_ENTRIES {
            log::debug!("Dedup cache over capacity, clearing {} entries", self.entries.len());
            self.entries.clear();
        }
        self.inserts_since_compaction = 0;
    }
}

// =============================================================================
// Peer State
// =============================================================================

/// Mutable per-connection counters
#[derive(Debug)]
pub struct PeerState {
    announced: bool,
    last_message_received_at: DateTime<Utc>,
    bytes_sent: u64,
    bytes_received: u64,
    messages_sent: u64,
    messages_received: u64,
    unfulfilled_requests: u32,
    sent_blocks: DedupCache,
    seen_blocks: DedupCache,
    sent_transactions: DedupCache,
    seen_transactions: DedupCache,
}

impl PeerState {
    pub fn new() -> Self {
        Self::new_at(Utc::now())
    }

    pub fn new_at(now: DateTime<Utc>) -> Self {
        Self {
            announced: false,
            last_message_received_at: now,
            bytes_sent: 0,
            bytes_received: 0,
            messages_sent: 0,
            messages_received: 0,
            unfulfilled_requests: 0,
            sent_blocks: DedupCache::new(),
            seen_blocks: DedupCache::new(),
            sent_transactions: DedupCache::new(),
            seen_transactions: DedupCache::new(),
        }
    }

    pub fn has_announced(&self) -> bool {
        self.announced
    }

    pub fn mark_announced(&mut self) {
        self.announced = true;
    }

    /// A fresh socket must announce again
    pub fn reset_announced(&mut self) {
        self.announced = false;
    }

    pub fn last_message_received_at(&self) -> DateTime<Utc> {
        self.last_message_received_at
    }

    /// Record a successfully decoded inbound message
    pub fn record_received(&mut self, bytes: usize) {
        self.record_received_at(bytes, Utc::now());
    }

    pub fn record_received_at(&mut self, bytes: usize, now: DateTime<Utc>) {
        self.last_message_received_at = now;
        self.messages_received += 1;
        self.bytes_received += bytes as u64;
    }

    /// Count bytes of frames that did not decode
    pub fn record_discarded(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
    }

    pub fn record_sent(&mut self, bytes: usize) {
        self.messages_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    /// No message for longer than `timeout`
    pub fn is_stale_at(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now - self.last_message_received_at > timeout
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received
    }

    pub fn unfulfilled_requests(&self) -> u32 {
        self.unfulfilled_requests
    }

    pub fn request_sent(&mut self) {
        self.unfulfilled_requests += 1;
    }

    /// Returns false if no request was outstanding
    pub fn request_fulfilled(&mut self) -> bool {
        if self.unfulfilled_requests == 0 {
            return false;
        }
        self.unfulfilled_requests -= 1;
        true
    }

    /// Whether a block should be relayed to this peer; marks it sent if so
    pub fn should_relay_block(&mut self, hash: &str) -> bool {
        if self.seen_blocks.contains(hash) || self.sent_blocks.contains(hash) {
            return false;
        }
        self.sent_blocks.insert(hash)
    }

    /// Whether a transaction should be relayed to this peer; marks it sent if so
    pub fn should_relay_transaction(&mut self, hash: &str) -> bool {
        if self.seen_transactions.contains(hash) || self.sent_transactions.contains(hash) {
            return false;
        }
        self.sent_transactions.insert(hash)
    }

    /// Returns true the first time this peer shows us the block
    pub fn note_block_seen(&mut self, hash: &str) -> bool {
        self.seen_blocks.insert(hash)
    }

    /// Returns true the first time this peer shows us the transaction
    pub fn note_transaction_seen(&mut self, hash: &str) -> bool {
        self.seen_transactions.insert(hash)
    }
}

impl Default for PeerState {
    fn default() -> Self {
        Self::new()
    }
}
