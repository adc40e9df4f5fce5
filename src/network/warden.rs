//! Misbehavior scoring
//!
//! The warden turns misbehavior reports into a per-address score. Scores
//! decay linearly: every decay pass takes one point off every address, down
//! to zero. Crossing the ban threshold yields a single [`Verdict::Ban`].

use dashmap::DashMap;
use std::fmt;

/// Kinds of protocol misbehavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Misbehavior {
    /// Payload did not parse as an envelope
    MalformedEnvelope,
    /// Non-announce message before the announce
    UnannouncedTraffic,
    /// Frame above the soft size limit
    OversizedMessage,
    /// Frame above the hard size limit
    ExcessivelyOversizedMessage,
    /// Query for a block we do not know
    UnknownBlockRequest,
    /// Second announce on one connection
    DuplicateAnnounce,
    /// Peer-table reply nobody asked for
    UnsolicitedPeerTable,
    /// Announced a protocol version we do not speak
    ProtocolMismatch,
}

impl Misbehavior {
    /// Score added per occurrence
    pub fn penalty(&self) -> u32 {
        match self {
            Misbehavior::MalformedEnvelope => 20,
            Misbehavior::UnannouncedTraffic => 5,
            Misbehavior::OversizedMessage => 20,
            Misbehavior::ExcessivelyOversizedMessage => 100,
            Misbehavior::UnknownBlockRequest => 5,
            // Older protocol versions do these legitimately
            Misbehavior::DuplicateAnnounce => 0,
            Misbehavior::UnsolicitedPeerTable => 0,
            Misbehavior::ProtocolMismatch => 0,
        }
    }

    /// Stable reason code for events and logs
    pub fn code(&self) -> &'static str {
        match self {
            Misbehavior::MalformedEnvelope => "malformed",
            Misbehavior::UnannouncedTraffic => "unannounced",
            Misbehavior::OversizedMessage => "oversized",
            Misbehavior::ExcessivelyOversizedMessage => "excessively-oversized",
            Misbehavior::UnknownBlockRequest => "unknown-block-request",
            Misbehavior::DuplicateAnnounce => "duplicate-announce",
            Misbehavior::UnsolicitedPeerTable => "unsolicited-peer-table",
            Misbehavior::ProtocolMismatch => "protocol-mismatch",
        }
    }

    /// Whether the connection is dropped on the spot
    pub fn disconnects(&self) -> bool {
        matches!(
            self,
            Misbehavior::ExcessivelyOversizedMessage | Misbehavior::ProtocolMismatch
        )
    }
}

impl fmt::Display for Misbehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Outcome of a penalty
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Tolerated { score: u32 },
    Ban { score: u32 },
}

/// Per-address misbehavior scores
#[derive(Debug)]
pub struct Warden {
    scores: DashMap<String, u32>,
    ban_threshold: u32,
}

impl Warden {
    pub fn new(ban_threshold: u32) -> Self {
        Self {
            scores: DashMap::new(),
            ban_threshold,
        }
    }

    pub fn ban_threshold(&self) -> u32 {
        self.ban_threshold
    }

    /// Add the penalty for `kind` to `address`
    pub fn penalize(&self, address: &str, kind: Misbehavior) -> Verdict {
        let mut entry = self.scores.entry(address.to_string()).or_insert(0);
        let before = *entry;
        let after = before.saturating_add(kind.penalty());
        *entry = after;

        if before < self.ban_threshold && after >= self.ban_threshold {
            log::warn!(
                "Peer {} crossed ban threshold ({} >= {}) after {}",
                address,
                after,
                self.ban_threshold,
                kind
            );
            Verdict::Ban { score: after }
        } else {
            log::debug!("Peer {} penalized for {}, score {}", address, kind, after);
            Verdict::Tolerated { score: after }
        }
    }

    pub fn score(&self, address: &str) -> u32 {
        self.scores.get(address).map(|s| *s).unwrap_or(0)
    }

    /// Forget an address, e.g. once its ban has been served
    pub fn forgive(&self, address: &str) {
        self.scores.remove(address);
    }

    /// One point of forgiveness for every tracked address
    pub fn decay(&self) {
        for mut score in self.scores.iter_mut() {
            *score = score.saturating_sub(1);
        }
    }

    pub fn tracked(&self) -> usize {
        self.scores.len()
    }
}
