//! Protocol capability flags
//!
//! Capabilities travel on the wire as a signed integer bit-vector. Peers
//! that predate capability negotiation send zero (or garbage below zero),
//! which decodes to the default set.

use bitflags::bitflags;

bitflags! {
    /// Protocol features a peer advertises and accepts
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        const TRANSACTION = 1 << 0;
        const BLOCK = 1 << 1;
        const QUERY = 1 << 2;
        const SYNC = 1 << 3;
        const NETWORK_INFO = 1 << 4;
        const BATCH_SYNC = 1 << 5;
        const ADVERTISE = 1 << 6;
        const ADVERTISE_TX = 1 << 7;
    }
}

impl Capabilities {
    /// What every node speaks unless told otherwise
    pub fn default_set() -> Self {
        Self::TRANSACTION
            | Self::BLOCK
            | Self::QUERY
            | Self::SYNC
            | Self::NETWORK_INFO
            | Self::BATCH_SYNC
    }

    /// Encode as the wire bit-vector
    pub fn to_bit_vector(self) -> i64 {
        i64::from(self.bits())
    }

    /// Decode a wire bit-vector. Unknown high bits are dropped.
    pub fn from_bit_vector(vector: i64) -> Self {
        if vector <= 0 {
            return Self::default_set();
        }
        Self::from_bits_truncate((vector & i64::from(u32::MAX)) as u32)
    }

    pub fn supports(self, other: Capabilities) -> bool {
        self.contains(other)
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::default_set()
    }
}
