//! Address bans
//!
//! A ban is either temporary (expires four hours after creation) or
//! permanent. Bans are keyed by address only, never by port.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// How long a temporary ban lasts
pub const TEMPORARY_BAN_HOURS: i64 = 4;

/// Ban kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BanKind {
    Temporary,
    Permanent,
}

/// Penalty record for an address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ban {
    pub kind: BanKind,
    pub address: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Ban {
    /// Temporary ban starting now
    pub fn temporary(address: impl Into<String>) -> Self {
        Self::temporary_at(address, Utc::now())
    }

    pub fn temporary_at(address: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            kind: BanKind::Temporary,
            address: address.into(),
            created_at: now,
            expires_at: Some(now + Duration::hours(TEMPORARY_BAN_HOURS)),
        }
    }

    pub fn permanent(address: impl Into<String>) -> Self {
        Self {
            kind: BanKind::Permanent,
            address: address.into(),
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.kind == BanKind::Permanent
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match (self.kind, self.expires_at) {
            (BanKind::Permanent, _) => false,
            (BanKind::Temporary, Some(expires_at)) => now >= expires_at,
            (BanKind::Temporary, None) => true,
        }
    }
}
