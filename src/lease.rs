//! Lease records and their lifecycle states.
//!
//! A lease binds a client identifier to an address within one subnet. Its
//! state moves `Offered -> Bound` on a committed REQUEST and ends in either
//! `Released` (client gave it back, or declined it) or `Expired` (the sweep
//! observed `expires_at` in the past). Only `Offered` and `Bound` leases
//! hold their address.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Encodes a client ID as a colon-separated hex string for storage.
///
/// The same encoding is used for reservation keys, so a reservation for
/// `aa:bb:cc:dd:ee:ff` matches the Ethernet client ID `01:aa:bb:cc:dd:ee:ff`.
pub fn encode_client_id(client_id: &[u8]) -> String {
    client_id
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<Vec<_>>()
        .join(":")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseState {
    Offered,
    Bound,
    Expired,
    Released,
}

impl LeaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offered => "offered",
            Self::Bound => "bound",
            Self::Expired => "expired",
            Self::Released => "released",
        }
    }

    /// Returns true for states that hold their address.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Offered | Self::Bound)
    }
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeaseState {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "offered" => Ok(Self::Offered),
            "bound" => Ok(Self::Bound),
            "expired" => Ok(Self::Expired),
            "released" => Ok(Self::Released),
            other => Err(Error::CorruptRecord(format!("unknown lease state '{}'", other))),
        }
    }
}

/// A DHCP lease as persisted by a [`LeaseStore`](crate::store::LeaseStore).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// The IP address assigned to this client.
    pub ip_address: Ipv4Addr,

    /// Unique client identifier (hex-encoded).
    ///
    /// Derived from DHCP Option 61 if present, otherwise from
    /// hardware type + hardware address.
    pub client_id: String,

    /// Identifier of the subnet the address belongs to.
    pub subnet: String,

    /// Client-provided hostname (Option 12), sanitized.
    pub hostname: Option<String>,

    pub state: LeaseState,

    /// When the client was first offered or bound this address.
    pub starts_at: DateTime<Utc>,

    /// When an offer lapses or a binding must be renewed by.
    pub expires_at: DateTime<Utc>,

    /// Last state change.
    pub last_seen: DateTime<Utc>,
}

impl Lease {
    pub fn new(
        ip_address: Ipv4Addr,
        client_id: String,
        subnet: String,
        state: LeaseState,
        duration_seconds: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            ip_address,
            client_id,
            subnet,
            hostname: None,
            state,
            starts_at: now,
            expires_at: now + TimeDelta::seconds(i64::from(duration_seconds)),
            last_seen: now,
        }
    }

    /// Returns true if the lease has run past its expiry time.
    ///
    /// An expired-but-unswept lease still holds its address; see
    /// [`LeaseState::is_active`].
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Moves the lease to `state` and restarts its clock from now.
    pub fn renew(&mut self, state: LeaseState, duration_seconds: u32) {
        let now = Utc::now();
        self.state = state;
        self.expires_at = now + TimeDelta::seconds(i64::from(duration_seconds));
        self.last_seen = now;
    }

    pub fn retire(&mut self, state: LeaseState) {
        self.state = state;
        self.last_seen = Utc::now();
    }

    /// Returns seconds remaining until expiration, or 0 if expired.
    pub fn remaining_seconds(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_client_id() {
        assert_eq!(
            encode_client_id(&[1, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]),
            "01:aa:bb:cc:dd:ee:ff"
        );
        assert_eq!(encode_client_id(&[]), "");
    }

    #[test]
    fn test_lease_struct() {
        let lease = Lease::new(
            Ipv4Addr::new(192, 168, 1, 100),
            "test".to_string(),
            "lan".to_string(),
            LeaseState::Bound,
            3600,
        );
        assert!(!lease.is_expired());
        assert!(lease.is_active());
        assert!(lease.remaining_seconds() > 3500);

        let mut expired = lease.clone();
        expired.expires_at = Utc::now() - TimeDelta::seconds(1);
        assert!(expired.is_expired());
        assert_eq!(expired.remaining_seconds(), 0);

        let mut offered = Lease::new(
            Ipv4Addr::new(192, 168, 1, 101),
            "test".to_string(),
            "lan".to_string(),
            LeaseState::Offered,
            60,
        );
        offered.renew(LeaseState::Bound, 7200);
        assert_eq!(offered.state, LeaseState::Bound);
        assert!(offered.remaining_seconds() > 7100);

        offered.retire(LeaseState::Released);
        assert!(!offered.is_active());
    }

    #[test]
    fn test_lease_state_round_trip() {
        for state in [
            LeaseState::Offered,
            LeaseState::Bound,
            LeaseState::Expired,
            LeaseState::Released,
        ] {
            assert_eq!(state.as_str().parse::<LeaseState>().unwrap(), state);
        }
        assert!(matches!(
            "leased".parse::<LeaseState>(),
            Err(Error::CorruptRecord(_))
        ));
    }

    #[test]
    fn test_lease_state_serde_lowercase() {
        let json = serde_json::to_string(&LeaseState::Offered).unwrap();
        assert_eq!(json, "\"offered\"");
    }
}
