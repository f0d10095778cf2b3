//! Error types for the DHCP server.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants.

use std::net::Ipv4Addr;

/// Errors that can occur during DHCP server operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config or snapshot files).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed DHCP packet received.
    ///
    /// This includes packets that are too short, have invalid magic cookies,
    /// invalid option lengths, or other protocol violations.
    #[error("Invalid DHCP packet: {0}")]
    InvalidPacket(String),

    /// Every allocatable address of the subnet is offered, bound, reserved,
    /// excluded or quarantined after a DECLINE.
    #[error("No available IP addresses in pool")]
    PoolExhausted,

    /// Invalid server configuration.
    ///
    /// Returned by [`Config::load`](crate::Config::load) and
    /// [`Config::validate`](crate::Config::validate). The process refuses to
    /// start with partial policy.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Socket creation or configuration error.
    ///
    /// Typically occurs when binding to port 67 without `CAP_NET_BIND_SERVICE`,
    /// or when the configured network interface doesn't exist.
    #[error("Socket error: {0}")]
    Socket(String),

    /// Requested IP address is outside every pool the client may use.
    #[error("Address {0} is outside the configured pool range")]
    AddressOutOfRange(Ipv4Addr),

    /// The address is actively leased to, or reserved for, another client,
    /// or is quarantined after a DECLINE.
    #[error("Address {0} is not available to this client")]
    AddressUnavailable(Ipv4Addr),

    /// Lease store query or connection failure.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failure at startup.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A persisted record could not be decoded.
    #[error("Corrupt lease record: {0}")]
    CorruptRecord(String),
}

impl Error {
    /// Returns true when the lease store itself could not be reached or
    /// failed mid-transaction, as opposed to a policy rejection.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Migration(_))
    }
}

/// A specialized Result type for DHCP operations.
pub type Result<T> = std::result::Result<T, Error>;
