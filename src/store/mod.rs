//! Lease persistence.
//!
//! [`LeaseStore`] is the authoritative record of which client holds which
//! address. Every allocation decision that could race with another
//! exchange (offering a free address, binding, releasing, declining) is a
//! single atomic operation on the store, so concurrent requests for the
//! same address resolve first-committer-wins.
//!
//! Three backends exist: [`SqliteStore`] for the default `sqlite` driver,
//! [`PostgresStore`] for the `psql` and `cockdb` drivers, and
//! [`MemoryStore`] for development and tests.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Config;
use crate::database::{DatabaseConfig, Driver};
use crate::error::Result;
use crate::lease::Lease;
use crate::policy::Policy;

mod memory;
mod postgres;
mod sqlite;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

/// How long declined addresses remain unavailable (1 hour).
///
/// When a client sends DECLINE (indicating an address conflict), the
/// address is quarantined for this duration so it is not offered again.
pub const DECLINE_QUARANTINE_SECONDS: i64 = 3600;

/// Input to [`LeaseStore::offer`].
#[derive(Debug, Clone)]
pub struct OfferRequest {
    pub client_id: String,
    pub subnet: String,
    /// The client's reservation in this subnet, which always wins.
    pub reserved: Option<Ipv4Addr>,
    /// Option 50 from the DISCOVER, honored when allocatable and free.
    pub requested: Option<Ipv4Addr>,
    pub hostname: Option<String>,
    pub offer_seconds: u32,
}

/// Input to [`LeaseStore::bind`].
#[derive(Debug, Clone)]
pub struct BindRequest {
    pub client_id: String,
    pub subnet: String,
    pub address: Ipv4Addr,
    pub hostname: Option<String>,
    pub lease_seconds: u32,
}

/// Counts produced by one expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub offers_expired: u64,
    pub bindings_expired: u64,
    pub declines_cleared: u64,
}

impl SweepReport {
    pub fn total(&self) -> u64 {
        self.offers_expired + self.bindings_expired + self.declines_cleared
    }
}

#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Replaces the persisted pools and reservations with `policy`.
    async fn sync_policy(&self, policy: &Policy) -> Result<()>;

    /// Atomically picks an address for the client and records an OFFERED
    /// lease for it.
    ///
    /// Preference order: the reservation, the client's existing active
    /// lease in the subnet, the requested address, then the lowest free
    /// pool address.
    ///
    /// # Errors
    ///
    /// - [`Error::AddressUnavailable`](crate::Error::AddressUnavailable) if
    ///   the reserved address is actively held by another client.
    /// - [`Error::PoolExhausted`](crate::Error::PoolExhausted) if no pool
    ///   address is free.
    async fn offer(&self, request: OfferRequest) -> Result<Lease>;

    /// Atomically commits a BOUND lease.
    ///
    /// Binding an address the client already holds renews it in place. A
    /// client moving to a different address releases its previous lease in
    /// the same transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AddressUnavailable`](crate::Error::AddressUnavailable)
    /// if another client holds the address or it is quarantined.
    async fn bind(&self, request: BindRequest) -> Result<Lease>;

    /// Marks the client's active lease on `address` RELEASED. Returns false
    /// if there was none.
    async fn release(&self, client_id: &str, address: Ipv4Addr) -> Result<bool>;

    /// Quarantines `address` and drops the client's lease on it. Returns
    /// false if another client holds the address, or if nobody holds it and
    /// it is not a dynamic pool address (reserved, excluded or unpooled).
    async fn decline(&self, client_id: &str, address: Ipv4Addr) -> Result<bool>;

    /// Expires offers and bindings past their expiry time and lifts stale
    /// quarantines. Addresses become reusable once this commits.
    async fn expire(&self) -> Result<SweepReport>;

    async fn lease_for_client(&self, client_id: &str, subnet: &str) -> Result<Option<Lease>>;

    async fn lease_for_address(&self, address: Ipv4Addr) -> Result<Option<Lease>>;

    /// Returns every known lease, including released and expired history.
    async fn list_leases(&self) -> Result<Vec<Lease>>;

    /// Persists any buffered state.
    async fn flush(&self) -> Result<()>;
}

/// Opens the store selected by `DB_DRIVER` and runs migrations.
pub async fn connect(database: &DatabaseConfig, config: &Config) -> Result<Arc<dyn LeaseStore>> {
    match database.driver {
        Driver::Sqlite => {
            let pool = database.connect_sqlite().await?;
            Ok(Arc::new(SqliteStore::new(pool).await?))
        }
        Driver::Psql | Driver::Cockdb => {
            let pool = database.connect().await?;
            Ok(Arc::new(PostgresStore::new(pool, database.driver).await?))
        }
        Driver::Memory => {
            let store = MemoryStore::open(config.leases_file.as_ref().map(PathBuf::from)).await?;
            Ok(Arc::new(store))
        }
    }
}

/// Converts an address to its `BIGINT` column representation.
pub(crate) fn address_to_db(ip: Ipv4Addr) -> i64 {
    i64::from(u32::from(ip))
}

pub(crate) fn address_from_db(value: i64) -> Option<Ipv4Addr> {
    u32::try_from(value).ok().map(Ipv4Addr::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_column_conversion() {
        let ip = Ipv4Addr::new(255, 255, 255, 254);
        assert_eq!(address_from_db(address_to_db(ip)), Some(ip));
        assert_eq!(address_from_db(-1), None);
        assert_eq!(address_from_db(i64::from(u32::MAX) + 1), None);
    }

    #[test]
    fn test_sweep_report_total() {
        let report = SweepReport {
            offers_expired: 2,
            bindings_expired: 1,
            declines_cleared: 3,
        };
        assert_eq!(report.total(), 6);
    }
}
