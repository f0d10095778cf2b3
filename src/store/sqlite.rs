//! SQLite lease store.
//!
//! The schema mirrors the PostgreSQL one: partial unique indexes allow one
//! offered-or-bound lease per address and per client within a subnet, and
//! every lease is created with `INSERT ... ON CONFLICT DO NOTHING`. The
//! pool holds a single connection, so each operation runs its transaction
//! alone and no row locking is needed.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::{Executor, FromRow, Sqlite, SqliteConnection, SqlitePool};
use tracing::info;

use super::{
    BindRequest, DECLINE_QUARANTINE_SECONDS, LeaseStore, OfferRequest, SweepReport,
    address_from_db, address_to_db,
};
use crate::error::{Error, Result};
use crate::lease::{Lease, LeaseState};
use crate::policy::Policy;

/// Released and expired rows older than this are deleted by the sweep.
const HISTORY_RETENTION_DAYS: i64 = 7;

const ACTIVE_AT_ADDRESS: &str = "SELECT client_id, address, subnet, hostname, state, starts_at, expires_at, last_seen \
     FROM dhcp_leases WHERE address = ?1 AND state IN ('offered', 'bound')";

const ACTIVE_FOR_CLIENT: &str = "SELECT client_id, address, subnet, hostname, state, starts_at, expires_at, last_seen \
     FROM dhcp_leases WHERE client_id = ?1 AND subnet = ?2 AND state IN ('offered', 'bound')";

const INSERT_LEASE: &str = "INSERT INTO dhcp_leases \
     (client_id, address, subnet, hostname, state, starts_at, expires_at, last_seen) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?6) \
     ON CONFLICT DO NOTHING \
     RETURNING client_id, address, subnet, hostname, state, starts_at, expires_at, last_seen";

const NEXT_FREE_ADDRESS: &str = "WITH RECURSIVE candidate(pool_id, address, range_end) AS ( \
         SELECT id, range_start, range_end FROM dhcp_pools WHERE subnet = ?1 \
         UNION ALL \
         SELECT pool_id, address + 1, range_end FROM candidate WHERE address < range_end \
     ) \
     SELECT c.address FROM candidate c \
     WHERE NOT EXISTS (SELECT 1 FROM dhcp_exclusions e \
                       WHERE e.pool_id = c.pool_id AND e.address = c.address) \
       AND NOT EXISTS (SELECT 1 FROM dhcp_reservations r WHERE r.address = c.address) \
       AND NOT EXISTS (SELECT 1 FROM dhcp_leases l \
                       WHERE l.address = c.address AND l.state IN ('offered', 'bound')) \
       AND NOT EXISTS (SELECT 1 FROM dhcp_declined d \
                       WHERE d.address = c.address AND d.declined_at > ?2) \
     ORDER BY c.address \
     LIMIT 1";

const IS_ALLOCATABLE: &str = "SELECT EXISTS (SELECT 1 FROM dhcp_pools p \
                    WHERE p.subnet = ?1 AND ?2 BETWEEN p.range_start AND p.range_end \
                      AND NOT EXISTS (SELECT 1 FROM dhcp_exclusions e \
                                      WHERE e.pool_id = p.id AND e.address = ?2)) \
        AND NOT EXISTS (SELECT 1 FROM dhcp_reservations WHERE address = ?2) \
        AND NOT EXISTS (SELECT 1 FROM dhcp_declined WHERE address = ?2 AND declined_at > ?3)";

/// True when the address sits in some dynamic pool and is reserved for
/// no one.
const IS_DYNAMIC_ADDRESS: &str = "SELECT EXISTS (SELECT 1 FROM dhcp_pools p \
                    WHERE ?1 BETWEEN p.range_start AND p.range_end \
                      AND NOT EXISTS (SELECT 1 FROM dhcp_exclusions e \
                                      WHERE e.pool_id = p.id AND e.address = ?1)) \
        AND NOT EXISTS (SELECT 1 FROM dhcp_reservations WHERE address = ?1)";

#[derive(Debug, FromRow)]
struct LeaseRow {
    client_id: String,
    address: i64,
    subnet: String,
    hostname: Option<String>,
    state: String,
    starts_at: i64,
    expires_at: i64,
    last_seen: i64,
}

fn timestamp_from_db(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| Error::CorruptRecord(format!("timestamp {} is out of range", millis)))
}

fn timestamp_to_db(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

impl TryFrom<LeaseRow> for Lease {
    type Error = Error;

    fn try_from(row: LeaseRow) -> Result<Self> {
        let ip_address = address_from_db(row.address).ok_or_else(|| {
            Error::CorruptRecord(format!("address {} is not an IPv4 address", row.address))
        })?;

        Ok(Lease {
            ip_address,
            client_id: row.client_id,
            subnet: row.subnet,
            hostname: row.hostname,
            state: row.state.parse()?,
            starts_at: timestamp_from_db(row.starts_at)?,
            expires_at: timestamp_from_db(row.expires_at)?,
            last_seen: timestamp_from_db(row.last_seen)?,
        })
    }
}

fn into_lease(row: Option<LeaseRow>) -> Result<Option<Lease>> {
    row.map(Lease::try_from).transpose()
}

fn quarantine_cutoff(now: DateTime<Utc>) -> i64 {
    timestamp_to_db(now - TimeDelta::seconds(DECLINE_QUARANTINE_SECONDS))
}

fn expiry(now: DateTime<Utc>, seconds: u32) -> i64 {
    timestamp_to_db(now + TimeDelta::seconds(i64::from(seconds)))
}

/// Lease store backed by a local SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Wraps a pool and applies pending migrations.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations/sqlite").run(&pool).await?;
        info!("Lease database schema is up to date");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn active_at<'e, E>(executor: E, address: Ipv4Addr) -> Result<Option<Lease>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let row = sqlx::query_as::<_, LeaseRow>(ACTIVE_AT_ADDRESS)
            .bind(address_to_db(address))
            .fetch_optional(executor)
            .await?;
        into_lease(row)
    }

    async fn active_for_client<'e, E>(
        executor: E,
        client_id: &str,
        subnet: &str,
    ) -> Result<Option<Lease>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let row = sqlx::query_as::<_, LeaseRow>(ACTIVE_FOR_CLIENT)
            .bind(client_id)
            .bind(subnet)
            .fetch_optional(executor)
            .await?;
        into_lease(row)
    }

    /// Inserts an active lease, returning `None` if the address or the
    /// client's subnet slot is already taken.
    #[allow(clippy::too_many_arguments)]
    async fn insert_lease(
        conn: &mut SqliteConnection,
        client_id: &str,
        subnet: &str,
        address: Ipv4Addr,
        hostname: Option<&str>,
        state: LeaseState,
        now: DateTime<Utc>,
        seconds: u32,
    ) -> Result<Option<Lease>> {
        let row = sqlx::query_as::<_, LeaseRow>(INSERT_LEASE)
            .bind(client_id)
            .bind(address_to_db(address))
            .bind(subnet)
            .bind(hostname)
            .bind(state.as_str())
            .bind(timestamp_to_db(now))
            .bind(expiry(now, seconds))
            .fetch_optional(conn)
            .await?;
        into_lease(row)
    }

    async fn refresh_offer(
        conn: &mut SqliteConnection,
        lease: Lease,
        now: DateTime<Utc>,
        seconds: u32,
    ) -> Result<Lease> {
        if lease.state != LeaseState::Offered {
            return Ok(lease);
        }

        let row = sqlx::query_as::<_, LeaseRow>(
            "UPDATE dhcp_leases SET expires_at = ?1, last_seen = ?2 \
             WHERE client_id = ?3 AND address = ?4 AND state = 'offered' \
             RETURNING client_id, address, subnet, hostname, state, starts_at, expires_at, last_seen",
        )
        .bind(expiry(now, seconds))
        .bind(timestamp_to_db(now))
        .bind(&lease.client_id)
        .bind(address_to_db(lease.ip_address))
        .fetch_optional(conn)
        .await?;

        Ok(into_lease(row)?.unwrap_or(lease))
    }

    /// Releases the client's active lease in `subnet` unless it is on `keep`.
    async fn release_other(
        conn: &mut SqliteConnection,
        client_id: &str,
        subnet: &str,
        keep: Ipv4Addr,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE dhcp_leases SET state = 'released', last_seen = ?1 \
             WHERE client_id = ?2 AND subnet = ?3 AND address <> ?4 \
               AND state IN ('offered', 'bound')",
        )
        .bind(timestamp_to_db(now))
        .bind(client_id)
        .bind(subnet)
        .bind(address_to_db(keep))
        .execute(conn)
        .await?;
        Ok(result.rows_affected())
    }

    async fn is_quarantined(
        conn: &mut SqliteConnection,
        address: Ipv4Addr,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let quarantined: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM dhcp_declined WHERE address = ?1 AND declined_at > ?2)",
        )
        .bind(address_to_db(address))
        .bind(quarantine_cutoff(now))
        .fetch_one(conn)
        .await?;
        Ok(quarantined)
    }

    async fn is_allocatable(
        conn: &mut SqliteConnection,
        subnet: &str,
        address: Ipv4Addr,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let allocatable: bool = sqlx::query_scalar(IS_ALLOCATABLE)
            .bind(subnet)
            .bind(address_to_db(address))
            .bind(quarantine_cutoff(now))
            .fetch_one(conn)
            .await?;
        Ok(allocatable)
    }

    async fn next_free(
        conn: &mut SqliteConnection,
        subnet: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Ipv4Addr>> {
        let candidate: Option<i64> = sqlx::query_scalar(NEXT_FREE_ADDRESS)
            .bind(subnet)
            .bind(quarantine_cutoff(now))
            .fetch_optional(conn)
            .await?;

        candidate
            .map(|value| {
                address_from_db(value).ok_or_else(|| {
                    Error::CorruptRecord(format!("pool address {} is not IPv4", value))
                })
            })
            .transpose()
    }

    async fn offer_reserved(
        conn: &mut SqliteConnection,
        request: &OfferRequest,
        reserved: Ipv4Addr,
        now: DateTime<Utc>,
    ) -> Result<Lease> {
        match Self::active_at(&mut *conn, reserved).await? {
            Some(holder) if holder.client_id != request.client_id => {
                return Err(Error::AddressUnavailable(reserved));
            }
            Some(holder) => {
                return Self::refresh_offer(conn, holder, now, request.offer_seconds).await;
            }
            None => {}
        }

        Self::release_other(&mut *conn, &request.client_id, &request.subnet, reserved, now).await?;
        Self::insert_lease(
            conn,
            &request.client_id,
            &request.subnet,
            reserved,
            request.hostname.as_deref(),
            LeaseState::Offered,
            now,
            request.offer_seconds,
        )
        .await?
        .ok_or(Error::AddressUnavailable(reserved))
    }

    async fn offer_dynamic(
        conn: &mut SqliteConnection,
        request: &OfferRequest,
        now: DateTime<Utc>,
    ) -> Result<Lease> {
        if let Some(existing) =
            Self::active_for_client(&mut *conn, &request.client_id, &request.subnet).await?
        {
            return Self::refresh_offer(conn, existing, now, request.offer_seconds).await;
        }

        if let Some(requested) = request.requested
            && Self::is_allocatable(&mut *conn, &request.subnet, requested, now).await?
            && let Some(lease) = Self::insert_lease(
                &mut *conn,
                &request.client_id,
                &request.subnet,
                requested,
                request.hostname.as_deref(),
                LeaseState::Offered,
                now,
                request.offer_seconds,
            )
            .await?
        {
            return Ok(lease);
        }

        let Some(candidate) = Self::next_free(&mut *conn, &request.subnet, now).await? else {
            return Err(Error::PoolExhausted);
        };

        Self::insert_lease(
            conn,
            &request.client_id,
            &request.subnet,
            candidate,
            request.hostname.as_deref(),
            LeaseState::Offered,
            now,
            request.offer_seconds,
        )
        .await?
        .ok_or(Error::PoolExhausted)
    }
}

#[async_trait]
impl LeaseStore for SqliteStore {
    async fn sync_policy(&self, policy: &Policy) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM dhcp_reservations")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM dhcp_exclusions")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM dhcp_pools").execute(&mut *tx).await?;

        let mut pool_count = 0;
        for subnet in policy.subnets() {
            for pool in &subnet.pools {
                let pool_id: i64 = sqlx::query_scalar(
                    "INSERT INTO dhcp_pools (subnet, range_start, range_end, lease_seconds) \
                     VALUES (?1, ?2, ?3, ?4) RETURNING id",
                )
                .bind(&subnet.id)
                .bind(address_to_db(pool.start))
                .bind(address_to_db(pool.end))
                .bind(i64::from(pool.lease_seconds))
                .fetch_one(&mut *tx)
                .await?;

                for excluded in &pool.exclusions {
                    sqlx::query("INSERT INTO dhcp_exclusions (pool_id, address) VALUES (?1, ?2)")
                        .bind(pool_id)
                        .bind(address_to_db(*excluded))
                        .execute(&mut *tx)
                        .await?;
                }
                pool_count += 1;
            }
        }

        let mut reservation_count = 0;
        for reservation in policy.reservations() {
            sqlx::query(
                "INSERT INTO dhcp_reservations (client_id, address, subnet, hostname) \
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(&reservation.client_id)
            .bind(address_to_db(reservation.address))
            .bind(&reservation.subnet)
            .bind(reservation.hostname.as_deref())
            .execute(&mut *tx)
            .await?;
            reservation_count += 1;
        }

        tx.commit().await?;
        info!(
            "Synchronized {} pool(s) and {} reservation(s) to the lease database",
            pool_count, reservation_count
        );
        Ok(())
    }

    async fn offer(&self, request: OfferRequest) -> Result<Lease> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let lease = match request.reserved {
            Some(reserved) => Self::offer_reserved(&mut tx, &request, reserved, now).await?,
            None => Self::offer_dynamic(&mut tx, &request, now).await?,
        };

        tx.commit().await?;
        Ok(lease)
    }

    async fn bind(&self, request: BindRequest) -> Result<Lease> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let holder = Self::active_at(&mut *tx, request.address).await?;
        match &holder {
            Some(lease) if lease.client_id != request.client_id => {
                return Err(Error::AddressUnavailable(request.address));
            }
            Some(_) => {}
            None => {
                if Self::is_quarantined(&mut tx, request.address, now).await? {
                    return Err(Error::AddressUnavailable(request.address));
                }
            }
        }

        Self::release_other(
            &mut tx,
            &request.client_id,
            &request.subnet,
            request.address,
            now,
        )
        .await?;

        let lease = if holder.is_some() {
            let row = sqlx::query_as::<_, LeaseRow>(
                "UPDATE dhcp_leases \
                 SET state = 'bound', expires_at = ?1, last_seen = ?2, \
                     hostname = COALESCE(?3, hostname) \
                 WHERE client_id = ?4 AND address = ?5 AND state IN ('offered', 'bound') \
                 RETURNING client_id, address, subnet, hostname, state, starts_at, expires_at, last_seen",
            )
            .bind(expiry(now, request.lease_seconds))
            .bind(timestamp_to_db(now))
            .bind(request.hostname.as_deref())
            .bind(&request.client_id)
            .bind(address_to_db(request.address))
            .fetch_optional(&mut *tx)
            .await?;
            into_lease(row)?
        } else {
            Self::insert_lease(
                &mut tx,
                &request.client_id,
                &request.subnet,
                request.address,
                request.hostname.as_deref(),
                LeaseState::Bound,
                now,
                request.lease_seconds,
            )
            .await?
        };

        let lease = lease.ok_or(Error::AddressUnavailable(request.address))?;
        tx.commit().await?;
        Ok(lease)
    }

    async fn release(&self, client_id: &str, address: Ipv4Addr) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE dhcp_leases SET state = 'released', last_seen = ?1 \
             WHERE client_id = ?2 AND address = ?3 AND state IN ('offered', 'bound')",
        )
        .bind(timestamp_to_db(Utc::now()))
        .bind(client_id)
        .bind(address_to_db(address))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn decline(&self, client_id: &str, address: Ipv4Addr) -> Result<bool> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        if let Some(holder) = Self::active_at(&mut *tx, address).await? {
            if holder.client_id != client_id {
                return Ok(false);
            }

            sqlx::query(
                "UPDATE dhcp_leases SET state = 'released', last_seen = ?1 \
                 WHERE client_id = ?2 AND address = ?3 AND state IN ('offered', 'bound')",
            )
            .bind(timestamp_to_db(now))
            .bind(client_id)
            .bind(address_to_db(address))
            .execute(&mut *tx)
            .await?;
        } else {
            let dynamic: bool = sqlx::query_scalar(IS_DYNAMIC_ADDRESS)
                .bind(address_to_db(address))
                .fetch_one(&mut *tx)
                .await?;
            if !dynamic {
                return Ok(false);
            }
        }

        sqlx::query(
            "INSERT INTO dhcp_declined (address, declined_at) VALUES (?1, ?2) \
             ON CONFLICT (address) DO UPDATE SET declined_at = excluded.declined_at",
        )
        .bind(address_to_db(address))
        .bind(timestamp_to_db(now))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn expire(&self) -> Result<SweepReport> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let offers = sqlx::query(
            "UPDATE dhcp_leases SET state = 'expired', last_seen = ?1 \
             WHERE state = 'offered' AND expires_at <= ?1",
        )
        .bind(timestamp_to_db(now))
        .execute(&mut *tx)
        .await?;

        let bindings = sqlx::query(
            "UPDATE dhcp_leases SET state = 'expired', last_seen = ?1 \
             WHERE state = 'bound' AND expires_at <= ?1",
        )
        .bind(timestamp_to_db(now))
        .execute(&mut *tx)
        .await?;

        let declines = sqlx::query("DELETE FROM dhcp_declined WHERE declined_at <= ?1")
            .bind(quarantine_cutoff(now))
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "DELETE FROM dhcp_leases \
             WHERE state IN ('expired', 'released') AND last_seen < ?1",
        )
        .bind(timestamp_to_db(now - TimeDelta::days(HISTORY_RETENTION_DAYS)))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(SweepReport {
            offers_expired: offers.rows_affected(),
            bindings_expired: bindings.rows_affected(),
            declines_cleared: declines.rows_affected(),
        })
    }

    async fn lease_for_client(&self, client_id: &str, subnet: &str) -> Result<Option<Lease>> {
        Self::active_for_client(&self.pool, client_id, subnet).await
    }

    async fn lease_for_address(&self, address: Ipv4Addr) -> Result<Option<Lease>> {
        Self::active_at(&self.pool, address).await
    }

    async fn list_leases(&self) -> Result<Vec<Lease>> {
        let rows = sqlx::query_as::<_, LeaseRow>(
            "SELECT client_id, address, subnet, hostname, state, starts_at, expires_at, last_seen \
             FROM dhcp_leases ORDER BY address, last_seen",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Lease::try_from).collect()
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_keep_millisecond_precision() {
        let at = DateTime::from_timestamp_millis(1_760_000_000_123).unwrap();
        assert_eq!(timestamp_from_db(timestamp_to_db(at)).unwrap(), at);
        assert!(matches!(
            timestamp_from_db(i64::MAX),
            Err(Error::CorruptRecord(_))
        ));
    }

    #[test]
    fn test_expiry_offsets_from_now() {
        let now = DateTime::from_timestamp_millis(1_000_000).unwrap();
        assert_eq!(expiry(now, 60), 1_060_000);
        assert_eq!(quarantine_cutoff(now), 1_000_000 - DECLINE_QUARANTINE_SECONDS * 1000);
    }
}
