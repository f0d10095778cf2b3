//! PostgreSQL (and CockroachDB) lease store.
//!
//! Uniqueness of active leases is enforced by partial unique indexes, so
//! allocation is an `INSERT ... ON CONFLICT DO NOTHING`: whichever
//! transaction commits first owns the address and the loser sees no row
//! returned. Binding and declining lock the current holder with
//! `SELECT ... FOR UPDATE` before changing it.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::{Executor, FromRow, PgPool, Postgres};
use tracing::{debug, info};

use super::{
    BindRequest, DECLINE_QUARANTINE_SECONDS, LeaseStore, OfferRequest, SweepReport,
    address_from_db, address_to_db,
};
use crate::database::Driver;
use crate::error::{Error, Result};
use crate::lease::{Lease, LeaseState};
use crate::policy::Policy;

/// Candidate addresses tried before giving up on a contended pool.
const MAX_ALLOCATION_ATTEMPTS: usize = 8;

/// Released and expired rows older than this are deleted by the sweep.
const HISTORY_RETENTION_DAYS: i64 = 7;

const ACTIVE_AT_ADDRESS: &str = "SELECT client_id, address, subnet, hostname, state, starts_at, expires_at, last_seen \
     FROM dhcp_leases WHERE address = $1 AND state IN ('offered', 'bound')";

const ACTIVE_AT_ADDRESS_FOR_UPDATE: &str = "SELECT client_id, address, subnet, hostname, state, starts_at, expires_at, last_seen \
     FROM dhcp_leases WHERE address = $1 AND state IN ('offered', 'bound') FOR UPDATE";

const ACTIVE_FOR_CLIENT: &str = "SELECT client_id, address, subnet, hostname, state, starts_at, expires_at, last_seen \
     FROM dhcp_leases WHERE client_id = $1 AND subnet = $2 AND state IN ('offered', 'bound')";

const INSERT_LEASE: &str = "INSERT INTO dhcp_leases \
     (client_id, address, subnet, hostname, state, starts_at, expires_at, last_seen) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $6) \
     ON CONFLICT DO NOTHING \
     RETURNING client_id, address, subnet, hostname, state, starts_at, expires_at, last_seen";

const NEXT_FREE_ADDRESS: &str = "SELECT candidate.address \
     FROM dhcp_pools pool \
     CROSS JOIN LATERAL generate_series(pool.range_start, pool.range_end) AS candidate(address) \
     WHERE pool.subnet = $1 \
       AND NOT (candidate.address = ANY(pool.exclusions)) \
       AND NOT EXISTS (SELECT 1 FROM dhcp_reservations r WHERE r.address = candidate.address) \
       AND NOT EXISTS (SELECT 1 FROM dhcp_leases l \
                       WHERE l.address = candidate.address AND l.state IN ('offered', 'bound')) \
       AND NOT EXISTS (SELECT 1 FROM dhcp_declined d \
                       WHERE d.address = candidate.address AND d.declined_at > $2) \
     ORDER BY candidate.address \
     LIMIT 1";

/// True when the address sits in some dynamic pool and is reserved for
/// no one.
const IS_DYNAMIC_ADDRESS: &str = "SELECT EXISTS (SELECT 1 FROM dhcp_pools p \
                    WHERE $1 BETWEEN p.range_start AND p.range_end \
                      AND NOT ($1 = ANY(p.exclusions))) \
        AND NOT EXISTS (SELECT 1 FROM dhcp_reservations WHERE address = $1)";

#[derive(Debug, FromRow)]
struct LeaseRow {
    client_id: String,
    address: i64,
    subnet: String,
    hostname: Option<String>,
    state: String,
    starts_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
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
            starts_at: row.starts_at,
            expires_at: row.expires_at,
            last_seen: row.last_seen,
        })
    }
}

fn into_lease(row: Option<LeaseRow>) -> Result<Option<Lease>> {
    row.map(Lease::try_from).transpose()
}

fn quarantine_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    now - TimeDelta::seconds(DECLINE_QUARANTINE_SECONDS)
}

/// Lease store backed by a PostgreSQL-wire database.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wraps a pool and applies pending migrations.
    ///
    /// CockroachDB has no advisory locks, so migrations run unlocked for the
    /// `cockdb` driver.
    pub async fn new(pool: PgPool, driver: Driver) -> Result<Self> {
        let mut migrator = sqlx::migrate!("./migrations/postgres");
        migrator.set_locking(driver != Driver::Cockdb);
        migrator.run(&pool).await?;
        info!("Lease database schema is up to date");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn active_at<'e, E>(executor: E, address: Ipv4Addr, lock: bool) -> Result<Option<Lease>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let sql = if lock {
            ACTIVE_AT_ADDRESS_FOR_UPDATE
        } else {
            ACTIVE_AT_ADDRESS
        };
        let row = sqlx::query_as::<_, LeaseRow>(sql)
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
        E: Executor<'e, Database = Postgres>,
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
    async fn insert_lease<'e, E>(
        executor: E,
        client_id: &str,
        subnet: &str,
        address: Ipv4Addr,
        hostname: Option<&str>,
        state: LeaseState,
        now: DateTime<Utc>,
        seconds: u32,
    ) -> Result<Option<Lease>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let row = sqlx::query_as::<_, LeaseRow>(INSERT_LEASE)
            .bind(client_id)
            .bind(address_to_db(address))
            .bind(subnet)
            .bind(hostname)
            .bind(state.as_str())
            .bind(now)
            .bind(now + TimeDelta::seconds(i64::from(seconds)))
            .fetch_optional(executor)
            .await?;
        into_lease(row)
    }

    async fn refresh_offer<'e, E>(executor: E, lease: Lease, seconds: u32) -> Result<Lease>
    where
        E: Executor<'e, Database = Postgres>,
    {
        if lease.state != LeaseState::Offered {
            return Ok(lease);
        }

        let now = Utc::now();
        let row = sqlx::query_as::<_, LeaseRow>(
            "UPDATE dhcp_leases SET expires_at = $1, last_seen = $2 \
             WHERE client_id = $3 AND address = $4 AND state = 'offered' \
             RETURNING client_id, address, subnet, hostname, state, starts_at, expires_at, last_seen",
        )
        .bind(now + TimeDelta::seconds(i64::from(seconds)))
        .bind(now)
        .bind(&lease.client_id)
        .bind(address_to_db(lease.ip_address))
        .fetch_optional(executor)
        .await?;

        Ok(into_lease(row)?.unwrap_or(lease))
    }

    /// Releases the client's active lease in `subnet` unless it is on `keep`.
    async fn release_other<'e, E>(
        executor: E,
        client_id: &str,
        subnet: &str,
        keep: Ipv4Addr,
        now: DateTime<Utc>,
    ) -> Result<u64>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let result = sqlx::query(
            "UPDATE dhcp_leases SET state = 'released', last_seen = $1 \
             WHERE client_id = $2 AND subnet = $3 AND address <> $4 \
               AND state IN ('offered', 'bound')",
        )
        .bind(now)
        .bind(client_id)
        .bind(subnet)
        .bind(address_to_db(keep))
        .execute(executor)
        .await?;
        Ok(result.rows_affected())
    }

    async fn is_quarantined<'e, E>(executor: E, address: Ipv4Addr, now: DateTime<Utc>) -> Result<bool>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let quarantined: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM dhcp_declined WHERE address = $1 AND declined_at > $2)",
        )
        .bind(address_to_db(address))
        .bind(quarantine_cutoff(now))
        .fetch_one(executor)
        .await?;
        Ok(quarantined)
    }

    async fn is_allocatable(&self, subnet: &str, address: Ipv4Addr, now: DateTime<Utc>) -> Result<bool> {
        let allocatable: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM dhcp_pools p \
                            WHERE p.subnet = $1 AND $2 BETWEEN p.range_start AND p.range_end \
                              AND NOT ($2 = ANY(p.exclusions))) \
                AND NOT EXISTS (SELECT 1 FROM dhcp_reservations WHERE address = $2) \
                AND NOT EXISTS (SELECT 1 FROM dhcp_declined WHERE address = $2 AND declined_at > $3)",
        )
        .bind(subnet)
        .bind(address_to_db(address))
        .bind(quarantine_cutoff(now))
        .fetch_one(&self.pool)
        .await?;
        Ok(allocatable)
    }

    async fn next_free(&self, subnet: &str, now: DateTime<Utc>) -> Result<Option<Ipv4Addr>> {
        let candidate: Option<i64> = sqlx::query_scalar(NEXT_FREE_ADDRESS)
            .bind(subnet)
            .bind(quarantine_cutoff(now))
            .fetch_optional(&self.pool)
            .await?;

        candidate
            .map(|value| {
                address_from_db(value).ok_or_else(|| {
                    Error::CorruptRecord(format!("pool address {} is not IPv4", value))
                })
            })
            .transpose()
    }

    async fn offer_reserved(&self, request: &OfferRequest, reserved: Ipv4Addr) -> Result<Lease> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        match Self::active_at(&mut *tx, reserved, true).await? {
            Some(holder) if holder.client_id != request.client_id => {
                return Err(Error::AddressUnavailable(reserved));
            }
            Some(holder) => {
                let lease = Self::refresh_offer(&mut *tx, holder, request.offer_seconds).await?;
                tx.commit().await?;
                return Ok(lease);
            }
            None => {}
        }

        Self::release_other(&mut *tx, &request.client_id, &request.subnet, reserved, now).await?;
        let lease = Self::insert_lease(
            &mut *tx,
            &request.client_id,
            &request.subnet,
            reserved,
            request.hostname.as_deref(),
            LeaseState::Offered,
            now,
            request.offer_seconds,
        )
        .await?
        .ok_or(Error::AddressUnavailable(reserved))?;

        tx.commit().await?;
        Ok(lease)
    }

    async fn try_offer(&self, request: &OfferRequest, address: Ipv4Addr) -> Result<Option<Lease>> {
        Self::insert_lease(
            &self.pool,
            &request.client_id,
            &request.subnet,
            address,
            request.hostname.as_deref(),
            LeaseState::Offered,
            Utc::now(),
            request.offer_seconds,
        )
        .await
    }
}

#[async_trait]
impl LeaseStore for PostgresStore {
    async fn sync_policy(&self, policy: &Policy) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM dhcp_reservations")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM dhcp_pools").execute(&mut *tx).await?;

        let mut pool_count = 0;
        for subnet in policy.subnets() {
            for pool in &subnet.pools {
                let exclusions: Vec<i64> = pool.exclusions.iter().copied().map(address_to_db).collect();
                sqlx::query(
                    "INSERT INTO dhcp_pools (subnet, range_start, range_end, exclusions, lease_seconds) \
                     VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(&subnet.id)
                .bind(address_to_db(pool.start))
                .bind(address_to_db(pool.end))
                .bind(exclusions)
                .bind(i64::from(pool.lease_seconds))
                .execute(&mut *tx)
                .await?;
                pool_count += 1;
            }
        }

        let mut reservation_count = 0;
        for reservation in policy.reservations() {
            sqlx::query(
                "INSERT INTO dhcp_reservations (client_id, address, subnet, hostname) \
                 VALUES ($1, $2, $3, $4)",
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
        if let Some(reserved) = request.reserved {
            return self.offer_reserved(&request, reserved).await;
        }

        if let Some(existing) =
            Self::active_for_client(&self.pool, &request.client_id, &request.subnet).await?
        {
            return Self::refresh_offer(&self.pool, existing, request.offer_seconds).await;
        }

        let now = Utc::now();
        if let Some(requested) = request.requested
            && self.is_allocatable(&request.subnet, requested, now).await?
            && let Some(lease) = self.try_offer(&request, requested).await?
        {
            return Ok(lease);
        }

        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let Some(candidate) = self.next_free(&request.subnet, now).await? else {
                return Err(Error::PoolExhausted);
            };

            if let Some(lease) = self.try_offer(&request, candidate).await? {
                return Ok(lease);
            }

            if let Some(existing) =
                Self::active_for_client(&self.pool, &request.client_id, &request.subnet).await?
            {
                return Ok(existing);
            }

            debug!("Lost allocation race for {}, retrying", candidate);
        }

        Err(Error::PoolExhausted)
    }

    async fn bind(&self, request: BindRequest) -> Result<Lease> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let holder = Self::active_at(&mut *tx, request.address, true).await?;
        match &holder {
            Some(lease) if lease.client_id != request.client_id => {
                return Err(Error::AddressUnavailable(request.address));
            }
            Some(_) => {}
            None => {
                if Self::is_quarantined(&mut *tx, request.address, now).await? {
                    return Err(Error::AddressUnavailable(request.address));
                }
            }
        }

        Self::release_other(
            &mut *tx,
            &request.client_id,
            &request.subnet,
            request.address,
            now,
        )
        .await?;

        let lease = if holder.is_some() {
            let row = sqlx::query_as::<_, LeaseRow>(
                "UPDATE dhcp_leases \
                 SET state = 'bound', expires_at = $1, last_seen = $2, \
                     hostname = COALESCE($3, hostname) \
                 WHERE client_id = $4 AND address = $5 AND state IN ('offered', 'bound') \
                 RETURNING client_id, address, subnet, hostname, state, starts_at, expires_at, last_seen",
            )
            .bind(now + TimeDelta::seconds(i64::from(request.lease_seconds)))
            .bind(now)
            .bind(request.hostname.as_deref())
            .bind(&request.client_id)
            .bind(address_to_db(request.address))
            .fetch_optional(&mut *tx)
            .await?;
            into_lease(row)?
        } else {
            Self::insert_lease(
                &mut *tx,
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
            "UPDATE dhcp_leases SET state = 'released', last_seen = $1 \
             WHERE client_id = $2 AND address = $3 AND state IN ('offered', 'bound')",
        )
        .bind(Utc::now())
        .bind(client_id)
        .bind(address_to_db(address))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn decline(&self, client_id: &str, address: Ipv4Addr) -> Result<bool> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        if let Some(holder) = Self::active_at(&mut *tx, address, true).await? {
            if holder.client_id != client_id {
                return Ok(false);
            }

            sqlx::query(
                "UPDATE dhcp_leases SET state = 'released', last_seen = $1 \
                 WHERE client_id = $2 AND address = $3 AND state IN ('offered', 'bound')",
            )
            .bind(now)
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
            "INSERT INTO dhcp_declined (address, declined_at) VALUES ($1, $2) \
             ON CONFLICT (address) DO UPDATE SET declined_at = EXCLUDED.declined_at",
        )
        .bind(address_to_db(address))
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn expire(&self) -> Result<SweepReport> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let offers = sqlx::query(
            "UPDATE dhcp_leases SET state = 'expired', last_seen = $1 \
             WHERE state = 'offered' AND expires_at <= $1",
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let bindings = sqlx::query(
            "UPDATE dhcp_leases SET state = 'expired', last_seen = $1 \
             WHERE state = 'bound' AND expires_at <= $1",
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let declines = sqlx::query("DELETE FROM dhcp_declined WHERE declined_at <= $1")
            .bind(quarantine_cutoff(now))
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "DELETE FROM dhcp_leases \
             WHERE state IN ('expired', 'released') AND last_seen < $1",
        )
        .bind(now - TimeDelta::days(HISTORY_RETENTION_DAYS))
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
        Self::active_at(&self.pool, address, false).await
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
