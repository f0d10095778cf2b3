//! In-process lease store.
//!
//! All state lives behind one [`RwLock`], which makes every operation
//! atomic with respect to every other. When a snapshot path is configured
//! the table is written to it as JSON, at most once per
//! [`SAVE_INTERVAL_MILLIS`], and restored on startup.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error};

use super::{BindRequest, DECLINE_QUARANTINE_SECONDS, LeaseStore, OfferRequest, SweepReport};
use crate::error::{Error, Result};
use crate::lease::{Lease, LeaseState};
use crate::policy::Policy;

/// Minimum interval between snapshot writes (5 seconds).
const SAVE_INTERVAL_MILLIS: u128 = 5000;

/// Released and expired leases kept for `list-leases`.
const MAX_HISTORY: usize = 1024;

/// Persistent snapshot format (serialized to JSON).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LeaseTable {
    /// Offered and bound leases by address.
    active: HashMap<Ipv4Addr, Lease>,
    /// Retired leases, oldest first.
    #[serde(default)]
    history: VecDeque<Lease>,
    /// Quarantined addresses with the time of the DECLINE.
    #[serde(default)]
    declined: HashMap<Ipv4Addr, DateTime<Utc>>,
}

impl LeaseTable {
    fn is_quarantined(&self, ip: Ipv4Addr, now: DateTime<Utc>) -> bool {
        self.declined.get(&ip).is_some_and(|declined_at| {
            now.signed_duration_since(*declined_at).num_seconds() < DECLINE_QUARANTINE_SECONDS
        })
    }

    fn is_free(&self, ip: Ipv4Addr, now: DateTime<Utc>) -> bool {
        !self.active.contains_key(&ip) && !self.is_quarantined(ip, now)
    }

    fn client_address(&self, client_id: &str, subnet: &str) -> Option<Ipv4Addr> {
        self.active
            .values()
            .find(|lease| lease.client_id == client_id && lease.subnet == subnet)
            .map(|lease| lease.ip_address)
    }

    fn retire(&mut self, ip: Ipv4Addr, state: LeaseState) -> Option<LeaseState> {
        let mut lease = self.active.remove(&ip)?;
        let previous = lease.state;
        lease.retire(state);
        self.history.push_back(lease);
        while self.history.len() > MAX_HISTORY {
            self.history.pop_front();
        }
        Some(previous)
    }

    /// Retires the client's active lease in `subnet` unless it is on `keep`.
    fn release_client(&mut self, client_id: &str, subnet: &str, keep: Ipv4Addr) {
        if let Some(previous) = self.client_address(client_id, subnet)
            && previous != keep
        {
            debug!("Releasing {} held by {} before moving it", previous, client_id);
            self.retire(previous, LeaseState::Released);
        }
    }

    fn insert(
        &mut self,
        client_id: &str,
        subnet: &str,
        ip: Ipv4Addr,
        state: LeaseState,
        seconds: u32,
        hostname: Option<String>,
    ) -> Lease {
        let mut lease = Lease::new(ip, client_id.to_string(), subnet.to_string(), state, seconds);
        lease.hostname = hostname;
        self.active.insert(ip, lease.clone());
        lease
    }

    fn offer(&mut self, policy: &Policy, request: &OfferRequest) -> Result<Lease> {
        let subnet = policy.subnet(&request.subnet).ok_or_else(|| {
            Error::InvalidConfig(format!("unknown subnet '{}'", request.subnet))
        })?;
        let now = Utc::now();

        if let Some(reserved) = request.reserved {
            match self.active.get_mut(&reserved) {
                Some(holder) if holder.client_id != request.client_id => {
                    return Err(Error::AddressUnavailable(reserved));
                }
                Some(holder) => {
                    if holder.state == LeaseState::Offered {
                        holder.renew(LeaseState::Offered, request.offer_seconds);
                    }
                    return Ok(holder.clone());
                }
                None => {}
            }

            self.release_client(&request.client_id, &request.subnet, reserved);
            return Ok(self.insert(
                &request.client_id,
                &request.subnet,
                reserved,
                LeaseState::Offered,
                request.offer_seconds,
                request.hostname.clone(),
            ));
        }

        if let Some(existing) = self.client_address(&request.client_id, &request.subnet)
            && let Some(lease) = self.active.get_mut(&existing)
        {
            if lease.state == LeaseState::Offered {
                lease.renew(LeaseState::Offered, request.offer_seconds);
            }
            return Ok(lease.clone());
        }

        let address = request
            .requested
            .filter(|ip| policy.is_allocatable(subnet, *ip) && self.is_free(*ip, now))
            .or_else(|| policy.candidates(subnet).find(|ip| self.is_free(*ip, now)))
            .ok_or(Error::PoolExhausted)?;

        Ok(self.insert(
            &request.client_id,
            &request.subnet,
            address,
            LeaseState::Offered,
            request.offer_seconds,
            request.hostname.clone(),
        ))
    }

    fn bind(&mut self, request: BindRequest) -> Result<Lease> {
        let now = Utc::now();

        match self.active.get(&request.address) {
            Some(holder) if holder.client_id != request.client_id => {
                return Err(Error::AddressUnavailable(request.address));
            }
            Some(_) => {}
            None if self.is_quarantined(request.address, now) => {
                return Err(Error::AddressUnavailable(request.address));
            }
            None => {}
        }

        self.release_client(&request.client_id, &request.subnet, request.address);

        if let Some(lease) = self.active.get_mut(&request.address) {
            lease.renew(LeaseState::Bound, request.lease_seconds);
            if request.hostname.is_some() {
                lease.hostname = request.hostname;
            }
            return Ok(lease.clone());
        }

        Ok(self.insert(
            &request.client_id,
            &request.subnet,
            request.address,
            LeaseState::Bound,
            request.lease_seconds,
            request.hostname,
        ))
    }

    fn expire(&mut self) -> SweepReport {
        let now = Utc::now();
        let mut report = SweepReport::default();

        let lapsed: Vec<Ipv4Addr> = self
            .active
            .values()
            .filter(|lease| lease.expires_at <= now)
            .map(|lease| lease.ip_address)
            .collect();

        for ip in lapsed {
            match self.retire(ip, LeaseState::Expired) {
                Some(LeaseState::Offered) => report.offers_expired += 1,
                Some(_) => report.bindings_expired += 1,
                None => {}
            }
        }

        let quarantine = TimeDelta::seconds(DECLINE_QUARANTINE_SECONDS);
        let before = self.declined.len();
        self.declined
            .retain(|_, declined_at| now.signed_duration_since(*declined_at) < quarantine);
        report.declines_cleared = (before - self.declined.len()) as u64;

        report
    }
}

#[derive(Debug)]
struct InternalState {
    table: LeaseTable,
    policy: Option<Arc<Policy>>,
    /// Whether state has changed since last save.
    dirty: bool,
    last_save: Instant,
}

/// Lease store held entirely in process memory.
#[derive(Debug)]
pub struct MemoryStore {
    state: RwLock<InternalState>,
    snapshot_path: Option<PathBuf>,
    /// Serializes snapshot writes.
    save_lock: Mutex<()>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store that never touches disk.
    pub fn new() -> Self {
        Self::with_table(LeaseTable::default(), None)
    }

    /// Creates a store backed by a snapshot file, restoring it if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot exists but cannot be read or parsed.
    pub async fn open(snapshot_path: Option<PathBuf>) -> Result<Self> {
        let table = match &snapshot_path {
            Some(path) => Self::load_table(path).await?,
            None => LeaseTable::default(),
        };
        Ok(Self::with_table(table, snapshot_path))
    }

    fn with_table(table: LeaseTable, snapshot_path: Option<PathBuf>) -> Self {
        Self {
            state: RwLock::new(InternalState {
                table,
                policy: None,
                dirty: false,
                last_save: Instant::now(),
            }),
            snapshot_path,
            save_lock: Mutex::new(()),
        }
    }

    async fn load_table(path: &Path) -> Result<LeaseTable> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(LeaseTable::default())
        }
    }

    /// Writes the snapshot if it is stale. A failed write is logged and
    /// retried on the next change; the in-memory state stays authoritative.
    async fn maybe_save(&self, state: &mut InternalState) {
        if !state.dirty || state.last_save.elapsed().as_millis() < SAVE_INTERVAL_MILLIS {
            return;
        }

        match self.write_snapshot(&state.table).await {
            Ok(()) => {
                state.dirty = false;
                state.last_save = Instant::now();
            }
            Err(e) => error!("Failed to save lease snapshot: {}", e),
        }
    }

    async fn write_snapshot(&self, table: &LeaseTable) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let _lock = self.save_lock.lock().await;
        let content = serde_json::to_string_pretty(table)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    fn policy(state: &InternalState) -> Result<Arc<Policy>> {
        state
            .policy
            .clone()
            .ok_or_else(|| Error::InvalidConfig("lease store has no policy loaded".to_string()))
    }
}

#[async_trait]
impl LeaseStore for MemoryStore {
    async fn sync_policy(&self, policy: &Policy) -> Result<()> {
        let mut state = self.state.write().await;
        state.policy = Some(Arc::new(policy.clone()));
        Ok(())
    }

    async fn offer(&self, request: OfferRequest) -> Result<Lease> {
        let mut state = self.state.write().await;
        let policy = Self::policy(&state)?;
        let lease = state.table.offer(&policy, &request)?;
        state.dirty = true;
        self.maybe_save(&mut state).await;
        Ok(lease)
    }

    async fn bind(&self, request: BindRequest) -> Result<Lease> {
        let mut state = self.state.write().await;
        let lease = state.table.bind(request)?;
        state.dirty = true;
        self.maybe_save(&mut state).await;
        Ok(lease)
    }

    async fn release(&self, client_id: &str, address: Ipv4Addr) -> Result<bool> {
        let mut state = self.state.write().await;
        let owned = state
            .table
            .active
            .get(&address)
            .is_some_and(|lease| lease.client_id == client_id);

        if owned {
            state.table.retire(address, LeaseState::Released);
            state.dirty = true;
            self.maybe_save(&mut state).await;
        }

        Ok(owned)
    }

    async fn decline(&self, client_id: &str, address: Ipv4Addr) -> Result<bool> {
        let mut state = self.state.write().await;

        match state.table.active.get(&address) {
            Some(holder) if holder.client_id != client_id => return Ok(false),
            Some(_) => {
                state.table.retire(address, LeaseState::Released);
            }
            None if !Self::policy(&state)?.is_dynamic(address) => return Ok(false),
            None => {}
        }

        state.table.declined.insert(address, Utc::now());
        state.dirty = true;
        self.maybe_save(&mut state).await;
        Ok(true)
    }

    async fn expire(&self) -> Result<SweepReport> {
        let mut state = self.state.write().await;
        let report = state.table.expire();
        if report.total() > 0 {
            state.dirty = true;
        }
        self.maybe_save(&mut state).await;
        Ok(report)
    }

    async fn lease_for_client(&self, client_id: &str, subnet: &str) -> Result<Option<Lease>> {
        let state = self.state.read().await;
        Ok(state
            .table
            .client_address(client_id, subnet)
            .and_then(|ip| state.table.active.get(&ip).cloned()))
    }

    async fn lease_for_address(&self, address: Ipv4Addr) -> Result<Option<Lease>> {
        let state = self.state.read().await;
        Ok(state.table.active.get(&address).cloned())
    }

    async fn list_leases(&self) -> Result<Vec<Lease>> {
        let state = self.state.read().await;
        let mut leases: Vec<Lease> = state
            .table
            .active
            .values()
            .chain(state.table.history.iter())
            .cloned()
            .collect();
        leases.sort_by_key(|lease| (lease.ip_address, lease.last_seen));
        Ok(leases)
    }

    async fn flush(&self) -> Result<()> {
        let mut state = self.state.write().await;
        self.write_snapshot(&state.table).await?;
        state.dirty = false;
        state.last_save = Instant::now();
        Ok(())
    }
}
