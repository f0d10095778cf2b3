//! Last-known bindings, kept in memory for renewals while the lease store
//! is unreachable.
//!
//! The cache is never consulted while the store answers. It is filled on
//! every ACK and invalidated on RELEASE, DECLINE and NAK.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::lease::Lease;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedBinding {
    pub ip_address: Ipv4Addr,
    pub subnet: String,
    pub expires_at: DateTime<Utc>,
}

impl CachedBinding {
    pub fn remaining_seconds(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }
}

#[derive(Debug, Default)]
pub struct BindingCache {
    bindings: RwLock<HashMap<String, CachedBinding>>,
}

impl BindingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, lease: &Lease) {
        self.bindings.write().await.insert(
            lease.client_id.clone(),
            CachedBinding {
                ip_address: lease.ip_address,
                subnet: lease.subnet.clone(),
                expires_at: lease.expires_at,
            },
        );
    }

    /// Returns the client's binding for `ip` if it has not expired.
    pub async fn lookup(&self, client_id: &str, ip: Ipv4Addr) -> Option<CachedBinding> {
        let bindings = self.bindings.read().await;
        bindings
            .get(client_id)
            .filter(|binding| binding.ip_address == ip && binding.expires_at > Utc::now())
            .cloned()
    }

    pub async fn invalidate(&self, client_id: &str) {
        self.bindings.write().await.remove(client_id);
    }

    /// Drops expired bindings. Returns how many were removed.
    pub async fn prune(&self) -> usize {
        let now = Utc::now();
        let mut bindings = self.bindings.write().await;
        let before = bindings.len();
        bindings.retain(|_, binding| binding.expires_at > now);
        before - bindings.len()
    }

    pub async fn len(&self) -> usize {
        self.bindings.read().await.len()
    }
}
