//! In-flight DISCOVER/REQUEST exchanges.
//!
//! A session remembers what was offered to a client within one
//! transaction (`xid`), so a REQUEST that selects another server can give
//! the offer back. Sessions end on ACK/NAK or when they time out.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Offered,
    Requesting,
}

#[derive(Debug, Clone)]
pub struct ClientSession {
    pub subnet: String,
    pub offered: Ipv4Addr,
    pub phase: SessionPhase,
    started: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    xid: u32,
    client_id: String,
}

#[derive(Debug)]
pub struct SessionTable {
    sessions: Mutex<HashMap<SessionKey, ClientSession>>,
    timeout: Duration,
}

impl SessionTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub async fn record_offer(&self, xid: u32, client_id: &str, subnet: &str, offered: Ipv4Addr) {
        let key = SessionKey {
            xid,
            client_id: client_id.to_string(),
        };
        let session = ClientSession {
            subnet: subnet.to_string(),
            offered,
            phase: SessionPhase::Offered,
            started: Instant::now(),
        };
        self.sessions.lock().await.insert(key, session);
    }

    /// Marks a session as waiting on the lease store. Returns the session as
    /// it was before, so a retransmitted REQUEST shows up as `Requesting`.
    pub async fn begin_request(&self, xid: u32, client_id: &str) -> Option<ClientSession> {
        let key = SessionKey {
            xid,
            client_id: client_id.to_string(),
        };
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(&key)?;
        if session.started.elapsed() >= self.timeout {
            sessions.remove(&key);
            return None;
        }
        let before = session.clone();
        session.phase = SessionPhase::Requesting;
        Some(before)
    }

    /// Ends a session, returning it if it was still live.
    pub async fn finish(&self, xid: u32, client_id: &str) -> Option<ClientSession> {
        let key = SessionKey {
            xid,
            client_id: client_id.to_string(),
        };
        self.sessions
            .lock()
            .await
            .remove(&key)
            .filter(|session| session.started.elapsed() < self.timeout)
    }

    /// Drops timed-out sessions. Returns how many were removed.
    pub async fn reap(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, session| session.started.elapsed() < self.timeout);
        before - sessions.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
