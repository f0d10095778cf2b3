//! # nextdhcp
//!
//! A DHCPv4 server (RFC 2131 / RFC 2132) that keeps its leases in SQLite,
//! PostgreSQL or CockroachDB.
//!
//! ## Features
//!
//! - DISCOVER, OFFER, REQUEST, ACK, NAK, RELEASE, DECLINE and INFORM
//! - Multiple subnets, each with pools, exclusions and MAC reservations
//! - Relay agent support (`giaddr` subnet selection, Option 82 echo)
//! - Transactional, first-committer-wins address allocation
//! - Background expiry of lapsed offers and bindings
//! - Optional renewals from a local cache while the database is down
//! - Server address discovery from the host's interfaces
//! - An in-process store for development and tests
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use nextdhcp::{Config, DhcpServer, MemoryStore, ProtocolEngine};
//!
//! #[tokio::main]
//! async fn main() -> nextdhcp::Result<()> {
//!     let config = Config::load("/config")?;
//!     let engine = ProtocolEngine::start(config, Arc::new(MemoryStore::new())).await?;
//!     let server = DhcpServer::new(engine).await?;
//!     server.run().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`Config`] - Subnets, pools, reservations and server settings
//! - [`Policy`] - Allocation rules derived from the configuration
//! - [`ProtocolEngine`] - Turns client messages into replies
//! - [`LeaseStore`] - Atomic lease persistence ([`SqliteStore`], [`PostgresStore`], [`MemoryStore`])
//! - [`DhcpServer`] - UDP listener on port 67 and the expiry sweep
//! - [`DhcpPacket`] / [`DhcpOption`] - Wire format

pub mod cache;
pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod lease;
pub mod options;
pub mod packet;
pub mod policy;
pub mod server;
pub mod session;
pub mod store;

pub use config::Config;
pub use engine::ProtocolEngine;
pub use error::{Error, Result};
pub use lease::{Lease, LeaseState};
pub use options::{DhcpOption, MessageType};
pub use packet::DhcpPacket;
pub use policy::Policy;
pub use server::DhcpServer;
pub use store::{LeaseStore, MemoryStore, PostgresStore, SqliteStore};
