//! Server configuration loaded from the mounted configuration directory.
//!
//! The configuration is a single JSON document (`config.json`) describing
//! server-wide settings and one or more subnets, each with dynamic pools,
//! exclusions and static reservations. Loading is all-or-nothing: any
//! missing required field or failed validation aborts startup.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use get_if_addrs::IfAddr;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

/// File looked up when the configuration path is a directory.
pub const CONFIG_FILE_NAME: &str = "config.json";

const DEFAULT_OFFER_TIMEOUT_SECONDS: u32 = 60;
const DEFAULT_SESSION_TIMEOUT_SECONDS: u32 = 30;
const DEFAULT_SWEEP_INTERVAL_SECONDS: u32 = 10;
const DEFAULT_RATE_LIMIT_PER_SECOND: usize = 10;
const MAX_HOSTNAME_LENGTH: usize = 63;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address of this server on the served network. Sent as the server
    /// identifier (option 54) and `siaddr`. When unset, it is taken from the
    /// first interface address inside a configured subnet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_ip: Option<Ipv4Addr>,

    /// Network interface to bind the listener to (Linux `SO_BINDTODEVICE`).
    #[serde(default)]
    pub interface: Option<String>,

    /// How long an OFFERED lease reserves its address.
    #[serde(default = "default_offer_timeout")]
    pub offer_timeout_seconds: u32,

    /// How long an unfinished DISCOVER/REQUEST exchange is remembered.
    #[serde(default = "default_session_timeout")]
    pub session_timeout_seconds: u32,

    /// Period of the background expiry sweep.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u32,

    /// ACK renewals of cached bindings while the lease store is unreachable.
    #[serde(default)]
    pub serve_cached_renewals: bool,

    /// Maximum packets accepted per client hardware address per second.
    /// Zero turns rate limiting off.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_second: usize,

    /// Snapshot file for the in-memory lease store. Ignored by database drivers.
    #[serde(default)]
    pub leases_file: Option<String>,

    pub subnets: Vec<SubnetConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetConfig {
    /// Stable identifier, stored with every lease.
    pub id: String,
    pub network: Ipv4Net,
    pub pools: Vec<PoolConfig>,
    #[serde(default)]
    pub reservations: Vec<Reservation>,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub dns_servers: Vec<Ipv4Addr>,
    #[serde(default)]
    pub domain_name: Option<String>,
    pub lease_duration_seconds: u32,
    #[serde(default)]
    pub renewal_time_seconds: Option<u32>,
    #[serde(default)]
    pub rebinding_time_seconds: Option<u32>,
    #[serde(default)]
    pub broadcast_address: Option<Ipv4Addr>,
    #[serde(default)]
    pub mtu: Option<u16>,
}

/// A dynamic address range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
    #[serde(default)]
    pub exclusions: Vec<Ipv4Addr>,
    /// Overrides the subnet's lease duration for addresses of this pool.
    #[serde(default)]
    pub lease_duration_seconds: Option<u32>,
}

/// A fixed MAC-to-address binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub mac_address: String,
    pub ip_address: Ipv4Addr,
    #[serde(default)]
    pub hostname: Option<String>,
}

fn default_offer_timeout() -> u32 {
    DEFAULT_OFFER_TIMEOUT_SECONDS
}

fn default_session_timeout() -> u32 {
    DEFAULT_SESSION_TIMEOUT_SECONDS
}

fn default_sweep_interval() -> u32 {
    DEFAULT_SWEEP_INTERVAL_SECONDS
}

fn default_rate_limit() -> usize {
    DEFAULT_RATE_LIMIT_PER_SECOND
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_ip: None,
            interface: None,
            offer_timeout_seconds: DEFAULT_OFFER_TIMEOUT_SECONDS,
            session_timeout_seconds: DEFAULT_SESSION_TIMEOUT_SECONDS,
            sweep_interval_seconds: DEFAULT_SWEEP_INTERVAL_SECONDS,
            serve_cached_renewals: false,
            rate_limit_per_second: DEFAULT_RATE_LIMIT_PER_SECOND,
            leases_file: None,
            subnets: vec![SubnetConfig::default()],
        }
    }
}

impl Default for SubnetConfig {
    fn default() -> Self {
        Self {
            id: "lan".to_string(),
            network: Ipv4Net::new(Ipv4Addr::new(10, 15, 0, 0), 24)
                .unwrap_or_else(|_| Ipv4Net::default()),
            pools: vec![PoolConfig {
                start: Ipv4Addr::new(10, 15, 0, 10),
                end: Ipv4Addr::new(10, 15, 0, 254),
                exclusions: Vec::new(),
                lease_duration_seconds: None,
            }],
            reservations: Vec::new(),
            gateway: Some(Ipv4Addr::new(10, 15, 0, 1)),
            dns_servers: vec![
                Ipv4Addr::new(1, 1, 1, 1),
                Ipv4Addr::new(8, 8, 8, 8),
                Ipv4Addr::new(9, 9, 9, 9),
            ],
            domain_name: Some("local".to_string()),
            lease_duration_seconds: 300,
            renewal_time_seconds: None,
            rebinding_time_seconds: None,
            broadcast_address: None,
            mtu: None,
        }
    }
}

impl Config {
    /// Loads and validates the configuration.
    ///
    /// `path` may be the mounted configuration directory, in which case
    /// [`CONFIG_FILE_NAME`] inside it is read, or the file itself.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the file is missing or fails
    /// validation, and [`Error::Json`] if it is not valid JSON or lacks a
    /// required field.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = Self::resolve_path(path.as_ref());

        if !path.is_file() {
            return Err(Error::InvalidConfig(format!(
                "configuration file {} not found",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(&path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Maps a directory to the configuration file inside it.
    pub fn resolve_path(path: &Path) -> PathBuf {
        if path.is_dir() {
            path.join(CONFIG_FILE_NAME)
        } else {
            path.to_path_buf()
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = Self::resolve_path(path.as_ref());
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.subnets.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one subnet must be configured".to_string(),
            ));
        }

        if self.offer_timeout_seconds == 0 {
            return Err(Error::InvalidConfig(
                "offer_timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if self.session_timeout_seconds == 0 || self.sweep_interval_seconds == 0 {
            return Err(Error::InvalidConfig(
                "session_timeout_seconds and sweep_interval_seconds must be greater than 0"
                    .to_string(),
            ));
        }

        let mut subnet_ids = HashSet::new();
        let mut ranges: Vec<(u32, u32, &str)> = Vec::new();
        let mut reserved_macs: HashMap<Vec<u8>, &str> = HashMap::new();
        let mut reserved_ips: HashSet<Ipv4Addr> = HashSet::new();

        for subnet in &self.subnets {
            if !subnet_ids.insert(subnet.id.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate subnet id '{}'",
                    subnet.id
                )));
            }

            subnet.validate()?;

            for pool in &subnet.pools {
                let start = u32::from(pool.start);
                let end = u32::from(pool.end);
                if let Some((_, _, other)) = ranges
                    .iter()
                    .find(|(other_start, other_end, _)| start <= *other_end && *other_start <= end)
                {
                    return Err(Error::InvalidConfig(format!(
                        "pool {}-{} in subnet '{}' overlaps a pool in subnet '{}'",
                        pool.start, pool.end, subnet.id, other
                    )));
                }
                ranges.push((start, end, subnet.id.as_str()));
            }

            for reservation in &subnet.reservations {
                let mac = parse_mac_address(&reservation.mac_address)?;
                if reserved_macs.insert(mac, subnet.id.as_str()).is_some() {
                    return Err(Error::InvalidConfig(format!(
                        "MAC {} has more than one reservation",
                        reservation.mac_address
                    )));
                }
                if !reserved_ips.insert(reservation.ip_address) {
                    return Err(Error::InvalidConfig(format!(
                        "address {} is reserved more than once",
                        reservation.ip_address
                    )));
                }
            }
        }

        let Some(server_ip) = self.server_ip else {
            return Ok(());
        };

        let server = u32::from(server_ip);
        if ranges
            .iter()
            .any(|(start, end, _)| server >= *start && server <= *end)
        {
            return Err(Error::InvalidConfig(
                "server_ip must not be within a pool range".to_string(),
            ));
        }

        if reserved_ips.contains(&server_ip) {
            return Err(Error::InvalidConfig(
                "server_ip must not be reserved for a client".to_string(),
            ));
        }

        Ok(())
    }

    /// Returns the configured server address, or discovers it from the
    /// host's interfaces and stores it.
    ///
    /// Discovery picks the first IPv4 interface address (on `interface`
    /// only, when set) that lies inside a configured subnet and outside its
    /// pools.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when no interface address qualifies,
    /// and [`Error::Socket`] when the interfaces cannot be listed.
    pub fn resolve_server_ip(&mut self) -> Result<Ipv4Addr> {
        if let Some(server_ip) = self.server_ip {
            return Ok(server_ip);
        }

        let addresses: Vec<(String, Ipv4Addr)> = get_if_addrs::get_if_addrs()
            .map_err(|error| Error::Socket(format!("Failed to list network interfaces: {}", error)))?
            .into_iter()
            .filter_map(|interface| match interface.addr {
                IfAddr::V4(v4) => Some((interface.name, v4.ip)),
                IfAddr::V6(_) => None,
            })
            .collect();

        let server_ip = self.select_server_ip(&addresses).ok_or_else(|| {
            let found = addresses
                .iter()
                .map(|(name, ip)| format!("{}={}", name, ip))
                .collect::<Vec<_>>()
                .join(", ");
            Error::InvalidConfig(format!(
                "server_ip is not set and no interface address lies inside a configured subnet (found: {})",
                found
            ))
        })?;

        info!("Using interface address {} as the server identifier", server_ip);
        self.server_ip = Some(server_ip);
        Ok(server_ip)
    }

    /// Picks the server address among `(interface, address)` pairs.
    pub fn select_server_ip(&self, addresses: &[(String, Ipv4Addr)]) -> Option<Ipv4Addr> {
        addresses
            .iter()
            .filter(|(name, _)| self.interface.as_ref().is_none_or(|wanted| wanted == name))
            .map(|(_, ip)| *ip)
            .find(|ip| {
                self.subnets
                    .iter()
                    .any(|subnet| subnet.network.contains(ip) && !subnet.ip_in_pool(*ip))
            })
    }

    /// Returns the subnet with the given identifier.
    pub fn subnet(&self, id: &str) -> Option<&SubnetConfig> {
        self.subnets.iter().find(|subnet| subnet.id == id)
    }
}

impl SubnetConfig {
    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidConfig("subnet id must not be empty".to_string()));
        }

        if self.network.prefix_len() > 30 {
            return Err(Error::InvalidConfig(format!(
                "subnet '{}' network {} leaves no room for hosts",
                self.id, self.network
            )));
        }

        if self.pools.is_empty() && self.reservations.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "subnet '{}' has neither pools nor reservations",
                self.id
            )));
        }

        if self.lease_duration_seconds == 0 {
            return Err(Error::InvalidConfig(format!(
                "subnet '{}' lease_duration_seconds must be greater than 0",
                self.id
            )));
        }

        let network = self.network.network();
        let broadcast = self.network.broadcast();

        for pool in &self.pools {
            let start = u32::from(pool.start);
            let end = u32::from(pool.end);

            if start > end {
                return Err(Error::InvalidConfig(format!(
                    "pool start {} must be less than or equal to pool end {}",
                    pool.start, pool.end
                )));
            }

            if !self.network.contains(&pool.start) || !self.network.contains(&pool.end) {
                return Err(Error::InvalidConfig(format!(
                    "pool {}-{} is not inside network {}",
                    pool.start, pool.end, self.network
                )));
            }

            if pool.start == network || pool.end == broadcast {
                return Err(Error::InvalidConfig(format!(
                    "pool {}-{} includes the network or broadcast address of {}",
                    pool.start, pool.end, self.network
                )));
            }

            if pool.lease_duration_seconds == Some(0) {
                return Err(Error::InvalidConfig(format!(
                    "pool {}-{} lease_duration_seconds must be greater than 0",
                    pool.start, pool.end
                )));
            }

            for excluded in &pool.exclusions {
                let ip = u32::from(*excluded);
                if ip < start || ip > end {
                    return Err(Error::InvalidConfig(format!(
                        "exclusion {} is outside pool {}-{}",
                        excluded, pool.start, pool.end
                    )));
                }
            }
        }

        for (index, pool) in self.pools.iter().enumerate() {
            for other in self.pools.iter().skip(index + 1) {
                if u32::from(pool.start) <= u32::from(other.end)
                    && u32::from(other.start) <= u32::from(pool.end)
                {
                    return Err(Error::InvalidConfig(format!(
                        "pools {}-{} and {}-{} in subnet '{}' overlap",
                        pool.start, pool.end, other.start, other.end, self.id
                    )));
                }
            }
        }

        for reservation in &self.reservations {
            if !self.network.contains(&reservation.ip_address)
                || reservation.ip_address == network
                || reservation.ip_address == broadcast
            {
                return Err(Error::InvalidConfig(format!(
                    "reservation {} for MAC {} is not a host address of {}",
                    reservation.ip_address, reservation.mac_address, self.network
                )));
            }
        }

        if let Some(gateway) = self.gateway
            && self.ip_in_pool(gateway)
        {
            return Err(Error::InvalidConfig(format!(
                "gateway {} of subnet '{}' must not be within a pool range",
                gateway, self.id
            )));
        }

        let lease = self.lease_duration_seconds;
        let renewal = self.renewal_time_seconds.unwrap_or(lease / 2);
        let rebinding = self
            .rebinding_time_seconds
            .unwrap_or(((u64::from(lease) * 7) / 8) as u32);
        if renewal >= rebinding || rebinding >= lease.max(2) {
            return Err(Error::InvalidConfig(format!(
                "subnet '{}' requires renewal < rebinding < lease duration",
                self.id
            )));
        }

        Ok(())
    }

    /// Returns true if `ip` lies inside one of the subnet's dynamic ranges.
    pub fn ip_in_pool(&self, ip: Ipv4Addr) -> bool {
        self.pool_for(ip).is_some()
    }

    pub fn pool_for(&self, ip: Ipv4Addr) -> Option<&PoolConfig> {
        let addr = u32::from(ip);
        self.pools
            .iter()
            .find(|pool| addr >= u32::from(pool.start) && addr <= u32::from(pool.end))
    }

    pub fn pool_size(&self) -> u32 {
        self.pools
            .iter()
            .map(|pool| u32::from(pool.end) - u32::from(pool.start) + 1)
            .sum()
    }

    pub fn subnet_mask(&self) -> Ipv4Addr {
        self.network.netmask()
    }

    pub fn calculate_broadcast(&self) -> Ipv4Addr {
        self.broadcast_address
            .unwrap_or_else(|| self.network.broadcast())
    }

    /// Lease duration for an address, honoring per-pool overrides.
    /// T1 and T2 for a granted lease.
    ///
    /// Configured values are used only when `T1 < T2 < lease` holds for
    /// this lease. Otherwise the offending timer falls back to half (T1) or
    /// seven eighths (T2) of the lease.
    pub fn lease_timers(&self, lease_seconds: u32) -> (u32, u32) {
        let default_renewal = lease_seconds / 2;
        let default_rebinding = ((u64::from(lease_seconds) * 7) / 8) as u32;

        let rebinding = self
            .rebinding_time_seconds
            .filter(|rebinding| *rebinding < lease_seconds)
            .unwrap_or(default_rebinding);
        let renewal = self
            .renewal_time_seconds
            .filter(|renewal| *renewal < rebinding)
            .unwrap_or(default_renewal);

        if renewal < rebinding {
            (renewal, rebinding)
        } else {
            (default_renewal, default_rebinding)
        }
    }

    /// T1, defaulting to half the lease.
    pub fn renewal_time(&self, lease_seconds: u32) -> u32 {
        self.lease_timers(lease_seconds).0
    }

    /// T2, defaulting to seven eighths of the lease.
    pub fn rebinding_time(&self, lease_seconds: u32) -> u32 {
        self.lease_timers(lease_seconds).1
    }
}

/// Parses `aa:bb:cc:dd:ee:ff` or `aa-bb-cc-dd-ee-ff` into bytes.
pub fn parse_mac_address(mac: &str) -> Result<Vec<u8>> {
    let normalized = mac.trim().to_lowercase().replace('-', ":");
    let bytes = normalized
        .split(':')
        .map(|part| u8::from_str_radix(part, 16))
        .collect::<std::result::Result<Vec<u8>, _>>()
        .map_err(|_| Error::InvalidConfig(format!("invalid MAC address '{}'", mac)))?;

    if bytes.len() != 6 {
        return Err(Error::InvalidConfig(format!(
            "invalid MAC address '{}': expected 6 octets",
            mac
        )));
    }

    Ok(bytes)
}

/// Reduces a client-supplied hostname (option 12) to a safe DNS label.
pub fn sanitize_hostname(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '.')
        .take(MAX_HOSTNAME_LENGTH)
        .collect::<String>()
        .trim_matches(|c| c == '-' || c == '.')
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet() -> SubnetConfig {
        SubnetConfig {
            id: "office".to_string(),
            network: "192.168.1.0/24".parse().unwrap(),
            pools: vec![PoolConfig {
                start: Ipv4Addr::new(192, 168, 1, 100),
                end: Ipv4Addr::new(192, 168, 1, 200),
                exclusions: vec![],
                lease_duration_seconds: None,
            }],
            gateway: Some(Ipv4Addr::new(192, 168, 1, 1)),
            lease_duration_seconds: 86400,
            ..SubnetConfig::default()
        }
    }

    fn config() -> Config {
        Config {
            server_ip: Some(Ipv4Addr::new(192, 168, 1, 1)),
            subnets: vec![subnet()],
            ..Config::default()
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_pool_start_greater_than_end() {
        let mut config = config();
        config.subnets[0].pools[0].start = Ipv4Addr::new(192, 168, 1, 200);
        config.subnets[0].pools[0].end = Ipv4Addr::new(192, 168, 1, 100);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_ip_in_pool() {
        let config = Config {
            server_ip: Some(Ipv4Addr::new(192, 168, 1, 150)),
            ..config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overlapping_pools_rejected() {
        let mut config = config();
        config.subnets[0].pools.push(PoolConfig {
            start: Ipv4Addr::new(192, 168, 1, 150),
            end: Ipv4Addr::new(192, 168, 1, 220),
            exclusions: vec![],
            lease_duration_seconds: None,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pool_outside_network_rejected() {
        let mut config = config();
        config.subnets[0].pools[0].end = Ipv4Addr::new(192, 168, 2, 10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_exclusion_outside_pool_rejected() {
        let mut config = config();
        config.subnets[0].pools[0].exclusions = vec![Ipv4Addr::new(192, 168, 1, 50)];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_reservations_rejected() {
        let mut config = config();
        config.subnets[0].reservations = vec![
            Reservation {
                mac_address: "aa:bb:cc:dd:ee:ff".to_string(),
                ip_address: Ipv4Addr::new(192, 168, 1, 50),
                hostname: None,
            },
            Reservation {
                mac_address: "AA-BB-CC-DD-EE-FF".to_string(),
                ip_address: Ipv4Addr::new(192, 168, 1, 51),
                hostname: None,
            },
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_reservation_mac_rejected() {
        let mut config = config();
        config.subnets[0].reservations = vec![Reservation {
            mac_address: "not-a-mac".to_string(),
            ip_address: Ipv4Addr::new(192, 168, 1, 50),
            hostname: None,
        }];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_no_subnets_rejected() {
        let config = Config {
            subnets: vec![],
            ..config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ip_in_pool() {
        let subnet = subnet();
        assert!(subnet.ip_in_pool(Ipv4Addr::new(192, 168, 1, 150)));
        assert!(!subnet.ip_in_pool(Ipv4Addr::new(192, 168, 1, 50)));
        assert!(!subnet.ip_in_pool(Ipv4Addr::new(192, 168, 1, 250)));
    }

    #[test]
    fn test_pool_size() {
        assert_eq!(subnet().pool_size(), 101);
    }

    #[test]
    fn test_calculate_broadcast() {
        assert_eq!(
            subnet().calculate_broadcast(),
            Ipv4Addr::new(192, 168, 1, 255)
        );
        assert_eq!(subnet().subnet_mask(), Ipv4Addr::new(255, 255, 255, 0));
    }

    #[test]
    fn test_renewal_time_defaults() {
        let subnet = SubnetConfig {
            lease_duration_seconds: 3600,
            ..subnet()
        };
        assert_eq!(subnet.renewal_time(3600), 1800);
        assert_eq!(subnet.rebinding_time(3600), 3150);

        let explicit = SubnetConfig {
            renewal_time_seconds: Some(1000),
            rebinding_time_seconds: Some(2000),
            ..subnet
        };
        assert_eq!(explicit.renewal_time(3600), 1000);
        assert_eq!(explicit.rebinding_time(3600), 2000);
    }

    #[test]
    fn test_timers_fit_a_short_negotiated_lease() {
        let subnet = SubnetConfig {
            lease_duration_seconds: 3600,
            renewal_time_seconds: Some(1800),
            rebinding_time_seconds: Some(3000),
            ..subnet()
        };

        assert_eq!(subnet.lease_timers(3600), (1800, 3000));
        assert_eq!(subnet.lease_timers(60), (30, 52));
        assert_eq!(subnet.lease_timers(2000), (1000, 1750));

        for lease in [60, 61, 120, 1801, 3001, 3599] {
            let (renewal, rebinding) = subnet.lease_timers(lease);
            assert!(renewal < rebinding && rebinding < lease, "lease {}", lease);
        }
    }

    #[test]
    fn test_configured_timers_out_of_order_rejected() {
        let mut config = config();
        config.subnets[0].renewal_time_seconds = Some(5000);
        config.subnets[0].rebinding_time_seconds = Some(4000);
        assert!(config.validate().is_err());

        config.subnets[0].renewal_time_seconds = Some(4000);
        config.subnets[0].rebinding_time_seconds = Some(86400);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_ip_discovered_from_interfaces() {
        let mut config = config();
        config.server_ip = None;
        assert!(config.validate().is_ok());

        let addresses = vec![
            ("lo".to_string(), Ipv4Addr::LOCALHOST),
            ("eth1".to_string(), Ipv4Addr::new(172, 16, 0, 4)),
            ("eth0".to_string(), Ipv4Addr::new(192, 168, 1, 150)),
            ("eth2".to_string(), Ipv4Addr::new(192, 168, 1, 3)),
        ];
        assert_eq!(
            config.select_server_ip(&addresses),
            Some(Ipv4Addr::new(192, 168, 1, 3))
        );

        config.interface = Some("eth1".to_string());
        assert_eq!(config.select_server_ip(&addresses), None);

        config.interface = Some("eth2".to_string());
        assert_eq!(
            config.select_server_ip(&addresses),
            Some(Ipv4Addr::new(192, 168, 1, 3))
        );
    }

    #[test]
    fn test_configured_server_ip_wins() {
        let mut config = config();
        assert_eq!(
            config.resolve_server_ip().unwrap(),
            Ipv4Addr::new(192, 168, 1, 1)
        );
    }

    #[test]
    fn test_parse_mac_address() {
        assert_eq!(
            parse_mac_address("AA-bb-cc-dd-ee-01").unwrap(),
            vec![0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]
        );
        assert!(parse_mac_address("aa:bb:cc").is_err());
        assert!(parse_mac_address("zz:bb:cc:dd:ee:ff").is_err());
    }

    #[test]
    fn test_sanitize_hostname() {
        assert_eq!(sanitize_hostname("My_Laptop!"), "mylaptop");
        assert_eq!(sanitize_hostname("-host.lan."), "host.lan");
        assert_eq!(sanitize_hostname(&"a".repeat(100)).len(), 63);
    }
}
