//! Allocation policy derived from the loaded configuration.
//!
//! [`Policy`] answers the questions the protocol engine and the lease
//! stores ask on every exchange: which subnet serves a packet, whether an
//! address may be handed out dynamically, and whether a client owns a
//! reservation. It is immutable once built.

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::config::{Config, parse_mac_address};
use crate::error::{Error, Result};
use crate::lease::encode_client_id;
use crate::packet::HTYPE_ETHERNET;

#[derive(Debug, Clone)]
pub struct PoolRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
    pub exclusions: BTreeSet<Ipv4Addr>,
    pub lease_seconds: u32,
}

impl PoolRange {
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let addr = u32::from(ip);
        addr >= u32::from(self.start) && addr <= u32::from(self.end)
    }

    /// Pool addresses in ascending order, excluded ones skipped.
    pub fn addresses(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        (u32::from(self.start)..=u32::from(self.end))
            .map(Ipv4Addr::from)
            .filter(|ip| !self.exclusions.contains(ip))
    }
}

#[derive(Debug, Clone)]
pub struct SubnetPolicy {
    pub id: String,
    pub network: Ipv4Net,
    pub pools: Vec<PoolRange>,
    pub lease_seconds: u32,
}

impl SubnetPolicy {
    pub fn pool_for(&self, ip: Ipv4Addr) -> Option<&PoolRange> {
        self.pools.iter().find(|pool| pool.contains(ip))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationEntry {
    /// Encoded Ethernet client ID (`01:` followed by the MAC).
    pub client_id: String,
    pub address: Ipv4Addr,
    pub subnet: String,
    pub hostname: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Policy {
    server_ip: Option<Ipv4Addr>,
    subnets: Vec<SubnetPolicy>,
    reservations: HashMap<String, ReservationEntry>,
    reserved_addresses: HashMap<Ipv4Addr, String>,
}

impl Policy {
    /// Builds the policy tables from a validated configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut subnets = Vec::with_capacity(config.subnets.len());
        let mut reservations = HashMap::new();
        let mut reserved_addresses = HashMap::new();

        for subnet in &config.subnets {
            let pools = subnet
                .pools
                .iter()
                .map(|pool| PoolRange {
                    start: pool.start,
                    end: pool.end,
                    exclusions: pool.exclusions.iter().copied().collect(),
                    lease_seconds: pool
                        .lease_duration_seconds
                        .unwrap_or(subnet.lease_duration_seconds),
                })
                .collect();

            for reservation in &subnet.reservations {
                let mut id = vec![HTYPE_ETHERNET];
                id.extend(parse_mac_address(&reservation.mac_address)?);
                let client_id = encode_client_id(&id);

                reserved_addresses.insert(reservation.ip_address, client_id.clone());
                reservations.insert(
                    client_id.clone(),
                    ReservationEntry {
                        client_id,
                        address: reservation.ip_address,
                        subnet: subnet.id.clone(),
                        hostname: reservation.hostname.clone(),
                    },
                );
            }

            subnets.push(SubnetPolicy {
                id: subnet.id.clone(),
                network: subnet.network,
                pools,
                lease_seconds: subnet.lease_duration_seconds,
            });
        }

        if subnets.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one subnet must be configured".to_string(),
            ));
        }

        Ok(Self {
            server_ip: config.server_ip,
            subnets,
            reservations,
            reserved_addresses,
        })
    }

    pub fn subnets(&self) -> &[SubnetPolicy] {
        &self.subnets
    }

    pub fn subnet(&self, id: &str) -> Option<&SubnetPolicy> {
        self.subnets.iter().find(|subnet| subnet.id == id)
    }

    pub fn reservations(&self) -> impl Iterator<Item = &ReservationEntry> {
        self.reservations.values()
    }

    /// Picks the subnet that serves a packet.
    ///
    /// Relayed packets are matched on `giaddr`, renewing clients on
    /// `ciaddr`. Anything else is on the server's own link.
    pub fn select_subnet(&self, giaddr: Ipv4Addr, ciaddr: Ipv4Addr) -> Option<&SubnetPolicy> {
        if giaddr != Ipv4Addr::UNSPECIFIED {
            return self.subnet_containing(giaddr);
        }

        if ciaddr != Ipv4Addr::UNSPECIFIED
            && let Some(subnet) = self.subnet_containing(ciaddr)
        {
            return Some(subnet);
        }

        self.server_ip
            .and_then(|ip| self.subnet_containing(ip))
            .or(match self.subnets.as_slice() {
                [only] => Some(only),
                _ => None,
            })
    }

    fn subnet_containing(&self, ip: Ipv4Addr) -> Option<&SubnetPolicy> {
        self.subnets.iter().find(|subnet| subnet.network.contains(&ip))
    }

    /// Returns a client's reservation. Reservations are keyed by MAC, so a
    /// client sending its own option 61 is matched on its hardware ID.
    pub fn reservation_for(&self, client_id: &str, hardware_id: &str) -> Option<&ReservationEntry> {
        self.reservations
            .get(client_id)
            .or_else(|| self.reservations.get(hardware_id))
    }

    /// Returns the client an address is reserved for.
    pub fn reservation_holder(&self, ip: Ipv4Addr) -> Option<&str> {
        self.reserved_addresses.get(&ip).map(String::as_str)
    }

    /// Returns true if `ip` may be handed out from the subnet's dynamic pools.
    pub fn is_allocatable(&self, subnet: &SubnetPolicy, ip: Ipv4Addr) -> bool {
        subnet
            .pool_for(ip)
            .is_some_and(|pool| !pool.exclusions.contains(&ip))
            && !self.reserved_addresses.contains_key(&ip)
    }

    /// Returns true if `ip` belongs to any subnet's dynamic pools. Only such
    /// addresses may be quarantined by a DECLINE nobody holds a lease for.
    pub fn is_dynamic(&self, ip: Ipv4Addr) -> bool {
        self.subnets
            .iter()
            .any(|subnet| self.is_allocatable(subnet, ip))
    }

    /// Checks whether a client holding `reservation` (if any) may use `ip`
    /// in `subnet`.
    ///
    /// # Errors
    ///
    /// - [`Error::AddressUnavailable`] if the address is reserved for another
    ///   client, or the client's own reservation in this subnet names a
    ///   different address.
    /// - [`Error::AddressOutOfRange`] if the address is outside every pool of
    ///   the subnet or excluded.
    pub fn authorize(
        &self,
        reservation: Option<&ReservationEntry>,
        subnet: &SubnetPolicy,
        ip: Ipv4Addr,
    ) -> Result<()> {
        if let Some(holder) = self.reservation_holder(ip) {
            return match reservation {
                Some(own) if own.client_id == holder => Ok(()),
                _ => Err(Error::AddressUnavailable(ip)),
            };
        }

        if let Some(own) = reservation
            && own.subnet == subnet.id
        {
            return Err(Error::AddressUnavailable(ip));
        }

        if self.is_allocatable(subnet, ip) {
            Ok(())
        } else {
            Err(Error::AddressOutOfRange(ip))
        }
    }

    /// Dynamic candidates of a subnet in ascending order.
    pub fn candidates<'a>(&'a self, subnet: &'a SubnetPolicy) -> impl Iterator<Item = Ipv4Addr> + 'a {
        subnet
            .pools
            .iter()
            .flat_map(PoolRange::addresses)
            .filter(|ip| !self.reserved_addresses.contains_key(ip))
    }

    /// Lease duration for an address, honoring per-pool overrides.
    pub fn lease_seconds(&self, subnet: &SubnetPolicy, ip: Ipv4Addr) -> u32 {
        subnet
            .pool_for(ip)
            .map(|pool| pool.lease_seconds)
            .unwrap_or(subnet.lease_seconds)
    }
}
