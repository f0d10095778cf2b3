//! DHCP message handling.
//!
//! [`ProtocolEngine::process`] turns one client message into at most one
//! reply. It never touches the network; the [`server`](crate::server)
//! decides where replies go. Every decision that can race with another
//! exchange is delegated to the [`LeaseStore`], so the engine itself is
//! shared freely between packet tasks.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cache::BindingCache;
use crate::config::{Config, SubnetConfig, sanitize_hostname};
use crate::error::{Error, Result};
use crate::lease::{LeaseState, encode_client_id};
use crate::options::{DhcpOption, MessageType, OptionCode};
use crate::packet::{BOOTREQUEST, DhcpPacket};
use crate::policy::{Policy, ReservationEntry, SubnetPolicy};
use crate::session::{SessionPhase, SessionTable};
use crate::store::{BindRequest, LeaseStore, OfferRequest, SweepReport};

/// Shortest lease a client can negotiate with option 51.
const MIN_LEASE_SECONDS: u32 = 60;

/// Options sent whether or not the client listed them in option 55.
const ALWAYS_SENT: [OptionCode; 5] = [
    OptionCode::MessageType,
    OptionCode::ServerIdentifier,
    OptionCode::LeaseTime,
    OptionCode::RenewalTime,
    OptionCode::RebindingTime,
];

pub struct ProtocolEngine {
    config: Arc<Config>,
    server_ip: Ipv4Addr,
    policy: Arc<Policy>,
    store: Arc<dyn LeaseStore>,
    sessions: SessionTable,
    cache: BindingCache,
}

impl ProtocolEngine {
    pub fn new(
        config: Arc<Config>,
        server_ip: Ipv4Addr,
        policy: Arc<Policy>,
        store: Arc<dyn LeaseStore>,
    ) -> Self {
        let session_timeout = Duration::from_secs(u64::from(config.session_timeout_seconds));
        Self {
            config,
            server_ip,
            policy,
            store,
            sessions: SessionTable::new(session_timeout),
            cache: BindingCache::new(),
        }
    }

    /// Resolves the server address, validates `config`, pushes its pools
    /// and reservations into `store` and returns an engine serving them.
    pub async fn start(mut config: Config, store: Arc<dyn LeaseStore>) -> Result<Self> {
        let server_ip = config.resolve_server_ip()?;
        config.validate()?;
        let policy = Policy::from_config(&config)?;
        store.sync_policy(&policy).await?;
        Ok(Self::new(Arc::new(config), server_ip, Arc::new(policy), store))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Address sent as option 54 and `siaddr`.
    pub fn server_ip(&self) -> Ipv4Addr {
        self.server_ip
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }

    /// Handles one client message.
    ///
    /// `Ok(None)` means the message was handled and needs no reply.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidPacket`] for server replies, BOOTP messages without
    ///   option 53, and REQUESTs that name no address.
    /// - Store errors when the lease store cannot be reached and no cached
    ///   binding applies. The client gets no reply and will retransmit.
    pub async fn process(&self, packet: &DhcpPacket) -> Result<Option<DhcpPacket>> {
        if packet.op != BOOTREQUEST {
            return Err(Error::InvalidPacket("Expected BOOTREQUEST".to_string()));
        }

        let Some(message_type) = packet.message_type() else {
            return Err(Error::InvalidPacket(
                "Missing DHCP message type (BOOTP is not served)".to_string(),
            ));
        };

        info!("{} from {}", message_type, packet.format_mac());

        match message_type {
            MessageType::Discover => self.handle_discover(packet).await,
            MessageType::Request => self.handle_request(packet).await,
            MessageType::Release => self.handle_release(packet).await,
            MessageType::Decline => self.handle_decline(packet).await,
            MessageType::Inform => self.handle_inform(packet).await,
            other => {
                warn!("Ignoring {} message from a client", other);
                Ok(None)
            }
        }
    }

    /// Runs one expiry pass over the store, the session table and the cache.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let report = self.store.expire().await?;
        let sessions = self.sessions.reap().await;
        let cached = self.cache.prune().await;

        if report.total() > 0 || sessions > 0 {
            info!(
                "Sweep expired {} offer(s) and {} binding(s), cleared {} decline(s), reaped {} session(s)",
                report.offers_expired, report.bindings_expired, report.declines_cleared, sessions
            );
        }
        debug!("Pruned {} cached binding(s)", cached);

        Ok(report)
    }

    async fn handle_discover(&self, packet: &DhcpPacket) -> Result<Option<DhcpPacket>> {
        let mac = packet.format_mac();
        let client_id = packet.client_key();

        let Some(subnet) = self.policy.select_subnet(packet.giaddr, packet.ciaddr) else {
            warn!("No subnet serves DISCOVER from {} via {}", mac, packet.giaddr);
            return Ok(None);
        };

        let reservation = self.reservation(packet, &client_id, subnet);
        let request = OfferRequest {
            client_id: client_id.clone(),
            subnet: subnet.id.clone(),
            reserved: reservation.map(|entry| entry.address),
            requested: packet.requested_ip(),
            hostname: client_hostname(packet, reservation),
            offer_seconds: self.config.offer_timeout_seconds,
        };

        let lease = match self.store.offer(request).await {
            Ok(lease) => lease,
            Err(Error::PoolExhausted) => {
                warn!("Pool exhausted in subnet {}, cannot offer IP to {}", subnet.id, mac);
                return Ok(Some(self.nak(packet, "address pool exhausted")));
            }
            Err(Error::AddressUnavailable(ip)) => {
                warn!("Reserved address {} for {} is held by another client", ip, mac);
                return Ok(Some(self.nak(packet, "reserved address in use")));
            }
            Err(error) => return Err(error),
        };

        self.sessions
            .record_offer(packet.xid, &client_id, &subnet.id, lease.ip_address)
            .await;

        let lease_seconds = self.policy.lease_seconds(subnet, lease.ip_address);
        let offer = self.lease_reply(
            packet,
            MessageType::Offer,
            subnet,
            lease.ip_address,
            lease_seconds,
        );

        info!("OFFER {} to {}", lease.ip_address, mac);

        Ok(Some(offer))
    }

    async fn handle_request(&self, packet: &DhcpPacket) -> Result<Option<DhcpPacket>> {
        let mac = packet.format_mac();
        let client_id = packet.client_key();

        if let Some(server_id) = packet.server_identifier()
            && server_id != self.server_ip
        {
            info!("REQUEST from {} is for different server {}", mac, server_id);
            self.withdraw_offer(packet, &client_id).await?;
            return Ok(None);
        }

        let requested_ip = packet
            .requested_ip()
            .or((packet.ciaddr != Ipv4Addr::UNSPECIFIED).then_some(packet.ciaddr))
            .ok_or_else(|| Error::InvalidPacket("No IP address in REQUEST".to_string()))?;

        let Some(subnet) = self.policy.select_subnet(packet.giaddr, packet.ciaddr) else {
            warn!("No subnet serves REQUEST from {} via {}", mac, packet.giaddr);
            return Ok(None);
        };

        if let Some(session) = self.sessions.begin_request(packet.xid, &client_id).await {
            if session.phase == SessionPhase::Requesting {
                debug!("Retransmitted REQUEST from {} (xid {:#x})", mac, packet.xid);
            }
            if packet.server_identifier().is_some()
                && (session.offered != requested_ip || session.subnet != subnet.id)
            {
                warn!(
                    "REQUEST from {} for {} does not match offer of {} in {}",
                    mac, requested_ip, session.offered, session.subnet
                );
                self.withdraw_offer(packet, &client_id).await?;
                return Ok(Some(self.nak(packet, "requested address does not match offer")));
            }
        }

        let reservation = self.reservation(packet, &client_id, subnet);
        if let Err(error) = self.policy.authorize(reservation, subnet, requested_ip) {
            return Ok(Some(self.reject(packet, &client_id, &error).await));
        }

        let lease_seconds = self.negotiate_lease_time(packet, subnet, requested_ip);
        let request = BindRequest {
            client_id: client_id.clone(),
            subnet: subnet.id.clone(),
            address: requested_ip,
            hostname: client_hostname(packet, reservation),
            lease_seconds,
        };

        match self.store.bind(request).await {
            Ok(lease) => {
                self.cache.insert(&lease).await;
                self.sessions.finish(packet.xid, &client_id).await;

                let ack = self.lease_reply(
                    packet,
                    MessageType::Ack,
                    subnet,
                    requested_ip,
                    lease_seconds,
                );
                info!("ACK {} to {} (lease: {} seconds)", requested_ip, mac, lease_seconds);
                Ok(Some(ack))
            }
            Err(
                error @ (Error::AddressUnavailable(_)
                | Error::AddressOutOfRange(_)
                | Error::PoolExhausted),
            ) => Ok(Some(self.reject(packet, &client_id, &error).await)),
            Err(error) if error.is_store_unavailable() => {
                self.renew_from_cache(packet, &client_id, subnet, requested_ip, error)
                    .await
            }
            Err(error) => Err(error),
        }
    }

    /// ACKs a renewal from the binding cache while the store is down, if
    /// enabled. Otherwise passes the store error through.
    async fn renew_from_cache(
        &self,
        packet: &DhcpPacket,
        client_id: &str,
        subnet: &SubnetPolicy,
        requested_ip: Ipv4Addr,
        error: Error,
    ) -> Result<Option<DhcpPacket>> {
        if !self.config.serve_cached_renewals {
            return Err(error);
        }

        let Some(binding) = self.cache.lookup(client_id, requested_ip).await else {
            return Err(error);
        };
        if binding.subnet != subnet.id {
            return Err(error);
        }

        let remaining = u32::try_from(binding.remaining_seconds()).unwrap_or(u32::MAX);
        self.sessions.finish(packet.xid, client_id).await;

        warn!(
            "Lease store unavailable ({}); ACK {} to {} from cache ({} seconds left)",
            error,
            requested_ip,
            packet.format_mac(),
            remaining
        );

        Ok(Some(self.lease_reply(
            packet,
            MessageType::Ack,
            subnet,
            requested_ip,
            remaining,
        )))
    }

    /// Gives back what this server offered when the client chose another
    /// server.
    async fn withdraw_offer(&self, packet: &DhcpPacket, client_id: &str) -> Result<()> {
        let offered = match self.sessions.finish(packet.xid, client_id).await {
            Some(session) => Some(session.offered),
            None => match self.policy.select_subnet(packet.giaddr, packet.ciaddr) {
                Some(subnet) => self
                    .store
                    .lease_for_client(client_id, &subnet.id)
                    .await?
                    .filter(|lease| lease.state == LeaseState::Offered)
                    .map(|lease| lease.ip_address),
                None => None,
            },
        };

        if let Some(ip) = offered
            && self.store.release(client_id, ip).await?
        {
            info!("Withdrew offer of {} to {}", ip, packet.format_mac());
        }

        Ok(())
    }

    async fn handle_release(&self, packet: &DhcpPacket) -> Result<Option<DhcpPacket>> {
        let mac = packet.format_mac();
        let client_id = packet.client_key();

        let address = if packet.ciaddr != Ipv4Addr::UNSPECIFIED {
            Some(packet.ciaddr)
        } else {
            warn!("RELEASE from {} with no ciaddr", mac);
            match self.policy.select_subnet(packet.giaddr, packet.ciaddr) {
                Some(subnet) => self
                    .store
                    .lease_for_client(&client_id, &subnet.id)
                    .await?
                    .map(|lease| lease.ip_address),
                None => None,
            }
        };

        self.cache.invalidate(&client_id).await;

        let Some(address) = address else {
            return Ok(None);
        };

        if self.store.release(&client_id, address).await? {
            info!("RELEASE from {} for {}", mac, address);
        } else {
            warn!("RELEASE from {} for {} ignored - no active lease", mac, address);
        }

        Ok(None)
    }

    async fn handle_decline(&self, packet: &DhcpPacket) -> Result<Option<DhcpPacket>> {
        let mac = packet.format_mac();
        let client_id = packet.client_key();

        let Some(declined_ip) = packet.requested_ip() else {
            warn!("DECLINE from {} without a requested address", mac);
            return Ok(None);
        };

        let served = self
            .policy
            .subnets()
            .iter()
            .any(|subnet| subnet.network.contains(&declined_ip));
        if !served {
            warn!("DECLINE from {} for {} outside every subnet", mac, declined_ip);
            return Ok(None);
        }

        self.cache.invalidate(&client_id).await;

        if self.store.decline(&client_id, declined_ip).await? {
            warn!(
                "DECLINE from {} for {} - marked IP as unavailable",
                mac, declined_ip
            );
        } else {
            warn!(
                "DECLINE from {} for {} rejected - IP not associated with this client",
                mac, declined_ip
            );
        }

        Ok(None)
    }

    async fn handle_inform(&self, packet: &DhcpPacket) -> Result<Option<DhcpPacket>> {
        let mac = packet.format_mac();

        let Some(subnet) = self.policy.select_subnet(packet.giaddr, packet.ciaddr) else {
            warn!("No subnet serves INFORM from {}", mac);
            return Ok(None);
        };

        let mut options = vec![DhcpOption::ServerIdentifier(self.server_ip)];
        if let Some(subnet) = self.config.subnet(&subnet.id) {
            common_options(subnet, &mut options);
        }
        let options = self.finish_options(packet, options);

        let mut ack = DhcpPacket::create_reply(
            packet,
            MessageType::Ack,
            Ipv4Addr::UNSPECIFIED,
            self.server_ip,
            options,
        );
        ack.ciaddr = packet.ciaddr;

        info!("INFORM response to {}", mac);

        Ok(Some(ack))
    }

    /// Reservation for this client that applies in `subnet`.
    fn reservation(
        &self,
        packet: &DhcpPacket,
        client_id: &str,
        subnet: &SubnetPolicy,
    ) -> Option<&ReservationEntry> {
        let hardware_id = encode_client_id(&packet.hardware_id());
        self.policy
            .reservation_for(client_id, &hardware_id)
            .filter(|entry| entry.subnet == subnet.id)
    }

    fn negotiate_lease_time(
        &self,
        packet: &DhcpPacket,
        subnet: &SubnetPolicy,
        ip: Ipv4Addr,
    ) -> u32 {
        let max_lease = self.policy.lease_seconds(subnet, ip);
        match packet.requested_lease_time() {
            Some(requested) => requested.max(MIN_LEASE_SECONDS).min(max_lease),
            None => max_lease,
        }
    }

    async fn reject(&self, packet: &DhcpPacket, client_id: &str, error: &Error) -> DhcpPacket {
        self.sessions.finish(packet.xid, client_id).await;
        self.cache.invalidate(client_id).await;
        self.nak(packet, &error.to_string())
    }

    fn nak(&self, packet: &DhcpPacket, reason: &str) -> DhcpPacket {
        warn!("NAK to {}: {}", packet.format_mac(), reason);

        let mut options = vec![
            DhcpOption::ServerIdentifier(self.server_ip),
            DhcpOption::Message(reason.to_string()),
        ];
        if let Some(relay_info) = packet.relay_agent_info() {
            options.push(DhcpOption::RelayAgentInfo(relay_info.to_vec()));
        }

        DhcpPacket::create_reply(
            packet,
            MessageType::Nak,
            Ipv4Addr::UNSPECIFIED,
            self.server_ip,
            options,
        )
    }

    fn lease_reply(
        &self,
        packet: &DhcpPacket,
        message_type: MessageType,
        subnet: &SubnetPolicy,
        your_ip: Ipv4Addr,
        lease_seconds: u32,
    ) -> DhcpPacket {
        let options = self.lease_options(&subnet.id, lease_seconds);
        let options = self.finish_options(packet, options);
        DhcpPacket::create_reply(packet, message_type, your_ip, self.server_ip, options)
    }

    fn lease_options(&self, subnet_id: &str, lease_seconds: u32) -> Vec<DhcpOption> {
        let mut options = vec![
            DhcpOption::ServerIdentifier(self.server_ip),
            DhcpOption::LeaseTime(lease_seconds),
        ];

        if let Some(subnet) = self.config.subnet(subnet_id) {
            common_options(subnet, &mut options);
            options.push(DhcpOption::RenewalTime(subnet.renewal_time(lease_seconds)));
            options.push(DhcpOption::RebindingTime(subnet.rebinding_time(lease_seconds)));
        }

        options
    }

    /// Applies the parameter request list, then echoes relay agent info.
    fn finish_options(&self, packet: &DhcpPacket, options: Vec<DhcpOption>) -> Vec<DhcpOption> {
        let mut options = filter_options_by_prl(options, packet.parameter_request_list());
        if let Some(relay_info) = packet.relay_agent_info() {
            options.push(DhcpOption::RelayAgentInfo(relay_info.to_vec()));
        }
        options
    }
}

fn common_options(subnet: &SubnetConfig, options: &mut Vec<DhcpOption>) {
    options.push(DhcpOption::SubnetMask(subnet.subnet_mask()));

    if let Some(gateway) = subnet.gateway {
        options.push(DhcpOption::Router(vec![gateway]));
    }

    if !subnet.dns_servers.is_empty() {
        options.push(DhcpOption::DnsServer(subnet.dns_servers.clone()));
    }

    if let Some(ref domain) = subnet.domain_name {
        options.push(DhcpOption::DomainName(domain.clone()));
    }

    options.push(DhcpOption::BroadcastAddress(subnet.calculate_broadcast()));

    if let Some(mtu) = subnet.mtu {
        options.push(DhcpOption::InterfaceMtu(mtu));
    }
}

fn filter_options_by_prl(
    options: Vec<DhcpOption>,
    parameter_request_list: Option<&[u8]>,
) -> Vec<DhcpOption> {
    let Some(prl) = parameter_request_list else {
        return options;
    };

    options
        .into_iter()
        .filter(|opt| {
            let code = opt.option_code();
            ALWAYS_SENT.iter().any(|kept| *kept as u8 == code) || prl.contains(&code)
        })
        .collect()
}

/// Sanitized option 12, falling back to the reservation's hostname.
fn client_hostname(packet: &DhcpPacket, reservation: Option<&ReservationEntry>) -> Option<String> {
    packet
        .hostname()
        .map(sanitize_hostname)
        .filter(|name| !name.is_empty())
        .or_else(|| reservation.and_then(|entry| entry.hostname.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolConfig, Reservation};
    use crate::store::MemoryStore;

    const MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];

    fn test_config() -> Config {
        Config {
            server_ip: Some(Ipv4Addr::new(10, 0, 0, 1)),
            subnets: vec![SubnetConfig {
                id: "lan".to_string(),
                network: "10.0.0.0/24".parse().unwrap(),
                pools: vec![PoolConfig {
                    start: Ipv4Addr::new(10, 0, 0, 100),
                    end: Ipv4Addr::new(10, 0, 0, 110),
                    exclusions: vec![],
                    lease_duration_seconds: None,
                }],
                reservations: vec![Reservation {
                    mac_address: "02:00:00:00:00:99".to_string(),
                    ip_address: Ipv4Addr::new(10, 0, 0, 50),
                    hostname: Some("printer".to_string()),
                }],
                gateway: Some(Ipv4Addr::new(10, 0, 0, 1)),
                dns_servers: vec![Ipv4Addr::new(10, 0, 0, 1)],
                domain_name: Some("test.local".to_string()),
                lease_duration_seconds: 3600,
                renewal_time_seconds: None,
                rebinding_time_seconds: None,
                broadcast_address: None,
                mtu: Some(1500),
            }],
            ..Config::default()
        }
    }

    async fn engine() -> ProtocolEngine {
        ProtocolEngine::start(test_config(), Arc::new(MemoryStore::new()))
            .await
            .unwrap()
    }

    fn find<T>(reply: &DhcpPacket, extract: impl Fn(&DhcpOption) -> Option<T>) -> Option<T> {
        reply.options.iter().find_map(extract)
    }

    #[tokio::test]
    async fn test_discover_offers_lowest_free_address() {
        let engine = engine().await;
        let discover = DhcpPacket::request(MessageType::Discover, 1, MAC, vec![]);

        let offer = engine.process(&discover).await.unwrap().unwrap();
        assert_eq!(offer.message_type(), Some(MessageType::Offer));
        assert_eq!(offer.yiaddr, Ipv4Addr::new(10, 0, 0, 100));
        assert_eq!(offer.siaddr, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(offer.server_identifier(), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(offer.requested_lease_time(), Some(3600));
        assert_eq!(
            find(&offer, |opt| match opt {
                DhcpOption::RenewalTime(t1) => Some(*t1),
                _ => None,
            }),
            Some(1800)
        );
        assert_eq!(
            find(&offer, |opt| match opt {
                DhcpOption::RebindingTime(t2) => Some(*t2),
                _ => None,
            }),
            Some(3150)
        );

        let lease = engine
            .store()
            .lease_for_address(offer.yiaddr)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.state, LeaseState::Offered);
    }

    #[tokio::test]
    async fn test_request_binds_and_acks() {
        let engine = engine().await;
        let discover = DhcpPacket::request(MessageType::Discover, 2, MAC, vec![]);
        let offer = engine.process(&discover).await.unwrap().unwrap();

        let request = DhcpPacket::request(
            MessageType::Request,
            2,
            MAC,
            vec![
                DhcpOption::RequestedIpAddress(offer.yiaddr),
                DhcpOption::ServerIdentifier(Ipv4Addr::new(10, 0, 0, 1)),
                DhcpOption::Hostname("Laptop_01".to_string()),
            ],
        );
        let ack = engine.process(&request).await.unwrap().unwrap();
        assert_eq!(ack.message_type(), Some(MessageType::Ack));
        assert_eq!(ack.yiaddr, offer.yiaddr);

        let lease = engine
            .store()
            .lease_for_address(offer.yiaddr)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.state, LeaseState::Bound);
        assert_eq!(lease.hostname.as_deref(), Some("laptop01"));
        assert!(engine.sessions.is_empty().await);
    }

    #[tokio::test]
    async fn test_request_lease_time_is_clamped() {
        let engine = engine().await;
        let ip = Ipv4Addr::new(10, 0, 0, 105);

        for (requested, granted) in [(10, 60), (600, 600), (86_400, 3600)] {
            let request = DhcpPacket::request(
                MessageType::Request,
                3,
                MAC,
                vec![
                    DhcpOption::RequestedIpAddress(ip),
                    DhcpOption::LeaseTime(requested),
                ],
            );
            let ack = engine.process(&request).await.unwrap().unwrap();
            assert_eq!(ack.requested_lease_time(), Some(granted));
        }
    }

    #[tokio::test]
    async fn test_request_outside_pool_is_naked() {
        let engine = engine().await;
        let request = DhcpPacket::request(
            MessageType::Request,
            4,
            MAC,
            vec![DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 0, 0, 200))],
        );

        let nak = engine.process(&request).await.unwrap().unwrap();
        assert_eq!(nak.message_type(), Some(MessageType::Nak));
        assert_eq!(nak.yiaddr, Ipv4Addr::UNSPECIFIED);
        assert!(nak.options.iter().any(|opt| matches!(opt, DhcpOption::Message(_))));
        assert!(nak.requested_lease_time().is_none());
    }

    #[tokio::test]
    async fn test_request_for_other_server_withdraws_offer() {
        let engine = engine().await;
        let discover = DhcpPacket::request(MessageType::Discover, 5, MAC, vec![]);
        let offer = engine.process(&discover).await.unwrap().unwrap();

        let request = DhcpPacket::request(
            MessageType::Request,
            5,
            MAC,
            vec![
                DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 0, 0, 240)),
                DhcpOption::ServerIdentifier(Ipv4Addr::new(10, 0, 0, 254)),
            ],
        );
        assert!(engine.process(&request).await.unwrap().is_none());
        assert!(
            engine
                .store()
                .lease_for_address(offer.yiaddr)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_request_without_address_is_malformed() {
        let engine = engine().await;
        let request = DhcpPacket::request(MessageType::Request, 6, MAC, vec![]);
        assert!(matches!(
            engine.process(&request).await,
            Err(Error::InvalidPacket(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_bootreply_and_bootp() {
        let engine = engine().await;

        let mut reply = DhcpPacket::request(MessageType::Discover, 7, MAC, vec![]);
        reply.op = crate::packet::BOOTREPLY;
        assert!(engine.process(&reply).await.is_err());

        let mut bootp = DhcpPacket::request(MessageType::Discover, 7, MAC, vec![]);
        bootp.options.clear();
        assert!(engine.process(&bootp).await.is_err());
    }

    #[tokio::test]
    async fn test_reserved_client_gets_its_address() {
        let engine = engine().await;
        let reserved_mac = [0x02, 0x00, 0x00, 0x00, 0x00, 0x99];
        let discover = DhcpPacket::request(MessageType::Discover, 8, reserved_mac, vec![]);

        let offer = engine.process(&discover).await.unwrap().unwrap();
        assert_eq!(offer.yiaddr, Ipv4Addr::new(10, 0, 0, 50));

        let request = DhcpPacket::request(
            MessageType::Request,
            8,
            reserved_mac,
            vec![DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 0, 0, 100))],
        );
        let nak = engine.process(&request).await.unwrap().unwrap();
        assert_eq!(nak.message_type(), Some(MessageType::Nak));
    }

    #[tokio::test]
    async fn test_release_frees_address() {
        let engine = engine().await;
        let ip = Ipv4Addr::new(10, 0, 0, 101);
        let request = DhcpPacket::request(
            MessageType::Request,
            9,
            MAC,
            vec![DhcpOption::RequestedIpAddress(ip)],
        );
        engine.process(&request).await.unwrap().unwrap();

        let mut release = DhcpPacket::request(MessageType::Release, 10, MAC, vec![]);
        release.ciaddr = ip;
        assert!(engine.process(&release).await.unwrap().is_none());
        assert!(engine.store().lease_for_address(ip).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_decline_quarantines_address() {
        let engine = engine().await;
        let discover = DhcpPacket::request(MessageType::Discover, 11, MAC, vec![]);
        let offer = engine.process(&discover).await.unwrap().unwrap();
        let request = DhcpPacket::request(
            MessageType::Request,
            11,
            MAC,
            vec![DhcpOption::RequestedIpAddress(offer.yiaddr)],
        );
        engine.process(&request).await.unwrap().unwrap();

        let decline = DhcpPacket::request(
            MessageType::Decline,
            12,
            MAC,
            vec![DhcpOption::RequestedIpAddress(offer.yiaddr)],
        );
        assert!(engine.process(&decline).await.unwrap().is_none());

        let other = [0x02, 0x00, 0x00, 0x00, 0x00, 0x02];
        let discover = DhcpPacket::request(MessageType::Discover, 13, other, vec![]);
        let next = engine.process(&discover).await.unwrap().unwrap();
        assert_ne!(next.yiaddr, offer.yiaddr);
    }

    #[tokio::test]
    async fn test_inform_carries_no_lease() {
        let engine = engine().await;
        let mut inform = DhcpPacket::request(MessageType::Inform, 14, MAC, vec![]);
        inform.ciaddr = Ipv4Addr::new(10, 0, 0, 7);

        let ack = engine.process(&inform).await.unwrap().unwrap();
        assert_eq!(ack.message_type(), Some(MessageType::Ack));
        assert_eq!(ack.yiaddr, Ipv4Addr::UNSPECIFIED);
        assert_eq!(ack.ciaddr, inform.ciaddr);
        assert!(ack.requested_lease_time().is_none());
        assert!(
            ack.options
                .iter()
                .any(|opt| matches!(opt, DhcpOption::DomainName(domain) if domain == "test.local"))
        );
    }

    #[tokio::test]
    async fn test_parameter_request_list_and_relay_info() {
        let engine = engine().await;
        let discover = DhcpPacket::request(
            MessageType::Discover,
            15,
            MAC,
            vec![
                DhcpOption::ParameterRequestList(vec![OptionCode::SubnetMask as u8]),
                DhcpOption::RelayAgentInfo(vec![1, 4, 0, 0, 0, 7]),
            ],
        );

        let offer = engine.process(&discover).await.unwrap().unwrap();
        let codes: Vec<u8> = offer.options.iter().map(DhcpOption::option_code).collect();
        assert_eq!(codes, vec![53, 54, 51, 1, 58, 59, 82]);
        assert_eq!(offer.relay_agent_info(), Some(&[1u8, 4, 0, 0, 0, 7][..]));
    }

    #[tokio::test]
    async fn test_request_not_matching_offer_is_naked() {
        let engine = engine().await;
        let discover = DhcpPacket::request(MessageType::Discover, 16, MAC, vec![]);
        let offer = engine.process(&discover).await.unwrap().unwrap();
        let other = Ipv4Addr::new(10, 0, 0, 107);
        assert_ne!(offer.yiaddr, other);

        let request = DhcpPacket::request(
            MessageType::Request,
            16,
            MAC,
            vec![
                DhcpOption::RequestedIpAddress(other),
                DhcpOption::ServerIdentifier(Ipv4Addr::new(10, 0, 0, 1)),
            ],
        );
        let nak = engine.process(&request).await.unwrap().unwrap();
        assert_eq!(nak.message_type(), Some(MessageType::Nak));
        assert!(engine.store().lease_for_address(other).await.unwrap().is_none());
        assert!(
            engine
                .store()
                .lease_for_address(offer.yiaddr)
                .await
                .unwrap()
                .is_none()
        );
        assert!(engine.sessions.is_empty().await);
    }

    #[tokio::test]
    async fn test_timers_ordered_for_short_lease() {
        let mut config = test_config();
        config.subnets[0].renewal_time_seconds = Some(1800);
        config.subnets[0].rebinding_time_seconds = Some(3000);
        let engine = ProtocolEngine::start(config, Arc::new(MemoryStore::new()))
            .await
            .unwrap();

        let request = DhcpPacket::request(
            MessageType::Request,
            17,
            MAC,
            vec![
                DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 0, 0, 104)),
                DhcpOption::LeaseTime(60),
            ],
        );
        let ack = engine.process(&request).await.unwrap().unwrap();
        let t1 = find(&ack, |opt| match opt {
            DhcpOption::RenewalTime(t1) => Some(*t1),
            _ => None,
        })
        .unwrap();
        let t2 = find(&ack, |opt| match opt {
            DhcpOption::RebindingTime(t2) => Some(*t2),
            _ => None,
        })
        .unwrap();

        assert_eq!(ack.requested_lease_time(), Some(60));
        assert_eq!((t1, t2), (30, 52));
    }

    #[tokio::test]
    async fn test_server_ip_comes_from_config() {
        let engine = engine().await;
        assert_eq!(engine.server_ip(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(engine.config().server_ip, Some(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn test_client_hostname_fallback() {
        let reservation = ReservationEntry {
            client_id: "01:02:00:00:00:00:99".to_string(),
            address: Ipv4Addr::new(10, 0, 0, 50),
            subnet: "lan".to_string(),
            hostname: Some("printer".to_string()),
        };
        let plain = DhcpPacket::request(MessageType::Discover, 1, MAC, vec![]);
        assert_eq!(client_hostname(&plain, Some(&reservation)).as_deref(), Some("printer"));
        assert_eq!(client_hostname(&plain, None), None);

        let junk = DhcpPacket::request(
            MessageType::Discover,
            1,
            MAC,
            vec![DhcpOption::Hostname("__".to_string())],
        );
        assert_eq!(client_hostname(&junk, Some(&reservation)).as_deref(), Some("printer"));
    }
}
