//! UDP listener and background tasks.
//!
//! The listener hands every datagram to its own task, which runs it
//! through the [`ProtocolEngine`] and sends the reply (if any) to the
//! destination RFC 2131 §4.1 prescribes. A second task runs the expiry
//! sweep on a fixed interval.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::engine::ProtocolEngine;
use crate::error::{Error, Result};
use crate::options::MessageType;
use crate::packet::DhcpPacket;

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(1);
const RATE_LIMIT_CLEANUP_THRESHOLD: usize = 1000;
const RECV_BUFFER_SIZE: usize = 1500;

/// Sliding one-second window of accepted packets per hardware address.
#[derive(Debug)]
pub struct RateLimiter {
    max_per_window: usize,
    clients: Mutex<HashMap<Vec<u8>, Vec<Instant>>>,
}

impl RateLimiter {
    /// A limit of zero disables limiting.
    pub fn new(max_per_window: usize) -> Self {
        Self {
            max_per_window,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Records a packet from `hardware_id` and returns true if it exceeds
    /// the limit and should be dropped.
    pub async fn is_limited(&self, hardware_id: &[u8]) -> bool {
        if self.max_per_window == 0 {
            return false;
        }

        let mut clients = self.clients.lock().await;
        let now = Instant::now();

        if clients.len() > RATE_LIMIT_CLEANUP_THRESHOLD {
            clients.retain(|_, timestamps| {
                timestamps.retain(|t| now.duration_since(*t) < RATE_LIMIT_WINDOW);
                !timestamps.is_empty()
            });
        }

        let timestamps = clients.entry(hardware_id.to_vec()).or_default();
        timestamps.retain(|t| now.duration_since(*t) < RATE_LIMIT_WINDOW);

        if timestamps.len() >= self.max_per_window {
            return true;
        }

        timestamps.push(now);
        false
    }

    pub async fn tracked_clients(&self) -> usize {
        self.clients.lock().await.len()
    }
}

/// Where a reply to `request` must be sent.
///
/// Relayed requests go back to the relay on the server port. NAKs,
/// broadcast-flagged requests and clients without an address get a
/// broadcast. Everyone else is unicast at `ciaddr`.
pub fn reply_destination(request: &DhcpPacket, reply: &DhcpPacket) -> SocketAddr {
    let is_nak = reply.message_type() == Some(MessageType::Nak);

    if request.giaddr != Ipv4Addr::UNSPECIFIED {
        SocketAddr::new(IpAddr::V4(request.giaddr), DHCP_SERVER_PORT)
    } else if is_nak || request.is_broadcast() || request.ciaddr == Ipv4Addr::UNSPECIFIED {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), DHCP_CLIENT_PORT)
    } else {
        SocketAddr::new(IpAddr::V4(request.ciaddr), DHCP_CLIENT_PORT)
    }
}

pub struct DhcpServer {
    engine: Arc<ProtocolEngine>,
    socket: Arc<UdpSocket>,
    rate_limiter: Arc<RateLimiter>,
}

impl DhcpServer {
    /// Binds `0.0.0.0:67` for `engine`.
    pub async fn new(engine: ProtocolEngine) -> Result<Self> {
        let socket = Self::create_socket(engine.config())?;

        info!(
            "DHCP server starting on {}:{}",
            engine.server_ip(),
            DHCP_SERVER_PORT
        );
        for subnet in &engine.config().subnets {
            info!(
                "Subnet {} ({}): {} pool address(es), {} reservation(s)",
                subnet.id,
                subnet.network,
                subnet.pool_size(),
                subnet.reservations.len()
            );
        }

        Ok(Self::with_socket(engine, socket))
    }

    /// Serves `engine` on an already bound socket.
    pub fn with_socket(engine: ProtocolEngine, socket: UdpSocket) -> Self {
        let rate_limiter = RateLimiter::new(engine.config().rate_limit_per_second);
        Self {
            engine: Arc::new(engine),
            socket: Arc::new(socket),
            rate_limiter: Arc::new(rate_limiter),
        }
    }

    fn create_socket(config: &Config) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

        socket
            .set_reuse_address(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

        socket
            .set_broadcast(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_BROADCAST: {}", error)))?;

        socket
            .set_nonblocking(true)
            .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

        if let Some(interface) = &config.interface {
            bind_to_interface(&socket, interface)?;
        }

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DHCP_SERVER_PORT);
        socket.bind(&bind_addr.into()).map_err(|error| {
            Error::Socket(format!("Failed to bind to {}: {}", bind_addr, error))
        })?;

        let std_socket: std::net::UdpSocket = socket.into();
        UdpSocket::from_std(std_socket)
            .map_err(|error| Error::Socket(format!("Failed to convert to tokio socket: {}", error)))
    }

    /// Receives until the task is cancelled. The sweep task stops with it.
    pub async fn run(&self) -> Result<()> {
        let _sweeper = SweepTask(spawn_sweeper(Arc::clone(&self.engine)));
        let mut buffer = [0u8; RECV_BUFFER_SIZE];

        info!("DHCP server ready and listening");

        loop {
            match self.socket.recv_from(&mut buffer).await {
                Ok((size, source)) => {
                    let data = buffer[..size].to_vec();
                    let handler = self.handler();

                    tokio::spawn(async move {
                        if let Err(error) = handler.handle_packet(&data, source).await {
                            warn!("Error handling packet from {}: {}", source, error);
                        }
                    });
                }
                Err(error) => {
                    error!("Error receiving packet: {}", error);
                }
            }
        }
    }

    fn handler(&self) -> PacketHandler {
        PacketHandler {
            engine: Arc::clone(&self.engine),
            socket: Arc::clone(&self.socket),
            rate_limiter: Arc::clone(&self.rate_limiter),
        }
    }

    pub fn engine(&self) -> &ProtocolEngine {
        &self.engine
    }

    /// Flushes buffered lease state before exit.
    pub async fn shutdown(&self) -> Result<()> {
        self.engine.store().flush().await
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn bind_to_interface(socket: &Socket, interface: &str) -> Result<()> {
    socket.bind_device(Some(interface.as_bytes())).map_err(|error| {
        Error::Socket(format!("Failed to bind to interface {}: {}", interface, error))
    })?;
    info!("Listening on interface {}", interface);
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn bind_to_interface(_socket: &Socket, interface: &str) -> Result<()> {
    warn!(
        "interface ({}) is only supported on Linux and will be ignored",
        interface
    );
    Ok(())
}

/// Aborts the sweep task when the server stops running.
struct SweepTask(JoinHandle<()>);

impl Drop for SweepTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn spawn_sweeper(engine: Arc<ProtocolEngine>) -> JoinHandle<()> {
    let period = Duration::from_secs(u64::from(engine.config().sweep_interval_seconds.max(1)));

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if let Err(error) = engine.sweep().await {
                error!("Lease sweep failed: {}", error);
            }
        }
    })
}

struct PacketHandler {
    engine: Arc<ProtocolEngine>,
    socket: Arc<UdpSocket>,
    rate_limiter: Arc<RateLimiter>,
}

impl PacketHandler {
    async fn handle_packet(&self, data: &[u8], source: SocketAddr) -> Result<()> {
        let packet = DhcpPacket::parse(data)?;

        if self.rate_limiter.is_limited(&packet.hardware_id()).await {
            warn!("Rate limited: {} from {}", packet.format_mac(), source);
            return Ok(());
        }

        match self.engine.process(&packet).await {
            Ok(Some(reply)) => self.send_reply(&reply, &packet).await,
            Ok(None) => Ok(()),
            Err(error) if error.is_store_unavailable() => {
                error!(
                    "Lease store unavailable, dropping {} from {}: {}",
                    packet
                        .message_type()
                        .map(|kind| kind.as_str())
                        .unwrap_or("BOOTP"),
                    packet.format_mac(),
                    error
                );
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    async fn send_reply(&self, reply: &DhcpPacket, request: &DhcpPacket) -> Result<()> {
        let destination = reply_destination(request, reply);
        self.socket.send_to(&reply.encode(), destination).await?;
        Ok(())
    }
}
