//! DHCP options as defined in RFC 2132.
//!
//! Each option is a TLV: one code byte, one length byte, then data. Options
//! this server reads or writes are decoded into [`DhcpOption`] variants;
//! anything else is carried as [`DhcpOption::Unknown`] so relayed packets
//! round-trip intact.
//!
//! # References
//!
//! - RFC 2132: DHCP Options and BOOTP Vendor Extensions
//! - RFC 3046: DHCP Relay Agent Information Option (Option 82)

use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// Router (3) and DNS (6) options carry at most 255 / 4 addresses.
const MAX_ADDRESSES_PER_OPTION: usize = 63;

/// Largest payload a one-byte length field can describe.
const MAX_OPTION_LENGTH: usize = 255;

/// Smallest DHCP message a client may advertise it accepts (RFC 2132 §9.10).
const MIN_MAX_MESSAGE_SIZE: u16 = 576;

/// Option codes this server understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    Pad = 0,
    SubnetMask = 1,
    Router = 3,
    DnsServer = 6,
    Hostname = 12,
    DomainName = 15,
    InterfaceMtu = 26,
    BroadcastAddress = 28,
    RequestedIpAddress = 50,
    LeaseTime = 51,
    /// `sname` and/or `file` carry options (RFC 2132 §9.3).
    OptionOverload = 52,
    MessageType = 53,
    ServerIdentifier = 54,
    ParameterRequestList = 55,
    /// Human-readable error text, sent with NAK (RFC 2132 §9.9).
    Message = 56,
    MaxMessageSize = 57,
    /// T1.
    RenewalTime = 58,
    /// T2.
    RebindingTime = 59,
    ClientIdentifier = 61,
    RelayAgentInfo = 82,
    End = 255,
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Pad,
            1 => Self::SubnetMask,
            3 => Self::Router,
            6 => Self::DnsServer,
            12 => Self::Hostname,
            15 => Self::DomainName,
            26 => Self::InterfaceMtu,
            28 => Self::BroadcastAddress,
            50 => Self::RequestedIpAddress,
            51 => Self::LeaseTime,
            52 => Self::OptionOverload,
            53 => Self::MessageType,
            54 => Self::ServerIdentifier,
            55 => Self::ParameterRequestList,
            56 => Self::Message,
            57 => Self::MaxMessageSize,
            58 => Self::RenewalTime,
            59 => Self::RebindingTime,
            61 => Self::ClientIdentifier,
            82 => Self::RelayAgentInfo,
            255 => Self::End,
            other => return Err(other),
        })
    }
}

/// DHCP message types (Option 53), RFC 2132 §9.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Discover,
            2 => Self::Offer,
            3 => Self::Request,
            4 => Self::Decline,
            5 => Self::Ack,
            6 => Self::Nak,
            7 => Self::Release,
            8 => Self::Inform,
            other => return Err(other),
        })
    }
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discover => "DISCOVER",
            Self::Offer => "OFFER",
            Self::Request => "REQUEST",
            Self::Decline => "DECLINE",
            Self::Ack => "ACK",
            Self::Nak => "NAK",
            Self::Release => "RELEASE",
            Self::Inform => "INFORM",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Option overload flags (Option 52), RFC 2132 §9.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OverloadFlag {
    File = 1,
    Sname = 2,
    Both = 3,
}

impl TryFrom<u8> for OverloadFlag {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::File),
            2 => Ok(Self::Sname),
            3 => Ok(Self::Both),
            other => Err(other),
        }
    }
}

/// A decoded DHCP option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    SubnetMask(Ipv4Addr),
    /// The first address is the default gateway.
    Router(Vec<Ipv4Addr>),
    DnsServer(Vec<Ipv4Addr>),
    Hostname(String),
    DomainName(String),
    InterfaceMtu(u16),
    BroadcastAddress(Ipv4Addr),
    RequestedIpAddress(Ipv4Addr),
    /// Seconds.
    LeaseTime(u32),
    OptionOverload(OverloadFlag),
    MessageType(MessageType),
    ServerIdentifier(Ipv4Addr),
    ParameterRequestList(Vec<u8>),
    Message(String),
    MaxMessageSize(u16),
    RenewalTime(u32),
    RebindingTime(u32),
    ClientIdentifier(Vec<u8>),
    /// Opaque; echoed back to the relay unchanged.
    RelayAgentInfo(Vec<u8>),
    Unknown(u8, Vec<u8>),
}

fn exact<const N: usize>(data: &[u8], what: &str) -> Result<[u8; N]> {
    data.try_into()
        .map_err(|_| Error::InvalidPacket(format!("Invalid {} length: {}", what, data.len())))
}

fn address(data: &[u8], what: &str) -> Result<Ipv4Addr> {
    exact::<4>(data, what).map(Ipv4Addr::from)
}

fn address_list(data: &[u8], what: &str) -> Result<Vec<Ipv4Addr>> {
    if data.is_empty() || !data.len().is_multiple_of(4) {
        return Err(Error::InvalidPacket(format!(
            "Invalid {} option length: {}",
            what,
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(4)
        .map(|chunk| Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]))
        .collect())
}

fn seconds(data: &[u8], what: &str) -> Result<u32> {
    exact::<4>(data, what).map(u32::from_be_bytes)
}

fn text(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

fn tlv(code: OptionCode, data: &[u8]) -> Vec<u8> {
    raw_tlv(code as u8, data)
}

fn raw_tlv(code: u8, data: &[u8]) -> Vec<u8> {
    let len = data.len().min(MAX_OPTION_LENGTH);
    let mut result = Vec::with_capacity(len + 2);
    result.push(code);
    result.push(len as u8);
    result.extend_from_slice(&data[..len]);
    result
}

fn address_list_tlv(code: OptionCode, addresses: &[Ipv4Addr]) -> Vec<u8> {
    let data: Vec<u8> = addresses
        .iter()
        .take(MAX_ADDRESSES_PER_OPTION)
        .flat_map(|addr| addr.octets())
        .collect();
    tlv(code, &data)
}

impl DhcpOption {
    /// Returns the RFC 2132 option code for this option.
    pub fn option_code(&self) -> u8 {
        let code = match self {
            Self::SubnetMask(_) => OptionCode::SubnetMask,
            Self::Router(_) => OptionCode::Router,
            Self::DnsServer(_) => OptionCode::DnsServer,
            Self::Hostname(_) => OptionCode::Hostname,
            Self::DomainName(_) => OptionCode::DomainName,
            Self::InterfaceMtu(_) => OptionCode::InterfaceMtu,
            Self::BroadcastAddress(_) => OptionCode::BroadcastAddress,
            Self::RequestedIpAddress(_) => OptionCode::RequestedIpAddress,
            Self::LeaseTime(_) => OptionCode::LeaseTime,
            Self::OptionOverload(_) => OptionCode::OptionOverload,
            Self::MessageType(_) => OptionCode::MessageType,
            Self::ServerIdentifier(_) => OptionCode::ServerIdentifier,
            Self::ParameterRequestList(_) => OptionCode::ParameterRequestList,
            Self::Message(_) => OptionCode::Message,
            Self::MaxMessageSize(_) => OptionCode::MaxMessageSize,
            Self::RenewalTime(_) => OptionCode::RenewalTime,
            Self::RebindingTime(_) => OptionCode::RebindingTime,
            Self::ClientIdentifier(_) => OptionCode::ClientIdentifier,
            Self::RelayAgentInfo(_) => OptionCode::RelayAgentInfo,
            Self::Unknown(code, _) => return *code,
        };
        code as u8
    }

    /// Parses a DHCP option from its code and raw data.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] if the data length is invalid for
    /// the option type, or for the Pad and End codes which carry no data.
    pub fn parse(code: u8, data: &[u8]) -> Result<Self> {
        let code = match OptionCode::try_from(code) {
            Ok(code) => code,
            Err(unknown) => return Ok(Self::Unknown(unknown, data.to_vec())),
        };

        Ok(match code {
            OptionCode::SubnetMask => Self::SubnetMask(address(data, "subnet mask")?),
            OptionCode::Router => Self::Router(address_list(data, "router")?),
            OptionCode::DnsServer => Self::DnsServer(address_list(data, "DNS server")?),
            OptionCode::Hostname => Self::Hostname(text(data)),
            OptionCode::DomainName => Self::DomainName(text(data)),
            OptionCode::InterfaceMtu => {
                Self::InterfaceMtu(u16::from_be_bytes(exact(data, "MTU")?))
            }
            OptionCode::BroadcastAddress => {
                Self::BroadcastAddress(address(data, "broadcast address")?)
            }
            OptionCode::RequestedIpAddress => {
                Self::RequestedIpAddress(address(data, "requested IP address")?)
            }
            OptionCode::LeaseTime => Self::LeaseTime(seconds(data, "lease time")?),
            OptionCode::OptionOverload => {
                let [value] = exact::<1>(data, "option overload")?;
                Self::OptionOverload(OverloadFlag::try_from(value).map_err(|value| {
                    Error::InvalidPacket(format!("Invalid option overload value: {}", value))
                })?)
            }
            OptionCode::MessageType => {
                let [value] = exact::<1>(data, "message type")?;
                Self::MessageType(MessageType::try_from(value).map_err(|value| {
                    Error::InvalidPacket(format!("Unknown message type: {}", value))
                })?)
            }
            OptionCode::ServerIdentifier => {
                Self::ServerIdentifier(address(data, "server identifier")?)
            }
            OptionCode::ParameterRequestList => Self::ParameterRequestList(data.to_vec()),
            OptionCode::Message => Self::Message(text(data)),
            OptionCode::MaxMessageSize => {
                let size = u16::from_be_bytes(exact(data, "maximum message size")?);
                if size < MIN_MAX_MESSAGE_SIZE {
                    return Err(Error::InvalidPacket(format!(
                        "Maximum message size {} is below {}",
                        size, MIN_MAX_MESSAGE_SIZE
                    )));
                }
                Self::MaxMessageSize(size)
            }
            OptionCode::RenewalTime => Self::RenewalTime(seconds(data, "renewal time")?),
            OptionCode::RebindingTime => Self::RebindingTime(seconds(data, "rebinding time")?),
            OptionCode::ClientIdentifier => Self::ClientIdentifier(data.to_vec()),
            OptionCode::RelayAgentInfo => Self::RelayAgentInfo(data.to_vec()),
            OptionCode::Pad | OptionCode::End => {
                return Err(Error::InvalidPacket(
                    "Pad/End should not be parsed as options".to_string(),
                ));
            }
        })
    }

    /// Encodes the option to its wire format (code + length + data).
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::SubnetMask(addr) => tlv(OptionCode::SubnetMask, &addr.octets()),
            Self::Router(addrs) => address_list_tlv(OptionCode::Router, addrs),
            Self::DnsServer(addrs) => address_list_tlv(OptionCode::DnsServer, addrs),
            Self::Hostname(name) => tlv(OptionCode::Hostname, name.as_bytes()),
            Self::DomainName(name) => tlv(OptionCode::DomainName, name.as_bytes()),
            Self::InterfaceMtu(mtu) => tlv(OptionCode::InterfaceMtu, &mtu.to_be_bytes()),
            Self::BroadcastAddress(addr) => tlv(OptionCode::BroadcastAddress, &addr.octets()),
            Self::RequestedIpAddress(addr) => tlv(OptionCode::RequestedIpAddress, &addr.octets()),
            Self::LeaseTime(time) => tlv(OptionCode::LeaseTime, &time.to_be_bytes()),
            Self::OptionOverload(flag) => tlv(OptionCode::OptionOverload, &[*flag as u8]),
            Self::MessageType(kind) => tlv(OptionCode::MessageType, &[*kind as u8]),
            Self::ServerIdentifier(addr) => tlv(OptionCode::ServerIdentifier, &addr.octets()),
            Self::ParameterRequestList(params) => tlv(OptionCode::ParameterRequestList, params),
            Self::Message(message) => tlv(OptionCode::Message, message.as_bytes()),
            Self::MaxMessageSize(size) => tlv(OptionCode::MaxMessageSize, &size.to_be_bytes()),
            Self::RenewalTime(time) => tlv(OptionCode::RenewalTime, &time.to_be_bytes()),
            Self::RebindingTime(time) => tlv(OptionCode::RebindingTime, &time.to_be_bytes()),
            Self::ClientIdentifier(data) => tlv(OptionCode::ClientIdentifier, data),
            Self::RelayAgentInfo(data) => tlv(OptionCode::RelayAgentInfo, data),
            Self::Unknown(code, data) => raw_tlv(*code, data),
        }
    }
}
