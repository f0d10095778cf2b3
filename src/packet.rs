//! DHCP message framing per RFC 2131 §2.
//!
//! ```text
//! op(1) htype(1) hlen(1) hops(1) | xid(4) | secs(2) flags(2)
//! ciaddr(4) | yiaddr(4) | siaddr(4) | giaddr(4)
//! chaddr(16) | sname(64) | file(128) | cookie(4) = 99.130.83.99
//! options (variable, terminated by End)
//! ```
//!
//! Options found in `sname`/`file` when Option 52 is present are appended
//! to the option list after the ones from the main options area.

use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::lease::encode_client_id;
use crate::options::{DhcpOption, MessageType, OptionCode, OverloadFlag};

const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

const CHADDR_LEN: usize = 16;
const SNAME_LEN: usize = 64;
const FILE_LEN: usize = 128;

/// Bytes preceding the magic cookie.
const BOOTP_HEADER_LEN: usize = 236;

const OPTIONS_OFFSET: usize = BOOTP_HEADER_LEN + MAGIC_COOKIE.len();

/// Replies are padded to this size for BOOTP relay compatibility.
const MIN_PACKET_LEN: usize = 300;

/// Relays increment `hops`; anything past this is a loop.
const MAX_HOPS: u8 = 16;

const BROADCAST_FLAG: u16 = 0x8000;

pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;
pub const HTYPE_ETHERNET: u8 = 1;
pub const HLEN_ETHERNET: u8 = 6;

/// A decoded DHCP message, either a client request or a server reply.
#[derive(Debug, Clone)]
pub struct DhcpPacket {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    /// Transaction id chosen by the client and echoed in replies.
    pub xid: u32,
    pub secs: u16,
    /// Bit 15 asks the server to broadcast its reply.
    pub flags: u16,
    /// Set by clients that already hold an address (RENEWING, REBINDING, INFORM).
    pub ciaddr: Ipv4Addr,
    /// Address handed to the client.
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    /// Relay agent address; zero when the client is on-link.
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; CHADDR_LEN],
    pub sname: [u8; SNAME_LEN],
    pub file: [u8; FILE_LEN],
    pub options: Vec<DhcpOption>,
}

/// Sequential reader over the fixed BOOTP header.
struct HeaderReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> HeaderReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[self.position..self.position + N]);
        self.position += N;
        out
    }

    fn byte(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    fn u16(&mut self) -> u16 {
        u16::from_be_bytes(self.take())
    }

    fn u32(&mut self) -> u32 {
        u32::from_be_bytes(self.take())
    }

    fn address(&mut self) -> Ipv4Addr {
        Ipv4Addr::from(self.take::<4>())
    }
}

fn parse_options(area: &[u8]) -> Result<Vec<DhcpOption>> {
    let mut options = Vec::new();
    let mut rest = area;

    while let Some((&code, tail)) = rest.split_first() {
        if code == OptionCode::Pad as u8 {
            rest = tail;
            continue;
        }
        if code == OptionCode::End as u8 {
            break;
        }
        let Some((&length, tail)) = tail.split_first() else {
            return Err(Error::InvalidPacket("Option length missing".to_string()));
        };
        let length = length as usize;
        if tail.len() < length {
            return Err(Error::InvalidPacket(format!(
                "Option {} truncated: {} of {} bytes",
                code,
                tail.len(),
                length
            )));
        }
        options.push(DhcpOption::parse(code, &tail[..length])?);
        rest = &tail[length..];
    }

    Ok(options)
}

impl DhcpPacket {
    /// Decodes a datagram.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] for short datagrams, a bad magic
    /// cookie, a relay loop (`hops` > 16), an Ethernet `hlen` other than 6,
    /// or malformed options.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < OPTIONS_OFFSET {
            return Err(Error::InvalidPacket(format!(
                "Packet too short: {} bytes (minimum {})",
                data.len(),
                OPTIONS_OFFSET
            )));
        }
        if data[BOOTP_HEADER_LEN..OPTIONS_OFFSET] != MAGIC_COOKIE {
            return Err(Error::InvalidPacket("Invalid magic cookie".to_string()));
        }

        let mut header = HeaderReader::new(data);
        let op = header.byte();
        let htype = header.byte();
        let hlen = header.byte();
        let hops = header.byte();

        if hops > MAX_HOPS {
            return Err(Error::InvalidPacket(format!(
                "Hop count {} exceeds maximum {}",
                hops, MAX_HOPS
            )));
        }
        if htype == HTYPE_ETHERNET && hlen != HLEN_ETHERNET {
            return Err(Error::InvalidPacket(format!(
                "Invalid hlen {} for Ethernet",
                hlen
            )));
        }

        let xid = header.u32();
        let secs = header.u16();
        let flags = header.u16();
        let ciaddr = header.address();
        let yiaddr = header.address();
        let siaddr = header.address();
        let giaddr = header.address();
        let chaddr = header.take::<CHADDR_LEN>();
        let sname = header.take::<SNAME_LEN>();
        let file = header.take::<FILE_LEN>();

        let mut options = parse_options(&data[OPTIONS_OFFSET..])?;

        let overload = options.iter().find_map(|opt| match opt {
            DhcpOption::OptionOverload(flag) => Some(*flag),
            _ => None,
        });
        if let Some(flag) = overload {
            if matches!(flag, OverloadFlag::File | OverloadFlag::Both) {
                options.extend(parse_options(&file)?);
            }
            if matches!(flag, OverloadFlag::Sname | OverloadFlag::Both) {
                options.extend(parse_options(&sname)?);
            }
        }

        Ok(Self {
            op,
            htype,
            hlen,
            hops,
            xid,
            secs,
            flags,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
            sname,
            file,
            options,
        })
    }

    /// Encodes the message, End-terminated and padded to 300 bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(576);

        packet.extend_from_slice(&[self.op, self.htype, self.hlen, self.hops]);
        packet.extend_from_slice(&self.xid.to_be_bytes());
        packet.extend_from_slice(&self.secs.to_be_bytes());
        packet.extend_from_slice(&self.flags.to_be_bytes());
        for addr in [self.ciaddr, self.yiaddr, self.siaddr, self.giaddr] {
            packet.extend_from_slice(&addr.octets());
        }
        packet.extend_from_slice(&self.chaddr);
        packet.extend_from_slice(&self.sname);
        packet.extend_from_slice(&self.file);
        packet.extend_from_slice(&MAGIC_COOKIE);

        for option in &self.options {
            packet.extend_from_slice(&option.encode());
        }
        packet.push(OptionCode::End as u8);

        if packet.len() < MIN_PACKET_LEN {
            packet.resize(MIN_PACKET_LEN, 0);
        }
        packet
    }

    /// First option the extractor accepts. Duplicates after it are ignored.
    fn find_option<'a, T>(&'a self, extract: impl Fn(&'a DhcpOption) -> Option<T>) -> Option<T> {
        self.options.iter().find_map(extract)
    }

    /// Option 53. `None` means a plain BOOTP message.
    pub fn message_type(&self) -> Option<MessageType> {
        self.find_option(|opt| match opt {
            DhcpOption::MessageType(kind) => Some(*kind),
            _ => None,
        })
    }

    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.find_option(|opt| match opt {
            DhcpOption::RequestedIpAddress(ip) => Some(*ip),
            _ => None,
        })
    }

    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.find_option(|opt| match opt {
            DhcpOption::ServerIdentifier(ip) => Some(*ip),
            _ => None,
        })
    }

    pub fn client_identifier(&self) -> Option<&[u8]> {
        self.find_option(|opt| match opt {
            DhcpOption::ClientIdentifier(id) => Some(id.as_slice()),
            _ => None,
        })
    }

    pub fn relay_agent_info(&self) -> Option<&[u8]> {
        self.find_option(|opt| match opt {
            DhcpOption::RelayAgentInfo(info) => Some(info.as_slice()),
            _ => None,
        })
    }

    pub fn hostname(&self) -> Option<&str> {
        self.find_option(|opt| match opt {
            DhcpOption::Hostname(name) => Some(name.as_str()),
            _ => None,
        })
    }

    pub fn parameter_request_list(&self) -> Option<&[u8]> {
        self.find_option(|opt| match opt {
            DhcpOption::ParameterRequestList(params) => Some(params.as_slice()),
            _ => None,
        })
    }

    /// Option 51 as sent by the client; the server may shorten it.
    pub fn requested_lease_time(&self) -> Option<u32> {
        self.find_option(|opt| match opt {
            DhcpOption::LeaseTime(secs) => Some(*secs),
            _ => None,
        })
    }

    /// Hardware address bytes, `hlen` long.
    pub fn chaddr_bytes(&self) -> &[u8] {
        &self.chaddr[..(self.hlen as usize).min(CHADDR_LEN)]
    }

    /// `aa:bb:cc:dd:ee:ff` form of the hardware address, for logging.
    pub fn format_mac(&self) -> String {
        self.chaddr_bytes()
            .iter()
            .map(|byte| format!("{:02x}", byte))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// `htype` followed by the hardware address, the RFC 2132 §9.14 form a
    /// client identifier takes when derived from the MAC.
    pub fn hardware_id(&self) -> Vec<u8> {
        let mut id = Vec::with_capacity(1 + self.chaddr_bytes().len());
        id.push(self.htype);
        id.extend_from_slice(self.chaddr_bytes());
        id
    }

    /// Option 61 when present, otherwise [`hardware_id`](Self::hardware_id).
    pub fn client_id(&self) -> Vec<u8> {
        match self.client_identifier() {
            Some(id) => id.to_vec(),
            None => self.hardware_id(),
        }
    }

    /// [`client_id`](Self::client_id) in the hex form leases are keyed by.
    pub fn client_key(&self) -> String {
        encode_client_id(&self.client_id())
    }

    pub fn is_broadcast(&self) -> bool {
        self.flags & BROADCAST_FLAG != 0
    }

    /// Builds a reply to `request`. Option 53 is placed first; `xid`,
    /// `flags`, `giaddr`, `chaddr`, `htype` and `hlen` are copied over.
    pub fn create_reply(
        request: &DhcpPacket,
        message_type: MessageType,
        your_ip: Ipv4Addr,
        server_ip: Ipv4Addr,
        options: Vec<DhcpOption>,
    ) -> Self {
        let mut all_options = Vec::with_capacity(options.len() + 1);
        all_options.push(DhcpOption::MessageType(message_type));
        all_options.extend(options);

        Self {
            op: BOOTREPLY,
            htype: request.htype,
            hlen: request.hlen,
            hops: 0,
            xid: request.xid,
            secs: 0,
            flags: request.flags,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: your_ip,
            siaddr: server_ip,
            giaddr: request.giaddr,
            chaddr: request.chaddr,
            sname: [0u8; SNAME_LEN],
            file: [0u8; FILE_LEN],
            options: all_options,
        }
    }

    /// A client request from an Ethernet host, options following option 53.
    pub fn request(
        message_type: MessageType,
        xid: u32,
        mac: [u8; 6],
        options: Vec<DhcpOption>,
    ) -> Self {
        let mut chaddr = [0u8; CHADDR_LEN];
        chaddr[..6].copy_from_slice(&mac);
        let mut all_options = vec![DhcpOption::MessageType(message_type)];
        all_options.extend(options);

        Self {
            op: BOOTREQUEST,
            htype: HTYPE_ETHERNET,
            hlen: HLEN_ETHERNET,
            hops: 0,
            xid,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            sname: [0u8; SNAME_LEN],
            file: [0u8; FILE_LEN],
            options: all_options,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: [u8; 6] = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];

    fn raw(options: &[u8]) -> Vec<u8> {
        let mut packet = vec![0u8; OPTIONS_OFFSET];
        packet[0] = BOOTREQUEST;
        packet[1] = HTYPE_ETHERNET;
        packet[2] = HLEN_ETHERNET;
        packet[4..8].copy_from_slice(&0x12345678u32.to_be_bytes());
        packet[10..12].copy_from_slice(&BROADCAST_FLAG.to_be_bytes());
        packet[28..34].copy_from_slice(&MAC);
        packet[BOOTP_HEADER_LEN..OPTIONS_OFFSET].copy_from_slice(&MAGIC_COOKIE);
        packet.extend_from_slice(options);
        packet.push(OptionCode::End as u8);
        packet
    }

    #[test]
    fn test_parse_discover() {
        let options = [53, 1, 1, 50, 4, 10, 0, 0, 7, 12, 4, b'h', b'o', b's', b't'];
        let packet = DhcpPacket::parse(&raw(&options)).unwrap();

        assert_eq!(packet.op, BOOTREQUEST);
        assert_eq!(packet.xid, 0x12345678);
        assert!(packet.is_broadcast());
        assert_eq!(packet.message_type(), Some(MessageType::Discover));
        assert_eq!(packet.requested_ip(), Some(Ipv4Addr::new(10, 0, 0, 7)));
        assert_eq!(packet.hostname(), Some("host"));
        assert_eq!(packet.format_mac(), "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn test_header_fields_roundtrip() {
        let mut request = DhcpPacket::request(MessageType::Request, 0xdeadbeef, MAC, vec![]);
        request.hops = 3;
        request.secs = 999;
        request.ciaddr = Ipv4Addr::new(10, 0, 0, 1);
        request.giaddr = Ipv4Addr::new(10, 0, 1, 1);

        let encoded = request.encode();
        assert_eq!(encoded.len(), MIN_PACKET_LEN);
        assert_eq!(&encoded[12..16], &[10, 0, 0, 1]);
        assert_eq!(&encoded[24..28], &[10, 0, 1, 1]);
        assert_eq!(&encoded[28..34], &MAC);

        let decoded = DhcpPacket::parse(&encoded).unwrap();
        assert_eq!(decoded.xid, 0xdeadbeef);
        assert_eq!(decoded.hops, 3);
        assert_eq!(decoded.secs, 999);
        assert_eq!(decoded.ciaddr, request.ciaddr);
        assert_eq!(decoded.giaddr, request.giaddr);
        assert_eq!(decoded.message_type(), Some(MessageType::Request));
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(DhcpPacket::parse(&[0u8; 239]).is_err());

        let mut bad_cookie = raw(&[]);
        bad_cookie[BOOTP_HEADER_LEN] = 0;
        assert!(DhcpPacket::parse(&bad_cookie).is_err());

        let mut bad_hlen = raw(&[]);
        bad_hlen[2] = 7;
        assert!(DhcpPacket::parse(&bad_hlen).is_err());

        let mut looped = raw(&[]);
        looped[3] = MAX_HOPS + 1;
        assert!(DhcpPacket::parse(&looped).is_err());
        looped[3] = MAX_HOPS;
        assert!(DhcpPacket::parse(&looped).is_ok());

        let mut truncated = raw(&[]);
        truncated.pop();
        truncated.extend_from_slice(&[51, 4, 0, 0]);
        assert!(DhcpPacket::parse(&truncated).is_err());

        let mut no_length = raw(&[]);
        no_length.pop();
        no_length.push(51);
        assert!(DhcpPacket::parse(&no_length).is_err());
    }

    #[test]
    fn test_pad_and_unknown_options() {
        let packet = DhcpPacket::parse(&raw(&[0, 0, 0, 53, 1, 3, 200, 2, 0xbe, 0xef])).unwrap();
        assert_eq!(packet.message_type(), Some(MessageType::Request));
        assert!(packet.options.contains(&DhcpOption::Unknown(200, vec![0xbe, 0xef])));
    }

    #[test]
    fn test_first_duplicate_wins() {
        let packet = DhcpPacket::parse(&raw(&[53, 1, 1, 53, 1, 3])).unwrap();
        assert_eq!(packet.message_type(), Some(MessageType::Discover));
        assert_eq!(packet.options.len(), 2);
    }

    #[test]
    fn test_option_overload() {
        let mut data = raw(&[53, 1, 1, 52, 1, OverloadFlag::Both as u8]);
        let sname = 44;
        let file = sname + SNAME_LEN;
        data[sname..sname + 7].copy_from_slice(&[12, 4, b'n', b'a', b'm', b'e', 255]);
        data[file..file + 9].copy_from_slice(&[15, 6, b'l', b'o', b'c', b'a', b'l', b'!', 255]);

        let packet = DhcpPacket::parse(&data).unwrap();
        assert_eq!(packet.hostname(), Some("name"));
        assert!(packet.options.contains(&DhcpOption::DomainName("local!".to_string())));
    }

    #[test]
    fn test_client_identity() {
        let from_mac = DhcpPacket::request(MessageType::Discover, 1, MAC, vec![]);
        assert_eq!(from_mac.hardware_id(), vec![1, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!(from_mac.client_id(), from_mac.hardware_id());
        assert_eq!(from_mac.client_key(), "01:aa:bb:cc:dd:ee:ff");

        let with_option = DhcpPacket::request(
            MessageType::Discover,
            1,
            MAC,
            vec![DhcpOption::ClientIdentifier(b"\x00host-7".to_vec())],
        );
        assert_eq!(with_option.client_id(), b"\x00host-7".to_vec());
        assert_eq!(with_option.hardware_id(), from_mac.hardware_id());
    }

    #[test]
    fn test_chaddr_bytes_respects_hlen() {
        let mut data = raw(&[]);
        data[1] = 6;
        data[2] = 4;
        let packet = DhcpPacket::parse(&data).unwrap();
        assert_eq!(packet.chaddr_bytes(), &[0xaa, 0xbb, 0xcc, 0xdd]);
        assert_eq!(packet.hardware_id(), vec![6, 0xaa, 0xbb, 0xcc, 0xdd]);
    }

    #[test]
    fn test_create_reply_copies_request_fields() {
        let mut request = DhcpPacket::request(
            MessageType::Discover,
            42,
            MAC,
            vec![DhcpOption::RelayAgentInfo(vec![1, 2, 3])],
        );
        request.flags = BROADCAST_FLAG;
        request.giaddr = Ipv4Addr::new(10, 0, 1, 1);

        let reply = DhcpPacket::create_reply(
            &request,
            MessageType::Offer,
            Ipv4Addr::new(10, 0, 1, 20),
            Ipv4Addr::new(10, 0, 0, 2),
            vec![DhcpOption::LeaseTime(300)],
        );

        assert_eq!(reply.op, BOOTREPLY);
        assert_eq!(reply.xid, 42);
        assert!(reply.is_broadcast());
        assert_eq!(reply.giaddr, request.giaddr);
        assert_eq!(reply.chaddr, request.chaddr);
        assert_eq!(reply.options[0], DhcpOption::MessageType(MessageType::Offer));
        assert_eq!(reply.requested_lease_time(), Some(300));
    }
}
