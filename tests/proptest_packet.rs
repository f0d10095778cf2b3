use std::net::Ipv4Addr;

use proptest::prelude::*;

use nextdhcp::{DhcpOption, DhcpPacket, MessageType};

const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const OPTIONS_OFFSET: usize = 240;
const SNAME_RANGE: std::ops::Range<usize> = 44..108;
const FILE_RANGE: std::ops::Range<usize> = 108..236;

/// A BOOTREQUEST header from an Ethernet client, with no options yet.
fn ethernet_request() -> Vec<u8> {
    let mut packet = vec![0u8; OPTIONS_OFFSET];
    packet[0] = 1;
    packet[1] = 1;
    packet[2] = 6;
    packet[236..240].copy_from_slice(&MAGIC_COOKIE);
    packet
}

fn message_type() -> impl Strategy<Value = MessageType> {
    prop_oneof![
        Just(MessageType::Discover),
        Just(MessageType::Request),
        Just(MessageType::Decline),
        Just(MessageType::Release),
        Just(MessageType::Inform),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 4096,
        max_global_rejects: 65536,
        ..ProptestConfig::default()
    })]

    #[test]
    fn arbitrary_datagrams_never_panic(data: Vec<u8>) {
        let _ = DhcpPacket::parse(&data);
    }

    #[test]
    fn arbitrary_option_areas_never_panic(
        options in prop::collection::vec(any::<u8>(), 0..600)
    ) {
        let mut packet = ethernet_request();
        packet.extend_from_slice(&options);
        let _ = DhcpPacket::parse(&packet);
    }

    #[test]
    fn overloaded_sname_and_file_never_panic(
        flag in any::<u8>(),
        sname in prop::collection::vec(any::<u8>(), 64..=64),
        file in prop::collection::vec(any::<u8>(), 128..=128)
    ) {
        let mut packet = ethernet_request();
        packet[SNAME_RANGE].copy_from_slice(&sname);
        packet[FILE_RANGE].copy_from_slice(&file);
        packet.extend_from_slice(&[52, 1, flag, 255]);
        let _ = DhcpPacket::parse(&packet);
    }

    #[test]
    fn declared_length_past_the_end_is_rejected(
        code in 1u8..255,
        declared in 1u8..=255,
        body in prop::collection::vec(any::<u8>(), 0..255)
    ) {
        prop_assume!(body.len() < declared as usize);

        let mut packet = ethernet_request();
        packet.push(code);
        packet.push(declared);
        packet.extend_from_slice(&body);

        prop_assert!(DhcpPacket::parse(&packet).is_err());
    }

    #[test]
    fn datagrams_shorter_than_the_header_are_rejected(
        data in prop::collection::vec(any::<u8>(), 0..OPTIONS_OFFSET)
    ) {
        prop_assert!(DhcpPacket::parse(&data).is_err());
    }

    #[test]
    fn wrong_magic_cookie_is_rejected(cookie in any::<[u8; 4]>()) {
        prop_assume!(cookie != MAGIC_COOKIE);

        let mut packet = ethernet_request();
        packet[236..240].copy_from_slice(&cookie);
        packet.push(255);

        prop_assert!(DhcpPacket::parse(&packet).is_err());
    }

    #[test]
    fn relay_loops_are_rejected(hops in 17u8..=255) {
        let mut packet = ethernet_request();
        packet[3] = hops;
        packet.push(255);

        prop_assert!(DhcpPacket::parse(&packet).is_err());
    }

    #[test]
    fn max_message_size_below_576_is_rejected(size in 0u16..576) {
        let mut packet = ethernet_request();
        packet.extend_from_slice(&[57, 2]);
        packet.extend_from_slice(&size.to_be_bytes());
        packet.push(255);

        prop_assert!(DhcpPacket::parse(&packet).is_err());
    }

    #[test]
    fn hardware_identity_is_htype_then_mac(
        mac in any::<[u8; 6]>(),
        kind in message_type(),
        xid in any::<u32>()
    ) {
        let packet = DhcpPacket::request(kind, xid, mac, vec![]);
        let parsed = DhcpPacket::parse(&packet.encode()).unwrap();

        let mut expected = vec![1u8];
        expected.extend_from_slice(&mac);
        prop_assert_eq!(parsed.client_id(), expected);
        prop_assert_eq!(parsed.message_type(), Some(kind));
        prop_assert_eq!(parsed.xid, xid);
    }

    #[test]
    fn client_identifier_option_overrides_hardware(
        mac in any::<[u8; 6]>(),
        identifier in prop::collection::vec(any::<u8>(), 2..32)
    ) {
        let packet = DhcpPacket::request(
            MessageType::Discover,
            1,
            mac,
            vec![DhcpOption::ClientIdentifier(identifier.clone())],
        );
        let parsed = DhcpPacket::parse(&packet.encode()).unwrap();

        prop_assert_eq!(parsed.client_id(), identifier);
        prop_assert_eq!(parsed.hardware_id()[1..].to_vec(), mac.to_vec());
    }

    #[test]
    fn replies_lead_with_message_type_and_meet_minimum_size(
        mac in any::<[u8; 6]>(),
        yiaddr in any::<[u8; 4]>(),
        giaddr in any::<[u8; 4]>(),
        flags in any::<u16>()
    ) {
        let mut request = DhcpPacket::request(MessageType::Discover, 9, mac, vec![]);
        request.giaddr = Ipv4Addr::from(giaddr);
        request.flags = flags;

        let reply = DhcpPacket::create_reply(
            &request,
            MessageType::Offer,
            Ipv4Addr::from(yiaddr),
            Ipv4Addr::new(10, 0, 0, 1),
            vec![DhcpOption::LeaseTime(3600)],
        );
        let encoded = reply.encode();

        prop_assert!(encoded.len() >= 300);
        prop_assert_eq!(&encoded[OPTIONS_OFFSET..OPTIONS_OFFSET + 3], &[53, 1, 2]);

        let parsed = DhcpPacket::parse(&encoded).unwrap();
        prop_assert_eq!(parsed.op, 2);
        prop_assert_eq!(parsed.giaddr, request.giaddr);
        prop_assert_eq!(parsed.flags, flags);
        prop_assert_eq!(parsed.chaddr, request.chaddr);
    }
}
