//! Frame builders and parsers for tests
//!
//! Uses smoltcp for packet construction, matching the classifier's parsing.

use crate::packet::ETHERNET_HDR_SIZE;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, IpProtocol, Ipv4Address, Ipv4Packet, Ipv4Repr,
};
use std::net::Ipv4Addr;

/// IP header size (without options)
pub const IP_HDR_SIZE: usize = 20;

/// ARP packet size (Ethernet + IPv4)
pub const ARP_PKT_SIZE: usize = 28;

/// Broadcast MAC address
pub const BROADCAST_MAC: [u8; 6] = [0xff, 0xff, 0xff, 0xff, 0xff, 0xff];

/// Create a broadcast ARP request.
pub fn create_arp_request(sender_mac: [u8; 6], sender_ip: [u8; 4], target_ip: [u8; 4]) -> Vec<u8> {
    let mut packet = vec![0u8; ETHERNET_HDR_SIZE + ARP_PKT_SIZE];

    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress(sender_mac),
        dst_addr: EthernetAddress(BROADCAST_MAC),
        ethertype: EthernetProtocol::Arp,
    };
    let mut eth_frame = EthernetFrame::new_unchecked(&mut packet[..]);
    eth_repr.emit(&mut eth_frame);

    let arp_repr = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Request,
        source_hardware_addr: EthernetAddress(sender_mac),
        source_protocol_addr: Ipv4Address::from(sender_ip),
        target_hardware_addr: EthernetAddress([0; 6]),
        target_protocol_addr: Ipv4Address::from(target_ip),
    };
    let mut arp_packet = ArpPacket::new_unchecked(eth_frame.payload_mut());
    arp_repr.emit(&mut arp_packet);

    packet
}

/// Create an IPv4/UDP frame with an 8 byte zeroed UDP header as payload.
pub fn create_ipv4_packet(
    src_mac: [u8; 6],
    dst_mac: [u8; 6],
    src_ip: [u8; 4],
    dst_ip: [u8; 4],
) -> Vec<u8> {
    let payload_len = 8;
    let mut packet = vec![0u8; ETHERNET_HDR_SIZE + IP_HDR_SIZE + payload_len];

    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress(src_mac),
        dst_addr: EthernetAddress(dst_mac),
        ethertype: EthernetProtocol::Ipv4,
    };
    let mut eth_frame = EthernetFrame::new_unchecked(&mut packet[..]);
    eth_repr.emit(&mut eth_frame);

    let ip_repr = Ipv4Repr {
        src_addr: Ipv4Address::from(src_ip),
        dst_addr: Ipv4Address::from(dst_ip),
        next_header: IpProtocol::Udp,
        payload_len,
        hop_limit: 64,
    };
    let mut ip_packet = Ipv4Packet::new_unchecked(eth_frame.payload_mut());
    ip_repr.emit(&mut ip_packet, &ChecksumCapabilities::default());

    packet
}

/// Sender and target protocol addresses of an ARP frame.
pub fn parse_arp_addrs(frame: &[u8]) -> Option<(Ipv4Addr, Ipv4Addr)> {
    let eth = EthernetFrame::new_checked(frame).ok()?;
    if eth.ethertype() != EthernetProtocol::Arp {
        return None;
    }
    let arp = ArpPacket::new_checked(eth.payload()).ok()?;
    match ArpRepr::parse(&arp).ok()? {
        ArpRepr::EthernetIpv4 {
            source_protocol_addr,
            target_protocol_addr,
            ..
        } => Some((
            Ipv4Addr::from(source_protocol_addr.octets()),
            Ipv4Addr::from(target_protocol_addr.octets()),
        )),
        _ => None,
    }
}

/// Source and destination addresses of an IPv4 frame.
pub fn parse_ipv4_addrs(frame: &[u8]) -> Option<(Ipv4Addr, Ipv4Addr)> {
    let eth = EthernetFrame::new_checked(frame).ok()?;
    if eth.ethertype() != EthernetProtocol::Ipv4 {
        return None;
    }
    let ip = Ipv4Packet::new_checked(eth.payload()).ok()?;
    Some((Ipv4Addr::from(ip.src_addr().octets()), Ipv4Addr::from(ip.dst_addr().octets())))
}
