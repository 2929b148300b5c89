//! Packet classification and set-field rewriting using smoltcp.
//!
//! Inbound frames are reduced to an [`InboundPacket`]: the Ethernet
//! addresses plus a [`PacketKind`] the rewrite engine matches on. Anything
//! that is not a well-formed ARP-over-Ethernet/IPv4 or IPv4 packet is
//! [`PacketKind::Other`] and passes through untouched.

use crate::flow::Action;
use smoltcp::wire::{
    ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol, Ipv4Address, Ipv4Packet,
};
use std::net::Ipv4Addr;

/// Ethernet header size
pub const ETHERNET_HDR_SIZE: usize = 14;

/// Network-layer view of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// ARP request or reply (sender/target protocol addresses).
    Arp { src: Ipv4Addr, dst: Ipv4Addr },
    /// IPv4 datagram.
    Ipv4 {
        src: Ipv4Addr,
        dst: Ipv4Addr,
        protocol: u8,
    },
    /// Any other or malformed payload.
    Other,
}

/// A parsed inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundPacket {
    pub eth_src: EthernetAddress,
    pub eth_dst: EthernetAddress,
    pub ethertype: u16,
    pub kind: PacketKind,
}

/// Classify a raw Ethernet frame.
///
/// Returns `None` only when the Ethernet header itself is unusable; a bad
/// L3 payload degrades to [`PacketKind::Other`].
pub fn classify(frame: &[u8]) -> Option<InboundPacket> {
    let eth = EthernetFrame::new_checked(frame).ok()?;
    let kind = match eth.ethertype() {
        EthernetProtocol::Arp => parse_arp(eth.payload()),
        EthernetProtocol::Ipv4 => parse_ipv4(eth.payload()),
        _ => None,
    }
    .unwrap_or(PacketKind::Other);

    Some(InboundPacket {
        eth_src: eth.src_addr(),
        eth_dst: eth.dst_addr(),
        ethertype: u16::from(eth.ethertype()),
        kind,
    })
}

fn parse_arp(payload: &[u8]) -> Option<PacketKind> {
    let packet = ArpPacket::new_checked(payload).ok()?;
    match ArpRepr::parse(&packet).ok()? {
        ArpRepr::EthernetIpv4 {
            source_protocol_addr,
            target_protocol_addr,
            ..
        } => Some(PacketKind::Arp {
            src: Ipv4Addr::from(source_protocol_addr.octets()),
            dst: Ipv4Addr::from(target_protocol_addr.octets()),
        }),
        _ => None,
    }
}

fn parse_ipv4(payload: &[u8]) -> Option<PacketKind> {
    let packet = Ipv4Packet::new_checked(payload).ok()?;
    Some(PacketKind::Ipv4 {
        src: Ipv4Addr::from(packet.src_addr().octets()),
        dst: Ipv4Addr::from(packet.dst_addr().octets()),
        protocol: u8::from(packet.next_header()),
    })
}

/// Apply set-field actions to a copy of `frame`, the way a datapath would
/// before emitting it. Output actions are ignored. The IPv4 header checksum
/// is recomputed after address rewrites.
pub fn apply_actions(frame: &[u8], actions: &[Action]) -> Vec<u8> {
    let mut buf = frame.to_vec();

    let mut arp_spa = None;
    let mut arp_tpa = None;
    let mut ipv4_src = None;
    let mut ipv4_dst = None;
    for action in actions {
        match *action {
            Action::SetArpSpa(addr) => arp_spa = Some(addr),
            Action::SetArpTpa(addr) => arp_tpa = Some(addr),
            Action::SetIpv4Src(addr) => ipv4_src = Some(addr),
            Action::SetIpv4Dst(addr) => ipv4_dst = Some(addr),
            Action::Output(_) => {}
        }
    }

    let Ok(mut eth) = EthernetFrame::new_checked(&mut buf[..]) else {
        return buf;
    };
    match eth.ethertype() {
        EthernetProtocol::Arp if arp_spa.is_some() || arp_tpa.is_some() => {
            rewrite_arp(eth.payload_mut(), arp_spa, arp_tpa);
        }
        EthernetProtocol::Ipv4 if ipv4_src.is_some() || ipv4_dst.is_some() => {
            rewrite_ipv4(eth.payload_mut(), ipv4_src, ipv4_dst);
        }
        _ => {}
    }
    buf
}

fn rewrite_arp(payload: &mut [u8], spa: Option<Ipv4Addr>, tpa: Option<Ipv4Addr>) -> Option<()> {
    let mut packet = ArpPacket::new_checked(payload).ok()?;
    let ArpRepr::EthernetIpv4 {
        operation,
        source_hardware_addr,
        source_protocol_addr,
        target_hardware_addr,
        target_protocol_addr,
    } = ArpRepr::parse(&packet).ok()?
    else {
        return None;
    };

    ArpRepr::EthernetIpv4 {
        operation,
        source_hardware_addr,
        source_protocol_addr: spa.map_or(source_protocol_addr, wire_addr),
        target_hardware_addr,
        target_protocol_addr: tpa.map_or(target_protocol_addr, wire_addr),
    }
    .emit(&mut packet);
    Some(())
}

fn rewrite_ipv4(payload: &mut [u8], src: Option<Ipv4Addr>, dst: Option<Ipv4Addr>) -> Option<()> {
    let mut packet = Ipv4Packet::new_checked(payload).ok()?;
    if let Some(src) = src {
        packet.set_src_addr(wire_addr(src));
    }
    if let Some(dst) = dst {
        packet.set_dst_addr(wire_addr(dst));
    }
    packet.fill_checksum();
    Some(())
}

fn wire_addr(addr: Ipv4Addr) -> Ipv4Address {
    Ipv4Address::from(addr.octets())
}
