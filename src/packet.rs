//! Zero-copy packet view (spec.md §4.2, C2): parses Ethernet/IPv4/IPv6
//! headers into a flow key plus protocol hints, and classifies whether a
//! frame is IPv6 Neighbor Discovery traffic destined for a given interface.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::Bytes;
use pnet_packet::ethernet::{EtherTypes, EthernetPacket};
use pnet_packet::icmpv6::{Icmpv6Packet, Icmpv6Types};
use pnet_packet::ip::IpNextHeaderProtocols;
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::ipv6::Ipv6Packet;
use pnet_packet::Packet;
use thiserror::Error;

use crate::flow_key::FlowKey;
use crate::nic::Interface;

#[derive(Error, Debug)]
pub enum PacketParseError {
    #[error("packet too short or malformed to parse")]
    BadPacket,
    #[error("ethertype is not IPv4 or IPv6")]
    NotIp,
    #[error("IPv6 extension headers are not followed, only the fixed header")]
    UnsupportedExtensionHeader,
}

/// The result of `extract`: a flow key, the IP next-header/protocol value,
/// the L3 payload length, and the untouched original frame. `mbuf` is the
/// "mbuf_ref" of spec.md -- it is never mutated by this module; only
/// `encap::encapsulate` writes to it, and only the prepended outer header.
#[derive(Debug, Clone)]
pub struct PacketView {
    pub flow_key: FlowKey,
    pub next_hdr: u8,
    pub l3_len: u16,
    pub mbuf: Bytes,
}

/// Parses an Ethernet frame, rejecting anything that is not IPv4 or IPv6.
/// IPv6 extension headers are rejected rather than walked, matching
/// spec.md's "follows only the fixed header."
pub fn extract(packet: Bytes, logger: &slog::Logger) -> Result<PacketView, PacketParseError> {
    let ethernet = EthernetPacket::new(&packet).ok_or(PacketParseError::BadPacket)?;

    match ethernet.get_ethertype() {
        EtherTypes::Ipv4 => extract_ipv4(&packet, ethernet.payload().len()),
        EtherTypes::Ipv6 => extract_ipv6(&packet, ethernet.payload().len()),
        other => {
            slog::debug!(logger, "dropping non-IP frame"; "ethertype" => ?other);
            Err(PacketParseError::NotIp)
        }
    }
}

fn extract_ipv4(frame: &Bytes, payload_len: usize) -> Result<PacketView, PacketParseError> {
    let eth_len = frame.len() - payload_len;
    let header = Ipv4Packet::new(&frame[eth_len..]).ok_or(PacketParseError::BadPacket)?;
    let ihl_bytes = (header.get_header_length() as u16) * 4;
    let l3_len = header
        .get_total_length()
        .checked_sub(ihl_bytes)
        .ok_or(PacketParseError::BadPacket)?;

    Ok(PacketView {
        flow_key: FlowKey::with_protocol(
            IpAddr::V4(header.get_source()),
            IpAddr::V4(header.get_destination()),
            header.get_next_level_protocol().0,
        ),
        next_hdr: header.get_next_level_protocol().0,
        l3_len,
        mbuf: frame.clone(),
    })
}

fn extract_ipv6(frame: &Bytes, payload_len: usize) -> Result<PacketView, PacketParseError> {
    let eth_len = frame.len() - payload_len;
    let header = Ipv6Packet::new(&frame[eth_len..]).ok_or(PacketParseError::BadPacket)?;

    if !is_upper_layer_protocol(header.get_next_header()) {
        return Err(PacketParseError::UnsupportedExtensionHeader);
    }

    Ok(PacketView {
        flow_key: FlowKey::with_protocol(
            IpAddr::V6(header.get_source()),
            IpAddr::V6(header.get_destination()),
            header.get_next_header().0,
        ),
        next_hdr: header.get_next_header().0,
        l3_len: header.get_payload_length(),
        mbuf: frame.clone(),
    })
}

/// Whether `proto` is a protocol this crate treats as "no extension headers
/// to walk" -- TCP, UDP, and ICMPv6 are the only next-headers the data
/// plane needs to recognize (TCP/UDP for the flow key, ICMPv6 for ND).
fn is_upper_layer_protocol(proto: pnet_packet::ip::IpNextHeaderProtocol) -> bool {
    matches!(
        proto,
        IpNextHeaderProtocols::Tcp | IpNextHeaderProtocols::Udp | IpNextHeaderProtocols::Icmpv6
    )
}

/// True when `view` is IPv6 Neighbor Discovery (Solicitation or
/// Advertisement) addressed to one of `iface`'s configured unicast or
/// solicited-node multicast addresses (spec.md §4.2).
pub fn is_nd(view: &PacketView, iface: &Interface) -> bool {
    if view.next_hdr != IpNextHeaderProtocols::Icmpv6.0 {
        return false;
    }
    let dst = match view.flow_key.dst {
        IpAddr::V6(v6) => v6,
        IpAddr::V4(_) => return false,
    };

    let ethernet = match EthernetPacket::new(&view.mbuf) {
        Some(e) => e,
        None => return false,
    };
    let ipv6 = match Ipv6Packet::new(ethernet.payload()) {
        Some(p) => p,
        None => return false,
    };
    let icmpv6 = match Icmpv6Packet::new(ipv6.payload()) {
        Some(p) => p,
        None => return false,
    };

    let is_nd_type = matches!(
        icmpv6.get_icmpv6_type(),
        Icmpv6Types::NeighborSolicit | Icmpv6Types::NeighborAdvert
    );
    if !is_nd_type {
        return false;
    }

    iface.owns_ipv6_destination(&dst)
}

/// The IPv4 solicited-node-multicast analogue doesn't exist; ARP is
/// dispatched purely by EtherType (spec.md §4.4 step 1), so there is no
/// `is_arp` predicate to mirror `is_nd` with.
pub fn is_ipv4_broadcast_or_unicast(dst: &Ipv4Addr, iface: &Interface) -> bool {
    iface.owns_ipv4_destination(dst) || dst.is_broadcast()
}
