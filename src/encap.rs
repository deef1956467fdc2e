//! Outer-header encapsulation (spec.md §4.8, C8). Writes a new IP-in-IP
//! outer header in front of the original frame, carrying the DSCP the GK
//! state machine decided on; the inner packet is never touched.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, Bytes, BytesMut};
use pnet_packet::ethernet::{EtherTypes, MutableEthernetPacket};
use pnet_packet::ip::IpNextHeaderProtocols;
use pnet_packet::ipv4::{self, Ipv4Packet, MutableIpv4Packet};
use pnet_packet::ipv6::{Ipv6Packet, MutableIpv6Packet};
use pnet_packet::util::MacAddr;
use pnet_packet::Packet;
use thiserror::Error;

use crate::nic::{TunnelDescriptor, TunnelFamily};

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const DEFAULT_TTL: u8 = 64;

#[derive(Error, Debug)]
pub enum EncapError {
    #[error("inner packet too short to encapsulate")]
    TooShort,
    #[error("inner IP version does not match the tunnel's outer family")]
    FamilyMismatch,
}

/// Prepends an outer IP header carrying `dscp` and addressed to
/// `tunnel.outer_dst` from `back_src`, in front of `inner`. `inner` starts
/// at the first byte of the IP header (no Ethernet header): this module
/// operates purely on L3 and up, leaving L2 framing to the NIC port.
pub fn encapsulate(
    inner: &Bytes,
    dscp: u8,
    back_src: IpAddr,
    tunnel: &TunnelDescriptor,
) -> Result<Bytes, EncapError> {
    match tunnel.family {
        TunnelFamily::V4 => encapsulate_v4(inner, dscp, back_src, tunnel),
        TunnelFamily::V6 => encapsulate_v6(inner, dscp, back_src, tunnel),
    }
}

fn encapsulate_v4(
    inner: &Bytes,
    dscp: u8,
    back_src: IpAddr,
    tunnel: &TunnelDescriptor,
) -> Result<Bytes, EncapError> {
    let src = match back_src {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(_) => return Err(EncapError::FamilyMismatch),
    };
    let dst = match tunnel.outer_dst {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(_) => return Err(EncapError::FamilyMismatch),
    };
    if inner.len() < IPV4_HEADER_LEN {
        return Err(EncapError::TooShort);
    }

    let total_len = IPV4_HEADER_LEN + inner.len();
    let mut buf = BytesMut::with_capacity(total_len);
    buf.put_bytes(0, IPV4_HEADER_LEN);
    buf.put_slice(inner);

    let inner_protocol = Ipv4Packet::new(inner)
        .map(|p| p.get_next_level_protocol())
        .unwrap_or(IpNextHeaderProtocols::Ipv4);

    {
        let mut outer = MutableIpv4Packet::new(&mut buf[..IPV4_HEADER_LEN]).unwrap();
        outer.set_version(4);
        outer.set_header_length((IPV4_HEADER_LEN / 4) as u8);
        outer.set_dscp(dscp);
        outer.set_ecn(0);
        outer.set_total_length(total_len as u16);
        outer.set_identification(0);
        outer.set_flags(ipv4::Ipv4Flags::DontFragment);
        outer.set_fragment_offset(0);
        outer.set_ttl(DEFAULT_TTL);
        outer.set_next_level_protocol(inner_protocol);
        outer.set_source(src);
        outer.set_destination(dst);
        let checksum = ipv4::checksum(&outer.to_immutable());
        outer.set_checksum(checksum);
    }

    Ok(buf.freeze())
}

fn encapsulate_v6(
    inner: &Bytes,
    dscp: u8,
    back_src: IpAddr,
    tunnel: &TunnelDescriptor,
) -> Result<Bytes, EncapError> {
    let src = match back_src {
        IpAddr::V6(v6) => v6,
        IpAddr::V4(_) => return Err(EncapError::FamilyMismatch),
    };
    let dst = match tunnel.outer_dst {
        IpAddr::V6(v6) => v6,
        IpAddr::V4(_) => return Err(EncapError::FamilyMismatch),
    };
    if inner.len() < IPV6_HEADER_LEN {
        return Err(EncapError::TooShort);
    }

    let total_len = IPV6_HEADER_LEN + inner.len();
    let mut buf = BytesMut::with_capacity(total_len);
    buf.put_bytes(0, IPV6_HEADER_LEN);
    buf.put_slice(inner);

    let inner_protocol = Ipv6Packet::new(inner)
        .map(|p| p.get_next_header())
        .unwrap_or(IpNextHeaderProtocols::Ipv6);

    {
        let mut outer = MutableIpv6Packet::new(&mut buf[..IPV6_HEADER_LEN]).unwrap();
        outer.set_version(6);
        outer.set_traffic_class(dscp << 2);
        outer.set_flow_label(0);
        outer.set_payload_length(inner.len() as u16);
        outer.set_next_header(inner_protocol);
        outer.set_hop_limit(DEFAULT_TTL);
        outer.set_source(src);
        outer.set_destination(dst);
    }

    Ok(buf.freeze())
}

/// The network-order source the back interface presents for encapsulation,
/// chosen to match the outer family of `tunnel`. Mixed-family tunneling
/// (an IPv4 inner flow routed over an IPv6 tunnel or vice versa) selects
/// whichever of `ipv4`/`ipv6` matches the tunnel's family.
pub fn back_interface_source(
    tunnel: &TunnelDescriptor,
    ipv4: Option<Ipv4Addr>,
    ipv6: Option<Ipv6Addr>,
) -> Option<IpAddr> {
    match tunnel.family {
        TunnelFamily::V4 => ipv4.map(IpAddr::V4),
        TunnelFamily::V6 => ipv6.map(IpAddr::V6),
    }
}

/// Prepends an Ethernet header in front of an already-encapsulated L3
/// frame, completing the framing GK owes the NIC port once the next hop's
/// link-layer address is known (spec.md §4.5's "tightly coupled" pairing
/// with LLS).
pub fn wrap_ethernet(l3: &Bytes, src_mac: MacAddr, dst_mac: MacAddr, family: TunnelFamily) -> Bytes {
    let mut buf = BytesMut::with_capacity(14 + l3.len());
    buf.put_bytes(0, 14);
    buf.put_slice(l3);
    {
        let mut eth = MutableEthernetPacket::new(&mut buf[..14]).expect("fixed-size eth header");
        eth.set_source(src_mac);
        eth.set_destination(dst_mac);
        eth.set_ethertype(match family {
            TunnelFamily::V4 => EtherTypes::Ipv4,
            TunnelFamily::V6 => EtherTypes::Ipv6,
        });
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inner_v4() -> Bytes {
        let mut buf = BytesMut::with_capacity(IPV4_HEADER_LEN);
        buf.put_bytes(0, IPV4_HEADER_LEN);
        {
            let mut pkt = MutableIpv4Packet::new(&mut buf).unwrap();
            pkt.set_version(4);
            pkt.set_header_length(5);
            pkt.set_total_length(IPV4_HEADER_LEN as u16);
            pkt.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
            pkt.set_source(Ipv4Addr::new(10, 0, 0, 1));
            pkt.set_destination(Ipv4Addr::new(10, 0, 0, 2));
        }
        buf.freeze()
    }

    #[test]
    fn v4_in_v4_sets_dscp_and_preserves_inner() {
        let inner = inner_v4();
        let tunnel = TunnelDescriptor {
            family: TunnelFamily::V4,
            outer_dst: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
        };
        let outer_src = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 9));
        let out = encapsulate(&inner, 13, outer_src, &tunnel).unwrap();

        let outer = Ipv4Packet::new(&out).unwrap();
        assert_eq!(outer.get_dscp(), 13);
        assert_eq!(outer.get_destination(), Ipv4Addr::new(192, 0, 2, 1));
        assert_eq!(outer.get_source(), Ipv4Addr::new(192, 0, 2, 9));
        assert_eq!(outer.payload(), &inner[..]);
    }

    #[test]
    fn rejects_family_mismatched_source() {
        let inner = inner_v4();
        let tunnel = TunnelDescriptor {
            family: TunnelFamily::V4,
            outer_dst: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
        };
        let bad_src = IpAddr::V6(Ipv6Addr::LOCALHOST);
        let result = encapsulate(&inner, 1, bad_src, &tunnel);
        assert!(matches!(result, Err(EncapError::FamilyMismatch)));
    }

    #[test]
    fn too_short_inner_is_rejected() {
        let tiny = Bytes::from_static(b"abc");
        let tunnel = TunnelDescriptor {
            family: TunnelFamily::V4,
            outer_dst: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
        };
        let result = encapsulate(&tiny, 1, IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), &tunnel);
        assert!(matches!(result, Err(EncapError::TooShort)));
    }

    #[test]
    fn wrap_ethernet_prepends_header_and_preserves_l3() {
        let l3 = inner_v4();
        let src = MacAddr::new(2, 0, 0, 0, 0, 1);
        let dst = MacAddr::new(2, 0, 0, 0, 0, 2);
        let framed = wrap_ethernet(&l3, src, dst, TunnelFamily::V4);

        let eth = pnet_packet::ethernet::EthernetPacket::new(&framed).unwrap();
        assert_eq!(eth.get_source(), src);
        assert_eq!(eth.get_destination(), dst);
        assert_eq!(eth.get_ethertype(), EtherTypes::Ipv4);
        assert_eq!(eth.payload(), &l3[..]);
    }
}
