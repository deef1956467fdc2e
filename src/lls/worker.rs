//! The LLS worker loop (spec.md §4.4, C4): single-threaded, run-to-completion,
//! polling both interfaces for ARP/ND traffic, draining its mailbox, and
//! driving the periodic cache scan.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, BytesMut};
use pnet_packet::arp::{ArpHardwareTypes, ArpOperations, ArpPacket, MutableArpPacket};
use pnet_packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet_packet::icmpv6::ndp::{
    MutableNeighborAdvertPacket, MutableNeighborSolicitPacket, NdpOptionTypes,
    NeighborAdvertFlags, NeighborSolicitPacket,
};
use pnet_packet::icmpv6::{checksum as icmpv6_checksum, Icmpv6Packet, Icmpv6Types};
use pnet_packet::ip::IpNextHeaderProtocols;
use pnet_packet::ipv6::{Ipv6Packet, MutableIpv6Packet};
use pnet_packet::util::MacAddr;
use pnet_packet::Packet;

use crate::clock::cycles_per_second;
use crate::lls::cache::{HoldResult, LlsCache, Nd as NdFamily, Source};
use crate::mailbox::MailboxReceiver;
use crate::nic::{ipv6_multicast_mac, solicited_node_multicast, Interface, NicPort, RawFrame};

use super::cache::Arp as ArpFamily;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfaceTag {
    Front,
    Back,
}

pub enum LlsCommand {
    Hold {
        ip: IpAddr,
        worker_id: u32,
        callback: Box<dyn FnMut(HoldResult) + Send>,
    },
    Put {
        ip: IpAddr,
        worker_id: u32,
    },
    Nd {
        mbuf: RawFrame,
        iface: IfaceTag,
    },
}

type ArpCache = LlsCache<ArpFamily<Box<dyn Fn(IpAddr) -> Option<RawFrame> + Send>>>;
type NdCache = LlsCache<NdFamily<Box<dyn Fn(IpAddr) -> Option<RawFrame> + Send>>>;

pub struct LlsWorker {
    arp_cache: ArpCache,
    nd_cache: NdCache,
    mailbox: MailboxReceiver<LlsCommand>,
    front: Interface,
    back: Option<Interface>,
    last_scan_at: u64,
    logger: slog::Logger,
}

const MAX_MAILBOX_DRAIN: usize = 32;
const MAX_RX_BURST: usize = 32;

impl LlsWorker {
    pub fn new(
        front: Interface,
        back: Option<Interface>,
        mailbox: MailboxReceiver<LlsCommand>,
        arp_timeout_seconds: u64,
        nd_timeout_seconds: u64,
        logger: slog::Logger,
    ) -> Self {
        // Solicitations are always emitted on the front interface (spec.md
        // §4.4's `xmit_req` runs from the worker that owns the cache scan,
        // and this worker only transmits discovery traffic out front; see
        // DESIGN.md on the single shared cache per family).
        let front_for_arp = front.clone();
        let arp_cache = LlsCache::new(ArpFamily {
            timeout_seconds: arp_timeout_seconds,
            solicit: Box::new(move |ip| build_arp_request(ip, &front_for_arp))
                as Box<dyn Fn(IpAddr) -> Option<RawFrame> + Send>,
        });
        let front_for_nd = front.clone();
        let nd_cache = LlsCache::new(NdFamily {
            timeout_seconds: nd_timeout_seconds,
            solicit: Box::new(move |ip| build_neighbor_solicitation(ip, &front_for_nd))
                as Box<dyn Fn(IpAddr) -> Option<RawFrame> + Send>,
        });
        LlsWorker {
            arp_cache,
            nd_cache,
            mailbox,
            front,
            back,
            last_scan_at: 0,
            logger,
        }
    }

    /// One iteration of the loop described in spec.md §4.4. Returns the
    /// frames the caller should transmit on the front and back interfaces
    /// respectively.
    pub fn run_once<P: NicPort>(
        &mut self,
        now: u64,
        front_port: &mut P,
        back_port: Option<&mut P>,
    ) -> (Vec<RawFrame>, Vec<RawFrame>) {
        let mut front_tx = Vec::new();
        let mut back_tx = Vec::new();

        for frame in front_port.rx_burst(MAX_RX_BURST) {
            if let Some(reply) = self.process_frame(&frame, IfaceTag::Front, now) {
                front_tx.push(reply);
            }
        }

        if let Some(back_port) = back_port {
            for frame in back_port.rx_burst(MAX_RX_BURST) {
                if let Some(reply) = self.process_frame(&frame, IfaceTag::Back, now) {
                    back_tx.push(reply);
                }
            }
        }

        let commands = self.mailbox.dequeue_burst(MAX_MAILBOX_DRAIN);
        let drained_any = !commands.is_empty();
        for cmd in commands {
            self.apply_command(cmd, now);
        }

        if !drained_any && now.saturating_sub(self.last_scan_at) >= cycles_per_second(super::cache::SCAN_INTERVAL_SECONDS) {
            self.last_scan_at = now;
            front_tx.extend(self.arp_cache.scan(now));
            front_tx.extend(self.nd_cache.scan(now));
        }

        (front_tx, back_tx)
    }

    fn apply_command(&mut self, cmd: LlsCommand, now: u64) {
        match cmd {
            LlsCommand::Hold { ip, worker_id, callback } => {
                match ip {
                    IpAddr::V4(_) => {
                        self.arp_cache.hold(ip, now, worker_id, callback);
                    }
                    IpAddr::V6(_) => {
                        self.nd_cache.hold(ip, now, worker_id, callback);
                    }
                }
            }
            LlsCommand::Put { ip, worker_id } => match ip {
                IpAddr::V4(_) => self.arp_cache.put(ip, worker_id),
                IpAddr::V6(_) => self.nd_cache.put(ip, worker_id),
            },
            LlsCommand::Nd { mbuf, iface } => {
                self.process_frame(&mbuf, iface, now);
            }
        }
    }

    fn interface_for(&self, tag: IfaceTag) -> Option<&Interface> {
        match tag {
            IfaceTag::Front => Some(&self.front),
            IfaceTag::Back => self.back.as_ref(),
        }
    }

    fn process_frame(&mut self, frame: &RawFrame, tag: IfaceTag, now: u64) -> Option<RawFrame> {
        let iface = self.interface_for(tag)?.clone();
        let ethernet = EthernetPacket::new(frame)?;
        if !iface.accepts_destination_mac(&ethernet.get_destination()) {
            return None;
        }

        match ethernet.get_ethertype() {
            EtherTypes::Arp => self.process_arp(&ethernet, &iface, now),
            EtherTypes::Ipv6 => self.process_nd(&ethernet, &iface, now),
            other => {
                slog::debug!(self.logger, "lls dropping unhandled ethertype"; "ethertype" => ?other);
                None
            }
        }
    }

    fn process_arp(
        &mut self,
        ethernet: &EthernetPacket,
        iface: &Interface,
        now: u64,
    ) -> Option<RawFrame> {
        let arp = ArpPacket::new(ethernet.payload())?;
        let sender_ip = IpAddr::V4(arp.get_sender_proto_addr());
        let sender_mac = arp.get_sender_hw_addr();

        match arp.get_operation() {
            ArpOperations::Request => {
                self.arp_cache.observe(sender_ip, sender_mac, Source::Unsolicited, now);
                if iface.owns_ipv4_destination(&arp.get_target_proto_addr()) {
                    build_arp_reply(iface, &arp)
                } else {
                    None
                }
            }
            ArpOperations::Reply => {
                self.arp_cache.observe(sender_ip, sender_mac, Source::Solicited, now);
                None
            }
            _ => None,
        }
    }

    fn process_nd(
        &mut self,
        ethernet: &EthernetPacket,
        iface: &Interface,
        now: u64,
    ) -> Option<RawFrame> {
        let ipv6 = Ipv6Packet::new(ethernet.payload())?;
        let icmpv6 = Icmpv6Packet::new(ipv6.payload())?;

        if !iface.owns_ipv6_destination(&ipv6.get_destination()) {
            return None;
        }

        match icmpv6.get_icmpv6_type() {
            Icmpv6Types::NeighborSolicit => {
                let ns = NeighborSolicitPacket::new(ipv6.payload())?;
                self.nd_cache
                    .observe(IpAddr::V6(ipv6.get_source()), ethernet.get_source(), Source::Unsolicited, now);
                if iface.owns_ipv6_destination(&ns.get_target_addr()) {
                    build_neighbor_advertisement(iface, &ipv6, &ns, ethernet.get_source())
                } else {
                    None
                }
            }
            Icmpv6Types::NeighborAdvert => {
                self.nd_cache
                    .observe(ipv6_source_for_advert(&ipv6), ethernet.get_source(), Source::Solicited, now);
                None
            }
            _ => None,
        }
    }
}

fn ipv6_source_for_advert(ipv6: &Ipv6Packet) -> IpAddr {
    IpAddr::V6(ipv6.get_source())
}

/// Builds an ARP request frame for `ip`, broadcast from `iface`. Used as
/// the cache's solicitation callback (spec.md §4.3 `xmit_req`).
fn build_arp_request(ip: IpAddr, iface: &Interface) -> Option<RawFrame> {
    let target = match ip {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(_) => return None,
    };
    let mut buf = BytesMut::with_capacity(14 + 28);
    buf.put_bytes(0, 14 + 28);
    {
        let mut eth = MutableEthernetPacket::new(&mut buf[..14])?;
        eth.set_source(iface.mac);
        eth.set_destination(MacAddr::broadcast());
        eth.set_ethertype(EtherTypes::Arp);
    }
    {
        let mut arp = MutableArpPacket::new(&mut buf[14..])?;
        arp.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(ArpOperations::Request);
        arp.set_sender_hw_addr(iface.mac);
        arp.set_sender_proto_addr(iface.ipv4.first().copied().unwrap_or(Ipv4Addr::UNSPECIFIED));
        arp.set_target_hw_addr(MacAddr::new(0, 0, 0, 0, 0, 0));
        arp.set_target_proto_addr(target);
    }
    Some(buf.freeze())
}

fn build_arp_reply(iface: &Interface, request: &ArpPacket) -> Option<RawFrame> {
    let target = request.get_sender_proto_addr();
    let mut buf = BytesMut::with_capacity(14 + 28);
    buf.put_bytes(0, 14 + 28);
    {
        let mut eth = MutableEthernetPacket::new(&mut buf[..14])?;
        eth.set_source(iface.mac);
        eth.set_destination(request.get_sender_hw_addr());
        eth.set_ethertype(EtherTypes::Arp);
    }
    {
        let mut arp = MutableArpPacket::new(&mut buf[14..])?;
        arp.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(ArpOperations::Reply);
        arp.set_sender_hw_addr(iface.mac);
        arp.set_sender_proto_addr(*iface.ipv4.first()?);
        arp.set_target_hw_addr(request.get_sender_hw_addr());
        arp.set_target_proto_addr(target);
    }
    Some(buf.freeze())
}

/// Builds an IPv6 Neighbor Solicitation for `ip`'s solicited-node multicast
/// group, carrying a Source Link-Layer Address option for `iface`'s own
/// MAC. Used as the ND cache's solicitation callback (spec.md §4.3
/// `xmit_req`).
fn build_neighbor_solicitation(ip: IpAddr, iface: &Interface) -> Option<RawFrame> {
    let target = match ip {
        IpAddr::V6(v6) => v6,
        IpAddr::V4(_) => return None,
    };
    let src = *iface.ipv6.first()?;
    let dst = solicited_node_multicast(&target);
    let dst_mac = ipv6_multicast_mac(&dst);

    let opt_len = 8usize;
    let icmp_len = 24 + opt_len;
    let mut icmp_buf = BytesMut::with_capacity(icmp_len);
    icmp_buf.put_bytes(0, icmp_len);
    {
        let mut ns = MutableNeighborSolicitPacket::new(&mut icmp_buf)?;
        ns.set_icmpv6_type(Icmpv6Types::NeighborSolicit);
        ns.set_icmpv6_code(pnet_packet::icmpv6::Icmpv6Code(0));
        ns.set_target_addr(target);
        let option_bytes = [
            NdpOptionTypes::SourceLLAddr.0,
            1, // length in units of 8 octets
            iface.mac.0,
            iface.mac.1,
            iface.mac.2,
            iface.mac.3,
            iface.mac.4,
            iface.mac.5,
        ];
        ns.set_payload(&option_bytes);
    }
    let checksum = icmpv6_checksum(&Icmpv6Packet::new(&icmp_buf)?, &src, &dst);
    {
        let mut ns = MutableNeighborSolicitPacket::new(&mut icmp_buf)?;
        ns.set_checksum(checksum);
    }

    Some(wrap_ipv6_icmpv6(iface.mac, dst_mac, src, dst, icmp_buf.freeze()))
}

fn build_neighbor_advertisement(
    iface: &Interface,
    request: &Ipv6Packet,
    ns: &NeighborSolicitPacket,
    dst_mac: MacAddr,
) -> Option<RawFrame> {
    let target = ns.get_target_addr();
    let src = iface
        .ipv6
        .iter()
        .find(|a| **a == target)
        .copied()
        .or_else(|| iface.ipv6.first().copied())?;
    let dst = request.get_source();

    let opt_len = 8usize;
    let icmp_len = 24 + opt_len;
    let mut icmp_buf = BytesMut::with_capacity(icmp_len);
    icmp_buf.put_bytes(0, icmp_len);
    {
        let mut na = MutableNeighborAdvertPacket::new(&mut icmp_buf)?;
        na.set_icmpv6_type(Icmpv6Types::NeighborAdvert);
        na.set_icmpv6_code(pnet_packet::icmpv6::Icmpv6Code(0));
        na.set_flags(NeighborAdvertFlags::Solicited | NeighborAdvertFlags::Override);
        na.set_target_addr(target);
        let option_bytes = [
            NdpOptionTypes::TargetLLAddr.0,
            1, // length in units of 8 octets
            iface.mac.0,
            iface.mac.1,
            iface.mac.2,
            iface.mac.3,
            iface.mac.4,
            iface.mac.5,
        ];
        na.set_payload(&option_bytes);
    }
    let checksum = icmpv6_checksum(&Icmpv6Packet::new(&icmp_buf)?, &src, &dst);
    {
        let mut na = MutableNeighborAdvertPacket::new(&mut icmp_buf)?;
        na.set_checksum(checksum);
    }

    Some(wrap_ipv6_icmpv6(iface.mac, dst_mac, src, dst, icmp_buf.freeze()))
}

/// Wraps a ready (checksummed) ICMPv6 payload in an IPv6 header and an
/// Ethernet header, producing the full frame the NIC port transmits.
fn wrap_ipv6_icmpv6(
    src_mac: MacAddr,
    dst_mac: MacAddr,
    src_ip: Ipv6Addr,
    dst_ip: Ipv6Addr,
    icmp: RawFrame,
) -> RawFrame {
    let mut buf = BytesMut::with_capacity(14 + 40 + icmp.len());
    buf.put_bytes(0, 14 + 40);
    buf.put_slice(&icmp);
    {
        let mut eth = MutableEthernetPacket::new(&mut buf[..14]).expect("fixed-size eth header");
        eth.set_source(src_mac);
        eth.set_destination(dst_mac);
        eth.set_ethertype(EtherTypes::Ipv6);
    }
    {
        let mut ip6 =
            MutableIpv6Packet::new(&mut buf[14..54]).expect("fixed-size ipv6 header");
        ip6.set_version(6);
        ip6.set_traffic_class(0);
        ip6.set_flow_label(0);
        ip6.set_payload_length(icmp.len() as u16);
        ip6.set_next_header(IpNextHeaderProtocols::Icmpv6);
        ip6.set_hop_limit(255);
        ip6.set_source(src_ip);
        ip6.set_destination(dst_ip);
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn front_iface() -> Interface {
        Interface {
            name: "front0".to_owned(),
            mac: MacAddr::new(2, 0, 0, 0, 0, 1),
            ipv4: vec![Ipv4Addr::new(10, 0, 0, 1)],
            ipv6: vec!["fe80::1".parse().unwrap()],
        }
    }

    #[test]
    fn arp_request_carries_the_interfaces_own_addresses() {
        let target = Ipv4Addr::new(10, 0, 0, 2);
        let frame = build_arp_request(IpAddr::V4(target), &front_iface()).unwrap();

        let eth = EthernetPacket::new(&frame).unwrap();
        assert_eq!(eth.get_source(), front_iface().mac);
        assert_eq!(eth.get_destination(), MacAddr::broadcast());
        assert_eq!(eth.get_ethertype(), EtherTypes::Arp);

        let arp = ArpPacket::new(eth.payload()).unwrap();
        assert_eq!(arp.get_operation(), ArpOperations::Request);
        assert_eq!(arp.get_sender_hw_addr(), front_iface().mac);
        assert_eq!(arp.get_sender_proto_addr(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(arp.get_target_proto_addr(), target);
    }

    #[test]
    fn arp_request_for_an_ipv6_target_is_rejected() {
        let target: Ipv6Addr = "fe80::2".parse().unwrap();
        assert!(build_arp_request(IpAddr::V6(target), &front_iface()).is_none());
    }

    #[test]
    fn neighbor_solicitation_targets_the_solicited_node_multicast_group() {
        let target: Ipv6Addr = "2001:db8::2".parse().unwrap();
        let frame = build_neighbor_solicitation(IpAddr::V6(target), &front_iface()).unwrap();

        let eth = EthernetPacket::new(&frame).unwrap();
        assert_eq!(eth.get_ethertype(), EtherTypes::Ipv6);
        let expected_dst = solicited_node_multicast(&target);
        assert_eq!(eth.get_destination(), ipv6_multicast_mac(&expected_dst));

        let ipv6 = Ipv6Packet::new(eth.payload()).unwrap();
        assert_eq!(ipv6.get_source(), front_iface().ipv6[0]);
        assert_eq!(ipv6.get_destination(), expected_dst);
        assert_eq!(ipv6.get_next_header(), IpNextHeaderProtocols::Icmpv6);

        let ns = NeighborSolicitPacket::new(ipv6.payload()).unwrap();
        assert_eq!(ns.get_target_addr(), target);

        let icmpv6 = Icmpv6Packet::new(ipv6.payload()).unwrap();
        let expected_checksum =
            icmpv6_checksum(&icmpv6, &ipv6.get_source(), &ipv6.get_destination());
        assert_eq!(icmpv6.get_checksum(), expected_checksum);
    }

    /// Builds a bare (no Ethernet header) IPv6 packet carrying a Neighbor
    /// Solicitation for `target`, as if received from `solicitor`, for
    /// feeding into `build_neighbor_advertisement` without going through a
    /// full received-frame parse.
    fn build_incoming_solicitation_ipv6(solicitor: Ipv6Addr, target: Ipv6Addr) -> BytesMut {
        let opt_len = 8usize;
        let icmp_len = 24 + opt_len;
        let mut buf = BytesMut::with_capacity(40 + icmp_len);
        buf.put_bytes(0, 40 + icmp_len);
        {
            let mut ns = MutableNeighborSolicitPacket::new(&mut buf[40..]).unwrap();
            ns.set_icmpv6_type(Icmpv6Types::NeighborSolicit);
            ns.set_icmpv6_code(pnet_packet::icmpv6::Icmpv6Code(0));
            ns.set_target_addr(target);
        }
        {
            let mut ipv6 = MutableIpv6Packet::new(&mut buf[..]).unwrap();
            ipv6.set_version(6);
            ipv6.set_payload_length(icmp_len as u16);
            ipv6.set_next_header(IpNextHeaderProtocols::Icmpv6);
            ipv6.set_hop_limit(255);
            ipv6.set_source(solicitor);
            ipv6.set_destination(solicited_node_multicast(&target));
        }
        buf
    }

    #[test]
    fn neighbor_advertisement_replies_directly_to_the_solicitor() {
        let iface = front_iface();
        let target = iface.ipv6[0];
        let solicitor: Ipv6Addr = "2001:db8::9".parse().unwrap();
        let solicitor_mac = MacAddr::new(9, 9, 9, 9, 9, 9);

        let request_buf = build_incoming_solicitation_ipv6(solicitor, target);
        let request_ipv6 = Ipv6Packet::new(&request_buf).unwrap();
        let ns = NeighborSolicitPacket::new(request_ipv6.payload()).unwrap();

        let frame =
            build_neighbor_advertisement(&iface, &request_ipv6, &ns, solicitor_mac).unwrap();
        let eth = EthernetPacket::new(&frame).unwrap();
        assert_eq!(eth.get_destination(), solicitor_mac);
        assert_eq!(eth.get_source(), iface.mac);

        let ipv6 = Ipv6Packet::new(eth.payload()).unwrap();
        assert_eq!(ipv6.get_source(), target);
        assert_eq!(ipv6.get_destination(), solicitor);

        let icmpv6 = Icmpv6Packet::new(ipv6.payload()).unwrap();
        assert_eq!(icmpv6.get_icmpv6_type(), Icmpv6Types::NeighborAdvert);
        let expected_checksum =
            icmpv6_checksum(&icmpv6, &ipv6.get_source(), &ipv6.get_destination());
        assert_eq!(icmpv6.get_checksum(), expected_checksum);
    }

    #[test]
    fn wrap_ipv6_icmpv6_sets_payload_length_from_the_icmp_body() {
        let icmp = RawFrame::from_static(b"0123456789");
        let src: Ipv6Addr = "fe80::1".parse().unwrap();
        let dst: Ipv6Addr = "fe80::2".parse().unwrap();
        let frame = wrap_ipv6_icmpv6(
            MacAddr::new(1, 0, 0, 0, 0, 0),
            MacAddr::new(2, 0, 0, 0, 0, 0),
            src,
            dst,
            icmp.clone(),
        );

        let eth = EthernetPacket::new(&frame).unwrap();
        let ipv6 = Ipv6Packet::new(eth.payload()).unwrap();
        assert_eq!(ipv6.get_payload_length() as usize, icmp.len());
        assert_eq!(ipv6.get_next_header(), IpNextHeaderProtocols::Icmpv6);
        assert_eq!(ipv6.payload(), &icmp[..]);
    }
}
