//! NIC port abstraction (SPEC_FULL.md §4.11, C11): the poll-mode burst
//! RX/TX boundary plus the external collaborator contracts of spec.md §6
//! (`route_lookup`, `ethertype_filter_add`, `setup_rss`, `get_queue_id`).
//! None of those four are implemented here -- they are owned by device
//! init, the LPM route table, and the RSS programming step, all out of
//! scope per spec.md §1. This module only defines the trait boundary a
//! real implementation of each must satisfy, plus a `pnet_datalink`-backed
//! `NicPort` and an in-memory `MockPort` for worker-loop unit tests.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::Bytes;
use pnet_packet::util::MacAddr;
use thiserror::Error;

pub type RawFrame = Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Rx,
    Tx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(pub u16);

#[derive(Error, Debug)]
pub enum PortError {
    #[error("no such interface '{0}'")]
    NoSuchInterface(String),
    #[error("failed to open a datalink channel: {0}")]
    ChannelOpen(String),
    #[error("unhandled channel type for this interface")]
    UnhandledChannelType,
}

/// The local configuration of one physical interface: its name, MAC, and
/// the unicast addresses solicitations/ARP replies must be answered for
/// (spec.md §4.4 step 1, §4.2 `is_nd`).
#[derive(Debug, Clone)]
pub struct Interface {
    pub name: String,
    pub mac: MacAddr,
    pub ipv4: Vec<Ipv4Addr>,
    pub ipv6: Vec<Ipv6Addr>,
}

impl Interface {
    pub fn owns_ipv4_destination(&self, addr: &Ipv4Addr) -> bool {
        self.ipv4.contains(addr)
    }

    /// True for the interface's own unicast addresses, link-local unicast,
    /// and the solicited-node multicast group derived from any of them
    /// (spec.md §6 LLS wire behavior).
    pub fn owns_ipv6_destination(&self, addr: &Ipv6Addr) -> bool {
        if self.ipv6.contains(addr) {
            return true;
        }
        self.ipv6
            .iter()
            .any(|configured| solicited_node_multicast(configured) == *addr)
    }

    /// True when `mac` is a frame this interface must process: broadcast,
    /// our own unicast, or a multicast address we've joined (spec.md §4.4
    /// step 1). Multicast membership here is approximated as "any
    /// multicast address", since the precise join set is owned by device
    /// init, out of scope per spec.md §1.
    pub fn accepts_destination_mac(&self, mac: &MacAddr) -> bool {
        *mac == MacAddr::broadcast() || *mac == self.mac || mac.is_multicast()
    }
}

/// Derives the IPv6 solicited-node multicast address `ff02::1:ffXX:XXXX`
/// for `addr`, per RFC 4291.
pub fn solicited_node_multicast(addr: &Ipv6Addr) -> Ipv6Addr {
    let o = addr.octets();
    Ipv6Addr::new(
        0xff02,
        0,
        0,
        0,
        0,
        1,
        0xff00 | (o[13] as u16),
        ((o[14] as u16) << 8) | (o[15] as u16),
    )
}

/// Derives the Ethernet multicast MAC `33:33:XX:XX:XX:XX` an IPv6 multicast
/// address maps onto per RFC 2464, for framing ND solicitations sent to a
/// solicited-node multicast destination.
pub fn ipv6_multicast_mac(addr: &Ipv6Addr) -> MacAddr {
    let o = addr.octets();
    MacAddr::new(0x33, 0x33, o[12], o[13], o[14], o[15])
}

trait MulticastCheck {
    fn is_multicast(&self) -> bool;
}

impl MulticastCheck for MacAddr {
    fn is_multicast(&self) -> bool {
        self.0 & 0x01 != 0
    }
}

/// Poll-mode burst receive/transmit on one queue of one port (spec.md §6:
/// burst size 32).
pub trait NicPort: Send {
    fn rx_burst(&mut self, max: usize) -> Vec<RawFrame>;
    /// Transmits as many of `frames` as the queue accepts, returning the
    /// count transmitted. Per spec.md §5 resource discipline, the caller
    /// owns and must free/retry whatever wasn't transmitted.
    fn tx_burst(&mut self, frames: &[RawFrame]) -> usize;
    fn queue_id(&self, direction: Direction) -> QueueId;
}

/// A `pnet_datalink`-backed `NicPort`. `pnet_datalink` has no notion of
/// hardware RX/TX queues, so `rx_queue`/`tx_queue` are bookkeeping only,
/// assigned by `get_queue_id` at construction time.
pub struct PnetPort {
    tx: Box<dyn pnet_datalink::DataLinkSender>,
    rx: Box<dyn pnet_datalink::DataLinkReceiver>,
    rx_queue: QueueId,
    tx_queue: QueueId,
}

impl PnetPort {
    pub fn bind(
        interface_name: &str,
        rx_queue: QueueId,
        tx_queue: QueueId,
    ) -> Result<Self, PortError> {
        let interface = pnet_datalink::interfaces()
            .into_iter()
            .find(|i| i.name == interface_name)
            .ok_or_else(|| PortError::NoSuchInterface(interface_name.to_owned()))?;

        // Poll-mode: a zero read timeout makes `rx.next()` return
        // immediately instead of blocking, matching spec.md's "no
        // suspension points" rule for the fast path.
        let mut config = pnet_datalink::Config::default();
        config.read_timeout = Some(std::time::Duration::from_millis(0));

        match pnet_datalink::channel(&interface, config) {
            Ok(pnet_datalink::Channel::Ethernet(tx, rx)) => Ok(PnetPort {
                tx,
                rx,
                rx_queue,
                tx_queue,
            }),
            Ok(_) => Err(PortError::UnhandledChannelType),
            Err(e) => Err(PortError::ChannelOpen(e.to_string())),
        }
    }
}

impl NicPort for PnetPort {
    fn rx_burst(&mut self, max: usize) -> Vec<RawFrame> {
        let mut batch = Vec::with_capacity(max.min(32));
        for _ in 0..max {
            match self.rx.next() {
                Ok(packet) => batch.push(Bytes::copy_from_slice(packet)),
                Err(_) => break,
            }
        }
        batch
    }

    fn tx_burst(&mut self, frames: &[RawFrame]) -> usize {
        let mut sent = 0;
        for frame in frames {
            match self.tx.send_to(frame, None) {
                Some(Ok(())) => sent += 1,
                _ => break,
            }
        }
        sent
    }

    fn queue_id(&self, direction: Direction) -> QueueId {
        match direction {
            Direction::Rx => self.rx_queue,
            Direction::Tx => self.tx_queue,
        }
    }
}

/// An in-memory `NicPort` for worker-loop unit tests, gated behind
/// `#[cfg(test)]` in this crate's own tests and behind the `test-support`
/// feature for integration tests in downstream crates.
#[cfg(any(test, feature = "test-support"))]
pub struct MockPort {
    pub rx_queue_frames: std::collections::VecDeque<RawFrame>,
    pub transmitted: Vec<RawFrame>,
    rx_queue: QueueId,
    tx_queue: QueueId,
}

#[cfg(any(test, feature = "test-support"))]
impl MockPort {
    pub fn new(rx_queue: QueueId, tx_queue: QueueId) -> Self {
        MockPort {
            rx_queue_frames: std::collections::VecDeque::new(),
            transmitted: Vec::new(),
            rx_queue,
            tx_queue,
        }
    }

    pub fn push_rx(&mut self, frame: RawFrame) {
        self.rx_queue_frames.push_back(frame);
    }
}

#[cfg(any(test, feature = "test-support"))]
impl NicPort for MockPort {
    fn rx_burst(&mut self, max: usize) -> Vec<RawFrame> {
        let mut batch = Vec::with_capacity(max.min(32));
        while batch.len() < max {
            match self.rx_queue_frames.pop_front() {
                Some(f) => batch.push(f),
                None => break,
            }
        }
        batch
    }

    fn tx_burst(&mut self, frames: &[RawFrame]) -> usize {
        self.transmitted.extend_from_slice(frames);
        frames.len()
    }

    fn queue_id(&self, direction: Direction) -> QueueId {
        match direction {
            Direction::Rx => self.rx_queue,
            Direction::Tx => self.tx_queue,
        }
    }
}

/// Opaque handle for the Grantor a flow has been assigned to; this crate
/// never interprets it beyond equality and Debug (spec.md §3 Open
/// Questions: grantor id selection is sourced from LPM, out of scope).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GrantorId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelFamily {
    V4,
    V6,
}

/// Enough of the outer-tunnel shape for `encap::encapsulate` to build a
/// valid outer header (SPEC_FULL.md §3); the wire layout itself is owned
/// by `encap`, not by route lookup.
#[derive(Debug, Clone)]
pub struct TunnelDescriptor {
    pub family: TunnelFamily,
    pub outer_dst: IpAddr,
}

#[derive(Debug, Clone)]
pub struct RouteResult {
    pub grantor: GrantorId,
    pub tunnel: TunnelDescriptor,
}

/// The LPM route lookup collaborator (spec.md §6); this crate consumes its
/// result as opaque values and never implements the lookup itself.
pub trait RouteTable: Send + Sync {
    fn route_lookup(&self, dst: IpAddr) -> Option<RouteResult>;
}

/// The device-init-time collaborators of spec.md §6, executed once at
/// startup before any worker loop begins.
pub trait PortControl {
    fn ethertype_filter_add(
        &mut self,
        port: &str,
        ethertype: u16,
        queue: QueueId,
    ) -> Result<(), PortError>;
    fn setup_rss(&mut self, port: &str, queues: &[QueueId]) -> Result<(), PortError>;
    fn get_queue_id(&self, iface: &str, direction: Direction, core: usize) -> QueueId;
}
