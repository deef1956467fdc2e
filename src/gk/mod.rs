//! The GK worker (spec.md §4.5-§4.8): ties the flow table, state machine,
//! policy intake, and encapsulation into the per-core run-to-completion
//! loop described in spec.md §2's data-flow summary.

pub mod policy;
pub mod state;
pub mod table;

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use pnet_packet::ethernet::EthernetPacket;
use pnet_packet::util::MacAddr;
use pnet_packet::Packet;

use crate::clock::Clock;
use crate::encap::{back_interface_source, encapsulate, wrap_ethernet};
use crate::lls::{HoldResult, LlsCommand};
use crate::mailbox::{self, MailboxReceiver, MailboxSender};
use crate::nic::{Interface, NicPort, RawFrame, RouteTable};
use crate::packet;
use crate::rss::{flow_key_hash, DEFAULT_RSS_KEY};

use policy::{apply, PolicyCommand, MAX_POLICY_DRAIN};
use state::{classify, FlowEntry, Outcome};
use table::FlowTable;

const MAX_RX_BURST: usize = 32;
const RESOLUTION_MAILBOX_CAPACITY: usize = 256;
const MAX_RESOLUTION_DRAIN: usize = 64;

/// Carries a just-resolved (or cancelled) next-hop link-layer address from
/// the LLS worker back to the GK worker that asked for it, crossing threads
/// only through a mailbox (spec.md §5's "no shared mutable state besides
/// the mailbox" rule). `mac` is `None` when the hold was cancelled rather
/// than resolved, which drops the address back to unresolved instead of
/// poisoning it with a stale value.
pub struct ResolutionEvent {
    pub ip: IpAddr,
    pub mac: Option<MacAddr>,
}

pub struct GkWorker<C: Clock> {
    pub core_id: usize,
    table: FlowTable,
    policy_mailbox: MailboxReceiver<PolicyCommand>,
    clock: C,
    back_iface: Interface,
    lls_tx: MailboxSender<LlsCommand>,
    resolution_tx: MailboxSender<ResolutionEvent>,
    resolution_rx: MailboxReceiver<ResolutionEvent>,
    resolved: HashMap<IpAddr, MacAddr>,
    pending_holds: HashSet<IpAddr>,
    logger: slog::Logger,
}

impl<C: Clock> GkWorker<C> {
    pub fn new(
        core_id: usize,
        table_capacity: usize,
        policy_mailbox: MailboxReceiver<PolicyCommand>,
        clock: C,
        back_iface: Interface,
        lls_tx: MailboxSender<LlsCommand>,
        logger: slog::Logger,
    ) -> Self {
        let (resolution_tx, resolution_rx) = mailbox::with_capacity(RESOLUTION_MAILBOX_CAPACITY);
        GkWorker {
            core_id,
            table: FlowTable::new(table_capacity),
            policy_mailbox,
            clock,
            back_iface,
            lls_tx,
            resolution_tx,
            resolution_rx,
            resolved: HashMap::new(),
            pending_holds: HashSet::new(),
            logger,
        }
    }

    pub fn flow_count(&self) -> usize {
        self.table.len()
    }

    /// One loop iteration: drain policy commands and resolution events,
    /// then process a receive burst from `front`, returning the frames to
    /// transmit on the back interface.
    pub fn run_once<P: NicPort>(&mut self, front: &mut P, routes: &dyn RouteTable) -> Vec<RawFrame> {
        let now = self.clock.now();

        for cmd in self.policy_mailbox.dequeue_burst(MAX_POLICY_DRAIN) {
            apply(&mut self.table, &cmd, now);
        }

        for event in self.resolution_rx.dequeue_burst(MAX_RESOLUTION_DRAIN) {
            self.pending_holds.remove(&event.ip);
            match event.mac {
                Some(mac) => {
                    self.resolved.insert(event.ip, mac);
                }
                None => {
                    self.resolved.remove(&event.ip);
                }
            }
        }

        let mut outgoing = Vec::with_capacity(MAX_RX_BURST);
        for frame in front.rx_burst(MAX_RX_BURST) {
            if let Some(encapsulated) = self.process_one(&frame, now, routes) {
                outgoing.push(encapsulated);
            }
        }
        outgoing
    }

    fn process_one(&mut self, frame: &RawFrame, now: u64, routes: &dyn RouteTable) -> Option<RawFrame> {
        let view = match packet::extract(frame.clone(), &self.logger) {
            Ok(v) => v,
            Err(e) => {
                slog::debug!(self.logger, "gk dropped unparseable frame"; "error" => %e);
                return None;
            }
        };

        let route = routes.route_lookup(view.flow_key.dst)?;
        let hash = flow_key_hash(&DEFAULT_RSS_KEY, &view.flow_key);
        let entry = self.table.lookup_or_insert(&view.flow_key, hash, || {
            FlowEntry::new_request(route.grantor, now)
        })?;

        let outcome = classify(entry, now, view.l3_len as u64, &self.logger);
        let dscp = match outcome {
            Outcome::Encapsulate { dscp } => dscp,
            Outcome::Drop => return None,
        };

        let dst_mac = match self.resolved.get(&route.tunnel.outer_dst) {
            Some(mac) => *mac,
            None => {
                self.request_resolution(route.tunnel.outer_dst);
                return None;
            }
        };

        let ethernet = EthernetPacket::new(&view.mbuf)?;
        let eth_len = view.mbuf.len() - ethernet.payload().len();
        let l3 = view.mbuf.slice(eth_len..);

        let src = back_interface_source(
            &route.tunnel,
            self.back_iface.ipv4.first().copied(),
            self.back_iface.ipv6.first().copied(),
        )?;
        match encapsulate(&l3, dscp, src, &route.tunnel) {
            Ok(encapsulated) => Some(wrap_ethernet(
                &encapsulated,
                self.back_iface.mac,
                dst_mac,
                route.tunnel.family,
            )),
            Err(e) => {
                slog::debug!(self.logger, "gk failed to encapsulate"; "error" => %e);
                None
            }
        }
    }

    /// Submits a HOLD to the LLS worker for `ip` unless one is already
    /// outstanding for this worker, so a burst of packets to an unresolved
    /// next hop enqueues at most one hold per address (spec.md §4.5).
    fn request_resolution(&mut self, ip: IpAddr) {
        if !self.pending_holds.insert(ip) {
            return;
        }
        let resolution_tx = self.resolution_tx.clone();
        let worker_id = self.core_id as u32;
        let callback = Box::new(move |result: HoldResult| {
            let mac = match result {
                HoldResult::Resolved(mac) => Some(mac),
                HoldResult::Cancelled => None,
            };
            let _ = resolution_tx.enqueue(ResolutionEvent { ip, mac });
        });
        if self
            .lls_tx
            .enqueue(LlsCommand::Hold { ip, worker_id, callback })
            .is_err()
        {
            slog::debug!(self.logger, "lls mailbox full, dropping resolution request"; "ip" => %ip);
            self.pending_holds.remove(&ip);
        }
    }

    /// Test-only shortcut to populate a resolved next hop without driving
    /// the mailbox round-trip through a real LLS worker.
    #[cfg(test)]
    pub fn test_insert_resolved(&mut self, ip: IpAddr, mac: MacAddr) {
        self.resolved.insert(ip, mac);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::mailbox;
    use crate::nic::{GrantorId, MockPort, QueueId, RouteResult, TunnelDescriptor, TunnelFamily};
    use bytes::{BufMut, Bytes, BytesMut};
    use std::net::Ipv4Addr;
    use pnet_packet::ethernet::{EtherTypes, MutableEthernetPacket};
    use pnet_packet::ip::IpNextHeaderProtocols;
    use pnet_packet::ipv4::MutableIpv4Packet;
    use pnet_packet::util::MacAddr;

    fn back_iface() -> Interface {
        Interface {
            name: "back0".to_owned(),
            mac: MacAddr::new(2, 0, 0, 0, 0, 9),
            ipv4: vec![Ipv4Addr::new(192, 0, 2, 9)],
            ipv6: vec![],
        }
    }

    fn new_worker(
        rx: MailboxReceiver<PolicyCommand>,
    ) -> (GkWorker<FakeClock>, MailboxReceiver<LlsCommand>) {
        let (lls_tx, lls_rx) = mailbox::channel::<LlsCommand>();
        let worker = GkWorker::new(
            0,
            16,
            rx,
            FakeClock::new(0),
            back_iface(),
            lls_tx,
            slog::Logger::root(slog::Discard, slog::o!()),
        );
        (worker, lls_rx)
    }

    struct StaticRoutes {
        grantor: GrantorId,
        tunnel_dst: Ipv4Addr,
    }

    impl RouteTable for StaticRoutes {
        fn route_lookup(&self, _dst: IpAddr) -> Option<RouteResult> {
            Some(RouteResult {
                grantor: self.grantor,
                tunnel: TunnelDescriptor {
                    family: TunnelFamily::V4,
                    outer_dst: IpAddr::V4(self.tunnel_dst),
                },
            })
        }
    }

    fn build_ipv4_tcp_frame(src: Ipv4Addr, dst: Ipv4Addr) -> Bytes {
        let mut buf = BytesMut::with_capacity(14 + 20);
        buf.put_bytes(0, 14 + 20);
        {
            let mut eth = MutableEthernetPacket::new(&mut buf[..14]).unwrap();
            eth.set_ethertype(EtherTypes::Ipv4);
            eth.set_source(MacAddr::new(2, 0, 0, 0, 0, 1));
            eth.set_destination(MacAddr::new(2, 0, 0, 0, 0, 2));
        }
        {
            let mut ip = MutableIpv4Packet::new(&mut buf[14..]).unwrap();
            ip.set_version(4);
            ip.set_header_length(5);
            ip.set_total_length(20);
            ip.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
            ip.set_source(src);
            ip.set_destination(dst);
        }
        buf.freeze()
    }

    #[test]
    fn unresolved_next_hop_holds_the_packet_and_requests_resolution() {
        let (_tx, rx) = mailbox::channel::<PolicyCommand>();
        let (mut worker, lls_rx) = new_worker(rx);
        let mut port = MockPort::new(QueueId(0), QueueId(1));
        port.push_rx(build_ipv4_tcp_frame(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
        ));

        let routes = StaticRoutes {
            grantor: GrantorId(1),
            tunnel_dst: Ipv4Addr::new(192, 0, 2, 1),
        };

        let outgoing = worker.run_once(&mut port, &routes);
        assert!(outgoing.is_empty(), "unresolved next hop drops the packet");
        assert_eq!(worker.flow_count(), 1, "the flow is still tracked");

        let holds = lls_rx.dequeue_burst(8);
        assert_eq!(holds.len(), 1, "exactly one hold is requested for the next hop");
        match &holds[0] {
            LlsCommand::Hold { ip, .. } => assert_eq!(*ip, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))),
            _ => panic!("expected a Hold command"),
        }
    }

    #[test]
    fn repeated_packets_to_the_same_unresolved_next_hop_hold_only_once() {
        let (_tx, rx) = mailbox::channel::<PolicyCommand>();
        let (mut worker, lls_rx) = new_worker(rx);
        let mut port = MockPort::new(QueueId(0), QueueId(1));
        port.push_rx(build_ipv4_tcp_frame(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
        ));
        port.push_rx(build_ipv4_tcp_frame(
            Ipv4Addr::new(10, 0, 0, 3),
            Ipv4Addr::new(10, 0, 0, 2),
        ));

        let routes = StaticRoutes {
            grantor: GrantorId(1),
            tunnel_dst: Ipv4Addr::new(192, 0, 2, 1),
        };

        worker.run_once(&mut port, &routes);
        assert_eq!(lls_rx.dequeue_burst(8).len(), 1);
    }

    #[test]
    fn first_packet_is_encapsulated_once_resolved() {
        let (_tx, rx) = mailbox::channel::<PolicyCommand>();
        let (mut worker, _lls_rx) = new_worker(rx);
        let next_hop_mac = MacAddr::new(2, 0, 0, 0, 0, 2);
        worker.test_insert_resolved(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), next_hop_mac);

        let mut port = MockPort::new(QueueId(0), QueueId(1));
        port.push_rx(build_ipv4_tcp_frame(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
        ));

        let routes = StaticRoutes {
            grantor: GrantorId(1),
            tunnel_dst: Ipv4Addr::new(192, 0, 2, 1),
        };

        let outgoing = worker.run_once(&mut port, &routes);
        assert_eq!(outgoing.len(), 1);
        assert_eq!(worker.flow_count(), 1);

        let ethernet = EthernetPacket::new(&outgoing[0]).unwrap();
        assert_eq!(ethernet.get_destination(), next_hop_mac);
        assert_eq!(ethernet.get_source(), back_iface().mac);

        let outer = pnet_packet::ipv4::Ipv4Packet::new(ethernet.payload()).unwrap();
        // A brand-new flow bootstraps with last_priority=38, allowance=7
        // (spec.md §3); the first packet measures delta=0 -> priority=0,
        // which is lower than last_priority with allowance remaining, so
        // the allowance branch holds last_priority at 38 rather than
        // adopting 0 (see DESIGN.md's "Scenario 1" note).
        assert_eq!(outer.get_dscp(), 41);
        assert_eq!(outer.get_destination(), Ipv4Addr::new(192, 0, 2, 1));
    }

    #[test]
    fn resolution_event_arriving_after_a_hold_lets_the_next_packet_through() {
        let (_tx, rx) = mailbox::channel::<PolicyCommand>();
        let (mut worker, lls_rx) = new_worker(rx);
        let mut port = MockPort::new(QueueId(0), QueueId(1));
        port.push_rx(build_ipv4_tcp_frame(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
        ));
        let routes = StaticRoutes {
            grantor: GrantorId(1),
            tunnel_dst: Ipv4Addr::new(192, 0, 2, 1),
        };

        assert!(worker.run_once(&mut port, &routes).is_empty());
        let next_hop_mac = MacAddr::new(2, 0, 0, 0, 0, 2);
        // Simulate the LLS worker invoking the stored callback once
        // resolved, which enqueues a `ResolutionEvent` back to us.
        match lls_rx.dequeue_burst(8).into_iter().next() {
            Some(LlsCommand::Hold { mut callback, .. }) => {
                callback(HoldResult::Resolved(next_hop_mac));
            }
            _ => panic!("expected a Hold command"),
        }

        port.push_rx(build_ipv4_tcp_frame(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
        ));
        let outgoing = worker.run_once(&mut port, &routes);
        assert_eq!(outgoing.len(), 1);
        let ethernet = EthernetPacket::new(&outgoing[0]).unwrap();
        assert_eq!(ethernet.get_destination(), next_hop_mac);
    }

    #[test]
    fn policy_arriving_before_packet_is_observed_on_first_classification() {
        let (tx, rx) = mailbox::channel::<PolicyCommand>();
        let (mut worker, _lls_rx) = new_worker(rx);
        let flow = crate::flow_key::FlowKey::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
        );
        tx.enqueue(PolicyCommand {
            grantor: GrantorId(1),
            flow,
            decision: policy::PolicyDecision::Declined(policy::DeclinedParams { expire_sec: 60 }),
        })
        .unwrap();

        let mut port = MockPort::new(QueueId(0), QueueId(1));
        port.push_rx(build_ipv4_tcp_frame(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
        ));
        let routes = StaticRoutes {
            grantor: GrantorId(1),
            tunnel_dst: Ipv4Addr::new(192, 0, 2, 1),
        };

        let outgoing = worker.run_once(&mut port, &routes);
        assert!(outgoing.is_empty(), "declined flow should drop the packet");
    }
}
