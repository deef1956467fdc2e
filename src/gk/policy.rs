//! Policy intake (spec.md §4.7, C7): the commands a Grantor's decision
//! arrives as, how they install into a `FlowEntry`, and the RSS-based
//! routing that gets a command from wherever it was decided to the core
//! that owns the flow.

use crate::clock::{cycles_per_ms, cycles_per_second};
use crate::flow_key::FlowKey;
use crate::gk::state::{DeclinedState, FlowEntry, FlowState, GrantedState, RequestState};
use crate::gk::table::FlowTable;
use crate::nic::GrantorId;
use crate::rss::{flow_key_hash, redirection_table_index, DEFAULT_RSS_KEY};

/// At most this many policy commands are drained from the mailbox per
/// worker iteration, bounding how long a single pass can take (spec.md §5).
pub const MAX_POLICY_DRAIN: usize = 32;

#[derive(Debug, Clone, Copy)]
pub struct GrantedParams {
    pub tx_rate_kb_sec: u64,
    pub cap_expire_sec: u64,
    pub next_renewal_ms: u64,
    pub renewal_step_ms: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct DeclinedParams {
    pub expire_sec: u64,
}

#[derive(Debug, Clone, Copy)]
pub enum PolicyDecision {
    Granted(GrantedParams),
    Declined(DeclinedParams),
}

#[derive(Debug, Clone)]
pub struct PolicyCommand {
    pub grantor: GrantorId,
    pub flow: FlowKey,
    pub decision: PolicyDecision,
}

/// Installs a GRANTED decision, replacing whatever state `entry` held.
pub fn apply_granted(entry: &mut FlowEntry, now: u64, params: GrantedParams) {
    let budget_byte = params.tx_rate_kb_sec * 1024;
    entry.state = FlowState::Granted(GrantedState {
        cap_expire_at: now + cycles_per_second(params.cap_expire_sec),
        budget_renew_at: now + cycles_per_second(1),
        budget_byte,
        tx_rate_kb_cycle: params.tx_rate_kb_sec,
        send_next_renewal_at: now + cycles_per_ms(params.next_renewal_ms),
        renewal_step_cycle: cycles_per_ms(params.renewal_step_ms),
    });
}

/// Installs a DECLINED decision. Reapplying the same decision before
/// expiry is idempotent: `expire_at` is always computed from the `now` at
/// which this call runs, not accumulated (spec.md §8, "idempotent decline").
pub fn apply_declined(entry: &mut FlowEntry, now: u64, expire_sec: u64) {
    entry.state = FlowState::Declined(DeclinedState {
        expire_at: now + cycles_per_second(expire_sec),
    });
}

/// Applies one drained `PolicyCommand` against `table`, creating a fresh
/// REQUEST entry first if the flow hasn't been seen yet -- a policy may
/// legitimately arrive before the flow's first packet (spec.md §4.7).
pub fn apply(table: &mut FlowTable, cmd: &PolicyCommand, now: u64) {
    let hash = flow_key_hash(&DEFAULT_RSS_KEY, &cmd.flow);
    let entry = table.lookup_or_insert(&cmd.flow, hash, || {
        FlowEntry {
            grantor: cmd.grantor,
            state: FlowState::Request(RequestState::new(now)),
        }
    });
    let entry = match entry {
        Some(e) => e,
        None => return, // table full; the command is dropped on the floor.
    };
    entry.grantor = cmd.grantor;
    match cmd.decision {
        PolicyDecision::Granted(params) => apply_granted(entry, now, params),
        PolicyDecision::Declined(params) => apply_declined(entry, now, params.expire_sec),
    }
}

/// Which of `worker_count` GK workers owns `flow`, using the same RSS hash
/// and redirection-table reduction the NIC itself used to steer the
/// flow's packets (spec.md §4.7: "the same function that steered the
/// packet to its worker").
pub fn route_to_worker(flow: &FlowKey, worker_count: u32) -> u32 {
    let hash = flow_key_hash(&DEFAULT_RSS_KEY, flow);
    redirection_table_index(hash, worker_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn flow() -> FlowKey {
        FlowKey::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 1, 1)),
        )
    }

    #[test]
    fn apply_granted_derives_budget_from_rate() {
        let mut table = FlowTable::new(16);
        let cmd = PolicyCommand {
            grantor: GrantorId(1),
            flow: flow(),
            decision: PolicyDecision::Granted(GrantedParams {
                tx_rate_kb_sec: 50,
                cap_expire_sec: 60,
                next_renewal_ms: 500,
                renewal_step_ms: 500,
            }),
        };
        apply(&mut table, &cmd, 0);
        let hash = flow_key_hash(&DEFAULT_RSS_KEY, &flow());
        let entry = table.lookup_mut(&flow(), hash).unwrap();
        match entry.state {
            FlowState::Granted(g) => {
                assert_eq!(g.budget_byte, 50 * 1024);
                assert_eq!(g.tx_rate_kb_cycle, 50);
            }
            _ => panic!("expected GRANTED"),
        }
    }

    #[test]
    fn policy_before_first_packet_creates_entry() {
        let mut table = FlowTable::new(16);
        let cmd = PolicyCommand {
            grantor: GrantorId(2),
            flow: flow(),
            decision: PolicyDecision::Declined(DeclinedParams { expire_sec: 30 }),
        };
        assert_eq!(table.len(), 0);
        apply(&mut table, &cmd, 0);
        assert_eq!(table.len(), 1);
        let hash = flow_key_hash(&DEFAULT_RSS_KEY, &flow());
        let entry = table.lookup_mut(&flow(), hash).unwrap();
        assert!(matches!(entry.state, FlowState::Declined(_)));
    }

    #[test]
    fn route_to_worker_is_bounded_and_deterministic() {
        let a = route_to_worker(&flow(), 8);
        let b = route_to_worker(&flow(), 8);
        assert_eq!(a, b);
        assert!(a < 8);
    }
}
