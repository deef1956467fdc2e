//! The GK per-packet state machine (spec.md §4.6, C6) and the flow entry it
//! operates on (spec.md §3). The three-way REQUEST/GRANTED/DECLINED tagged
//! union from the source is an enum here: reading a field belonging to the
//! wrong variant is a compile error, not a design error caught at runtime.

use crate::nic::GrantorId;

pub const DSCP_LEGACY: u8 = 0;
pub const DSCP_GRANTED: u8 = 1;
pub const DSCP_RENEW: u8 = 2;
const REQUEST_DSCP_FLOOR: u8 = 3;
const DSCP_MAX: u8 = 63;

#[derive(Debug, Clone, Copy)]
pub struct RequestState {
    pub last_seen_at: u64,
    pub last_priority: u8,
    pub allowance: u8,
}

impl RequestState {
    /// The REQUEST creation defaults of spec.md §3.
    pub fn new(now: u64) -> Self {
        RequestState {
            last_seen_at: now,
            last_priority: 38,
            allowance: 7,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GrantedState {
    pub cap_expire_at: u64,
    pub budget_renew_at: u64,
    pub budget_byte: u64,
    /// Named after the source field despite the unit mismatch the source
    /// itself carries: this is the configured rate in KB/sec, copied
    /// verbatim from the policy's `tx_rate_kb_sec` (spec.md §4.7).
    pub tx_rate_kb_cycle: u64,
    pub send_next_renewal_at: u64,
    pub renewal_step_cycle: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct DeclinedState {
    pub expire_at: u64,
}

#[derive(Debug, Clone, Copy)]
pub enum FlowState {
    Request(RequestState),
    Granted(GrantedState),
    Declined(DeclinedState),
}

#[derive(Debug, Clone, Copy)]
pub struct FlowEntry {
    pub grantor: GrantorId,
    pub state: FlowState,
}

impl FlowEntry {
    pub fn new_request(grantor: GrantorId, now: u64) -> Self {
        FlowEntry {
            grantor,
            state: FlowState::Request(RequestState::new(now)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Encapsulate { dscp: u8 },
    Drop,
}

/// Classifies one packet of `pkt_len` bytes against `entry`, given the
/// current cycle count `now`. Mutates `entry` in place per spec.md §4.6.
pub fn classify(entry: &mut FlowEntry, now: u64, pkt_len: u64, log: &slog::Logger) -> Outcome {
    match entry.state {
        FlowState::Request(_) => classify_request(entry, now, log),
        FlowState::Granted(granted) => {
            if now >= granted.cap_expire_at {
                entry.state = FlowState::Request(RequestState::new(now));
                return classify_request(entry, now, log);
            }
            classify_granted(entry, now, pkt_len, log)
        }
        FlowState::Declined(declined) => {
            if now >= declined.expire_at {
                entry.state = FlowState::Request(RequestState::new(now));
                classify_request(entry, now, log)
            } else {
                Outcome::Drop
            }
        }
    }
}

fn classify_request(entry: &mut FlowEntry, now: u64, log: &slog::Logger) -> Outcome {
    let req = match &mut entry.state {
        FlowState::Request(r) => r,
        _ => unreachable!("classify_request called on non-REQUEST entry"),
    };

    let delta_ps: u128 = if now < req.last_seen_at {
        slog::debug!(log, "now < last_seen_at, treating as clock wrap";
            "now" => now, "last_seen_at" => req.last_seen_at);
        0
    } else {
        (now - req.last_seen_at) as u128 * crate::clock::PICOSEC_PER_CYCLE as u128
    };
    req.last_seen_at = now;

    let priority: u8 = if delta_ps < 1 {
        0
    } else {
        (127 - delta_ps.leading_zeros()) as u8
    };

    // The strict `<` is required: equality means the source waited long
    // enough to re-earn the tier and should receive a fresh allowance.
    if priority < req.last_priority && req.allowance > 0 {
        req.allowance -= 1;
    } else {
        req.last_priority = priority;
        req.allowance = 7;
    }

    let dscp = (req.last_priority.saturating_add(REQUEST_DSCP_FLOOR)).min(DSCP_MAX);
    Outcome::Encapsulate { dscp }
}

fn classify_granted(entry: &mut FlowEntry, now: u64, pkt_len: u64, log: &slog::Logger) -> Outcome {
    let granted = match &mut entry.state {
        FlowState::Granted(g) => g,
        _ => unreachable!("classify_granted called on non-GRANTED entry"),
    };

    if now >= granted.budget_renew_at {
        granted.budget_byte = granted.tx_rate_kb_cycle * 1024;
        granted.budget_renew_at = now + crate::clock::cycles_per_second(1);
    }

    if pkt_len > granted.budget_byte {
        slog::debug!(log, "granted flow exceeded budget, dropping";
            "pkt_len" => pkt_len, "budget_byte" => granted.budget_byte);
        return Outcome::Drop;
    }
    granted.budget_byte -= pkt_len;

    let dscp = if now >= granted.send_next_renewal_at {
        granted.send_next_renewal_at = now + granted.renewal_step_cycle;
        DSCP_RENEW
    } else {
        DSCP_GRANTED
    };

    Outcome::Encapsulate { dscp }
}
