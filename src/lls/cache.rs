//! The LLS resolution cache (spec.md §4.3, C3): a per-address-family table
//! of records with an aging TTL, a hold/put subscription model, and the
//! `Unresolved -> Resolved -> Stale -> Probing -> {Resolved, Removed}`
//! record state machine.

use std::collections::HashMap;
use std::net::IpAddr;

use pnet_packet::util::MacAddr;

use crate::clock::cycles_per_second;
use crate::nic::RawFrame;

/// Standard cache scan cadence (spec.md §6 "Timers").
pub const SCAN_INTERVAL_SECONDS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Unresolved,
    Resolved,
    Stale,
    Probing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Solicited,
    Unsolicited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldResult {
    Resolved(MacAddr),
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldStatus {
    Resolved(MacAddr),
    Pending,
}

/// A per-(ip, worker) subscription. `callback` is invoked on the LLS worker
/// whenever the record resolves, changes, or is cancelled on teardown.
struct Hold {
    worker_id: u32,
    callback: Box<dyn FnMut(HoldResult) + Send>,
}

struct Record {
    mac: Option<MacAddr>,
    state: RecordState,
    last_confirmed_at: u64,
    holds: Vec<Hold>,
}

impl Record {
    fn fresh(now: u64) -> Self {
        Record {
            mac: None,
            state: RecordState::Unresolved,
            last_confirmed_at: now,
            holds: Vec::new(),
        }
    }

    fn is_fresh(&self, now: u64, timeout_cycles: u64) -> bool {
        self.state == RecordState::Resolved && now.saturating_sub(self.last_confirmed_at) < timeout_cycles
    }
}

/// A capability describing one address family's wire behavior: how long a
/// resolution stays fresh, and how to build a solicitation frame for a
/// given address (spec.md §9 "capability interface per address family").
pub trait Family {
    fn timeout_cycles(&self) -> u64;
    fn build_solicitation(&self, ip: IpAddr) -> Option<RawFrame>;
}

/// ARP: fixed per-interface timeout, classic request frame (out of scope
/// here to wire-encode beyond the capability boundary -- `build_solicitation`
/// is supplied by the caller at construction).
pub struct Arp<F: Fn(IpAddr) -> Option<RawFrame>> {
    pub timeout_seconds: u64,
    pub solicit: F,
}

impl<F: Fn(IpAddr) -> Option<RawFrame>> Family for Arp<F> {
    fn timeout_cycles(&self) -> u64 {
        cycles_per_second(self.timeout_seconds)
    }
    fn build_solicitation(&self, ip: IpAddr) -> Option<RawFrame> {
        (self.solicit)(ip)
    }
}

/// IPv6 Neighbor Discovery, same shape as ARP with its own timeout and
/// solicitation builder.
pub struct Nd<F: Fn(IpAddr) -> Option<RawFrame>> {
    pub timeout_seconds: u64,
    pub solicit: F,
}

impl<F: Fn(IpAddr) -> Option<RawFrame>> Family for Nd<F> {
    fn timeout_cycles(&self) -> u64 {
        cycles_per_second(self.timeout_seconds)
    }
    fn build_solicitation(&self, ip: IpAddr) -> Option<RawFrame> {
        (self.solicit)(ip)
    }
}

pub struct LlsCache<F: Family> {
    family: F,
    records: HashMap<IpAddr, Record>,
}

impl<F: Family> LlsCache<F> {
    pub fn new(family: F) -> Self {
        LlsCache {
            family,
            records: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Subscribes `worker_id` to resolution updates for `ip`. If already
    /// resolved and fresh, the callback fires synchronously and `Resolved`
    /// is returned; otherwise the hold is recorded (replacing any prior
    /// hold from the same worker) and `Pending` is returned.
    pub fn hold(
        &mut self,
        ip: IpAddr,
        now: u64,
        worker_id: u32,
        mut callback: Box<dyn FnMut(HoldResult) + Send>,
    ) -> HoldStatus {
        let timeout = self.family.timeout_cycles();
        let record = self.records.entry(ip).or_insert_with(|| Record::fresh(now));

        if let Some(mac) = record.mac {
            if record.is_fresh(now, timeout) {
                callback(HoldResult::Resolved(mac));
                return HoldStatus::Resolved(mac);
            }
        }

        record.holds.retain(|h| h.worker_id != worker_id);
        record.holds.push(Hold { worker_id, callback });
        HoldStatus::Pending
    }

    /// Removes `worker_id`'s subscription, if any.
    pub fn put(&mut self, ip: IpAddr, worker_id: u32) {
        if let Some(record) = self.records.get_mut(&ip) {
            record.holds.retain(|h| h.worker_id != worker_id);
        }
    }

    /// Merges a resolution observed from a reply or advertisement. A
    /// `Source::Unsolicited` observation never promotes an already-fresh
    /// `Resolved` record to a different MAC (standard ND anti-spoofing
    /// behavior per spec.md's open question); it may still create a new
    /// record or refresh a stale/unresolved one.
    pub fn observe(&mut self, ip: IpAddr, mac: MacAddr, source: Source, now: u64) {
        let timeout = self.family.timeout_cycles();
        let record = self.records.entry(ip).or_insert_with(|| Record::fresh(now));

        if source == Source::Unsolicited && record.is_fresh(now, timeout) && record.mac != Some(mac) {
            return;
        }

        let changed = record.mac != Some(mac) || record.state != RecordState::Resolved;
        record.mac = Some(mac);
        record.state = RecordState::Resolved;
        record.last_confirmed_at = now;

        if changed {
            for hold in &mut record.holds {
                (hold.callback)(HoldResult::Resolved(mac));
            }
        }
    }

    /// Periodic aging pass (spec.md §4.3 `scan`): stale records with active
    /// holds are re-solicited; stale records with no holds are removed.
    /// Returns the solicitation frames to transmit.
    pub fn scan(&mut self, now: u64) -> Vec<RawFrame> {
        let timeout = self.family.timeout_cycles();
        let mut to_remove = Vec::new();
        let mut solicitations = Vec::new();

        for (ip, record) in self.records.iter_mut() {
            if record.state == RecordState::Probing {
                continue;
            }
            let expired = now.saturating_sub(record.last_confirmed_at) >= timeout;
            if !expired {
                continue;
            }
            if record.state == RecordState::Resolved {
                record.state = RecordState::Stale;
            }
            if record.holds.is_empty() {
                to_remove.push(*ip);
                continue;
            }
            if let Some(frame) = self.family.build_solicitation(*ip) {
                record.state = RecordState::Probing;
                solicitations.push(frame);
            }
        }

        for ip in to_remove {
            self.records.remove(&ip);
        }

        solicitations
    }

    /// Cancels every outstanding hold across all records, invoked on
    /// worker shutdown (spec.md §4.4 "on exit all caches are destroyed").
    pub fn cancel_all(&mut self) {
        for record in self.records.values_mut() {
            for hold in &mut record.holds {
                (hold.callback)(HoldResult::Cancelled);
            }
            record.holds.clear();
        }
    }
}
