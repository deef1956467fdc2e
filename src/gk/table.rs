//! The per-core GK flow table (spec.md §4.5, C5): a fixed-capacity,
//! open-addressing table keyed by `FlowKey`, probed with the same RSS hash
//! that steered the packet to this core in the first place. Capacity is
//! fixed at construction (a power of two) and the table never grows or
//! evicts; once full, inserts are rejected (SPEC_FULL.md §4.5 Open
//! Questions).

use crate::flow_key::FlowKey;
use crate::gk::state::FlowEntry;

/// Bounds the linear probe walk so a lookup/insert against a saturated
/// table is O(this) rather than O(capacity).
const MAX_PROBE: usize = 16;

enum Slot {
    Empty,
    Occupied(FlowKey, FlowEntry),
}

pub struct FlowTable {
    slots: Vec<Slot>,
    mask: u32,
    len: usize,
}

impl FlowTable {
    /// `capacity` is rounded up to the next power of two.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Slot::Empty);
        FlowTable {
            slots,
            mask: (capacity - 1) as u32,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn lookup_mut(&mut self, key: &FlowKey, hash: u32) -> Option<&mut FlowEntry> {
        let start = (hash & self.mask) as usize;
        for offset in 0..MAX_PROBE.min(self.slots.len()) {
            let idx = (start + offset) & self.mask as usize;
            match &self.slots[idx] {
                Slot::Occupied(k, _) if k == key => {
                    return match &mut self.slots[idx] {
                        Slot::Occupied(_, entry) => Some(entry),
                        Slot::Empty => unreachable!(),
                    };
                }
                Slot::Empty => return None,
                Slot::Occupied(_, _) => continue,
            }
        }
        None
    }

    /// Inserts `entry` under `key`, or returns it back if the table is full
    /// within the probe bound (`MAX_PROBE` consecutive occupied slots from
    /// the hash's home slot).
    pub fn insert(&mut self, key: FlowKey, hash: u32, entry: FlowEntry) -> Result<(), FlowEntry> {
        let start = (hash & self.mask) as usize;
        for offset in 0..MAX_PROBE.min(self.slots.len()) {
            let idx = (start + offset) & self.mask as usize;
            match &self.slots[idx] {
                Slot::Empty => {
                    self.slots[idx] = Slot::Occupied(key, entry);
                    self.len += 1;
                    return Ok(());
                }
                Slot::Occupied(k, _) if k == &key => {
                    self.slots[idx] = Slot::Occupied(key, entry);
                    return Ok(());
                }
                Slot::Occupied(_, _) => continue,
            }
        }
        Err(entry)
    }

    /// Looks up an entry, inserting a fresh REQUEST entry under `key` if
    /// absent. Returns `None` only when the table is full and has no slot
    /// for a new key.
    pub fn lookup_or_insert<'a>(
        &'a mut self,
        key: &FlowKey,
        hash: u32,
        make: impl FnOnce() -> FlowEntry,
    ) -> Option<&'a mut FlowEntry> {
        if self.lookup_mut(key, hash).is_some() {
            return self.lookup_mut(key, hash);
        }
        match self.insert(key.clone(), hash, make()) {
            Ok(()) => self.lookup_mut(key, hash),
            Err(_) => None,
        }
    }
}
