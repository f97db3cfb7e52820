//! Cuckoo flow classifier.
//!
//! The classifier answers "which flow slot owns this packet?" with a
//! two-table cuckoo hash. Each table is one half of a `2F` entry array
//! whose values are 1-based flow slot indexes (0 = vacant). A packet hashes
//! to one candidate bucket per half via a per-table seed; collisions evict
//! the incumbent to its alternate bucket, bounded by an iteration cap
//! beyond which flows simply share a slot.
//!
//! An external filter can be installed instead; it bypasses hashing
//! entirely and yields a class directly, or a verdict to discard the
//! packet.

use tracing::trace;

use crate::flow::Flow;
use crate::packet::Packet;
use crate::slots::EmptySlots;

/// Verdict from an installed external filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    /// Use this 1-based class. Out-of-range classes drop the packet.
    Class(u32),
    /// The filter consumed the packet; discard it without counting.
    Steal,
    /// Discard the packet, counted as a classification drop.
    Shot,
}

/// Black-box classifier that replaces the internal hash when installed.
pub trait FlowFilter<P> {
    fn classify(&self, packet: &P) -> FilterVerdict;
}

/// Result of a cuckoo lookup: the owning 1-based slot and the bucket pair
/// the packet's identity hashes to. The scheduler records the pair in the
/// flow so the entries can be cleared when the flow drains.
#[derive(Debug, Clone, Copy)]
pub struct Classification {
    pub slot: u32,
    pub buckets: [u32; 2],
}

/// `(hash * n) >> 32`: fair reduction of a 32-bit hash onto `[0, n)`.
fn reciprocal_scale(hash: u32, n: u32) -> u32 {
    ((hash as u64 * n as u64) >> 32) as u32
}

#[derive(Debug)]
pub struct CuckooTable {
    /// `2F` entries holding 1-based flow indexes; the halves are the two
    /// logical tables.
    entries: Vec<u32>,
    seeds: [u32; 2],
    flows_cnt: u32,
}

impl CuckooTable {
    pub fn new(flows_cnt: u32, seeds: [u32; 2]) -> Self {
        Self {
            entries: vec![0; 2 * flows_cnt as usize],
            seeds,
            flows_cnt,
        }
    }

    /// Candidate bucket for `packet` in table half `t`.
    fn bucket<P: Packet>(&self, packet: &P, t: usize) -> usize {
        let reduced = reciprocal_scale(packet.flow_hash_perturb(self.seeds[t]), self.flows_cnt);
        (self.flows_cnt * t as u32 + reduced) as usize
    }

    /// Direct single-table slot, used once every flow record is taken:
    /// packets then share records stochastically.
    fn direct_slot<P: Packet>(&self, packet: &P) -> u32 {
        reciprocal_scale(packet.flow_hash(), self.flows_cnt) + 1
    }

    /// Map a packet to its owning flow slot, creating or evicting ownership
    /// as needed. `flows` is read to test occupancy and head identity;
    /// `free` is only consulted, never modified; the caller marks the slot
    /// occupied when the packet is actually queued.
    pub fn classify<P: Packet>(
        &mut self,
        packet: &P,
        flows: &[Flow<P>],
        free: &EmptySlots,
    ) -> Classification {
        let h0 = self.bucket(packet, 0);
        let h1 = self.bucket(packet, 1);
        let buckets = [h0 as u32, h1 as u32];
        let e0 = self.entries[h0];
        let e1 = self.entries[h1];

        let slot = match (e0, e1) {
            (0, 0) => match free.next_empty() {
                Some(s) => {
                    self.entries[h0] = s + 1;
                    s + 1
                }
                None => self.direct_slot(packet),
            },
            (a, 0) => self.resolve_half(packet, flows, free, a, h1),
            (0, b) => self.resolve_half(packet, flows, free, b, h0),
            (a, b) => {
                let fa = &flows[(a - 1) as usize];
                let fb = &flows[(b - 1) as usize];
                if fa.is_empty() {
                    a
                } else if fb.is_empty() {
                    b
                } else if fa.head_hash() == Some(packet.flow_hash()) {
                    a
                } else if fb.head_hash() == Some(packet.flow_hash()) {
                    b
                } else {
                    match free.next_empty() {
                        Some(s) => {
                            let v = s + 1;
                            self.evict_insert(packet, flows, v);
                            v
                        }
                        // nothing left to reserve; share with the incumbent
                        None => a,
                    }
                }
            }
        };
        Classification { slot, buckets }
    }

    /// One bucket is occupied by `resident`, the other (`vacant`) is free.
    /// Reuse the resident when it is idle or matches the packet's identity,
    /// otherwise reserve a fresh slot into the vacant bucket.
    fn resolve_half<P: Packet>(
        &mut self,
        packet: &P,
        flows: &[Flow<P>],
        free: &EmptySlots,
        resident: u32,
        vacant: usize,
    ) -> u32 {
        let flow = &flows[(resident - 1) as usize];
        if flow.is_empty() || flow.head_hash() == Some(packet.flow_hash()) {
            return resident;
        }
        match free.next_empty() {
            Some(s) => {
                self.entries[vacant] = s + 1;
                s + 1
            }
            None => resident,
        }
    }

    /// Insert `value` for `packet`, displacing residents cuckoo-style.
    ///
    /// Alternates between the two tables; each displaced resident rehashes
    /// by its own head packet. Terminates when a vacant bucket is found,
    /// when a displaced flow turns out to be retiring (no head packet, its
    /// entry is simply forgotten), or after `flows_cnt` attempts, at which
    /// point the last displaced entry is abandoned and its packets will
    /// share slots stochastically.
    fn evict_insert<P: Packet>(&mut self, packet: &P, flows: &[Flow<P>], mut value: u32) {
        let mut h = [self.bucket(packet, 0), self.bucket(packet, 1)];
        let mut attempts = 0;
        loop {
            for t in 0..2 {
                if attempts >= self.flows_cnt {
                    trace!(value, "cuckoo eviction cap hit, entry abandoned");
                    return;
                }
                attempts += 1;
                let idx = h[t];
                if self.entries[idx] == 0 {
                    self.entries[idx] = value;
                    return;
                }
                std::mem::swap(&mut value, &mut self.entries[idx]);
                trace!(bucket = idx, displaced = value, "cuckoo eviction");
                let Some(head) = flows[(value - 1) as usize].head_packet() else {
                    // the displaced flow is retiring; drop it from the table
                    return;
                };
                h = [self.bucket(head, 0), self.bucket(head, 1)];
            }
        }
    }

    /// Forget the entries recorded for `slot` (1-based) at its bucket pair.
    pub fn clear_slot(&mut self, slot: u32, buckets: [u32; 2]) {
        for b in buckets {
            if self.entries[b as usize] == slot {
                self.entries[b as usize] = 0;
            }
        }
    }

    /// Drop every entry; part of a full scheduler reset.
    pub fn clear(&mut self) {
        self.entries.fill(0);
    }

    pub fn seeds(&self) -> [u32; 2] {
        self.seeds
    }

    pub(crate) fn entries(&self) -> &[u32] {
        &self.entries
    }
}
