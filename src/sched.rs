//! The scheduler core: enqueue, deficit round-robin dequeue with per-flow
//! CoDel, the fat-flow overload policy, and the control surface.
//!
//! All state lives in preallocated storage sized at construction. The
//! packet path is synchronous and finite; nothing here blocks or
//! allocates per packet beyond the flow FIFO ring buffers. One instance
//! is single-threaded; callers that share it across threads wrap it in a
//! mutex, which also gives control-plane operations the writer exclusion
//! they need.

use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::classify::{CuckooTable, FilterVerdict, FlowFilter};
use crate::clock::{Clock, MonotonicClock};
use crate::codel::{self, CodelParams, CodelStats, CodelTime};
use crate::config::{ConfigUpdate, FqCodelConfig, MEMORY_LIMIT_MAX, QUANTUM_MIN};
use crate::error::Error;
use crate::flow::{Flow, PacketEntry, Rotation};
use crate::packet::Packet;
use crate::slots::EmptySlots;
use crate::stats::{FlowStats, QdiscStats};

/// Outcome of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueStatus {
    /// The packet was queued. Packets of other flows may have been shed to
    /// make room.
    Queued,
    /// The packet was queued, but its own flow was the one shed on
    /// overflow: the sender should back off.
    Congested,
    /// The packet was discarded by classification.
    Dropped,
}

enum Classified {
    Flow { slot: u32, buckets: Option<[u32; 2]> },
    /// No class; dropped and counted.
    Bypass,
    /// Consumed by the external filter; dropped without counting.
    Silent,
}

/// Fair Queue CoDel scheduler instance.
pub struct FqCodelQueue<P> {
    flows: Vec<Flow<P>>,
    /// Bytes queued per flow; scanned linearly to find the fat flow.
    backlogs: Vec<u32>,
    table: CuckooTable,
    empty_slots: EmptySlots,
    new_flows: VecDeque<u32>,
    old_flows: VecDeque<u32>,

    flows_cnt: u32,
    limit: u32,
    quantum: u32,
    drop_batch_size: u32,
    memory_limit: u32,

    cparams: CodelParams,
    cstats: CodelStats,

    qlen: u32,
    backlog_total: u32,
    memory_usage: u32,
    drop_overlimit: u32,
    drop_overmemory: u32,
    drop_bypass: u32,
    new_flow_count: u32,

    /// One-packet stash backing `peek`.
    cached: Option<P>,

    clock: Box<dyn Clock + Send>,
    filter: Option<Box<dyn FlowFilter<P> + Send>>,
}

impl<P: Packet> FqCodelQueue<P> {
    pub fn new(config: FqCodelConfig) -> Result<Self, Error> {
        Self::with_clock(config, Box::new(MonotonicClock::new()))
    }

    /// Build with an explicit time source; tests drive a manual clock.
    pub fn with_clock(config: FqCodelConfig, clock: Box<dyn Clock + Send>) -> Result<Self, Error> {
        if config.flows_cnt == 0 || config.flows_cnt > 65_536 {
            return Err(Error::InvalidFlowCount(config.flows_cnt));
        }
        let seeds = config
            .hash_seeds
            .unwrap_or_else(|| [rand::random(), rand::random()]);

        let mut cparams = CodelParams::new(config.mtu);
        cparams.target = codel::time_from_us(config.target_us);
        cparams.interval = codel::time_from_us(config.interval_us);
        cparams.ce_threshold = match config.ce_threshold_us {
            Some(us) => codel::time_from_us(us),
            None => codel::CE_THRESHOLD_DISABLED,
        };
        cparams.ecn = config.ecn;

        let flows_cnt = config.flows_cnt;
        debug!(
            flows = flows_cnt,
            limit = config.limit,
            quantum = config.quantum.max(QUANTUM_MIN),
            "fq_codel scheduler initialised"
        );
        Ok(Self {
            flows: (0..flows_cnt).map(|_| Flow::new()).collect(),
            backlogs: vec![0; flows_cnt as usize],
            table: CuckooTable::new(flows_cnt, seeds),
            empty_slots: EmptySlots::new(flows_cnt),
            new_flows: VecDeque::new(),
            old_flows: VecDeque::new(),
            flows_cnt,
            limit: config.limit,
            quantum: config.quantum.max(QUANTUM_MIN),
            drop_batch_size: config.drop_batch_size.max(1),
            memory_limit: config.memory_limit.min(MEMORY_LIMIT_MAX),
            cparams,
            cstats: CodelStats::default(),
            qlen: 0,
            backlog_total: 0,
            memory_usage: 0,
            drop_overlimit: 0,
            drop_overmemory: 0,
            drop_bypass: 0,
            new_flow_count: 0,
            cached: None,
            clock,
            filter: None,
        })
    }

    /// Install or remove the external classifier.
    pub fn set_filter(&mut self, filter: Option<Box<dyn FlowFilter<P> + Send>>) {
        self.filter = filter;
    }

    pub fn qlen(&self) -> u32 {
        self.qlen
    }

    pub fn backlog_bytes(&self) -> u32 {
        self.backlog_total
    }

    pub fn memory_usage(&self) -> u32 {
        self.memory_usage
    }

    fn classify_packet(&mut self, packet: &P) -> Classified {
        if let Some(class) = packet.class_id() {
            if class >= 1 && class <= self.flows_cnt {
                return Classified::Flow {
                    slot: class,
                    buckets: None,
                };
            }
        }
        if let Some(filter) = &self.filter {
            return match filter.classify(packet) {
                FilterVerdict::Class(c) if c >= 1 && c <= self.flows_cnt => Classified::Flow {
                    slot: c,
                    buckets: None,
                },
                FilterVerdict::Class(_) | FilterVerdict::Shot => Classified::Bypass,
                FilterVerdict::Steal => Classified::Silent,
            };
        }
        let c = self.table.classify(packet, &self.flows, &self.empty_slots);
        Classified::Flow {
            slot: c.slot,
            buckets: Some(c.buckets),
        }
    }

    /// Admit one packet.
    ///
    /// Runs to completion on the caller's context; the only loop is the
    /// bounded overload batch drop.
    ///
    /// # Returns
    /// - [`EnqueueStatus::Queued`]: accepted, possibly after shedding
    ///   packets of other flows.
    /// - [`EnqueueStatus::Congested`]: accepted, but the packet's own flow
    ///   absorbed the overflow drops and the sender should back off.
    /// - [`EnqueueStatus::Dropped`]: discarded by classification.
    pub fn enqueue(&mut self, packet: P) -> EnqueueStatus {
        let (slot, buckets) = match self.classify_packet(&packet) {
            Classified::Flow { slot, buckets } => (slot, buckets),
            Classified::Bypass => {
                self.drop_bypass += 1;
                trace!("packet dropped: no class");
                return EnqueueStatus::Dropped;
            }
            Classified::Silent => return EnqueueStatus::Dropped,
        };
        let idx = (slot - 1) as usize;
        let len = packet.wire_len();
        let mem = packet.mem_footprint();
        let now = codel::time_from_ns(self.clock.now_ns());

        let flow_was_empty = self.flows[idx].is_empty();
        self.flows[idx].push(PacketEntry {
            packet,
            enqueue_time: now,
            mem,
        });
        if flow_was_empty {
            if let Some(b) = buckets {
                self.flows[idx].buckets = Some(b);
            }
        }
        self.backlogs[idx] += len;
        self.backlog_total += len;
        self.empty_slots.mark_occupied(idx as u32);

        if self.flows[idx].rotation == Rotation::None {
            self.flows[idx].rotation = Rotation::New;
            self.flows[idx].deficit = self.quantum as i32;
            self.flows[idx].dropped = 0;
            self.new_flows.push_back(idx as u32);
            self.new_flow_count += 1;
        }
        self.memory_usage += mem;
        let memory_limited = self.memory_usage > self.memory_limit;
        self.qlen += 1;
        if self.qlen <= self.limit && !memory_limited {
            return EnqueueStatus::Queued;
        }

        let (fat_idx, dropped, _bytes) = self.fat_flow_drop(self.drop_batch_size);
        self.drop_overlimit += dropped;
        if memory_limited {
            self.drop_overmemory += dropped;
        }
        if fat_idx as usize == idx {
            EnqueueStatus::Congested
        } else {
            EnqueueStatus::Queued
        }
    }

    /// Shed a batch from the flow with the largest backlog.
    ///
    /// The linear argmax scan reads 4 KiB for 1024 flows; a batch of drops
    /// amortises it. Ties keep the first slot scanned. Returns the victim
    /// slot plus the packets and bytes shed.
    fn fat_flow_drop(&mut self, max_packets: u32) -> (u32, u32, u32) {
        let mut maxbacklog = 0u32;
        let mut idx = 0usize;
        for (i, &b) in self.backlogs.iter().enumerate() {
            if b > maxbacklog {
                maxbacklog = b;
                idx = i;
            }
        }

        // shed half of the fat flow's backlog at most
        let threshold = maxbacklog >> 1;
        let mut len = 0u32;
        let mut mem = 0u32;
        let mut dropped = 0u32;
        while let Some(entry) = self.flows[idx].pop() {
            len += entry.packet.wire_len();
            mem += entry.mem;
            dropped += 1;
            if dropped >= max_packets || len >= threshold {
                break;
            }
        }
        self.flows[idx].dropped += dropped;
        self.backlogs[idx] -= len;
        self.backlog_total -= len;
        self.memory_usage -= mem;
        self.qlen -= dropped;
        if self.flows[idx].is_empty() {
            self.release_slot(idx);
        }
        trace!(slot = idx, dropped, bytes = len, "fat flow head drop");
        (idx as u32, dropped, len)
    }

    /// Remove one packet from flow `idx` and settle the global accounting.
    fn pull(&mut self, idx: usize) -> Option<PacketEntry<P>> {
        let entry = self.flows[idx].pop()?;
        let len = entry.packet.wire_len();
        self.backlogs[idx] -= len;
        self.backlog_total -= len;
        self.memory_usage -= entry.mem;
        self.qlen -= 1;
        Some(entry)
    }

    /// Give the slot back to the free index and forget the flow's cuckoo
    /// entries via the bucket pair recorded at classification time.
    fn release_slot(&mut self, idx: usize) {
        self.empty_slots.mark_empty(idx as u32);
        if let Some(buckets) = self.flows[idx].buckets.take() {
            self.table.clear_slot(idx as u32 + 1, buckets);
        }
    }

    /// CoDel dequeue for one flow: pull candidates, judge their sojourn
    /// times, and drop or mark per the control law schedule.
    fn codel_dequeue(&mut self, idx: usize) -> Option<P> {
        let params = self.cparams;
        let mut vars = self.flows[idx].cvars;
        let mut stats = self.cstats;
        let now = codel::time_from_ns(self.clock.now_ns());

        let mut entry = match self.pull(idx) {
            Some(e) => e,
            None => {
                vars.dropping = false;
                self.flows[idx].cvars = vars;
                return None;
            }
        };
        let mut ok_to_drop = codel::should_drop(
            &mut vars,
            &params,
            &mut stats,
            now,
            entry.enqueue_time,
            entry.packet.wire_len(),
            self.backlog_total,
        );

        let mut out: Option<PacketEntry<P>>;
        if vars.dropping {
            if !ok_to_drop {
                /* sojourn time fell below target; leave dropping state */
                vars.dropping = false;
                out = Some(entry);
            } else {
                out = Some(entry);
                // a large backlog can demand several drops in one pass
                while vars.dropping && now >= vars.drop_next {
                    let Some(mut cur) = out.take() else { break };
                    vars.count = vars.count.wrapping_add(1);
                    codel::newton_step(&mut vars);
                    if params.ecn && cur.packet.set_ce() {
                        stats.ecn_mark += 1;
                        vars.drop_next =
                            codel::control_law(vars.drop_next, params.interval, vars.rec_inv_sqrt);
                        out = Some(cur);
                        break;
                    }
                    stats.drop_count += 1;
                    trace!(slot = idx, count = vars.count, "codel drop");
                    match self.pull(idx) {
                        Some(next) => {
                            ok_to_drop = codel::should_drop(
                                &mut vars,
                                &params,
                                &mut stats,
                                now,
                                next.enqueue_time,
                                next.packet.wire_len(),
                                self.backlog_total,
                            );
                            if !ok_to_drop {
                                vars.dropping = false;
                            } else {
                                vars.drop_next = codel::control_law(
                                    vars.drop_next,
                                    params.interval,
                                    vars.rec_inv_sqrt,
                                );
                            }
                            out = Some(next);
                        }
                        None => {
                            vars.dropping = false;
                            out = None;
                        }
                    }
                }
            }
        } else if ok_to_drop {
            if params.ecn && entry.packet.set_ce() {
                stats.ecn_mark += 1;
                out = Some(entry);
            } else {
                stats.drop_count += 1;
                trace!(slot = idx, "codel drop, entering dropping state");
                match self.pull(idx) {
                    Some(next) => {
                        let _ = codel::should_drop(
                            &mut vars,
                            &params,
                            &mut stats,
                            now,
                            next.enqueue_time,
                            next.packet.wire_len(),
                            self.backlog_total,
                        );
                        out = Some(next);
                    }
                    None => {
                        vars.first_above_time = 0;
                        out = None;
                    }
                }
            }
            vars.dropping = true;
            /* if this episode starts soon after the previous one ended,
             * resume near the drop rate that controlled the queue last time
             */
            let delta = vars.count.wrapping_sub(vars.lastcount);
            if delta > 1
                && (now as i64 - vars.drop_next as i64) < 16 * params.interval as i64
            {
                vars.count = delta;
                codel::newton_step(&mut vars);
            } else {
                vars.count = 1;
                vars.rec_inv_sqrt = u16::MAX;
            }
            vars.lastcount = vars.count;
            vars.drop_next = codel::control_law(now, params.interval, vars.rec_inv_sqrt);
        } else {
            out = Some(entry);
        }

        if let Some(e) = out.as_mut() {
            if vars.ldelay > params.ce_threshold && e.packet.set_ce() {
                stats.ce_mark += 1;
            }
        }
        self.flows[idx].cvars = vars;
        self.cstats = stats;
        out.map(|e| e.packet)
    }

    /// Release one packet, scanning the new-flows rotation ahead of the
    /// old-flows rotation in deficit round-robin order.
    pub fn dequeue(&mut self) -> Option<P> {
        if let Some(p) = self.cached.take() {
            return Some(p);
        }
        self.dequeue_inner()
    }

    fn dequeue_inner(&mut self) -> Option<P> {
        loop {
            let (slot, from_new) = match self.new_flows.pop_front() {
                Some(s) => (s, true),
                None => match self.old_flows.pop_front() {
                    Some(s) => (s, false),
                    None => return None,
                },
            };
            let idx = slot as usize;

            if self.flows[idx].deficit <= 0 {
                self.flows[idx].deficit += self.quantum as i32;
                self.flows[idx].rotation = Rotation::Old;
                self.old_flows.push_back(slot);
                continue;
            }

            let prev_drop = self.cstats.drop_count;
            let prev_ecn = self.cstats.ecn_mark;
            let packet = self.codel_dequeue(idx);
            self.flows[idx].dropped += (self.cstats.drop_count - prev_drop)
                + (self.cstats.ecn_mark - prev_ecn);

            match packet {
                None => {
                    /* force one pass through old flows to prevent
                     * starvation of flows already waiting there
                     */
                    if from_new && !self.old_flows.is_empty() {
                        self.flows[idx].rotation = Rotation::Old;
                        self.old_flows.push_back(slot);
                    } else {
                        self.flows[idx].rotation = Rotation::None;
                    }
                    if self.flows[idx].is_empty() {
                        self.release_slot(idx);
                    }
                    continue;
                }
                Some(packet) => {
                    self.flows[idx].deficit -= packet.wire_len() as i32;
                    // the flow keeps its place at the head of its rotation
                    if from_new {
                        self.new_flows.push_front(slot);
                    } else {
                        self.old_flows.push_front(slot);
                    }
                    if self.flows[idx].is_empty() {
                        self.release_slot(idx);
                    }
                    return Some(packet);
                }
            }
        }
    }

    /// Next packet without consuming it, held in a one-packet cache that
    /// the following `dequeue` drains first.
    pub fn peek(&mut self) -> Option<&P> {
        if self.cached.is_none() {
            self.cached = self.dequeue_inner();
        }
        self.cached.as_ref()
    }

    /// Apply a partial parameter update, then drain until the packet and
    /// memory limits hold again.
    ///
    /// # Errors
    /// [`Error::FlowCountFrozen`] when the update names `flows_cnt`; no
    /// other knob is touched in that case.
    pub fn configure(&mut self, update: ConfigUpdate) -> Result<(), Error> {
        if update.flows_cnt.is_some() {
            return Err(Error::FlowCountFrozen);
        }
        if let Some(us) = update.target_us {
            self.cparams.target = codel::time_from_us(us);
        }
        if let Some(us) = update.interval_us {
            self.cparams.interval = codel::time_from_us(us);
        }
        if let Some(us) = update.ce_threshold_us {
            self.cparams.ce_threshold = codel::time_from_us(us);
        }
        if let Some(v) = update.limit {
            self.limit = v;
        }
        if let Some(v) = update.ecn {
            self.cparams.ecn = v;
        }
        if let Some(v) = update.quantum {
            self.quantum = v.max(QUANTUM_MIN);
        }
        if let Some(v) = update.drop_batch_size {
            self.drop_batch_size = v.max(1);
        }
        if let Some(v) = update.memory_limit {
            self.memory_limit = v.min(MEMORY_LIMIT_MAX);
        }
        debug!(limit = self.limit, quantum = self.quantum, "configuration updated");

        let mut drained = 0u32;
        while self.qlen > self.limit || self.memory_usage > self.memory_limit {
            match self.dequeue() {
                Some(_) => drained += 1,
                None => break,
            }
        }
        if drained > 0 {
            trace!(drained, "post-configure drain");
        }
        Ok(())
    }

    /// Purge every queue and return to the post-initialisation state; only
    /// the hash seeds survive.
    pub fn reset(&mut self) {
        self.cached = None;
        for flow in &mut self.flows {
            flow.purge();
        }
        self.new_flows.clear();
        self.old_flows.clear();
        self.backlogs.fill(0);
        self.table.clear();
        self.empty_slots.fill();
        self.qlen = 0;
        self.backlog_total = 0;
        self.memory_usage = 0;
        self.cstats = CodelStats::default();
        self.drop_overlimit = 0;
        self.drop_overmemory = 0;
        self.drop_bypass = 0;
        self.new_flow_count = 0;
        debug!("scheduler reset");
    }

    /// Copy the counters out.
    pub fn snapshot(&self) -> QdiscStats {
        QdiscStats {
            qlen: self.qlen,
            backlog: self.backlog_total,
            memory_usage: self.memory_usage,
            maxpacket: self.cstats.maxpacket,
            drop_codel: self.cstats.drop_count,
            drop_overlimit: self.drop_overlimit,
            drop_overmemory: self.drop_overmemory,
            drop_bypass: self.drop_bypass,
            ecn_mark: self.cstats.ecn_mark,
            ce_mark: self.cstats.ce_mark,
            new_flow_count: self.new_flow_count,
            new_flows_len: self.new_flows.len() as u32,
            old_flows_len: self.old_flows.len() as u32,
        }
    }

    /// Effective configuration, times converted back to microseconds.
    pub fn config(&self) -> FqCodelConfig {
        FqCodelConfig {
            flows_cnt: self.flows_cnt,
            limit: self.limit,
            memory_limit: self.memory_limit,
            quantum: self.quantum,
            drop_batch_size: self.drop_batch_size,
            mtu: self.cparams.mtu,
            target_us: codel::time_to_us(self.cparams.target),
            interval_us: codel::time_to_us(self.cparams.interval),
            ce_threshold_us: if self.cparams.ce_threshold == codel::CE_THRESHOLD_DISABLED {
                None
            } else {
                Some(codel::time_to_us(self.cparams.ce_threshold))
            },
            ecn: self.cparams.ecn,
            hash_seeds: Some(self.table.seeds()),
        }
    }

    /// Per-flow state for slot `slot` (0-based), if the slot exists.
    pub fn flow_stats(&self, slot: u32) -> Option<FlowStats> {
        let flow = self.flows.get(slot as usize)?;
        let drop_next_us = if flow.cvars.dropping {
            let now = codel::time_from_ns(self.clock.now_ns());
            let delta_ticks = flow.cvars.drop_next as i64 - now as i64;
            Some((delta_ticks << codel::CODEL_SHIFT) / 1_000)
        } else {
            None
        };
        Some(FlowStats {
            qlen: flow.len() as u32,
            backlog: self.backlogs[slot as usize],
            deficit: flow.deficit,
            dropped: flow.dropped,
            ldelay_us: codel::time_to_us(flow.cvars.ldelay),
            count: flow.cvars.count,
            lastcount: flow.cvars.lastcount,
            dropping: flow.cvars.dropping,
            drop_next_us,
        })
    }

    /// Visit every active flow (linked on a rotation) with its slot id and
    /// state. The visitor returns `false` to stop early.
    pub fn walk<F>(&self, mut visitor: F)
    where
        F: FnMut(u32, &FlowStats) -> bool,
    {
        for slot in 0..self.flows_cnt {
            if self.flows[slot as usize].rotation == Rotation::None {
                continue;
            }
            let stats = match self.flow_stats(slot) {
                Some(s) => s,
                None => continue,
            };
            if !visitor(slot, &stats) {
                break;
            }
        }
    }
}
