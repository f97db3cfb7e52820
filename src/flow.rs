//! Per-flow record: the packet FIFO, the deficit counter, the CoDel control
//! block, and the rotation-list membership sentinel.

use std::collections::VecDeque;

use crate::codel::{CodelTime, CodelVars};
use crate::packet::Packet;

/// Which round-robin rotation a flow is currently linked on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Rotation {
    /// Linked on neither list; the idle state.
    #[default]
    None,
    /// On the new-flows list, serviced ahead of established flows.
    New,
    /// On the old-flows list.
    Old,
}

/// A queued packet plus the control block captured at enqueue time.
#[derive(Debug)]
pub struct PacketEntry<P> {
    pub packet: P,
    /// CoDel tick at which the packet entered the scheduler.
    pub enqueue_time: CodelTime,
    /// Memory footprint charged when the packet was admitted, released
    /// verbatim so accounting stays exact even if the packet changes.
    pub mem: u32,
}

/// One slot of the flow table.
#[derive(Debug)]
pub struct Flow<P> {
    queue: VecDeque<PacketEntry<P>>,
    /// Byte credit left in the current DRR round; may go negative.
    pub deficit: i32,
    /// Drops and ECN marks charged to this flow since it last went active.
    pub dropped: u32,
    pub rotation: Rotation,
    pub cvars: CodelVars,
    /// Cuckoo buckets recorded when the flow identity was (re)established,
    /// used to clear the hash table when the flow empties.
    pub buckets: Option<[u32; 2]>,
}

impl<P: Packet> Flow<P> {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            deficit: 0,
            dropped: 0,
            rotation: Rotation::None,
            cvars: CodelVars::default(),
            buckets: None,
        }
    }

    pub fn push(&mut self, entry: PacketEntry<P>) {
        self.queue.push_back(entry);
    }

    pub fn pop(&mut self) -> Option<PacketEntry<P>> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Flow hash of the packet at the head of the FIFO, the identity proxy
    /// used by the classifier.
    pub fn head_hash(&self) -> Option<u32> {
        self.queue.front().map(|e| e.packet.flow_hash())
    }

    pub fn head_packet(&self) -> Option<&P> {
        self.queue.front().map(|e| &e.packet)
    }

    /// Discard all packets and return to the post-initialisation state.
    pub fn purge(&mut self) {
        self.queue.clear();
        self.deficit = 0;
        self.dropped = 0;
        self.rotation = Rotation::None;
        self.cvars.init();
        self.buckets = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::SimPacket;

    fn entry(flow: u64, len: u32) -> PacketEntry<SimPacket> {
        PacketEntry {
            packet: SimPacket::new(flow, len),
            enqueue_time: 0,
            mem: len,
        }
    }

    #[test]
    fn fifo_order_is_preserved() {
        let mut flow = Flow::new();
        flow.push(entry(1, 100));
        flow.push(entry(1, 200));
        flow.push(entry(1, 300));
        assert_eq!(flow.len(), 3);
        assert_eq!(flow.pop().unwrap().packet.wire_len(), 100);
        assert_eq!(flow.pop().unwrap().packet.wire_len(), 200);
        assert_eq!(flow.pop().unwrap().packet.wire_len(), 300);
        assert!(flow.pop().is_none());
        assert!(flow.is_empty());
    }

    #[test]
    fn head_hash_matches_front_packet() {
        let mut flow = Flow::new();
        assert_eq!(flow.head_hash(), None);
        flow.push(entry(9, 100));
        flow.push(entry(5, 100));
        assert_eq!(flow.head_hash(), Some(SimPacket::new(9, 1).flow_hash()));
    }

    #[test]
    fn purge_restores_initial_state() {
        let mut flow = Flow::new();
        flow.push(entry(1, 100));
        flow.deficit = -42;
        flow.dropped = 3;
        flow.rotation = Rotation::Old;
        flow.buckets = Some([1, 2]);
        flow.cvars.count = 9;
        flow.purge();
        assert!(flow.is_empty());
        assert_eq!(flow.deficit, 0);
        assert_eq!(flow.dropped, 0);
        assert_eq!(flow.rotation, Rotation::None);
        assert_eq!(flow.buckets, None);
        assert_eq!(flow.cvars, CodelVars::default());
    }
}
