//! Statistics snapshots exposed by the control surface.

use serde::Serialize;

/// Scheduler-wide counters, copied out under the instance lock so readers
/// get a consistent view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QdiscStats {
    /// Packets currently queued.
    pub qlen: u32,
    /// Bytes currently queued.
    pub backlog: u32,
    /// Packet memory currently charged.
    pub memory_usage: u32,
    /// Largest packet observed by the CoDel controller.
    pub maxpacket: u32,
    /// Packets dropped by the CoDel controller.
    pub drop_codel: u32,
    /// Packets shed by the fat-flow policy on overflow.
    pub drop_overlimit: u32,
    /// Subset of `drop_overlimit` shed while over the memory limit.
    pub drop_overmemory: u32,
    /// Packets discarded because classification produced no flow.
    pub drop_bypass: u32,
    /// Packets ECN-marked instead of dropped.
    pub ecn_mark: u32,
    /// Packets CE-marked by the `ce_threshold` path.
    pub ce_mark: u32,
    /// Times a flow entered the new-flows rotation.
    pub new_flow_count: u32,
    /// Current length of the new-flows rotation.
    pub new_flows_len: u32,
    /// Current length of the old-flows rotation.
    pub old_flows_len: u32,
}

/// Per-flow view yielded by `flow_stats` and `walk`.
#[derive(Debug, Clone, Serialize)]
pub struct FlowStats {
    /// Packets queued in this flow.
    pub qlen: u32,
    /// Bytes queued in this flow.
    pub backlog: u32,
    /// Remaining byte credit in the current round.
    pub deficit: i32,
    /// Drops and marks charged since the flow went active.
    pub dropped: u32,
    /// Sojourn time of the most recently evaluated packet, microseconds.
    pub ldelay_us: u32,
    /// CoDel drop count within the current episode.
    pub count: u32,
    /// CoDel count when the previous episode ended.
    pub lastcount: u32,
    /// Whether the flow is in the dropping state.
    pub dropping: bool,
    /// Microseconds until the next scheduled drop (negative if overdue);
    /// `None` when not dropping.
    pub drop_next_us: Option<i64>,
}
