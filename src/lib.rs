//! Fair Queue CoDel packet scheduler with a cuckoo-hashed flow table.
//!
//! Packets entering [`FqCodelQueue::enqueue`] are classified onto per-flow
//! FIFOs by a two-table cuckoo hash backed by a two-level free-slot bitmap,
//! so distinct flows get distinct queues until the table genuinely runs
//! out. [`FqCodelQueue::dequeue`] services flows in deficit round-robin
//! order with new flows prioritised over established ones, and runs each
//! candidate packet through a per-flow CoDel controller that drops or
//! ECN-marks once sojourn times stay above target for a full interval.
//! Overflow sheds a batch from the flow with the fattest backlog.
//!
//! The scheduler is a passive, single-threaded structure; wrap it in a
//! mutex to share it, which also serialises control-plane operations
//! ([`FqCodelQueue::configure`], [`FqCodelQueue::reset`], snapshots and
//! walks) against the packet path.

pub mod classify;
pub mod clock;
pub mod codel;
pub mod config;
pub mod error;
pub mod flow;
pub mod packet;
pub mod sched;
pub mod slots;
pub mod stats;

pub use classify::{FilterVerdict, FlowFilter};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{ConfigUpdate, FqCodelConfig};
pub use error::Error;
pub use packet::{Packet, SimPacket};
pub use sched::{EnqueueStatus, FqCodelQueue};
pub use stats::{FlowStats, QdiscStats};
