//! Error surface of the control plane. Data-plane anomalies (drops, filter
//! rejections, empty queues) are never errors; they show up in counters and
//! return codes instead.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// `flows_cnt` is outside the supported `[1, 65536]` range.
    #[error("flow count must be between 1 and 65536, got {0}")]
    InvalidFlowCount(u32),

    /// The flow table size is fixed once the scheduler has been built.
    #[error("flow count cannot be changed after initialisation")]
    FlowCountFrozen,
}
