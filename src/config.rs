//! Scheduler knobs: the construction-time configuration and the
//! attribute-bundle style runtime update.

use serde::{Deserialize, Serialize};

/// Default total packet capacity.
pub const DEFAULT_LIMIT: u32 = 10 * 1024;
/// Default number of flow records.
pub const DEFAULT_FLOWS: u32 = 1024;
/// Default memory ceiling: 32 MiB.
pub const DEFAULT_MEMORY_LIMIT: u32 = 32 << 20;
/// Default packets shed per overflow event.
pub const DEFAULT_DROP_BATCH: u32 = 64;
/// Ethernet MTU plus header, the default quantum.
pub const DEFAULT_MTU: u32 = 1514;

/// Hard ceiling on `memory_limit`.
pub const MEMORY_LIMIT_MAX: u32 = 1 << 31;
/// Floor on the per-round byte quantum.
pub const QUANTUM_MIN: u32 = 256;

/// Full configuration applied when the scheduler is built.
///
/// `flows_cnt` is write-once; every other knob can be adjusted later via
/// [`ConfigUpdate`]. Values outside their allowed range are clamped the
/// same way on both paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FqCodelConfig {
    /// Number of flow records, `1..=65536`. Fixed after construction.
    pub flows_cnt: u32,
    /// Total packet capacity.
    pub limit: u32,
    /// Total bytes of packet memory, clamped to [`MEMORY_LIMIT_MAX`].
    pub memory_limit: u32,
    /// Byte credit per DRR round, clamped to at least [`QUANTUM_MIN`].
    pub quantum: u32,
    /// Packets shed per overflow event, at least 1.
    pub drop_batch_size: u32,
    /// Device MTU; backlogs at or below it never trigger CoDel.
    pub mtu: u32,
    /// CoDel target sojourn, microseconds.
    pub target_us: u32,
    /// CoDel interval, microseconds.
    pub interval_us: u32,
    /// CE-mark threshold, microseconds; `None` disables it.
    pub ce_threshold_us: Option<u32>,
    /// Mark ECT packets instead of dropping.
    pub ecn: bool,
    /// Per-table hash seeds; `None` draws random ones at construction.
    pub hash_seeds: Option<[u32; 2]>,
}

impl Default for FqCodelConfig {
    fn default() -> Self {
        Self {
            flows_cnt: DEFAULT_FLOWS,
            limit: DEFAULT_LIMIT,
            memory_limit: DEFAULT_MEMORY_LIMIT,
            quantum: DEFAULT_MTU,
            drop_batch_size: DEFAULT_DROP_BATCH,
            mtu: DEFAULT_MTU,
            target_us: 5_000,
            interval_us: 100_000,
            ce_threshold_us: None,
            ecn: true,
            hash_seeds: None,
        }
    }
}

/// Partial update applied through the control surface. `None` fields keep
/// their current value, mirroring an attribute bundle where absent
/// attributes leave knobs untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub target_us: Option<u32>,
    pub interval_us: Option<u32>,
    pub ce_threshold_us: Option<u32>,
    pub limit: Option<u32>,
    pub ecn: Option<bool>,
    pub quantum: Option<u32>,
    pub drop_batch_size: Option<u32>,
    pub memory_limit: Option<u32>,
    /// Always rejected: the flow table cannot be resized.
    pub flows_cnt: Option<u32>,
}

impl ConfigUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = FqCodelConfig::default();
        assert_eq!(config.flows_cnt, 1024);
        assert_eq!(config.limit, 10_240);
        assert_eq!(config.memory_limit, 32 << 20);
        assert_eq!(config.drop_batch_size, 64);
        assert_eq!(config.quantum, config.mtu);
        assert!(config.ecn);
        assert_eq!(config.ce_threshold_us, None);
    }

    #[test]
    fn empty_update_detected() {
        assert!(ConfigUpdate::default().is_empty());
        let update = ConfigUpdate {
            quantum: Some(300),
            ..Default::default()
        };
        assert!(!update.is_empty());
    }
}
