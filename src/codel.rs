//! CoDel controller primitives: the fixed-point time convention, per-flow
//! state variables, and the reciprocal-square-root drop schedule.
//!
//! Times are kept in ticks of 2^10 ns so that the drop cadence
//! `interval / sqrt(count)` can be evaluated with the classic 16-bit
//! reciprocal-square-root Newton iteration instead of a divide on the
//! dequeue path. External knobs are microseconds; [`time_from_us`] and
//! [`time_to_us`] convert at the control surface.

/// Time unit is 2^10 nanoseconds.
pub const CODEL_SHIFT: u32 = 10;

const NSEC_PER_USEC: u64 = 1_000;
const REC_INV_SQRT_BITS: u32 = 16;
const REC_INV_SQRT_SHIFT: u32 = 32 - REC_INV_SQRT_BITS;

/// Monotonic time in CoDel ticks.
pub type CodelTime = u64;

/// Sentinel for a disabled `ce_threshold`: no sojourn ever exceeds it.
pub const CE_THRESHOLD_DISABLED: CodelTime = CodelTime::MAX;

pub fn time_from_us(us: u32) -> CodelTime {
    (us as u64 * NSEC_PER_USEC) >> CODEL_SHIFT
}

pub fn time_to_us(t: CodelTime) -> u32 {
    ((t << CODEL_SHIFT) / NSEC_PER_USEC) as u32
}

pub fn time_from_ns(ns: u64) -> CodelTime {
    ns >> CODEL_SHIFT
}

/// Knobs shared by every flow of one scheduler instance.
#[derive(Debug, Clone, Copy)]
pub struct CodelParams {
    /// Acceptable standing sojourn time.
    pub target: CodelTime,
    /// Sliding window over which the standing delay is measured.
    pub interval: CodelTime,
    /// Sojourn above which returned packets get a CE mark, independent of
    /// the drop machine. [`CE_THRESHOLD_DISABLED`] turns this off.
    pub ce_threshold: CodelTime,
    /// Device MTU; a backlog at or below this never triggers the controller.
    pub mtu: u32,
    /// Mark ECT packets instead of dropping them.
    pub ecn: bool,
}

impl CodelParams {
    /// Defaults: 5 ms target, 100 ms interval, ECN on, CE threshold off.
    pub fn new(mtu: u32) -> Self {
        Self {
            target: time_from_us(5_000),
            interval: time_from_us(100_000),
            ce_threshold: CE_THRESHOLD_DISABLED,
            mtu,
            ecn: true,
        }
    }
}

/// Per-flow controller state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodelVars {
    /// Drops since entering the current dropping episode.
    pub count: u32,
    /// `count` value when the previous episode ended.
    pub lastcount: u32,
    /// Whether the flow is in the dropping state.
    pub dropping: bool,
    /// 16-bit fixed-point reciprocal square root of `count`.
    pub rec_inv_sqrt: u16,
    /// When the sojourn first stayed above target; 0 when below.
    pub first_above_time: CodelTime,
    /// Scheduled time of the next drop while dropping.
    pub drop_next: CodelTime,
    /// Sojourn time of the most recently evaluated packet.
    pub ldelay: CodelTime,
}

impl CodelVars {
    pub fn init(&mut self) {
        *self = Self::default();
    }
}

/// Marks and drops accumulated across all flows of one scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodelStats {
    /// Largest packet seen, used when judging standing queues.
    pub maxpacket: u32,
    /// Packets dropped by the controller.
    pub drop_count: u32,
    /// Packets ECN-marked instead of dropped.
    pub ecn_mark: u32,
    /// Packets CE-marked by the `ce_threshold` path.
    pub ce_mark: u32,
}

/// One Newton iteration refining `rec_inv_sqrt` towards `1/sqrt(count)`.
///
/// new_invsqrt = invsqrt * (3 - count * invsqrt^2) / 2, all in 0.32
/// fixed point with the final shift folded in.
pub fn newton_step(vars: &mut CodelVars) {
    let invsqrt = (vars.rec_inv_sqrt as u32) << REC_INV_SQRT_SHIFT;
    let invsqrt2 = ((invsqrt as u64 * invsqrt as u64) >> 32) as u32;
    let mut val = (3u64 << 32).wrapping_sub(vars.count as u64 * invsqrt2 as u64);

    val >>= 2; /* avoid overflow in the following multiply */
    val = (val.wrapping_mul(invsqrt as u64)) >> (32 - 2 + 1);

    vars.rec_inv_sqrt = (val >> REC_INV_SQRT_SHIFT) as u16;
}

/// Next drop time: `t + interval / sqrt(count)` via reciprocal multiply.
pub fn control_law(t: CodelTime, interval: CodelTime, rec_inv_sqrt: u16) -> CodelTime {
    t + reciprocal_divide(interval, (rec_inv_sqrt as u32) << REC_INV_SQRT_SHIFT)
}

fn reciprocal_divide(a: CodelTime, r: u32) -> CodelTime {
    ((a as u128 * r as u128) >> 32) as u64
}

/// Evaluate one candidate packet's sojourn time.
///
/// Returns `true` once the flow has stayed above `target` for a full
/// `interval` with more than an MTU of total backlog behind it. Mutates
/// `first_above_time` tracking as a side effect.
#[allow(clippy::too_many_arguments)]
pub fn should_drop(
    vars: &mut CodelVars,
    params: &CodelParams,
    stats: &mut CodelStats,
    now: CodelTime,
    enqueue_time: CodelTime,
    pkt_len: u32,
    backlog: u32,
) -> bool {
    vars.ldelay = now.saturating_sub(enqueue_time);

    if pkt_len > stats.maxpacket {
        stats.maxpacket = pkt_len;
    }

    if vars.ldelay < params.target || backlog <= params.mtu {
        /* went below target - stay below for at least one interval */
        vars.first_above_time = 0;
        return false;
    }
    if vars.first_above_time == 0 {
        /* just went above from below; if we stay above for a full
         * interval it becomes ok to drop
         */
        vars.first_above_time = now + params.interval;
        false
    } else {
        now >= vars.first_above_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn microsecond_round_trip() {
        for us in [0u32, 1, 5_000, 100_000, 1_000_000] {
            let t = time_from_us(us);
            // the >>10 scaling loses at most 1.024 us per conversion
            assert!(time_to_us(t) <= us);
            assert!(us - time_to_us(t) <= 2);
        }
    }

    #[test]
    fn newton_tracks_inverse_sqrt() {
        let mut vars = CodelVars {
            count: 1,
            rec_inv_sqrt: u16::MAX,
            ..Default::default()
        };
        for count in 2..=100u32 {
            vars.count = count;
            newton_step(&mut vars);
        }
        let got = vars.rec_inv_sqrt as f64 / u16::MAX as f64;
        let want = 1.0 / (100f64).sqrt();
        assert!((got - want).abs() < 0.01, "got {got}, want {want}");
    }

    #[test]
    fn control_law_shrinks_with_count() {
        let interval = time_from_us(100_000);
        let mut vars = CodelVars {
            count: 1,
            rec_inv_sqrt: u16::MAX,
            ..Default::default()
        };
        let full = control_law(0, interval, vars.rec_inv_sqrt);
        assert!(interval - full <= 2);

        vars.count = 4;
        newton_step(&mut vars);
        newton_step(&mut vars);
        newton_step(&mut vars);
        let quarter = control_law(0, interval, vars.rec_inv_sqrt);
        let want = interval / 2;
        let err = quarter.abs_diff(want);
        assert!(err * 50 < interval, "interval/sqrt(4) off: {quarter} vs {want}");
    }

    #[test]
    fn should_drop_waits_a_full_interval() {
        let params = CodelParams::new(1500);
        let mut vars = CodelVars::default();
        let mut stats = CodelStats::default();
        let start = time_from_us(1_000_000);
        let sojourn = params.target + 1;

        // above target: arms first_above_time but does not drop yet
        assert!(!should_drop(
            &mut vars, &params, &mut stats, start, start - sojourn, 1000, 10_000
        ));
        assert_eq!(vars.first_above_time, start + params.interval);

        // still within the interval
        let now = start + params.interval - 1;
        assert!(!should_drop(
            &mut vars, &params, &mut stats, now, now - sojourn, 1000, 10_000
        ));

        // a full interval above target
        let now = start + params.interval;
        assert!(should_drop(
            &mut vars, &params, &mut stats, now, now - sojourn, 1000, 10_000
        ));

        // dipping below target resets the tracking
        assert!(!should_drop(
            &mut vars, &params, &mut stats, now, now, 1000, 10_000
        ));
        assert_eq!(vars.first_above_time, 0);
    }

    #[test]
    fn small_backlog_never_drops() {
        let params = CodelParams::new(1500);
        let mut vars = CodelVars::default();
        let mut stats = CodelStats::default();
        let now = time_from_us(10_000_000);
        // way above target but only one MTU queued
        assert!(!should_drop(
            &mut vars, &params, &mut stats, now, 0, 1000, 1500
        ));
        assert_eq!(vars.first_above_time, 0);
    }

    #[test]
    fn maxpacket_tracks_largest() {
        let params = CodelParams::new(1500);
        let mut vars = CodelVars::default();
        let mut stats = CodelStats::default();
        should_drop(&mut vars, &params, &mut stats, 0, 0, 900, 10_000);
        should_drop(&mut vars, &params, &mut stats, 0, 0, 1400, 10_000);
        should_drop(&mut vars, &params, &mut stats, 0, 0, 700, 10_000);
        assert_eq!(stats.maxpacket, 1400);
    }
}
