use std::time::Duration;

use fqcodel::codel::{self, CodelVars};
use fqcodel::{FqCodelConfig, FqCodelQueue, ManualClock, SimPacket};

fn sched(
    clock: &ManualClock,
    ecn: bool,
    ce_threshold_us: Option<u32>,
) -> FqCodelQueue<SimPacket> {
    let config = FqCodelConfig {
        flows_cnt: 4,
        limit: 1024,
        quantum: 1_000_000,
        target_us: 5_000,
        interval_us: 100_000,
        ecn,
        ce_threshold_us,
        hash_seeds: Some([1, 2]),
        ..Default::default()
    };
    FqCodelQueue::with_clock(config, Box::new(clock.clone())).unwrap()
}

#[test]
fn codel_escalates_drops_on_standing_queue() {
    let clock = ManualClock::new();
    let mut q = sched(&clock, false, None);

    for _ in 0..50 {
        q.enqueue(SimPacket::new(1, 1000));
    }
    clock.advance(Duration::from_millis(20));

    // sojourn above target arms the interval timer; nothing drops yet
    assert!(q.dequeue().is_some());
    assert_eq!(q.snapshot().drop_codel, 0);
    let fs = q.flow_stats(0).unwrap();
    assert!(!fs.dropping);
    assert!(fs.ldelay_us >= 19_990);

    // still within the interval
    clock.advance(Duration::from_millis(50));
    assert!(q.dequeue().is_some());
    assert_eq!(q.snapshot().drop_codel, 0);

    // a full interval above target: dropping begins with one drop
    clock.advance(Duration::from_millis(50));
    assert!(q.dequeue().is_some());
    assert_eq!(q.snapshot().drop_codel, 1);
    let fs = q.flow_stats(0).unwrap();
    assert!(fs.dropping);
    assert_eq!(fs.count, 1);

    // each crossing of drop_next sheds exactly one more packet, and the
    // published schedule replays the interval / sqrt(count) control law
    let interval = codel::time_from_us(100_000);
    let mut replica = CodelVars {
        count: 1,
        lastcount: 1,
        rec_inv_sqrt: u16::MAX,
        ..Default::default()
    };
    for k in 2..=8u32 {
        let fs = q.flow_stats(0).unwrap();
        let wait = fs.drop_next_us.expect("dropping flow publishes drop_next");
        assert!(wait > 0);
        let inc_ticks = codel::control_law(0, interval, replica.rec_inv_sqrt) as i64;
        let inc_us = (inc_ticks << codel::CODEL_SHIFT) / 1_000;
        assert!(
            (wait - inc_us).abs() <= 25,
            "schedule diverged at count {k}: wait {wait}, expected {inc_us}"
        );

        clock.advance(Duration::from_micros(wait as u64 + 10));
        assert!(q.dequeue().is_some());
        assert_eq!(q.snapshot().drop_codel, k);
        let fs = q.flow_stats(0).unwrap();
        assert_eq!(fs.count, k);

        replica.count = k;
        codel::newton_step(&mut replica);
    }
}

#[test]
fn drop_rate_carries_over_between_close_episodes() {
    let clock = ManualClock::new();
    let mut q = sched(&clock, false, None);

    for _ in 0..40 {
        q.enqueue(SimPacket::new(1, 1000));
    }
    clock.advance(Duration::from_millis(20));
    assert!(q.dequeue().is_some()); // arms the interval
    clock.advance(Duration::from_millis(100));
    assert!(q.dequeue().is_some()); // first drop, count = 1
    clock.advance(Duration::from_millis(100));
    assert!(q.dequeue().is_some()); // count = 2
    clock.advance(Duration::from_millis(51));
    assert!(q.dequeue().is_some()); // count = 3
    assert_eq!(q.flow_stats(0).unwrap().count, 3);

    // drain the rest; the flow retires with its control state intact
    while q.dequeue().is_some() {}
    assert_eq!(q.qlen(), 0);

    // a new burst soon after: the controller resumes near the drop rate
    // that controlled the queue last time instead of restarting at 1
    for _ in 0..30 {
        q.enqueue(SimPacket::new(1, 1000));
    }
    clock.advance(Duration::from_millis(20));
    let drops_before = q.snapshot().drop_codel;
    assert!(q.dequeue().is_some());
    assert_eq!(q.snapshot().drop_codel, drops_before + 1);
    assert_eq!(q.flow_stats(0).unwrap().count, 2);
}

#[test]
fn ecn_capable_packets_are_marked_not_dropped() {
    let clock = ManualClock::new();
    let mut q = sched(&clock, true, None);

    for _ in 0..30 {
        q.enqueue(SimPacket::new(1, 1000).ect());
    }
    clock.advance(Duration::from_millis(20));
    assert!(!q.dequeue().unwrap().ce_marked());
    clock.advance(Duration::from_millis(110));

    // where a drop would happen, the ECT packet is CE-marked and delivered
    let packet = q.dequeue().unwrap();
    assert!(packet.ce_marked());
    let stats = q.snapshot();
    assert_eq!(stats.ecn_mark, 1);
    assert_eq!(stats.drop_codel, 0);
    assert_eq!(q.qlen(), 28);
    // the mark is charged to the flow like a drop
    assert_eq!(q.flow_stats(0).unwrap().dropped, 1);
}

#[test]
fn ce_threshold_marks_below_target() {
    let clock = ManualClock::new();
    let mut q = sched(&clock, true, Some(1_000));

    for _ in 0..3 {
        q.enqueue(SimPacket::new(1, 1400).ect());
    }
    // 2 ms sojourn: below target, above the CE threshold
    clock.advance(Duration::from_millis(2));
    let packet = q.dequeue().unwrap();
    assert!(packet.ce_marked());
    let stats = q.snapshot();
    assert_eq!(stats.ce_mark, 1);
    assert_eq!(stats.ecn_mark, 0);
    assert_eq!(stats.drop_codel, 0);
    assert!(!q.flow_stats(0).unwrap().dropping);
}

#[test]
fn single_packet_backlog_never_drops() {
    let clock = ManualClock::new();
    let mut q = sched(&clock, false, None);

    q.enqueue(SimPacket::new(1, 500));
    clock.advance(Duration::from_secs(10));
    assert!(q.dequeue().is_some());
    assert_eq!(q.snapshot().drop_codel, 0);
}

#[test]
fn dropping_state_exits_when_delay_recovers() {
    let clock = ManualClock::new();
    let mut q = sched(&clock, false, None);

    for _ in 0..30 {
        q.enqueue(SimPacket::new(1, 1000));
    }
    clock.advance(Duration::from_millis(20));
    assert!(q.dequeue().is_some());
    clock.advance(Duration::from_millis(100));
    assert!(q.dequeue().is_some());
    assert!(q.flow_stats(0).unwrap().dropping);

    // fresh low-delay packets pull the flow back out of the dropping state
    for _ in 0..5 {
        q.enqueue(SimPacket::new(1, 1000));
    }
    while q.qlen() > 5 {
        q.dequeue();
    }
    let drops = q.snapshot().drop_codel;
    assert!(q.dequeue().is_some());
    assert!(!q.flow_stats(0).unwrap().dropping);
    assert_eq!(q.snapshot().drop_codel, drops);
}
