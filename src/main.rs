// Traffic simulator binary: a generator thread feeds synthetic flows into
// the scheduler through a bounded channel while the main thread drains it
// at a paced link rate, printing periodic statistics snapshots.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;
use parking_lot::Mutex;
use tracing::info;

use fqcodel::{EnqueueStatus, FqCodelConfig, FqCodelQueue, Packet, SimPacket};

/// Command-line options parsed from program arguments.
struct CliOptions {
    /// Number of concurrent simulated flows.
    flows: u64,
    /// Egress link rate in megabits per second.
    rate_mbps: u64,
    /// Simulation duration in seconds.
    seconds: u64,
}

fn parse_cli_options() -> CliOptions {
    let mut options = CliOptions {
        flows: 16,
        rate_mbps: 100,
        seconds: 5,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let (key, value) = match arg.split_once('=') {
            Some((k, v)) => (k.to_string(), Some(v.to_string())),
            None => (arg, args.next()),
        };
        let Some(value) = value else { continue };
        match key.as_str() {
            "--flows" => options.flows = value.parse().unwrap_or(options.flows),
            "--rate-mbps" => options.rate_mbps = value.parse().unwrap_or(options.rate_mbps),
            "--seconds" => options.seconds = value.parse().unwrap_or(options.seconds),
            _ => {}
        }
    }
    options
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let options = parse_cli_options();
    info!(
        flows = options.flows,
        rate_mbps = options.rate_mbps,
        seconds = options.seconds,
        "starting fq_codel simulation"
    );

    let sched = Arc::new(Mutex::new(
        FqCodelQueue::<SimPacket>::new(FqCodelConfig::default())
            .expect("default configuration is valid"),
    ));

    let (tx, rx) = bounded::<SimPacket>(1024);
    let deadline = Instant::now() + Duration::from_secs(options.seconds);

    // Generator: a handful of heavy flows plus a rotating tail of light
    // ones, so the fair-queueing behaviour is visible in the stats.
    let generator = {
        let flows = options.flows.max(1);
        thread::spawn(move || {
            let mut seq = 0u64;
            while Instant::now() < deadline {
                let flow = if seq % 4 == 0 { seq % flows } else { seq % 2 };
                let len = if flow < 2 { 1400 } else { 200 };
                let packet = SimPacket::new(flow, len).ect();
                if tx.send(packet).is_err() {
                    break;
                }
                seq += 1;
                if seq % 64 == 0 {
                    thread::sleep(Duration::from_micros(200));
                }
            }
        })
    };

    // Drain loop: admit whatever the generator produced, then release
    // packets at the configured link rate using a byte budget.
    let bytes_per_sec = options.rate_mbps as f64 * 1_000_000.0 / 8.0;
    let mut budget = 0f64;
    let mut last = Instant::now();
    let mut last_report = Instant::now();
    let mut sent_packets = 0u64;
    let mut sent_bytes = 0u64;
    let mut congestion_signals = 0u64;

    while Instant::now() < deadline || !rx.is_empty() {
        let mut sched = sched.lock();
        for packet in rx.try_iter().take(256) {
            if sched.enqueue(packet) == EnqueueStatus::Congested {
                congestion_signals += 1;
            }
        }

        let now = Instant::now();
        budget += now.duration_since(last).as_secs_f64() * bytes_per_sec;
        last = now;
        while let Some(head) = sched.peek() {
            let len = head.wire_len() as f64;
            if budget < len {
                break;
            }
            let packet = sched.dequeue().expect("peeked packet is cached");
            budget -= packet.wire_len() as f64;
            sent_packets += 1;
            sent_bytes += packet.wire_len() as u64;
        }

        if last_report.elapsed() >= Duration::from_secs(1) {
            let stats = sched.snapshot();
            info!(
                qlen = stats.qlen,
                backlog = stats.backlog,
                drop_codel = stats.drop_codel,
                drop_overlimit = stats.drop_overlimit,
                ecn_mark = stats.ecn_mark,
                new_flow_count = stats.new_flow_count,
                sent_packets,
                congestion_signals,
                "snapshot"
            );
            last_report = Instant::now();
        }
        drop(sched);
        thread::sleep(Duration::from_micros(500));
    }

    generator.join().expect("generator thread panicked");

    let mut sched = sched.lock();
    while sched.dequeue().is_some() {
        sent_packets += 1;
    }
    let stats = sched.snapshot();
    info!(
        sent_packets,
        sent_bytes,
        drop_codel = stats.drop_codel,
        drop_overlimit = stats.drop_overlimit,
        drop_overmemory = stats.drop_overmemory,
        ecn_mark = stats.ecn_mark,
        ce_mark = stats.ce_mark,
        max_packet = stats.maxpacket,
        new_flow_count = stats.new_flow_count,
        "simulation finished"
    );
}
