//! End-to-end scenarios driving the full pipeline: wire in, pulses and
//! reports out.

use millrun_host::inputs::INPUT_PROBE;
use motion::PLANNER_BUFFER_POOL_SIZE;
use sim::SimMachine;

/// Square + return: four fully planned blocks, corner slowdowns, exact
/// return to origin.
#[test]
fn square_and_return() {
    let mut sim = SimMachine::default();
    sim.send("G90 G21 F600");
    sim.send("G1 X10 Y0");
    sim.send("G1 X10 Y10");
    sim.send("G1 X0 Y10");
    sim.send("G1 X0 Y0");
    sim.run_until_idle(30_000);

    assert!((sim.position(0)).abs() < 0.01, "x = {}", sim.position(0));
    assert!((sim.position(1)).abs() < 0.01, "y = {}", sim.position(1));
    assert_eq!(sim.stat(), "program-stop");
    // four blocks went through the queue
    assert!(sim.machine.planner.queue.buffers_added >= 4);
    // every response acknowledged ok
    assert_eq!(sim.last_response_status(), Some(0));
}

/// Tiny arc: a half circle of r=5 under chord tolerance emits at least a
/// hundred segments, and the endpoint is exact.
#[test]
fn small_arc_chord_density() {
    let mut sim = SimMachine::default();
    sim.send("G0 X10");
    sim.run_until_idle(10_000);
    let blocks_before = sim.machine.planner.queue.buffers_added;

    sim.send("G17 G2 X0 Y0 I-5 J0 F1200");
    sim.run_until_idle(60_000);

    let segments = sim.machine.planner.queue.buffers_added - blocks_before;
    assert!(segments >= 100, "only {segments} arc segments");
    assert!(sim.position(0).abs() < 0.01, "x = {}", sim.position(0));
    assert!(sim.position(1).abs() < 0.01, "y = {}", sim.position(1));
}

/// Feedhold mid-move decelerates to zero, holds, and `~` completes the
/// move exactly.
#[test]
fn feedhold_mid_move_and_resume() {
    let mut sim = SimMachine::default();
    sim.send("G1 X1000 F2000");
    sim.run_ms(50);
    assert_eq!(sim.stat(), "run");
    let x_at_hold_request = sim.position(0);

    sim.send_raw(b"!");
    // a hold raised mid-head waits for the head to finish, then brakes:
    // most of two seconds at this feed and jerk
    sim.run_ms(2500);
    assert_eq!(sim.stat(), "hold");
    assert!(sim.machine.runtime.segment_velocity.abs() < 1e-3);

    // stopped well short of the target, but past where we were
    let x_stopped = sim.position(0);
    assert!(x_stopped > x_at_hold_request);
    assert!(x_stopped < 1000.0);

    // braking distance bound: at F2000 with default jerk the machine
    // stops within a handful of millimeters
    assert!(
        x_stopped - x_at_hold_request < 50.0,
        "braking took {} mm",
        x_stopped - x_at_hold_request
    );

    // step rate must have fallen to zero by the hold point
    let log = sim.log.lock();
    let rate_before = log.rate_between(40, 50);
    let rate_after = log.rate_between(2300, 2500);
    drop(log);
    assert!(rate_after < rate_before * 0.1, "steppers still running");

    sim.send_raw(b"~");
    sim.run_until_idle(60_000);
    assert!((sim.position(0) - 1000.0).abs() < 0.01, "x = {}", sim.position(0));
}

/// Issuing `!` twice is the same as once.
#[test]
fn feedhold_is_idempotent() {
    let mut sim = SimMachine::default();
    sim.send("G1 X100 F2000");
    sim.run_ms(50);
    sim.send_raw(b"!");
    sim.run_ms(5);
    sim.send_raw(b"!");
    sim.run_ms(2500);
    assert_eq!(sim.stat(), "hold");
    let x = sim.position(0);

    sim.send_raw(b"~");
    sim.run_until_idle(30_000);
    assert!((sim.position(0) - 100.0).abs() < 0.01);
    assert!(x < 100.0);
}

/// `%` after a hold empties the planner, re-syncs positions, and a new
/// move starts from the held position.
#[test]
fn queue_flush_at_hold_point() {
    let mut sim = SimMachine::default();
    sim.send("G1 X1000 F2000");
    sim.run_ms(50);
    sim.send_raw(b"!");
    sim.run_ms(2500);
    assert_eq!(sim.stat(), "hold");

    sim.send_raw(b"%");
    sim.run_ms(50);

    assert_eq!(
        sim.machine.planner.queue.available(),
        PLANNER_BUFFER_POOL_SIZE
    );
    let held_x = sim.position(0);
    assert_eq!(sim.machine.planner.position[0], held_x);

    // a subsequent move returns to work zero, not to the old target
    sim.send("G1 X0 F2000");
    sim.run_until_idle(30_000);
    assert!(sim.position(0).abs() < 0.01, "x = {}", sim.position(0));
    assert!(held_x > 0.0);
}

/// G38.3 probe that never touches: `prb` with e:0, program-stop, no alarm.
#[test]
fn probe_miss_reports_without_alarm() {
    let mut sim = SimMachine::default();
    sim.send("G38.3 Z-20 F500");
    sim.run_until_idle(60_000);

    let prb = sim.outputs_containing("\"prb\"");
    assert_eq!(prb.len(), 1, "expected exactly one probe report");
    assert!(prb[0].contains("\"e\":0"));
    assert_eq!(sim.stat(), "program-stop");
    assert!(sim.outputs_containing("\"er\"").is_empty(), "no alarm expected");
}

/// G38.2 probe that trips: contact position recovered from the encoder
/// snapshot, reported with e:1.
#[test]
fn probe_trip_reports_contact() {
    let mut sim = SimMachine::default();
    sim.send("G38.2 Z-20 F500");
    // let it descend a while, then trip the probe
    sim.run_ms(600);
    sim.set_input(INPUT_PROBE, true);
    sim.run_until_idle(30_000);

    let prb = sim.outputs_containing("\"prb\"");
    assert_eq!(prb.len(), 1);
    assert!(prb[0].contains("\"e\":1"));
    // landed somewhere along the way down, not at the full depth
    assert!(sim.position(2) < -0.5);
    assert!(sim.position(2) > -20.0);
    assert_eq!(sim.stat(), "program-stop");
}

/// Checksum protocol: a good line executes, a corrupted one is refused
/// with checksum-failed and does not move the machine.
#[test]
fn checksum_round_trip() {
    let mut sim = SimMachine::default();

    let body = "N42 G1 X5 F600";
    let cs = body.bytes().fold(0u8, |a, b| a ^ b);
    sim.send(&format!("{body}*{cs}"));
    sim.run_until_idle(10_000);
    assert_eq!(sim.last_response_status(), Some(0));
    assert!((sim.position(0) - 5.0).abs() < 0.01);

    // corrupt one byte, keep the checksum
    sim.send(&format!("N43 G1 X9 F600*{cs}"));
    sim.run_ms(50);
    assert_eq!(
        sim.last_response_status(),
        Some(proto::Status::ChecksumFailed.code() as i64)
    );
    sim.run_until_idle(10_000);
    assert!((sim.position(0) - 5.0).abs() < 0.01, "corrupted block moved the machine");
}

/// Queue report counter law: added minus removed equals depth, at any
/// observation point.
#[test]
fn queue_counter_law() {
    let mut sim = SimMachine::default();
    sim.send("F1200");
    for i in 1..=10 {
        sim.send(&format!("G1 X{i}"));
    }
    sim.run_ms(40);
    let q = &sim.machine.planner.queue;
    let depth = PLANNER_BUFFER_POOL_SIZE - q.available();
    assert_eq!((q.buffers_added - q.buffers_removed) as usize, depth);

    sim.run_until_idle(30_000);
    let q = &sim.machine.planner.queue;
    assert_eq!(q.buffers_added, q.buffers_removed);
}

/// ENQ answers with an ack record, mid-stream, without a terminator.
#[test]
fn enq_acks_immediately() {
    let mut sim = SimMachine::default();
    sim.send_raw(&[0x05]);
    sim.run_ms(5);
    assert_eq!(sim.outputs_containing("\"ack\":true").len(), 1);
}

/// Status reports carry stat transitions and positions.
#[test]
fn status_reports_flow() {
    let mut sim = SimMachine::default();
    sim.send("{sr:n}");
    sim.run_ms(10);
    assert!(!sim.outputs_containing("\"sr\"").is_empty());

    sim.output.clear();
    sim.send("G1 X3 F600");
    sim.run_until_idle(30_000);
    // program-stop transition always reported
    let srs = sim.outputs_containing("\"stat\":3");
    assert!(!srs.is_empty(), "missing program-stop status report");
}

/// Config round trip over the wire, mm and inches.
#[test]
fn config_round_trip_over_wire() {
    let mut sim = SimMachine::default();
    sim.send("{xvm:24000}");
    sim.run_ms(5);
    assert_eq!(sim.last_response_status(), Some(0));

    sim.output.clear();
    sim.send("{xvm:n}");
    sim.run_ms(5);
    let reads = sim.outputs_containing("24000");
    assert!(!reads.is_empty(), "written value did not read back");

    // in inches mode the same token reports inches
    sim.send("G20");
    sim.run_ms(5);
    sim.output.clear();
    sim.send("{xvm:n}");
    sim.run_ms(5);
    let v: serde_json::Value = serde_json::from_str(&sim.output[0]).unwrap();
    let xvm = v["r"]["xvm"].as_f64().unwrap();
    assert!((xvm - 24000.0 / 25.4).abs() < 1.0, "xvm = {xvm}");
}

/// Dwells pause the stream for their duration.
#[test]
fn dwell_pauses_motion() {
    let mut sim = SimMachine::default();
    sim.send("F6000");
    sim.send("G1 X2");
    sim.send("G4 P0.5");
    sim.send("G1 X4");
    sim.run_until_idle(30_000);
    assert!((sim.position(0) - 4.0).abs() < 0.01);

    // there must be a pulse gap of roughly the dwell length
    let log = sim.log.lock();
    let mut max_gap = 0u32;
    for pair in log.pulses.windows(2) {
        max_gap = max_gap.max(pair[1].at_ms.saturating_sub(pair[0].at_ms));
    }
    assert!(max_gap >= 400, "largest pulse gap {max_gap} ms");
}
