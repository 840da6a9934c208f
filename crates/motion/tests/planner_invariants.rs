//! Property tests over arbitrary move streams: the planner invariants that
//! must hold for every block that reaches full planning.

use motion::state::{MotionSignals, MoveState};
use motion::{
    BufferState, ExecStatus, Planner, PlannerState, Runtime, AXES, AXIS_X, AXIS_Y, EPSILON2,
    MIN_SEGMENT_TIME,
};
use rand::{Rng, SeedableRng};
use stepper::Stepper;

fn queue_random_program(planner: &mut Planner, signals: &mut MotionSignals, seed: u64, n: usize) {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut target = [0.0_f32; AXES];
    for _ in 0..n {
        target[AXIS_X] += rng.gen_range(-20.0_f32..20.0);
        target[AXIS_Y] += rng.gen_range(-20.0_f32..20.0);
        let gm = MoveState {
            target,
            feed_rate: rng.gen_range(100.0_f32..4000.0),
            ..Default::default()
        };
        // min-length rejections are part of the contract
        let _ = planner.aline(&gm, signals, 0);
    }
}

fn plan_everything(planner: &mut Planner, signals: &MotionSignals) {
    let mut stepper = Stepper::default();
    planner.state = PlannerState::Priming;
    planner.request_planning = true;
    planner.callback(10_000, signals, &mut stepper);
}

/// Walk the queue and forward-plan every block in order, collecting the
/// solved ramps.
fn forward_plan_all(planner: &mut Planner, runtime: &mut Runtime) -> Vec<(usize, f32, f32, f32)> {
    let mut out = Vec::new();
    let mut entry = 0.0_f32;
    loop {
        let status = runtime.forward_plan(planner);
        if status != ExecStatus::Ok {
            break;
        }
        // find the block that just became FULLY_PLANNED
        let mut idx = planner.queue.run_cursor();
        let mut found = None;
        loop {
            let bf = planner.queue.block(idx);
            if bf.state == BufferState::Empty {
                break;
            }
            if bf.state == BufferState::FullyPlanned {
                found = Some(idx);
            }
            idx = planner.queue.next(idx);
        }
        let Some(idx) = found else { break };
        let p = *runtime.p();
        out.push((idx, entry, p.cruise_velocity, p.exit_velocity));

        // pretend the block ran: free it and carry the exit forward
        entry = p.exit_velocity;
        runtime.entry_velocity = entry;
        let bf = planner.queue.block_mut(idx);
        bf.state = BufferState::Running;

        // length closure and time floor on the solved ramp
        let bf_len = planner.queue.block(idx).length;
        if planner.queue.block(idx).kind.is_move() {
            assert!(
                (p.total_length() - bf_len).abs() <= 1e-3,
                "length closure violated: ramp {} vs block {}",
                p.total_length(),
                bf_len
            );
            for (len, time) in [
                (p.head_length, p.head_time),
                (p.body_length, p.body_time),
                (p.tail_length, p.tail_time),
            ] {
                if len > EPSILON2 {
                    assert!(
                        time >= MIN_SEGMENT_TIME * 0.5,
                        "section with length {len} has time {time}"
                    );
                }
            }
        }
        planner.queue.free_run();
        if planner.queue.run_index().is_none() {
            break;
        }
    }
    out
}

#[test]
fn velocity_monotonicity_within_blocks() {
    for seed in 0..8 {
        let mut planner = Planner::default();
        let mut runtime = Runtime::default();
        let mut signals = MotionSignals::default();
        queue_random_program(&mut planner, &mut signals, seed, 30);
        plan_everything(&mut planner, &signals);

        for (idx, entry, cruise, exit) in forward_plan_all(&mut planner, &mut runtime) {
            let _ = idx;
            assert!(
                entry <= cruise + 1e-2,
                "entry {entry} > cruise {cruise} (seed {seed})"
            );
            assert!(
                exit <= cruise + 1e-2,
                "exit {exit} > cruise {cruise} (seed {seed})"
            );
        }
    }
}

#[test]
fn cruise_stays_under_caps() {
    for seed in 100..104 {
        let mut planner = Planner::default();
        let mut runtime = Runtime::default();
        let mut signals = MotionSignals::default();
        queue_random_program(&mut planner, &mut signals, seed, 25);
        plan_everything(&mut planner, &signals);

        for (idx, _entry, cruise, _exit) in forward_plan_all(&mut planner, &mut runtime) {
            let bf = planner.queue.block(idx);
            if !bf.kind.is_move() {
                continue;
            }
            // the meet-velocity solve may overshoot the cap by solver
            // tolerance but never materially
            assert!(
                cruise <= bf.absolute_vmax * 1.01 + 1.0,
                "cruise {cruise} above absolute_vmax {} (seed {seed})",
                bf.absolute_vmax
            );
        }
    }
}

#[test]
fn junction_exits_respect_junction_vmax() {
    let mut planner = Planner::default();
    let mut signals = MotionSignals::default();

    // a square: all 90 degree corners
    for (x, y) in [(10.0, 0.0), (10.0, 10.0), (0.0, 10.0), (0.0, 0.0)] {
        let mut gm = MoveState {
            feed_rate: 600.0,
            ..Default::default()
        };
        gm.target[AXIS_X] = x;
        gm.target[AXIS_Y] = y;
        planner.aline(&gm, &mut signals, 0).unwrap();
    }
    plan_everything(&mut planner, &signals);

    let mut idx = planner.queue.run_cursor();
    for _ in 0..3 {
        let bf = planner.queue.block(idx);
        assert!(
            bf.exit_velocity <= bf.junction_vmax + 1e-2,
            "corner exit {} above junction cap {}",
            bf.exit_velocity,
            bf.junction_vmax
        );
        // a 90 degree corner at F600 must actually slow down
        assert!(bf.exit_velocity < 600.0);
        idx = planner.queue.next(idx);
    }
    // last block brakes to zero
    assert!(planner.queue.block(idx).exit_velocity.abs() < 1e-3);
}
