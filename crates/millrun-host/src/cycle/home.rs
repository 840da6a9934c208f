//! Homing cycle (G28.2).
//!
//! Axes home one at a time, Z first. Per axis: traverse toward the switch,
//! skip-hold on the switch edge, back off, then set the axis origin. An
//! axis whose move completes without ever seeing its switch is a homing
//! failure and alarms.

use motion::state::{HoldState, HoldType, MotionState, MoveState};
use motion::{Axes, AXES};
use proto::Status;
use tracing::{debug, info};

use crate::inputs::{INPUT_LIMIT_X, INPUT_LIMIT_Y, INPUT_LIMIT_Z};
use crate::machine::{CycleType, Machine, MachineState};

/// Search distance: long enough to cross any real machine's travel.
const HOMING_SEARCH_MM: f32 = 1_000.0;
const HOMING_BACKOFF_MM: f32 = 2.0;
/// Search runs at this fraction of the axis feed limit; keeps the stopping
/// distance off the switch short.
const HOMING_SEARCH_RATE: f32 = 0.25;
const HOMING_BACKOFF_FEED: f32 = 300.0;

/// Homing order: Z clears the work first.
const HOMING_ORDER: [usize; AXES] = [2, 0, 1, 3, 4, 5];

fn limit_input(axis: usize) -> Option<usize> {
    match axis {
        0 => Some(INPUT_LIMIT_X),
        1 => Some(INPUT_LIMIT_Y),
        2 => Some(INPUT_LIMIT_Z),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum HomingState {
    #[default]
    Off,
    /// Search move queued; waiting for the switch edge.
    Seeking,
    /// Switch hit; waiting for the hold to land.
    Latching,
    /// Backoff move running.
    BackingOff,
}

#[derive(Debug, Default)]
pub struct HomingCycle {
    state: HomingState,
    pending: Vec<usize>,
    current_axis: usize,
}

impl HomingCycle {
    pub fn is_active(&self) -> bool {
        self.state != HomingState::Off
    }

    pub fn abort(&mut self) {
        self.state = HomingState::Off;
        self.pending.clear();
    }
}

/// Start homing the flagged axes.
pub fn start(machine: &mut Machine, axes: &[bool; AXES]) -> Status {
    if !machine.can_move() || machine.homing.is_active() {
        return Status::CommandNotAccepted;
    }
    machine.homing.pending = HOMING_ORDER
        .iter()
        .copied()
        .filter(|&a| axes[a])
        .collect();
    if machine.homing.pending.is_empty() {
        return Status::AxisWordMissing;
    }
    machine.inputs.limits_enabled = false; // limits are the homing targets now
    machine.cycle_type = CycleType::Homing;
    next_axis(machine);
    Status::Ok
}

fn next_axis(machine: &mut Machine) {
    let Some(axis) = machine.homing.pending.first().copied() else {
        finish(machine, true);
        return;
    };
    machine.homing.pending.remove(0);
    machine.homing.current_axis = axis;

    // Axes without a switch (rotaries here) home by definition: set zero.
    if limit_input(axis).is_none() {
        zero_axis(machine, axis);
        next_axis(machine);
        return;
    }

    let mut target = machine.planner.position;
    target[axis] -= HOMING_SEARCH_MM;
    let search_feed = machine.planner.config.axes[axis].feedrate_max * HOMING_SEARCH_RATE;
    queue_move(machine, target, search_feed);
    machine.homing.state = HomingState::Seeking;
    machine.cycle_type = CycleType::Homing; // cycle_end clears it between axes
    machine.signals.in_cycle = true;
    machine.stepper.set_motion_running(true);
    machine.stepper.request_forward_plan();
    debug!(axis, "homing: seeking switch");
}

fn queue_move(machine: &mut Machine, target: Axes, feed: f32) {
    let gm = MoveState {
        target,
        feed_rate: feed,
        ..Default::default()
    };
    let now = machine.now_ms;
    let _ = machine.planner.aline(&gm, &mut machine.signals, now);
}

fn zero_axis(machine: &mut Machine, axis: usize) {
    let mut position = machine.runtime.position;
    position[axis] = 0.0;
    machine.runtime.set_position(&*machine.kin, &position);
    // re-seat the encoders so the origin shift doesn't read as following
    // error
    let steps = machine.kin.inverse(&position);
    for motor in 0..stepper::MOTORS {
        machine.stepper.encoders.set_position(motor, steps[motor]);
    }
    machine.planner.flush(&position);
    machine.canon.set_position(&position);
}

fn finish(machine: &mut Machine, homed: bool) {
    machine.homing.abort();
    machine.cycle_type = CycleType::None;
    machine.signals.in_cycle = false;
    machine.signals.cycle_end_pending = false;
    machine.stepper.set_motion_running(false);
    machine.inputs.limits_enabled = homed;
    if homed {
        machine.state = MachineState::ProgramStop;
        machine.sr.request_immediate();
        info!("homing complete");
    }
}

/// Dispatcher callback advancing the homing machine.
pub fn callback(machine: &mut Machine) {
    let axis = machine.homing.current_axis;
    match machine.homing.state {
        HomingState::Off => {}
        HomingState::Seeking => {
            let input = limit_input(axis);
            while let Some(event) = machine.inputs.poll() {
                if Some(event.input) == input && event.rising {
                    machine.request_feedhold(HoldType::Skip);
                    machine.homing.state = HomingState::Latching;
                    return;
                }
            }
            if machine.signals.motion_state == MotionState::Stop
                && !machine.planner.queue.has_runnable()
                && !machine.stepper.runtime_is_busy()
                && machine.signals.hold_state == HoldState::Off
            {
                // ran the whole search distance without a switch
                finish(machine, false);
                machine.alarm(Status::HomingCycleFailed, "switch not found");
            }
        }
        HomingState::Latching => {
            if machine.signals.hold_state == HoldState::MotionStopped {
                let position = machine.runtime.position;
                machine.planner.flush(&position);
                machine.signals.hold_state = HoldState::Off;
                // back off the switch before zeroing
                let mut target = position;
                target[axis] += HOMING_BACKOFF_MM;
                queue_move(machine, target, HOMING_BACKOFF_FEED);
                machine.homing.state = HomingState::BackingOff;
                machine.cycle_type = CycleType::Homing;
                machine.signals.in_cycle = true;
                machine.stepper.set_motion_running(true);
                machine.stepper.request_forward_plan();
            }
        }
        HomingState::BackingOff => {
            if machine.signals.motion_state == MotionState::Stop
                && !machine.planner.queue.has_runnable()
                && !machine.stepper.runtime_is_busy()
            {
                zero_axis(machine, axis);
                machine.signals.cycle_end_pending = false;
                next_axis(machine);
            }
        }
    }
}
