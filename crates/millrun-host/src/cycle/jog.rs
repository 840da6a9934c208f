//! Jogging: a single planned move per request, stoppable at any time with
//! a skip-type feedhold (the remainder of the jog is meaningless).
//!
//! Requests arrive as `{jogx: <target>}` JSON; the jog runs in the work
//! frame at the axis feed limit scaled by the jog rate.

use motion::state::{HoldState, HoldType, MotionState, MoveState};
use motion::AXES;
use proto::Status;
use tracing::debug;

use crate::machine::{CycleType, Machine};

/// Fraction of the axis feed limit a jog runs at.
const JOG_RATE: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum JogState {
    #[default]
    Off,
    Running,
}

#[derive(Debug, Default)]
pub struct JogCycle {
    state: JogState,
}

impl JogCycle {
    pub fn is_active(&self) -> bool {
        self.state != JogState::Off
    }

    pub fn abort(&mut self) {
        self.state = JogState::Off;
    }
}

/// Start a jog on one axis to an absolute work-frame target.
pub fn start(machine: &mut Machine, axis: usize, target_work: f32) -> Status {
    if axis >= AXES {
        return Status::ValueRangeError;
    }
    if !machine.can_move() || machine.signals.in_cycle {
        return Status::CommandNotAccepted;
    }

    let mut target = machine.planner.position;
    // work-frame input: translate through the canonical machine's offsets
    let offset = machine.runtime.position[axis]
        - machine
            .canon
            .work_position(axis, machine.runtime.position[axis]);
    target[axis] = target_work + offset;

    let gm = MoveState {
        target,
        feed_rate: machine.planner.config.axes[axis].feedrate_max * JOG_RATE,
        ..Default::default()
    };
    let now = machine.now_ms;
    if machine.planner.aline(&gm, &mut machine.signals, now).is_err() {
        return Status::MinimumLengthMove;
    }
    machine.jog.state = JogState::Running;
    machine.ensure_cycle(CycleType::Machining);
    machine.cycle_type = CycleType::Jog;
    debug!(axis, target_work, "jog started");
    Status::Ok
}

/// Stop an in-flight jog: hold and discard the remainder.
pub fn stop(machine: &mut Machine) {
    if machine.jog.is_active() {
        machine.request_feedhold(HoldType::Skip);
    }
}

/// Dispatcher callback: notice jog completion, and unwind the skip-hold a
/// cancelled jog leaves behind (there is no residual to resume into).
pub fn callback(machine: &mut Machine) {
    if machine.jog.state != JogState::Running {
        return;
    }
    if machine.signals.hold_state == HoldState::MotionStopped {
        machine.signals.hold_state = HoldState::Off;
        machine.signals.cycle_end_pending = true;
        machine.jog.abort();
        if machine.cycle_type == CycleType::Jog {
            machine.cycle_type = CycleType::None;
        }
        machine.sr.request_immediate();
        return;
    }
    if machine.signals.motion_state == MotionState::Stop
        && !machine.planner.queue.has_runnable()
        && !machine.stepper.runtime_is_busy()
        && machine.signals.hold_state == HoldState::Off
    {
        machine.jog.abort();
        if machine.cycle_type == CycleType::Jog {
            machine.cycle_type = CycleType::None;
        }
        machine.sr.request_immediate();
    }
}
