//! Straight probe cycle (G38.2 / G38.3).
//!
//! The probe move is an ordinary planned feed; the probe input arms an
//! edge watch. On trip, the ISR-side edge record carries the encoder
//! snapshot; this machine raises a skip-type feedhold, recovers the
//! contact position by forward kinematics on the snapshot, and reports
//! `prb`. A miss is an alarm for G38.2 and a plain report for G38.3.

use gcode::ProbeIntent;
use motion::state::{FeedRateMode, HoldState, HoldType, MotionMode, MotionState, MoveState};
use proto::Status;
use stepper::MOTORS;
use tracing::{debug, info};

use crate::inputs::INPUT_PROBE;
use crate::machine::{CycleType, Machine, MachineState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ProbeState {
    #[default]
    Off,
    /// Move queued, watching for the edge.
    Waiting,
    /// Tripped; waiting for the hold to land.
    Stopping,
    Finalize,
}

#[derive(Debug, Default)]
pub struct ProbeCycle {
    state: ProbeState,
    alarm_on_miss: bool,
    tripped: Option<[f32; MOTORS]>,
    /// Contact point recovered from the trip snapshot, machine coords.
    contact: Option<[f32; 6]>,
}

impl ProbeCycle {
    pub fn is_active(&self) -> bool {
        self.state != ProbeState::Off
    }

    pub fn abort(&mut self) {
        self.state = ProbeState::Off;
        self.tripped = None;
        self.contact = None;
    }
}

/// Begin a probe cycle: queue the probing move and arm the edge watch.
pub fn start(machine: &mut Machine, intent: &ProbeIntent) -> Status {
    if !machine.can_move() || machine.probe.is_active() {
        return Status::CommandNotAccepted;
    }
    if machine.inputs.level(INPUT_PROBE) {
        // already in contact before moving
        return Status::ProbeCycleFailed;
    }

    let gm = MoveState {
        target: intent.base.target,
        feed_rate: intent.base.feed_rate,
        feed_rate_mode: if intent.base.inverse_time {
            FeedRateMode::InverseTime
        } else {
            FeedRateMode::UnitsPerMinute
        },
        motion_mode: MotionMode::Probe,
        line_number: intent.base.line_number,
        units_inches: intent.base.units_inches,
        coord_system: intent.base.coord_system,
        ..Default::default()
    };
    let now = machine.now_ms;
    if machine.planner.aline(&gm, &mut machine.signals, now).is_err() {
        return Status::MinimumLengthMove;
    }

    machine.probe.state = ProbeState::Waiting;
    machine.probe.alarm_on_miss = intent.alarm_on_miss;
    machine.probe.tripped = None;
    machine.ensure_cycle(CycleType::Machining);
    machine.cycle_type = CycleType::Probe;
    machine.sr.request_immediate();
    debug!(target = ?intent.base.target, "probe cycle started");
    Status::Ok
}

/// Dispatcher callback advancing the probe machine.
pub fn callback(machine: &mut Machine) {
    match machine.probe.state {
        ProbeState::Off => {}
        ProbeState::Waiting => {
            // drain probe edges; other inputs stay queued for their owners
            while let Some(event) = machine.inputs.poll() {
                if event.input == INPUT_PROBE && event.rising {
                    machine.probe.tripped = Some(event.encoder_snapshot);
                    machine.request_feedhold(HoldType::Skip);
                    machine.probe.state = ProbeState::Stopping;
                    return;
                }
            }
            // move completed without contact
            if machine.signals.motion_state == MotionState::Stop
                && !machine.planner.queue.has_runnable()
                && !machine.stepper.runtime_is_busy()
                && machine.signals.hold_state == HoldState::Off
            {
                machine.probe.state = ProbeState::Finalize;
            }
        }
        ProbeState::Stopping => {
            if machine.signals.hold_state == HoldState::MotionStopped {
                // The *contact* position comes from the encoder snapshot
                // taken inside the trip interrupt; the machine itself sits
                // wherever the deceleration landed, and that stays the
                // machine position.
                let snapshot = machine.probe.tripped.unwrap_or_default();
                machine.probe.contact = Some(machine.kin.forward(&snapshot));
                let landed = machine.runtime.position;
                machine.planner.flush(&landed);
                machine.canon.set_position(&landed);
                machine.signals.hold_state = HoldState::Off;
                machine.signals.in_cycle = false;
                machine.stepper.set_motion_running(false);
                machine.probe.state = ProbeState::Finalize;
            }
        }
        ProbeState::Finalize => {
            let tripped = machine.probe.tripped.is_some();
            let report_position = machine.probe.contact.unwrap_or(machine.runtime.position);
            let axes: Vec<(&str, f32)> = ["x", "y", "z", "a", "b", "c"]
                .iter()
                .enumerate()
                .map(|(axis, name)| {
                    (*name, machine.canon.work_position(axis, report_position[axis]))
                })
                .collect();
            let report = machine.writer.probe_report(tripped, &axes);
            machine.emit(report);

            let alarm_on_miss = machine.probe.alarm_on_miss;
            machine.probe.abort();
            machine.cycle_type = CycleType::None;
            machine.signals.cycle_end_pending = false;

            if !tripped && alarm_on_miss {
                machine.alarm(Status::ProbeCycleFailed, "probe did not make contact");
            } else {
                machine.state = MachineState::ProgramStop;
                machine.sr.request_immediate();
                info!(tripped, "probe cycle complete");
            }
        }
    }
}
