//! Feedhold, cycle start and queue flush sequencing.
//!
//! Requests arrive from the line scanner (`!`, `~`, `%`) or from cycles
//! (probe trip, jog stop) and are drained here at dispatcher priority. The
//! deceleration itself happens inside the segment executor; this module
//! only moves the request flags through the hold state machine and handles
//! the resume/flush endpoints.

use motion::state::{HoldState, MotionState};
use proto::Status;
use tracing::{debug, info};

use crate::machine::{CycleType, Machine, MachineState};

pub fn sequencing_callback(machine: &mut Machine) {
    // Once held, quiet the loader's exec re-requests until resume.
    if machine.signals.hold_state == HoldState::MotionStopped {
        machine.stepper.set_motion_running(false);
    }

    // ^D: kill job. Alarm level: flush everything, require explicit clear.
    if core::mem::take(&mut machine.requests.kill_job) {
        machine.alarm(Status::KillJobRequested, "job killed by ^d");
        return;
    }

    // `!` feedhold. Idempotent: a hold request while a hold is in progress
    // changes nothing.
    if let Some(hold_type) = machine.requests.feedhold.take() {
        if machine.signals.in_cycle && machine.signals.hold_state == HoldState::Off {
            machine.signals.hold_type = hold_type;
            machine.signals.hold_state = HoldState::Sync;
            machine.sr.request_immediate();
            debug!(?hold_type, "feedhold requested");
        }
    }

    // `~` end hold / cycle start.
    if core::mem::take(&mut machine.requests.end_hold) {
        match machine.signals.hold_state {
            HoldState::MotionStopped => {
                machine.signals.hold_state = HoldState::Off;
                if machine.planner.queue.has_runnable() {
                    // Resume: the residual block(s) were reverted to
                    // BACK_PLANNED at the hold point; replan from zero and
                    // restart motion.
                    machine.planner.replan_queue();
                    machine.signals.in_cycle = true;
                    machine.signals.motion_state = MotionState::Planning;
                    machine.stepper.set_motion_running(true);
                    machine.stepper.request_forward_plan();
                    info!("resuming from feedhold");
                } else {
                    machine.signals.cycle_end_pending = true;
                }
                machine.sr.request_immediate();
            }
            HoldState::Off => {
                // plain cycle start: begin motion on whatever is queued
                if machine.planner.queue.has_runnable() {
                    machine.ensure_cycle(CycleType::Machining);
                }
            }
            // mid-deceleration: leave the request for the next pass
            _ => machine.requests.end_hold = true,
        }
    }

    // `%` queue flush: legal only while held at the hold point.
    if machine.requests.queue_flush {
        match machine.signals.hold_state {
            HoldState::MotionStopped => {
                machine.requests.queue_flush = false;
                flush_queue(machine);
            }
            HoldState::Off => {
                machine.requests.queue_flush = false;
                let text = machine
                    .writer
                    .exception(Status::CommandNotAccepted, "queue flush requires feedhold");
                machine.emit(text);
            }
            // still decelerating: hold the request until stopped
            _ => {}
        }
    }
}

/// Empty the planner, land the machine at the runtime position, preserve
/// all modal/coordinate state, and end the hold.
pub fn flush_queue(machine: &mut Machine) {
    machine.arc.abort();
    let position = machine.runtime.position;
    machine.planner.flush(&position);
    machine.canon.set_position(&position);
    machine.stepper.prep.null();
    machine.signals.hold_state = HoldState::Off;
    machine.signals.motion_state = MotionState::Stop;
    machine.signals.in_cycle = false;
    machine.signals.cycle_end_pending = false;
    machine.stepper.set_motion_running(false);
    machine.cycle_type = CycleType::None;
    if machine.state == MachineState::Cycle {
        machine.state = MachineState::ProgramStop;
    }
    machine.sr.request_immediate();
    info!("queue flushed");
}
