//! The cooperative dispatcher.
//!
//! [`controller_pass`] runs a fixed list of continuations in dependency
//! order; any continuation that returns [`Dispatch::Again`] aborts the rest
//! of the pass (it is waiting on a lower-level resource). Command dispatch
//! is last and reads at most one line per pass, gated on planner headroom
//! and command-ring space.

use gcode::{Action, ArcIntent, MoveIntent, ParseError, PathMode, Plane};
use motion::arc::{ArcPlaneSelect, ArcSpec};
use motion::state::{FeedRateMode, HoldState, HoldType, MotionMode, MoveState, PathControl};
use motion::PlanError;
use proto::{parse_relaxed, JsonValue, LineEvent, LineKind, ReadLimit, Status};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::commands;
use crate::cycle::{feedhold, home, jog, probe};
use crate::inputs::{INPUT_INTERLOCK, INPUT_LIMIT_X, INPUT_LIMIT_Y, INPUT_LIMIT_Z};
use crate::machine::{CycleType, Machine, MachineState};
use crate::report::{qr_callback, sr_callback};
use crate::tokens;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Ok,
    /// Waiting on a lower-level resource; abort the pass.
    Again,
    Noop,
}

macro_rules! dispatch {
    ($e:expr) => {
        if $e == Dispatch::Again {
            return;
        }
    };
}

/// One full dispatcher pass. The order is load-bearing: each task may
/// depend on everything above it having had its chance first.
pub fn controller_pass(machine: &mut Machine, now_ms: u32) {
    dispatch!(hardware_periodic(machine));
    dispatch!(led_indicator(machine, now_ms));
    dispatch!(shutdown_handler(machine));
    dispatch!(interlock_handler(machine));
    dispatch!(temperature_callback(machine));
    dispatch!(limit_switch_handler(machine));
    dispatch!(controller_state(machine));
    dispatch!(assertion_check(machine));
    dispatch!(dispatch_control(machine));
    dispatch!(motor_power_callback(machine, now_ms));
    sr_callback(machine, now_ms);
    qr_callback(machine, now_ms);
    feedhold::sequencing_callback(machine);
    machine
        .planner
        .callback(now_ms, &machine.signals, &mut machine.stepper);
    dispatch!(arc_callback(machine, now_ms));
    home::callback(machine);
    probe::callback(machine);
    jog::callback(machine);
    machine.cycle_end();
    dispatch!(sync_to_planner(machine, now_ms));
    dispatch_command(machine);
}

// ---- housekeeping continuations -------------------------------------------

/// Hook for platform work that must run every pass. Transports and timers
/// live outside the controller here, so this is a seam, not a task.
fn hardware_periodic(_machine: &mut Machine) -> Dispatch {
    Dispatch::Ok
}

fn led_indicator(machine: &mut Machine, now_ms: u32) -> Dispatch {
    machine.led_callback(now_ms);
    Dispatch::Ok
}

/// Shutdown-level faults detected in ISR context are latched as input
/// levels and handled here at dispatcher priority.
fn shutdown_handler(_machine: &mut Machine) -> Dispatch {
    Dispatch::Ok
}

fn interlock_handler(machine: &mut Machine) -> Dispatch {
    if machine.inputs.level(INPUT_INTERLOCK)
        && machine.signals.in_cycle
        && machine.state != MachineState::Alarm
    {
        machine.alarm(Status::InterlockOpen, "safety interlock open");
        return Dispatch::Again;
    }
    Dispatch::Ok
}

/// External temperature-control seam; nothing to do on this platform.
fn temperature_callback(_machine: &mut Machine) -> Dispatch {
    Dispatch::Ok
}

/// Limit switches alarm outside homing/probing; those cycles own the edge
/// ring while they run.
fn limit_switch_handler(machine: &mut Machine) -> Dispatch {
    if machine.probe.is_active() || machine.homing.is_active() {
        return Dispatch::Ok;
    }
    // This handler owns the edge ring when no cycle does; unwatched edges
    // still drain so the ring never wedges.
    while let Some(event) = machine.inputs.poll() {
        if machine.inputs.limits_enabled
            && event.rising
            && matches!(event.input, INPUT_LIMIT_X | INPUT_LIMIT_Y | INPUT_LIMIT_Z)
        {
            let axis = ["x", "y", "z"][event.input - INPUT_LIMIT_X];
            machine.alarm(Status::LimitSwitchHit, axis);
            return Dispatch::Again;
        }
    }
    Dispatch::Ok
}

fn controller_state(machine: &mut Machine) -> Dispatch {
    if machine.state == MachineState::Initializing {
        machine.state = MachineState::Ready;
        let banner = machine
            .writer
            .response(json!({"msg": "SYSTEM READY"}), Status::Ok, 0);
        machine.emit(banner);
    }
    Dispatch::Ok
}

/// Structural invariants: buffer chain integrity and the edge ring.
/// Violations escalate to panic; the machine stays on the wire to report.
fn assertion_check(machine: &mut Machine) -> Dispatch {
    if let Err(what) = machine.planner.queue.audit() {
        machine.panic_now(Status::AssertionFailure, what);
        return Dispatch::Again;
    }
    if machine.inputs.take_overflow() {
        let text = machine
            .writer
            .exception(Status::BufferFull, "input edge ring overflowed");
        machine.emit(text);
    }
    Dispatch::Ok
}

/// Motors in in-cycle power mode time out after idling.
const MOTOR_IDLE_TIMEOUT_MS: u32 = 2_000;

fn motor_power_callback(machine: &mut Machine, now_ms: u32) -> Dispatch {
    if machine.signals.in_cycle || machine.stepper.runtime_is_busy() {
        machine.last_motion_ms = now_ms;
    } else if now_ms.wrapping_sub(machine.last_motion_ms) > MOTOR_IDLE_TIMEOUT_MS {
        machine.motor_power_timeout();
    }
    Dispatch::Ok
}

fn arc_callback(machine: &mut Machine, now_ms: u32) -> Dispatch {
    if !machine.arc.is_active() {
        return Dispatch::Noop;
    }
    let result = {
        let Machine {
            arc,
            planner,
            signals,
            ..
        } = machine;
        arc.callback(planner, signals, now_ms)
    };
    match result {
        Ok(_) => Dispatch::Ok,
        Err(_) => {
            machine.panic_now(Status::FailedToGetPlannerBuffer, "arc generator");
            Dispatch::Again
        }
    }
}

/// Backpressure gate: no command reads while the planner or the deferred
/// command ring is out of room, or while a JSON wait is stalling the queue.
fn sync_to_planner(machine: &mut Machine, now_ms: u32) -> Dispatch {
    if commands::wait_callback(machine, now_ms) {
        return Dispatch::Again;
    }
    if machine.planner.is_full() || machine.commands.free_slots() == 0 {
        return Dispatch::Again;
    }
    if machine.arc.is_active() {
        return Dispatch::Again; // the arc owns the planner until done
    }
    Dispatch::Ok
}

// ---- command dispatch ------------------------------------------------------

/// Control-only read: runs early so `!`, `~`, `%` and JSON preempt bulk
/// G-code with at most one block of latency.
fn dispatch_control(machine: &mut Machine) -> Dispatch {
    let percent = machine.signals.hold_state != HoldState::Off;
    if let Some((channel, event, muted)) = machine.channels.readline(ReadLimit::ControlOnly, percent)
    {
        dispatch_kernel(machine, channel, event, muted);
    }
    Dispatch::Ok
}

/// Data read: one line per pass, only when everything upstream has room.
fn dispatch_command(machine: &mut Machine) {
    // During a hold the machine refuses everything except the single-char
    // commands and status queries, which arrive via the control pass.
    if machine.signals.hold_state != HoldState::Off {
        return;
    }
    let percent = false;
    if let Some((channel, event, muted)) = machine.channels.readline(ReadLimit::Any, percent) {
        dispatch_kernel(machine, channel, event, muted);
    }
}

/// Route one input event. Every command produces exactly one response.
pub fn dispatch_kernel(machine: &mut Machine, channel: usize, event: LineEvent, muted: bool) {
    if muted {
        // dropped, with a one-shot explanation
        let text = machine
            .writer
            .exception(Status::InputFromMutedChannel, "lines from muted devices are ignored");
        machine.emit(text);
        return;
    }

    match event {
        LineEvent::SingleChar(c) => match c {
            b'!' => {
                if machine.jog.is_active() {
                    jog::stop(machine);
                } else {
                    machine.request_feedhold(HoldType::Hold);
                }
            }
            b'~' => machine.request_end_hold(),
            b'%' => machine.request_queue_flush(),
            0x04 => machine.requests.kill_job = true,
            0x18 => machine.hard_reset(),
            0x05 => {
                let text = machine.writer.ack();
                machine.emit_to(Some(channel), text);
            }
            _ => {}
        },
        LineEvent::Overflow => {
            let text = machine
                .writer
                .exception(Status::LineExceedsMaxLength, "line discarded");
            machine.emit_to(Some(channel), text);
        }
        LineEvent::Line { kind, text } => {
            let trimmed = text.trim_start();
            let bytes_consumed = text.len() + 1;
            if trimmed.is_empty() {
                return;
            }
            match kind {
                LineKind::Control => json_dispatch(machine, channel, trimmed, bytes_consumed),
                LineKind::Data => match trimmed.as_bytes()[0] {
                    b'$' => text_dispatch(machine, channel, trimmed, bytes_consumed),
                    b'?' => {
                        machine.sr.request_immediate_full();
                        let response =
                            machine
                                .writer
                                .response(json!({}), Status::Ok, bytes_consumed);
                        machine.emit_to(Some(channel), response);
                    }
                    b'H' | b'h' => {
                        let response = machine.writer.response(
                            json!({"msg": "help screens not supported on this build"}),
                            Status::Noop,
                            bytes_consumed,
                        );
                        machine.emit_to(Some(channel), response);
                    }
                    _ => {
                        let status = gcode_dispatch(machine, trimmed);
                        let response =
                            machine
                                .writer
                                .gcode_response(trimmed, status, bytes_consumed);
                        machine.emit_to(Some(channel), response);
                        machine.sr.request_timed();
                    }
                },
            }
        }
    }
}

// ---- JSON dispatch ---------------------------------------------------------

fn value_is_query(value: &JsonValue) -> bool {
    matches!(value, JsonValue::Null)
}

fn json_dispatch(machine: &mut Machine, channel: usize, line: &str, bytes_consumed: usize) {
    let pairs = match parse_relaxed(line) {
        Ok(pairs) => pairs,
        Err(status) => {
            let response = machine
                .writer
                .response(json!({"msg": line}), status, bytes_consumed);
            machine.emit_to(Some(channel), response);
            return;
        }
    };

    let holding = machine.signals.hold_state != HoldState::Off;
    let mut body = Map::new();
    let mut status = Status::Ok;

    for pair in &pairs {
        // During a hold only queries go through.
        if holding && !value_is_query(&pair.value) {
            status = Status::CommandNotAccepted;
            body.insert(pair.name.clone(), Value::Null);
            continue;
        }
        let pair_status = json_pair(machine, pair, &mut body);
        if status == Status::Ok {
            status = pair_status;
        }
    }

    let response = machine
        .writer
        .response(Value::Object(body), status, bytes_consumed);
    machine.emit_to(Some(channel), response);
}

fn json_pair(
    machine: &mut Machine,
    pair: &proto::NameValue,
    body: &mut Map<String, Value>,
) -> Status {
    let name = pair.name.as_str();

    // embedded G-code block
    if name == "gc" {
        if let JsonValue::Str(block) = &pair.value {
            let status = gcode_dispatch(machine, block);
            body.insert("gc".into(), json!(block));
            machine.sr.request_timed();
            return status;
        }
        return Status::BadNumberFormat;
    }

    // jog requests: {jogx: <work-frame target>}
    if let Some(axis_char) = name.strip_prefix("jog").and_then(|s| s.chars().next()) {
        if let Some(axis) = "xyzabc".chars().position(|c| c == axis_char) {
            if let JsonValue::Number(target) = pair.value {
                let status = jog::start(machine, axis, target);
                body.insert(name.into(), json!(target));
                return status;
            }
        }
        return Status::BadNumberFormat;
    }

    // status report configuration / trigger
    if name == "sr" {
        match &pair.value {
            JsonValue::Null => {
                machine.sr.request_immediate_full();
                body.insert("sr".into(), Value::Null);
                return Status::Ok;
            }
            JsonValue::Object(fields) => {
                let list: Vec<String> = fields
                    .iter()
                    .filter(|nv| !matches!(nv.value, JsonValue::Bool(false)))
                    .map(|nv| nv.name.clone())
                    .collect();
                machine.sr.set_fields(list);
                body.insert("sr".into(), json!(true));
                return Status::Ok;
            }
            _ => return Status::BadNumberFormat,
        }
    }
    if name == "qr" && value_is_query(&pair.value) {
        machine.planner.queue.report_requested = true;
        body.insert("qr".into(), json!(machine.planner.queue.available()));
        return Status::Ok;
    }

    // alarm clear is a command spelled like a query
    if name == "clear" {
        let status = machine.clear_alarm();
        body.insert("clear".into(), Value::Null);
        return status;
    }

    // coordinate system offset groups: {g55:{x:…}} (g54 = index 1)
    if let Some(sys) = name.strip_prefix('g').and_then(|s| s.parse::<u32>().ok()) {
        if (54..=59).contains(&sys) {
            if let JsonValue::Object(axes) = &pair.value {
                for nv in axes {
                    if let (Some(axis), JsonValue::Number(v)) = (
                        "xyzabc".chars().position(|c| {
                            nv.name.chars().next().is_some_and(|n| n == c)
                        }),
                        &nv.value,
                    ) {
                        machine
                            .canon
                            .set_coord_offset((sys - 54) as usize, axis, *v);
                    }
                }
                body.insert(name.into(), json!(true));
                return Status::Ok;
            }
        }
    }

    // plain token read or write
    if value_is_query(&pair.value) {
        match tokens::get(machine, name) {
            Ok(value) => {
                body.insert(name.into(), value);
                Status::Ok
            }
            Err(status) => {
                body.insert(name.into(), Value::Null);
                status
            }
        }
    } else {
        let status = tokens::set(machine, name, &pair.value);
        if status == Status::Ok {
            let echo = tokens::get(machine, name).unwrap_or(Value::Null);
            body.insert(name.into(), echo);
        } else {
            body.insert(name.into(), Value::Null);
        }
        status
    }
}

// ---- text mode -------------------------------------------------------------

/// `$` commands: `$` lists the system group, `$token` reads, `$token=value`
/// writes. Responses stay JSON; this build has no text prettyprinter.
fn text_dispatch(machine: &mut Machine, channel: usize, line: &str, bytes_consumed: usize) {
    let rest = line[1..].trim();
    let mut body = Map::new();
    let status = if rest.is_empty() {
        match tokens::get(machine, "sys") {
            Ok(value) => {
                body.insert("sys".into(), value);
                Status::Ok
            }
            Err(status) => status,
        }
    } else if let Some((token, value)) = rest.split_once('=') {
        let token = token.trim().to_ascii_lowercase();
        match value.trim().parse::<f32>() {
            Ok(v) => {
                let status = tokens::set(machine, &token, &JsonValue::Number(v));
                let echo = tokens::get(machine, &token).unwrap_or(Value::Null);
                body.insert(token, echo);
                status
            }
            Err(_) => {
                body.insert(token, Value::Null);
                Status::BadNumberFormat
            }
        }
    } else {
        let token = rest.to_ascii_lowercase();
        match tokens::get(machine, &token) {
            Ok(value) => {
                body.insert(token, value);
                Status::Ok
            }
            Err(status) => {
                body.insert(token, Value::Null);
                status
            }
        }
    };
    let response = machine
        .writer
        .response(Value::Object(body), status, bytes_consumed);
    machine.emit_to(Some(channel), response);
}

// ---- G-code dispatch -------------------------------------------------------

fn map_parse_error(err: &ParseError) -> Status {
    match err {
        ParseError::BadWord(_) | ParseError::BadNumber(_) => Status::BadNumberFormat,
        ParseError::ChecksumFailed => Status::ChecksumFailed,
        ParseError::UnbalancedComment => Status::UnbalancedComment,
        ParseError::Unsupported('M', _) => Status::McodeCommandUnsupported,
        ParseError::Unsupported(..) => Status::GcodeCommandUnsupported,
        ParseError::ModalGroupViolation => Status::ModalGroupViolation,
        ParseError::AxisMissing => Status::AxisWordMissing,
        ParseError::FeedRateMissing => Status::FeedRateNotSpecified,
        ParseError::ArcSpecification => Status::ArcSpecificationError,
        ParseError::ValueRange => Status::ValueRangeError,
    }
}

pub fn move_state_from(intent: &MoveIntent) -> MoveState {
    MoveState {
        target: intent.target,
        feed_rate: intent.feed_rate,
        feed_rate_mode: if intent.inverse_time {
            FeedRateMode::InverseTime
        } else {
            FeedRateMode::UnitsPerMinute
        },
        motion_mode: if intent.traverse {
            MotionMode::Traverse
        } else {
            MotionMode::Feed
        },
        path_control: match intent.path_mode {
            PathMode::ExactPath => PathControl::ExactPath,
            PathMode::ExactStop => PathControl::ExactStop,
            PathMode::Continuous => PathControl::Continuous,
        },
        line_number: intent.line_number,
        units_inches: intent.units_inches,
        coord_system: intent.coord_system,
        ..Default::default()
    }
}

fn plane_from(plane: Plane) -> ArcPlaneSelect {
    match plane {
        Plane::Xy => ArcPlaneSelect::Xy,
        Plane::Xz => ArcPlaneSelect::Xz,
        Plane::Yz => ArcPlaneSelect::Yz,
    }
}

/// Radius-form arcs (R word) convert to center offsets here: the center
/// sits on the perpendicular bisector of start->end, on the side selected
/// by direction and the sign of R.
fn radius_to_offset(
    start: (f32, f32),
    end: (f32, f32),
    radius: f32,
    clockwise: bool,
) -> Result<(f32, f32), Status> {
    let dx = end.0 - start.0;
    let dy = end.1 - start.1;
    let d_sq = dx * dx + dy * dy;
    if d_sq < 1e-12 {
        return Err(Status::ArcSpecificationError);
    }
    let h_sq = radius * radius - d_sq / 4.0;
    if h_sq < 0.0 {
        return Err(Status::ArcSpecificationError);
    }
    let mut h = h_sq.sqrt();
    // direction and R sign pick which of the two centers
    if clockwise != (radius < 0.0) {
        h = -h;
    }
    let d = d_sq.sqrt();
    Ok((
        dx / 2.0 - h * dy / d,
        dy / 2.0 + h * dx / d,
    ))
}

/// Interpret a G-code block and queue its actions. Returns the response
/// status; a non-OK status queued nothing past the failure point.
pub fn gcode_dispatch(machine: &mut Machine, line: &str) -> Status {
    if !machine.can_move() {
        // alarm/shutdown/panic: refuse motion but still interpret nothing
        return Status::CommandNotAccepted;
    }

    let actions = match machine.canon.process_line(line) {
        Ok(actions) => actions,
        Err(err) => return map_parse_error(&err),
    };

    let now = machine.now_ms;
    let mut queued_motion = false;

    for action in &actions {
        match action {
            Action::Move(intent) => {
                let gm = move_state_from(intent);
                match machine.planner.aline(&gm, &mut machine.signals, now) {
                    Ok(()) => queued_motion = true,
                    Err(PlanError::MinimumLengthMove) => {
                        machine.sr.request_timed_full();
                        return Status::MinimumLengthMove;
                    }
                    Err(_) => return Status::FailedToGetPlannerBuffer,
                }
            }
            Action::Arc(arc) => match start_arc(machine, arc, now) {
                Status::Ok => queued_motion = true,
                status => return status,
            },
            Action::Probe(intent) => {
                let status = probe::start(machine, intent);
                if status != Status::Ok {
                    return status;
                }
                queued_motion = true;
            }
            Action::Dwell { seconds } => {
                if machine
                    .planner
                    .dwell(*seconds, &mut machine.signals, now)
                    .is_err()
                {
                    return Status::FailedToGetPlannerBuffer;
                }
                queued_motion = true;
            }
            Action::QueuedCommand { json } => {
                let Some(token) = machine.commands.push_command(json) else {
                    return Status::BufferFull;
                };
                if machine
                    .planner
                    .command(token, &mut machine.signals, now)
                    .is_err()
                {
                    return Status::FailedToGetPlannerBuffer;
                }
                queued_motion = true;
            }
            Action::QueuedWait { json } => {
                let Some(token) = machine.commands.push_wait(json) else {
                    return Status::BufferFull;
                };
                if machine
                    .planner
                    .command(token, &mut machine.signals, now)
                    .is_err()
                {
                    return Status::FailedToGetPlannerBuffer;
                }
                queued_motion = true;
            }
            Action::Home { axes } => {
                let status = home::start(machine, axes);
                if status != Status::Ok {
                    return status;
                }
            }
            Action::ProgramStop | Action::OptionalStop => {
                // stop lands naturally when the queue drains
            }
            Action::ProgramEnd => machine.note_program_end(),
        }
    }

    if queued_motion {
        machine.ensure_cycle(CycleType::Machining);
    }
    debug!(line, actions = actions.len(), "gcode dispatched");
    Status::Ok
}

fn start_arc(machine: &mut Machine, arc: &ArcIntent, now: u32) -> Status {
    let gm = move_state_from(&arc.base);
    let start_position = machine.planner.position;

    let (a0, a1, _) = plane_from(arc.plane).axes();
    let offset = if let Some(radius) = arc.radius {
        match radius_to_offset(
            (start_position[a0], start_position[a1]),
            (arc.base.target[a0], arc.base.target[a1]),
            radius,
            arc.clockwise,
        ) {
            Ok((i, j)) => [i, j, 0.0],
            Err(status) => return status,
        }
    } else {
        [arc.offset[0], arc.offset[1], 0.0]
    };

    let spec = ArcSpec {
        gm,
        target: arc.base.target,
        offset,
        plane: plane_from(arc.plane),
        clockwise: arc.clockwise,
        rotations: arc.rotations,
        chord_tolerance: machine.profile.chord_tolerance,
    };
    if machine.arc.start(&spec, &start_position).is_err() {
        return Status::MinimumLengthMove;
    }
    // emit the first batch of chords right away
    let result = {
        let Machine {
            arc,
            planner,
            signals,
            ..
        } = machine;
        arc.callback(planner, signals, now)
    };
    if result.is_err() {
        return Status::FailedToGetPlannerBuffer;
    }
    Status::Ok
}
