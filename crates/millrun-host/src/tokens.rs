//! The flat configuration token namespace.
//!
//! Every runtime-settable value is addressable by a short token (<= 6
//! chars) as a JSON leaf or a `$token` text command: axis limits
//! (`xvm`, `yjm`, ...), motor setup (`1mi`, `2po`, ...), machine knobs
//! (`jt`, `ct`, `mfo`, `sv`, `si`, `qv`), read-only build identity
//! (`fv fb fbs hp hv id`) and live status values (`stat`, `posx`, `vel`,
//! ...). Group tokens (`x`, `1`, `sys`) expand to their members.
//!
//! Sets are range-checked and rejected without side effects. Values with a
//! length dimension honor the active units mode in both directions.

use gcode::MM_PER_INCH;
use motion::AXES;
use proto::{JsonValue, Status};
use serde_json::{json, Value};
use stepper::{Polarity, PowerMode, MOTORS};

use crate::machine::Machine;

const AXIS_LETTERS: [char; AXES] = ['x', 'y', 'z', 'a', 'b', 'c'];

fn axis_index(c: char) -> Option<usize> {
    AXIS_LETTERS.iter().position(|&a| a == c)
}

fn is_linear(axis: usize) -> bool {
    axis < 3
}

/// Convert a stored mm value for reporting, honoring units mode.
fn report_linear(machine: &Machine, axis: usize, value: f32) -> f32 {
    if machine.canon.units_inches() && is_linear(axis) {
        value / MM_PER_INCH
    } else {
        value
    }
}

/// Convert an input value to mm for storage.
fn input_linear(machine: &Machine, axis: usize, value: f32) -> f32 {
    if machine.canon.units_inches() && is_linear(axis) {
        value * MM_PER_INCH
    } else {
        value
    }
}

fn round3(v: f32) -> Value {
    json!((v as f64 * 1000.0).round() / 1000.0)
}

/// Members of a group token, or None if the token is not a group.
pub fn group_members(token: &str) -> Option<Vec<String>> {
    let mut chars = token.chars();
    match (chars.next(), chars.next()) {
        (Some(a), None) if axis_index(a).is_some() => Some(
            ["vm", "fr", "jm", "jh"]
                .iter()
                .map(|s| format!("{a}{s}"))
                .collect(),
        ),
        (Some(m), None) if m.is_ascii_digit() && ('1'..='6').contains(&m) => Some(
            ["ma", "sa", "tr", "mi", "po", "pm", "pl", "su"]
                .iter()
                .map(|s| format!("{m}{s}"))
                .collect(),
        ),
        _ if token == "sys" => Some(
            ["jt", "ct", "mfo", "sv", "si", "qv", "fv", "fb", "hp", "hv", "id"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        ),
        _ => None,
    }
}

/// Read a token. Returns the JSON value to echo.
pub fn get(machine: &Machine, token: &str) -> Result<Value, Status> {
    // group read: an object of members
    if let Some(members) = group_members(token) {
        let mut map = serde_json::Map::new();
        for member in members {
            let value = get(machine, &member)?;
            let key = member.trim_start_matches(token).to_string();
            map.insert(key, value);
        }
        return Ok(Value::Object(map));
    }

    let mut chars = token.chars();
    let first = chars.next().ok_or(Status::UnrecognizedToken)?;
    let rest: String = chars.collect();

    // axis tokens
    if let Some(axis) = axis_index(first) {
        let a = &machine.planner.config.axes[axis];
        return match rest.as_str() {
            "vm" => Ok(round3(report_linear(machine, axis, a.velocity_max))),
            "fr" => Ok(round3(report_linear(machine, axis, a.feedrate_max))),
            "jm" => Ok(round3(a.jerk_max)),
            "jh" => Ok(round3(a.jerk_high)),
            _ => Err(Status::UnrecognizedToken),
        };
    }

    // motor tokens
    if first.is_ascii_digit() && ('1'..='6').contains(&first) {
        let m = first as usize - '1' as usize;
        let cfg = &machine.stepper.config[m];
        return match rest.as_str() {
            "ma" => Ok(json!(cfg.axis)),
            "sa" => Ok(round3(cfg.step_angle)),
            "tr" => Ok(round3(report_linear(machine, cfg.axis, cfg.travel_per_rev))),
            "mi" => Ok(json!(cfg.microsteps)),
            "po" => Ok(json!((cfg.polarity == Polarity::Reversed) as u8)),
            "pm" => Ok(json!(match cfg.power_mode {
                PowerMode::Disabled => 0,
                PowerMode::AlwaysOn => 1,
                PowerMode::InCycle => 2,
                PowerMode::WhenMoving => 3,
            })),
            "pl" => Ok(round3(cfg.power_level)),
            "su" => Ok(round3(cfg.steps_per_unit())),
            _ => Err(Status::UnrecognizedToken),
        };
    }

    // position reports: posx..posc (work frame), mpox..mpoc (machine frame)
    if let Some(axis_char) = token.strip_prefix("pos").and_then(|s| s.chars().next()) {
        if let Some(axis) = axis_index(axis_char) {
            let value = machine
                .canon
                .work_position(axis, machine.runtime.position[axis]);
            return Ok(round3(value));
        }
    }
    if let Some(axis_char) = token.strip_prefix("mpo").and_then(|s| s.chars().next()) {
        if let Some(axis) = axis_index(axis_char) {
            let value = machine.runtime.position[axis];
            return Ok(round3(report_linear(machine, axis, value)));
        }
    }

    match token {
        // machine knobs
        "jt" => Ok(round3(machine.planner.config.junction_integration_time)),
        "ct" => Ok(round3(machine.profile.chord_tolerance)),
        "mfo" => Ok(round3(machine.planner.mfo_factor)),
        "sv" => Ok(json!(machine.sr.verbosity)),
        "si" => Ok(json!(machine.sr.interval_ms)),
        "qv" => Ok(json!(machine.qr.verbosity)),

        // build identity
        "fv" => Ok(json!(machine.build.firmware_version)),
        "fb" => Ok(json!(machine.build.firmware_build)),
        "fbs" => Ok(json!(machine.build.firmware_build_string)),
        "hp" => Ok(json!(machine.build.hardware_platform)),
        "hv" => Ok(json!(machine.build.hardware_version)),
        "id" => Ok(json!(machine.build.id)),

        // live status values
        "stat" => Ok(json!(machine.stat().0)),
        "line" => Ok(json!(machine.canon.line_number)),
        "feed" => Ok(round3(machine.canon.feed_rate())),
        "vel" => Ok(round3(machine.runtime.segment_velocity)),
        "unit" => Ok(json!(machine.canon.units_inches() as u8)),
        "coor" => Ok(json!(machine.canon.coord_system() + 1)),
        "qr" => Ok(json!(machine.planner.queue.available())),
        "qi" => Ok(json!(machine.planner.queue.buffers_added)),
        "qo" => Ok(json!(machine.planner.queue.buffers_removed)),

        _ => Err(Status::UnrecognizedToken),
    }
}

/// Scalar read helper for wait predicates and tests.
pub fn get_scalar(machine: &Machine, token: &str) -> Option<f32> {
    match get(machine, token).ok()? {
        Value::Number(n) => n.as_f64().map(|v| v as f32),
        Value::Bool(b) => Some(b as u8 as f32),
        _ => None,
    }
}

fn numeric(value: &JsonValue) -> Option<f32> {
    match value {
        JsonValue::Number(v) => Some(*v),
        JsonValue::Bool(b) => Some(*b as u8 as f32),
        _ => None,
    }
}

/// Write a token. Range errors reject without writing.
pub fn set(machine: &mut Machine, token: &str, value: &JsonValue) -> Status {
    let mut chars = token.chars();
    let Some(first) = chars.next() else {
        return Status::UnrecognizedToken;
    };
    let rest: String = chars.collect();

    if let Some(axis) = axis_index(first) {
        let Some(v) = numeric(value) else {
            return Status::BadNumberFormat;
        };
        let v_mm = input_linear(machine, axis, v);
        let a = &mut machine.planner.config.axes[axis];
        return match rest.as_str() {
            "vm" if (1.0..=1_000_000.0).contains(&v_mm) => {
                a.velocity_max = v_mm;
                Status::Ok
            }
            "fr" if (1.0..=1_000_000.0).contains(&v_mm) => {
                a.feedrate_max = v_mm;
                Status::Ok
            }
            "jm" if (0.01..=100_000.0).contains(&v) => {
                a.jerk_max = v;
                Status::Ok
            }
            "jh" if (0.0..=100_000.0).contains(&v) => {
                a.jerk_high = v;
                Status::Ok
            }
            "vm" | "fr" | "jm" | "jh" => Status::ValueRangeError,
            _ => Status::UnrecognizedToken,
        };
    }

    if first.is_ascii_digit() && ('1'..='6').contains(&first) {
        let m = first as usize - '1' as usize;
        let Some(v) = numeric(value) else {
            return Status::BadNumberFormat;
        };
        let axis = machine.stepper.config[m].axis;
        let v_mm = input_linear(machine, axis, v);
        let cfg = &mut machine.stepper.config[m];
        return match rest.as_str() {
            "ma" if (0.0..AXES as f32).contains(&v) && v.fract() == 0.0 => {
                cfg.axis = v as usize;
                Status::Ok
            }
            "sa" if (0.1..=15.0).contains(&v) => {
                cfg.step_angle = v;
                Status::Ok
            }
            "tr" if v_mm > 0.0 => {
                cfg.travel_per_rev = v_mm;
                Status::Ok
            }
            "mi" if [1.0, 2.0, 4.0, 8.0, 16.0, 32.0].contains(&v) => {
                cfg.microsteps = v as u16;
                Status::Ok
            }
            "po" if v == 0.0 || v == 1.0 => {
                cfg.polarity = if v == 1.0 {
                    Polarity::Reversed
                } else {
                    Polarity::Normal
                };
                Status::Ok
            }
            "pm" if (0.0..=3.0).contains(&v) && v.fract() == 0.0 => {
                cfg.power_mode = match v as u8 {
                    0 => PowerMode::Disabled,
                    1 => PowerMode::AlwaysOn,
                    2 => PowerMode::InCycle,
                    _ => PowerMode::WhenMoving,
                };
                Status::Ok
            }
            "pl" if (0.0..=1.0).contains(&v) => {
                cfg.power_level = v;
                Status::Ok
            }
            "su" => Status::ReadOnlyValue,
            "ma" | "sa" | "tr" | "mi" | "po" | "pm" | "pl" => Status::ValueRangeError,
            _ => Status::UnrecognizedToken,
        };
    }

    match token {
        "jt" => match numeric(value) {
            Some(v) if (0.01..=10.0).contains(&v) => {
                machine.planner.config.junction_integration_time = v;
                Status::Ok
            }
            Some(_) => Status::ValueRangeError,
            None => Status::BadNumberFormat,
        },
        "ct" => match numeric(value) {
            Some(v) if (0.001..=1.0).contains(&v) => {
                machine.profile.chord_tolerance = v;
                Status::Ok
            }
            Some(_) => Status::ValueRangeError,
            None => Status::BadNumberFormat,
        },
        "mfo" => match numeric(value) {
            Some(v) if (0.05..=2.0).contains(&v) => {
                machine.planner.start_feed_override(v);
                Status::Ok
            }
            Some(_) => Status::ValueRangeError,
            None => Status::BadNumberFormat,
        },
        "sv" => match numeric(value) {
            Some(v) if (0.0..=2.0).contains(&v) && v.fract() == 0.0 => {
                machine.sr.verbosity = v as u8;
                Status::Ok
            }
            Some(_) => Status::ValueRangeError,
            None => Status::BadNumberFormat,
        },
        "si" => match numeric(value) {
            Some(v) if (50.0..=60_000.0).contains(&v) => {
                machine.sr.interval_ms = v as u32;
                Status::Ok
            }
            Some(_) => Status::ValueRangeError,
            None => Status::BadNumberFormat,
        },
        "qv" => match numeric(value) {
            Some(v) if (0.0..=2.0).contains(&v) && v.fract() == 0.0 => {
                machine.qr.verbosity = v as u8;
                Status::Ok
            }
            Some(_) => Status::ValueRangeError,
            None => Status::BadNumberFormat,
        },
        "clear" => machine.clear_alarm(),
        "fv" | "fb" | "fbs" | "hp" | "hv" | "id" | "stat" | "line" | "feed" | "vel" | "unit"
        | "coor" | "qr" | "qi" | "qo" => Status::ReadOnlyValue,
        _ => Status::UnrecognizedToken,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineProfile;

    fn machine() -> Machine {
        Machine::new(MachineProfile::default())
    }

    #[test]
    fn axis_token_round_trip() {
        let mut m = machine();
        assert_eq!(set(&mut m, "xvm", &JsonValue::Number(24000.0)), Status::Ok);
        assert_eq!(get_scalar(&m, "xvm"), Some(24000.0));
    }

    #[test]
    fn round_trip_honors_units_mode() {
        let mut m = machine();
        m.canon.process_line("G20").unwrap(); // inches
        assert_eq!(set(&mut m, "xvm", &JsonValue::Number(400.0)), Status::Ok);
        // stored in mm
        assert!((m.planner.config.axes[0].velocity_max - 400.0 * MM_PER_INCH).abs() < 1e-2);
        // reported back in inches
        assert!((get_scalar(&m, "xvm").unwrap() - 400.0).abs() < 1e-2);
    }

    #[test]
    fn range_errors_do_not_write() {
        let mut m = machine();
        let before = m.planner.config.axes[0].velocity_max;
        assert_eq!(
            set(&mut m, "xvm", &JsonValue::Number(-5.0)),
            Status::ValueRangeError
        );
        assert_eq!(m.planner.config.axes[0].velocity_max, before);
    }

    #[test]
    fn read_only_tokens_refuse_writes() {
        let mut m = machine();
        assert_eq!(
            set(&mut m, "fb", &JsonValue::Number(1.0)),
            Status::ReadOnlyValue
        );
        assert_eq!(
            set(&mut m, "1su", &JsonValue::Number(100.0)),
            Status::ReadOnlyValue
        );
    }

    #[test]
    fn motor_tokens() {
        let mut m = machine();
        assert_eq!(set(&mut m, "1mi", &JsonValue::Number(16.0)), Status::Ok);
        assert_eq!(get_scalar(&m, "1mi"), Some(16.0));
        assert_eq!(
            set(&mut m, "1mi", &JsonValue::Number(3.0)),
            Status::ValueRangeError
        );
    }

    #[test]
    fn group_read_expands_members() {
        let m = machine();
        let value = get(&m, "x").unwrap();
        assert!(value.get("vm").is_some());
        assert!(value.get("jm").is_some());
    }

    #[test]
    fn unknown_token_is_rejected() {
        let m = machine();
        assert_eq!(get(&m, "zzz").unwrap_err(), Status::UnrecognizedToken);
    }
}
