//! The canonical machine: modal state and coordinate bookkeeping.
//!
//! Turns parsed blocks into machine [`Action`]s with targets in absolute
//! machine coordinates (mm). Owns everything modal: units, distance mode,
//! plane, coordinate systems, G92, feed mode, sticky motion mode.

use tracing::debug;

use crate::parser::{comment_payload, parse_block, ParseError};
use crate::{AXES, MM_PER_INCH};

/// Arc plane (G17/G18/G19).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub enum Plane {
    #[default]
    Xy,
    Xz,
    Yz,
}

/// Path control mode (G61/G61.1/G64).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub enum PathMode {
    ExactPath,
    ExactStop,
    #[default]
    Continuous,
}

/// A linear move ready for the planner.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct MoveIntent {
    /// Absolute machine coordinates, mm (degrees for ABC).
    pub target: [f32; AXES],
    /// mm/min, or move time in minutes under inverse-time mode.
    pub feed_rate: f32,
    pub inverse_time: bool,
    pub traverse: bool,
    pub path_mode: PathMode,
    pub line_number: u32,
    pub units_inches: bool,
    pub coord_system: u8,
}

/// An arc move: a linear intent plus circle geometry.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct ArcIntent {
    pub base: MoveIntent,
    /// Center offsets from the start point in plane order (I/J/K), mm.
    pub offset: [f32; 3],
    /// R-word radius if given instead of offsets, mm.
    pub radius: Option<f32>,
    pub clockwise: bool,
    /// Extra full circles (P word).
    pub rotations: u32,
    pub plane: Plane,
}

/// A straight probe (G38.2 / G38.3).
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct ProbeIntent {
    pub base: MoveIntent,
    /// G38.2 alarms if the probe never trips; G38.3 reports and moves on.
    pub alarm_on_miss: bool,
}

/// What a block commands the machine to do, in execution order.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Move(MoveIntent),
    Arc(ArcIntent),
    Probe(ProbeIntent),
    Dwell { seconds: f32 },
    /// M100: a JSON command sequenced with motion.
    QueuedCommand { json: String },
    /// M101: stall the queue until the JSON predicate is true.
    QueuedWait { json: String },
    /// G28.2: run the homing cycle on the flagged axes.
    Home { axes: [bool; AXES] },
    ProgramStop,
    OptionalStop,
    ProgramEnd,
}

const AXIS_LETTERS: [char; AXES] = ['X', 'Y', 'Z', 'A', 'B', 'C'];

/// Modal + positional state of the interpreter.
#[derive(Debug)]
pub struct CanonicalMachine {
    /// Program position in machine coordinates, mm.
    pub position: [f32; AXES],
    units_inches: bool,
    absolute_mode: bool,
    inverse_time: bool,
    plane: Plane,
    path_mode: PathMode,
    /// Sticky motion mode, keyed as G-number * 10 (G38.2 -> 382).
    motion_mode: Option<u16>,
    feed_rate: f32,
    coord_system: u8,
    coord_offsets: [[f32; AXES]; 6],
    g92_offset: [f32; AXES],
    g92_active: bool,
    pub line_number: u32,
}

impl Default for CanonicalMachine {
    fn default() -> Self {
        Self {
            position: [0.0; AXES],
            units_inches: false,
            absolute_mode: true,
            inverse_time: false,
            plane: Plane::Xy,
            path_mode: PathMode::Continuous,
            motion_mode: None,
            feed_rate: 0.0,
            coord_system: 0,
            coord_offsets: [[0.0; AXES]; 6],
            g92_offset: [0.0; AXES],
            g92_active: false,
            line_number: 0,
        }
    }
}

impl CanonicalMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn units_inches(&self) -> bool {
        self.units_inches
    }

    pub fn coord_system(&self) -> u8 {
        self.coord_system
    }

    pub fn feed_rate(&self) -> f32 {
        self.feed_rate
    }

    /// Set a work coordinate system offset (config writes, G10 L2).
    pub fn set_coord_offset(&mut self, system: usize, axis: usize, value: f32) {
        self.coord_offsets[system][axis] = value;
    }

    /// Machine position -> position displayed in the active work frame.
    pub fn display_position(&self, axis: usize) -> f32 {
        self.work_position(axis, self.position[axis])
    }

    /// Convert an arbitrary machine-coordinate value (the runtime position,
    /// typically) into the active work frame and display units.
    pub fn work_position(&self, axis: usize, machine_value: f32) -> f32 {
        let value = machine_value - self.total_offset(axis);
        if self.units_inches && axis < 3 {
            value / MM_PER_INCH
        } else {
            value
        }
    }

    /// Overwrite the program position (probe landing, homing, feedhold
    /// flush). Machine coordinates.
    pub fn set_position(&mut self, position: &[f32; AXES]) {
        self.position = *position;
    }

    fn total_offset(&self, axis: usize) -> f32 {
        self.coord_offsets[self.coord_system as usize][axis]
            + if self.g92_active {
                self.g92_offset[axis]
            } else {
                0.0
            }
    }

    fn to_mm(&self, axis: usize, value: f32) -> f32 {
        // linear axes convert; rotary stay in degrees
        if self.units_inches && axis < 3 {
            value * MM_PER_INCH
        } else {
            value
        }
    }

    /// Interpret one line. Returns the actions in the order they must
    /// execute. Modal state updates even for lines that produce no action.
    pub fn process_line(&mut self, line: &str) -> Result<Vec<Action>, ParseError> {
        let block = parse_block(line)?;
        if let Some(n) = block.line_number {
            self.line_number = n;
        }

        let mut actions = Vec::new();

        let mut axis_values: [Option<f32>; AXES] = [None; AXES];
        let mut offset_ijk: [Option<f32>; 3] = [None; 3];
        let mut radius: Option<f32> = None;
        let mut p_word: Option<f32> = None;
        let mut l_word: Option<f32> = None;
        let mut feed_word: Option<f32> = None;
        let mut motion_this_block: Option<u16> = None;
        let mut non_modal_g53 = false;
        let mut dwell = false;
        let mut set_offsets = false; // G10
        let mut g92_set = false;
        let mut home = false;
        let mut m_actions: Vec<Action> = Vec::new();

        for word in &block.words {
            match word.letter {
                'G' => {
                    let code = (word.value * 10.0).round() as u16;
                    match code {
                        0 | 10 | 20 | 30 | 382 | 383 => {
                            if motion_this_block.is_some() {
                                return Err(ParseError::ModalGroupViolation);
                            }
                            motion_this_block = Some(code);
                        }
                        40 => dwell = true,
                        100 => set_offsets = true,
                        170 => self.plane = Plane::Xy,
                        180 => self.plane = Plane::Xz,
                        190 => self.plane = Plane::Yz,
                        200 => self.units_inches = true,
                        210 => self.units_inches = false,
                        282 => home = true,
                        530 => non_modal_g53 = true,
                        540..=590 if code % 10 == 0 => {
                            self.coord_system = ((code - 540) / 10) as u8;
                        }
                        610 => self.path_mode = PathMode::ExactStop,
                        611 => self.path_mode = PathMode::ExactStop,
                        640 => self.path_mode = PathMode::Continuous,
                        800 => motion_this_block = Some(800), // cancel
                        900 => self.absolute_mode = true,
                        910 => self.absolute_mode = false,
                        920 => g92_set = true,
                        921 => {
                            self.g92_active = false;
                            self.g92_offset = [0.0; AXES];
                        }
                        930 => self.inverse_time = true,
                        940 => self.inverse_time = false,
                        _ => return Err(ParseError::Unsupported('G', (code / 10) as i32)),
                    }
                }
                'M' => {
                    let code = word.value.round() as i32;
                    match code {
                        0 => m_actions.push(Action::ProgramStop),
                        1 => m_actions.push(Action::OptionalStop),
                        2 | 30 => m_actions.push(Action::ProgramEnd),
                        // spindle and coolant belong to external collaborators
                        3..=9 => {}
                        48 | 49 => {}
                        100 => {
                            let json = comment_payload(line)
                                .ok_or(ParseError::BadWord('M'))?
                                .to_string();
                            m_actions.push(Action::QueuedCommand { json });
                        }
                        101 => {
                            let json = comment_payload(line)
                                .ok_or(ParseError::BadWord('M'))?
                                .to_string();
                            m_actions.push(Action::QueuedWait { json });
                        }
                        _ => return Err(ParseError::Unsupported('M', code)),
                    }
                }
                'F' => feed_word = Some(word.value),
                'P' => p_word = Some(word.value),
                'L' => l_word = Some(word.value),
                'R' => radius = Some(word.value),
                'I' => offset_ijk[0] = Some(word.value),
                'J' => offset_ijk[1] = Some(word.value),
                'K' => offset_ijk[2] = Some(word.value),
                'S' | 'T' => {} // spindle speed / tool select: collaborators
                c => {
                    if let Some(axis) = AXIS_LETTERS.iter().position(|&a| a == c) {
                        axis_values[axis] = Some(word.value);
                    } else {
                        return Err(ParseError::BadWord(c));
                    }
                }
            }
        }

        // Feed is modal; convert on entry.
        if let Some(f) = feed_word {
            if f <= 0.0 {
                return Err(ParseError::ValueRange);
            }
            self.feed_rate = if self.inverse_time {
                1.0 / f // un-invert to minutes
            } else if self.units_inches {
                f * MM_PER_INCH
            } else {
                f
            };
        }

        // Non-motion actions that consume axis words.
        if g92_set {
            for axis in 0..AXES {
                if let Some(v) = axis_values[axis] {
                    let v = self.to_mm(axis, v);
                    self.g92_offset[axis] = self.position[axis]
                        - self.coord_offsets[self.coord_system as usize][axis]
                        - v;
                }
            }
            self.g92_active = true;
            return Ok(actions);
        }
        if set_offsets {
            // G10 L2 P<sys> <axes>: set coordinate system offsets
            if l_word.map(|l| l as i32) != Some(2) {
                return Err(ParseError::Unsupported('G', 10));
            }
            let p = p_word.ok_or(ParseError::AxisMissing)? as usize;
            if !(1..=6).contains(&p) {
                return Err(ParseError::ValueRange);
            }
            for axis in 0..AXES {
                if let Some(v) = axis_values[axis] {
                    self.coord_offsets[p - 1][axis] = self.to_mm(axis, v);
                }
            }
            return Ok(actions);
        }
        if home {
            let mut axes = [false; AXES];
            let mut any = false;
            for axis in 0..AXES {
                if axis_values[axis].is_some() {
                    axes[axis] = true;
                    any = true;
                }
            }
            if !any {
                axes = [true; AXES];
            }
            actions.push(Action::Home { axes });
            return Ok(actions);
        }
        if dwell {
            let seconds = p_word.ok_or(ParseError::BadNumber('P'))?;
            if seconds < 0.0 {
                return Err(ParseError::ValueRange);
            }
            actions.push(Action::Dwell { seconds });
        }

        // Motion. A block with axis words but no explicit motion word uses
        // the sticky motion mode.
        let has_axis_words = axis_values.iter().any(Option::is_some);
        let motion = motion_this_block.or(if has_axis_words {
            self.motion_mode
        } else {
            None
        });

        if let Some(code) = motion {
            if code != 800 {
                self.motion_mode = Some(code);
            }
            if has_axis_words && code != 800 {
                let target = self.resolve_target(&axis_values, non_modal_g53);
                let intent = self.move_intent(target, code == 0);

                match code {
                    0 | 10 => {
                        if code == 10 && self.feed_rate <= 0.0 {
                            return Err(ParseError::FeedRateMissing);
                        }
                        actions.push(Action::Move(intent));
                        self.position = target;
                    }
                    20 | 30 => {
                        if self.feed_rate <= 0.0 {
                            return Err(ParseError::FeedRateMissing);
                        }
                        if offset_ijk.iter().all(Option::is_none) && radius.is_none() {
                            return Err(ParseError::ArcSpecification);
                        }
                        let mut offset = [0.0_f32; 3];
                        let (a0, a1, _) = plane_axes(self.plane);
                        let ijk = [offset_ijk[a0], offset_ijk[a1]];
                        offset[0] = self.to_mm(a0, ijk[0].unwrap_or(0.0));
                        offset[1] = self.to_mm(a1, ijk[1].unwrap_or(0.0));
                        let radius_mm = radius.map(|r| self.to_mm(0, r));
                        let rotations = p_word.map(|p| p as u32).unwrap_or(0);
                        actions.push(Action::Arc(ArcIntent {
                            base: intent,
                            offset,
                            radius: radius_mm,
                            clockwise: code == 20,
                            rotations,
                            plane: self.plane,
                        }));
                        self.position = target;
                    }
                    382 | 383 => {
                        if self.feed_rate <= 0.0 {
                            return Err(ParseError::FeedRateMissing);
                        }
                        // Position advances when the probe cycle reports
                        // where it actually stopped, not here.
                        actions.push(Action::Probe(ProbeIntent {
                            base: intent,
                            alarm_on_miss: code == 382,
                        }));
                    }
                    _ => return Err(ParseError::Unsupported('G', (code / 10) as i32)),
                }
            } else if has_axis_words {
                return Err(ParseError::AxisMissing);
            }
        } else if has_axis_words {
            return Err(ParseError::AxisMissing); // axis words with no motion mode
        }

        actions.extend(m_actions);
        debug!(line = self.line_number, actions = actions.len(), "block");
        Ok(actions)
    }

    fn resolve_target(&self, axis_values: &[Option<f32>; AXES], g53: bool) -> [f32; AXES] {
        let mut target = self.position;
        for axis in 0..AXES {
            if let Some(v) = axis_values[axis] {
                let v = self.to_mm(axis, v);
                target[axis] = if g53 {
                    v
                } else if self.absolute_mode {
                    v + self.total_offset(axis)
                } else {
                    self.position[axis] + v
                };
            }
        }
        target
    }

    fn move_intent(&self, target: [f32; AXES], traverse: bool) -> MoveIntent {
        MoveIntent {
            target,
            feed_rate: self.feed_rate,
            inverse_time: self.inverse_time,
            traverse,
            path_mode: self.path_mode,
            line_number: self.line_number,
            units_inches: self.units_inches,
            coord_system: self.coord_system,
        }
    }
}

fn plane_axes(plane: Plane) -> (usize, usize, usize) {
    match plane {
        Plane::Xy => (0, 1, 2),
        Plane::Xz => (0, 2, 1),
        Plane::Yz => (1, 2, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_move(cm: &mut CanonicalMachine, line: &str) -> MoveIntent {
        let actions = cm.process_line(line).unwrap();
        match &actions[0] {
            Action::Move(m) => *m,
            other => panic!("expected move, got {other:?}"),
        }
    }

    #[test]
    fn absolute_and_incremental_targets() {
        let mut cm = CanonicalMachine::new();
        let m = one_move(&mut cm, "G90 G1 X10 F600");
        assert_eq!(m.target[0], 10.0);
        cm.process_line("G91").unwrap();
        let m = one_move(&mut cm, "G1 X5");
        assert_eq!(m.target[0], 15.0);
    }

    #[test]
    fn sticky_motion_mode() {
        let mut cm = CanonicalMachine::new();
        cm.process_line("G1 X1 F600").unwrap();
        let m = one_move(&mut cm, "X2 Y3");
        assert!(!m.traverse);
        assert_eq!(m.target[0], 2.0);
        assert_eq!(m.target[1], 3.0);
    }

    #[test]
    fn inch_mode_converts_linear_axes() {
        let mut cm = CanonicalMachine::new();
        let m = one_move(&mut cm, "G20 G1 X1 A90 F10");
        assert!((m.target[0] - 25.4).abs() < 1e-4);
        assert_eq!(m.target[3], 90.0); // rotary stays degrees
        assert!((m.feed_rate - 254.0).abs() < 1e-3);
    }

    #[test]
    fn coord_system_offsets_apply() {
        let mut cm = CanonicalMachine::new();
        cm.process_line("G10 L2 P2 X100").unwrap(); // set G55 X offset
        cm.process_line("G55").unwrap();
        let m = one_move(&mut cm, "G1 X5 F600");
        assert_eq!(m.target[0], 105.0);
        assert_eq!(m.coord_system, 1);
    }

    #[test]
    fn g92_offsets_and_cancel() {
        let mut cm = CanonicalMachine::new();
        cm.process_line("G1 X10 F600").unwrap();
        cm.process_line("G92 X0").unwrap(); // here is now X0
        let m = one_move(&mut cm, "G1 X5");
        assert_eq!(m.target[0], 15.0);
        cm.process_line("G92.1").unwrap();
        let m = one_move(&mut cm, "G1 X5");
        assert_eq!(m.target[0], 5.0);
    }

    #[test]
    fn feed_required_for_feeds() {
        let mut cm = CanonicalMachine::new();
        assert_eq!(
            cm.process_line("G1 X10"),
            Err(ParseError::FeedRateMissing)
        );
        // traverses don't need feed
        assert!(cm.process_line("G0 X10").is_ok());
    }

    #[test]
    fn inverse_time_mode_uninverts() {
        let mut cm = CanonicalMachine::new();
        let m = one_move(&mut cm, "G93 G1 X10 F2"); // whole move in 1/2 min
        assert!(m.inverse_time);
        assert!((m.feed_rate - 0.5).abs() < 1e-6);
    }

    #[test]
    fn arc_requires_geometry() {
        let mut cm = CanonicalMachine::new();
        cm.process_line("F600").unwrap();
        assert_eq!(
            cm.process_line("G2 X1 Y1"),
            Err(ParseError::ArcSpecification)
        );
        let actions = cm.process_line("G2 X0 Y0 I-5 J0").unwrap();
        assert!(matches!(actions[0], Action::Arc(_)));
    }

    #[test]
    fn probe_does_not_advance_position() {
        let mut cm = CanonicalMachine::new();
        cm.process_line("G38.3 Z-20 F50").unwrap();
        assert_eq!(cm.position[2], 0.0);
    }

    #[test]
    fn program_end() {
        let mut cm = CanonicalMachine::new();
        let actions = cm.process_line("M30").unwrap();
        assert!(matches!(actions[0], Action::ProgramEnd));
    }

    #[test]
    fn two_motion_words_is_modal_violation() {
        let mut cm = CanonicalMachine::new();
        assert_eq!(
            cm.process_line("G0 G1 X5 F100"),
            Err(ParseError::ModalGroupViolation)
        );
    }
}
