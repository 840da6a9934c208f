//! Arc generation: decompose G2/G3 into short linear segments under a
//! chord-tolerance bound.
//!
//! Arcs can require thousands of segments, so the generator is a
//! continuation: [`ArcGenerator::callback`] is polled from the dispatcher
//! and feeds the planner only while it has room, yielding between passes.

use tracing::debug;

use crate::error::PlanError;
use crate::planner::Planner;
use crate::state::{MotionSignals, MoveState};
use crate::{Axes, AXES, EPSILON};

/// Default maximum deviation of a chord from the true arc, mm.
pub const CHORD_TOLERANCE: f32 = 0.01;
/// Arc segments shorter than this time are pointless (minutes; 2 ms).
pub const MIN_ARC_SEGMENT_TIME: f32 = 0.002 / 60.0;

/// Selected arc plane (G17/G18/G19) as a pair of circle axes plus the
/// remaining linear axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArcPlaneSelect {
    #[default]
    Xy,
    Xz,
    Yz,
}

impl ArcPlaneSelect {
    /// (first circle axis, second circle axis, linear axis)
    pub fn axes(&self) -> (usize, usize, usize) {
        match self {
            ArcPlaneSelect::Xy => (0, 1, 2),
            ArcPlaneSelect::Xz => (0, 2, 1),
            ArcPlaneSelect::Yz => (1, 2, 0),
        }
    }
}

/// A fully resolved arc request.
#[derive(Debug, Clone, Copy)]
pub struct ArcSpec {
    /// Move state template applied to every emitted segment.
    pub gm: MoveState,
    /// Arc endpoint (absolute, all axes).
    pub target: Axes,
    /// Circle center offsets from the start point, plane axes only.
    pub offset: [f32; 3],
    pub plane: ArcPlaneSelect,
    /// True for G2 (clockwise).
    pub clockwise: bool,
    /// Extra full turns (P word).
    pub rotations: u32,
    pub chord_tolerance: f32,
}

/// The restartable arc state machine.
#[derive(Debug, Default)]
pub struct ArcGenerator {
    active: bool,
    gm: MoveState,
    plane: ArcPlaneSelect,

    // Geometry, all in the arc plane.
    center_0: f32,
    center_1: f32,
    radius: f32,
    theta: f32,
    angular_increment: f32,
    linear_increment: f32,
    linear_position: f32,

    segments_remaining: u32,
    final_target: Axes,
}

/// What the arc callback did this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArcStatus {
    Inactive,
    /// Yielded with segments left to emit.
    Running,
    Done,
}

impl ArcGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Abort an in-flight arc (queue flush, alarm).
    pub fn abort(&mut self) {
        self.active = false;
    }

    /// Set up an arc from the current position. Returns the usual
    /// minimum-length rejection if the arc is degenerate.
    pub fn start(&mut self, spec: &ArcSpec, position: &Axes) -> Result<(), PlanError> {
        let (a0, a1, lin) = spec.plane.axes();

        let start_0 = position[a0];
        let start_1 = position[a1];
        let end_0 = spec.target[a0];
        let end_1 = spec.target[a1];

        self.center_0 = start_0 + spec.offset[0];
        self.center_1 = start_1 + spec.offset[1];
        let r_start = ((start_0 - self.center_0).powi(2) + (start_1 - self.center_1).powi(2)).sqrt();
        let r_end = ((end_0 - self.center_0).powi(2) + (end_1 - self.center_1).powi(2)).sqrt();
        if r_start < EPSILON {
            return Err(PlanError::MinimumLengthMove);
        }
        self.radius = r_start;

        // Sweep angle, honoring direction and extra rotations. A zero sweep
        // with matching endpoints is a full circle.
        let theta_start = (start_1 - self.center_1).atan2(start_0 - self.center_0);
        let theta_end = (end_1 - self.center_1).atan2(end_0 - self.center_0);
        let mut sweep = theta_end - theta_start;
        if spec.clockwise {
            if sweep > -EPSILON {
                sweep -= 2.0 * core::f32::consts::PI;
            }
        } else if sweep < EPSILON {
            sweep += 2.0 * core::f32::consts::PI;
        }
        sweep += 2.0 * core::f32::consts::PI
            * spec.rotations as f32
            * if spec.clockwise { -1.0 } else { 1.0 };

        let arc_length = sweep.abs() * self.radius;
        let linear_travel = spec.target[lin] - position[lin];
        let length = (arc_length * arc_length + linear_travel * linear_travel).sqrt();
        if length < crate::MIN_LENGTH_MOVE {
            return Err(PlanError::MinimumLengthMove);
        }

        // Segment count: enough for chordal accuracy, but never segments
        // shorter than the minimum arc segment time at this feed.
        let ct = spec.chord_tolerance.max(0.001);
        let max_seg_len = 2.0 * (ct * (2.0 * self.radius - ct)).max(0.0).sqrt();
        let segments_for_chord = length / max_seg_len.max(EPSILON);
        let arc_time = length / spec.gm.feed_rate.max(1.0); // minutes
        let segments_for_time = arc_time / MIN_ARC_SEGMENT_TIME;
        let segments = segments_for_chord.max(segments_for_time).ceil().max(1.0);

        self.segments_remaining = segments as u32;
        self.angular_increment = sweep / segments;
        self.linear_increment = linear_travel / segments;
        self.linear_position = position[lin];
        self.theta = theta_start;
        self.gm = spec.gm;
        self.plane = spec.plane;
        self.final_target = spec.target;
        self.active = true;

        // Interpolate the radius too, for spiral-out (r_end != r_start).
        if (r_end - r_start).abs() > EPSILON {
            debug!(r_start, r_end, "arc endpoints have differing radii; spiraling");
        }

        debug!(segments = self.segments_remaining, sweep, "arc started");
        Ok(())
    }

    /// Emit segments while the planner has room; yield otherwise. Called
    /// from the dispatcher each pass.
    pub fn callback(
        &mut self,
        planner: &mut Planner,
        signals: &mut MotionSignals,
        now_ms: u32,
    ) -> Result<ArcStatus, PlanError> {
        if !self.active {
            return Ok(ArcStatus::Inactive);
        }
        let (a0, a1, lin) = self.plane.axes();

        while self.segments_remaining > 0 {
            if planner.is_full() {
                return Ok(ArcStatus::Running); // yield to the dispatcher
            }
            self.segments_remaining -= 1;
            self.theta += self.angular_increment;
            self.linear_position += self.linear_increment;

            let mut gm = self.gm;
            if self.segments_remaining == 0 {
                // land exactly on the programmed endpoint
                gm.target = self.final_target;
            } else {
                gm.target = self.final_target;
                gm.target[a0] = self.center_0 + self.radius * self.theta.cos();
                gm.target[a1] = self.center_1 + self.radius * self.theta.sin();
                gm.target[lin] = self.linear_position;
            }

            match planner.aline(&gm, signals, now_ms) {
                Ok(()) => {}
                // A chord that rounds below minimum length just merges into
                // the next one.
                Err(PlanError::MinimumLengthMove) => {}
                Err(e) => {
                    self.active = false;
                    return Err(e);
                }
            }
        }
        self.active = false;
        Ok(ArcStatus::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MotionSignals;
    use crate::{AXIS_X, AXIS_Y};

    fn full_circle_spec(radius: f32, feed: f32) -> ArcSpec {
        // start at (radius, 0), center at origin: I = -radius
        let mut gm = MoveState::default();
        gm.feed_rate = feed;
        let mut target = [0.0; AXES];
        target[AXIS_X] = radius;
        ArcSpec {
            gm,
            target,
            offset: [-radius, 0.0, 0.0],
            plane: ArcPlaneSelect::Xy,
            clockwise: true,
            rotations: 0,
            chord_tolerance: CHORD_TOLERANCE,
        }
    }

    #[test]
    fn small_circle_emits_bounded_chords() {
        let mut planner = Planner::default();
        let mut signals = MotionSignals::default();
        let mut arc = ArcGenerator::new();

        let mut position = [0.0; AXES];
        position[AXIS_X] = 5.0;
        planner.position = position;

        let spec = full_circle_spec(5.0, 1200.0);
        arc.start(&spec, &position).unwrap();

        let mut emitted = 0;
        loop {
            match arc.callback(&mut planner, &mut signals, 0).unwrap() {
                ArcStatus::Done => break,
                ArcStatus::Running => {
                    // dispatcher would drain the queue; emulate by flushing
                    emitted += crate::PLANNER_BUFFER_POOL_SIZE - planner.queue.available();
                    let pos = planner.position;
                    planner.flush(&pos);
                }
                ArcStatus::Inactive => unreachable!(),
            }
        }
        emitted += crate::PLANNER_BUFFER_POOL_SIZE - planner.queue.available();

        // chord bound: every segment <= 2 sqrt(r * ct)
        let bound = 2.0 * (5.0_f32 * CHORD_TOLERANCE).sqrt();
        let expected_min = (2.0 * core::f32::consts::PI * 5.0 / bound) as usize;
        assert!(
            emitted >= expected_min,
            "{emitted} segments < {expected_min}"
        );
        assert!(emitted >= 100);
    }

    #[test]
    fn arc_lands_on_programmed_endpoint() {
        let mut planner = Planner::default();
        let mut signals = MotionSignals::default();
        let mut arc = ArcGenerator::new();

        let mut position = [0.0; AXES];
        position[AXIS_X] = 10.0;
        planner.position = position;

        // quarter circle to (0, 10), center at origin
        let mut gm = MoveState::default();
        gm.feed_rate = 600.0;
        let mut target = [0.0; AXES];
        target[AXIS_Y] = 10.0;
        let spec = ArcSpec {
            gm,
            target,
            offset: [-10.0, 0.0, 0.0],
            plane: ArcPlaneSelect::Xy,
            clockwise: false,
            rotations: 0,
            chord_tolerance: CHORD_TOLERANCE,
        };
        arc.start(&spec, &position).unwrap();
        while arc.callback(&mut planner, &mut signals, 0).unwrap() == ArcStatus::Running {
            let pos = planner.position;
            planner.flush(&pos);
        }
        assert!((planner.position[AXIS_Y] - 10.0).abs() < 1e-4);
        assert!(planner.position[AXIS_X].abs() < 1e-4);
    }

    #[test]
    fn degenerate_arc_is_rejected() {
        let mut arc = ArcGenerator::new();
        let position = [0.0; AXES];
        let mut spec = full_circle_spec(5.0, 600.0);
        spec.offset = [0.0, 0.0, 0.0]; // zero radius
        assert_eq!(
            arc.start(&spec, &position),
            Err(PlanError::MinimumLengthMove)
        );
    }
}
