//! # Motion Control Crate
//!
//! The look-ahead motion planner and runtime segment executor: G-code move
//! intents go in one end, prepared step segments come out the other.
//!
//! Pipeline: [`Planner::aline`] queues a block -> back-planning propagates
//! braking velocities toward the running block -> just-in-time forward
//! planning sizes the ramp for the block about to run ([`zoid`]) -> the
//! segment executor ([`exec`]) plays the ramp out as fixed-duration segments
//! using quintic-Bezier forward differencing and hands step counts to the
//! `stepper` prep buffer.
//!
//! ## Execution contexts
//!
//! This crate contains no threads and no interrupt glue. Its entry points
//! are written to be driven from four strictly-prioritized contexts
//! (main loop < forward-plan < exec < DDA); the host and the simulator
//! provide the scheduling. Functions document which context they expect.
//!
//! All kinematic math is `f32`. Lengths are mm, velocities mm/min, jerk
//! mm/min^3, time minutes. Float comparisons go through [`fp_eq`] /
//! [`fp_zero`]; never compare velocities or lengths directly.

pub mod arc;
pub mod buffer;
pub mod error;
pub mod exec;
pub mod kinematics;
pub mod planner;
pub mod state;
pub mod zoid;

pub use arc::{ArcGenerator, ArcPlaneSelect, ArcSpec};
pub use buffer::{Block, BlockKind, BufferState, Hint, PlannerQueue};
pub use error::PlanError;
pub use exec::{ExecStatus, Runtime};
pub use kinematics::{CartesianKinematics, CoreXyKinematics, Kinematics};
pub use planner::{AxisConfig, Planner, PlannerConfig, PlannerState};
pub use state::{
    FeedRateMode, HoldState, HoldType, MotionMode, MotionState, MoveState, PathControl, Section,
};

/// Number of logical axes: X Y Z A B C.
pub const AXES: usize = 6;

/// Axis vector type used throughout the planner and runtime.
pub type Axes = [f32; AXES];

pub const AXIS_X: usize = 0;
pub const AXIS_Y: usize = 1;
pub const AXIS_Z: usize = 2;
pub const AXIS_A: usize = 3;
pub const AXIS_B: usize = 4;
pub const AXIS_C: usize = 5;

/// General-purpose float comparison tolerance.
pub const EPSILON: f32 = 1e-5;
/// Coarser tolerance for lengths: 0.1 microns.
pub const EPSILON2: f32 = 1e-4;

/// Moves shorter than this are rejected outright (0.1 microns).
pub const MIN_LENGTH_MOVE: f32 = 0.0001;

/// Nominal segment duration, in minutes (750 us).
pub const NOM_SEGMENT_TIME: f32 = 750.0e-6 / 60.0;
/// Floor for any section that will actually run, in minutes (250 us).
pub const MIN_SEGMENT_TIME: f32 = 250.0e-6 / 60.0;
/// Floor for a whole block, in minutes (1 ms).
pub const MIN_BLOCK_TIME: f32 = 0.001 / 60.0;

/// Planner queue depth.
pub const PLANNER_BUFFER_POOL_SIZE: usize = 48;
/// Free blocks required before the dispatcher reads another data line.
pub const PLANNER_BUFFER_HEADROOM: usize = 4;

/// Milliseconds after the last commit before planning proceeds with a
/// partially filled queue.
pub const BLOCK_TIMEOUT_MS: u32 = 30;

/// Planner slack (minutes of buffered motion) above which non-essential
/// work like reports is allowed to run.
pub const PHAT_CITY_TIME: f32 = 0.100 / 60.0;

/// Config jerk values are entered in millions of mm/min^3.
pub const JERK_MULTIPLIER: f32 = 1_000_000.0;

/// Feed override range and default ramp, factor per minute.
pub const FEED_OVERRIDE_MIN: f32 = 0.05;
pub const FEED_OVERRIDE_MAX: f32 = 2.00;
pub const FEED_OVERRIDE_RAMP_TIME: f32 = 0.500 / 60.0;

#[inline]
pub fn fp_zero(v: f32) -> bool {
    v.abs() < EPSILON
}

#[inline]
pub fn fp_eq(a: f32, b: f32) -> bool {
    (a - b).abs() < EPSILON
}

/// Velocities within 0.0001 mm/min are the same velocity.
#[inline]
pub fn velocity_eq(a: f32, b: f32) -> bool {
    (a - b).abs() < EPSILON2
}

/// Euclidean distance between two axis vectors.
pub fn axis_vector_length(a: &Axes, b: &Axes) -> f32 {
    let mut sum = 0.0;
    for axis in 0..AXES {
        let d = a[axis] - b[axis];
        sum += d * d;
    }
    sum.sqrt()
}
