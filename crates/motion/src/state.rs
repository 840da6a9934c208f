//! Shared motion-facing state: the move intent snapshot carried in each
//! block, and the machine/hold state enums the executor and the cycle
//! machines coordinate through.

use crate::Axes;

/// How the F word is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde-support", derive(serde::Serialize, serde::Deserialize))]
pub enum FeedRateMode {
    /// G93: F is 1/minutes for the whole move. `aline` receives it already
    /// un-inverted to minutes.
    InverseTime,
    /// G94
    #[default]
    UnitsPerMinute,
}

/// Motion mode of a block, as far as the planner cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde-support", derive(serde::Serialize, serde::Deserialize))]
pub enum MotionMode {
    /// G0. Ignores feed rate; runs at traverse limits.
    Traverse,
    /// G1/G2/G3 (arcs arrive as linear segments).
    #[default]
    Feed,
    /// G38.x. Planned like a feed; the probe cycle owns the stop.
    Probe,
}

/// Path control mode (G61/G61.1/G64).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde-support", derive(serde::Serialize, serde::Deserialize))]
pub enum PathControl {
    ExactPath,
    /// Come to a full stop at the end of each block.
    ExactStop,
    #[default]
    Continuous,
}

/// The G-code state snapshot a block carries: everything the planner and
/// runtime need to know about the move, nothing the parser keeps to itself.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "serde-support", derive(serde::Serialize, serde::Deserialize))]
pub struct MoveState {
    /// Target in the active coordinate system, pre-rotation. `aline`
    /// replaces it with the rotated target when the block is queued.
    pub target: Axes,
    /// Kahan summation compensation per axis, maintained by the runtime.
    pub target_comp: Axes,
    /// Feed in units/min, or move time in minutes under inverse-time mode.
    pub feed_rate: f32,
    pub feed_rate_mode: FeedRateMode,
    pub motion_mode: MotionMode,
    pub path_control: PathControl,
    /// Active coordinate system index (0 = G54).
    pub coord_system: u8,
    /// Units as received (false = mm, true = inches); used only for reports.
    pub units_inches: bool,
    pub line_number: u32,
}

/// Machine-level motion state, shared between the planner, executor and the
/// cycle state machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MotionState {
    #[default]
    Stop,
    /// Moves are queued but motion has not started.
    Planning,
    Run,
}

/// Feedhold sequencing states, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum HoldState {
    #[default]
    Off,
    /// Requested; the next exec entry reshapes the run block.
    Sync,
    /// Deceleration does not fit this block; continues into the next.
    DecelContinue,
    /// Deceleration to zero fits in this block.
    DecelToZero,
    /// Tail finished at zero velocity.
    DecelComplete,
    /// Waiting for the steppers to drain.
    MotionStopping,
    /// Held. Position is stable; `~`, `%` and queries are legal.
    MotionStopped,
}

/// What happens to the remainder of the held move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HoldType {
    /// Preserve the residual; `~` resumes by replanning it.
    #[default]
    Hold,
    /// Discard the remainder (probe trip, jog stop).
    Skip,
}

/// Sections of a block's velocity profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Head = 0,
    Body = 1,
    Tail = 2,
}

/// The live coupling between the cycle state machines (dispatcher context)
/// and the segment executor (exec context). The executor only reads
/// `hold_state`/`hold_type` except for the controlled transitions documented
/// in `exec`; the cycle machines only write them at dispatcher priority.
#[derive(Debug, Default)]
pub struct MotionSignals {
    /// True while the machine is in a machining cycle.
    pub in_cycle: bool,
    pub motion_state: MotionState,
    pub hold_state: HoldState,
    pub hold_type: HoldType,
    /// Set by the executor when the planner queue empties and the cycle
    /// should end; drained by the machine layer.
    pub cycle_end_pending: bool,
}

impl MotionSignals {
    /// True while motion control is busy: steppers moving, a block active,
    /// or runnable buffers queued. Used to sync to the queue.
    pub fn holding(&self) -> bool {
        self.hold_state == HoldState::MotionStopped
    }
}
