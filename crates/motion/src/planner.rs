//! Block ingest and look-ahead planning.
//!
//! [`Planner::aline`] turns a move intent into a queued block: rotate the
//! target into the work frame, derive the unit vector, project per-axis jerk
//! caps onto it, size the velocity limits. The planner callback then runs
//! back-planning: walk from the newest block toward the running block
//! propagating a braking velocity, hinting each block's profile along the
//! way. Forward planning (just-in-time, one block, in `exec`) consumes the
//! hints.
//!
//! Everything here runs at main-loop (dispatcher) priority and may be
//! preempted by the exec at any point. Blocks in `Running` state are never
//! written from this module.

use stepper::Stepper;
use tracing::{debug, trace};

use crate::buffer::{Block, BlockKind, BufferState, Hint, PlannerQueue};
use crate::error::PlanError;
use crate::state::{MotionMode, MotionSignals, MotionState, MoveState, PathControl};
use crate::zoid::target_velocity;
use crate::{
    fp_zero, velocity_eq, Axes, AXES, AXIS_A, AXIS_B, AXIS_C, AXIS_X, AXIS_Y, AXIS_Z,
    BLOCK_TIMEOUT_MS, EPSILON, FEED_OVERRIDE_MAX, FEED_OVERRIDE_MIN, JERK_MULTIPLIER,
    MIN_BLOCK_TIME, MIN_LENGTH_MOVE, PHAT_CITY_TIME, PLANNER_BUFFER_HEADROOM,
    PLANNER_BUFFER_POOL_SIZE,
};

/// Per-axis kinematic limits.
#[derive(Debug, Clone, Copy)]
pub struct AxisConfig {
    /// Max traverse (G0) velocity, mm/min.
    pub velocity_max: f32,
    /// Max feed (G1..) velocity, mm/min.
    pub feedrate_max: f32,
    /// Jerk cap for feeds, in millions of mm/min^3.
    pub jerk_max: f32,
    /// Jerk cap for traverses; falls back to `jerk_max` when zero.
    pub jerk_high: f32,
}

impl Default for AxisConfig {
    fn default() -> Self {
        Self {
            velocity_max: 16_000.0,
            feedrate_max: 16_000.0,
            jerk_max: 50.0,
            jerk_high: 0.0,
        }
    }
}

/// Machine-wide planner configuration.
#[derive(Debug, Clone, Copy)]
pub struct PlannerConfig {
    pub axes: [AxisConfig; AXES],
    /// Junction integration time, seconds. The corner-velocity "aggression"
    /// knob: larger values corner faster.
    pub junction_integration_time: f32,
    /// 3x3 rotation applied to XYZ targets entering the planner.
    pub rotation_matrix: [[f32; 3]; 3],
    pub rotation_z_offset: f32,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            axes: [AxisConfig::default(); AXES],
            junction_integration_time: 0.35,
            rotation_matrix: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            rotation_z_offset: 0.0,
        }
    }
}

impl PlannerConfig {
    /// sqrt(3)/10 * T^2, scaled so multiplying by a raw (millions) jerk
    /// yields velocity. See `junction_vmax`.
    fn max_junction_accel(&self) -> f32 {
        let t_min = self.junction_integration_time / 60.0;
        (3.0_f32.sqrt() / 10.0) * t_min * t_min * JERK_MULTIPLIER
    }

    fn axis_jerk(&self, axis: usize, motion: MotionMode) -> f32 {
        let a = &self.axes[axis];
        if motion == MotionMode::Traverse && a.jerk_high > EPSILON {
            a.jerk_high
        } else {
            a.jerk_max
        }
    }
}

/// Planner pass state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum PlannerState {
    #[default]
    Idle,
    /// Collecting moves before starting motion, so the first plan does not
    /// decelerate to zero after one block.
    Startup,
    /// Stitching: junction velocities and exit_vmax for newly arrived blocks.
    Priming,
    BackPlanning,
}

/// The planner singleton (`mp`): queue, position, pass state, and the
/// couplings to forward planning.
#[derive(Debug)]
pub struct Planner {
    pub queue: PlannerQueue,
    pub config: PlannerConfig,
    /// Planner position: end of the last queued move. Distinct from the
    /// runtime position; they re-synchronize at idle.
    pub position: Axes,
    pub state: PlannerState,
    /// Index of the next block to plan.
    p: usize,
    planning_return: usize,
    pub request_planning: bool,
    /// Set by forward planning when a block's entry velocity came out lower
    /// than its hint assumed; consumed when planning the next block.
    pub entry_changed: bool,
    /// Deadline (ms) after which planning proceeds without a full queue.
    block_timeout_at: Option<u32>,
    /// Feed override factor, 1.0 = 100%.
    pub mfo_factor: f32,
    mfo_pending: Option<f32>,
    /// Minutes of committed motion beyond the running block.
    pub plannable_time: f32,
    /// Minutes left in the running block; maintained by the executor.
    pub run_time_remaining: f32,
}

impl Default for Planner {
    fn default() -> Self {
        Self::new(PlannerConfig::default())
    }
}

impl Planner {
    pub fn new(config: PlannerConfig) -> Self {
        Self {
            queue: PlannerQueue::new(),
            config,
            position: [0.0; AXES],
            state: PlannerState::Idle,
            p: 0,
            planning_return: 0,
            request_planning: false,
            entry_changed: false,
            block_timeout_at: None,
            mfo_factor: 1.0,
            mfo_pending: None,
            plannable_time: 0.0,
            run_time_remaining: 0.0,
        }
    }

    /// True when the dispatcher must stop feeding data lines.
    pub fn is_full(&self) -> bool {
        self.queue.available() < PLANNER_BUFFER_HEADROOM
    }

    /// Planner slack test: reports and other non-essential work are allowed
    /// when enough motion is buffered (or nothing is running at all).
    pub fn is_phat_city_time(&self, signals: &MotionSignals) -> bool {
        if signals.holding() {
            return true;
        }
        self.plannable_time <= 0.0 || self.plannable_time > PHAT_CITY_TIME
    }

    /// Queue a jerk-controlled linear move. On success the planner position
    /// advances to the (rotated) target and a replan is scheduled.
    ///
    /// A `MinimumLengthMove` error means the endpoint did NOT advance;
    /// too-short moves accumulate until they are worth queueing.
    pub fn aline(
        &mut self,
        gm: &MoveState,
        signals: &mut MotionSignals,
        now_ms: u32,
    ) -> Result<(), PlanError> {
        let target_rotated = self.rotate_target(&gm.target);

        let mut axis_length = [0.0_f32; AXES];
        let mut axis_square = [0.0_f32; AXES];
        let mut flags = [false; AXES];
        let mut length_square = 0.0;
        for axis in 0..AXES {
            let d = target_rotated[axis] - self.position[axis];
            if !fp_zero(d) {
                axis_length[axis] = d;
                axis_square[axis] = d * d;
                length_square += axis_square[axis];
                flags[axis] = true;
            }
        }
        let length = length_square.sqrt();

        if length < MIN_LENGTH_MOVE {
            return Err(PlanError::MinimumLengthMove);
        }

        let idx = self
            .queue
            .get_write()
            .ok_or(PlanError::BufferUnavailable)?;

        let mfo = self.mfo_factor;
        let config = self.config;
        {
            let bf = self.queue.block_mut(idx);
            bf.gm = *gm;
            bf.gm.target = target_rotated;
            bf.length = length;
            for axis in 0..AXES {
                bf.axis_flags[axis] = flags[axis];
                if flags[axis] {
                    bf.unit[axis] = axis_length[axis] / length;
                }
            }
            calculate_jerk(bf, &config);
            calculate_vmaxes(bf, &config, &axis_length, &axis_square, mfo);
        }

        // Position must update before the commit; interrupts may consume
        // the block as soon as it is in the queue.
        self.position = target_rotated;
        self.commit(BlockKind::Aline, signals, now_ms);
        Ok(())
    }

    /// Queue a dwell block.
    pub fn dwell(
        &mut self,
        seconds: f32,
        signals: &mut MotionSignals,
        now_ms: u32,
    ) -> Result<(), PlanError> {
        let idx = self
            .queue
            .get_write()
            .ok_or(PlanError::BufferUnavailable)?;
        let bf = self.queue.block_mut(idx);
        bf.block_time = seconds / 60.0;
        self.commit(BlockKind::Dwell { seconds }, signals, now_ms);
        Ok(())
    }

    /// Queue a synchronous command block. The token indexes host-side
    /// payload storage.
    pub fn command(
        &mut self,
        token: u32,
        signals: &mut MotionSignals,
        now_ms: u32,
    ) -> Result<(), PlanError> {
        self.queue
            .get_write()
            .ok_or(PlanError::BufferUnavailable)?;
        self.commit(BlockKind::Command { token }, signals, now_ms);
        Ok(())
    }

    fn commit(&mut self, kind: BlockKind, signals: &mut MotionSignals, now_ms: u32) {
        self.queue.commit_write(kind);
        if kind.is_move() {
            if signals.motion_state == MotionState::Stop {
                signals.motion_state = MotionState::Planning;
            }
        }
        self.request_planning = true;
        self.block_timeout_at = Some(now_ms.wrapping_add(BLOCK_TIMEOUT_MS));
    }

    /// Empty the planner queue (queue flush, alarm). Planner position is
    /// reset to the supplied runtime position; G-code modal state is the
    /// canonical machine's problem and survives untouched.
    pub fn flush(&mut self, runtime_position: &Axes) {
        self.queue.flush();
        self.position = *runtime_position;
        self.state = PlannerState::Idle;
        self.p = self.queue.run_cursor();
        self.planning_return = self.p;
        self.request_planning = false;
        self.entry_changed = false;
        self.block_timeout_at = None;
        self.plannable_time = 0.0;
        debug!("planner flushed");
    }

    /// Begin a feed override change. Takes effect on the next planning pass;
    /// already-planned blocks are reverted so they re-plan with the new
    /// factor. The ramp time is honored by re-planning rather than by
    /// shaping individual blocks.
    pub fn start_feed_override(&mut self, factor: f32) {
        let factor = factor.clamp(FEED_OVERRIDE_MIN, FEED_OVERRIDE_MAX);
        if self.state == PlannerState::Idle {
            self.mfo_factor = factor;
            return;
        }
        self.mfo_pending = Some(factor);
        self.replan_queue();
    }

    pub fn end_feed_override(&mut self) {
        self.start_feed_override(1.0);
    }

    /// Revert forward-planned blocks so they plan again, and request a run.
    /// Back-planning results stay valid; only forward planning is invalidated.
    pub fn replan_queue(&mut self) {
        let mut idx = self.queue.run_cursor();
        loop {
            let bf = self.queue.block_mut(idx);
            if bf.state == BufferState::FullyPlanned {
                bf.state = BufferState::BackPlanned;
                bf.plannable = true;
            }
            idx = self.queue.next(idx);
            if idx == self.queue.run_cursor() || self.queue.block(idx).state == BufferState::Empty
            {
                break;
            }
        }
        // plan immediately from the run cursor; a replan must not sit in
        // STARTUP waiting for the queue to fill
        self.p = self.queue.run_cursor();
        self.state = PlannerState::Priming;
        self.request_planning = true;
    }

    /// The planner callback, run from the dispatcher every pass.
    ///
    /// Decides whether to run back-planning, manages the planner state
    /// machine (idle / startup / priming / back-planning) and the block
    /// timeout that starts short jobs.
    pub fn callback(
        &mut self,
        now_ms: u32,
        signals: &MotionSignals,
        stepper: &mut Stepper,
    ) {
        use crate::state::HoldState;

        if self.queue.available() == PLANNER_BUFFER_POOL_SIZE
            && signals.motion_state == MotionState::Stop
            && signals.hold_state == HoldState::Off
        {
            self.state = PlannerState::Idle;
            return;
        }

        let timed_out = self.block_timeout_at.is_some_and(|at| now_ms >= at);
        if timed_out {
            self.block_timeout_at = None; // re-armed on the next commit
        }

        if !self.request_planning && !timed_out {
            return;
        }

        if let Some(factor) = self.mfo_pending.take() {
            self.mfo_factor = factor;
        }

        if self.state == PlannerState::Idle {
            self.p = self.queue.run_cursor();
            self.state = PlannerState::Startup;
        }
        if self.state == PlannerState::Startup {
            if !self.is_full() && !timed_out {
                return; // keep collecting blocks
            }
            self.state = PlannerState::Priming;
        }
        self.plan_block_list(signals, stepper);
    }

    /// Plan every block that is ready, starting at the planning cursor.
    fn plan_block_list(&mut self, signals: &MotionSignals, stepper: &mut Stepper) {
        use crate::state::HoldState;

        self.request_planning = false;
        let mut idx = self.p;

        while self.queue.block(idx).state != BufferState::Empty {
            // Replanning the running buffer is legal during feedhold only.
            if signals.hold_state == HoldState::Off
                && self.queue.block(idx).state == BufferState::Running
            {
                self.p = self.queue.next(idx);
                return;
            }
            idx = self.plan_block(idx);
            self.p = idx;
        }

        if self.state > PlannerState::Startup && signals.hold_state != HoldState::MotionStopped {
            stepper.request_forward_plan(); // start motion if the runtime is idle
        }
        self.p = idx;
    }

    /// Prime one block (stitch junction velocities) or run the backward
    /// pass. Returns the next block to plan.
    fn plan_block(&mut self, idx: usize) -> usize {
        if self.state == PlannerState::Priming {
            let pv = self.queue.prev(idx);

            if self.queue.block(pv).plannable {
                if self.queue.block(idx).state == BufferState::Initializing {
                    self.calculate_junction_vmax(pv); // only once per junction
                }
                let exit_vmax = if self.queue.block(pv).gm.path_control == PathControl::ExactStop
                {
                    0.0
                } else {
                    let a = self.queue.block(pv);
                    let b = self.queue.block(idx);
                    a.junction_vmax.min(a.cruise_vmax).min(b.cruise_vmax)
                };
                self.queue.block_mut(pv).exit_vmax = exit_vmax;
            }

            if self.queue.block(idx).state == BufferState::Initializing {
                let bf = self.queue.block_mut(idx);
                bf.state = BufferState::NotPlanned;
                bf.hint = Hint::None;
            }

            let nx = self.queue.next(idx);
            if self.queue.block(nx).plannable {
                return nx; // keep reading in new buffers
            }
            self.planning_return = nx;
            self.state = PlannerState::BackPlanning;
        }

        if self.state == PlannerState::BackPlanning {
            self.back_plan_from(idx);
        }
        self.state = PlannerState::Priming;
        self.planning_return
    }

    /// The backward pass: walk toward the running block building a perfect
    /// deceleration ramp, or perfect cruises where the braking velocity
    /// reaches cruise_vmax. Stops at the first block it cannot improve.
    fn back_plan_from(&mut self, start: usize) {
        let mut idx = start;
        let mut braking_velocity: f32 = 0.0;
        let mut optimal = false;

        loop {
            // Continue while the block is plannable, or on an inversion
            // where braking dipped below the already-set exit.
            {
                let bf = self.queue.block(idx);
                if !(bf.plannable || braking_velocity < bf.exit_velocity) {
                    break;
                }
            }
            let pv = self.queue.prev(idx);
            let pv_exit_vmax = self.queue.block(pv).exit_vmax;

            let bf = self.queue.block_mut(idx);
            bf.plannable = bf.plannable && !optimal;

            // Forward planning may have lowered exit_vmax since last pass.
            braking_velocity = braking_velocity.min(bf.exit_vmax);

            // Cruise must be set before exit and stay at least as high.
            bf.cruise_velocity = braking_velocity.max(bf.cruise_velocity);
            bf.exit_velocity = braking_velocity;

            let mut test_decel_or_bump = false;

            if !bf.kind.is_move() {
                // Commands force a stop; nothing earlier gets more optimal.
                optimal = true;
                bf.exit_velocity = 0.0;
                braking_velocity = 0.0;
                bf.plannable = false;
                bf.hint = Hint::CommandBlock;
            } else if velocity_eq(bf.exit_velocity, bf.cruise_vmax)
                && velocity_eq(pv_exit_vmax, bf.cruise_vmax)
            {
                // A *possible* perfect cruise; forward planning may degrade
                // it to a mixed accel. Set cruise first, exactly, to wash
                // out the EQ tolerances.
                bf.cruise_velocity = bf.cruise_vmax.min(bf.exit_vmax);
                bf.exit_velocity = bf.cruise_velocity;
                braking_velocity = bf.exit_velocity;
                bf.hint = Hint::PerfectCruise;
                optimal = true; // entry can't improve further
            } else if pv_exit_vmax < bf.exit_velocity {
                // Forced to enter slower than we exit.
                test_decel_or_bump = true;
            } else {
                let exit_velocity = bf.exit_velocity;
                let length = bf.length;
                braking_velocity = target_velocity(exit_velocity, length, bf);

                if pv_exit_vmax > braking_velocity {
                    // Full-length deceleration ramp. Advisory; forward
                    // planning may still alter it.
                    bf.cruise_velocity = braking_velocity;
                    bf.hint = Hint::PerfectDeceleration;
                } else {
                    test_decel_or_bump = true;
                }
            }

            if test_decel_or_bump {
                braking_velocity = pv_exit_vmax;
                if bf.cruise_vmax > pv_exit_vmax {
                    bf.cruise_velocity = bf.cruise_vmax;
                    bf.hint = Hint::AsymmetricBump;
                } else {
                    bf.cruise_velocity = pv_exit_vmax;
                    bf.hint = Hint::MixedDeceleration;
                }
                optimal = true; // entry can't improve further
            }

            if bf.state == BufferState::Empty {
                break; // walked past the running region
            }
            if bf.state < BufferState::BackPlanned {
                bf.state = BufferState::BackPlanned;
            }

            trace!(
                id = self.queue.block(idx).id,
                hint = ?self.queue.block(idx).hint,
                braking = braking_velocity,
                "back plan"
            );
            idx = pv;
        }
    }

    /// Corner velocity cap between block `a` (at `idx`) and its successor.
    ///
    /// Takes the per-axis unit vector deltas and finds the velocity at
    /// which cornering in the configured integration time stays within
    /// every axis's jerk limit:  V[i] = sqrt(3)/10 * J[i] * T^2 / delta[i].
    ///
    /// Strings of sub-half-millimeter nearly-collinear moves retain a
    /// junction unit vector from >= 0.5mm back and take the larger of the
    /// two deltas, so segmented small arcs still slow down.
    fn calculate_junction_vmax(&mut self, idx: usize) {
        let nx = self.queue.next(idx);
        let max_junction_accel = self.config.max_junction_accel();
        let motion = self.queue.block(idx).gm.motion_mode;

        // Last block in the queue: compute a junction to a full stop (as if
        // the next unit vector were zero).
        if self.queue.block(nx).state == BufferState::Empty {
            let bf = self.queue.block(idx);
            let mut velocity = bf.absolute_vmax;
            for axis in 0..AXES {
                if bf.axis_flags[axis] {
                    let delta = bf.unit[axis].abs();
                    if delta > EPSILON {
                        velocity = velocity
                            .min(max_junction_accel * self.config.axis_jerk(axis, motion) / delta);
                    }
                }
            }
            self.queue.block_mut(idx).junction_vmax = velocity;
            return;
        }

        let (a_unit, a_flags, a_len, a_junction_unit, a_since, a_abs) = {
            let a = self.queue.block(idx);
            (
                a.unit,
                a.axis_flags,
                a.length,
                a.junction_unit,
                a.junction_length_since,
                a.absolute_vmax,
            )
        };
        let (b_unit, b_flags, b_abs) = {
            let b = self.queue.block(nx);
            (b.unit, b.axis_flags, b.absolute_vmax)
        };

        let mut velocity = a_abs.min(b_abs);

        let junction_length_since = a_since + a_len;
        let using_junction_unit = junction_length_since < 0.5;
        {
            let b = self.queue.block_mut(nx);
            b.junction_length_since = if using_junction_unit {
                junction_length_since
            } else {
                a_len
            };
        }

        for axis in 0..AXES {
            if a_flags[axis] || b_flags[axis] {
                let mut delta = (a_unit[axis] - b_unit[axis]).abs();
                let carried = if using_junction_unit {
                    delta = delta.max((a_junction_unit[axis] - b_unit[axis]).abs());
                    a_junction_unit[axis]
                } else {
                    a_unit[axis]
                };
                self.queue.block_mut(nx).junction_unit[axis] = carried;

                if delta > EPSILON {
                    velocity = velocity
                        .min(max_junction_accel * self.config.axis_jerk(axis, motion) / delta);
                }
            }
        }
        self.queue.block_mut(idx).junction_vmax = velocity;
    }

    /// Gather the time buffered in the planner beyond the running block.
    /// Called when a block starts running.
    pub fn time_accounting(&mut self) {
        let r = self.queue.run_cursor();
        if self.queue.block(r).state != BufferState::Running {
            return;
        }
        self.plannable_time = 0.0;
        let mut idx = self.queue.next(r);
        while idx != r {
            let bf = self.queue.block(idx);
            if bf.state == BufferState::Empty || bf.plannable {
                break;
            }
            self.plannable_time += bf.block_time;
            idx = self.queue.next(idx);
        }
    }

    fn rotate_target(&self, target: &Axes) -> Axes {
        let m = &self.config.rotation_matrix;
        let mut out = *target;
        out[AXIS_X] = target[AXIS_X] * m[0][0] + target[AXIS_Y] * m[0][1] + target[AXIS_Z] * m[0][2];
        out[AXIS_Y] = target[AXIS_X] * m[1][0] + target[AXIS_Y] * m[1][1] + target[AXIS_Z] * m[1][2];
        out[AXIS_Z] = target[AXIS_X] * m[2][0]
            + target[AXIS_Y] * m[2][1]
            + target[AXIS_Z] * m[2][2]
            + self.config.rotation_z_offset;
        // rotary axes pass through
        out[AXIS_A] = target[AXIS_A];
        out[AXIS_B] = target[AXIS_B];
        out[AXIS_C] = target[AXIS_C];
        out
    }
}

/// Project the per-axis jerk caps onto the unit vector: the block's jerk is
/// the highest value that violates no participating axis.
fn calculate_jerk(bf: &mut Block, config: &PlannerConfig) {
    let mut jerk = f32::MAX;
    for axis in 0..AXES {
        let u = bf.unit[axis].abs();
        if u > 0.0 {
            let axis_jerk = config.axis_jerk(axis, bf.gm.motion_mode) / u;
            jerk = jerk.min(axis_jerk);
        }
    }
    bf.jerk = jerk * JERK_MULTIPLIER;
    bf.recip_jerk = 1.0 / bf.jerk;
    bf.sqrt_j = bf.jerk.sqrt();

    const Q: f32 = 2.402_811_4; // sqrt(10) / 3^(1/4)
    bf.q_recip_2_sqrt_j = Q / (2.0 * bf.sqrt_j);
}

/// Compute cruise_vset, cruise_vmax and absolute_vmax per the NIST feed
/// rules: traverses ignore feed; inverse-time feeds use the stated move
/// time; linear feeds use the Cartesian distance over F, falling back to
/// rotary distance when no linear axis moves.
fn calculate_vmaxes(
    bf: &mut Block,
    config: &PlannerConfig,
    axis_length: &Axes,
    axis_square: &Axes,
    mfo_factor: f32,
) {
    use crate::state::FeedRateMode;

    let mut feed_time = 0.0; // minutes; mutually exclusive XYZ / ABC / inverse
    if bf.gm.motion_mode != MotionMode::Traverse {
        if bf.gm.feed_rate_mode == FeedRateMode::InverseTime {
            feed_time = bf.gm.feed_rate; // already un-inverted to minutes
            bf.gm.feed_rate_mode = FeedRateMode::UnitsPerMinute;
        } else {
            let linear =
                (axis_square[AXIS_X] + axis_square[AXIS_Y] + axis_square[AXIS_Z]).sqrt();
            feed_time = linear / bf.gm.feed_rate;
            if fp_zero(feed_time) {
                let rotary =
                    (axis_square[AXIS_A] + axis_square[AXIS_B] + axis_square[AXIS_C]).sqrt();
                feed_time = rotary / bf.gm.feed_rate;
            }
        }
    }

    // Time demanded by the slowest rate-limited axis.
    let mut max_time = 0.0_f32;
    for axis in 0..AXES {
        if bf.axis_flags[axis] {
            let limit = if bf.gm.motion_mode == MotionMode::Traverse {
                config.axes[axis].velocity_max
            } else {
                config.axes[axis].feedrate_max
            };
            max_time = max_time.max(axis_length[axis].abs() / limit);
        }
    }

    let min_time = max_time.max(MIN_BLOCK_TIME);
    bf.absolute_vmax = bf.length / min_time;
    bf.block_time = min_time; // first estimate, refined by ramp planning

    let block_time = min_time.max(feed_time);
    bf.cruise_vset = bf.length / block_time;
    bf.cruise_vmax = bf.absolute_vmax.min(bf.cruise_vset * mfo_factor);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::HoldState;

    fn feed_move(target: [f32; 3], feed: f32) -> MoveState {
        let mut gm = MoveState {
            feed_rate: feed,
            ..Default::default()
        };
        gm.target[AXIS_X] = target[0];
        gm.target[AXIS_Y] = target[1];
        gm.target[AXIS_Z] = target[2];
        gm
    }

    fn run_planner_until_planned(planner: &mut Planner, signals: &MotionSignals) {
        let mut stepper = Stepper::default();
        // force the startup timeout path so short jobs plan
        planner.request_planning = true;
        planner.state = PlannerState::Priming;
        if planner.queue.block(planner.p).state == BufferState::Empty {
            planner.p = planner.queue.run_cursor();
        }
        planner.plan_block_list(signals, &mut stepper);
    }

    #[test]
    fn aline_rejects_zero_length() {
        let mut planner = Planner::default();
        let mut signals = MotionSignals::default();
        let gm = feed_move([0.0, 0.0, 0.0], 600.0);
        assert_eq!(
            planner.aline(&gm, &mut signals, 0),
            Err(PlanError::MinimumLengthMove)
        );
        assert_eq!(planner.queue.available(), PLANNER_BUFFER_POOL_SIZE);
    }

    #[test]
    fn aline_sets_unit_vector_and_vmaxes() {
        let mut planner = Planner::default();
        let mut signals = MotionSignals::default();
        planner
            .aline(&feed_move([30.0, 40.0, 0.0], 600.0), &mut signals, 0)
            .unwrap();
        let bf = planner.queue.block(planner.queue.run_cursor());
        assert!((bf.length - 50.0).abs() < 1e-3);
        assert!((bf.unit[AXIS_X] - 0.6).abs() < 1e-5);
        assert!((bf.unit[AXIS_Y] - 0.8).abs() < 1e-5);
        // feed caps cruise below the axis-limited absolute max
        assert!((bf.cruise_vmax - 600.0).abs() < 1.0);
        assert!(bf.absolute_vmax > bf.cruise_vmax);
        assert_eq!(signals.motion_state, MotionState::Planning);
    }

    #[test]
    fn back_planning_builds_deceleration_ramp() {
        let mut planner = Planner::default();
        let mut signals = MotionSignals::default();
        for i in 1..=4 {
            planner
                .aline(
                    &feed_move([10.0 * i as f32, 0.0, 0.0], 2400.0),
                    &mut signals,
                    0,
                )
                .unwrap();
        }
        run_planner_until_planned(&mut planner, &signals);

        // Collinear moves: junctions are wide open, so interior exits sit
        // at their cruise caps, and the last block brakes to zero.
        let r = planner.queue.run_cursor();
        let mut idx = r;
        let mut last = r;
        for _ in 0..4 {
            assert!(planner.queue.block(idx).state >= BufferState::BackPlanned);
            last = idx;
            idx = planner.queue.next(idx);
        }
        let last_bf = planner.queue.block(last);
        assert!(last_bf.exit_velocity.abs() < 1e-3);
        for idx in [r, planner.queue.next(r)] {
            let bf = planner.queue.block(idx);
            assert!(bf.exit_velocity <= bf.cruise_velocity + 1e-3);
            assert!(bf.cruise_velocity <= bf.cruise_vmax + 1e-3);
        }
    }

    #[test]
    fn right_angle_corner_is_slower_than_straight() {
        let mut planner = Planner::default();
        let mut signals = MotionSignals::default();
        planner
            .aline(&feed_move([10.0, 0.0, 0.0], 600.0), &mut signals, 0)
            .unwrap();
        planner
            .aline(&feed_move([10.0, 10.0, 0.0], 600.0), &mut signals, 0)
            .unwrap();
        planner
            .aline(&feed_move([20.0, 10.0, 0.0], 600.0), &mut signals, 0)
            .unwrap();
        run_planner_until_planned(&mut planner, &signals);

        let first = planner.queue.block(planner.queue.run_cursor());
        // 90 degree corner: delta = 1.0 on two axes
        assert!(first.junction_vmax < first.absolute_vmax);
        assert!(first.exit_velocity <= first.junction_vmax + 1e-3);
    }

    #[test]
    fn exact_stop_forces_zero_exit() {
        let mut planner = Planner::default();
        let mut signals = MotionSignals::default();
        let mut gm = feed_move([10.0, 0.0, 0.0], 600.0);
        gm.path_control = PathControl::ExactStop;
        planner.aline(&gm, &mut signals, 0).unwrap();
        planner
            .aline(&feed_move([20.0, 0.0, 0.0], 600.0), &mut signals, 0)
            .unwrap();
        run_planner_until_planned(&mut planner, &signals);
        let first = planner.queue.block(planner.queue.run_cursor());
        assert!(first.exit_velocity.abs() < 1e-3);
    }

    #[test]
    fn command_block_brakes_queue_to_zero() {
        let mut planner = Planner::default();
        let mut signals = MotionSignals::default();
        planner
            .aline(&feed_move([10.0, 0.0, 0.0], 600.0), &mut signals, 0)
            .unwrap();
        planner.command(7, &mut signals, 0).unwrap();
        run_planner_until_planned(&mut planner, &signals);
        let first = planner.queue.block(planner.queue.run_cursor());
        assert!(first.exit_velocity.abs() < 1e-3);
        let cmd = planner.queue.next(planner.queue.run_cursor());
        assert_eq!(planner.queue.block(cmd).hint, Hint::CommandBlock);
    }

    #[test]
    fn feed_override_caps_cruise() {
        let mut planner = Planner::default();
        let mut signals = MotionSignals::default();
        planner.start_feed_override(0.5); // idle: immediate
        planner
            .aline(&feed_move([10.0, 0.0, 0.0], 1000.0), &mut signals, 0)
            .unwrap();
        let bf = planner.queue.block(planner.queue.run_cursor());
        assert!((bf.cruise_vmax - 500.0).abs() < 1.0);
    }

    #[test]
    fn short_segment_string_retains_junction_unit() {
        let mut planner = Planner::default();
        let mut signals = MotionSignals::default();
        // 0.1mm segments turning slowly: individually near-collinear
        let mut x = 0.0_f32;
        let mut y = 0.0_f32;
        for i in 0..20 {
            let angle = 0.05 * i as f32;
            x += 0.1 * angle.cos();
            y += 0.1 * angle.sin();
            planner
                .aline(&feed_move([x, y, 0.0], 1200.0), &mut signals, 0)
                .unwrap();
        }
        run_planner_until_planned(&mut planner, &signals);
        // the carried junction unit must be propagating
        let idx = planner.queue.next(planner.queue.run_cursor());
        assert!(planner.queue.block(idx).junction_length_since > 0.0);
        assert!(planner.queue.block(idx).junction_length_since < 0.5);
    }

    #[test]
    fn planner_full_gate() {
        let mut planner = Planner::default();
        let mut signals = MotionSignals::default();
        let mut i = 0;
        while !planner.is_full() {
            i += 1;
            planner
                .aline(&feed_move([i as f32, 0.0, 0.0], 600.0), &mut signals, 0)
                .unwrap();
        }
        assert_eq!(
            i,
            PLANNER_BUFFER_POOL_SIZE - PLANNER_BUFFER_HEADROOM + 1
        );
    }

    #[test]
    fn idle_planner_state_resets() {
        let mut planner = Planner::default();
        let signals = MotionSignals {
            motion_state: MotionState::Stop,
            hold_state: HoldState::Off,
            ..Default::default()
        };
        let mut stepper = Stepper::default();
        planner.state = PlannerState::BackPlanning;
        planner.callback(0, &signals, &mut stepper);
        assert_eq!(planner.state, PlannerState::Idle);
    }
}
