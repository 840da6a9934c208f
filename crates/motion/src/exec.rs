//! The segment executor: plays planned blocks out as fixed-duration
//! segments and feeds the stepper prep buffer.
//!
//! Runs at exec (software interrupt) priority. Each call to
//! [`Runtime::exec_move`] executes and preps **one and only one** segment.
//! If the segment is not the last in the block it returns `Eagain`; the last
//! returns `Ok`; `Noop` means nothing was prepped and the loader must not
//! load. The interrupt sequencing relies on these being exactly right.
//!
//! Forward planning ([`Runtime::forward_plan`]) also lives here: it runs one
//! priority level below exec and sizes the ramp for the single block
//! adjacent to the running one, using the run block's exit velocity as the
//! entry.

use stepper::{Stepper, MOTORS};
use tracing::trace;

use crate::buffer::{BlockKind, BufferState, RunBlockState};
use crate::kinematics::Kinematics;
use crate::planner::Planner;
use crate::state::{HoldState, HoldType, MotionSignals, MotionState, MoveState, Section};
use crate::zoid::{calculate_ramps, decel_velocity, target_length, RuntimeBlock};
use crate::{
    axis_vector_length, fp_zero, Axes, AXES, EPSILON2, MIN_SEGMENT_TIME, NOM_SEGMENT_TIME,
};

/// Executor return status; the contract between exec, loader and planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// Move (or section) is done.
    Ok,
    /// More segments to run.
    Eagain,
    /// Nothing was prepped; do not load.
    Noop,
    /// Fatal: ends the move. Escalated to panic by the machine layer.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum SectionState {
    #[default]
    New,
    Running,
}

/// The runtime singleton (`mr`): position, the two runtime blocks, segment
/// generation state and the step bookkeeping that closes the loop with the
/// encoders.
#[derive(Debug)]
pub struct Runtime {
    /// Position at the end of the last executed segment (post-rotation).
    pub position: Axes,
    /// Final target of the running block.
    pub move_target: Axes,
    unit: Axes,
    /// Runtime copy of the block's G-code state. `gm.target` is the
    /// accumulating segment target, compensated Kahan-style in
    /// `gm.target_comp`.
    pub gm: MoveState,
    waypoints: [Axes; 3],

    pub block_state: RunBlockState,
    section: Section,
    section_state: SectionState,

    segments: f32,
    segment_count: u32,
    pub segment_time: f32,
    pub segment_velocity: f32,
    target_velocity: f32,
    /// Quintic Bezier forward differences, F1..F5.
    fd: [f32; 5],

    /// Entry velocity of the current (or next) block; carried from the
    /// previous block's exit.
    pub entry_velocity: f32,

    /// Two-slot arena for the run/plan runtime blocks. `run_slot` indexes
    /// the run block; the other slot is the planning block. Swapped only at
    /// move boundaries, in `exec_aline` first-time setup.
    blocks: [RuntimeBlock; 2],
    run_slot: usize,

    // Step-space bookkeeping.
    position_steps: [f32; MOTORS],
    /// `position_steps` delayed by one segment, lining up in time with the
    /// encoder readings so a following error can be formed.
    commanded_steps: [f32; MOTORS],
    pub following_error: [f32; MOTORS],
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            position: [0.0; AXES],
            move_target: [0.0; AXES],
            unit: [0.0; AXES],
            gm: MoveState::default(),
            waypoints: [[0.0; AXES]; 3],
            block_state: RunBlockState::Inactive,
            section: Section::Head,
            section_state: SectionState::New,
            segments: 0.0,
            segment_count: 0,
            segment_time: 0.0,
            segment_velocity: 0.0,
            target_velocity: 0.0,
            fd: [0.0; 5],
            entry_velocity: 0.0,
            blocks: [RuntimeBlock::default(); 2],
            run_slot: 0,
            position_steps: [0.0; MOTORS],
            commanded_steps: [0.0; MOTORS],
            following_error: [0.0; MOTORS],
        }
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    /// The run block.
    pub fn r(&self) -> &RuntimeBlock {
        &self.blocks[self.run_slot]
    }

    fn r_mut(&mut self) -> &mut RuntimeBlock {
        &mut self.blocks[self.run_slot]
    }

    /// The planning block.
    pub fn p(&self) -> &RuntimeBlock {
        &self.blocks[1 - self.run_slot]
    }

    fn p_mut(&mut self) -> &mut RuntimeBlock {
        &mut self.blocks[1 - self.run_slot]
    }

    pub fn section(&self) -> Section {
        self.section
    }

    /// Reset run state for reuse after a stop. Position and step counters
    /// survive; velocities do not.
    fn reset_for_stop(&mut self) {
        self.block_state = RunBlockState::Inactive;
        self.section = Section::Head;
        self.section_state = SectionState::New;
        self.blocks[0].clear();
        self.blocks[1].clear();
        self.entry_velocity = 0.0;
        self.segment_velocity = 0.0;
        self.target_velocity = 0.0;
    }

    /// Re-sync the planner position to the runtime and zero velocities.
    /// Used when flushing the queue at a hold point.
    pub fn sync_planner_to_runtime(&mut self, planner: &mut Planner) {
        planner.position = self.position;
        self.reset_for_stop();
    }

    /// Hard reset of positions (homing, set-position). Steps follow.
    pub fn set_position(&mut self, kin: &dyn Kinematics, position: &Axes) {
        self.position = *position;
        self.gm.target = *position;
        self.gm.target_comp = [0.0; AXES];
        self.position_steps = kin.inverse(position);
        self.commanded_steps = self.position_steps;
        self.following_error = [0.0; MOTORS];
    }

    /// Just-in-time forward planning: size the ramp for the block adjacent
    /// to the running block (or the first runnable block during bootstrap).
    /// Only one block is planned per call.
    ///
    /// Runs at forward-plan priority. Call via the stepper's software
    /// interrupt request, never directly from the dispatcher.
    pub fn forward_plan(&mut self, planner: &mut Planner) -> ExecStatus {
        let Some(mut idx) = planner.queue.run_index() else {
            return ExecStatus::Ok; // nothing running - fine
        };
        if planner.queue.block(idx).state < BufferState::BackPlanned {
            return ExecStatus::Ok; // nothing to do
        }

        let mut entry_velocity;
        if planner.queue.block(idx).state == BufferState::Running {
            idx = planner.queue.next(idx);
            entry_velocity = self.r().exit_velocity; // move follows move
        } else {
            entry_velocity = self.entry_velocity; // bootstrap / command case
        }

        let mut planned_something = false;

        // Skip past (and "plan") contiguous commands and dwells.
        if !planner.queue.block(idx).kind.is_move() {
            while planner.queue.block(idx).state != BufferState::Empty
                && !planner.queue.block(idx).kind.is_move()
            {
                if planner.queue.block(idx).state == BufferState::BackPlanned {
                    planner.queue.block_mut(idx).state = BufferState::FullyPlanned;
                    planned_something = true;
                }
                idx = planner.queue.next(idx);
            }
            if planner.queue.block(idx).kind.is_move()
                && planner.queue.block(idx).state > BufferState::BackPlanned
            {
                entry_velocity = self.r().exit_velocity;
            }
        }

        if planner.queue.block(idx).kind.is_move()
            && planner.queue.block(idx).state == BufferState::BackPlanned
        {
            let mut entry_changed = planner.entry_changed;
            let block = self.p_mut();
            let bf = planner.queue.block_mut(idx);
            calculate_ramps(block, bf, entry_velocity, &mut entry_changed);
            planner.entry_changed = entry_changed;

            debug_assert!(
                block.exit_velocity <= block.cruise_velocity + EPSILON2,
                "ramp exit above cruise"
            );
            bf.state = BufferState::FullyPlanned;
            bf.plannable = false;
            planned_something = true;
        }

        if planned_something {
            ExecStatus::Ok
        } else {
            ExecStatus::Noop
        }
    }

    /// Dequeue and execute move continuations: the exec interrupt body.
    pub fn exec_move(
        &mut self,
        planner: &mut Planner,
        stepper: &mut Stepper,
        kin: &dyn Kinematics,
        signals: &mut MotionSignals,
    ) -> ExecStatus {
        // Held at the hold point: nothing loads until the hold ends.
        if signals.hold_state >= HoldState::MotionStopped {
            stepper.prep.null();
            return ExecStatus::Noop;
        }
        let Some(idx) = planner.queue.run_index() else {
            stepper.prep.null();
            return ExecStatus::Noop;
        };
        if planner.queue.block(idx).state < BufferState::BackPlanned {
            stepper.prep.null();
            return ExecStatus::Noop;
        }

        let kind = planner.queue.block(idx).kind;
        match kind {
            BlockKind::Aline => {
                // First-time operations and cycle auto-start for lines only.
                if planner.queue.block(idx).state != BufferState::Running {
                    if planner.queue.block(idx).state == BufferState::BackPlanned {
                        // Needs forward planning first; kick it and bail.
                        stepper.prep.null();
                        stepper.request_forward_plan();
                        return ExecStatus::Noop;
                    }
                    if planner.queue.block(idx).state == BufferState::FullyPlanned {
                        planner.queue.block_mut(idx).state = BufferState::Running;
                        planner.time_accounting();
                    } else {
                        return ExecStatus::Noop;
                    }
                }
                // Ask for forward planning of the next move now; it runs at
                // a lower priority once we leave.
                let nx = planner.queue.next(idx);
                if planner.queue.block(nx).state >= BufferState::BackPlanned {
                    stepper.request_forward_plan();
                }
                self.exec_aline(idx, planner, stepper, kin, signals)
            }
            BlockKind::Dwell { seconds } => {
                stepper.prep.dwell(seconds * 1_000_000.0);
                if planner.queue.free_run() {
                    signals.cycle_end_pending = true;
                }
                ExecStatus::Ok
            }
            BlockKind::Command { token } => {
                // The loader surfaces the token to the machine layer at load
                // priority, sequencing the command with motion.
                stepper.prep.command(token);
                if planner.queue.free_run() {
                    signals.cycle_end_pending = true;
                } else {
                    stepper.request_forward_plan();
                }
                ExecStatus::Ok
            }
        }
    }

    /// Acceleration-line execution: one segment per call.
    fn exec_aline(
        &mut self,
        idx: usize,
        planner: &mut Planner,
        stepper: &mut Stepper,
        kin: &dyn Kinematics,
        signals: &mut MotionSignals,
    ) -> ExecStatus {
        if !signals.in_cycle {
            return ExecStatus::Noop;
        }
        if planner.queue.block(idx).run_state == RunBlockState::Inactive {
            return ExecStatus::Noop;
        }

        // Initialize new blocks, normal or feedhold operation alike.
        if self.block_state == RunBlockState::Inactive {
            debug_assert!(
                !fp_zero(planner.queue.block(idx).length),
                "exec got a zero length move"
            );

            // This is the ONLY place the run/plan blocks are swapped: the
            // planning block, fully planned by JIT forward planning, becomes
            // the run block and the old run block is recycled for planning.
            self.run_slot = 1 - self.run_slot;

            let bf = planner.queue.block_mut(idx);
            self.gm = bf.gm;
            bf.run_state = RunBlockState::Active;
            self.block_state = RunBlockState::InitialAction;

            self.unit = bf.unit;
            self.move_target = bf.gm.target;
            self.gm.target = self.position;
            self.gm.target_comp = [0.0; AXES];

            debug_assert!(
                self.entry_velocity <= self.r().cruise_velocity + EPSILON2,
                "entry velocity above cruise"
            );

            self.normalize_block();

            // Pick the first section with content, and lay the waypoints
            // for snapping position at each section end.
            self.section = Section::Head;
            if fp_zero(self.r().head_length) {
                self.section = if fp_zero(self.r().body_length) {
                    Section::Tail
                } else {
                    Section::Body
                };
            }
            self.section_state = SectionState::New;

            let r = *self.r();
            for axis in 0..AXES {
                self.waypoints[0][axis] = self.position[axis] + self.unit[axis] * r.head_length;
                self.waypoints[1][axis] =
                    self.position[axis] + self.unit[axis] * (r.head_length + r.body_length);
                self.waypoints[2][axis] = self.position[axis]
                    + self.unit[axis] * (r.head_length + r.body_length + r.tail_length);
            }
        }

        // Feedhold processing.
        if signals.hold_state != HoldState::Off {
            if signals.hold_state >= HoldState::MotionStopped {
                return ExecStatus::Noop; // do NOT load another move
            }
            let status = self.exec_feedhold(idx, planner, stepper, signals);
            if status == ExecStatus::Ok || status == ExecStatus::Noop {
                return status;
            }
        }

        self.block_state = RunBlockState::Active;

        // From here on the bf contents do not affect execution.
        let status = match self.section {
            Section::Head => self.exec_head(planner, stepper, kin, signals),
            Section::Body => self.exec_body(planner, stepper, kin, signals),
            Section::Tail => self.exec_tail(planner, stepper, kin, signals),
        };

        // A move that entered its tail (or the last few body segments)
        // cannot be replanned any more.
        if self.section == Section::Tail
            || (self.section == Section::Body && self.segment_count < 3)
        {
            planner.queue.block_mut(idx).plannable = false;
        }

        // Feedhold: detect the end of the deceleration.
        if signals.hold_state == HoldState::DecelToZero
            && (status == ExecStatus::Ok || status == ExecStatus::Noop)
        {
            signals.hold_state = HoldState::DecelComplete;
            planner.queue.block_mut(idx).run_state = RunBlockState::InitialAction;
        }

        if signals.motion_state != MotionState::Run {
            signals.motion_state = MotionState::Run;
        }

        if status != ExecStatus::Eagain {
            self.block_state = RunBlockState::Inactive;
            self.section_state = SectionState::New;
            planner.run_time_remaining = 0.0;
            self.entry_velocity = self.r().exit_velocity;

            if planner.queue.block(idx).run_state == RunBlockState::Active {
                if planner.queue.free_run() {
                    if signals.hold_state == HoldState::Off {
                        signals.motion_state = MotionState::Stop;
                        signals.cycle_end_pending = true;
                    }
                } else {
                    stepper.request_forward_plan();
                }
            }
        }
        status
    }

    fn exec_head(
        &mut self,
        planner: &mut Planner,
        stepper: &mut Stepper,
        kin: &dyn Kinematics,
        signals: &MotionSignals,
    ) -> ExecStatus {
        if self.section_state == SectionState::New {
            if fp_zero(self.r().head_length) {
                self.section = Section::Body;
                return self.exec_body(planner, stepper, kin, signals);
            }
            let head_time = self.r().head_time;
            self.segments = (head_time / NOM_SEGMENT_TIME).ceil();
            self.segment_count = self.segments as u32;
            self.segment_time = head_time / self.segments;

            if self.segment_count == 1 {
                self.segment_velocity = self.entry_velocity;
                self.target_velocity = self.r().cruise_velocity;
            } else {
                let (v_0, v_1) = (self.entry_velocity, self.r().cruise_velocity);
                self.init_forward_diffs(v_0, v_1);
            }
            if self.segment_time < MIN_SEGMENT_TIME {
                // exit without advancing position; normalization should
                // have prevented this
                return ExecStatus::Ok;
            }
            self.section = Section::Head;
            self.section_state = SectionState::Running;
        } else {
            self.segment_velocity = self.target_velocity;
            self.target_velocity += self.fd[4];
        }

        match self.exec_segment(planner, stepper, kin, signals) {
            SegmentStatus::Done => {
                if fp_zero(self.r().body_length) && fp_zero(self.r().tail_length) {
                    return ExecStatus::Ok; // ends the move
                }
                self.section = Section::Body;
                self.section_state = SectionState::New;
            }
            SegmentStatus::More => {
                self.fd[4] += self.fd[3];
                self.fd[3] += self.fd[2];
                self.fd[2] += self.fd[1];
                self.fd[1] += self.fd[0];
            }
            SegmentStatus::Failed => return ExecStatus::Failed,
        }
        ExecStatus::Eagain
    }

    /// The body is chopped into segments even though velocity is constant,
    /// so a feedhold can begin mid-line with bounded latency.
    fn exec_body(
        &mut self,
        planner: &mut Planner,
        stepper: &mut Stepper,
        kin: &dyn Kinematics,
        signals: &MotionSignals,
    ) -> ExecStatus {
        if self.section_state == SectionState::New {
            if fp_zero(self.r().body_length) {
                self.section = Section::Tail;
                return self.exec_tail(planner, stepper, kin, signals);
            }
            let body_time = self.r().body_time;
            self.segments = (body_time / NOM_SEGMENT_TIME).ceil();
            self.segment_time = body_time / self.segments;
            self.segment_velocity = self.r().cruise_velocity;
            self.target_velocity = self.segment_velocity;
            self.segment_count = self.segments as u32;
            if self.segment_time < MIN_SEGMENT_TIME {
                return ExecStatus::Ok;
            }
            self.section = Section::Body;
            self.section_state = SectionState::Running;
        }

        match self.exec_segment(planner, stepper, kin, signals) {
            SegmentStatus::Done => {
                if fp_zero(self.r().tail_length) {
                    return ExecStatus::Ok;
                }
                self.section = Section::Tail;
                self.section_state = SectionState::New;
            }
            SegmentStatus::More => {}
            SegmentStatus::Failed => return ExecStatus::Failed,
        }
        ExecStatus::Eagain
    }

    fn exec_tail(
        &mut self,
        planner: &mut Planner,
        stepper: &mut Stepper,
        kin: &dyn Kinematics,
        signals: &MotionSignals,
    ) -> ExecStatus {
        if self.section_state == SectionState::New {
            if fp_zero(self.r().tail_length) {
                return ExecStatus::Ok;
            }
            let tail_time = self.r().tail_time;
            self.segments = (tail_time / NOM_SEGMENT_TIME).ceil();
            self.segment_count = self.segments as u32;
            self.segment_time = tail_time / self.segments;

            if self.segment_count == 1 {
                self.segment_velocity = self.r().cruise_velocity;
                self.target_velocity = self.r().exit_velocity;
            } else {
                let (v_0, v_1) = (self.r().cruise_velocity, self.r().exit_velocity);
                self.init_forward_diffs(v_0, v_1);
            }
            if self.segment_time < MIN_SEGMENT_TIME {
                return ExecStatus::Ok;
            }
            self.section = Section::Tail;
            self.section_state = SectionState::Running;
        } else {
            self.segment_velocity = self.target_velocity;
            self.target_velocity += self.fd[4];
        }

        match self.exec_segment(planner, stepper, kin, signals) {
            SegmentStatus::Done => ExecStatus::Ok,
            SegmentStatus::More => {
                self.fd[4] += self.fd[3];
                self.fd[3] += self.fd[2];
                self.fd[2] += self.fd[1];
                self.fd[1] += self.fd[0];
                ExecStatus::Eagain
            }
            SegmentStatus::Failed => ExecStatus::Failed,
        }
    }

    /// Run one segment: advance the target, convert to steps, prep the DDA.
    fn exec_segment(
        &mut self,
        planner: &mut Planner,
        stepper: &mut Stepper,
        kin: &dyn Kinematics,
        signals: &MotionSignals,
    ) -> SegmentStatus {
        self.segment_count -= 1;

        // On the last segment of a section, snap the target to the
        // precomputed waypoint instead of accumulating into it -- unless a
        // hold is reshaping the move under us.
        if self.segment_count == 0 && signals.hold_state == HoldState::Off {
            self.gm.target = self.waypoints[self.section as usize];
        } else {
            let segment_length =
                (self.segment_velocity + self.target_velocity) * 0.5 * self.segment_time;
            // Kahan-compensated accumulation; uncompensated f32 sums drift
            // measurably over multi-thousand-segment moves.
            for axis in 0..AXES {
                let to_add = (self.unit[axis] * segment_length) - self.gm.target_comp[axis];
                let target = self.position[axis] + to_add;
                self.gm.target_comp[axis] = (target - self.position[axis]) - to_add;
                self.gm.target[axis] = target;
            }
        }

        let target_steps = kin.inverse(&self.gm.target);
        let mut travel_steps = [0.0_f32; MOTORS];
        for motor in 0..MOTORS {
            travel_steps[motor] = target_steps[motor] - self.position_steps[motor];
            self.following_error[motor] =
                stepper.encoders.position(motor) - self.commanded_steps[motor];
        }

        planner.run_time_remaining = (planner.run_time_remaining - self.segment_time).max(0.0);

        if stepper
            .prep
            .line(travel_steps, self.following_error, self.segment_time)
            .is_err()
        {
            return SegmentStatus::Failed;
        }

        // Commanded steps run one segment behind target steps, aligning
        // them in time with the encoder readings.
        self.commanded_steps = self.position_steps;
        self.position_steps = target_steps;
        self.position = self.gm.target;

        trace!(
            v = self.segment_velocity,
            t = self.segment_time,
            left = self.segment_count,
            "segment"
        );

        if self.segment_count == 0 {
            SegmentStatus::Done
        } else {
            SegmentStatus::More
        }
    }

    /// Quintic Bezier forward-difference initialization.
    ///
    /// Velocity over the section is a fifth-degree Bernstein polynomial
    /// with both endpoint tangents and curvatures zeroed, which collapses
    /// the six control points to three coefficients:
    ///
    ///   A = -6 v_0 + 6 v_1,  B = 15 v_0 - 15 v_1,  C = -10 v_0 + 10 v_1
    ///
    /// The increments F5..F1 are precomputed so the per-segment update in
    /// the section runners is five additions, no multiplies, no sqrt.
    fn init_forward_diffs(&mut self, v_0: f32, v_1: f32) {
        let a = -6.0 * v_0 + 6.0 * v_1;
        let b = 15.0 * v_0 - 15.0 * v_1;
        let c = -10.0 * v_0 + 10.0 * v_1;
        // D = 0, E = 0, F = v_0

        let h = 1.0 / self.segments;
        let h_2 = h * h;
        let h_3 = h_2 * h;
        let h_4 = h_3 * h;
        let h_5 = h_4 * h;

        let ah_5 = a * h_5;
        let bh_4 = b * h_4;
        let ch_3 = c * h_3;

        // F_5 =     A h^5 +    B h^4 +   C h^3
        // F_4 =  30 A h^5 + 14 B h^4 + 6 C h^3
        // F_3 = 150 A h^5 + 36 B h^4 + 6 C h^3
        // F_2 = 240 A h^5 + 24 B h^4
        // F_1 = 120 A h^5
        self.fd[4] = ah_5 + bh_4 + ch_3;
        self.fd[3] = 30.0 * ah_5 + 14.0 * bh_4 + 6.0 * ch_3;
        self.fd[2] = 150.0 * ah_5 + 36.0 * bh_4 + 6.0 * ch_3;
        self.fd[1] = 240.0 * ah_5 + 24.0 * bh_4;
        self.fd[0] = 120.0 * ah_5;

        self.segment_velocity = v_0;
        self.target_velocity = v_0 + self.fd[4];
    }

    /// Collapse any section shorter than `MIN_SEGMENT_TIME` into an
    /// adjacent one so every section that runs can actually be segmented.
    fn normalize_block(&mut self) {
        let entry_velocity = self.entry_velocity;
        let b = self.r_mut();

        if b.head_length > 0.0 && b.head_time < MIN_SEGMENT_TIME {
            b.body_length += b.head_length;
            b.body_time = b.body_length / b.cruise_velocity;
            b.head_length = 0.0;
            b.head_time = 0.0;
        }
        if b.tail_length > 0.0 && b.tail_time < MIN_SEGMENT_TIME {
            b.body_length += b.tail_length;
            b.body_time = b.body_length / b.cruise_velocity;
            b.tail_length = 0.0;
            b.tail_time = 0.0;
        }

        // If the body is still too brief, push it into whichever of head
        // and tail exists -- split between both if both do.
        if b.body_length > 0.0 && b.body_time < MIN_SEGMENT_TIME {
            if b.tail_length > 0.0 {
                if b.head_length > 0.0 {
                    b.head_length += b.body_length * 0.5;
                    b.tail_length += b.body_length * 0.5;
                    b.head_time = 2.0 * b.head_length / (entry_velocity + b.cruise_velocity);
                    b.tail_time = 2.0 * b.tail_length / (b.cruise_velocity + b.exit_velocity);
                } else {
                    b.tail_length += b.body_length;
                    b.tail_time = 2.0 * b.tail_length / (b.cruise_velocity + b.exit_velocity);
                }
                b.body_length = 0.0;
                b.body_time = 0.0;
            } else if b.head_length > 0.0 {
                b.head_length += b.body_length;
                b.head_time = 2.0 * b.head_length / (entry_velocity + b.cruise_velocity);
                b.body_length = 0.0;
                b.body_time = 0.0;
            }
            // else: an all-body move that is still too short; it will play
            // as a single clamped segment rather than vanish.
        }
    }

    /// Feedhold processing within the executor: manages the deceleration
    /// into the hold and the states the cycle sequencer watches.
    ///
    /// Returns `Ok` to finish this exec entry but allow another load (still
    /// in continuous motion), `Noop` to finish and prevent loading (stopped
    /// at the hold point), `Eagain` to continue normal section execution.
    fn exec_feedhold(
        &mut self,
        idx: usize,
        planner: &mut Planner,
        stepper: &mut Stepper,
        signals: &mut MotionSignals,
    ) -> ExecStatus {
        // Wait for the steppers to drain, then land the hold.
        if signals.hold_state == HoldState::MotionStopping {
            if !stepper.runtime_is_busy() {
                if signals.hold_type == HoldType::Skip {
                    // Discard the remainder of the block.
                    planner.position = self.position;
                    planner.queue.free_run();
                } else {
                    // Rewrite the block to cover the residual distance so
                    // `~` can resume it.
                    let residual = axis_vector_length(&self.position, &self.move_target);
                    if residual < EPSILON2 {
                        // Deceleration landed exactly on the target.
                        planner.position = self.position;
                        planner.queue.free_run();
                    } else {
                        let bf = planner.queue.block_mut(idx);
                        bf.length = residual;
                        bf.run_state = RunBlockState::InitialAction;
                        // Revert this and all downstream blocks so the
                        // residual is replanned from zero velocity.
                        let mut j = idx;
                        while planner.queue.block(j).state > BufferState::BackPlanned {
                            let b = planner.queue.block_mut(j);
                            b.state = BufferState::BackPlanned;
                            b.plannable = true;
                            j = planner.queue.next(j);
                        }
                    }
                }
                self.reset_for_stop();
                signals.motion_state = MotionState::Stop;
                signals.hold_state = HoldState::MotionStopped;
            }
            return ExecStatus::Noop;
        }

        // Decelerated to zero; complete this exec entry before stopping.
        if signals.hold_state == HoldState::DecelComplete {
            signals.hold_state = HoldState::MotionStopping;
            return ExecStatus::Ok;
        }

        // Entry states: reshape the current block into a deceleration.
        if signals.hold_state == HoldState::Sync
            || (signals.hold_state == HoldState::DecelContinue
                && self.block_state == RunBlockState::InitialAction)
        {
            // Already in a tail: it is as sharp as jerk allows. Just mark
            // where the deceleration will land.
            if self.section == Section::Tail {
                signals.hold_state = if self.r().exit_velocity < EPSILON2 {
                    HoldState::DecelToZero
                } else {
                    HoldState::DecelContinue
                };
                return ExecStatus::Eagain;
            }

            // Mid-head: jerk has not returned to zero; wait for the body
            // or tail. (A head that hasn't started yet is fair game.)
            if self.section == Section::Head && self.section_state != SectionState::New {
                return ExecStatus::Eagain;
            }

            // Body, or an unstarted head: synthesize a tail from the
            // current velocity, decelerating as hard as the space allows.
            self.section = Section::Tail;
            self.section_state = SectionState::New;
            self.entry_velocity = self.segment_velocity;

            let entry_velocity = self.entry_velocity;
            let braking = {
                let bf = planner.queue.block(idx);
                target_length(0.0, entry_velocity, bf)
            };
            {
                let r = self.r_mut();
                r.cruise_velocity = entry_velocity; // required even with no body
                r.tail_length = braking;
                r.head_length = 0.0;
                r.body_length = 0.0;
                r.head_time = 0.0;
                r.body_time = 0.0;
            }

            let available = axis_vector_length(&self.move_target, &self.position);

            if available + EPSILON2 - self.r().tail_length > 0.0 {
                // Braking fits in this block.
                signals.hold_state = HoldState::DecelToZero;
                let r = self.r_mut();
                r.exit_velocity = 0.0;
                r.tail_time = r.tail_length * 2.0 / (r.exit_velocity + r.cruise_velocity);
                planner.queue.block_mut(idx).block_time = self.r().tail_time;
            } else {
                // It does not fit: exit this block as slow as possible and
                // let back-planning carry the reduced exit into the next.
                signals.hold_state = HoldState::DecelContinue;
                let cruise = self.r().cruise_velocity;
                let exit = {
                    let bf = planner.queue.block(idx);
                    decel_velocity(cruise, available, bf)
                };
                if exit >= 0.0 {
                    let r = self.r_mut();
                    r.tail_length = available;
                    r.exit_velocity = exit;
                    r.tail_time = r.tail_length * 2.0 / (r.exit_velocity + r.cruise_velocity);
                    planner.queue.block_mut(idx).block_time = self.r().tail_time;
                } else {
                    // Rare: the length is too short for any deceleration.
                    // Cruise through this block and brake in the next one.
                    self.section = Section::Body;
                    let r = self.r_mut();
                    r.exit_velocity = r.cruise_velocity;
                    r.body_length = available;
                    r.body_time = r.body_length / r.cruise_velocity;
                    r.tail_length = 0.0;
                    r.tail_time = 0.0;
                }
            }
            self.normalize_block();
        }
        ExecStatus::Eagain // continue exec_aline execution
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentStatus {
    Done,
    More,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinematics::CartesianKinematics;
    use crate::planner::{Planner, PlannerState};
    use crate::state::MoveState;
    use crate::AXIS_X;
    use stepper::prep::PrepOwner;
    use stepper::MotorPins;

    struct NullPins;
    impl MotorPins for NullPins {
        fn step_start(&mut self, _m: usize) {}
        fn step_end(&mut self, _m: usize) {}
        fn set_direction(&mut self, _m: usize, _r: bool) {}
        fn enable(&mut self, _m: usize) {}
        fn disable(&mut self, _m: usize) {}
    }

    fn queue_move(planner: &mut Planner, signals: &mut MotionSignals, x: f32, feed: f32) {
        let mut gm = MoveState {
            feed_rate: feed,
            ..Default::default()
        };
        gm.target[AXIS_X] = x;
        planner.aline(&gm, signals, 0).unwrap();
    }

    /// Drive the four contexts in priority order until the planner drains.
    fn run_to_completion(
        planner: &mut Planner,
        runtime: &mut Runtime,
        stepper: &mut Stepper,
        signals: &mut MotionSignals,
        kin: &dyn Kinematics,
    ) -> u32 {
        let mut pins = NullPins;
        let mut segments = 0;
        for _ in 0..200_000 {
            // DDA: drain the current segment wholesale (timing is tested in
            // the stepper crate; here we care about trajectory math).
            while stepper.runtime_is_busy() {
                stepper.dda_tick(&mut pins);
            }
            stepper.request_load(&mut pins);
            let _ = stepper.take_pending_command();

            if stepper.take_exec_request() && stepper.prep.owner() == PrepOwner::Exec {
                let status = runtime.exec_move(planner, stepper, kin, signals);
                if status == ExecStatus::Eagain || status == ExecStatus::Ok {
                    segments += 1;
                }
            }
            if stepper.take_forward_plan_request() && runtime.forward_plan(planner) == ExecStatus::Ok
            {
                stepper.request_exec();
            }
            planner.callback(1_000, signals, stepper);

            if planner.queue.run_index().is_none() && !stepper.runtime_is_busy() {
                break;
            }
        }
        segments
    }

    #[test]
    fn single_move_reaches_target() {
        let mut planner = Planner::default();
        let mut runtime = Runtime::new();
        let mut stepper = Stepper::default();
        let mut signals = MotionSignals {
            in_cycle: true,
            ..Default::default()
        };
        let kin = CartesianKinematics::uniform(40.0);

        queue_move(&mut planner, &mut signals, 10.0, 600.0);
        planner.state = PlannerState::Priming;
        planner.request_planning = true;
        planner.callback(1_000, &signals, &mut stepper);

        run_to_completion(&mut planner, &mut runtime, &mut stepper, &mut signals, &kin);

        assert!(
            (runtime.position[AXIS_X] - 10.0).abs() < 1e-3,
            "final position {}",
            runtime.position[AXIS_X]
        );
        assert_eq!(runtime.block_state, RunBlockState::Inactive);
        assert!(signals.cycle_end_pending);
    }

    #[test]
    fn position_conservation_over_many_moves() {
        let mut planner = Planner::default();
        let mut runtime = Runtime::new();
        let mut stepper = Stepper::default();
        let mut signals = MotionSignals {
            in_cycle: true,
            ..Default::default()
        };
        let kin = CartesianKinematics::uniform(40.0);

        let mut x = 0.0;
        for i in 1..=20 {
            x = i as f32 * 1.5;
            queue_move(&mut planner, &mut signals, x, 1200.0);
        }
        planner.state = PlannerState::Priming;
        planner.request_planning = true;
        planner.callback(1_000, &signals, &mut stepper);

        run_to_completion(&mut planner, &mut runtime, &mut stepper, &mut signals, &kin);
        // core correctness property of the Bezier segmenter
        assert!(
            (runtime.position[AXIS_X] - x).abs() < AXES as f32 * 1e-4,
            "drift: {}",
            (runtime.position[AXIS_X] - x).abs()
        );
    }

    #[test]
    fn forward_plan_only_plans_one_block() {
        let mut planner = Planner::default();
        let mut runtime = Runtime::new();
        let mut stepper = Stepper::default();
        let mut signals = MotionSignals {
            in_cycle: true,
            ..Default::default()
        };
        for i in 1..=3 {
            queue_move(&mut planner, &mut signals, i as f32 * 10.0, 600.0);
        }
        planner.state = PlannerState::Priming;
        planner.request_planning = true;
        planner.callback(1_000, &signals, &mut stepper);

        assert_eq!(runtime.forward_plan(&mut planner), ExecStatus::Ok);
        let r = planner.queue.run_cursor();
        assert_eq!(planner.queue.block(r).state, BufferState::FullyPlanned);
        assert_eq!(
            planner.queue.block(planner.queue.next(r)).state,
            BufferState::BackPlanned
        );
    }
}
