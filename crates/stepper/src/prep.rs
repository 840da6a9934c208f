//! Segment prep buffer: the single record handed from the segment executor
//! to the DDA loader.
//!
//! The handoff is a one-word ownership flip. The exec fills the record while
//! it holds ownership, then releases it to the loader; the loader reads it at
//! DDA priority and flips it back. Neither side ever mutates a record it does
//! not own.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::{
    StepperError, DDA_SUBSTEPS, FREQUENCY_DDA, MOTORS, STEP_CORRECTION_FACTOR,
    STEP_CORRECTION_HOLDOFF, STEP_CORRECTION_MAX, STEP_CORRECTION_THRESHOLD,
};

/// Who may mutate the prep record right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PrepOwner {
    Exec = 0,
    Loader = 1,
}

/// What the prep record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrepBlock {
    /// Nothing to load. Keeps the loader happy at end of queue.
    #[default]
    Null,
    /// A segment of coordinated motion.
    Segment,
    /// A timed pause, in DDA ticks.
    Dwell { ticks: u32 },
    /// A synchronous command carried through the queue. The token is opaque
    /// to this crate; the machine layer executes it at load priority.
    Command { token: u32 },
}

/// Per-motor prep state. `substep_increment == 0` doubles as the "motor not
/// in this segment" flag; all other fields then keep their values from the
/// last segment this motor actually ran.
#[derive(Debug, Clone, Copy)]
pub struct PrepMotor {
    pub substep_increment: i64,
    /// Direction for this segment, after polarity correction.
    pub direction: bool,
    pub prev_direction: bool,
    /// +1 or -1; used by the encoder accumulation.
    pub step_sign: i8,
    /// Accumulator scale factor applied when the segment time base changed.
    pub accumulator_correction: f32,
    pub accumulator_correction_flag: bool,
    prev_segment_time: f32,
    correction_holdoff: i32,
    /// Running total of steps injected by following-error nudges.
    pub corrected_steps: f32,
}

impl Default for PrepMotor {
    fn default() -> Self {
        Self {
            substep_increment: 0,
            direction: false,
            prev_direction: false,
            step_sign: 1,
            accumulator_correction: 1.0,
            accumulator_correction_flag: false,
            prev_segment_time: 0.0,
            correction_holdoff: 0,
            corrected_steps: 0.0,
        }
    }
}

/// The prep record itself. One per machine.
#[derive(Debug, Default)]
pub struct PrepBuffer {
    owner: AtomicU8,
    pub block: PrepBlock,
    pub motors: [PrepMotor; MOTORS],
    /// Integer DDA ticks for this segment.
    pub dda_ticks: u32,
    /// Accumulator depth: `dda_ticks * DDA_SUBSTEPS`.
    pub dda_ticks_x_substeps: i64,
}

impl PrepBuffer {
    pub fn new() -> Self {
        Self::default() // owner == Exec
    }

    pub fn owner(&self) -> PrepOwner {
        // Acquire pairs with the Release in `release_to_*`, making the
        // record's plain stores visible to whoever observes the flip.
        match self.owner.load(Ordering::Acquire) {
            0 => PrepOwner::Exec,
            _ => PrepOwner::Loader,
        }
    }

    pub fn release_to_loader(&self) {
        self.owner.store(PrepOwner::Loader as u8, Ordering::Release);
    }

    pub fn release_to_exec(&self) {
        self.owner.store(PrepOwner::Exec as u8, Ordering::Release);
    }

    /// Prepare a segment of coordinated motion for the loader.
    ///
    /// `travel_steps` is signed fractional steps per motor (0.0 for motors
    /// not in the move). `following_error` is measured steps of lag per
    /// motor. `segment_time` is in minutes.
    ///
    /// Many of the expressions here are sensitive to evaluation order; the
    /// accumulator must end up at *exactly* the fractional steps times the
    /// substep multiplier or position drifts over long jobs.
    pub fn line(
        &mut self,
        mut travel_steps: [f32; MOTORS],
        following_error: [f32; MOTORS],
        segment_time: f32,
    ) -> Result<(), StepperError> {
        if self.owner() != PrepOwner::Exec {
            return Err(StepperError::PrepSyncLost);
        }
        if !segment_time.is_finite() {
            return Err(StepperError::SegmentTimeNotFinite);
        }

        // segment_time is in minutes
        self.dda_ticks = (segment_time * 60.0 * FREQUENCY_DDA) as u32;
        self.dda_ticks_x_substeps = self.dda_ticks as i64 * DDA_SUBSTEPS as i64;

        for motor in 0..MOTORS {
            let m = &mut self.motors[motor];

            // Skip this motor if there are no new steps. Leave all other
            // values intact so state comparisons operate on the last segment
            // this motor actually ran.
            if travel_steps[motor].abs() < f32::EPSILON {
                m.substep_increment = 0;
                continue;
            }

            if travel_steps[motor] >= 0.0 {
                m.direction = false; // clockwise; polarity applied at the pin
                m.step_sign = 1;
            } else {
                m.direction = true;
                m.step_sign = -1;
            }

            // Detect segment time changes and set up the accumulator
            // correction factor, keeping the DDA phase-coherent across
            // time-base changes. Computed against the last segment time this
            // motor actually used, however long ago that was.
            if (segment_time - m.prev_segment_time).abs() > 1e-7 {
                if m.prev_segment_time > f32::EPSILON {
                    m.accumulator_correction_flag = true;
                    m.accumulator_correction = segment_time / m.prev_segment_time;
                }
                m.prev_segment_time = segment_time;
            }

            // 'Nudge' correction: inject a single scaled correction, then
            // hold off. Not a PID loop.
            m.correction_holdoff -= 1;
            if m.correction_holdoff < 0
                && following_error[motor].abs() > STEP_CORRECTION_THRESHOLD
            {
                m.correction_holdoff = STEP_CORRECTION_HOLDOFF;
                let mut correction = following_error[motor] * STEP_CORRECTION_FACTOR;
                if correction > 0.0 {
                    correction = correction
                        .min(travel_steps[motor].abs())
                        .min(STEP_CORRECTION_MAX);
                } else {
                    correction = correction
                        .max(-travel_steps[motor].abs())
                        .max(-STEP_CORRECTION_MAX);
                }
                m.corrected_steps += correction;
                travel_steps[motor] -= correction;
            }

            // Rounding eliminates a negative bias in the integer conversion
            // that causes long-term negative drift.
            m.substep_increment = (travel_steps[motor] * DDA_SUBSTEPS).abs().round() as i64;
        }
        self.block = PrepBlock::Segment;
        self.release_to_loader();
        Ok(())
    }

    /// Prepare a dwell for the loader. `microseconds` of pause.
    pub fn dwell(&mut self, microseconds: f32) {
        self.block = PrepBlock::Dwell {
            ticks: (microseconds / 1_000_000.0 * FREQUENCY_DDA) as u32,
        };
        self.release_to_loader();
    }

    /// Prepare a synchronous command for the loader.
    pub fn command(&mut self, token: u32) {
        self.block = PrepBlock::Command { token };
        self.release_to_loader();
    }

    /// Nothing to load; keeps the loader from spinning on stale data.
    pub fn null(&mut self) {
        self.block = PrepBlock::Null;
        self.release_to_exec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEG_750US: f32 = 750.0e-6 / 60.0; // nominal segment, in minutes

    #[test]
    fn line_converts_time_to_ticks() {
        let mut prep = PrepBuffer::new();
        let mut steps = [0.0; MOTORS];
        steps[0] = 10.0;
        prep.line(steps, [0.0; MOTORS], SEG_750US).unwrap();
        assert_eq!(prep.dda_ticks, 150); // 750us at 200kHz
        assert_eq!(prep.motors[0].substep_increment, 10_000_000);
        assert_eq!(prep.owner(), PrepOwner::Loader);
    }

    #[test]
    fn line_while_loader_owns_is_a_sync_error() {
        let mut prep = PrepBuffer::new();
        prep.release_to_loader();
        let err = prep.line([0.0; MOTORS], [0.0; MOTORS], SEG_750US);
        assert_eq!(err, Err(StepperError::PrepSyncLost));
    }

    #[test]
    fn inactive_motor_keeps_previous_state() {
        let mut prep = PrepBuffer::new();
        let mut steps = [0.0; MOTORS];
        steps[1] = -3.5;
        prep.line(steps, [0.0; MOTORS], SEG_750US).unwrap();
        assert_eq!(prep.motors[1].step_sign, -1);
        prep.release_to_exec();

        // motor 1 idle this time: direction and sign must survive
        prep.line([0.0; MOTORS], [0.0; MOTORS], SEG_750US).unwrap();
        assert_eq!(prep.motors[1].substep_increment, 0);
        assert_eq!(prep.motors[1].step_sign, -1);
        assert!(prep.motors[1].direction);
    }

    #[test]
    fn correction_nudge_is_clamped_and_held_off() {
        let mut prep = PrepBuffer::new();
        let mut steps = [0.0; MOTORS];
        steps[0] = 100.0;
        let mut err = [0.0; MOTORS];
        err[0] = 10.0; // way past threshold

        prep.line(steps, err, SEG_750US).unwrap();
        // clamped at STEP_CORRECTION_MAX
        assert!((prep.motors[0].corrected_steps - STEP_CORRECTION_MAX).abs() < 1e-6);

        // immediately after, the holdoff suppresses further nudges
        prep.release_to_exec();
        prep.line(steps, err, SEG_750US).unwrap();
        assert!((prep.motors[0].corrected_steps - STEP_CORRECTION_MAX).abs() < 1e-6);
    }

    #[test]
    fn time_base_change_arms_accumulator_correction() {
        let mut prep = PrepBuffer::new();
        let mut steps = [0.0; MOTORS];
        steps[0] = 10.0;
        prep.line(steps, [0.0; MOTORS], SEG_750US).unwrap();
        assert!(!prep.motors[0].accumulator_correction_flag); // first segment: skip

        prep.release_to_exec();
        prep.line(steps, [0.0; MOTORS], SEG_750US * 0.5).unwrap();
        assert!(prep.motors[0].accumulator_correction_flag);
        assert!((prep.motors[0].accumulator_correction - 0.5).abs() < 1e-3);
    }
}
