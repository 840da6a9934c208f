//! The DDA tick and the segment loader.
//!
//! [`Stepper::dda_tick`] is the body of the highest-priority interrupt. Per
//! tick it ends the previous pulse, runs one Bresenham pass over the motors,
//! and -- on the last tick of a segment -- chains directly into the loader at
//! the same priority. The loader consumes the prep record, fixes up the
//! per-motor accumulators for direction and time-base changes, and re-arms
//! the timer.

use tracing::trace;

use crate::encoder::Encoders;
use crate::motor::{PowerMode, StepperConfig};
use crate::prep::{PrepBlock, PrepBuffer, PrepOwner};
use crate::MOTORS;

/// Hardware seam: step/direction/enable pins for all motors.
///
/// The real machine maps these to GPIO; the simulator records pulses with
/// timestamps. Calls arrive at DDA priority and must be non-blocking.
pub trait MotorPins {
    fn step_start(&mut self, motor: usize);
    fn step_end(&mut self, motor: usize);
    fn set_direction(&mut self, motor: usize, reverse: bool);
    fn enable(&mut self, motor: usize);
    fn disable(&mut self, motor: usize);
}

/// Per-motor DDA running state. Mutated only inside the DDA ISR and loader.
#[derive(Debug, Clone, Copy, Default)]
struct DdaMotor {
    substep_accumulator: i64,
    substep_increment: i64,
    energized: bool,
}

/// Global DDA running state.
#[derive(Debug, Default)]
pub struct DdaRun {
    mot: [DdaMotor; MOTORS],
    dda_ticks_downcount: u32,
    dda_ticks_x_substeps: i64,
    dwell_ticks_downcount: u32,
    timer_armed: bool,
}

/// What the loader pulled out of the prep record, for the caller to act on.
/// Commands execute at load priority but outside this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadedBlock {
    Nothing,
    Segment,
    Dwell,
    Command { token: u32 },
}

/// The stepper engine: prep record, run state, encoders and the software
/// interrupt request flags that sequence exec and forward planning.
#[derive(Debug, Default)]
pub struct Stepper {
    pub prep: PrepBuffer,
    pub run: DdaRun,
    pub encoders: Encoders,
    pub config: [StepperConfig; MOTORS],
    /// Set to request the exec software interrupt.
    exec_requested: bool,
    /// Set to request the forward-plan software interrupt.
    forward_plan_requested: bool,
    /// Pending command token surfaced by the loader.
    pending_command: Option<u32>,
    /// Motion state gate set by the machine layer: true while in cycle.
    motion_running: bool,
}

impl Stepper {
    pub fn new(config: [StepperConfig; MOTORS]) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Reset everything except configuration. Used on queue flush and alarm.
    pub fn reset(&mut self) {
        self.run = DdaRun::default();
        self.prep.null();
        self.exec_requested = false;
        self.forward_plan_requested = false;
        self.pending_command = None;
    }

    /// True while the DDA is playing out a segment or a dwell.
    pub fn runtime_is_busy(&self) -> bool {
        self.run.dda_ticks_downcount != 0 || self.run.dwell_ticks_downcount != 0
    }

    pub fn set_motion_running(&mut self, running: bool) {
        self.motion_running = running;
    }

    /// Request the exec software interrupt (medium priority).
    pub fn request_exec(&mut self) {
        self.exec_requested = true;
    }

    /// Request the forward-plan software interrupt (low priority).
    pub fn request_forward_plan(&mut self) {
        self.forward_plan_requested = true;
    }

    pub fn take_exec_request(&mut self) -> bool {
        core::mem::take(&mut self.exec_requested)
    }

    pub fn take_forward_plan_request(&mut self) -> bool {
        core::mem::take(&mut self.forward_plan_requested)
    }

    pub fn take_pending_command(&mut self) -> Option<u32> {
        self.pending_command.take()
    }

    /// Request a load if the runtime is idle and the prep record is ready.
    /// The non-ISR path into the loader.
    pub fn request_load(&mut self, pins: &mut dyn MotorPins) -> LoadedBlock {
        if self.runtime_is_busy() {
            return LoadedBlock::Nothing;
        }
        if self.prep.owner() == PrepOwner::Loader {
            return self.load_move(pins);
        }
        LoadedBlock::Nothing
    }

    /// One DDA timer tick. Returns what the loader did, if it ran.
    pub fn dda_tick(&mut self, pins: &mut dyn MotorPins) -> LoadedBlock {
        // End the pulses set by the previous tick.
        for motor in 0..MOTORS {
            pins.step_end(motor);
        }

        // Last tick already played; stop the timer or it keeps stepping out
        // the stale segment.
        if self.run.dda_ticks_downcount == 0 {
            self.run.timer_armed = false;
            return LoadedBlock::Nothing;
        }

        for motor in 0..MOTORS {
            let m = &mut self.run.mot[motor];
            m.substep_accumulator += m.substep_increment;
            if m.substep_accumulator > 0 {
                pins.step_start(motor);
                m.substep_accumulator -= self.run.dda_ticks_x_substeps;
                self.encoders.increment(motor);
            }
        }

        self.run.dda_ticks_downcount -= 1;
        if self.run.dda_ticks_downcount == 0 {
            // Load the next segment at the current (DDA) priority.
            return self.load_move(pins);
        }
        LoadedBlock::Nothing
    }

    /// One systick worth of dwell time. Chains into the loader when the
    /// dwell expires. `ticks` is elapsed DDA-equivalent ticks.
    pub fn dwell_tick(&mut self, ticks: u32, pins: &mut dyn MotorPins) -> LoadedBlock {
        if self.run.dwell_ticks_downcount == 0 {
            return LoadedBlock::Nothing;
        }
        self.run.dwell_ticks_downcount = self.run.dwell_ticks_downcount.saturating_sub(ticks);
        if self.run.dwell_ticks_downcount == 0 {
            return self.load_move(pins);
        }
        LoadedBlock::Nothing
    }

    /// Dequeue the prep record into the running state.
    ///
    /// Runs at DDA priority (from the tick) or from `request_load` when the
    /// runtime is idle. Whole-segment load is budgeted under 5us on target
    /// hardware, so everything here is straight-line integer work.
    fn load_move(&mut self, pins: &mut dyn MotorPins) -> LoadedBlock {
        if self.runtime_is_busy() {
            return LoadedBlock::Nothing;
        }
        if self.prep.owner() != PrepOwner::Loader {
            // Nothing staged. If we are mid-cycle this is buffer starvation;
            // poke the exec to catch up. Otherwise start power-down timeouts.
            if self.motion_running {
                self.exec_requested = true;
            } else {
                for motor in 0..MOTORS {
                    self.motion_stopped(motor, pins);
                }
            }
            return LoadedBlock::Nothing;
        }

        let loaded = match self.prep.block {
            PrepBlock::Segment => {
                self.run.dda_ticks_downcount = self.prep.dda_ticks;
                self.run.dda_ticks_x_substeps = self.prep.dda_ticks_x_substeps;

                for motor in 0..MOTORS {
                    let pm = &mut self.prep.motors[motor];
                    let rm = &mut self.run.mot[motor];

                    rm.substep_increment = pm.substep_increment;
                    if rm.substep_increment != 0 {
                        // Apply accumulator correction if the time base
                        // changed since the last segment this motor ran.
                        if pm.accumulator_correction_flag {
                            pm.accumulator_correction_flag = false;
                            rm.substep_accumulator = (rm.substep_accumulator as f64
                                * pm.accumulator_correction as f64)
                                as i64;
                        }

                        // On direction change, flip the pin and reflect the
                        // accumulator about its midpoint to preserve substep
                        // phase across the reversal.
                        if pm.direction != pm.prev_direction {
                            pm.prev_direction = pm.direction;
                            rm.substep_accumulator =
                                -(self.run.dda_ticks_x_substeps + rm.substep_accumulator);
                            let cfg = &self.config[motor];
                            pins.set_direction(
                                motor,
                                pm.direction != (cfg.polarity == crate::Polarity::Reversed),
                            );
                        }

                        if !rm.energized {
                            rm.energized = true;
                            pins.enable(motor);
                        }
                        self.encoders.set_step_sign(motor, pm.step_sign);
                    } else {
                        self.motion_stopped(motor, pins);
                    }
                    // Fold counted steps into position for the segment that
                    // just finished, and zero the counter for this one.
                    self.encoders.accumulate(motor);
                }
                self.run.timer_armed = true;
                LoadedBlock::Segment
            }
            PrepBlock::Dwell { ticks } => {
                self.run.dwell_ticks_downcount = ticks;
                LoadedBlock::Dwell
            }
            PrepBlock::Command { token } => {
                self.pending_command = Some(token);
                LoadedBlock::Command { token }
            }
            PrepBlock::Null => LoadedBlock::Nothing,
        };

        trace!(?loaded, ticks = self.run.dda_ticks_downcount, "segment load");

        // Done with the prep record; hand it back and ask for the next one.
        self.prep.block = PrepBlock::Null;
        self.prep.release_to_exec();
        self.exec_requested = true;
        loaded
    }

    /// Start power management for a motor that has stopped moving.
    fn motion_stopped(&mut self, motor: usize, pins: &mut dyn MotorPins) {
        let rm = &mut self.run.mot[motor];
        match self.config[motor].power_mode {
            PowerMode::Disabled => {
                if rm.energized {
                    rm.energized = false;
                    pins.disable(motor);
                }
            }
            PowerMode::WhenMoving => {
                if rm.energized {
                    rm.energized = false;
                    pins.disable(motor);
                }
            }
            // InCycle timeouts are sequenced by the machine layer's power
            // callback; AlwaysOn never drops out.
            PowerMode::InCycle | PowerMode::AlwaysOn => {}
        }
    }

    /// De-energize every motor immediately (shutdown path).
    pub fn deenergize_all(&mut self, pins: &mut dyn MotorPins) {
        for motor in 0..MOTORS {
            self.run.mot[motor].energized = false;
            pins.disable(motor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct PinLog {
        steps: Vec<usize>,
        dirs: Vec<(usize, bool)>,
    }

    impl MotorPins for PinLog {
        fn step_start(&mut self, motor: usize) {
            self.steps.push(motor);
        }
        fn step_end(&mut self, _motor: usize) {}
        fn set_direction(&mut self, motor: usize, reverse: bool) {
            self.dirs.push((motor, reverse));
        }
        fn enable(&mut self, _motor: usize) {}
        fn disable(&mut self, _motor: usize) {}
    }

    const SEG: f32 = 750.0e-6 / 60.0;

    fn stage_segment(st: &mut Stepper, steps0: f32) {
        let mut steps = [0.0; MOTORS];
        steps[0] = steps0;
        st.prep.line(steps, [0.0; MOTORS], SEG).unwrap();
    }

    #[test]
    fn segment_emits_requested_step_count() {
        let mut st = Stepper::default();
        let mut pins = PinLog::default();
        stage_segment(&mut st, 10.0);
        assert_eq!(st.request_load(&mut pins), LoadedBlock::Segment);

        let ticks = st.run.dda_ticks_downcount;
        for _ in 0..ticks {
            st.dda_tick(&mut pins);
        }
        assert_eq!(pins.steps.len(), 10);
        // one trailing tick ends the final pulse and parks the timer
        st.dda_tick(&mut pins);
        assert!(!st.runtime_is_busy());
    }

    #[test]
    fn direction_reversal_reflects_accumulator() {
        let mut st = Stepper::default();
        let mut pins = PinLog::default();

        stage_segment(&mut st, 4.0);
        st.request_load(&mut pins);
        for _ in 0..st.run.dda_ticks_downcount {
            st.dda_tick(&mut pins);
        }
        let acc_before = st.run.mot[0].substep_accumulator;

        stage_segment(&mut st, -4.0);
        st.request_load(&mut pins);
        // reflection about the midpoint: acc' = -(depth + acc)
        assert_eq!(
            st.run.mot[0].substep_accumulator,
            -(st.run.dda_ticks_x_substeps + acc_before)
        );
        assert_eq!(pins.dirs.len(), 1);
    }

    #[test]
    fn dwell_counts_down_then_loads() {
        let mut st = Stepper::default();
        let mut pins = PinLog::default();
        st.prep.dwell(1000.0); // 1ms = 200 ticks
        assert_eq!(st.request_load(&mut pins), LoadedBlock::Dwell);
        assert!(st.runtime_is_busy());
        assert_eq!(st.dwell_tick(100, &mut pins), LoadedBlock::Nothing);
        // expiry chains into the loader, which finds nothing staged
        assert_eq!(st.dwell_tick(100, &mut pins), LoadedBlock::Nothing);
        assert!(!st.runtime_is_busy());
    }

    #[test]
    fn encoder_tracks_pulses_across_segments() {
        let mut st = Stepper::default();
        let mut pins = PinLog::default();
        stage_segment(&mut st, 5.0);
        st.request_load(&mut pins);
        for _ in 0..st.run.dda_ticks_downcount {
            st.dda_tick(&mut pins);
        }
        // counted steps fold in at the *next* load
        stage_segment(&mut st, 5.0);
        st.request_load(&mut pins);
        assert_eq!(st.encoders.position(0), 5.0);
    }
}
