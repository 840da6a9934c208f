//! Step-position encoders.
//!
//! Each motor carries an intent counter incremented by the DDA ISR on every
//! step pulse, signed by the segment's step sign at load time. The loader
//! folds the counted steps into the running step position, which the segment
//! executor compares against commanded steps to produce the following error.

use crate::MOTORS;

#[derive(Debug, Clone, Copy, Default)]
struct Encoder {
    /// Steps counted by the DDA since the last accumulate, unsigned.
    steps_run: i32,
    /// Sign applied at accumulate time (set by the loader per segment).
    step_sign: i8,
    /// Absolute step position.
    position: f32,
}

/// All motor encoders. Written only at DDA/loader priority, read from exec.
#[derive(Debug, Default)]
pub struct Encoders {
    enc: [Encoder; MOTORS],
}

impl Encoders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called from the DDA tick when a motor fires a step.
    #[inline]
    pub fn increment(&mut self, motor: usize) {
        self.enc[motor].steps_run += 1;
    }

    /// Set the sign the counted steps will carry, at segment load.
    pub fn set_step_sign(&mut self, motor: usize, sign: i8) {
        self.enc[motor].step_sign = sign;
    }

    /// Fold counted steps into the step position and reset the counter.
    /// Called by the loader once per segment boundary.
    pub fn accumulate(&mut self, motor: usize) {
        let e = &mut self.enc[motor];
        e.position += (e.steps_run * e.step_sign as i32) as f32;
        e.steps_run = 0;
    }

    /// Absolute step position of a motor.
    pub fn position(&self, motor: usize) -> f32 {
        self.enc[motor].position
    }

    /// Snapshot all positions. Used by the probe ISR path, which must read
    /// the encoders inside the interrupt.
    pub fn snapshot(&self) -> [f32; MOTORS] {
        core::array::from_fn(|m| self.enc[m].position)
    }

    /// Force positions, used when re-syncing runtime position at idle.
    pub fn set_position(&mut self, motor: usize, steps: f32) {
        self.enc[motor].position = steps;
        self.enc[motor].steps_run = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counted_steps_accumulate_with_sign() {
        let mut enc = Encoders::new();
        enc.set_step_sign(0, 1);
        enc.increment(0);
        enc.increment(0);
        enc.accumulate(0);
        assert_eq!(enc.position(0), 2.0);

        enc.set_step_sign(0, -1);
        enc.increment(0);
        enc.accumulate(0);
        assert_eq!(enc.position(0), 1.0);
    }
}
