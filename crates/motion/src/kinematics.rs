//! Kinematics: the pluggable mapping between axis space (mm, degrees) and
//! motor step space.
//!
//! The executor calls [`Kinematics::inverse`] once per segment; keep
//! implementations allocation-free and branch-light. Forward kinematics is
//! used for probe-trip position recovery and idle re-sync, both off the hot
//! path.

use stepper::MOTORS;

use crate::{Axes, AXES, AXIS_X, AXIS_Y};

pub trait Kinematics: Send + Sync {
    /// Axis positions to fractional motor step counts.
    fn inverse(&self, target: &Axes) -> [f32; MOTORS];

    /// Motor step counts back to axis positions.
    fn forward(&self, steps: &[f32; MOTORS]) -> Axes;

    /// Called when the machine idles; a hook for following-error cleanup.
    /// Returns true if the idle work is done.
    fn idle_task(&self) -> bool {
        true
    }
}

/// Straight-through Cartesian machine: each motor serves one axis.
#[derive(Debug, Clone, Copy)]
pub struct CartesianKinematics {
    /// Axis driven by each motor.
    pub motor_axis: [usize; MOTORS],
    pub steps_per_unit: [f32; MOTORS],
}

impl CartesianKinematics {
    /// Motor N drives axis N, all at the same steps/mm. Test helper and
    /// sane default.
    pub fn uniform(steps_per_unit: f32) -> Self {
        Self {
            motor_axis: core::array::from_fn(|m| m % AXES),
            steps_per_unit: [steps_per_unit; MOTORS],
        }
    }
}

impl Kinematics for CartesianKinematics {
    fn inverse(&self, target: &Axes) -> [f32; MOTORS] {
        core::array::from_fn(|m| target[self.motor_axis[m]] * self.steps_per_unit[m])
    }

    fn forward(&self, steps: &[f32; MOTORS]) -> Axes {
        let mut out = [0.0; AXES];
        // first motor mapped to an axis wins; gang followers are ignored
        for m in (0..MOTORS).rev() {
            out[self.motor_axis[m]] = steps[m] / self.steps_per_unit[m];
        }
        out
    }
}

/// CoreXY: motors 0 and 1 jointly drive X and Y through the belt sum and
/// difference; remaining motors are straight-through.
#[derive(Debug, Clone, Copy)]
pub struct CoreXyKinematics {
    pub motor_axis: [usize; MOTORS],
    pub steps_per_unit: [f32; MOTORS],
}

impl Kinematics for CoreXyKinematics {
    fn inverse(&self, target: &Axes) -> [f32; MOTORS] {
        let mut steps: [f32; MOTORS] =
            core::array::from_fn(|m| target[self.motor_axis[m]] * self.steps_per_unit[m]);
        let x = target[AXIS_X];
        let y = target[AXIS_Y];
        steps[0] = (x + y) * self.steps_per_unit[0];
        steps[1] = (x - y) * self.steps_per_unit[1];
        steps
    }

    fn forward(&self, steps: &[f32; MOTORS]) -> Axes {
        let mut out = [0.0; AXES];
        for m in (2..MOTORS).rev() {
            out[self.motor_axis[m]] = steps[m] / self.steps_per_unit[m];
        }
        let a = steps[0] / self.steps_per_unit[0];
        let b = steps[1] / self.steps_per_unit[1];
        out[AXIS_X] = (a + b) * 0.5;
        out[AXIS_Y] = (a - b) * 0.5;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cartesian_round_trip() {
        let kin = CartesianKinematics::uniform(80.0);
        let mut target = [0.0; AXES];
        target[AXIS_X] = 12.5;
        target[AXIS_Y] = -3.25;
        let steps = kin.inverse(&target);
        assert_eq!(steps[0], 1000.0);
        let back = kin.forward(&steps);
        assert!((back[AXIS_X] - 12.5).abs() < 1e-5);
        assert!((back[AXIS_Y] + 3.25).abs() < 1e-5);
    }

    #[test]
    fn corexy_round_trip() {
        let kin = CoreXyKinematics {
            motor_axis: core::array::from_fn(|m| m % AXES),
            steps_per_unit: [80.0; MOTORS],
        };
        let mut target = [0.0; AXES];
        target[AXIS_X] = 5.0;
        target[AXIS_Y] = 2.0;
        let steps = kin.inverse(&target);
        assert_eq!(steps[0], 560.0); // (5+2)*80
        assert_eq!(steps[1], 240.0); // (5-2)*80
        let back = kin.forward(&steps);
        assert!((back[AXIS_X] - 5.0).abs() < 1e-5);
        assert!((back[AXIS_Y] - 2.0).abs() < 1e-5);
    }
}
