//! Per-motor configuration: axis mapping, step geometry, polarity and power.

/// Step pin polarity. `Reversed` swaps the meaning of the direction pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde-support", derive(serde::Serialize, serde::Deserialize))]
pub enum Polarity {
    #[default]
    Normal,
    Reversed,
}

/// Motor power management mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde-support", derive(serde::Serialize, serde::Deserialize))]
pub enum PowerMode {
    /// Motor is always de-energized.
    Disabled,
    /// Motor stays energized whenever the machine is powered.
    AlwaysOn,
    /// Energized while in a machining cycle, times out afterwards.
    #[default]
    InCycle,
    /// Energized only while this motor is actually moving.
    WhenMoving,
}

/// Static configuration for one motor channel.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde-support", derive(serde::Serialize, serde::Deserialize))]
pub struct StepperConfig {
    /// Axis this motor is mapped to (index into the axis vector).
    pub axis: usize,
    /// Full step angle in degrees (typ. 1.8).
    pub step_angle: f32,
    /// Travel per motor revolution in mm (or degrees for rotary axes).
    pub travel_per_rev: f32,
    /// Microstep divisor (1, 2, 4, 8, 16, 32).
    pub microsteps: u16,
    pub polarity: Polarity,
    pub power_mode: PowerMode,
    /// Power level 0.0..=1.0, meaning is driver-specific.
    pub power_level: f32,
}

impl StepperConfig {
    /// Steps per unit of travel, derived from step angle, travel and
    /// microstepping.
    pub fn steps_per_unit(&self) -> f32 {
        (360.0 / self.step_angle) * self.microsteps as f32 / self.travel_per_rev
    }
}

impl Default for StepperConfig {
    fn default() -> Self {
        Self {
            axis: 0,
            step_angle: 1.8,
            travel_per_rev: 40.0,
            microsteps: 8,
            polarity: Polarity::Normal,
            power_mode: PowerMode::InCycle,
            power_level: 0.5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_per_unit_matches_geometry() {
        let cfg = StepperConfig {
            step_angle: 1.8,
            travel_per_rev: 40.0,
            microsteps: 8,
            ..Default::default()
        };
        // 200 full steps * 8 microsteps over 40mm = 40 steps/mm
        assert!((cfg.steps_per_unit() - 40.0).abs() < 1e-6);
    }
}
