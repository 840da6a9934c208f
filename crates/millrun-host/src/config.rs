//! Machine profile loading.
//!
//! The on-disk profile is an INI file (`millrun.cfg`) with `[machine]`,
//! `[axis_*]` and `[motor_N]` sections. The same values are addressable at
//! runtime through the flat JSON token registry in `tokens.rs`; this module
//! only handles startup.

use anyhow::{Context, Result};
use configparser::ini::Ini;
use motion::{AxisConfig, CartesianKinematics, CoreXyKinematics, Kinematics, PlannerConfig, AXES};
use std::path::Path;
use stepper::{Polarity, PowerMode, StepperConfig, MOTORS};

const AXIS_NAMES: [&str; AXES] = ["x", "y", "z", "a", "b", "c"];

/// Everything configurable at startup.
#[derive(Debug, Clone)]
pub struct MachineProfile {
    pub axes: [AxisConfig; AXES],
    pub motors: [StepperConfig; MOTORS],
    pub junction_integration_time: f32,
    pub chord_tolerance: f32,
    pub status_interval_ms: u32,
    /// 0 = off, 1 = filtered, 2 = verbose.
    pub status_verbosity: u8,
    /// 0 = off, 1 = single, 2 = triple.
    pub queue_verbosity: u8,
    pub kinematics: String,
}

impl Default for MachineProfile {
    fn default() -> Self {
        let mut motors: [StepperConfig; MOTORS] = Default::default();
        for (i, motor) in motors.iter_mut().enumerate() {
            motor.axis = i % AXES;
        }
        Self {
            axes: [AxisConfig::default(); AXES],
            motors,
            junction_integration_time: 0.35,
            chord_tolerance: 0.01,
            status_interval_ms: 250,
            status_verbosity: 1,
            queue_verbosity: 1,
            kinematics: "cartesian".into(),
        }
    }
}

impl MachineProfile {
    /// Load and parse the profile file.
    pub fn load(path: &Path) -> Result<Self> {
        let mut ini = Ini::new();
        ini.load(path)
            .map_err(|e| anyhow::anyhow!(e))
            .with_context(|| format!("failed to load machine profile {path:?}"))?;

        let mut profile = MachineProfile::default();

        if let Ok(Some(v)) = ini.getfloat("machine", "junction_integration_time") {
            profile.junction_integration_time = v as f32;
        }
        if let Ok(Some(v)) = ini.getfloat("machine", "chord_tolerance") {
            profile.chord_tolerance = v as f32;
        }
        if let Ok(Some(v)) = ini.getuint("machine", "status_interval_ms") {
            profile.status_interval_ms = v as u32;
        }
        if let Ok(Some(v)) = ini.getuint("machine", "status_verbosity") {
            profile.status_verbosity = v as u8;
        }
        if let Ok(Some(v)) = ini.getuint("machine", "queue_verbosity") {
            profile.queue_verbosity = v as u8;
        }
        if let Some(v) = ini.get("machine", "kinematics") {
            profile.kinematics = v;
        }

        for (i, name) in AXIS_NAMES.iter().enumerate() {
            let section = format!("axis_{name}");
            let axis = &mut profile.axes[i];
            if let Ok(Some(v)) = ini.getfloat(&section, "velocity_max") {
                axis.velocity_max = v as f32;
            }
            if let Ok(Some(v)) = ini.getfloat(&section, "feedrate_max") {
                axis.feedrate_max = v as f32;
            }
            if let Ok(Some(v)) = ini.getfloat(&section, "jerk_max") {
                axis.jerk_max = v as f32;
            }
            if let Ok(Some(v)) = ini.getfloat(&section, "jerk_high") {
                axis.jerk_high = v as f32;
            }
        }

        for m in 0..MOTORS {
            let section = format!("motor_{}", m + 1);
            let motor = &mut profile.motors[m];
            if let Ok(Some(v)) = ini.getuint(&section, "axis") {
                if (v as usize) < AXES {
                    motor.axis = v as usize;
                }
            }
            if let Ok(Some(v)) = ini.getfloat(&section, "step_angle") {
                motor.step_angle = v as f32;
            }
            if let Ok(Some(v)) = ini.getfloat(&section, "travel_per_rev") {
                motor.travel_per_rev = v as f32;
            }
            if let Ok(Some(v)) = ini.getuint(&section, "microsteps") {
                motor.microsteps = v as u16;
            }
            if let Ok(Some(v)) = ini.getbool(&section, "reverse") {
                motor.polarity = if v { Polarity::Reversed } else { Polarity::Normal };
            }
            if let Some(v) = ini.get(&section, "power_mode") {
                motor.power_mode = match v.as_str() {
                    "disabled" => PowerMode::Disabled,
                    "always_on" => PowerMode::AlwaysOn,
                    "in_cycle" => PowerMode::InCycle,
                    "when_moving" => PowerMode::WhenMoving,
                    _ => motor.power_mode,
                };
            }
            if let Ok(Some(v)) = ini.getfloat(&section, "power_level") {
                motor.power_level = (v as f32).clamp(0.0, 1.0);
            }
        }
        Ok(profile)
    }

    pub fn planner_config(&self) -> PlannerConfig {
        PlannerConfig {
            axes: self.axes,
            junction_integration_time: self.junction_integration_time,
            ..PlannerConfig::default()
        }
    }

    pub fn stepper_configs(&self) -> [StepperConfig; MOTORS] {
        self.motors
    }

    pub fn kinematics(&self) -> Box<dyn Kinematics> {
        let motor_axis = core::array::from_fn(|m| self.motors[m].axis);
        let steps_per_unit = core::array::from_fn(|m| self.motors[m].steps_per_unit());
        match self.kinematics.as_str() {
            "corexy" => Box::new(CoreXyKinematics {
                motor_axis,
                steps_per_unit,
            }),
            _ => Box::new(CartesianKinematics {
                motor_axis,
                steps_per_unit,
            }),
        }
    }
}
