//! # millrun host
//!
//! The controller half of the firmware: the cooperative dispatcher loop,
//! the cycle state machines (feedhold, probing, jogging, homing), the flat
//! configuration token registry, and the status/queue reporters. The
//! library target exists so the simulator can drive a whole [`Machine`]
//! in-process; the binary wires transports to it.

pub mod batch;
pub mod commands;
pub mod config;
pub mod controller;
pub mod cycle;
pub mod inputs;
pub mod machine;
pub mod report;
pub mod tokens;
pub mod transport;

pub use config::MachineProfile;
pub use machine::{BuildInfo, Machine, MachineState};
