//! # Stepper Engine
//!
//! The hard real-time half of the motion pipeline: a fixed-frequency DDA
//! (digital differential analyzer) that turns prepared segments into step
//! pulses, one accumulator per motor.
//!
//! ## Prep/run double buffer
//!
//! The segment executor (in the `motion` crate) fills a single prep record
//! and hands it over by flipping an ownership word. The segment loader --
//! which runs at DDA priority when the previous segment's tick downcount
//! reaches zero -- consumes the record and flips the word back. Only the
//! owner may touch the record; the flip is Release on the writer side and
//! Acquire on the reader side so the stores are visible before the handoff.
//!
//! ## Contexts
//!
//! Nothing in this crate spawns threads or installs interrupt handlers.
//! [`Stepper::dda_tick`] is the ISR body; the host or simulator calls it at
//! `FREQUENCY_DDA` and is responsible for honoring the priority ordering
//! described in the crate-level docs of `motion`.

pub mod dda;
pub mod encoder;
pub mod motor;
pub mod prep;

pub use dda::{DdaRun, LoadedBlock, MotorPins, Stepper};
pub use encoder::Encoders;
pub use motor::{Polarity, PowerMode, StepperConfig};
pub use prep::{PrepBlock, PrepBuffer, PrepOwner};

/// Number of physical motor channels.
pub const MOTORS: usize = 6;

/// DDA tick rate in Hz.
pub const FREQUENCY_DDA: f32 = 200_000.0;

/// Substep scaling factor. The accumulator works in substeps so fractional
/// step counts carry across segments without positional drift.
pub const DDA_SUBSTEPS: f32 = 1_000_000.0;

/// Following-error nudge: errors below this many steps are left alone.
pub const STEP_CORRECTION_THRESHOLD: f32 = 2.0;
/// Fraction of the following error injected per nudge.
pub const STEP_CORRECTION_FACTOR: f32 = 0.25;
/// Hard cap on steps injected by a single nudge.
pub const STEP_CORRECTION_MAX: f32 = 0.6;
/// Segments to wait between nudges on the same motor.
pub const STEP_CORRECTION_HOLDOFF: i32 = 5;

/// Errors surfaced by the prep path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StepperError {
    /// Prep buffer was not owned by the exec when a segment arrived.
    #[error("prep buffer handoff out of sync")]
    PrepSyncLost,
    /// The segment time was not a finite number.
    #[error("segment time is not finite")]
    SegmentTimeNotFinite,
}
