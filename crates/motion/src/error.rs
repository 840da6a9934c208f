//! Planner error surface.

/// Errors and out-of-band results from the planning path. Everything here is
/// a status the dispatcher converts into a wire response; none of these
/// unwind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    /// Move is below the minimum length. The endpoint is NOT advanced, so
    /// too-short moves accumulate and execute once the error is large
    /// enough to matter.
    #[error("minimum length move")]
    MinimumLengthMove,

    /// No write buffer available. The dispatcher's backpressure gate is
    /// supposed to make this impossible; reaching it is a panic condition.
    #[error("failed to get planner buffer")]
    BufferUnavailable,

    /// The deferred-command ring is full.
    #[error("command queue full")]
    CommandQueueFull,

    /// Internal invariant violated; escalates to panic at the machine layer.
    #[error("planner internal error: {0}")]
    Internal(&'static str),
}
