//! # Wire Protocol Layer
//!
//! Everything between raw transport bytes and the dispatcher: the line
//! buffer with its control/data classification and single-character command
//! extraction, the multi-channel policy, the relaxed-JSON command reader,
//! the status code table, and the response/report record builders.
//!
//! Two syntaxes coexist on the same newline-terminated stream: JSON objects
//! (lines starting with `{`) and G-code blocks. Single-character commands
//! (`!`, `~`, `%`, ^D, ^X, ENQ) are recognized at start-of-line without
//! needing a terminator.

pub mod json;
pub mod line;
pub mod response;
pub mod status;

pub use json::{parse_relaxed, JsonValue, NameValue};
pub use line::{ChannelManager, ChannelPolicy, LineBuffer, LineEvent, LineKind, ReadLimit};
pub use response::ResponseWriter;
pub use status::Status;

/// Maximum accepted input line length, bytes. Longer lines are truncated
/// and the remainder discarded via skip records.
pub const RX_LINE_LEN: usize = 512;

/// Per-channel receive ring capacity.
pub const RX_BUFFER_SIZE: usize = 4096;

/// Relaxed-JSON input limits.
pub const JSON_MAX_PAIRS: usize = 24;
pub const JSON_MAX_DEPTH: usize = 2;
