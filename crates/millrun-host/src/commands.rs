//! Deferred JSON commands: the ring that lets a G-code stream sequence I/O
//! writes and waits with motion (M100/M101).
//!
//! The payload stays here; the planner queue carries only a token. When the
//! command block reaches the segment loader, the token surfaces and
//! [`execute_queued`] applies the payload through the same token registry
//! JSON input uses.

use proto::{parse_relaxed, JsonValue, Status};
use tracing::{debug, warn};

use crate::machine::Machine;
use crate::tokens;

/// Queued command slots. Counted against the dispatcher's data gate
/// alongside planner headroom.
pub const COMMAND_RING_SIZE: usize = 4;

#[derive(Debug, Clone)]
enum Payload {
    /// Apply the JSON mutations when reached.
    Command(String),
    /// Stall the queue until the predicate is true (or times out).
    Wait(String),
}

/// Pending wait predicate: name must read equal to the value.
#[derive(Debug, Clone)]
pub struct WaitCondition {
    pub name: String,
    pub value: f32,
    pub deadline_ms: u32,
}

/// The ring of deferred payloads plus the active wait, if any.
#[derive(Debug, Default)]
pub struct CommandRing {
    slots: Vec<(u32, Payload)>,
    next_token: u32,
    pub active_wait: Option<WaitCondition>,
}

/// Waits give up after this long.
pub const JSON_WAIT_TIMEOUT_MS: u32 = 30_000;

impl CommandRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn free_slots(&self) -> usize {
        COMMAND_RING_SIZE - self.slots.len()
    }

    fn push(&mut self, payload: Payload) -> Option<u32> {
        if self.slots.len() >= COMMAND_RING_SIZE {
            return None;
        }
        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);
        self.slots.push((token, payload));
        Some(token)
    }

    /// Queue an M100-style command body. Returns the block token.
    pub fn push_command(&mut self, json: &str) -> Option<u32> {
        self.push(Payload::Command(json.to_string()))
    }

    /// Queue an M101-style wait body.
    pub fn push_wait(&mut self, json: &str) -> Option<u32> {
        self.push(Payload::Wait(json.to_string()))
    }

    fn take(&mut self, token: u32) -> Option<Payload> {
        let idx = self.slots.iter().position(|(t, _)| *t == token)?;
        Some(self.slots.remove(idx).1)
    }
}

/// Run a queued command token surfaced by the segment loader.
pub fn execute_queued(machine: &mut Machine, token: u32) {
    let Some(payload) = machine.commands.take(token) else {
        warn!(token, "queued command token has no payload");
        return;
    };
    match payload {
        Payload::Command(json) => {
            debug!(%json, "executing queued JSON command");
            match parse_relaxed(&json) {
                Ok(pairs) => {
                    for pair in pairs {
                        let status = tokens::set(machine, &pair.name, &pair.value);
                        if status != Status::Ok {
                            let text = machine.writer.exception(status, &pair.name);
                            machine.emit(text);
                        }
                    }
                }
                Err(status) => {
                    let text = machine.writer.exception(status, &json);
                    machine.emit(text);
                }
            }
        }
        Payload::Wait(json) => match parse_relaxed(&json) {
            Ok(pairs) => {
                if let Some(pair) = pairs.first() {
                    let value = match pair.value {
                        JsonValue::Number(v) => v,
                        JsonValue::Bool(b) => b as u8 as f32,
                        _ => 0.0,
                    };
                    machine.commands.active_wait = Some(WaitCondition {
                        name: pair.name.clone(),
                        value,
                        deadline_ms: machine.now_ms.wrapping_add(JSON_WAIT_TIMEOUT_MS),
                    });
                }
            }
            Err(status) => {
                let text = machine.writer.exception(status, &json);
                machine.emit(text);
            }
        },
    }
}

/// Dispatcher callback: resolve an active wait. While one is active the
/// command dispatch data gate stays closed.
pub fn wait_callback(machine: &mut Machine, now_ms: u32) -> bool {
    let Some(wait) = machine.commands.active_wait.clone() else {
        return false;
    };
    let current = tokens::get_scalar(machine, &wait.name);
    let satisfied = current.is_some_and(|v| (v - wait.value).abs() < 1e-3);
    if satisfied || now_ms >= wait.deadline_ms {
        if !satisfied {
            let text = machine
                .writer
                .exception(Status::CommandNotAccepted, "json wait timed out");
            machine.emit(text);
        }
        machine.commands.active_wait = None;
        return false;
    }
    true
}
