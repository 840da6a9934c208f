//! # Simulation harness
//!
//! Drives a complete [`Machine`] -- dispatcher, planner, executor, DDA --
//! under a simulated clock, with recording motor pins and scriptable
//! inputs. Every end-to-end property of the firmware is testable here
//! without hardware: feed a wire stream in, observe step pulses, reports
//! and state out.

use millrun_host::config::MachineProfile;
use millrun_host::machine::Machine;
use parking_lot::Mutex;
use proto::ChannelPolicy;
use std::sync::Arc;
use stepper::MotorPins;

/// DDA ticks per simulated millisecond (200 kHz).
pub const TICKS_PER_MS: u32 = 200;

/// Install a compact tracing subscriber for test debugging. Safe to call
/// from every test; only the first call wins.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

/// One recorded step pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pulse {
    pub at_ms: u32,
    pub motor: usize,
}

/// Shared pulse log filled by the recording pins.
#[derive(Debug, Default)]
pub struct PulseLog {
    pub pulses: Vec<Pulse>,
    pub direction_changes: Vec<(u32, usize, bool)>,
    pub now_ms: u32,
}

impl PulseLog {
    /// Step rate over a window, pulses per ms.
    pub fn rate_between(&self, from_ms: u32, to_ms: u32) -> f32 {
        let count = self
            .pulses
            .iter()
            .filter(|p| p.at_ms >= from_ms && p.at_ms < to_ms)
            .count();
        count as f32 / (to_ms - from_ms).max(1) as f32
    }

    pub fn last_pulse_ms(&self) -> Option<u32> {
        self.pulses.last().map(|p| p.at_ms)
    }
}

/// Motor pins that record everything.
pub struct RecordingPins {
    log: Arc<Mutex<PulseLog>>,
}

impl MotorPins for RecordingPins {
    fn step_start(&mut self, motor: usize) {
        let mut log = self.log.lock();
        let at_ms = log.now_ms;
        log.pulses.push(Pulse { at_ms, motor });
    }
    fn step_end(&mut self, _motor: usize) {}
    fn set_direction(&mut self, motor: usize, reverse: bool) {
        let mut log = self.log.lock();
        let at_ms = log.now_ms;
        log.direction_changes.push((at_ms, motor, reverse));
    }
    fn enable(&mut self, _motor: usize) {}
    fn disable(&mut self, _motor: usize) {}
}

/// The harness: a machine, a wire channel, a clock and the pulse log.
pub struct SimMachine {
    pub machine: Machine,
    pub channel: usize,
    pub now_ms: u32,
    pub log: Arc<Mutex<PulseLog>>,
    pub output: Vec<String>,
}

impl Default for SimMachine {
    fn default() -> Self {
        Self::new(MachineProfile::default())
    }
}

impl SimMachine {
    pub fn new(profile: MachineProfile) -> Self {
        let mut machine = Machine::new(profile);
        let channel = machine.channels.add_channel(ChannelPolicy {
            always_both: true,
            mute_as_secondary: false,
        });
        let log = Arc::new(Mutex::new(PulseLog::default()));
        machine.pins = Box::new(RecordingPins { log: log.clone() });
        let mut sim = Self {
            machine,
            channel,
            now_ms: 0,
            log,
            output: Vec::new(),
        };
        sim.run_ms(2); // let the banner and ready transition happen
        sim.output.clear();
        sim
    }

    /// Feed a wire line (terminator appended).
    pub fn send(&mut self, line: &str) {
        let mut bytes = line.as_bytes().to_vec();
        bytes.push(b'\n');
        self.machine.channels.feed(self.channel, &bytes);
    }

    /// Feed raw bytes with no terminator (single-char commands).
    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.machine.channels.feed(self.channel, bytes);
    }

    /// Advance simulated time.
    pub fn run_ms(&mut self, ms: u32) {
        for _ in 0..ms {
            self.now_ms += 1;
            self.log.lock().now_ms = self.now_ms;
            self.machine.tick(self.now_ms, TICKS_PER_MS);
            for out in self.machine.drain_output() {
                self.output.push(out.text);
            }
        }
    }

    /// Run until motion and queues drain, with a time limit.
    pub fn run_until_idle(&mut self, limit_ms: u32) {
        let deadline = self.now_ms + limit_ms;
        while self.now_ms < deadline {
            self.run_ms(5);
            if !self.machine.planner.queue.has_runnable()
                && !self.machine.stepper.runtime_is_busy()
                && !self.machine.arc.is_active()
                && !self.machine.signals.in_cycle
                && !self.machine.probe.is_active()
                && !self.machine.homing.is_active()
            {
                // a few more passes to flush reports
                self.run_ms(5);
                return;
            }
        }
        panic!("machine did not go idle within {limit_ms} ms");
    }

    /// Change a digital input level (ISR-side path: snapshots encoders).
    pub fn set_input(&mut self, input: usize, level: bool) {
        self.machine.set_input(input, level);
    }

    pub fn position(&self, axis: usize) -> f32 {
        self.machine.runtime.position[axis]
    }

    /// Last reported `stat` name.
    pub fn stat(&self) -> &'static str {
        self.machine.stat().1
    }

    /// All output lines seen so far that contain the fragment.
    pub fn outputs_containing(&self, fragment: &str) -> Vec<&String> {
        self.output.iter().filter(|o| o.contains(fragment)).collect()
    }

    /// Parse the footer status of the most recent response line.
    pub fn last_response_status(&self) -> Option<i64> {
        for line in self.output.iter().rev() {
            if let Ok(v) = serde_json::from_str::<serde_json::Value>(line) {
                if let Some(f) = v.get("f") {
                    return f.get(1).and_then(|s| s.as_i64());
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn harness_boots_ready() {
        let sim = SimMachine::default();
        assert_eq!(sim.stat(), "ready");
    }

    #[test]
    fn simple_move_steps_and_stops() {
        let mut sim = SimMachine::default();
        sim.send("G1 X5 F3000");
        sim.run_until_idle(20_000);
        assert!((sim.position(0) - 5.0).abs() < 0.01);
        assert!(!sim.log.lock().pulses.is_empty());
        assert_eq!(sim.stat(), "program-stop");
    }
}
