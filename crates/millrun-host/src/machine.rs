//! The machine hub: every context's state in one place, plus the priority
//! scheduler that stands in for the interrupt hardware.
//!
//! On a real board the four execution contexts are interrupt levels; here
//! [`Machine::tick`] drives them in strictly descending priority (DDA ->
//! loader -> exec -> forward plan -> dispatcher) against a virtual motor
//! interface, so every concurrency contract in the motion core is exercised
//! exactly as the ISRs would.

use gcode::CanonicalMachine;
use motion::state::{HoldState, HoldType, MotionSignals, MotionState};
use motion::{ArcGenerator, Axes, Kinematics, Planner, Runtime, AXES};
use proto::{ChannelManager, ResponseWriter, Status};
use std::collections::VecDeque;
use stepper::prep::PrepOwner;
use stepper::{MotorPins, Stepper};
use tracing::{error, info, warn};

use crate::commands::CommandRing;
use crate::config::MachineProfile;
use crate::cycle::{feedhold, home::HomingCycle, jog::JogCycle, probe::ProbeCycle};
use crate::inputs::Inputs;
use crate::report::{QueueReporter, StatusReporter};

/// Top-level machine state, reported as `stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Initializing,
    Ready,
    Alarm,
    ProgramStop,
    ProgramEnd,
    Cycle,
    Shutdown,
    Panic,
}

/// Active cycle kind; refines `stat` while in cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CycleType {
    #[default]
    None,
    Machining,
    Probe,
    Homing,
    Jog,
}

/// Build identity, queryable as JSON leaves.
#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub firmware_version: f32,
    pub firmware_build: f32,
    pub firmware_build_string: String,
    pub hardware_platform: u8,
    pub hardware_version: u8,
    pub id: String,
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self {
            firmware_version: 0.99,
            firmware_build: 101.03,
            firmware_build_string: "101.03-millrun".into(),
            hardware_platform: 3,
            hardware_version: 0,
            id: "0x1".into(),
        }
    }
}

/// Pending single-char and cycle requests, set from any context, drained at
/// dispatcher priority.
#[derive(Debug, Default)]
pub struct CycleRequests {
    pub feedhold: Option<HoldType>,
    pub end_hold: bool,
    pub queue_flush: bool,
    pub kill_job: bool,
}

/// An output line waiting for a transport. `channel: None` broadcasts.
#[derive(Debug, Clone)]
pub struct OutLine {
    pub channel: Option<usize>,
    pub text: String,
}

/// Discards all pin activity; step accounting happens in the encoders.
#[derive(Debug, Default)]
pub struct NullPins;

impl MotorPins for NullPins {
    fn step_start(&mut self, _motor: usize) {}
    fn step_end(&mut self, _motor: usize) {}
    fn set_direction(&mut self, _motor: usize, _reverse: bool) {}
    fn enable(&mut self, _motor: usize) {}
    fn disable(&mut self, _motor: usize) {}
}

pub struct Machine {
    pub planner: Planner,
    pub runtime: Runtime,
    pub stepper: Stepper,
    pub signals: MotionSignals,
    pub canon: CanonicalMachine,
    pub kin: Box<dyn Kinematics>,
    pub pins: Box<dyn MotorPins + Send>,
    pub arc: ArcGenerator,
    pub channels: ChannelManager,
    pub writer: ResponseWriter,
    pub inputs: Inputs,
    pub commands: CommandRing,

    pub state: MachineState,
    pub cycle_type: CycleType,
    pub requests: CycleRequests,
    program_end_pending: bool,

    pub probe: ProbeCycle,
    pub homing: HomingCycle,
    pub jog: JogCycle,

    pub sr: StatusReporter,
    pub qr: QueueReporter,
    pub build: BuildInfo,
    pub profile: MachineProfile,

    out_queue: VecDeque<OutLine>,
    pub now_ms: u32,
    /// Last time the machine was moving; drives motor power timeouts.
    pub last_motion_ms: u32,
    /// LED blink bookkeeping (rate depends on alarm level).
    led_timer_ms: u32,
    pub led_on: bool,
    panic_latched: bool,
}

impl Machine {
    pub fn new(profile: MachineProfile) -> Self {
        let planner = Planner::new(profile.planner_config());
        let stepper = Stepper::new(profile.stepper_configs());
        let kin = profile.kinematics();
        let build = BuildInfo::default();
        Self {
            planner,
            runtime: Runtime::new(),
            stepper,
            signals: MotionSignals::default(),
            canon: CanonicalMachine::new(),
            kin,
            pins: Box::new(NullPins),
            arc: ArcGenerator::new(),
            channels: ChannelManager::new(),
            writer: ResponseWriter::new(build.firmware_build),
            inputs: Inputs::new(),
            commands: CommandRing::new(),
            state: MachineState::Initializing,
            cycle_type: CycleType::None,
            requests: CycleRequests::default(),
            program_end_pending: false,
            probe: ProbeCycle::default(),
            homing: HomingCycle::default(),
            jog: JogCycle::default(),
            sr: StatusReporter::new(&profile),
            qr: QueueReporter::new(&profile),
            build,
            profile,
            out_queue: VecDeque::new(),
            now_ms: 0,
            last_motion_ms: 0,
            led_timer_ms: 0,
            led_on: false,
            panic_latched: false,
        }
    }

    /// Current `stat` value: (code, name).
    pub fn stat(&self) -> (u8, &'static str) {
        if self.panic_latched {
            return (13, "panic");
        }
        match self.state {
            MachineState::Shutdown => (12, "shutdown"),
            MachineState::Alarm => (2, "alarm"),
            _ if self.signals.hold_state != HoldState::Off => (6, "hold"),
            _ => match self.cycle_type {
                CycleType::Probe => (7, "probe"),
                CycleType::Homing => (9, "homing"),
                CycleType::Jog => (10, "jog"),
                CycleType::Machining => {
                    if self.signals.motion_state == MotionState::Run {
                        (5, "run")
                    } else {
                        (8, "cycle")
                    }
                }
                CycleType::None => match self.state {
                    MachineState::Initializing => (0, "initializing"),
                    MachineState::Ready => (1, "ready"),
                    MachineState::ProgramStop => (3, "program-stop"),
                    MachineState::ProgramEnd => (4, "program-end"),
                    _ => (1, "ready"),
                },
            },
        }
    }

    /// Queue an output line. Responses to muted channels are suppressed.
    pub fn emit_to(&mut self, channel: Option<usize>, text: String) {
        if let Some(ch) = channel {
            if self.channels.is_muted(ch) {
                return;
            }
        }
        self.out_queue.push_back(OutLine { channel, text });
    }

    pub fn emit(&mut self, text: String) {
        self.out_queue.push_back(OutLine {
            channel: None,
            text,
        });
    }

    /// Queue a line bypassing mute suppression; the mute notices themselves
    /// must reach the muted channel.
    pub fn emit_unsuppressed(&mut self, channel: usize, text: String) {
        self.out_queue.push_back(OutLine {
            channel: Some(channel),
            text,
        });
    }

    pub fn drain_output(&mut self) -> Vec<OutLine> {
        self.out_queue.drain(..).collect()
    }

    // ---- cycle management -------------------------------------------------

    /// Auto-start a machining cycle once moves are committed.
    pub fn ensure_cycle(&mut self, cycle: CycleType) {
        if self.cycle_type == CycleType::None && self.can_move() {
            self.cycle_type = cycle;
            self.state = MachineState::Cycle;
            self.signals.in_cycle = true;
            self.stepper.set_motion_running(true);
            self.stepper.request_forward_plan();
        }
    }

    /// End the cycle when the planner has drained.
    pub fn cycle_end(&mut self) {
        if !self.signals.cycle_end_pending {
            return;
        }
        self.signals.cycle_end_pending = false;
        if self.planner.queue.has_runnable() || self.stepper.runtime_is_busy() {
            return; // spurious; more work arrived
        }
        self.signals.in_cycle = false;
        self.signals.motion_state = MotionState::Stop;
        self.stepper.set_motion_running(false);
        self.cycle_type = CycleType::None;
        if self.state == MachineState::Cycle {
            self.state = if self.program_end_pending {
                self.program_end_pending = false;
                MachineState::ProgramEnd
            } else {
                MachineState::ProgramStop
            };
        }
        // planner and runtime positions re-synchronize at idle
        self.planner.position = self.runtime.position;
        self.canon.set_position(&self.runtime.position);
        self.sr.request_immediate();
        info!(stat = self.stat().1, "cycle end");
    }

    pub fn note_program_end(&mut self) {
        self.program_end_pending = true;
    }

    pub fn can_move(&self) -> bool {
        !matches!(
            self.state,
            MachineState::Alarm | MachineState::Shutdown | MachineState::Panic
        ) && !self.panic_latched
    }

    // ---- alarm ladder -----------------------------------------------------

    /// Alarm: stop motion, flush the planner, preserve coordinate state,
    /// require an explicit clear.
    pub fn alarm(&mut self, status: Status, detail: &str) {
        warn!(?status, detail, "ALARM");
        let text = self.writer.exception(status, detail);
        self.emit(text);
        self.halt_motion();
        self.state = MachineState::Alarm;
        self.sr.request_immediate();
    }

    /// Shutdown: alarm plus motor power removed; requires reset.
    pub fn shutdown(&mut self, status: Status, detail: &str) {
        error!(?status, detail, "SHUTDOWN");
        let text = self.writer.exception(status, detail);
        self.emit(text);
        self.halt_motion();
        self.stepper.deenergize_all(&mut *self.pins);
        self.state = MachineState::Shutdown;
        self.sr.request_immediate();
    }

    /// Panic: shutdown plus refusal of all further motion until hard
    /// reset. The wire stays alive to report the condition.
    pub fn panic_now(&mut self, status: Status, detail: &str) {
        error!(?status, detail, "PANIC");
        let text = self.writer.exception(status, detail);
        self.emit(text);
        self.halt_motion();
        self.stepper.deenergize_all(&mut *self.pins);
        self.state = MachineState::Panic;
        self.panic_latched = true;
        self.sr.request_immediate();
    }

    /// Clear an alarm ({clear:n} / $clear). Shutdown and panic refuse.
    pub fn clear_alarm(&mut self) -> Status {
        if self.panic_latched || self.state == MachineState::Shutdown {
            return Status::CommandNotAccepted;
        }
        if self.state == MachineState::Alarm {
            self.state = MachineState::ProgramStop;
        }
        Status::Ok
    }

    fn halt_motion(&mut self) {
        self.arc.abort();
        self.stepper.reset();
        self.runtime.sync_planner_to_runtime(&mut self.planner);
        let position = self.runtime.position;
        self.planner.flush(&position);
        self.signals.in_cycle = false;
        self.signals.hold_state = HoldState::Off;
        self.signals.motion_state = MotionState::Stop;
        self.signals.cycle_end_pending = false;
        self.cycle_type = CycleType::None;
        self.probe.abort();
        self.homing.abort();
        self.jog.abort();
    }

    /// Hard reset (^X): everything short of power cycling.
    pub fn hard_reset(&mut self) {
        info!("hard reset");
        self.halt_motion();
        self.panic_latched = false;
        self.state = MachineState::Ready;
        let zero: Axes = [0.0; AXES];
        self.runtime.set_position(&*self.kin, &zero);
        let zero_steps = self.kin.inverse(&zero);
        for motor in 0..stepper::MOTORS {
            self.stepper.encoders.set_position(motor, zero_steps[motor]);
        }
        self.planner.flush(&zero);
        self.canon = CanonicalMachine::new();
        self.sr.request_immediate_full();
    }

    // ---- request entry points (safe from any context) ---------------------

    pub fn request_feedhold(&mut self, hold_type: HoldType) {
        self.requests.feedhold = Some(hold_type);
    }

    pub fn request_end_hold(&mut self) {
        self.requests.end_hold = true;
    }

    pub fn request_queue_flush(&mut self) {
        self.requests.queue_flush = true;
    }

    /// Digital input change, ISR side: snapshots the encoders into the
    /// edge ring. Everything else happens at dispatcher priority.
    pub fn set_input(&mut self, input: usize, level: bool) {
        let snapshot = self.stepper.encoders.snapshot();
        self.inputs.set(input, level, self.now_ms, snapshot);
    }

    // ---- the scheduler ----------------------------------------------------

    /// Advance the machine: `dda_ticks` timer periods at DDA priority, then
    /// drain the software-interrupt requests, then one dispatcher pass.
    pub fn tick(&mut self, now_ms: u32, dda_ticks: u32) {
        self.now_ms = now_ms;

        for _ in 0..dda_ticks {
            self.stepper.dda_tick(&mut *self.pins);
            self.stepper.dwell_tick(1, &mut *self.pins);
        }
        self.service_interrupts();
        crate::controller::controller_pass(self, now_ms);
        self.service_interrupts();
    }

    /// Drain loader/exec/forward-plan requests in priority order. Bounded:
    /// the chain converges once the prep buffer is staged and the queue has
    /// nothing plannable.
    pub fn service_interrupts(&mut self) {
        for _ in 0..64 {
            // loader (DDA priority when chained; idle entry here)
            self.stepper.request_load(&mut *self.pins);
            if let Some(token) = self.stepper.take_pending_command() {
                crate::commands::execute_queued(self, token);
                continue;
            }

            // exec priority: only when it owns the prep buffer
            if self.stepper.take_exec_request() {
                if self.stepper.prep.owner() == PrepOwner::Exec {
                    let status = self.runtime.exec_move(
                        &mut self.planner,
                        &mut self.stepper,
                        &*self.kin,
                        &mut self.signals,
                    );
                    if status == motion::ExecStatus::Failed {
                        self.panic_now(Status::InternalError, "exec segment prep failed");
                    }
                    if status != motion::ExecStatus::Noop {
                        self.stepper.request_load(&mut *self.pins);
                    }
                }
                continue;
            }

            // forward-plan priority
            if self.stepper.take_forward_plan_request() {
                if self.runtime.forward_plan(&mut self.planner) == motion::ExecStatus::Ok {
                    self.stepper.request_exec();
                }
                continue;
            }
            break;
        }

        // feedhold request can be serviced between segments
        feedhold::sequencing_callback(self);
        self.cycle_end();
    }

    /// Drop power on idle-timeout motors. Called once the idle timer
    /// expires; motors re-energize at the next segment load.
    pub fn motor_power_timeout(&mut self) {
        use stepper::PowerMode;
        for motor in 0..stepper::MOTORS {
            if self.stepper.config[motor].power_mode == PowerMode::InCycle {
                // loader-side state tracks energization; disabling an idle
                // motor twice is harmless
                self.pins.disable(motor);
            }
        }
    }

    /// LED blink rates per machine state; the indicator callback.
    pub fn led_callback(&mut self, now_ms: u32) {
        let rate = match self.state {
            MachineState::Alarm => 300,
            MachineState::Shutdown => 150,
            MachineState::Panic => 75,
            _ => 1000,
        };
        if now_ms >= self.led_timer_ms {
            self.led_timer_ms = now_ms + rate;
            self.led_on = !self.led_on;
        }
    }
}
