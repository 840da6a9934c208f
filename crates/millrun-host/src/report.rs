//! Status and queue reports.
//!
//! Status reports are either filtered (only values that moved more than
//! 1e-3 since the last report, with `stat` always present around program
//! stop/end) or verbose (everything, every time). Automatic reports are
//! throttled when the planner is time-tight: below the phat-city threshold
//! every Nth report is dropped on the floor.
//!
//! Queue reports fire on depth changes and are rate-limited while an arc is
//! generating, which would otherwise flood the wire with one report per
//! chord.

use serde_json::Value;
use std::collections::HashMap;
use tracing::trace;

use crate::config::MachineProfile;
use crate::machine::Machine;
use crate::tokens;

/// Drop every Nth automatic report when the planner is time-tight.
const SR_THROTTLE_N: u32 = 3;

/// Minimum interval between queue reports during arc generation, ms.
const MIN_ARC_QR_INTERVAL_MS: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SrRequest {
    Timed,
    TimedFull,
    Immediate,
    ImmediateFull,
}

/// Status report engine.
#[derive(Debug, Default)]
pub struct StatusReporter {
    /// 0 = off, 1 = filtered, 2 = verbose.
    pub verbosity: u8,
    pub interval_ms: u32,
    request: Option<SrRequest>,
    not_before_ms: u32,
    last_values: HashMap<String, Value>,
    throttle_counter: u32,
    fields: Vec<String>,
}

impl StatusReporter {
    pub fn new(profile: &MachineProfile) -> Self {
        Self {
            verbosity: profile.status_verbosity,
            interval_ms: profile.status_interval_ms,
            request: None,
            not_before_ms: 0,
            last_values: HashMap::new(),
            throttle_counter: 0,
            fields: [
                "line", "posx", "posy", "posz", "posa", "feed", "vel", "unit", "coor", "stat",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }

    pub fn request_timed(&mut self) {
        if self.request.is_none() {
            self.request = Some(SrRequest::Timed);
        }
    }

    pub fn request_timed_full(&mut self) {
        self.request = Some(SrRequest::TimedFull);
    }

    pub fn request_immediate(&mut self) {
        self.request = Some(SrRequest::Immediate);
    }

    pub fn request_immediate_full(&mut self) {
        self.request = Some(SrRequest::ImmediateFull);
    }

    /// Replace the reported field list (`{sr:{...}}` configuration).
    pub fn set_fields(&mut self, fields: Vec<String>) {
        self.fields = fields;
        self.last_values.clear();
    }

    fn populate(&mut self, machine: &Machine, full: bool) -> Option<String> {
        let (stat_code, _) = machine.stat();
        let mut out: Vec<(&str, Value)> = Vec::new();

        for field in &self.fields {
            let Ok(value) = tokens::get(machine, field) else {
                continue;
            };
            let changed = self.last_values.get(field) != Some(&value);
            // stat always goes out around program stop/end so hosts never
            // miss the final transition
            let force_stat = field == "stat" && (stat_code == 3 || stat_code == 4);
            if full || changed || force_stat {
                self.last_values.insert(field.clone(), value.clone());
                out.push((field.as_str(), value));
            }
        }
        if out.is_empty() {
            return None;
        }
        Some(machine.writer.status_report(&out))
    }

    /// The dispatcher's status report slot.
    fn run(&mut self, machine: &Machine, now_ms: u32) -> Option<String> {
        let request = self.request?;
        if self.verbosity == 0 {
            self.request = None;
            return None;
        }

        let timed = matches!(request, SrRequest::Timed | SrRequest::TimedFull);
        if timed {
            if now_ms < self.not_before_ms {
                return None; // leave the request pending
            }
            // Phat-city throttle: time-tight regions drop every Nth report.
            if !machine.planner.is_phat_city_time(&machine.signals) {
                self.throttle_counter += 1;
                if self.throttle_counter % SR_THROTTLE_N == 0 {
                    trace!("status report dropped by throttle");
                    self.request = None;
                    return None;
                }
            }
        }

        self.request = None;
        self.not_before_ms = now_ms + self.interval_ms;
        let full =
            matches!(request, SrRequest::TimedFull | SrRequest::ImmediateFull) || self.verbosity == 2;
        self.populate(machine, full)
    }
}

/// Run the status report callback against the machine.
pub fn sr_callback(machine: &mut Machine, now_ms: u32) {
    let mut sr = std::mem::take(&mut machine.sr);
    let out = sr.run(machine, now_ms);
    machine.sr = sr;
    if let Some(text) = out {
        machine.emit(text);
    }
}

/// Queue report engine.
#[derive(Debug, Default)]
pub struct QueueReporter {
    /// 0 = off, 1 = single (`qr`), 2 = triple (`qr`,`qi`,`qo`).
    pub verbosity: u8,
    last_arc_report_ms: u32,
    reported_added: u32,
    reported_removed: u32,
}

impl QueueReporter {
    pub fn new(profile: &MachineProfile) -> Self {
        Self {
            verbosity: profile.queue_verbosity,
            ..Default::default()
        }
    }

    fn run(&mut self, machine: &mut Machine, now_ms: u32) -> Option<String> {
        if self.verbosity == 0 || !machine.planner.queue.report_requested {
            return None;
        }
        if !machine
            .planner
            .is_phat_city_time(&machine.signals)
        {
            return None; // request stays pending until there's slack
        }
        // Arc generation changes depth every chord; cap the rate.
        if machine.arc.is_active() {
            if now_ms.wrapping_sub(self.last_arc_report_ms) < MIN_ARC_QR_INTERVAL_MS {
                return None;
            }
            self.last_arc_report_ms = now_ms;
        }
        machine.planner.queue.report_requested = false;

        let available = machine.planner.queue.available();
        let report = if self.verbosity >= 2 {
            let added = machine.planner.queue.buffers_added - self.reported_added;
            let removed = machine.planner.queue.buffers_removed - self.reported_removed;
            self.reported_added = machine.planner.queue.buffers_added;
            self.reported_removed = machine.planner.queue.buffers_removed;
            machine.writer.queue_report(available, Some((added, removed)))
        } else {
            machine.writer.queue_report(available, None)
        };
        Some(report)
    }
}

/// Run the queue report callback against the machine.
pub fn qr_callback(machine: &mut Machine, now_ms: u32) {
    let mut qr = std::mem::take(&mut machine.qr);
    let out = qr.run(machine, now_ms);
    machine.qr = qr;
    if let Some(text) = out {
        machine.emit(text);
    }
}
