//! Response and report record builders.
//!
//! Every command produces exactly one JSON response with an `f` footer
//! `[revision, status, bytes_consumed]`; `bytes_consumed` echoes the input
//! line length + 1 so a host can run exact windowed flow control.
//! Auto-emitted records (`sr`, `qr`, `prb`, `er`, …) have no footer.

use serde_json::{json, Map, Value};

use crate::status::Status;

/// Footer revision. Bump only with a wire format change.
pub const FOOTER_REVISION: u32 = 1;

/// Builds the one-line JSON records the firmware emits. Stateless except
/// for the firmware build number used in exception reports.
#[derive(Debug, Clone, Copy)]
pub struct ResponseWriter {
    pub firmware_build: f32,
}

impl ResponseWriter {
    pub fn new(firmware_build: f32) -> Self {
        Self { firmware_build }
    }

    /// `{"r":{…},"f":[rev,status,bytes]}` — the one response per command.
    pub fn response(&self, body: Value, status: Status, bytes_consumed: usize) -> String {
        let r = json!({
            "r": body,
            "f": [FOOTER_REVISION, status.code(), bytes_consumed],
        });
        r.to_string()
    }

    /// Response echoing a G-code block: `{"r":{"gc":"…"},"f":…}`.
    pub fn gcode_response(&self, block: &str, status: Status, bytes_consumed: usize) -> String {
        self.response(json!({ "gc": block }), status, bytes_consumed)
    }

    /// Exception report: `{"er":{"fb":…,"st":…,"msg":"…"}}`.
    pub fn exception(&self, status: Status, detail: &str) -> String {
        let msg = if detail.is_empty() {
            status.as_str().to_string()
        } else {
            format!("{} - {}", status.as_str(), detail)
        };
        json!({
            "er": {
                "fb": self.firmware_build,
                "st": status.code(),
                "msg": msg,
            }
        })
        .to_string()
    }

    /// Status report from pre-filtered key/value pairs.
    pub fn status_report(&self, fields: &[(&str, Value)]) -> String {
        let mut map = Map::new();
        for (k, v) in fields {
            map.insert((*k).to_string(), v.clone());
        }
        json!({ "sr": Value::Object(map) }).to_string()
    }

    /// Queue report. The triple form carries the added/removed counters.
    pub fn queue_report(&self, available: usize, in_out: Option<(u32, u32)>) -> String {
        match in_out {
            Some((added, removed)) => {
                json!({ "qr": available, "qi": added, "qo": removed }).to_string()
            }
            None => json!({ "qr": available }).to_string(),
        }
    }

    /// Probe report: `{"prb":{"e":1,"z":-2.347}}`. Axes carry final
    /// positions; `e` is 1 only if the probe tripped.
    pub fn probe_report(&self, tripped: bool, axes: &[(&str, f32)]) -> String {
        let mut map = Map::new();
        map.insert("e".into(), json!(if tripped { 1 } else { 0 }));
        for (name, value) in axes {
            map.insert((*name).to_string(), json!(value));
        }
        json!({ "prb": Value::Object(map) }).to_string()
    }

    /// `{"ack":true}` in response to ENQ.
    pub fn ack(&self) -> String {
        json!({ "ack": true }).to_string()
    }

    /// One-shot mute notices.
    pub fn muted(&self, muted: bool) -> String {
        json!({ "muted": muted }).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn footer_carries_status_and_bytes() {
        let w = ResponseWriter::new(101.3);
        let out = w.gcode_response("G0 X1", Status::Ok, 7);
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["r"]["gc"], "G0 X1");
        assert_eq!(v["f"][0], 1);
        assert_eq!(v["f"][1], 0);
        assert_eq!(v["f"][2], 7);
    }

    #[test]
    fn exception_message_format() {
        let w = ResponseWriter::new(101.3);
        let out = w.exception(Status::LimitSwitchHit, "X min");
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["er"]["st"], 24);
        assert_eq!(v["er"]["msg"], "Limit switch hit - X min");
    }

    #[test]
    fn probe_report_shape() {
        let w = ResponseWriter::new(101.3);
        let out = w.probe_report(false, &[("z", -3.5)]);
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["prb"]["e"], 0);
        assert_eq!(v["prb"]["z"], -3.5);
    }

    #[test]
    fn queue_report_forms() {
        let w = ResponseWriter::new(101.3);
        assert_eq!(w.queue_report(28, None), "{\"qr\":28}");
        let v: Value =
            serde_json::from_str(&w.queue_report(28, Some((40, 12)))).unwrap();
        assert_eq!(v["qi"], 40);
        assert_eq!(v["qo"], 12);
    }
}
