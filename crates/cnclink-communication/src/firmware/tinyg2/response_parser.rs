//! TinyG2 response parser.
//!
//! TinyG2 speaks line-framed JSON with a handful of envelope shapes:
//! `{r:{...}, f:[...]}` command responses with a footer, `{sr:{...}}` status
//! reports, `{qr, qi, qo}` queue reports, and `{fb:...}`/`{hp:...}` identity
//! lines. The parser keeps a public machine-state snapshot with a revision
//! counter, mirroring the Grbl side.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Typed event decoded from one line of TinyG2 output.
#[derive(Debug, Clone, PartialEq)]
pub enum Tinyg2Event {
    /// `{r:{...}, f:[...]}` command acknowledgement
    Response {
        /// Line number `n` carried in the response body
        line_number: Option<u32>,
        /// Footer status code; 0 is success
        footer_status: Option<u16>,
        /// The raw line
        raw: String,
    },
    /// `{sr:{...}}` status report
    StatusReport {
        /// Line number the report refers to, when present
        line_number: Option<u32>,
        /// The raw line
        raw: String,
    },
    /// `{qr, qi, qo}` planner queue report
    QueueReport {
        /// Available planner slots
        qr: u32,
        /// Entries added since the last report
        qi: u32,
        /// Entries removed since the last report
        qo: u32,
    },
    /// `{fb:...}` firmware build
    FirmwareBuild(String),
    /// `{hp:...}` hardware platform
    HardwarePlatform(String),
    /// Anything else, JSON or not
    Other(String),
}

/// TinyG `stat` values mapped to readable machine states
fn stat_name(stat: u64) -> &'static str {
    match stat {
        0 => "Init",
        1 => "Ready",
        2 => "Alarm",
        3 => "Stop",
        4 => "End",
        5 => "Run",
        6 => "Hold",
        7 => "Probe",
        8 => "Cycle",
        9 => "Homing",
        _ => "Unknown",
    }
}

/// Public snapshot of the machine as last reported by the device.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Tinyg2MachineState {
    /// Readable machine state from the last `stat` field
    pub machine_state: String,
    /// Line number from the last status report
    pub line: Option<u32>,
    /// Raw status-report fields, keyed by name
    pub status: BTreeMap<String, Value>,
    /// Firmware build, when reported
    pub firmware_build: Option<String>,
    /// Hardware platform, when reported
    pub hardware_platform: Option<String>,
}

impl Tinyg2MachineState {
    /// Whether anything has been reported yet
    pub fn is_empty(&self) -> bool {
        self.machine_state.is_empty()
            && self.status.is_empty()
            && self.firmware_build.is_none()
            && self.hardware_platform.is_none()
    }
}

/// Stateful decoder for TinyG2 output lines.
#[derive(Debug, Default)]
pub struct Tinyg2Parser {
    state: Tinyg2MachineState,
    revision: u64,
}

impl Tinyg2Parser {
    /// A parser with an empty state snapshot
    pub fn new() -> Self {
        Self::default()
    }

    /// Current machine-state snapshot
    pub fn state(&self) -> &Tinyg2MachineState {
        &self.state
    }

    /// Monotonic revision, bumped whenever the snapshot changes
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Decode one line. Empty lines decode to `None`.
    pub fn parse(&mut self, line: &str) -> Option<Tinyg2Event> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let Ok(json) = serde_json::from_str::<Value>(line) else {
            return Some(Tinyg2Event::Other(line.to_string()));
        };
        let Some(obj) = json.as_object() else {
            return Some(Tinyg2Event::Other(line.to_string()));
        };

        if let Some(qr) = obj.get("qr").and_then(Value::as_u64) {
            let qi = obj.get("qi").and_then(Value::as_u64).unwrap_or(0);
            let qo = obj.get("qo").and_then(Value::as_u64).unwrap_or(0);
            return Some(Tinyg2Event::QueueReport {
                qr: qr as u32,
                qi: qi as u32,
                qo: qo as u32,
            });
        }

        if let Some(sr) = obj.get("sr") {
            let line_number = self.update_status(sr);
            return Some(Tinyg2Event::StatusReport {
                line_number,
                raw: line.to_string(),
            });
        }

        if let Some(r) = obj.get("r") {
            // A queried status report rides inside the response body.
            let mut line_number = r.get("n").and_then(Value::as_u64).map(|n| n as u32);
            if let Some(sr) = r.get("sr") {
                line_number = self.update_status(sr).or(line_number);
            }
            if let Some(fb) = r.get("fb") {
                self.update_firmware_build(fb);
            }
            if let Some(hp) = r.get("hp") {
                self.update_hardware_platform(hp);
            }
            let footer_status = obj
                .get("f")
                .and_then(Value::as_array)
                .and_then(|f| f.get(1))
                .and_then(Value::as_u64)
                .map(|s| s as u16);
            return Some(Tinyg2Event::Response {
                line_number,
                footer_status,
                raw: line.to_string(),
            });
        }

        if let Some(fb) = obj.get("fb") {
            self.update_firmware_build(fb);
            return Some(Tinyg2Event::FirmwareBuild(line.to_string()));
        }

        if let Some(hp) = obj.get("hp") {
            self.update_hardware_platform(hp);
            return Some(Tinyg2Event::HardwarePlatform(line.to_string()));
        }

        Some(Tinyg2Event::Other(line.to_string()))
    }

    /// Fold a status-report body into the snapshot; returns its line number.
    fn update_status(&mut self, sr: &Value) -> Option<u32> {
        let Some(fields) = sr.as_object() else {
            return None;
        };
        let mut changed = false;

        for (key, value) in fields {
            if self.state.status.get(key) != Some(value) {
                self.state.status.insert(key.clone(), value.clone());
                changed = true;
            }
        }

        if let Some(stat) = fields.get("stat").and_then(Value::as_u64) {
            let name = stat_name(stat);
            if self.state.machine_state != name {
                self.state.machine_state = name.to_string();
                changed = true;
            }
        }

        let line_number = fields
            .get("line")
            .or_else(|| fields.get("n"))
            .and_then(Value::as_u64)
            .map(|n| n as u32);
        if line_number.is_some() && self.state.line != line_number {
            self.state.line = line_number;
            changed = true;
        }

        if changed {
            self.revision += 1;
        }
        line_number
    }

    fn update_firmware_build(&mut self, fb: &Value) {
        let text = fb.to_string();
        if self.state.firmware_build.as_deref() != Some(text.as_str()) {
            self.state.firmware_build = Some(text);
            self.revision += 1;
        }
    }

    fn update_hardware_platform(&mut self, hp: &Value) {
        let text = hp.to_string();
        if self.state.hardware_platform.as_deref() != Some(text.as_str()) {
            self.state.hardware_platform = Some(text);
            self.revision += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_queue_report() {
        let mut parser = Tinyg2Parser::new();
        let event = parser.parse(r#"{"qr":28,"qi":1,"qo":2}"#).unwrap();
        assert_eq!(
            event,
            Tinyg2Event::QueueReport {
                qr: 28,
                qi: 1,
                qo: 2
            }
        );
    }

    #[test]
    fn parses_response_with_footer() {
        let mut parser = Tinyg2Parser::new();
        let event = parser.parse(r#"{"r":{"n":3},"f":[1,0,6]}"#).unwrap();
        match event {
            Tinyg2Event::Response {
                line_number,
                footer_status,
                ..
            } => {
                assert_eq!(line_number, Some(3));
                assert_eq!(footer_status, Some(0));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn status_report_updates_state() {
        let mut parser = Tinyg2Parser::new();
        let rev0 = parser.revision();
        let event = parser
            .parse(r#"{"sr":{"stat":5,"line":12,"posx":10.5}}"#)
            .unwrap();
        match event {
            Tinyg2Event::StatusReport { line_number, .. } => {
                assert_eq!(line_number, Some(12));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(parser.state().machine_state, "Run");
        assert_eq!(parser.state().line, Some(12));
        assert!(parser.revision() > rev0);

        // Same report again: no revision bump.
        let rev1 = parser.revision();
        parser.parse(r#"{"sr":{"stat":5,"line":12,"posx":10.5}}"#);
        assert_eq!(parser.revision(), rev1);
    }

    #[test]
    fn identity_lines_fill_snapshot() {
        let mut parser = Tinyg2Parser::new();
        assert!(matches!(
            parser.parse(r#"{"fb":100.26}"#),
            Some(Tinyg2Event::FirmwareBuild(_))
        ));
        assert!(matches!(
            parser.parse(r#"{"hp":3}"#),
            Some(Tinyg2Event::HardwarePlatform(_))
        ));
        assert!(!parser.state().is_empty());
    }

    #[test]
    fn non_json_is_other() {
        let mut parser = Tinyg2Parser::new();
        assert!(matches!(
            parser.parse("SYSTEM READY"),
            Some(Tinyg2Event::Other(_))
        ));
    }
}
