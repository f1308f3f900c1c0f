//! Grbl response parser.
//!
//! Stateful line decoder for the Grbl text protocol (status reports, error
//! and alarm messages, settings, feedback, the startup banner) plus the
//! Smoothieware `version` response used for runtime fingerprinting. The
//! parser keeps a public machine-state snapshot updated from status and
//! parser-state lines; a revision counter lets the controller publish state
//! only on change.

use serde::Serialize;
use std::collections::BTreeMap;

/// Typed event decoded from one line of Grbl output.
#[derive(Debug, Clone, PartialEq)]
pub enum GrblEvent {
    /// `ok` acknowledgment
    Ok,
    /// `error:<code-or-message>`
    Error(String),
    /// `ALARM:<code>`
    Alarm(String),
    /// `<...>` realtime status report (raw line)
    Status(String),
    /// `[GC:...]` parser state
    ParserState(String),
    /// `[G54:...]`-style offset/probe parameters
    Parameters(String),
    /// Other `[...]` feedback messages
    Feedback(String),
    /// `$n=value` settings output
    Settings(String),
    /// `Grbl <ver> [...]` startup banner
    Startup(String),
    /// Smoothieware response to the `version` probe
    SmoothieVersion(String),
    /// Anything the protocol does not recognise
    Other(String),
}

/// Public snapshot of the machine as last reported by the device.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct GrblMachineState {
    /// Device motion state (Idle, Run, Hold, Alarm, ...)
    pub active_state: String,
    /// Raw fields of the last status report, keyed by prefix (MPos, WPos,
    /// FS, Buf, WCO, ...)
    pub status: BTreeMap<String, String>,
    /// Last `[GC:...]` modal state, raw
    pub parser_state: Option<String>,
}

impl GrblMachineState {
    /// Whether anything has been reported yet
    pub fn is_empty(&self) -> bool {
        self.active_state.is_empty() && self.status.is_empty() && self.parser_state.is_none()
    }
}

/// Stateful decoder for Grbl output lines.
#[derive(Debug, Default)]
pub struct GrblParser {
    state: GrblMachineState,
    revision: u64,
}

impl GrblParser {
    /// A parser with an empty state snapshot
    pub fn new() -> Self {
        Self::default()
    }

    /// Current machine-state snapshot
    pub fn state(&self) -> &GrblMachineState {
        &self.state
    }

    /// Monotonic revision, bumped whenever the snapshot changes
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Decode one line. Empty lines decode to `None`.
    pub fn parse(&mut self, line: &str) -> Option<GrblEvent> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        if line == "ok" {
            return Some(GrblEvent::Ok);
        }

        if let Some(rest) = line.strip_prefix("error:") {
            return Some(GrblEvent::Error(rest.trim().to_string()));
        }

        if let Some(rest) = line.strip_prefix("ALARM:") {
            self.update_active_state("Alarm");
            return Some(GrblEvent::Alarm(rest.trim().to_string()));
        }

        if line.starts_with('<') && line.ends_with('>') {
            self.update_status(&line[1..line.len() - 1]);
            return Some(GrblEvent::Status(line.to_string()));
        }

        if line.starts_with('[') && line.ends_with(']') {
            let body = &line[1..line.len() - 1];
            if let Some(modal) = body.strip_prefix("GC:") {
                let modal = modal.to_string();
                if self.state.parser_state.as_deref() != Some(modal.as_str()) {
                    self.state.parser_state = Some(modal);
                    self.revision += 1;
                }
                return Some(GrblEvent::ParserState(line.to_string()));
            }
            if is_parameter_group(body) {
                return Some(GrblEvent::Parameters(line.to_string()));
            }
            return Some(GrblEvent::Feedback(line.to_string()));
        }

        if line.starts_with('$') && line.contains('=') {
            return Some(GrblEvent::Settings(line.to_string()));
        }

        if line.starts_with("Grbl ") {
            return Some(GrblEvent::Startup(line.to_string()));
        }

        if is_smoothie_version(line) {
            return Some(GrblEvent::SmoothieVersion(line.to_string()));
        }

        Some(GrblEvent::Other(line.to_string()))
    }

    fn update_active_state(&mut self, state: &str) {
        if self.state.active_state != state {
            self.state.active_state = state.to_string();
            self.revision += 1;
        }
    }

    /// Decode the body of a `<...>` status report. Grbl 1.1 separates fields
    /// with `|`; 0.9 used `,` between `Key:a,b,c` groups. Both forms yield
    /// the leading state token and the prefixed field map.
    fn update_status(&mut self, body: &str) {
        let mut parts = body.split('|');
        let head = parts.next().unwrap_or_default();
        let active = head.split(',').next().unwrap_or_default().trim();
        if !active.is_empty() {
            self.update_active_state(active);
        }

        let mut changed = false;
        for part in parts {
            if let Some((key, value)) = part.split_once(':') {
                let key = key.trim().to_string();
                let value = value.trim().to_string();
                if self.state.status.get(&key) != Some(&value) {
                    self.state.status.insert(key, value);
                    changed = true;
                }
            }
        }
        if changed {
            self.revision += 1;
        }
    }
}

/// Offset/probe parameter groups reported by `$#`
fn is_parameter_group(body: &str) -> bool {
    const GROUPS: &[&str] = &[
        "G54:", "G55:", "G56:", "G57:", "G58:", "G59:", "G28:", "G30:", "G92:", "TLO:", "PRB:",
    ];
    GROUPS.iter().any(|g| body.starts_with(g))
}

/// Smoothieware answers the `version` probe with a build line; Grbl ignores
/// the command entirely.
fn is_smoothie_version(line: &str) -> bool {
    line.starts_with("Build version:") || line.contains("Smoothie")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_acknowledgements() {
        let mut parser = GrblParser::new();
        assert_eq!(parser.parse("ok"), Some(GrblEvent::Ok));
        assert_eq!(
            parser.parse("error:20"),
            Some(GrblEvent::Error("20".to_string()))
        );
        assert_eq!(
            parser.parse("ALARM:1"),
            Some(GrblEvent::Alarm("1".to_string()))
        );
    }

    #[test]
    fn status_report_updates_state() {
        let mut parser = GrblParser::new();
        let rev0 = parser.revision();
        let event = parser.parse("<Run|MPos:1.000,2.000,0.000|FS:500,0>");
        assert!(matches!(event, Some(GrblEvent::Status(_))));
        assert_eq!(parser.state().active_state, "Run");
        assert_eq!(
            parser.state().status.get("MPos").map(String::as_str),
            Some("1.000,2.000,0.000")
        );
        assert!(parser.revision() > rev0);

        // Identical report: no revision bump.
        let rev1 = parser.revision();
        parser.parse("<Run|MPos:1.000,2.000,0.000|FS:500,0>");
        assert_eq!(parser.revision(), rev1);
    }

    #[test]
    fn legacy_status_state_token() {
        let mut parser = GrblParser::new();
        parser.parse("<Idle,MPos:0.000,0.000,0.000,WPos:0.000,0.000,0.000>");
        assert_eq!(parser.state().active_state, "Idle");
    }

    #[test]
    fn classifies_bracket_lines() {
        let mut parser = GrblParser::new();
        assert!(matches!(
            parser.parse("[GC:G0 G54 G17 G21 G90 G94 M5 M9 T0 F0 S0]"),
            Some(GrblEvent::ParserState(_))
        ));
        assert_eq!(
            parser.state().parser_state.as_deref(),
            Some("G0 G54 G17 G21 G90 G94 M5 M9 T0 F0 S0")
        );
        assert!(matches!(
            parser.parse("[G54:0.000,0.000,0.000]"),
            Some(GrblEvent::Parameters(_))
        ));
        assert!(matches!(
            parser.parse("[MSG:Caution: Unlocked]"),
            Some(GrblEvent::Feedback(_))
        ));
    }

    #[test]
    fn classifies_banner_settings_and_version() {
        let mut parser = GrblParser::new();
        assert!(matches!(
            parser.parse("Grbl 1.1f ['$' for help]"),
            Some(GrblEvent::Startup(_))
        ));
        assert!(matches!(
            parser.parse("$10=1"),
            Some(GrblEvent::Settings(_))
        ));
        assert!(matches!(
            parser.parse("Build version: edge-94de12c, Build date: Oct 28 2017"),
            Some(GrblEvent::SmoothieVersion(_))
        ));
        assert!(matches!(
            parser.parse("some diagnostic noise"),
            Some(GrblEvent::Other(_))
        ));
    }

    #[test]
    fn empty_lines_decode_to_none() {
        let mut parser = GrblParser::new();
        assert_eq!(parser.parse("   "), None);
    }
}
