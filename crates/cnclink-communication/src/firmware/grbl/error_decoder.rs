//! Grbl error and alarm code tables (Grbl 1.1).
//!
//! Numeric codes are decoded to human text before being forwarded to
//! clients; unknown codes and pre-1.1 textual messages pass through as-is.

/// Human description for a numeric `error:<n>` code
pub fn error_description(code: u8) -> Option<&'static str> {
    match code {
        1 => Some("Expected command letter"),
        2 => Some("Bad number format"),
        3 => Some("Invalid statement"),
        4 => Some("Value < 0"),
        5 => Some("Setting disabled"),
        6 => Some("Value < 3 usec"),
        7 => Some("EEPROM read fail. Using defaults"),
        8 => Some("Not idle"),
        9 => Some("G-code lock"),
        10 => Some("Homing not enabled"),
        11 => Some("Line overflow"),
        12 => Some("Step rate > 30kHz"),
        13 => Some("Check Door"),
        14 => Some("Line length exceeded"),
        15 => Some("Travel exceeded"),
        16 => Some("Invalid jog command"),
        17 => Some("Setting disabled (laser mode requires PWM)"),
        20 => Some("Unsupported command"),
        21 => Some("Modal group violation"),
        22 => Some("Undefined feed rate"),
        23 => Some("Invalid gcode ID:23"),
        24 => Some("Invalid gcode ID:24"),
        25 => Some("Invalid gcode ID:25"),
        26 => Some("Invalid gcode ID:26"),
        27 => Some("Invalid gcode ID:27"),
        28 => Some("Invalid gcode ID:28"),
        29 => Some("Invalid gcode ID:29"),
        30 => Some("Invalid gcode ID:30"),
        31 => Some("Invalid gcode ID:31"),
        32 => Some("Invalid gcode ID:32"),
        33 => Some("Invalid gcode ID:33"),
        34 => Some("Invalid gcode ID:34"),
        35 => Some("Invalid gcode ID:35"),
        36 => Some("Invalid gcode ID:36"),
        37 => Some("Invalid gcode ID:37"),
        38 => Some("Invalid gcode ID:38"),
        _ => None,
    }
}

/// Human description for a numeric `ALARM:<n>` code
pub fn alarm_description(code: u8) -> Option<&'static str> {
    match code {
        1 => Some("Hard limit triggered"),
        2 => Some("G-code motion target exceeds machine travel"),
        3 => Some("Reset while in motion"),
        4 => Some("Probe fail: not in expected initial state"),
        5 => Some("Probe fail: did not contact the workpiece"),
        6 => Some("Homing fail: reset during active cycle"),
        7 => Some("Homing fail: safety door opened"),
        8 => Some("Homing fail: pull off failed to clear limit switch"),
        9 => Some("Homing fail: could not find limit switch"),
        _ => None,
    }
}

/// Render an `error:` payload for clients: numeric codes gain their
/// description, textual messages (Grbl 0.9, Smoothieware) pass through.
pub fn format_error(raw: &str) -> String {
    match raw.parse::<u8>() {
        Ok(code) => match error_description(code) {
            Some(desc) => format!("{} ({})", raw, desc),
            None => raw.to_string(),
        },
        Err(_) => raw.to_string(),
    }
}

/// Render an `ALARM:` payload for clients, decoding numeric codes.
pub fn format_alarm(raw: &str) -> String {
    match raw.parse::<u8>() {
        Ok(code) => match alarm_description(code) {
            Some(desc) => format!("ALARM:{} ({})", raw, desc),
            None => format!("ALARM:{}", raw),
        },
        Err(_) => format!("ALARM:{}", raw),
    }
}
