//! TinyG2 command framing.
//!
//! Job lines are numbered `N<k> <line>`; ad-hoc feeder lines travel wrapped
//! as `{"gc":"<line>"}`. The sender-mode classifier decides how each job
//! line is gated against the planner queue: plain motion advances on
//! ack+queue-report, arcs wait for the planner to commit, and non-motion
//! codes force an explicit queue-report poll.

use serde_json::json;

/// How the next acknowledgement for a job line is gated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SenderMode {
    /// Single planner entry; advance on ack + queue report
    #[default]
    Run,
    /// No planner motion; an explicit `{"qr":null}` poll follows the line
    NoQr,
    /// Arc: multiple planner entries; wait for the queue report to show the
    /// arc committed before advancing
    Wait,
}

/// Per-run job line numberer.
#[derive(Debug, Default)]
pub struct LineNumberer {
    line_num: u32,
}

impl LineNumberer {
    /// A numberer starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Current line number (the last one issued)
    pub fn current(&self) -> u32 {
        self.line_num
    }

    /// Frame a job line with the next line number
    pub fn number(&mut self, line: &str) -> String {
        self.line_num += 1;
        format!("N{} {}", self.line_num, line)
    }

    /// Reset to zero at the start of a run
    pub fn reset(&mut self) {
        self.line_num = 0;
    }
}

/// Wrap an ad-hoc line for transmission: `{"gc":"<line>"}`
pub fn wrap_gcode(line: &str) -> String {
    json!({ "gc": line }).to_string()
}

/// A `{"key":null}` report request
pub fn query(key: &str) -> String {
    format!(r#"{{"{}":null}}"#, key)
}

/// Split a line into G-code words: a letter followed by its number.
/// Parenthesised comments and `;` trailers are skipped.
fn words(line: &str) -> Vec<(char, f64)> {
    let mut out = Vec::new();
    let mut chars = line.chars().peekable();
    let mut in_comment = false;

    while let Some(c) = chars.next() {
        match c {
            '(' => in_comment = true,
            ')' => in_comment = false,
            ';' if !in_comment => break,
            _ if in_comment => {}
            c if c.is_ascii_alphabetic() => {
                let mut number = String::new();
                while let Some(&n) = chars.peek() {
                    if n.is_ascii_digit() || n == '.' || n == '-' || n == '+' {
                        number.push(n);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if let Ok(value) = number.parse::<f64>() {
                    out.push((c.to_ascii_uppercase(), value));
                }
            }
            _ => {}
        }
    }
    out
}

/// Classify a job line for planner-queue gating.
///
/// Whole G-code words are tested, so parameter values never false-match
/// (`G1 X94.5` is Run, not NoQr). Arc offsets win over axis words because an
/// arc line carries both.
pub fn classify(line: &str) -> SenderMode {
    let words = words(line);

    if words.iter().any(|(letter, _)| matches!(letter, 'I' | 'J' | 'K')) {
        return SenderMode::Wait;
    }
    let dwell_or_curve = words.iter().any(|(letter, value)| {
        *letter == 'G' && matches!(value.trunc() as i64, 4 | 5 | 6 | 9) && *value < 10.0
    });
    if dwell_or_curve {
        return SenderMode::NoQr;
    }
    if words.iter().any(|(letter, _)| matches!(letter, 'X' | 'Y' | 'Z')) {
        return SenderMode::Run;
    }
    SenderMode::Run
}
