//! Sender: pacing engines for a loaded G-code job.
//!
//! Two streaming protocols are implemented over the same loaded-program
//! bookkeeping:
//!
//! - [`CharCountingSender`] keeps a sliding window of bytes resident in the
//!   device's receive buffer (Grbl family). Lines are emitted as long as
//!   `len + 1` fits the remaining window; each `ok`/`error` releases the
//!   oldest in-flight line's bytes.
//! - [`SendResponseSender`] emits one line at a time and waits for its
//!   acknowledgement (TinyG2); the controller layers planner-queue gating on
//!   top.
//!
//! Empty lines are kept in the line indexing but never written to the
//! device; they complete implicitly once everything ahead of them has been
//! acknowledged.

use cnclink_core::{CommandError, Result, SenderStatusReport};
use std::collections::VecDeque;
use std::time::Instant;

/// A loaded program: named blob tokenized into executable lines.
#[derive(Debug, Clone)]
struct Program {
    name: String,
    size: usize,
    lines: Vec<String>,
}

/// Split a blob into lines with trailing whitespace discarded.
fn tokenize(gcode: &str) -> Vec<String> {
    gcode.lines().map(|l| l.trim_end().to_string()).collect()
}

/// Character-counting streamer (Grbl family).
#[derive(Debug)]
pub struct CharCountingSender {
    program: Option<Program>,
    buffer_size: usize,
    sent: usize,
    received: usize,
    bytes_in_flight: usize,
    /// Indices of emitted-but-unacknowledged lines, oldest first
    in_flight: VecDeque<usize>,
    started_at: Option<Instant>,
    last_reported: Option<(usize, usize, usize)>,
}

impl CharCountingSender {
    /// A sender with the given receive-buffer budget
    pub fn new(buffer_size: usize) -> Self {
        Self {
            program: None,
            buffer_size,
            sent: 0,
            received: 0,
            bytes_in_flight: 0,
            in_flight: VecDeque::new(),
            started_at: None,
            last_reported: None,
        }
    }

    /// Load a program, replacing any previous one. Fails on an empty blob
    /// and leaves the previous program untouched in that case.
    pub fn load(&mut self, name: impl Into<String>, gcode: &str) -> Result<()> {
        let name = name.into();
        if gcode.trim().is_empty() {
            return Err(CommandError::EmptyProgram { name }.into());
        }
        self.program = Some(Program {
            name,
            size: gcode.len(),
            lines: tokenize(gcode),
        });
        self.rewind();
        Ok(())
    }

    /// Discard the loaded program and all progress
    pub fn unload(&mut self) {
        self.program = None;
        self.rewind();
    }

    /// Reset progress to the top of the program without discarding it
    pub fn rewind(&mut self) {
        self.sent = 0;
        self.received = 0;
        self.bytes_in_flight = 0;
        self.in_flight.clear();
        self.started_at = None;
    }

    /// Total executable lines in the loaded program
    pub fn total(&self) -> usize {
        self.program.as_ref().map_or(0, |p| p.lines.len())
    }

    /// Lines acknowledged so far
    pub fn received(&self) -> usize {
        self.received
    }

    /// Lines handed to the device so far
    pub fn sent(&self) -> usize {
        self.sent
    }

    /// Bytes currently resident in the device buffer (newlines included)
    pub fn bytes_in_flight(&self) -> usize {
        self.bytes_in_flight
    }

    /// Whether every line of the loaded program has been acknowledged
    pub fn is_complete(&self) -> bool {
        self.program.is_some() && self.received == self.total()
    }

    /// The oldest unacknowledged line, for error reporting
    pub fn oldest_in_flight(&self) -> Option<&str> {
        let program = self.program.as_ref()?;
        let idx = *self.in_flight.front()?;
        program.lines.get(idx).map(|s| s.as_str())
    }

    /// Emit every next line that fits the window.
    ///
    /// Returns the emitted lines in order; the controller writes each with a
    /// terminating newline. Stops when the next line does not fit or the
    /// program is exhausted.
    pub fn next(&mut self) -> Vec<String> {
        if self.program.is_none() {
            return Vec::new();
        }
        let total = self.program.as_ref().unwrap().lines.len();
        let mut emitted = Vec::new();

        while self.sent < total {
            let is_empty = self.program.as_ref().unwrap().lines[self.sent].is_empty();
            if is_empty {
                self.sent += 1;
                self.settle_received();
                continue;
            }
            let line = self.program.as_ref().unwrap().lines[self.sent].clone();
            let cost = line.len() + 1;
            if self.bytes_in_flight + cost > self.buffer_size {
                break;
            }
            emitted.push(line);
            self.in_flight.push_back(self.sent);
            self.bytes_in_flight += cost;
            self.sent += 1;
        }

        if !emitted.is_empty() && self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
        emitted
    }

    /// Complete the oldest in-flight line (`ok` or `error` received).
    ///
    /// Must be followed by [`CharCountingSender::next`] to refill the
    /// window. A spurious acknowledgement with nothing in flight is dropped.
    pub fn ack(&mut self) {
        let Some(program) = self.program.as_ref() else {
            return;
        };
        let Some(idx) = self.in_flight.pop_front() else {
            tracing::debug!("Dropping acknowledgement with no line in flight");
            return;
        };
        self.bytes_in_flight = self
            .bytes_in_flight
            .saturating_sub(program.lines[idx].len() + 1);
        self.received = idx + 1;
        self.settle_received();
    }

    /// Advance `received` past lines that were never emitted (empties) up to
    /// the next line still awaiting acknowledgement.
    fn settle_received(&mut self) {
        while self.received < self.sent && self.in_flight.front() != Some(&self.received) {
            self.received += 1;
        }
    }

    /// Current job snapshot
    pub fn status(&self) -> SenderStatusReport {
        SenderStatusReport {
            name: self
                .program
                .as_ref()
                .map(|p| p.name.clone())
                .unwrap_or_default(),
            size: self.program.as_ref().map_or(0, |p| p.size),
            total: self.total(),
            sent: self.sent,
            received: self.received,
            elapsed_secs: self.started_at.map(|t| t.elapsed().as_secs()),
        }
    }

    /// Whether progress counters moved since the last observation
    pub fn status_changed(&mut self) -> bool {
        let current = (self.total(), self.sent, self.received);
        let changed = self.last_reported != Some(current);
        self.last_reported = Some(current);
        changed
    }
}

/// Send/response streamer (TinyG2): at most one line in flight.
#[derive(Debug)]
pub struct SendResponseSender {
    program: Option<Program>,
    sent: usize,
    received: usize,
    started_at: Option<Instant>,
    last_reported: Option<(usize, usize, usize)>,
}

impl SendResponseSender {
    /// An empty sender
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            program: None,
            sent: 0,
            received: 0,
            started_at: None,
            last_reported: None,
        }
    }

    /// Load a program, replacing any previous one
    pub fn load(&mut self, name: impl Into<String>, gcode: &str) -> Result<()> {
        let name = name.into();
        if gcode.trim().is_empty() {
            return Err(CommandError::EmptyProgram { name }.into());
        }
        self.program = Some(Program {
            name,
            size: gcode.len(),
            lines: tokenize(gcode),
        });
        self.rewind();
        Ok(())
    }

    /// Discard the loaded program and all progress
    pub fn unload(&mut self) {
        self.program = None;
        self.rewind();
    }

    /// Reset progress to the top of the program without discarding it
    pub fn rewind(&mut self) {
        self.sent = 0;
        self.received = 0;
        self.started_at = None;
    }

    /// Total executable lines in the loaded program
    pub fn total(&self) -> usize {
        self.program.as_ref().map_or(0, |p| p.lines.len())
    }

    /// Lines acknowledged so far
    pub fn received(&self) -> usize {
        self.received
    }

    /// Lines handed to the device so far
    pub fn sent(&self) -> usize {
        self.sent
    }

    /// Whether every line of the loaded program has been acknowledged
    pub fn is_complete(&self) -> bool {
        self.program.is_some() && self.received == self.total()
    }

    /// The line currently awaiting acknowledgement
    pub fn in_flight(&self) -> Option<&str> {
        if self.sent == self.received {
            return None;
        }
        self.program
            .as_ref()
            .and_then(|p| p.lines.get(self.sent - 1))
            .map(|s| s.as_str())
    }

    /// Emit the next line if none is in flight.
    ///
    /// Empty lines complete implicitly and the scan continues to the next
    /// executable line.
    pub fn next(&mut self) -> Option<String> {
        if self.sent != self.received {
            return None;
        }
        let program = self.program.as_ref()?;
        let total = program.lines.len();

        while self.sent < total {
            let line = &program.lines[self.sent];
            if line.is_empty() {
                self.sent += 1;
                self.received += 1;
                continue;
            }
            self.sent += 1;
            if self.started_at.is_none() {
                self.started_at = Some(Instant::now());
            }
            return Some(line.clone());
        }
        None
    }

    /// Complete the in-flight line. A spurious acknowledgement is dropped.
    pub fn ack(&mut self) {
        if self.sent == self.received {
            tracing::debug!("Dropping acknowledgement with no line in flight");
            return;
        }
        self.received += 1;
    }

    /// Current job snapshot
    pub fn status(&self) -> SenderStatusReport {
        SenderStatusReport {
            name: self
                .program
                .as_ref()
                .map(|p| p.name.clone())
                .unwrap_or_default(),
            size: self.program.as_ref().map_or(0, |p| p.size),
            total: self.total(),
            sent: self.sent,
            received: self.received,
            elapsed_secs: self.started_at.map(|t| t.elapsed().as_secs()),
        }
    }

    /// Whether progress counters moved since the last observation
    pub fn status_changed(&mut self) -> bool {
        let current = (self.total(), self.sent, self.received);
        let changed = self.last_reported != Some(current);
        self.last_reported = Some(current);
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn char_counting_window_accounting() {
        // Three short lines all fit a 120-byte window at once.
        let mut sender = CharCountingSender::new(120);
        sender.load("job", "G1 X10\nG1 Y20\nG1 Z5").unwrap();

        let emitted = sender.next();
        assert_eq!(emitted, vec!["G1 X10", "G1 Y20", "G1 Z5"]);
        assert_eq!(sender.bytes_in_flight(), 7 + 7 + 6);
        assert_eq!(sender.sent(), 3);
        assert_eq!(sender.received(), 0);

        sender.ack();
        assert_eq!(sender.received(), 1);
        assert_eq!(sender.bytes_in_flight(), 7 + 6);
        sender.ack();
        sender.ack();
        assert_eq!(sender.received(), 3);
        assert_eq!(sender.bytes_in_flight(), 0);
        assert!(sender.is_complete());
    }

    #[test]
    fn char_counting_window_blocks_until_ack() {
        // One line of exactly buffer_size - 1 bytes (plus newline) fills the
        // window; nothing else goes out until the acknowledgement.
        let buffer_size = 20;
        let long = "G1 X123456789012345"; // 19 bytes
        assert_eq!(long.len(), buffer_size - 1);
        let gcode = format!("{}\nG0 X0", long);

        let mut sender = CharCountingSender::new(buffer_size);
        sender.load("job", &gcode).unwrap();

        assert_eq!(sender.next(), vec![long.to_string()]);
        assert_eq!(sender.bytes_in_flight(), buffer_size);
        assert!(sender.next().is_empty());

        sender.ack();
        assert_eq!(sender.next(), vec!["G0 X0".to_string()]);
    }

    #[test]
    fn char_counting_skips_empty_lines() {
        let mut sender = CharCountingSender::new(120);
        sender.load("job", "G0 X0\n\n\nG0 X1\n").unwrap();

        assert_eq!(sender.next(), vec!["G0 X0", "G0 X1"]);
        assert_eq!(sender.total(), 4);
        assert_eq!(sender.sent(), 4);

        sender.ack(); // completes G0 X0 and the two empties behind it
        assert_eq!(sender.received(), 3);
        sender.ack();
        assert_eq!(sender.received(), 4);
        assert!(sender.is_complete());
    }

    #[test]
    fn empty_blob_fails_load_without_state_change() {
        let mut sender = CharCountingSender::new(120);
        assert!(sender.load("empty", "   \n  ").is_err());
        assert_eq!(sender.total(), 0);
        assert_eq!(sender.status().name, "");
    }

    #[test]
    fn unload_clears_totals() {
        let mut sender = CharCountingSender::new(120);
        sender.load("job", "G0 X0").unwrap();
        sender.unload();
        assert_eq!(sender.status().total, 0);
        assert!(!sender.is_complete());
    }

    #[test]
    fn rewind_retains_lines() {
        let mut sender = CharCountingSender::new(120);
        sender.load("job", "G0 X0\nG0 X1").unwrap();
        sender.next();
        sender.ack();
        sender.rewind();
        assert_eq!(sender.sent(), 0);
        assert_eq!(sender.received(), 0);
        assert_eq!(sender.next(), vec!["G0 X0", "G0 X1"]);
    }

    #[test]
    fn spurious_ack_is_dropped() {
        let mut sender = CharCountingSender::new(120);
        sender.load("job", "G0 X0").unwrap();
        sender.ack();
        assert_eq!(sender.received(), 0);
    }

    #[test]
    fn send_response_one_at_a_time() {
        let mut sender = SendResponseSender::new();
        sender.load("job", "G0 X0\nG0 X1").unwrap();

        assert_eq!(sender.next().unwrap(), "G0 X0");
        assert!(sender.next().is_none());
        assert_eq!(sender.in_flight(), Some("G0 X0"));

        sender.ack();
        assert_eq!(sender.next().unwrap(), "G0 X1");
        sender.ack();
        assert!(sender.is_complete());
        assert!(sender.next().is_none());
    }

    #[test]
    fn send_response_skips_empty_lines() {
        let mut sender = SendResponseSender::new();
        sender.load("job", "\nG0 X0\n\nG0 X1").unwrap();

        assert_eq!(sender.next().unwrap(), "G0 X0");
        sender.ack();
        assert_eq!(sender.next().unwrap(), "G0 X1");
        sender.ack();
        assert!(sender.is_complete());
    }

    #[test]
    fn status_reports_progress() {
        let mut sender = SendResponseSender::new();
        sender.load("demo", "G0 X0\nG0 X1").unwrap();
        sender.next();

        let status = sender.status();
        assert_eq!(status.name, "demo");
        assert_eq!(status.total, 2);
        assert_eq!(status.sent, 1);
        assert_eq!(status.received, 0);
    }
}
