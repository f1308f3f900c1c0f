//! Firmware controller implementations.
//!
//! Two controller families are supported:
//! - Grbl (also recognising a Smoothieware variant at runtime):
//!   character-counting flow control, realtime single-byte commands.
//! - TinyG2 / g2core: line-numbered JSON protocol with ack + queue-report
//!   gating.
//!
//! Each controller is a synchronous state machine implementing
//! [`FirmwareEngine`]; the async plumbing that drives it lives in
//! [`crate::service`].

pub mod grbl;
pub mod tinyg2;

use cnclink_core::{ClientEvent, ClientHandle, ControllerCommand, Result};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;

pub use grbl::GrblMachine;
pub use tinyg2::Tinyg2Machine;

/// A firmware protocol state machine.
///
/// All inputs arrive on a single execution context (the controller's event
/// loop); implementations never block. After [`FirmwareEngine::close`] every
/// input is a no-op.
pub trait FirmwareEngine: Send {
    /// Port this controller is bound to
    fn port(&self) -> &str;

    /// The serial port just opened; schedule initialization
    fn on_open(&mut self, now: Instant);

    /// A line arrived from the device
    fn on_line(&mut self, line: &str, now: Instant);

    /// Timer tick: run deferred writes, the query timer and status publishing
    fn on_tick(&mut self, now: Instant);

    /// A client issued a command
    fn on_command(
        &mut self,
        client: Option<ClientHandle>,
        command: ControllerCommand,
        now: Instant,
    ) -> Result<()>;

    /// A client wrote raw data; the write is correlated for echo routing
    fn write_from_client(&mut self, client: ClientHandle, data: &str);

    /// Subscribe a client to this controller's events
    fn add_connection(&mut self, handle: ClientHandle, tx: UnboundedSender<ClientEvent>);

    /// Unsubscribe a client
    fn remove_connection(&mut self, handle: &ClientHandle);

    /// Transport-level failure; broadcast and tear down
    fn on_transport_error(&mut self, message: &str);

    /// Tear down: cancel timers, drop components, close the transport.
    /// Idempotent; a repeat close is logged and ignored.
    fn close(&mut self);

    /// Whether the controller has been torn down
    fn is_closed(&self) -> bool;
}

/// Monotonic throttle: `ready` returns true at most once per period.
#[derive(Debug)]
pub struct IntervalGate {
    period: Duration,
    last: Option<Instant>,
}

impl IntervalGate {
    /// A gate that first fires immediately, then at most once per `period`
    pub fn new(period: Duration) -> Self {
        Self { period, last: None }
    }

    /// Whether the period has elapsed; arms the gate when it has
    pub fn ready(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.duration_since(last) < self.period => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    /// Forget the last firing so the next `ready` fires immediately
    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Actions scheduled to run after a delay on the controller's own loop
/// (stop sequences, init pacing). Handlers run on the tick following their
/// deadline; after teardown the queue is dropped wholesale.
#[derive(Debug)]
pub struct DeferredQueue<T> {
    items: Vec<(Instant, T)>,
}

impl<T> Default for DeferredQueue<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T> DeferredQueue<T> {
    /// An empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule an action at `due`
    pub fn schedule(&mut self, due: Instant, action: T) {
        self.items.push((due, action));
    }

    /// Remove and return every action whose deadline has passed, in
    /// deadline order
    pub fn take_due(&mut self, now: Instant) -> Vec<T> {
        let mut due = Vec::new();
        let mut remaining = Vec::new();
        for (deadline, action) in self.items.drain(..) {
            if deadline <= now {
                due.push((deadline, action));
            } else {
                remaining.push((deadline, action));
            }
        }
        self.items = remaining;
        due.sort_by_key(|(deadline, _)| *deadline);
        due.into_iter().map(|(_, action)| action).collect()
    }

    /// Drop every scheduled action
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Whether anything is scheduled
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_gate_throttles() {
        let mut gate = IntervalGate::new(Duration::from_millis(250));
        let t0 = Instant::now();
        assert!(gate.ready(t0));
        assert!(!gate.ready(t0 + Duration::from_millis(100)));
        assert!(gate.ready(t0 + Duration::from_millis(250)));
    }

    #[test]
    fn interval_gate_reset_rearms() {
        let mut gate = IntervalGate::new(Duration::from_secs(1));
        let t0 = Instant::now();
        assert!(gate.ready(t0));
        gate.reset();
        assert!(gate.ready(t0));
    }

    #[test]
    fn deferred_queue_orders_by_schedule() {
        let mut queue = DeferredQueue::new();
        let t0 = Instant::now();
        queue.schedule(t0 + Duration::from_millis(50), "reset");
        queue.schedule(t0 + Duration::from_millis(10), "hold");

        assert!(queue.take_due(t0).is_empty());
        let due = queue.take_due(t0 + Duration::from_millis(60));
        assert_eq!(due, vec!["hold", "reset"]);
        assert!(queue.is_empty());
    }
}
