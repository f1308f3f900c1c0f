//! Shared test support: a recording transport and event-drain helpers.
#![allow(dead_code)]

use cnclink_core::ClientEvent;
use cnclink_communication::{Transport, TransportEvent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedReceiver;

/// Transport that records every write for assertions.
pub struct MockTransport {
    written: Arc<Mutex<Vec<Vec<u8>>>>,
    open: Arc<AtomicBool>,
}

impl MockTransport {
    pub fn new() -> (Self, Recorder) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let open = Arc::new(AtomicBool::new(true));
        let recorder = Recorder {
            written: written.clone(),
            open: open.clone(),
        };
        (Self { written, open }, recorder)
    }
}

impl Transport for MockTransport {
    fn write(&mut self, data: &[u8]) -> cnclink_core::Result<usize> {
        if !self.is_open() {
            return Err(cnclink_core::TransportError::NotOpen.into());
        }
        self.written.lock().unwrap().push(data.to_vec());
        Ok(data.len())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&mut self) -> cnclink_core::Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Assertion-side view of a [`MockTransport`].
#[derive(Clone)]
pub struct Recorder {
    written: Arc<Mutex<Vec<Vec<u8>>>>,
    open: Arc<AtomicBool>,
}

impl Recorder {
    /// Every write so far, rendered as text
    pub fn written(&self) -> Vec<String> {
        self.written
            .lock()
            .unwrap()
            .iter()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .collect()
    }

    /// Forget recorded writes (e.g. after init traffic)
    pub fn clear(&self) {
        self.written.lock().unwrap().clear();
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Drain every event currently queued on a client channel.
pub fn drain(rx: &mut UnboundedReceiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// The `serialport:read` payloads among the drained events.
pub fn read_lines(events: &[ClientEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            ClientEvent::SerialRead { line } => Some(line.clone()),
            _ => None,
        })
        .collect()
}

/// A transport-event channel pair for driver tests.
pub fn transport_channel() -> (
    tokio::sync::mpsc::UnboundedSender<TransportEvent>,
    UnboundedReceiver<TransportEvent>,
) {
    tokio::sync::mpsc::unbounded_channel()
}
