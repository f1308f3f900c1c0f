//! Serial transport abstraction.
//!
//! The controllers talk to the device through the [`Transport`] trait so the
//! protocol state machines stay testable without hardware. Inbound traffic is
//! line-framed by the transport and delivered as [`TransportEvent`]s on a
//! channel owned by the controller's event loop.

pub mod serial;

use cnclink_core::Result;

pub use serial::{list_ports, SerialPortInfo, SerialTransport};

/// Inbound event from the serial link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A complete line, terminator stripped
    Line(String),
    /// The link dropped; no further events follow
    Disconnected,
    /// Transport-level failure description
    Error(String),
}

/// Write side of the serial link.
///
/// Writes are synchronous; back-pressure of the OS buffer is accepted. The
/// read side is the event channel returned by the concrete `open`.
pub trait Transport: Send {
    /// Write raw bytes to the device
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Whether the port is currently open
    fn is_open(&self) -> bool;

    /// Close the port; subsequent writes fail with `TransportError::NotOpen`
    fn close(&mut self) -> Result<()>;
}
