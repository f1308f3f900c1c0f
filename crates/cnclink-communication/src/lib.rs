//! # cnclink communication
//!
//! Protocol engines and plumbing for the cnclink streaming controller:
//! serial transport, the feeder/sender pacing engines, the Grbl-family and
//! TinyG2 firmware controllers, the connection multiplexer and the
//! process-wide controller registry.

pub mod connection;
pub mod firmware;
pub mod registry;
pub mod service;
pub mod streaming;
pub mod transport;

pub use connection::ConnectionHub;
pub use firmware::{FirmwareEngine, GrblMachine, Tinyg2Machine};
pub use registry::ControllerRegistry;
pub use service::{open_controller, spawn_controller, ControllerHandle};
pub use streaming::{CharCountingSender, FeedItem, Feeder, SendResponseSender};
pub use transport::{list_ports, SerialPortInfo, SerialTransport, Transport, TransportEvent};
