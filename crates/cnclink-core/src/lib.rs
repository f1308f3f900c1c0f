//! # cnclink core
//!
//! Shared types, errors and configuration for the cnclink streaming
//! controller. The protocol engines live in `cnclink-communication`; this
//! crate carries the vocabulary they exchange with clients.

pub mod config;
pub mod error;
pub mod types;

pub use config::{Macro, MacroConfig};
pub use error::{CommandError, ControllerError, Error, Result, TransportError};
pub use types::{
    ClientEvent, ClientHandle, ControllerCommand, ControllerOptions, FeederStatusReport,
    FirmwareTag, SenderStatusReport, WorkflowState,
};
