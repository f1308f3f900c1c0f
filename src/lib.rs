//! # cnclink
//!
//! A multi-firmware G-code streaming controller: bridges interactive clients
//! to CNC motion controllers over a serial link, with per-firmware streaming
//! engines for the two supported families:
//!
//! - **Grbl** (plus Smoothieware in compatibility mode): character-counting
//!   flow control against the device's receive buffer, realtime single-byte
//!   commands.
//! - **TinyG2 / g2core**: one-line-at-a-time streaming gated by command
//!   acknowledgements and planner queue reports.
//!
//! ## Architecture
//!
//! The workspace is organized as:
//!
//! 1. **cnclink-core** - shared types, errors, macro configuration
//! 2. **cnclink-communication** - transport, feeder/sender engines,
//!    firmware controllers, connection multiplexing, controller registry
//! 3. **cnclink** - the headless streaming client binary

pub use cnclink_communication::{
    list_ports, open_controller, ControllerHandle, ControllerRegistry, SerialPortInfo,
};
pub use cnclink_core::{
    ClientEvent, ClientHandle, ControllerCommand, ControllerOptions, Error, FirmwareTag,
    MacroConfig, Result, WorkflowState,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Initialize logging with console output and `RUST_LOG` support.
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    Ok(())
}
