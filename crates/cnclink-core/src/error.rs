//! Error handling for cnclink
//!
//! Provides error types for the layers of the streaming controller:
//! - Transport errors (serial link related)
//! - Controller errors (lifecycle/state machine violations)
//! - Command errors (client command failures)
//!
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Transport error type
///
/// Represents errors on the serial link between the controller and the
/// device, including open failures, write failures and disconnects.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Port not found
    #[error("Port not found: {port}")]
    PortNotFound {
        /// The name of the port that was not found.
        port: String,
    },

    /// Failed to open port
    #[error("Failed to open port {port}: {reason}")]
    FailedToOpen {
        /// The name of the port that failed to open.
        port: String,
        /// The reason the port failed to open.
        reason: String,
    },

    /// Write issued against a closed port
    #[error("Port is not open")]
    NotOpen,

    /// Connection lost
    #[error("Connection lost: {reason}")]
    Disconnected {
        /// The reason the connection was lost.
        reason: String,
    },

    /// I/O error on the link
    #[error("I/O error: {reason}")]
    Io {
        /// The reason for the I/O error.
        reason: String,
    },
}

/// Controller error type
///
/// Represents violations of the controller lifecycle and job state machine.
#[derive(Error, Debug, Clone)]
pub enum ControllerError {
    /// Controller is not open
    #[error("Controller not open")]
    NotOpen,

    /// A controller is already registered for this port
    #[error("Controller already open on {port}")]
    AlreadyOpen {
        /// The contended port.
        port: String,
    },

    /// Controller has been closed and can no longer be used
    #[error("Controller closed")]
    Closed,

    /// Generic controller error
    #[error("Controller error: {message}")]
    Other {
        /// The error message.
        message: String,
    },
}

/// Command error type
///
/// Represents failures of individual client commands. These are returned to
/// the issuing client; they never tear the controller down.
#[derive(Error, Debug, Clone)]
pub enum CommandError {
    /// Load called with an empty or unparseable G-code blob
    #[error("Empty G-code program: {name}")]
    EmptyProgram {
        /// The name the program was loaded under.
        name: String,
    },

    /// Macro id not present in the configuration store
    #[error("Unknown macro: {id}")]
    UnknownMacro {
        /// The requested macro id.
        id: String,
    },

    /// Command not supported by the active firmware
    #[error("Command not supported by {firmware}: {command}")]
    Unsupported {
        /// The active firmware name.
        firmware: String,
        /// The rejected command name.
        command: String,
    },

    /// File could not be read for loadfile
    #[error("Failed to read {path}: {reason}")]
    FileRead {
        /// The requested path.
        path: String,
        /// The underlying I/O failure.
        reason: String,
    },
}

/// Main error type for cnclink
///
/// A unified error type that can represent any error from all layers.
/// This is the primary error type used in public APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport error
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Controller error
    #[error(transparent)]
    Controller(#[from] ControllerError),

    /// Command error
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this is a transport error
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    /// Check if this is a command error
    pub fn is_command_error(&self) -> bool {
        matches!(self, Error::Command(_))
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;
