//! Shared types for the streaming controller core.
//!
//! These are the vocabulary types exchanged between the controllers, the
//! feeder/sender engines and connected clients.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Job-level workflow state of a controller.
///
/// This is distinct from the device's own motion state: a controller can be
/// `Running` while the machine reports `Hold`, and vice versa during
/// stop/reset sequencing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowState {
    /// No job in progress
    #[default]
    Idle,
    /// A loaded job is being streamed
    Running,
    /// Streaming suspended, job position retained
    Paused,
}

impl WorkflowState {
    /// True when a job is actively streaming
    pub fn is_running(&self) -> bool {
        matches!(self, WorkflowState::Running)
    }

    /// True when a job is suspended
    pub fn is_paused(&self) -> bool {
        matches!(self, WorkflowState::Paused)
    }

    /// True when no job is in progress
    pub fn is_idle(&self) -> bool {
        matches!(self, WorkflowState::Idle)
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

/// Firmware family detected on the wire.
///
/// Grbl and Smoothieware share a controller; which one is active is
/// discovered at runtime from the startup banner or the `version` probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FirmwareTag {
    /// Grbl (default for the Grbl-family controller)
    #[default]
    Grbl,
    /// Smoothieware running in Grbl compatibility mode
    Smoothie,
    /// TinyG2 / g2core
    TinyG2,
}

impl std::fmt::Display for FirmwareTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Grbl => write!(f, "Grbl"),
            Self::Smoothie => write!(f, "Smoothie"),
            Self::TinyG2 => write!(f, "TinyG2"),
        }
    }
}

/// Immutable per-controller options, fixed at `open`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerOptions {
    /// Serial port name (e.g. "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Baud rate for the serial link
    pub baud_rate: u32,
    /// Device receive-buffer budget for character-counting flow control.
    /// Chosen strictly below the device's true capacity to leave head-room
    /// for out-of-band realtime queries.
    pub rx_buffer_size: usize,
    /// Planner-queue slots that must be free before the send/response
    /// protocol advances. Firmware-dependent tunable.
    pub planner_low_water_mark: u32,
}

impl ControllerOptions {
    /// Options for a port at the default 115200 baud
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: 115200,
            rx_buffer_size: 120,
            planner_low_water_mark: 4,
        }
    }

    /// Override the baud rate
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Override the receive-buffer budget
    pub fn with_rx_buffer_size(mut self, size: usize) -> Self {
        self.rx_buffer_size = size;
        self
    }
}

/// Handle identifying a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientHandle(Uuid);

impl ClientHandle {
    /// Allocate a fresh handle
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client({})", &self.0.to_string()[..8])
    }
}

/// Command issued by a client against a controller.
///
/// Commands unsupported by the active firmware are logged and discarded;
/// they never fail the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerCommand {
    /// Load a named G-code program; workflow returns to Idle
    Load {
        /// Display name of the program (usually the file name)
        name: String,
        /// The raw G-code blob
        gcode: String,
    },
    /// Discard the loaded program
    Unload,
    /// Begin streaming the loaded program from the top
    Start,
    /// Abort the job: rewind and soft-reset the device
    Stop,
    /// Feed hold: suspend streaming, device decelerates
    Pause,
    /// Cycle start: resume a held job
    Resume,
    /// Soft-reset the device; abandons any job
    Reset,
    /// Clear an alarm lock
    Unlock,
    /// Run the homing cycle
    Homing,
    /// Toggle G-code check mode (Grbl family only)
    CheckMode,
    /// Flush the planner queue (TinyG2 only)
    QueueFlush,
    /// Kill the active job at the firmware level (TinyG2 only)
    KillJob,
    /// Queue an ad-hoc G-code line through the feeder
    Gcode {
        /// The line to send, without terminator
        line: String,
    },
    /// Load a macro from the configuration store (recurses as Load)
    LoadMacro {
        /// Macro id in the store
        id: String,
    },
    /// Load a program from disk (recurses as Load)
    LoadFile {
        /// Path to the G-code file
        path: String,
    },
}

impl ControllerCommand {
    /// Stable name used in logs for discarded/unsupported commands
    pub fn name(&self) -> &'static str {
        match self {
            Self::Load { .. } => "load",
            Self::Unload => "unload",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Reset => "reset",
            Self::Unlock => "unlock",
            Self::Homing => "homing",
            Self::CheckMode => "check",
            Self::QueueFlush => "queueflush",
            Self::KillJob => "killjob",
            Self::Gcode { .. } => "gcode",
            Self::LoadMacro { .. } => "loadmacro",
            Self::LoadFile { .. } => "loadfile",
        }
    }
}

/// Snapshot of the feeder queue published at timer granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeederStatusReport {
    /// Lines waiting in the queue
    pub queued: usize,
    /// Whether a line is in flight awaiting its acknowledgement
    pub pending: bool,
}

/// Snapshot of the sender (job stream) published at timer granularity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderStatusReport {
    /// Name of the loaded program, empty when unloaded
    pub name: String,
    /// Size of the loaded blob in bytes
    pub size: usize,
    /// Total executable lines
    pub total: usize,
    /// Lines handed to the device
    pub sent: usize,
    /// Lines acknowledged by the device
    pub received: usize,
    /// Seconds since the job started, when one is active
    pub elapsed_secs: Option<u64>,
}

/// Event delivered to a connected client.
///
/// The textual payloads preserve the device's raw line; relative ordering of
/// events to a single client matches parser output order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload")]
pub enum ClientEvent {
    /// The serial port opened
    #[serde(rename = "serialport:open")]
    SerialOpen {
        /// Port name
        port: String,
    },
    /// The serial port closed (explicit close or disconnect)
    #[serde(rename = "serialport:close")]
    SerialClose {
        /// Port name
        port: String,
    },
    /// Transport-level failure
    #[serde(rename = "serialport:error")]
    SerialError {
        /// Failure description
        message: String,
    },
    /// Raw line read from the device
    #[serde(rename = "serialport:read")]
    SerialRead {
        /// The line as decoded
        line: String,
    },
    /// Raw data written to the device
    #[serde(rename = "serialport:write")]
    SerialWrite {
        /// The bytes as written, rendered as text
        data: String,
    },
    /// Feeder queue snapshot
    #[serde(rename = "feeder:status")]
    FeederStatus(FeederStatusReport),
    /// Sender (job) snapshot
    #[serde(rename = "sender:status")]
    SenderStatus(SenderStatusReport),
    /// Firmware state snapshot, published on change
    #[serde(rename = "controller:state")]
    ControllerState {
        /// Active firmware family
        firmware: FirmwareTag,
        /// Parser state object
        state: serde_json::Value,
    },
}

impl ClientEvent {
    /// Wire name of the event as clients see it. The state snapshot is
    /// namespaced by the active firmware (`Grbl:state`, `TinyG2:state`).
    pub fn name(&self) -> String {
        match self {
            Self::SerialOpen { .. } => "serialport:open".to_string(),
            Self::SerialClose { .. } => "serialport:close".to_string(),
            Self::SerialError { .. } => "serialport:error".to_string(),
            Self::SerialRead { .. } => "serialport:read".to_string(),
            Self::SerialWrite { .. } => "serialport:write".to_string(),
            Self::FeederStatus(_) => "feeder:status".to_string(),
            Self::SenderStatus(_) => "sender:status".to_string(),
            Self::ControllerState { firmware, .. } => format!("{}:state", firmware),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_state_default_is_idle() {
        assert_eq!(WorkflowState::default(), WorkflowState::Idle);
        assert!(WorkflowState::Idle.is_idle());
        assert!(!WorkflowState::Idle.is_running());
    }

    #[test]
    fn options_defaults() {
        let opts = ControllerOptions::new("/dev/ttyACM0");
        assert_eq!(opts.baud_rate, 115200);
        assert_eq!(opts.rx_buffer_size, 120);
    }

    #[test]
    fn client_event_serializes_with_tag() {
        let ev = ClientEvent::SerialRead {
            line: "ok".to_string(),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["event"], "serialport:read");
        assert_eq!(v["payload"]["line"], "ok");
    }

    #[test]
    fn state_event_name_tracks_firmware() {
        let ev = ClientEvent::ControllerState {
            firmware: FirmwareTag::TinyG2,
            state: serde_json::json!({}),
        };
        assert_eq!(ev.name(), "TinyG2:state");
    }
}
