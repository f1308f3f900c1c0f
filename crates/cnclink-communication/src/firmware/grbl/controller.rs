//! Grbl-family controller.
//!
//! Owns the feeder, the character-counting sender, the response parser and
//! the connection hub for one serial port. Smoothieware is recognised at
//! runtime: after open the controller waits 500 ms, probes with `version`,
//! and tags the firmware Smoothie if the device answers; Grbl ignores the
//! probe and identifies itself through its startup banner instead.

use crate::connection::ConnectionHub;
use crate::firmware::grbl::error_decoder::{format_alarm, format_error};
use crate::firmware::grbl::response_parser::{GrblEvent, GrblParser};
use crate::firmware::{DeferredQueue, FirmwareEngine, IntervalGate};
use crate::streaming::{CharCountingSender, FeedItem, Feeder};
use crate::transport::Transport;
use cnclink_core::{
    ClientEvent, ClientHandle, CommandError, ControllerCommand, ControllerOptions, FirmwareTag,
    MacroConfig, Result, WorkflowState,
};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;

/// Query timer period
const QUERY_INTERVAL: Duration = Duration::from_millis(250);
/// Minimum spacing between `$G` parser-state polls
const PARSERSTATE_INTERVAL: Duration = Duration::from_millis(500);
/// Settle time after open before the Smoothie probe goes out
const STARTUP_DELAY: Duration = Duration::from_millis(500);
/// Settle time after the probe before the controller reports ready
const PROBE_SETTLE: Duration = Duration::from_millis(50);
/// Delay between the hold/resume byte and the soft reset on `stop`
const STOP_RESET_DELAY: Duration = Duration::from_millis(50);

/// Grbl soft-reset realtime byte (Ctrl-X)
const SOFT_RESET: u8 = 0x18;

/// Single bytes the device interprets immediately, out-of-band of the line
/// protocol; these are written without newline termination.
fn is_realtime(data: &str) -> bool {
    let mut chars = data.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => matches!(c, '?' | '~' | '!' | '\u{18}'),
        _ => false,
    }
}

#[derive(Debug)]
enum Deferred {
    Write(Vec<u8>),
    Ready,
}

/// Controller state machine for the Grbl family.
pub struct GrblMachine {
    options: ControllerOptions,
    transport: Box<dyn Transport>,
    parser: GrblParser,
    feeder: Feeder,
    sender: CharCountingSender,
    connections: ConnectionHub,
    macros: MacroConfig,
    workflow: WorkflowState,
    firmware: FirmwareTag,
    ready: bool,
    closed: bool,
    status_in_flight: bool,
    parserstate_in_flight: bool,
    parserstate_awaiting_ok: bool,
    query_gate: IntervalGate,
    parserstate_gate: IntervalGate,
    published_revision: u64,
    deferred: DeferredQueue<Deferred>,
}

impl GrblMachine {
    /// A controller over an already-open transport.
    pub fn new(
        options: ControllerOptions,
        transport: Box<dyn Transport>,
        macros: MacroConfig,
    ) -> Self {
        let sender = CharCountingSender::new(options.rx_buffer_size);
        Self {
            options,
            transport,
            parser: GrblParser::new(),
            feeder: Feeder::new(),
            sender,
            connections: ConnectionHub::new(),
            macros,
            workflow: WorkflowState::Idle,
            firmware: FirmwareTag::Grbl,
            ready: false,
            closed: false,
            status_in_flight: false,
            parserstate_in_flight: false,
            parserstate_awaiting_ok: false,
            query_gate: IntervalGate::new(QUERY_INTERVAL),
            parserstate_gate: IntervalGate::new(PARSERSTATE_INTERVAL),
            published_revision: 0,
            deferred: DeferredQueue::new(),
        }
    }

    /// Current workflow state
    pub fn workflow(&self) -> WorkflowState {
        self.workflow
    }

    /// Firmware family discovered on the wire
    pub fn firmware(&self) -> FirmwareTag {
        self.firmware
    }

    /// Whether initialization has completed
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    fn write_to_device(&mut self, data: &[u8]) {
        if let Err(e) = self.transport.write(data) {
            tracing::error!("Write to {} failed: {}", self.options.port, e);
            self.connections.broadcast(ClientEvent::SerialError {
                message: e.to_string(),
            });
            self.close();
        }
    }

    /// Write a command, appending the newline terminator unless it is a
    /// realtime byte.
    fn write_command(&mut self, data: &str) {
        if is_realtime(data) {
            self.write_to_device(data.as_bytes());
        } else {
            self.write_to_device(format!("{}\n", data).as_bytes());
        }
    }

    /// Emit every job line the window allows.
    fn pump_sender(&mut self) {
        for line in self.sender.next() {
            self.write_to_device(format!("{}\n", line).as_bytes());
            if self.closed {
                return;
            }
        }
    }

    /// Dispatch the next feeder line, skipping empties, correlating the
    /// write when the line came from a client.
    fn pump_feeder(&mut self) {
        while let Some(item) = self.feeder.next() {
            let line = item.line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            if let Some(client) = item.client {
                let written = if is_realtime(&line) {
                    line.clone()
                } else {
                    format!("{}\n", line)
                };
                self.connections.note_sent(&client, &written);
            }
            self.write_command(&line);
            return;
        }
    }

    fn handle_ok(&mut self) {
        if self.parserstate_awaiting_ok {
            // The ok that closes a $G exchange; consume it silently.
            self.parserstate_awaiting_ok = false;
            self.connections.clear_prefix("$G");
            return;
        }
        if self.workflow.is_running() {
            self.sender.ack();
            self.pump_sender();
            return;
        }
        self.connections.broadcast(ClientEvent::SerialRead {
            line: "ok".to_string(),
        });
        self.pump_feeder();
    }

    fn handle_error(&mut self, raw: &str) {
        if self.workflow.is_running() {
            let line = self.sender.oldest_in_flight().unwrap_or("").to_string();
            let line_number = self.sender.received() + 1;
            self.connections.broadcast(ClientEvent::SerialRead {
                line: format!("> {}", line),
            });
            self.connections.broadcast(ClientEvent::SerialRead {
                line: format!("error={}, line={}", format_error(raw), line_number),
            });
            self.sender.ack();
            self.pump_sender();
            return;
        }
        self.connections.broadcast(ClientEvent::SerialRead {
            line: format!("error:{}", format_error(raw)),
        });
        self.pump_feeder();
    }

    fn publish_state_if_changed(&mut self) {
        if self.parser.revision() == self.published_revision || self.parser.state().is_empty() {
            return;
        }
        self.published_revision = self.parser.revision();
        let state = serde_json::to_value(self.parser.state()).unwrap_or_default();
        self.connections.broadcast(ClientEvent::ControllerState {
            firmware: self.firmware,
            state,
        });
    }

    fn load_program(&mut self, name: &str, gcode: &str) -> Result<()> {
        self.sender.load(name, gcode)?;
        self.workflow = WorkflowState::Idle;
        tracing::info!(
            "Loaded {} on {}: {} lines",
            name,
            self.options.port,
            self.sender.total()
        );
        Ok(())
    }
}

impl FirmwareEngine for GrblMachine {
    fn port(&self) -> &str {
        &self.options.port
    }

    fn on_open(&mut self, now: Instant) {
        self.connections.broadcast(ClientEvent::SerialOpen {
            port: self.options.port.clone(),
        });
        // Smoothie fingerprint: let the device settle, probe, then report
        // ready. Grbl never answers `version`.
        self.deferred
            .schedule(now + STARTUP_DELAY, Deferred::Write(b"version\n".to_vec()));
        self.deferred
            .schedule(now + STARTUP_DELAY + PROBE_SETTLE, Deferred::Ready);
    }

    fn on_line(&mut self, line: &str, _now: Instant) {
        if self.closed {
            tracing::debug!("Dropping line after close: {}", line);
            return;
        }
        let Some(event) = self.parser.parse(line) else {
            return;
        };
        match event {
            GrblEvent::Ok => self.handle_ok(),
            GrblEvent::Error(raw) => self.handle_error(&raw),
            GrblEvent::Status(raw) => {
                self.status_in_flight = false;
                let event = ClientEvent::SerialRead { line: raw };
                self.connections.route_prefix("?", &event);
            }
            GrblEvent::ParserState(raw) => {
                self.parserstate_in_flight = false;
                self.parserstate_awaiting_ok = true;
                let event = ClientEvent::SerialRead { line: raw };
                // Correlation is cleared by the ok that closes the exchange.
                self.connections.send_prefix("$G", &event);
            }
            GrblEvent::Alarm(raw) => {
                self.connections.broadcast(ClientEvent::SerialRead {
                    line: format_alarm(&raw),
                });
            }
            GrblEvent::Startup(raw) => {
                self.status_in_flight = false;
                self.parserstate_in_flight = false;
                self.parserstate_awaiting_ok = false;
                self.firmware = FirmwareTag::Grbl;
                self.connections
                    .broadcast(ClientEvent::SerialRead { line: raw });
            }
            GrblEvent::SmoothieVersion(raw) => {
                self.firmware = FirmwareTag::Smoothie;
                self.connections
                    .broadcast(ClientEvent::SerialRead { line: raw });
            }
            GrblEvent::Parameters(raw)
            | GrblEvent::Feedback(raw)
            | GrblEvent::Settings(raw)
            | GrblEvent::Other(raw) => {
                self.connections
                    .broadcast(ClientEvent::SerialRead { line: raw });
            }
        }
    }

    fn on_tick(&mut self, now: Instant) {
        if self.closed {
            return;
        }

        for action in self.deferred.take_due(now) {
            match action {
                Deferred::Write(bytes) => self.write_to_device(&bytes),
                Deferred::Ready => {
                    self.ready = true;
                    tracing::debug!("Controller on {} ready", self.options.port);
                }
            }
            if self.closed {
                return;
            }
        }

        if self.transport.is_open() && self.ready && self.query_gate.ready(now) {
            if !self.status_in_flight {
                self.status_in_flight = true;
                self.write_to_device(b"?");
            }
            if !self.closed
                && !self.parserstate_in_flight
                && !self.parserstate_awaiting_ok
                && self.parserstate_gate.ready(now)
            {
                self.parserstate_in_flight = true;
                self.write_to_device(b"$G\n");
            }
        }
        if self.closed {
            return;
        }

        // Job completion is observed here rather than on the ack edge.
        if self.workflow.is_running() && self.sender.total() > 0 && self.sender.is_complete() {
            self.workflow = WorkflowState::Idle;
            tracing::info!("Job complete on {}", self.options.port);
        }

        if self.feeder.status_changed() {
            self.connections
                .broadcast(ClientEvent::FeederStatus(self.feeder.status()));
        }
        if self.sender.status_changed() {
            self.connections
                .broadcast(ClientEvent::SenderStatus(self.sender.status()));
        }
        self.publish_state_if_changed();
    }

    fn on_command(
        &mut self,
        client: Option<ClientHandle>,
        command: ControllerCommand,
        now: Instant,
    ) -> Result<()> {
        if self.closed {
            tracing::warn!("Dropping {} after close", command.name());
            return Err(cnclink_core::ControllerError::Closed.into());
        }
        match command {
            ControllerCommand::Load { name, gcode } => self.load_program(&name, &gcode),
            ControllerCommand::Unload => {
                self.workflow = WorkflowState::Idle;
                self.sender.unload();
                Ok(())
            }
            ControllerCommand::Start => {
                self.feeder.clear();
                self.workflow = WorkflowState::Running;
                self.sender.rewind();
                self.pump_sender();
                Ok(())
            }
            ControllerCommand::Stop => {
                self.workflow = WorkflowState::Idle;
                self.sender.rewind();
                let active = self.parser.state().active_state.as_str();
                let hold_byte = match self.firmware {
                    FirmwareTag::Smoothie if active == "Hold" => Some(b'~'),
                    FirmwareTag::Smoothie => None,
                    _ if active == "Run" => Some(b'!'),
                    _ => None,
                };
                if let Some(byte) = hold_byte {
                    self.write_to_device(&[byte]);
                    self.deferred
                        .schedule(now + STOP_RESET_DELAY, Deferred::Write(vec![SOFT_RESET]));
                } else {
                    self.write_to_device(&[SOFT_RESET]);
                }
                Ok(())
            }
            ControllerCommand::Pause => {
                if self.workflow.is_running() {
                    self.workflow = WorkflowState::Paused;
                }
                self.write_to_device(b"!");
                Ok(())
            }
            ControllerCommand::Resume => {
                self.write_to_device(b"~");
                if self.workflow.is_paused() {
                    self.workflow = WorkflowState::Running;
                    self.pump_sender();
                }
                Ok(())
            }
            ControllerCommand::Reset => {
                if !self.workflow.is_idle() {
                    self.workflow = WorkflowState::Idle;
                    self.sender.rewind();
                }
                self.write_to_device(&[SOFT_RESET]);
                Ok(())
            }
            ControllerCommand::Unlock => {
                self.write_command("$X");
                Ok(())
            }
            ControllerCommand::Homing => {
                self.write_command("$H");
                Ok(())
            }
            ControllerCommand::CheckMode => {
                self.write_command("$C");
                Ok(())
            }
            ControllerCommand::Gcode { line } => {
                let dispatch = !self.feeder.is_pending();
                match client {
                    Some(client) => self.feeder.feed(FeedItem::from_client(client, line)),
                    None => self.feeder.feed(FeedItem::anonymous(line)),
                }
                if dispatch {
                    self.pump_feeder();
                }
                Ok(())
            }
            ControllerCommand::LoadMacro { id } => {
                let m = self
                    .macros
                    .find(&id)
                    .cloned()
                    .ok_or(CommandError::UnknownMacro { id })?;
                self.load_program(&m.name, &m.content)
            }
            ControllerCommand::LoadFile { path } => {
                let gcode =
                    std::fs::read_to_string(&path).map_err(|e| CommandError::FileRead {
                        path: path.clone(),
                        reason: e.to_string(),
                    })?;
                self.load_program(&path, &gcode)
            }
            other @ (ControllerCommand::QueueFlush | ControllerCommand::KillJob) => {
                tracing::error!("Command {} not supported by Grbl", other.name());
                Err(CommandError::Unsupported {
                    firmware: self.firmware.to_string(),
                    command: other.name().to_string(),
                }
                .into())
            }
        }
    }

    fn write_from_client(&mut self, client: ClientHandle, data: &str) {
        if self.closed {
            return;
        }
        self.connections.note_sent(&client, data);
        self.connections.broadcast(ClientEvent::SerialWrite {
            data: data.to_string(),
        });
        self.write_to_device(data.as_bytes());
    }

    fn add_connection(&mut self, handle: ClientHandle, tx: UnboundedSender<ClientEvent>) {
        if !self.connections.add(handle, tx) {
            return;
        }
        if !self.parser.state().is_empty() {
            let state = serde_json::to_value(self.parser.state()).unwrap_or_default();
            self.connections.send_to(
                &handle,
                ClientEvent::ControllerState {
                    firmware: self.firmware,
                    state,
                },
            );
            self.connections
                .send_to(&handle, ClientEvent::SenderStatus(self.sender.status()));
        }
    }

    fn remove_connection(&mut self, handle: &ClientHandle) {
        self.connections.remove(handle);
    }

    fn on_transport_error(&mut self, message: &str) {
        self.connections.broadcast(ClientEvent::SerialError {
            message: message.to_string(),
        });
        self.close();
    }

    fn close(&mut self) {
        if self.closed {
            tracing::warn!("Controller on {} already closed", self.options.port);
            return;
        }
        self.closed = true;
        self.ready = false;
        self.deferred.clear();
        self.feeder.clear();
        self.sender.unload();
        self.connections.broadcast(ClientEvent::SerialClose {
            port: self.options.port.clone(),
        });
        if let Err(e) = self.transport.close() {
            tracing::warn!("Closing {} failed: {}", self.options.port, e);
        }
        self.connections.clear();
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
