//! TinyG2 controller.
//!
//! Streams jobs one line at a time, gated by command acknowledgements plus
//! planner queue reports. Every write is newline-terminated; TinyG2 accepts
//! `!`, `~` and `%` mid-stream. Initialization runs an ordered script of
//! JSON configuration commands, each paced by its own settle time, before
//! the controller reports ready.

use crate::connection::ConnectionHub;
use crate::firmware::tinyg2::command_creator::{
    classify, query, wrap_gcode, LineNumberer, SenderMode,
};
use crate::firmware::tinyg2::response_parser::{Tinyg2Event, Tinyg2Parser};
use crate::firmware::{DeferredQueue, FirmwareEngine};
use crate::streaming::{FeedItem, Feeder, SendResponseSender};
use crate::transport::Transport;
use cnclink_core::{
    ClientEvent, ClientHandle, CommandError, ControllerCommand, ControllerOptions, FirmwareTag,
    MacroConfig, Result, WorkflowState,
};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;

/// Delay before the post-stop cleanup writes go out
const STOP_CLEANUP_DELAY: Duration = Duration::from_millis(250);

/// Whether a queue report has been seen since the last job advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum QrState {
    #[default]
    Unknown,
    Ok,
}

/// Whether the planner queue is known to have room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum PlannerStatus {
    #[default]
    Ready,
    Blocked,
}

/// Whether the in-flight line has been acknowledged by an `r` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum BufferState {
    #[default]
    Idle,
    Ack,
}

/// One step of the initialization script.
struct InitStep {
    payload: &'static str,
    pause_after: Duration,
}

const fn step(payload: &'static str, pause_ms: u64) -> InitStep {
    InitStep {
        payload,
        pause_after: Duration::from_millis(pause_ms),
    }
}

/// Ordered configuration script run after open. Relaxed JSON keys are what
/// the firmware itself accepts on its command line.
const INIT_SCRIPT: &[InitStep] = &[
    step("{ej:1}", 50),   // enable JSON mode
    step("{jv:4}", 50),   // JSON verbosity: linenum + messages
    step("{qv:1}", 50),   // queue report verbosity: single
    step("{sv:1}", 50),   // status report verbosity: filtered
    step("{si:250}", 50), // status report interval
    step(
        r#"{sr:{"line":true,"vel":true,"feed":true,"stat":true,"posx":true,"posy":true,"posz":true}}"#,
        50,
    ),
    step("{hp:null}", 50), // hardware platform
    step("{fb:null}", 50), // firmware build
    step("{mt:null}", 50), // motor timeout
    step("{qr:null}", 50), // queue report
    step("{sr:null}", 50), // status report
    step("?", 250),
];

/// Controller state machine for TinyG2 / g2core.
pub struct Tinyg2Machine {
    options: ControllerOptions,
    transport: Box<dyn Transport>,
    parser: Tinyg2Parser,
    feeder: Feeder,
    sender: SendResponseSender,
    connections: ConnectionHub,
    macros: MacroConfig,
    workflow: WorkflowState,
    ready: bool,
    closed: bool,
    numberer: LineNumberer,
    sender_mode: SenderMode,
    qr_state: QrState,
    planner_status: PlannerStatus,
    buffer_state: BufferState,
    published_revision: u64,
    deferred: DeferredQueue<Vec<u8>>,
    init_index: usize,
    init_due: Option<Instant>,
}

impl Tinyg2Machine {
    /// A controller over an already-open transport.
    pub fn new(
        options: ControllerOptions,
        transport: Box<dyn Transport>,
        macros: MacroConfig,
    ) -> Self {
        Self {
            options,
            transport,
            parser: Tinyg2Parser::new(),
            feeder: Feeder::new(),
            sender: SendResponseSender::new(),
            connections: ConnectionHub::new(),
            macros,
            workflow: WorkflowState::Idle,
            ready: false,
            closed: false,
            numberer: LineNumberer::new(),
            sender_mode: SenderMode::Run,
            qr_state: QrState::Unknown,
            planner_status: PlannerStatus::Ready,
            buffer_state: BufferState::Idle,
            published_revision: 0,
            deferred: DeferredQueue::new(),
            init_index: 0,
            init_due: None,
        }
    }

    /// Current workflow state
    pub fn workflow(&self) -> WorkflowState {
        self.workflow
    }

    /// Whether the init script has completed
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

    /// Every TinyG2 write is newline-terminated, realtime bytes included.
    fn write_line(&mut self, line: &str) {
        self.write_to_device(format!("{}\n", line).as_bytes());
    }

    /// Emit the next job line, numbered, classifying its gating mode. NoQr
    /// lines are chased with an explicit queue-report poll.
    fn send_next_job_line(&mut self) {
        let Some(line) = self.sender.next() else {
            return;
        };
        self.sender_mode = classify(&line);
        self.buffer_state = BufferState::Idle;
        let numbered = self.numberer.number(&line);
        self.write_line(&numbered);
        if !self.closed && self.sender_mode == SenderMode::NoQr {
            let probe = query("qr");
            self.write_line(&probe);
        }
    }

    /// Acknowledge the in-flight line and advance; a fresh queue report must
    /// precede the next advance.
    fn advance_job(&mut self) {
        self.sender.ack();
        self.send_next_job_line();
        self.qr_state = QrState::Unknown;
    }

    /// Dispatch the next feeder line. Single realtime characters and raw
    /// JSON mutations pass through; G-code is wrapped as `{"gc":...}`.
    fn pump_feeder(&mut self) {
        while let Some(item) = self.feeder.next() {
            let line = item.line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            let framed = frame_adhoc(&line);
            if let Some(client) = item.client {
                self.connections
                    .note_sent(&client, &format!("{}\n", framed));
            }
            self.write_line(&framed);
            return;
        }
    }

    fn handle_response(
        &mut self,
        _line_number: Option<u32>,
        footer_status: Option<u16>,
        raw: String,
    ) {
        if let Some(code) = footer_status {
            if code != 0 && !self.workflow.is_idle() {
                self.handle_footer_error(code);
                return;
            }
        }

        if !self.workflow.is_running() {
            self.connections
                .broadcast(ClientEvent::SerialRead { line: raw });
            self.pump_feeder();
            return;
        }

        self.buffer_state = BufferState::Ack;
        if self.sender_mode == SenderMode::Wait {
            // The arc is still unrolling into the planner; the queue report
            // decides when to move on.
            return;
        }
        if self.planner_status == PlannerStatus::Ready && self.qr_state == QrState::Ok {
            self.advance_job();
        }
    }

    fn handle_footer_error(&mut self, code: u16) {
        let was_blocked = self.planner_status == PlannerStatus::Blocked;
        let line = self.sender.in_flight().unwrap_or("").to_string();
        let line_number = self.sender.received() + 1;
        self.connections.broadcast(ClientEvent::SerialRead {
            line: format!("> {}", line),
        });
        self.connections.broadcast(ClientEvent::SerialRead {
            line: format!("error={}, line={}", code, line_number),
        });
        if self.workflow.is_running() {
            // The erroring line never entered the planner; consume its ack
            // and keep the job moving.
            self.sender.ack();
            self.send_next_job_line();
            self.qr_state = QrState::Unknown;
        }
        if !was_blocked {
            self.pump_feeder();
        }
    }

    fn handle_queue_report(&mut self, qr: u32, qi: u32, qo: u32) {
        self.qr_state = QrState::Ok;
        self.planner_status = PlannerStatus::Blocked;

        // The arc is committed once the planner stops filling.
        if self.sender_mode == SenderMode::Wait && (qi == 0 || qo > qi) {
            self.sender_mode = SenderMode::Run;
        }

        if qr > self.options.planner_low_water_mark && self.buffer_state == BufferState::Ack {
            if self.workflow.is_running() && self.sender_mode == SenderMode::Run {
                self.sender.ack();
                self.send_next_job_line();
            } else {
                self.pump_feeder();
            }
            self.planner_status = PlannerStatus::Ready;
        }
    }

    fn handle_status_report(&mut self, line_number: Option<u32>, raw: String) {
        let event = ClientEvent::SerialRead { line: raw };
        self.connections.route_prefix("?", &event);

        // Some firmware builds elide the r message; a status report carrying
        // the in-flight line number stands in for it.
        if !self.workflow.is_running() || self.sender_mode == SenderMode::Wait {
            return;
        }
        let refers_to_current = line_number.is_some_and(|n| n <= self.numberer.current());
        if refers_to_current && self.sender.in_flight().is_some() {
            self.buffer_state = BufferState::Ack;
            if self.planner_status == PlannerStatus::Ready && self.qr_state == QrState::Ok {
                self.advance_job();
            }
        }
    }

    fn publish_state_if_changed(&mut self) {
        if self.parser.revision() == self.published_revision || self.parser.state().is_empty() {
            return;
        }
        self.published_revision = self.parser.revision();
        let state = serde_json::to_value(self.parser.state()).unwrap_or_default();
        self.connections.broadcast(ClientEvent::ControllerState {
            firmware: FirmwareTag::TinyG2,
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

/// Frame an ad-hoc feeder line for the wire.
fn frame_adhoc(line: &str) -> String {
    let mut chars = line.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        if matches!(c, '!' | '~' | '%' | '?' | '\u{04}' | '\u{18}') {
            return line.to_string();
        }
    }
    if line.starts_with('{') {
        return line.to_string();
    }
    wrap_gcode(line)
}

impl FirmwareEngine for Tinyg2Machine {
    fn port(&self) -> &str {
        &self.options.port
    }

    fn on_open(&mut self, now: Instant) {
        self.connections.broadcast(ClientEvent::SerialOpen {
            port: self.options.port.clone(),
        });
        self.init_index = 0;
        self.init_due = Some(now);
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
            Tinyg2Event::QueueReport { qr, qi, qo } => self.handle_queue_report(qr, qi, qo),
            Tinyg2Event::Response {
                line_number,
                footer_status,
                raw,
            } => self.handle_response(line_number, footer_status, raw),
            Tinyg2Event::StatusReport { line_number, raw } => {
                self.handle_status_report(line_number, raw)
            }
            Tinyg2Event::FirmwareBuild(raw)
            | Tinyg2Event::HardwarePlatform(raw)
            | Tinyg2Event::Other(raw) => {
                self.connections
                    .broadcast(ClientEvent::SerialRead { line: raw });
            }
        }
    }

    fn on_tick(&mut self, now: Instant) {
        if self.closed {
            return;
        }

        for bytes in self.deferred.take_due(now) {
            self.write_to_device(&bytes);
            if self.closed {
                return;
            }
        }

        // Drive the init script, one paced step per due time.
        if !self.ready && self.transport.is_open() {
            while let Some(due) = self.init_due {
                if now < due {
                    break;
                }
                if self.init_index >= INIT_SCRIPT.len() {
                    self.ready = true;
                    self.init_due = None;
                    tracing::debug!("Controller on {} ready", self.options.port);
                    break;
                }
                let step = &INIT_SCRIPT[self.init_index];
                let payload = step.payload;
                let pause = step.pause_after;
                self.init_index += 1;
                self.init_due = Some(now + pause);
                self.write_line(payload);
                if self.closed {
                    return;
                }
            }
        }

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
                self.numberer.reset();
                self.sender.rewind();
                self.workflow = WorkflowState::Running;
                self.sender_mode = SenderMode::Run;
                self.qr_state = QrState::Unknown;
                self.planner_status = PlannerStatus::Ready;
                self.buffer_state = BufferState::Idle;
                self.send_next_job_line();
                Ok(())
            }
            ControllerCommand::Stop => {
                self.workflow = WorkflowState::Idle;
                self.sender.rewind();
                self.write_line("!%");
                self.deferred
                    .schedule(now + STOP_CLEANUP_DELAY, b"{clear:null}\n".to_vec());
                self.deferred
                    .schedule(now + STOP_CLEANUP_DELAY, b"{\"qr\":\"\"}\n".to_vec());
                Ok(())
            }
            ControllerCommand::Pause => {
                if self.workflow.is_running() {
                    self.workflow = WorkflowState::Paused;
                }
                self.write_line("!");
                self.write_line(r#"{"qr":""}"#);
                Ok(())
            }
            ControllerCommand::Resume => {
                self.write_line("~");
                self.write_line(r#"{"qr":""}"#);
                if self.workflow.is_paused() {
                    self.workflow = WorkflowState::Running;
                    self.send_next_job_line();
                } else {
                    self.pump_feeder();
                }
                Ok(())
            }
            ControllerCommand::QueueFlush => {
                self.write_line("!%");
                self.write_line(r#"{"qr":""}"#);
                Ok(())
            }
            ControllerCommand::KillJob => {
                self.write_line("\u{04}");
                Ok(())
            }
            ControllerCommand::Reset => {
                if !self.workflow.is_idle() {
                    self.workflow = WorkflowState::Idle;
                    self.sender.rewind();
                }
                self.write_line("\u{18}");
                Ok(())
            }
            ControllerCommand::Unlock => {
                self.write_line("{clear:null}");
                Ok(())
            }
            ControllerCommand::Homing => {
                self.write_line("{home:1}");
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
            other @ ControllerCommand::CheckMode => {
                tracing::error!("Command {} not supported by TinyG2", other.name());
                Err(CommandError::Unsupported {
                    firmware: FirmwareTag::TinyG2.to_string(),
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
                    firmware: FirmwareTag::TinyG2,
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
        self.init_due = None;
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
