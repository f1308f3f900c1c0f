//! Grbl controller scenarios: character-counting streaming, stop sequencing,
//! query routing and multi-client broadcast.

mod common;

use cnclink_communication::firmware::FirmwareEngine;
use cnclink_communication::GrblMachine;
use common::{drain, read_lines, MockTransport, Recorder};
use cnclink_core::{
    ClientEvent, ClientHandle, ControllerCommand, ControllerOptions, FirmwareTag, MacroConfig,
    WorkflowState,
};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

fn machine_with_buffer(rx_buffer_size: usize) -> (GrblMachine, Recorder) {
    let (transport, recorder) = MockTransport::new();
    let options = ControllerOptions::new("/dev/ttyACM0").with_rx_buffer_size(rx_buffer_size);
    let machine = GrblMachine::new(options, Box::new(transport), MacroConfig::new());
    (machine, recorder)
}

fn machine() -> (GrblMachine, Recorder) {
    machine_with_buffer(120)
}

fn attach(machine: &mut GrblMachine) -> (ClientHandle, UnboundedReceiver<ClientEvent>) {
    let handle = ClientHandle::new();
    let (tx, rx) = unbounded_channel();
    machine.add_connection(handle, tx);
    (handle, rx)
}

fn load_and_start(machine: &mut GrblMachine, gcode: &str, now: Instant) {
    machine
        .on_command(
            None,
            ControllerCommand::Load {
                name: "job".to_string(),
                gcode: gcode.to_string(),
            },
            now,
        )
        .unwrap();
    machine
        .on_command(None, ControllerCommand::Start, now)
        .unwrap();
}

#[test]
fn char_counting_stream_to_completion() {
    let (mut machine, recorder) = machine();
    let (_client, mut rx) = attach(&mut machine);
    let t0 = Instant::now();

    load_and_start(&mut machine, "G1 X10\nG1 Y20\nG1 Z5", t0);
    assert_eq!(recorder.written(), vec!["G1 X10\n", "G1 Y20\n", "G1 Z5\n"]);
    assert_eq!(machine.workflow(), WorkflowState::Running);

    machine.on_line("ok", t0);
    machine.on_line("ok", t0);
    machine.on_line("ok", t0);

    // Completion is observed by the timer, not on the ack edge.
    assert_eq!(machine.workflow(), WorkflowState::Running);
    machine.on_tick(t0);
    assert_eq!(machine.workflow(), WorkflowState::Idle);

    let events = drain(&mut rx);
    let status = events
        .iter()
        .rev()
        .find_map(|event| match event {
            ClientEvent::SenderStatus(status) => Some(status.clone()),
            _ => None,
        })
        .expect("sender status published");
    assert_eq!(status.total, 3);
    assert_eq!(status.sent, 3);
    assert_eq!(status.received, 3);
}

#[test]
fn window_blocks_second_line_until_ack() {
    let (mut machine, recorder) = machine_with_buffer(8);
    let t0 = Instant::now();

    load_and_start(&mut machine, "G1 X1\nG1 Y1", t0);
    assert_eq!(recorder.written(), vec!["G1 X1\n"]);

    machine.on_line("ok", t0);
    assert_eq!(recorder.written(), vec!["G1 X1\n", "G1 Y1\n"]);
}

#[test]
fn stop_while_running_holds_then_resets() {
    let (mut machine, recorder) = machine();
    let t0 = Instant::now();

    load_and_start(&mut machine, "G1 X10", t0);
    machine.on_line("<Run|MPos:1.000,0.000,0.000>", t0);
    recorder.clear();

    machine
        .on_command(None, ControllerCommand::Stop, t0)
        .unwrap();
    assert_eq!(machine.workflow(), WorkflowState::Idle);
    assert_eq!(recorder.written(), vec!["!"]);

    // Soft reset follows 50 ms later.
    machine.on_tick(t0 + Duration::from_millis(20));
    assert_eq!(recorder.written(), vec!["!"]);
    machine.on_tick(t0 + Duration::from_millis(60));
    assert_eq!(recorder.written(), vec!["!", "\u{18}"]);
}

#[test]
fn stop_while_idle_resets_immediately() {
    let (mut machine, recorder) = machine();
    let t0 = Instant::now();

    machine
        .on_command(None, ControllerCommand::Stop, t0)
        .unwrap();
    assert_eq!(recorder.written(), vec!["\u{18}"]);
}

#[test]
fn smoothie_hold_stop_resumes_before_reset() {
    let (mut machine, recorder) = machine();
    let t0 = Instant::now();

    machine.on_line("Build version: edge-94de12c, Build date: Oct 28 2017", t0);
    assert_eq!(machine.firmware(), FirmwareTag::Smoothie);
    machine.on_line("<Hold|MPos:1.000,0.000,0.000>", t0);
    recorder.clear();

    machine
        .on_command(None, ControllerCommand::Stop, t0)
        .unwrap();
    assert_eq!(recorder.written(), vec!["~"]);
    machine.on_tick(t0 + Duration::from_millis(60));
    assert_eq!(recorder.written(), vec!["~", "\u{18}"]);
}

#[test]
fn parserstate_query_routes_to_issuing_client() {
    let (mut machine, _recorder) = machine();
    let t0 = Instant::now();
    let (a, mut rx_a) = attach(&mut machine);
    let (_b, mut rx_b) = attach(&mut machine);

    machine.write_from_client(a, "$G\n");
    drain(&mut rx_a);
    drain(&mut rx_b);

    machine.on_line("[GC:G0 G54 G17 G21 G90 G94 M5 M9 T0 F0 S0]", t0);
    let a_lines = read_lines(&drain(&mut rx_a));
    assert_eq!(a_lines, vec!["[GC:G0 G54 G17 G21 G90 G94 M5 M9 T0 F0 S0]"]);
    assert!(read_lines(&drain(&mut rx_b)).is_empty());

    // The ok that closes the exchange is consumed, not broadcast.
    machine.on_line("ok", t0);
    assert!(read_lines(&drain(&mut rx_a)).is_empty());
    assert!(read_lines(&drain(&mut rx_b)).is_empty());

    // The next ok is ordinary traffic again.
    machine.on_line("ok", t0);
    assert_eq!(read_lines(&drain(&mut rx_a)), vec!["ok"]);
    assert_eq!(read_lines(&drain(&mut rx_b)), vec!["ok"]);
}

#[test]
fn alarm_broadcasts_to_every_client_without_clearing_correlation() {
    let (mut machine, _recorder) = machine();
    let t0 = Instant::now();
    let (a, mut rx_a) = attach(&mut machine);
    let (_b, mut rx_b) = attach(&mut machine);

    machine.write_from_client(a, "$G\n");
    drain(&mut rx_a);
    drain(&mut rx_b);

    machine.on_line("ALARM:1", t0);
    assert_eq!(
        read_lines(&drain(&mut rx_a)),
        vec!["ALARM:1 (Hard limit triggered)"]
    );
    assert_eq!(
        read_lines(&drain(&mut rx_b)),
        vec!["ALARM:1 (Hard limit triggered)"]
    );

    // The alarm was unsolicited; the $G correlation still routes.
    machine.on_line("[GC:G0 G54]", t0);
    assert_eq!(read_lines(&drain(&mut rx_a)), vec!["[GC:G0 G54]"]);
}

#[test]
fn error_on_first_line_reports_context_and_continues() {
    let (mut machine, _recorder) = machine();
    let (_client, mut rx) = attach(&mut machine);
    let t0 = Instant::now();

    load_and_start(&mut machine, "G1 X\nG1 Y1", t0);
    drain(&mut rx);

    machine.on_line("error:20", t0);
    let lines = read_lines(&drain(&mut rx));
    assert_eq!(
        lines,
        vec!["> G1 X", "error=20 (Unsupported command), line=1"]
    );

    machine.on_line("ok", t0);
    machine.on_tick(t0);
    assert_eq!(machine.workflow(), WorkflowState::Idle);
}

#[test]
fn pause_stops_emission_and_resume_continues_without_duplicates() {
    let (mut machine, recorder) = machine_with_buffer(8);
    let t0 = Instant::now();

    load_and_start(&mut machine, "G1 X1\nG1 Y1\nG1 Z1", t0);
    assert_eq!(recorder.written(), vec!["G1 X1\n"]);

    machine
        .on_command(None, ControllerCommand::Pause, t0)
        .unwrap();
    assert_eq!(machine.workflow(), WorkflowState::Paused);
    assert_eq!(recorder.written(), vec!["G1 X1\n", "!"]);

    machine
        .on_command(None, ControllerCommand::Resume, t0)
        .unwrap();
    assert_eq!(machine.workflow(), WorkflowState::Running);
    // The window is still full; nothing is re-emitted.
    assert_eq!(recorder.written(), vec!["G1 X1\n", "!", "~"]);

    machine.on_line("ok", t0);
    assert_eq!(recorder.written(), vec!["G1 X1\n", "!", "~", "G1 Y1\n"]);
}

#[test]
fn query_timer_gates_status_queries() {
    let (mut machine, recorder) = machine();
    let t0 = Instant::now();

    machine.on_open(t0);
    machine.on_tick(t0 + Duration::from_millis(600));
    let written = recorder.written();
    assert!(written.contains(&"version\n".to_string()));
    assert_eq!(written.iter().filter(|w| w.as_str() == "?").count(), 1);
    assert_eq!(written.iter().filter(|w| w.as_str() == "$G\n").count(), 1);

    // No second ? until the status report answers the first.
    machine.on_tick(t0 + Duration::from_millis(900));
    assert_eq!(
        recorder.written().iter().filter(|w| w.as_str() == "?").count(),
        1
    );

    machine.on_line("<Idle|MPos:0.000,0.000,0.000>", t0 + Duration::from_millis(950));
    machine.on_tick(t0 + Duration::from_millis(1200));
    assert_eq!(
        recorder.written().iter().filter(|w| w.as_str() == "?").count(),
        2
    );
    // $G still awaits its response; it is not re-sent.
    assert_eq!(
        recorder
            .written()
            .iter()
            .filter(|w| w.as_str() == "$G\n")
            .count(),
        1
    );
}

#[test]
fn unload_round_trip_clears_sender() {
    let (mut machine, _recorder) = machine();
    let (_client, mut rx) = attach(&mut machine);
    let t0 = Instant::now();

    machine
        .on_command(
            None,
            ControllerCommand::Load {
                name: "job".to_string(),
                gcode: "G0 X1".to_string(),
            },
            t0,
        )
        .unwrap();
    machine
        .on_command(None, ControllerCommand::Unload, t0)
        .unwrap();
    machine.on_tick(t0);

    let events = drain(&mut rx);
    let status = events
        .iter()
        .rev()
        .find_map(|event| match event {
            ClientEvent::SenderStatus(status) => Some(status.clone()),
            _ => None,
        })
        .expect("sender status published");
    assert_eq!(status.total, 0);
}

#[test]
fn empty_load_fails_without_state_change() {
    let (mut machine, _recorder) = machine();
    let t0 = Instant::now();

    let result = machine.on_command(
        None,
        ControllerCommand::Load {
            name: "empty".to_string(),
            gcode: "  \n ".to_string(),
        },
        t0,
    );
    assert!(result.is_err());
    assert_eq!(machine.workflow(), WorkflowState::Idle);
}

#[test]
fn feeder_paces_adhoc_lines_one_at_a_time() {
    let (mut machine, recorder) = machine();
    let t0 = Instant::now();

    machine
        .on_command(
            None,
            ControllerCommand::Gcode {
                line: "G0 X1".to_string(),
            },
            t0,
        )
        .unwrap();
    machine
        .on_command(
            None,
            ControllerCommand::Gcode {
                line: "G0 X2".to_string(),
            },
            t0,
        )
        .unwrap();
    assert_eq!(recorder.written(), vec!["G0 X1\n"]);

    machine.on_line("ok", t0);
    assert_eq!(recorder.written(), vec!["G0 X1\n", "G0 X2\n"]);
}

#[test]
fn close_is_idempotent() {
    let (mut machine, recorder) = machine();
    let (_client, mut rx) = attach(&mut machine);
    let t0 = Instant::now();

    machine.close();
    assert!(machine.is_closed());
    assert!(!recorder.is_open());
    machine.close();

    let closes = drain(&mut rx)
        .iter()
        .filter(|event| matches!(event, ClientEvent::SerialClose { .. }))
        .count();
    assert_eq!(closes, 1);

    let result = machine.on_command(None, ControllerCommand::Start, t0);
    assert!(result.is_err());
}

#[test]
fn unsupported_command_is_rejected() {
    let (mut machine, recorder) = machine();
    let t0 = Instant::now();

    let result = machine.on_command(None, ControllerCommand::QueueFlush, t0);
    assert!(result.is_err());
    assert!(recorder.written().is_empty());
}
