//! Headless streaming client.
//!
//! Opens a controller on a serial port, prints every client event to the
//! console, optionally streams a G-code file to completion. Ctrl-C closes
//! the controller cleanly.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use cnclink::{
    init_logging, list_ports, open_controller, ClientEvent, ControllerCommand, ControllerOptions,
    ControllerRegistry, FirmwareTag, MacroConfig,
};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Firmware {
    Grbl,
    Tinyg2,
}

impl From<Firmware> for FirmwareTag {
    fn from(fw: Firmware) -> Self {
        match fw {
            Firmware::Grbl => FirmwareTag::Grbl,
            Firmware::Tinyg2 => FirmwareTag::TinyG2,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "G-code streaming controller for Grbl and TinyG2")]
struct Args {
    /// Serial port (e.g. /dev/ttyUSB0, COM3)
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate
    #[arg(short, long, default_value_t = 115200)]
    baud: u32,

    /// Firmware family on the port
    #[arg(short, long, value_enum, default_value_t = Firmware::Grbl)]
    firmware: Firmware,

    /// G-code file to stream; without it the client just monitors
    #[arg(long)]
    file: Option<PathBuf>,

    /// Macro store (JSON) for loadmacro support
    #[arg(long)]
    macros: Option<PathBuf>,

    /// List candidate serial ports and exit
    #[arg(long)]
    list: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;
    let args = Args::parse();

    if args.list {
        for info in list_ports().context("port enumeration failed")? {
            println!("{}\t{}", info.port_name, info.description);
        }
        return Ok(());
    }

    let Some(port) = args.port else {
        anyhow::bail!("--port is required (or use --list to enumerate)");
    };

    let macros = match &args.macros {
        Some(path) => MacroConfig::load_from_file(path)
            .with_context(|| format!("loading macro store {}", path.display()))?,
        None => MacroConfig::new(),
    };

    let registry = ControllerRegistry::new();
    let options = ControllerOptions::new(&port).with_baud_rate(args.baud);
    let controller = open_controller(args.firmware.into(), options, macros, &registry)
        .with_context(|| format!("opening {}", port))?;

    let (_client, mut events) = controller.add_connection()?;
    controller.open()?;

    if let Some(file) = &args.file {
        let gcode = std::fs::read_to_string(file)
            .with_context(|| format!("reading {}", file.display()))?;
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.display().to_string());
        controller
            .command(None, ControllerCommand::Load { name, gcode })
            .await
            .context("load failed")?;
        controller
            .command(None, ControllerCommand::Start)
            .await
            .context("start failed")?;
    }

    let streaming = args.file.is_some();
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                print_event(&event);
                if streaming {
                    if let ClientEvent::SenderStatus(status) = &event {
                        if status.total > 0 && status.received == status.total {
                            tracing::info!("Stream complete: {} lines", status.total);
                            break;
                        }
                    }
                }
                if matches!(event, ClientEvent::SerialClose { .. }) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, closing {}", port);
                break;
            }
        }
    }

    let _ = controller.close();
    Ok(())
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::SerialRead { line } => println!("< {}", line),
        ClientEvent::SerialWrite { data } => print!("> {}", data),
        ClientEvent::SenderStatus(status) if status.total > 0 => {
            println!("[{}] {}/{} lines", status.name, status.received, status.total);
        }
        ClientEvent::SenderStatus(_) | ClientEvent::FeederStatus(_) => {}
        other => println!(
            "{} {}",
            other.name(),
            serde_json::to_value(other)
                .map(|v| v["payload"].to_string())
                .unwrap_or_default()
        ),
    }
}
