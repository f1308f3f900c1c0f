//! Controller driver.
//!
//! Each controller runs as a single tokio task: a cooperative loop that
//! drains client inputs, drains serial events, then ticks the state machine.
//! All protocol state lives inside the [`FirmwareEngine`]; everything here is
//! plumbing. [`ControllerHandle`] is the cloneable facade clients hold.

use crate::firmware::{FirmwareEngine, GrblMachine, Tinyg2Machine};
use crate::registry::ControllerRegistry;
use crate::transport::{SerialTransport, Transport, TransportEvent};
use cnclink_core::{
    ClientEvent, ClientHandle, ControllerCommand, ControllerError, ControllerOptions, Error,
    FirmwareTag, MacroConfig, Result,
};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;

/// Delay between loop iterations when idle
const LOOP_DELAY: Duration = Duration::from_millis(10);

enum ControllerInput {
    Open,
    Command {
        client: Option<ClientHandle>,
        command: ControllerCommand,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    Write {
        client: ClientHandle,
        data: String,
    },
    AddConnection {
        handle: ClientHandle,
        tx: UnboundedSender<ClientEvent>,
    },
    RemoveConnection {
        handle: ClientHandle,
    },
    Close,
}

/// Cloneable facade over a running controller task.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    port: String,
    tx: UnboundedSender<ControllerInput>,
}

impl ControllerHandle {
    /// Port this controller is bound to
    pub fn port(&self) -> &str {
        &self.port
    }

    fn send(&self, input: ControllerInput) -> Result<()> {
        self.tx
            .send(input)
            .map_err(|_| Error::from(ControllerError::Closed))
    }

    /// Kick off initialization. Call after the initial connections are
    /// attached so they observe `serialport:open`.
    pub fn open(&self) -> Result<()> {
        self.send(ControllerInput::Open)
    }

    /// Issue a command and await its result
    pub async fn command(
        &self,
        client: Option<ClientHandle>,
        command: ControllerCommand,
    ) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(ControllerInput::Command {
            client,
            command,
            reply: Some(reply_tx),
        })?;
        reply_rx
            .await
            .map_err(|_| Error::from(ControllerError::Closed))?
    }

    /// Issue a command without waiting for its result
    pub fn command_detached(
        &self,
        client: Option<ClientHandle>,
        command: ControllerCommand,
    ) -> Result<()> {
        self.send(ControllerInput::Command {
            client,
            command,
            reply: None,
        })
    }

    /// Write raw data on behalf of a client (echo-correlated)
    pub fn write(&self, client: ClientHandle, data: impl Into<String>) -> Result<()> {
        self.send(ControllerInput::Write {
            client,
            data: data.into(),
        })
    }

    /// Subscribe a new client; returns its handle and event stream
    pub fn add_connection(&self) -> Result<(ClientHandle, UnboundedReceiver<ClientEvent>)> {
        let handle = ClientHandle::new();
        let (tx, rx) = unbounded_channel();
        self.send(ControllerInput::AddConnection { handle, tx })?;
        Ok((handle, rx))
    }

    /// Unsubscribe a client
    pub fn remove_connection(&self, handle: ClientHandle) -> Result<()> {
        self.send(ControllerInput::RemoveConnection { handle })
    }

    /// Tear the controller down
    pub fn close(&self) -> Result<()> {
        self.send(ControllerInput::Close)
    }
}

/// Spawn the driver task for an engine and register its handle.
pub fn spawn_controller(
    mut engine: Box<dyn FirmwareEngine>,
    mut transport_rx: UnboundedReceiver<TransportEvent>,
    registry: &ControllerRegistry,
) -> ControllerHandle {
    let (tx, mut rx) = unbounded_channel();
    let port = engine.port().to_string();
    let handle = ControllerHandle {
        port: port.clone(),
        tx,
    };
    registry.register(handle.clone());
    let registry = registry.clone();

    tokio::spawn(async move {
        loop {
            while let Ok(input) = rx.try_recv() {
                let now = Instant::now();
                match input {
                    ControllerInput::Open => engine.on_open(now),
                    ControllerInput::Command {
                        client,
                        command,
                        reply,
                    } => {
                        let name = command.name();
                        let result = engine.on_command(client, command, now);
                        match reply {
                            Some(reply) => {
                                let _ = reply.send(result);
                            }
                            None => {
                                if let Err(e) = result {
                                    tracing::error!("Command {} failed: {}", name, e);
                                }
                            }
                        }
                    }
                    ControllerInput::Write { client, data } => {
                        engine.write_from_client(client, &data)
                    }
                    ControllerInput::AddConnection { handle, tx } => {
                        engine.add_connection(handle, tx)
                    }
                    ControllerInput::RemoveConnection { handle } => {
                        engine.remove_connection(&handle)
                    }
                    ControllerInput::Close => engine.close(),
                }
            }

            while let Ok(event) = transport_rx.try_recv() {
                let now = Instant::now();
                match event {
                    TransportEvent::Line(line) => engine.on_line(&line, now),
                    TransportEvent::Error(message) => engine.on_transport_error(&message),
                    TransportEvent::Disconnected => {
                        tracing::warn!("Serial disconnect on {}", engine.port());
                        engine.close();
                    }
                }
            }

            engine.on_tick(Instant::now());

            if engine.is_closed() {
                registry.unregister(&port);
                break;
            }
            tokio::time::sleep(LOOP_DELAY).await;
        }
    });

    handle
}

/// Open a serial port and spawn the matching controller for `firmware`.
/// Smoothieware shares the Grbl controller; it is recognised at runtime.
pub fn open_controller(
    firmware: FirmwareTag,
    options: ControllerOptions,
    macros: MacroConfig,
    registry: &ControllerRegistry,
) -> Result<ControllerHandle> {
    let (transport, transport_rx) = SerialTransport::open(&options)?;
    let transport: Box<dyn Transport> = Box::new(transport);
    let engine: Box<dyn FirmwareEngine> = match firmware {
        FirmwareTag::Grbl | FirmwareTag::Smoothie => {
            Box::new(GrblMachine::new(options, transport, macros))
        }
        FirmwareTag::TinyG2 => Box::new(Tinyg2Machine::new(options, transport, macros)),
    };
    Ok(spawn_controller(engine, transport_rx, registry))
}
