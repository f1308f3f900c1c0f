//! Serial port transport.
//!
//! Opens a port 8-N-1 at the configured baud rate and runs a dedicated
//! reader thread that frames the byte stream into `\n`-terminated lines,
//! forwarding them to the controller's event loop over an unbounded channel.
//! Read timeouts are polling, not failures; any other read error emits
//! `TransportEvent::Error` followed by `Disconnected` and ends the thread.

use super::{Transport, TransportEvent};
use cnclink_core::{ControllerOptions, Error, Result, TransportError};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct SerialPortInfo {
    /// Port name (e.g. "/dev/ttyUSB0", "COM3")
    pub port_name: String,
    /// Port description (e.g. "USB Serial Port")
    pub description: String,
    /// Manufacturer name if available
    pub manufacturer: Option<String>,
    /// USB vendor/product IDs if applicable
    pub usb_ids: Option<(u16, u16)>,
}

/// List available serial ports, filtered to CNC controller patterns:
/// - Windows: COM*
/// - Linux: /dev/ttyUSB*, /dev/ttyACM*
/// - macOS: /dev/cu.usbserial-*, /dev/cu.usbmodem*
pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
    let ports = serialport::available_ports()
        .map_err(|e| Error::other(format!("Failed to enumerate ports: {}", e)))?;

    Ok(ports
        .iter()
        .filter(|p| is_cnc_port(&p.port_name))
        .map(|p| {
            let (description, manufacturer, usb_ids) = match &p.port_type {
                serialport::SerialPortType::UsbPort(usb) => (
                    format!(
                        "USB {} {}",
                        usb.manufacturer.as_deref().unwrap_or("Device"),
                        usb.product.as_deref().unwrap_or("Serial Port")
                    ),
                    usb.manufacturer.clone(),
                    Some((usb.vid, usb.pid)),
                ),
                serialport::SerialPortType::BluetoothPort => {
                    ("Bluetooth Serial".to_string(), None, None)
                }
                _ => ("Serial Port".to_string(), None, None),
            };
            SerialPortInfo {
                port_name: p.port_name.clone(),
                description,
                manufacturer,
                usb_ids,
            }
        })
        .collect())
}

fn is_cnc_port(port_name: &str) -> bool {
    if port_name.starts_with("COM") && port_name[3..].chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    if port_name.starts_with("/dev/ttyUSB") || port_name.starts_with("/dev/ttyACM") {
        return true;
    }
    if port_name.starts_with("/dev/cu.usbserial-") || port_name.starts_with("/dev/cu.usbmodem") {
        return true;
    }
    false
}

type SharedPort = Arc<Mutex<Box<dyn serialport::SerialPort>>>;

/// Write side of an open serial port.
///
/// The read side runs on its own thread (serialport reads are blocking) and
/// is torn down by `close` or by the port disappearing.
pub struct SerialTransport {
    port_name: String,
    port: SharedPort,
    open: Arc<AtomicBool>,
}

impl SerialTransport {
    /// Open a port per the controller options and start the reader thread.
    ///
    /// Returns the write side and the receiver the reader feeds.
    pub fn open(
        options: &ControllerOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let port = serialport::new(&options.port, options.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(50))
            .open()
            .map_err(|e| {
                tracing::warn!("Failed to open serial port {}: {}", options.port, e);
                TransportError::FailedToOpen {
                    port: options.port.clone(),
                    reason: e.to_string(),
                }
            })?;

        let reader = port
            .try_clone()
            .map_err(|e| TransportError::FailedToOpen {
                port: options.port.clone(),
                reason: format!("clone for reader failed: {}", e),
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        let transport = Self {
            port_name: options.port.clone(),
            port: Arc::new(Mutex::new(port)),
            open: open.clone(),
        };

        let port_name = options.port.clone();
        std::thread::Builder::new()
            .name(format!("serial-read {}", port_name))
            .spawn(move || read_loop(reader, tx, open, port_name))
            .map_err(|e| Error::other(format!("Failed to spawn reader thread: {}", e)))?;

        Ok((transport, rx))
    }

    /// Name of the underlying port
    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, data: &[u8]) -> Result<usize> {
        if !self.is_open() {
            return Err(TransportError::NotOpen.into());
        }
        let mut port = self
            .port
            .lock()
            .map_err(|e| Error::other(format!("Serial port lock poisoned: {}", e)))?;
        let n = port.write(data).map_err(|e| TransportError::Io {
            reason: e.to_string(),
        })?;
        port.flush().map_err(|e| TransportError::Io {
            reason: e.to_string(),
        })?;
        Ok(n)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&mut self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

fn read_loop(
    mut reader: Box<dyn serialport::SerialPort>,
    tx: mpsc::UnboundedSender<TransportEvent>,
    open: Arc<AtomicBool>,
    port_name: String,
) {
    let mut buf = [0u8; 512];
    let mut line = Vec::<u8>::new();

    while open.load(Ordering::SeqCst) {
        match reader.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                for &b in &buf[..n] {
                    match b {
                        b'\n' => {
                            let text = String::from_utf8_lossy(&line).trim_end().to_string();
                            line.clear();
                            if tx.send(TransportEvent::Line(text)).is_err() {
                                return;
                            }
                        }
                        b'\r' => {}
                        _ => line.push(b),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::error!("Serial read error on {}: {}", port_name, e);
                open.store(false, Ordering::SeqCst);
                let _ = tx.send(TransportEvent::Error(e.to_string()));
                let _ = tx.send(TransportEvent::Disconnected);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cnc_port_patterns() {
        assert!(is_cnc_port("COM3"));
        assert!(is_cnc_port("/dev/ttyUSB0"));
        assert!(is_cnc_port("/dev/ttyACM1"));
        assert!(is_cnc_port("/dev/cu.usbmodem14101"));
        assert!(!is_cnc_port("/dev/ttyS0"));
        assert!(!is_cnc_port("COMx"));
    }
}
